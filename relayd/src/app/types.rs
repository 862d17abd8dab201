// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Closed set of workload kinds the control plane dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    ImageBuild,
    DatasetPrep,
    Simulation,
    Analysis,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::ImageBuild => "image_build",
            JobKind::DatasetPrep => "dataset_prep",
            JobKind::Simulation => "simulation",
            JobKind::Analysis => "analysis",
        }
    }

    /// Short prefix used in scheduler job names.
    pub fn name_prefix(self) -> &'static str {
        match self {
            JobKind::ImageBuild => "build",
            JobKind::DatasetPrep => "dataset",
            JobKind::Simulation => "sim",
            JobKind::Analysis => "analysis",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "image_build" => Ok(JobKind::ImageBuild),
            "dataset_prep" => Ok(JobKind::DatasetPrep),
            "simulation" => Ok(JobKind::Simulation),
            "analysis" => Ok(JobKind::Analysis),
            other => Err(format!("unknown job kind '{other}'")),
        }
    }
}

/// Lifecycle of a RemoteJob. Ordering follows the state machine;
/// `Completed` and `Failed` share the terminal rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Waiting,
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn rank(self) -> u8 {
        match self {
            JobStatus::Waiting => 0,
            JobStatus::Queued => 1,
            JobStatus::Running => 2,
            JobStatus::Completed | JobStatus::Failed => 3,
        }
    }

    /// True when moving from `self` to `next` respects the state machine.
    pub fn can_advance_to(self, next: JobStatus) -> bool {
        !self.is_terminal() && next != self && next.rank() >= self.rank()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "waiting" => Ok(JobStatus::Waiting),
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// The scheduler's own identifier for a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExternalJobHandle {
    pub job_id: i64,
    pub job_name: String,
}

/// Opaque id embedded in a submission script. Construct through
/// `services::correlation`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub(crate) fn from_raw(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteJob {
    pub id: i64,
    pub kind: JobKind,
    pub handle: ExternalJobHandle,
    pub correlation_id: CorrelationId,
    pub status: JobStatus,
    pub start_time: Option<String>, // RFC3339, UTC
    pub end_time: Option<String>,   // RFC3339, UTC
    pub error_message: Option<String>,
    pub created_at: String, // RFC3339
}

/// Payload for creating a RemoteJob. New records always start `Waiting`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRemoteJob {
    pub kind: JobKind,
    pub handle: ExternalJobHandle,
    pub correlation_id: CorrelationId,
}

/// A status write produced by the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    ActiveQueue,
    Accounting,
}

/// One scheduler row for a handle, after step rows were filtered out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub job_id: i64,
    pub job_name: String,
    /// Normalized scheduler state token, e.g. `RUNNING` or `CANCELLED`.
    pub state: String,
    /// RFC 3339 UTC. For a pending job this is the scheduler's estimate.
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub exit_code: Option<i32>,
    pub source: SnapshotSource,
}

/// Out-of-band message emitted by a remote worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    #[serde(alias = "correlationId")]
    pub correlation_id: String,
    #[serde(alias = "sequenceNumber")]
    pub sequence_number: i64,
    pub time: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A persisted telemetry row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTelemetryEvent {
    pub job_id: i64,
    pub sequence_number: i64,
    pub time: String,
    pub payload: serde_json::Value,
    pub received_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceRequest {
    pub cpus: u32,
    pub memory_gb: u32,
    /// Scheduler wall-time, e.g. `02:00:00`.
    pub time_limit: String,
    pub partition: Option<String>,
    pub qos: Option<String>,
    pub node_list: Option<String>,
}

/// Per-kind workload parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Workload {
    ImageBuild {
        repo_url: String,
        git_ref: String,
        image_name: String,
    },
    DatasetPrep {
        dataset_name: String,
        source_uri: String,
    },
    Simulation {
        image_name: String,
        config_path: String,
        output_dir: String,
    },
    Analysis {
        image_name: String,
        simulation_run: String,
        entrypoint: String,
    },
}

impl Workload {
    pub fn kind(&self) -> JobKind {
        match self {
            Workload::ImageBuild { .. } => JobKind::ImageBuild,
            Workload::DatasetPrep { .. } => JobKind::DatasetPrep,
            Workload::Simulation { .. } => JobKind::Simulation,
            Workload::Analysis { .. } => JobKind::Analysis,
        }
    }
}

/// Everything a caller supplies to dispatch one unit of remote work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub owner_id: String,
    pub resources: ResourceRequest,
    pub environment: BTreeMap<String, String>,
    pub workload: Workload,
}

impl JobSpec {
    pub fn kind(&self) -> JobKind {
        self.workload.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    pub host: String,
    pub addr: SocketAddr,
    pub username: String,
    pub identity_path: Option<String>,
    pub known_hosts_path: Option<String>,
    pub learn_unknown_hosts: bool,
    pub keepalive_secs: u64,
}

/// Cluster-side layout and scheduler CLI used for rendering and submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlurmSettings {
    pub partition: Option<String>,
    pub qos: Option<String>,
    pub node_list: Option<String>,
    pub log_base_path: String,
    pub submit_base_path: String,
    pub repo_base_path: String,
    pub image_base_path: String,
    pub dataset_base_path: String,
    pub experiment_base_path: String,
    pub sbatch_command: String,
    pub squeue_command: String,
    pub sacct_command: String,
}

impl Default for SlurmSettings {
    fn default() -> Self {
        Self {
            partition: None,
            qos: None,
            node_list: None,
            log_base_path: "relay/logs".to_string(),
            submit_base_path: "relay/submit".to_string(),
            repo_base_path: "relay/repos".to_string(),
            image_base_path: "relay/images".to_string(),
            dataset_base_path: "relay/datasets".to_string(),
            experiment_base_path: "relay/experiments".to_string(),
            sbatch_command: "sbatch".to_string(),
            squeue_command: "squeue".to_string(),
            sacct_command: "sacct".to_string(),
        }
    }
}
