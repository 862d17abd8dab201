// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Hand-written port fakes shared by the unit tests.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Notify;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{
    BatchSchedulerPort, ClockPort, ExecCapture, JobStorePort, RemoteShellPort, RenderedScript,
    TelemetryStorePort,
};
use crate::app::types::{
    CorrelationId, ExternalJobHandle, JobKind, JobSpec, JobStatus, NewRemoteJob, RemoteJob,
    SchedulerSnapshot, SnapshotSource, StatusUpdate, StoredTelemetryEvent, TelemetryEvent,
};

/// Always reports 2026-01-01T12:00:00Z.
#[derive(Default)]
pub struct FixedClock;

impl FixedClock {
    pub const RFC3339: &'static str = "2026-01-01T12:00:00Z";
}

impl ClockPort for FixedClock {
    fn now_utc(&self) -> OffsetDateTime {
        time::macros::datetime!(2026-01-01 12:00:00 UTC)
    }
}

pub fn new_job(kind: JobKind, scheduler_id: i64, correlation_id: &str) -> NewRemoteJob {
    NewRemoteJob {
        kind,
        handle: ExternalJobHandle {
            job_id: scheduler_id,
            job_name: format!("{}-test-{scheduler_id}", kind.name_prefix()),
        },
        correlation_id: CorrelationId::from_raw(correlation_id.to_string()),
    }
}

pub fn remote_job(id: i64, job: NewRemoteJob) -> RemoteJob {
    RemoteJob {
        id,
        kind: job.kind,
        handle: job.handle,
        correlation_id: job.correlation_id,
        status: JobStatus::Waiting,
        start_time: None,
        end_time: None,
        error_message: None,
        created_at: "2026-01-01T00:00:00Z".to_string(),
    }
}

pub fn snapshot(job_id: i64, state: &str, source: SnapshotSource) -> SchedulerSnapshot {
    SchedulerSnapshot {
        job_id,
        job_name: format!("job-{job_id}"),
        state: state.to_string(),
        start_time: Some("2026-01-01T10:00:00Z".to_string()),
        end_time: None,
        exit_code: None,
        source,
    }
}

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    jobs: BTreeMap<i64, RemoteJob>,
    events: BTreeMap<(i64, i64), StoredTelemetryEvent>,
}

/// In-memory job + telemetry store with the same guards as the SQLite one.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    pub lookups: AtomicUsize,
    pub fail_job_inserts: AtomicBool,
}

impl MemoryStore {
    pub fn insert(&self, job: NewRemoteJob) -> i64 {
        let mut state = self.state.lock().expect("state");
        state.next_id += 1;
        let id = state.next_id;
        state.jobs.insert(id, remote_job(id, job));
        id
    }

    pub fn job(&self, id: i64) -> RemoteJob {
        self.state
            .lock()
            .expect("state")
            .jobs
            .get(&id)
            .cloned()
            .expect("job exists")
    }

    pub fn job_count(&self) -> usize {
        self.state.lock().expect("state").jobs.len()
    }

    pub fn event_count(&self) -> usize {
        self.state.lock().expect("state").events.len()
    }
}

#[async_trait]
impl JobStorePort for MemoryStore {
    async fn insert_job(&self, job: &NewRemoteJob) -> AppResult<i64> {
        if self.fail_job_inserts.load(Ordering::SeqCst) {
            return Err(AppError::with_message(
                AppErrorKind::Internal,
                codes::INTERNAL_ERROR,
                "database is locked",
            ));
        }
        Ok(self.insert(job.clone()))
    }

    async fn get_job(&self, id: i64) -> AppResult<Option<RemoteJob>> {
        Ok(self.state.lock().expect("state").jobs.get(&id).cloned())
    }

    async fn list_non_terminal_jobs(&self) -> AppResult<Vec<RemoteJob>> {
        Ok(self
            .state
            .lock()
            .expect("state")
            .jobs
            .values()
            .filter(|job| !job.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn update_job_status(&self, id: i64, update: &StatusUpdate) -> AppResult<bool> {
        let mut state = self.state.lock().expect("state");
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status.is_terminal() {
            return Ok(false);
        }
        job.status = update.status;
        job.start_time = job.start_time.take().or(update.start_time.clone());
        job.end_time = job.end_time.take().or(update.end_time.clone());
        if update.error_message.is_some() {
            job.error_message = update.error_message.clone();
        }
        Ok(true)
    }

    async fn lookup_job_id_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> AppResult<Option<i64>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .state
            .lock()
            .expect("state")
            .jobs
            .values()
            .find(|job| job.correlation_id.as_str() == correlation_id)
            .map(|job| job.id))
    }

    async fn delete_job(&self, id: i64) -> AppResult<bool> {
        let mut state = self.state.lock().expect("state");
        let removed = state.jobs.remove(&id).is_some();
        state.events.retain(|(job_id, _), _| *job_id != id);
        Ok(removed)
    }
}

#[async_trait]
impl TelemetryStorePort for MemoryStore {
    async fn insert_telemetry_event(
        &self,
        job_id: i64,
        event: &TelemetryEvent,
    ) -> AppResult<bool> {
        let mut state = self.state.lock().expect("state");
        if !state.jobs.contains_key(&job_id) {
            return Err(AppError::new(AppErrorKind::NotFound, codes::NOT_FOUND));
        }
        let key = (job_id, event.sequence_number);
        if state.events.contains_key(&key) {
            return Ok(false);
        }
        state.events.insert(
            key,
            StoredTelemetryEvent {
                job_id,
                sequence_number: event.sequence_number,
                time: event.time.clone(),
                payload: event.payload.clone(),
                received_at: "2026-01-01T00:00:00Z".to_string(),
            },
        );
        Ok(true)
    }

    async fn list_telemetry_events(&self, job_id: i64) -> AppResult<Vec<StoredTelemetryEvent>> {
        Ok(self
            .state
            .lock()
            .expect("state")
            .events
            .values()
            .filter(|event| event.job_id == job_id)
            .cloned()
            .collect())
    }
}

/// Holds every status query until the test releases it.
#[derive(Default)]
pub struct QueryGate {
    pub entered: Notify,
    pub release: Notify,
}

/// Scheduler fake: query results are consumed in order, an exhausted queue
/// answers with no snapshots.
#[derive(Default)]
pub struct ScriptedScheduler {
    query_results: Mutex<VecDeque<AppResult<Vec<SchedulerSnapshot>>>>,
    submit_result: Mutex<Option<AppResult<ExternalJobHandle>>>,
    pub rendered_ids: Mutex<Vec<String>>,
    pub submitted: Mutex<Vec<String>>,
    pub queries: AtomicUsize,
    pub gate: Option<QueryGate>,
}

impl ScriptedScheduler {
    pub fn with_queries(results: Vec<AppResult<Vec<SchedulerSnapshot>>>) -> Self {
        Self {
            query_results: Mutex::new(results.into()),
            ..Self::default()
        }
    }

    pub fn gated(results: Vec<AppResult<Vec<SchedulerSnapshot>>>) -> Self {
        Self {
            gate: Some(QueryGate::default()),
            ..Self::with_queries(results)
        }
    }

    pub fn with_submit(result: AppResult<ExternalJobHandle>) -> Self {
        Self {
            submit_result: Mutex::new(Some(result)),
            ..Self::default()
        }
    }
}

#[async_trait]
impl BatchSchedulerPort for ScriptedScheduler {
    fn render_submission_script(
        &self,
        spec: &JobSpec,
        correlation_id: &CorrelationId,
    ) -> AppResult<RenderedScript> {
        self.rendered_ids
            .lock()
            .expect("rendered")
            .push(correlation_id.to_string());
        let job_name = format!("{}-{}-abcdef", spec.kind().name_prefix(), spec.owner_id);
        Ok(RenderedScript {
            remote_path: format!("relay/submit/{job_name}.sbatch"),
            text: format!(
                "#!/bin/bash\n#SBATCH --job-name={job_name}\nexport HPC_CORRELATION_ID='{correlation_id}'\n"
            ),
            job_name,
        })
    }

    async fn submit(
        &self,
        shell: &dyn RemoteShellPort,
        local_script: &Path,
        remote_script: &str,
    ) -> AppResult<ExternalJobHandle> {
        assert!(local_script.exists(), "local script must exist during submit");
        shell.connect().await?;
        self.submitted
            .lock()
            .expect("submitted")
            .push(remote_script.to_string());
        self.submit_result
            .lock()
            .expect("submit")
            .take()
            .expect("submit should be called once")
    }

    async fn query_status(
        &self,
        _shell: &dyn RemoteShellPort,
        _job_ids: &[i64],
    ) -> AppResult<Vec<SchedulerSnapshot>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        self.query_results
            .lock()
            .expect("queries")
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn job_status(
        &self,
        _shell: &dyn RemoteShellPort,
        _job_id: i64,
    ) -> AppResult<SchedulerSnapshot> {
        panic!("job_status should not be called");
    }
}

/// Shell fake that tracks connection lifecycle and answers every command
/// with the configured capture.
#[derive(Default)]
pub struct RecordingShell {
    connected: AtomicBool,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub capture: Mutex<ExecCapture>,
    pub fail_connect: AtomicBool,
}

#[async_trait]
impl RemoteShellPort for RecordingShell {
    async fn connect(&self) -> AppResult<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(crate::app::errors::connection_error("connection refused"));
        }
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn exec_capture(&self, _command: &str) -> AppResult<ExecCapture> {
        Ok(self.capture.lock().expect("capture").clone())
    }

    async fn upload_file(&self, _local: &Path, _remote: &str) -> AppResult<()> {
        Ok(())
    }

    async fn download_file(&self, _remote: &str, _local: &Path) -> AppResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> AppResult<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
