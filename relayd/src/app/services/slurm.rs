// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use time::PrimitiveDateTime;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;

use crate::app::services::shell::sh_escape;
use crate::app::types::{JobStatus, SchedulerSnapshot, SnapshotSource};

/// Column layout requested from `squeue`: id, name, state, start time.
pub const SQUEUE_FORMAT: &str = "%i|%j|%T|%S";
/// Column layout requested from `sacct`.
pub const SACCT_FORMAT: &str = "jobid,jobname,state,start,end,exitcode";

const FIELD_DELIMITER: char = '|';

/// Query commands run under this environment so Slurm prints UTC times.
const UTC_ENV: &str = "TZ=UTC";

pub fn squeue_command(squeue: &str, job_ids: &[i64]) -> String {
    format!(
        "{UTC_ENV} {squeue} -u \"$USER\" --noheader --format={} -j {}",
        sh_escape(SQUEUE_FORMAT),
        join_ids(job_ids)
    )
}

pub fn sacct_command(sacct: &str, job_ids: &[i64]) -> String {
    format!(
        "{UTC_ENV} {sacct} -u \"$USER\" --parsable --delimiter={} --noheader --format={} -j {}",
        sh_escape("|"),
        SACCT_FORMAT,
        join_ids(job_ids)
    )
}

pub fn sbatch_command(sbatch: &str, remote_script: &str) -> String {
    format!("{sbatch} --parsable {}", sh_escape(remote_script))
}

fn join_ids(job_ids: &[i64]) -> String {
    job_ids
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Job id from `sbatch --parsable` output (`1001` or `1001;cluster`), falling
/// back to the human form `Submitted batch job 1001`.
pub fn parse_submitted_job_id(stdout: &str) -> Option<i64> {
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let head = line.split(';').next().unwrap_or(line).trim();
        if let Ok(id) = head.parse::<i64>() {
            return Some(id);
        }
        if let Some(id) = parse_job_id(line) {
            return Some(id);
        }
    }
    None
}

pub fn parse_job_id(line: &str) -> Option<i64> {
    let marker = "job ";
    let idx = line.find(marker)?;
    line[idx + marker.len()..].trim().parse::<i64>().ok()
}

/// `squeue -j` exits non-zero with this message once every requested id
/// has left the queue.
pub fn is_invalid_job_id(stderr: &str) -> bool {
    stderr.to_ascii_lowercase().contains("invalid job id")
}

pub fn parse_squeue_output(output: &str) -> Vec<SchedulerSnapshot> {
    output
        .lines()
        .filter_map(|line| {
            let fields = split_fields(line)?;
            let job_id = parse_top_level_id(fields.first()?)?;
            Some(SchedulerSnapshot {
                job_id,
                job_name: fields.get(1).map(|s| s.to_string()).unwrap_or_default(),
                state: normalize_slurm_state(fields.get(2)?),
                start_time: fields.get(3).and_then(|v| timestamp_field(v)),
                end_time: None,
                exit_code: None,
                source: SnapshotSource::ActiveQueue,
            })
        })
        .collect()
}

/// Parses `sacct --parsable` rows, dropping step rows such as `1001.batch`
/// and `1001.extern`.
pub fn parse_sacct_output(output: &str) -> Vec<SchedulerSnapshot> {
    output
        .lines()
        .filter_map(|line| {
            let fields = split_fields(line)?;
            let job_id = parse_top_level_id(fields.first()?)?;
            Some(SchedulerSnapshot {
                job_id,
                job_name: fields.get(1).map(|s| s.to_string()).unwrap_or_default(),
                state: normalize_slurm_state(fields.get(2)?),
                start_time: fields.get(3).and_then(|v| timestamp_field(v)),
                end_time: fields.get(4).and_then(|v| timestamp_field(v)),
                exit_code: fields.get(5).and_then(|v| parse_exit_code(v)),
                source: SnapshotSource::Accounting,
            })
        })
        .collect()
}

fn split_fields(line: &str) -> Option<Vec<&str>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    Some(line.split(FIELD_DELIMITER).map(str::trim).collect())
}

fn parse_top_level_id(raw: &str) -> Option<i64> {
    if raw.contains('.') {
        return None;
    }
    raw.parse::<i64>().ok()
}

/// Slurm's `2026-01-01T10:00:00` (UTC, see `UTC_ENV`) as RFC 3339.
/// Placeholders such as `Unknown` and `N/A` yield `None`.
fn timestamp_field(raw: &str) -> Option<String> {
    let format = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    PrimitiveDateTime::parse(raw, format)
        .ok()?
        .assume_utc()
        .format(&Rfc3339)
        .ok()
}

/// `sacct` reports `exit:signal`; only the exit part is kept.
fn parse_exit_code(raw: &str) -> Option<i32> {
    raw.split(':').next()?.trim().parse::<i32>().ok()
}

/// `CANCELLED by 1000` and `COMPLETED+` reduce to the bare state token.
pub fn normalize_slurm_state(state: &str) -> String {
    let token = state
        .split(|c: char| c == '+' || c == ':' || c == '(' || c.is_whitespace())
        .next()
        .unwrap_or(state)
        .trim();
    token.to_ascii_uppercase()
}

pub fn is_slurm_state_terminal(state: &str) -> bool {
    matches!(
        state,
        "COMPLETED"
            | "CANCELLED"
            | "FAILED"
            | "TIMEOUT"
            | "NODE_FAIL"
            | "PREEMPTED"
            | "BOOT_FAIL"
            | "OUT_OF_MEMORY"
            | "DEADLINE"
            | "SPECIAL_EXIT"
            | "REVOKED"
    )
}

/// Maps a normalized scheduler state onto the RemoteJob lifecycle.
/// Returns `None` for states this service does not recognise.
pub fn map_slurm_state(state: &str, exit_code: Option<i32>) -> Option<JobStatus> {
    match state {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED" | "RESIZING" => {
            Some(JobStatus::Queued)
        }
        "RUNNING" | "COMPLETING" | "SUSPENDED" | "STAGE_IN" | "STAGE_OUT" | "SIGNALING" => {
            Some(JobStatus::Running)
        }
        "COMPLETED" => match exit_code {
            Some(code) if code != 0 => Some(JobStatus::Failed),
            _ => Some(JobStatus::Completed),
        },
        s if is_slurm_state_terminal(s) => Some(JobStatus::Failed),
        _ => None,
    }
}

/// Error detail stored with a FAILED transition.
pub fn failure_detail(state: &str, exit_code: Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("{state} (exit code {code})"),
        None => state.to_string(),
    }
}
