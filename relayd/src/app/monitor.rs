// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Background reconciliation of RemoteJob status against the scheduler.
//!
//! One long-lived task reads every non-terminal job, asks the scheduler about
//! all of their handles in a single batch and writes forward-only status
//! transitions. A failing iteration is logged and the next one runs on
//! schedule. The stop signal is only observed between iterations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use time::format_description::well_known::Rfc3339;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::app::errors::AppResult;
use crate::app::ports::{BatchSchedulerPort, ClockPort, JobStorePort, RemoteShellPort};
use crate::app::services::slurm;
use crate::app::types::{JobStatus, RemoteJob, SchedulerSnapshot, StatusUpdate};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub updated: usize,
    /// Handles neither scheduler view reported.
    pub unknown: usize,
}

struct RunningLoop {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Reconciler {
    jobs: Arc<dyn JobStorePort>,
    scheduler: Arc<dyn BatchSchedulerPort>,
    shell: Arc<dyn RemoteShellPort>,
    clock: Arc<dyn ClockPort>,
}

pub struct JobMonitor {
    reconciler: Arc<Reconciler>,
    interval: Duration,
    running: Mutex<Option<RunningLoop>>,
}

impl JobMonitor {
    /// `shell` is the managed session owned by the monitor for its whole life.
    pub fn new(
        jobs: Arc<dyn JobStorePort>,
        scheduler: Arc<dyn BatchSchedulerPort>,
        shell: Arc<dyn RemoteShellPort>,
        clock: Arc<dyn ClockPort>,
        interval: Duration,
    ) -> Self {
        Self {
            reconciler: Arc::new(Reconciler {
                jobs,
                scheduler,
                shell,
                clock,
            }),
            interval,
            running: Mutex::new(None),
        }
    }

    /// Spawns the loop unless one is already running. Returns whether a new
    /// loop was started.
    pub async fn start(&self) -> bool {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref()
            && !current.task.is_finished()
        {
            tracing::debug!("job monitor already running");
            return false;
        }

        let (stop, stop_rx) = watch::channel(false);
        let reconciler = Arc::clone(&self.reconciler);
        let interval = self.interval;
        let task = tokio::spawn(async move {
            run_loop(reconciler, interval, stop_rx).await;
        });
        *running = Some(RunningLoop { stop, task });
        tracing::info!(
            "job monitor started, checking every {}s",
            self.interval.as_secs_f64()
        );
        true
    }

    /// Signals the loop and waits until the current iteration has finished.
    pub async fn stop(&self) {
        let Some(current) = self.running.lock().await.take() else {
            return;
        };
        let _ = current.stop.send(true);
        if let Err(err) = current.task.await {
            tracing::error!("job monitor task ended abnormally: {err}");
        }
        tracing::info!("job monitor stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|current| !current.task.is_finished())
    }

    /// Runs one reconciliation pass outside the background loop.
    pub async fn reconcile_once(&self) -> AppResult<ReconcileReport> {
        self.reconciler.reconcile_once().await
    }
}

async fn run_loop(
    reconciler: Arc<Reconciler>,
    interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        if *stop_rx.borrow() {
            break;
        }
        match reconciler.reconcile_once().await {
            Ok(report) if report.checked > 0 => tracing::debug!(
                "reconciled {} job(s): {} updated, {} unknown",
                report.checked,
                report.updated,
                report.unknown
            ),
            Ok(_) => {}
            Err(err) => tracing::warn!("job status check failed: {err}"),
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

impl Reconciler {
    async fn reconcile_once(&self) -> AppResult<ReconcileReport> {
        let jobs = self.jobs.list_non_terminal_jobs().await?;
        if jobs.is_empty() {
            return Ok(ReconcileReport::default());
        }

        let mut job_ids: Vec<i64> = jobs.iter().map(|job| job.handle.job_id).collect();
        job_ids.sort_unstable();
        job_ids.dedup();

        let snapshots: HashMap<i64, SchedulerSnapshot> = self
            .scheduler
            .query_status(self.shell.as_ref(), &job_ids)
            .await?
            .into_iter()
            .map(|snapshot| (snapshot.job_id, snapshot))
            .collect();

        let observed_at = self
            .clock
            .now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        let mut report = ReconcileReport {
            checked: jobs.len(),
            ..ReconcileReport::default()
        };
        for job in jobs {
            let Some(snapshot) = snapshots.get(&job.handle.job_id) else {
                tracing::debug!(
                    "no scheduler record yet for job {} (handle {})",
                    job.id,
                    job.handle.job_id
                );
                report.unknown += 1;
                continue;
            };
            let Some(update) = plan_update(&job, snapshot, &observed_at) else {
                continue;
            };
            match self.jobs.update_job_status(job.id, &update).await {
                Ok(true) => {
                    tracing::info!(
                        "job {} ({}) {} -> {}",
                        job.id,
                        job.handle.job_name,
                        job.status,
                        update.status
                    );
                    report.updated += 1;
                }
                Ok(false) => {
                    tracing::debug!("job {} changed concurrently; update skipped", job.id);
                }
                Err(err) => {
                    tracing::warn!("failed to update status for job {}: {err}", job.id);
                }
            }
        }
        Ok(report)
    }
}

/// The write implied by `snapshot`, if any. Unrecognised scheduler states and
/// backward transitions produce nothing. A terminal snapshot without an end
/// time is stamped with `observed_at`. A queued job's start time is only the
/// scheduler's estimate and is not recorded.
pub fn plan_update(
    job: &RemoteJob,
    snapshot: &SchedulerSnapshot,
    observed_at: &str,
) -> Option<StatusUpdate> {
    let Some(next) = slurm::map_slurm_state(&snapshot.state, snapshot.exit_code) else {
        tracing::debug!(
            "ignoring unrecognised scheduler state '{}' for job {}",
            snapshot.state,
            job.id
        );
        return None;
    };
    if !job.status.can_advance_to(next) {
        return None;
    }
    Some(StatusUpdate {
        status: next,
        start_time: if next == JobStatus::Queued {
            None
        } else {
            snapshot.start_time.clone()
        },
        end_time: if next.is_terminal() {
            Some(
                snapshot
                    .end_time
                    .clone()
                    .unwrap_or_else(|| observed_at.to_string()),
            )
        } else {
            None
        },
        error_message: (next == JobStatus::Failed)
            .then(|| slurm::failure_detail(&snapshot.state, snapshot.exit_code)),
    })
}
