// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes, local_error};
use crate::app::ports::{BatchSchedulerPort, JobStorePort, ShellFactoryPort};
use crate::app::services::correlation::new_correlation_id;
use crate::app::session::with_scoped_session;
use crate::app::types::{CorrelationId, JobSpec, NewRemoteJob, RemoteJob};

const MINT_ATTEMPTS: usize = 3;

/// Turns a job spec into a tracked RemoteJob.
pub struct Dispatcher {
    jobs: Arc<dyn JobStorePort>,
    scheduler: Arc<dyn BatchSchedulerPort>,
    shells: Arc<dyn ShellFactoryPort>,
    version_tag: String,
}

impl Dispatcher {
    pub fn new(
        jobs: Arc<dyn JobStorePort>,
        scheduler: Arc<dyn BatchSchedulerPort>,
        shells: Arc<dyn ShellFactoryPort>,
        version_tag: impl Into<String>,
    ) -> Self {
        Self {
            jobs,
            scheduler,
            shells,
            version_tag: version_tag.into(),
        }
    }

    /// Mints a correlation id, renders and submits the script in a scoped
    /// session, then records the job as WAITING.
    ///
    /// The remote job exists before the local record does. If recording
    /// fails, the handle and correlation id are logged at error level so the
    /// orphan can be found on the cluster.
    pub async fn dispatch(&self, spec: &JobSpec) -> AppResult<RemoteJob> {
        let correlation_id = self.mint_correlation_id(&spec.owner_id).await?;
        let rendered = self
            .scheduler
            .render_submission_script(spec, &correlation_id)?;

        let mut script = tempfile::Builder::new()
            .prefix(&format!("{}-", rendered.job_name))
            .suffix(".sbatch")
            .tempfile()
            .map_err(|err| local_error(format!("failed to create script file: {err}")))?;
        script
            .write_all(rendered.text.as_bytes())
            .and_then(|_| script.flush())
            .map_err(|err| local_error(format!("failed to write script file: {err}")))?;

        let scheduler = Arc::clone(&self.scheduler);
        let local_path = script.path().to_path_buf();
        let remote_path = rendered.remote_path.clone();
        let handle = with_scoped_session(self.shells.as_ref(), "submit", |shell| async move {
            scheduler
                .submit(shell.as_ref(), &local_path, &remote_path)
                .await
        })
        .await?;

        let new_job = NewRemoteJob {
            kind: spec.kind(),
            handle: handle.clone(),
            correlation_id: correlation_id.clone(),
        };
        let id = match self.jobs.insert_job(&new_job).await {
            Ok(id) => id,
            Err(err) => {
                tracing::error!(
                    "scheduler job {} ({}) was submitted but not recorded; correlation id {} is untracked: {err}",
                    handle.job_id,
                    handle.job_name,
                    correlation_id
                );
                return Err(err.with_context(format!(
                    "submitted as scheduler job {} but not recorded",
                    handle.job_id
                )));
            }
        };
        tracing::info!(
            "dispatched {} job {id} as scheduler job {} ({correlation_id})",
            spec.kind(),
            handle.job_id
        );

        self.jobs.get_job(id).await?.ok_or_else(|| {
            AppError::with_message(
                AppErrorKind::NotFound,
                codes::NOT_FOUND,
                format!("job {id} vanished right after insert"),
            )
        })
    }

    pub async fn job(&self, id: i64) -> AppResult<Option<RemoteJob>> {
        self.jobs.get_job(id).await
    }

    /// Polls until the job is terminal. `Ok(None)` means the timeout expired
    /// and the outcome is not yet known.
    pub async fn wait_for_terminal(
        &self,
        id: i64,
        timeout: Duration,
        poll: Duration,
    ) -> AppResult<Option<RemoteJob>> {
        let deadline = Instant::now() + timeout;
        loop {
            let job = self.jobs.get_job(id).await?.ok_or_else(|| {
                AppError::with_message(
                    AppErrorKind::NotFound,
                    codes::NOT_FOUND,
                    format!("job {id} not found"),
                )
            })?;
            if job.status.is_terminal() {
                return Ok(Some(job));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    /// Administrative removal of a RemoteJob and its telemetry.
    pub async fn delete_job(&self, id: i64) -> AppResult<bool> {
        let removed = self.jobs.delete_job(id).await?;
        if removed {
            tracing::info!("deleted job {id}");
        }
        Ok(removed)
    }

    async fn mint_correlation_id(&self, owner_id: &str) -> AppResult<CorrelationId> {
        for _ in 0..MINT_ATTEMPTS {
            let id = new_correlation_id(owner_id, &self.version_tag)?;
            if self
                .jobs
                .lookup_job_id_by_correlation_id(id.as_str())
                .await?
                .is_none()
            {
                return Ok(id);
            }
            tracing::debug!("correlation id {id} already taken; minting another");
        }
        Err(AppError::with_message(
            AppErrorKind::StoreConflict,
            codes::STORE_CONFLICT,
            format!("could not mint an unused correlation id for owner {owner_id}"),
        ))
    }
}
