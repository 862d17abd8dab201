// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::Path;

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::ports::RemoteShellPort;
use crate::app::types::{CorrelationId, ExternalJobHandle, JobSpec, SchedulerSnapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedScript {
    pub job_name: String,
    /// Where the script is uploaded on the cluster.
    pub remote_path: String,
    pub text: String,
}

#[async_trait]
/// Batch scheduler boundary. Remote calls go through the session the caller
/// supplies, so the same adapter serves managed and scoped sessions.
pub trait BatchSchedulerPort: Send + Sync {
    fn render_submission_script(
        &self,
        spec: &JobSpec,
        correlation_id: &CorrelationId,
    ) -> AppResult<RenderedScript>;

    async fn submit(
        &self,
        shell: &dyn RemoteShellPort,
        local_script: &Path,
        remote_script: &str,
    ) -> AppResult<ExternalJobHandle>;

    /// Snapshots for the handles either view knows about. Missing handles are
    /// simply absent from the result.
    async fn query_status(
        &self,
        shell: &dyn RemoteShellPort,
        job_ids: &[i64],
    ) -> AppResult<Vec<SchedulerSnapshot>>;

    /// Status of one handle; `UnknownJob` when neither view knows it.
    async fn job_status(
        &self,
        shell: &dyn RemoteShellPort,
        job_id: i64,
    ) -> AppResult<SchedulerSnapshot>;
}
