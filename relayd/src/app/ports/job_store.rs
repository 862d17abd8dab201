// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::{NewRemoteJob, RemoteJob, StatusUpdate};

#[async_trait]
pub trait JobStorePort: Send + Sync {
    async fn insert_job(&self, job: &NewRemoteJob) -> AppResult<i64>;
    async fn get_job(&self, id: i64) -> AppResult<Option<RemoteJob>>;
    async fn list_non_terminal_jobs(&self) -> AppResult<Vec<RemoteJob>>;
    /// Returns false when the row is missing or already terminal.
    async fn update_job_status(&self, id: i64, update: &StatusUpdate) -> AppResult<bool>;
    async fn lookup_job_id_by_correlation_id(&self, correlation_id: &str)
    -> AppResult<Option<i64>>;
    async fn delete_job(&self, id: i64) -> AppResult<bool>;
}
