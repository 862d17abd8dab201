// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use async_trait::async_trait;

use crate::adapters::db::{JobStore, StoreError};
use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{JobStorePort, TelemetryStorePort};
use crate::app::types::{
    NewRemoteJob, RemoteJob, StatusUpdate, StoredTelemetryEvent, TelemetryEvent,
};

#[derive(Clone)]
pub struct SqliteStoreAdapter {
    store: Arc<JobStore>,
}

impl SqliteStoreAdapter {
    pub fn new(store: JobStore) -> Self {
        Self {
            store: Arc::new(store),
        }
    }
}

/// Translates persistence errors into app-level errors so no sqlx type
/// crosses the port boundary.
fn map_store_error(err: StoreError) -> AppError {
    match err {
        StoreError::DuplicateCorrelationId(id) => AppError::with_message(
            AppErrorKind::StoreConflict,
            codes::STORE_CONFLICT,
            format!("correlation id '{id}' is already recorded"),
        ),
        StoreError::DuplicateSchedulerId(id) => AppError::with_message(
            AppErrorKind::StoreConflict,
            codes::STORE_CONFLICT,
            format!("scheduler job {id} is already recorded"),
        ),
        StoreError::JobNotFound(id) => AppError::with_message(
            AppErrorKind::NotFound,
            codes::NOT_FOUND,
            format!("job {id} not found"),
        ),
        StoreError::CorruptRow { table, detail } => AppError::with_message(
            AppErrorKind::Internal,
            codes::INTERNAL_ERROR,
            format!("corrupt row in {table}: {detail}"),
        ),
        StoreError::Serde(err) => AppError::with_message(
            AppErrorKind::Internal,
            codes::INTERNAL_ERROR,
            format!("serialization error: {err}"),
        ),
        StoreError::Sqlx(err) => {
            tracing::debug!("database error: {err}");
            AppError::new(AppErrorKind::Internal, codes::INTERNAL_ERROR)
        }
    }
}

#[async_trait]
impl JobStorePort for SqliteStoreAdapter {
    async fn insert_job(&self, job: &NewRemoteJob) -> AppResult<i64> {
        self.store.insert_job(job).await.map_err(map_store_error)
    }

    async fn get_job(&self, id: i64) -> AppResult<Option<RemoteJob>> {
        self.store.get_job(id).await.map_err(map_store_error)
    }

    async fn list_non_terminal_jobs(&self) -> AppResult<Vec<RemoteJob>> {
        self.store
            .list_non_terminal_jobs()
            .await
            .map_err(map_store_error)
    }

    async fn update_job_status(&self, id: i64, update: &StatusUpdate) -> AppResult<bool> {
        self.store
            .update_job_status(id, update)
            .await
            .map_err(map_store_error)
    }

    async fn lookup_job_id_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> AppResult<Option<i64>> {
        self.store
            .lookup_job_id_by_correlation_id(correlation_id)
            .await
            .map_err(map_store_error)
    }

    async fn delete_job(&self, id: i64) -> AppResult<bool> {
        self.store.delete_job(id).await.map_err(map_store_error)
    }
}

#[async_trait]
impl TelemetryStorePort for SqliteStoreAdapter {
    async fn insert_telemetry_event(
        &self,
        job_id: i64,
        event: &TelemetryEvent,
    ) -> AppResult<bool> {
        self.store
            .insert_telemetry_event(job_id, event)
            .await
            .map_err(map_store_error)
    }

    async fn list_telemetry_events(&self, job_id: i64) -> AppResult<Vec<StoredTelemetryEvent>> {
        self.store
            .list_telemetry_events(job_id)
            .await
            .map_err(map_store_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::types::{CorrelationId, ExternalJobHandle, JobKind};

    #[tokio::test]
    async fn errors_map_to_app_kinds() {
        let adapter = SqliteStoreAdapter::new(JobStore::open_memory().await.unwrap());
        let job = NewRemoteJob {
            kind: JobKind::Analysis,
            handle: ExternalJobHandle {
                job_id: 3,
                job_name: "analysis-1-a".into(),
            },
            correlation_id: CorrelationId::from_raw("1:v1:aaaaaa".into()),
        };
        adapter.insert_job(&job).await.unwrap();
        let err = adapter.insert_job(&job).await.unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::StoreConflict);

        let reused_handle = NewRemoteJob {
            correlation_id: CorrelationId::from_raw("2:v1:bbbbbb".into()),
            ..job.clone()
        };
        let err = adapter.insert_job(&reused_handle).await.unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::StoreConflict);
        assert!(err.message().contains("scheduler job 3"));

        let event = TelemetryEvent {
            correlation_id: "9:v1:zzzzzz".into(),
            sequence_number: 1,
            time: "2026-01-01T00:00:00Z".into(),
            payload: serde_json::Value::Null,
        };
        let err = adapter.insert_telemetry_event(404, &event).await.unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::NotFound);
    }
}
