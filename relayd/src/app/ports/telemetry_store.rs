// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::{StoredTelemetryEvent, TelemetryEvent};

#[async_trait]
pub trait TelemetryStorePort: Send + Sync {
    /// Idempotent by `(job_id, sequence_number)`: returns false for a repeat.
    /// Fails with `NotFound` when the job no longer exists.
    async fn insert_telemetry_event(&self, job_id: i64, event: &TelemetryEvent)
    -> AppResult<bool>;
    async fn list_telemetry_events(&self, job_id: i64) -> AppResult<Vec<StoredTelemetryEvent>>;
}
