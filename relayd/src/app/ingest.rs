// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Telemetry ingestion.
//!
//! Messages arrive on the bus dispatch loop and are queued to a worker task,
//! which resolves the correlation id to a RemoteJob and stores the event.
//! No message, however broken, stops the subscription.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::app::errors::{AppErrorKind, AppResult, DIAGNOSTIC_EXCERPT_LIMIT, excerpt};
use crate::app::ports::{
    JobStorePort, MessageBusPort, MessageHandler, Subscription, TelemetryStorePort,
};
use crate::app::services::correlation::parse_correlation_id;
use crate::app::types::TelemetryEvent;

/// Bounded, TTL-limited memo of correlation id -> job id. Only successful
/// lookups are remembered.
pub struct CorrelationCache {
    capacity: usize,
    ttl: Duration,
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    generation: u64,
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<(String, u64)>,
}

struct CacheEntry {
    job_id: i64,
    inserted_at: Instant,
    generation: u64,
}

impl CorrelationCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn get(&self, correlation_id: &str) -> Option<i64> {
        let mut state = self.lock();
        let entry = state.entries.get(correlation_id)?;
        if entry.inserted_at.elapsed() >= self.ttl {
            state.entries.remove(correlation_id);
            return None;
        }
        Some(entry.job_id)
    }

    pub fn insert(&self, correlation_id: &str, job_id: i64) {
        let mut state = self.lock();
        state.generation += 1;
        let generation = state.generation;
        state.entries.insert(
            correlation_id.to_string(),
            CacheEntry {
                job_id,
                inserted_at: Instant::now(),
                generation,
            },
        );
        state
            .order
            .push_back((correlation_id.to_string(), generation));

        while state.entries.len() > self.capacity {
            let Some((key, generation)) = state.order.pop_front() else {
                break;
            };
            if state
                .entries
                .get(&key)
                .is_some_and(|entry| entry.generation == generation)
            {
                state.entries.remove(&key);
            }
        }
        // Drop stale order slots left behind by overwrites and invalidations.
        if state.order.len() > self.capacity.saturating_mul(2) {
            let CacheState { entries, order, .. } = &mut *state;
            order.retain(|(key, generation)| {
                entries
                    .get(key)
                    .is_some_and(|entry| entry.generation == *generation)
            });
        }
    }

    pub fn invalidate(&self, correlation_id: &str) {
        self.lock().entries.remove(correlation_id);
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored { job_id: i64, sequence_number: i64 },
    Duplicate { job_id: i64, sequence_number: i64 },
    /// No RemoteJob carries this correlation id.
    Unattributed,
    Malformed,
    /// The store failed; the event was not persisted.
    Failed,
}

pub struct TelemetryIngestor {
    jobs: Arc<dyn JobStorePort>,
    telemetry: Arc<dyn TelemetryStorePort>,
    cache: CorrelationCache,
}

impl TelemetryIngestor {
    pub fn new(
        jobs: Arc<dyn JobStorePort>,
        telemetry: Arc<dyn TelemetryStorePort>,
        cache: CorrelationCache,
    ) -> Self {
        Self {
            jobs,
            telemetry,
            cache,
        }
    }

    pub fn cache(&self) -> &CorrelationCache {
        &self.cache
    }

    /// Processes one raw message. Never fails; problems are logged and
    /// reported through the outcome.
    pub async fn handle_message(&self, payload: &[u8]) -> IngestOutcome {
        let event: TelemetryEvent = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(
                    "dropping undecodable telemetry message ({err}): {}",
                    raw_excerpt(payload)
                );
                return IngestOutcome::Malformed;
            }
        };
        if let Err(err) = parse_correlation_id(&event.correlation_id) {
            tracing::warn!("dropping telemetry message: {err}: {}", raw_excerpt(payload));
            return IngestOutcome::Malformed;
        }

        let job_id = match self.resolve(&event.correlation_id).await {
            Ok(Some(job_id)) => job_id,
            Ok(None) => {
                tracing::info!(
                    "dropping telemetry for unknown correlation id {} (seq {})",
                    event.correlation_id,
                    event.sequence_number
                );
                return IngestOutcome::Unattributed;
            }
            Err(err) => {
                tracing::warn!(
                    "correlation lookup failed for {}: {err}",
                    event.correlation_id
                );
                return IngestOutcome::Failed;
            }
        };

        match self.telemetry.insert_telemetry_event(job_id, &event).await {
            Ok(true) => IngestOutcome::Stored {
                job_id,
                sequence_number: event.sequence_number,
            },
            Ok(false) => {
                tracing::debug!(
                    "duplicate telemetry seq {} for job {job_id}",
                    event.sequence_number
                );
                IngestOutcome::Duplicate {
                    job_id,
                    sequence_number: event.sequence_number,
                }
            }
            Err(err) if err.kind() == AppErrorKind::NotFound => {
                self.cache.invalidate(&event.correlation_id);
                tracing::info!(
                    "job {job_id} for correlation id {} no longer exists; event dropped",
                    event.correlation_id
                );
                IngestOutcome::Unattributed
            }
            Err(err) => {
                tracing::warn!(
                    "failed to store telemetry seq {} for job {job_id}: {err}",
                    event.sequence_number
                );
                IngestOutcome::Failed
            }
        }
    }

    async fn resolve(&self, correlation_id: &str) -> AppResult<Option<i64>> {
        if let Some(job_id) = self.cache.get(correlation_id) {
            return Ok(Some(job_id));
        }
        let found = self
            .jobs
            .lookup_job_id_by_correlation_id(correlation_id)
            .await?;
        if let Some(job_id) = found {
            self.cache.insert(correlation_id, job_id);
        }
        Ok(found)
    }

    /// Subscribes to `subject` and starts the worker that drains the queue.
    pub async fn start(
        self: &Arc<Self>,
        bus: &dyn MessageBusPort,
        subject: &str,
        queue_depth: usize,
    ) -> AppResult<IngestPipeline> {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let worker = tokio::spawn(run_worker(Arc::clone(self), rx));
        let subscription = match bus.subscribe(subject, Arc::new(QueueingHandler { tx })).await {
            Ok(subscription) => subscription,
            Err(err) => {
                worker.abort();
                return Err(err);
            }
        };
        tracing::info!("telemetry ingestion listening on '{subject}'");
        Ok(IngestPipeline {
            subscription,
            worker,
        })
    }
}

/// Hands each delivery to the worker queue without waiting. A full queue
/// drops the message.
struct QueueingHandler {
    tx: mpsc::Sender<Vec<u8>>,
}

#[async_trait]
impl MessageHandler for QueueingHandler {
    async fn on_message(&self, subject: &str, payload: &[u8]) {
        match self.tx.try_send(payload.to_vec()) {
            Ok(()) => {}
            Err(TrySendError::Full(payload)) => tracing::warn!(
                "telemetry queue full; dropping message on '{subject}': {}",
                raw_excerpt(&payload)
            ),
            Err(TrySendError::Closed(_)) => {
                tracing::warn!("telemetry worker gone; dropping message on '{subject}'")
            }
        }
    }
}

async fn run_worker(ingestor: Arc<TelemetryIngestor>, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(payload) = rx.recv().await {
        let outcome = AssertUnwindSafe(ingestor.handle_message(&payload))
            .catch_unwind()
            .await;
        if outcome.is_err() {
            tracing::error!(
                "telemetry handler panicked on message: {}",
                raw_excerpt(&payload)
            );
        }
    }
}

fn raw_excerpt(payload: &[u8]) -> String {
    excerpt(&String::from_utf8_lossy(payload), DIAGNOSTIC_EXCERPT_LIMIT)
}

/// A live subscription plus its worker.
pub struct IngestPipeline {
    subscription: Subscription,
    worker: JoinHandle<()>,
}

impl IngestPipeline {
    /// Stops the subscription, then lets the worker drain what was queued.
    pub async fn shutdown(self) {
        self.subscription.close().await;
        if let Err(err) = self.worker.await {
            tracing::warn!("telemetry worker ended abnormally: {err}");
        }
    }
}
