// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::app::errors::AppResult;

#[async_trait]
/// Invoked once per delivery on the bus client's dispatch loop.
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, subject: &str, payload: &[u8]);
}

#[async_trait]
pub trait MessageBusPort: Send + Sync {
    async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> AppResult<Subscription>;
}

/// A running dispatch loop. Dropping it without `close` leaves the loop running.
pub struct Subscription {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn new(stop: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self { stop, task }
    }

    pub async fn close(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.task.await {
            tracing::warn!("subscription task ended abnormally: {err}");
        }
    }
}
