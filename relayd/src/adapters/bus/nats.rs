// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::watch;

use crate::app::errors::{AppResult, connection_error};
use crate::app::ports::{MessageBusPort, MessageHandler, Subscription};

/// `MessageBusPort` over a NATS core subscription.
#[derive(Clone)]
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    pub async fn connect(url: &str) -> AppResult<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|err| connection_error(format!("failed to connect to NATS at {url}: {err}")))?;
        tracing::info!("connected to NATS at {url}");
        Ok(Self { client })
    }
}

#[async_trait]
impl MessageBusPort for NatsBus {
    async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> AppResult<Subscription> {
        let mut subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|err| connection_error(format!("failed to subscribe to '{subject}': {err}")))?;
        tracing::info!("subscribed to '{subject}'");

        let (stop, mut stop_rx) = watch::channel(false);
        let subject = subject.to_string();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    next = subscriber.next() => {
                        let Some(message) = next else {
                            tracing::warn!("subscription to '{subject}' ended by the server");
                            break;
                        };
                        handler.on_message(message.subject.as_str(), &message.payload).await;
                    }
                }
            }
            if let Err(err) = subscriber.unsubscribe().await {
                tracing::debug!("unsubscribe from '{subject}' failed: {err}");
            }
        });
        Ok(Subscription::new(stop, task))
    }
}
