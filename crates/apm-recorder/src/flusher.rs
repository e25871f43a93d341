// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::errors::SinkError;
use crate::harvest::{HarvestAggregator, HarvestPayload};

/// Destination of harvested payloads.
#[async_trait]
pub trait HarvestSink {
    /// Delivers one payload. A [`SinkError::Retryable`] failure hands the
    /// payload back to the harvester for the next cycle.
    async fn send(&self, payload: &HarvestPayload) -> Result<(), SinkError>;
}

/// Periodically drains the [`HarvestAggregator`] into a [`HarvestSink`].
#[derive(Clone)]
pub struct Harvester {
    harvest: Arc<HarvestAggregator>,
    sink: Arc<dyn HarvestSink + Send + Sync>,
    interval: Duration,
}

impl Harvester {
    pub fn new(
        harvest: Arc<HarvestAggregator>,
        sink: Arc<dyn HarvestSink + Send + Sync>,
        interval: Duration,
    ) -> Self {
        Harvester {
            harvest,
            sink,
            interval,
        }
    }

    /// Sends the current aggregate.
    ///
    /// A payload from a previous failed attempt is retried first; if it fails
    /// again it is returned without touching the aggregate. Returns the
    /// payload that should be retried on the next call, if any.
    pub async fn flush(&self, failed: Option<HarvestPayload>) -> Option<HarvestPayload> {
        if let Some(payload) = failed {
            debug!(
                "Retrying harvest payload with {} errors and {} custom events",
                payload.error_events.len(),
                payload.custom_events.len()
            );
            if let Some(payload) = self.send(payload).await {
                return Some(payload);
            }
        }

        let payload = self.harvest.swap_and_flush();
        if payload.is_empty() {
            debug!("Nothing to harvest");
            return None;
        }
        self.send(payload).await
    }

    async fn send(&self, payload: HarvestPayload) -> Option<HarvestPayload> {
        match self.sink.send(&payload).await {
            Ok(()) => {
                debug!(
                    "Sent {} errors and {} custom events",
                    payload.error_events.len(),
                    payload.custom_events.len()
                );
                None
            }
            Err(e @ SinkError::Retryable(_)) => {
                error!("Failed to send harvest payload, will retry: {e}");
                Some(payload)
            }
            Err(e @ SinkError::Permanent(_)) => {
                error!("Failed to send harvest payload, dropping it: {e}");
                None
            }
        }
    }

    /// Flushes every interval until `cancel` fires, then flushes one last
    /// time.
    pub async fn run(self, cancel: CancellationToken) {
        let mut flush_interval = interval(self.interval);
        flush_interval.tick().await; // discard first tick
        let mut pending = None;

        loop {
            tokio::select! {
                _ = flush_interval.tick() => {
                    pending = self.flush(pending.take()).await;
                }
                () = cancel.cancelled() => {
                    info!("Harvester shutting down");
                    if self.flush(pending.take()).await.is_some() {
                        error!("Final harvest could not be delivered");
                    }
                    break;
                }
            }
        }
    }
}
