// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of one batch to its destination.
//!
//! A batch is posted to `{destination}/write?{query}` with the original `Authorization`
//! header. Any status below 500 is terminal: 4xx responses mean downstream refused the data
//! and retrying cannot help. 5xx responses and transport failures are retried after a fixed
//! delay until the attempts run out, then the batch is written to the overflow cache.
//! While the relay is draining, the first retryable failure goes straight to the cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use tracing::{debug, error, info, warn};

use crate::batch::{Batch, CachedBatch};
use crate::cache::OverflowCache;
use crate::registry::DrainFlag;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    pub delay: Duration,
}

/// Terminal state of one delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Downstream answered below 500.
    Delivered(StatusCode),
    /// The request could never be built (bad header value, bad URL). Not retried, not cached.
    Unsendable,
    /// Retries ran out and the batch is in the overflow cache under this key.
    Cached(String),
    /// Retries ran out and the batch could not be cached.
    Lost,
}

#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, batch: &Batch) -> Outcome;
}

enum Attempt {
    Done(StatusCode),
    Retry(String),
    Fatal(String),
}

pub struct HttpDelivery {
    client: reqwest::Client,
    retry: RetryPolicy,
    cache: Option<Arc<OverflowCache>>,
    drain: DrainFlag,
}

/// Builds the outbound client shared by every destination.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().timeout(timeout).build()
}

impl HttpDelivery {
    pub fn new(
        client: reqwest::Client,
        retry: RetryPolicy,
        cache: Option<Arc<OverflowCache>>,
        drain: DrainFlag,
    ) -> Self {
        HttpDelivery {
            client,
            retry,
            cache,
            drain,
        }
    }

    async fn send(&self, batch: &Batch, body: &str) -> Attempt {
        let mut request = self.client.post(batch.write_url()).body(body.to_string());
        if let Some(credential) = &batch.credential {
            request = request.header(AUTHORIZATION, credential);
        }
        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_server_error() {
                    let text = response.text().await.unwrap_or_default();
                    Attempt::Retry(format!("{status}: {text}"))
                } else {
                    Attempt::Done(status)
                }
            }
            Err(e) if e.is_builder() => Attempt::Fatal(e.to_string()),
            Err(e) => Attempt::Retry(e.to_string()),
        }
    }

    async fn spill(&self, batch: &Batch, attempts: u32) -> Outcome {
        let Some(cache) = &self.cache else {
            error!(
                "Dropping {} lines for {} after {attempts} attempts, cache is disabled",
                batch.len(),
                batch.destination
            );
            return Outcome::Lost;
        };
        match cache.store(&CachedBatch::from(batch)).await {
            Ok(key) => {
                info!("Added request to cache - {} ({key})", batch.write_url());
                Outcome::Cached(key)
            }
            Err(e) => {
                error!(
                    "Failed to cache {} lines for {}: {e}",
                    batch.len(),
                    batch.destination
                );
                Outcome::Lost
            }
        }
    }
}

#[async_trait]
impl Delivery for HttpDelivery {
    async fn deliver(&self, batch: &Batch) -> Outcome {
        let body = batch.body();
        let mut attempt = 0;
        while attempt < self.retry.attempts {
            attempt += 1;
            let time = Instant::now();
            match self.send(batch, &body).await {
                Attempt::Done(status) => {
                    if status.is_success() {
                        debug!(
                            "Delivered {} lines to {} in {} ms",
                            batch.len(),
                            batch.destination,
                            time.elapsed().as_millis()
                        );
                    } else {
                        warn!(
                            "{status}: {} refused {} lines, not retrying",
                            batch.destination,
                            batch.len()
                        );
                    }
                    return Outcome::Delivered(status);
                }
                Attempt::Fatal(reason) => {
                    error!("Unable to build request for {}: {reason}", batch.destination);
                    return Outcome::Unsendable;
                }
                Attempt::Retry(reason) => {
                    warn!(
                        "Failed to deliver to {} (attempt {attempt}/{}): {reason}",
                        batch.destination, self.retry.attempts
                    );
                    if self.drain.is_draining() && self.cache.is_some() {
                        break;
                    }
                    if attempt < self.retry.attempts {
                        tokio::time::sleep(self.retry.delay).await;
                    }
                }
            }
        }
        self.spill(batch, attempt).await
    }
}
