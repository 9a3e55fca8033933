// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hands cached batches back to their destination's delivery pool.
//!
//! A cycle looks at a bounded number of entries. An entry is re-submitted only while the
//! destination has a free worker, and it is deleted as soon as the pool has accepted it.
//! Entries that cannot be read are deleted, and entries for a destination that is no longer
//! configured are moved to the `orphaned` subdirectory. Replay pauses while the relay drains.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::Batch;
use crate::cache::OverflowCache;
use crate::registry::Registry;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub replayed: usize,
    pub deferred: usize,
    pub discarded: usize,
    pub orphaned: usize,
}

pub struct Replayer {
    cache: Arc<OverflowCache>,
    registry: Arc<Registry>,
    batch_size: usize,
    interval: Duration,
}

impl Replayer {
    pub fn new(
        cache: Arc<OverflowCache>,
        registry: Arc<Registry>,
        batch_size: usize,
        interval: Duration,
    ) -> Self {
        Self {
            cache,
            registry,
            batch_size,
            interval,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        loop {
            if !self.registry.drain().is_draining() {
                self.replay_once().await;
            }
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Replay loop stopped");
                    return;
                }
                () = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    pub async fn replay_once(&self) -> ReplayStats {
        let mut stats = ReplayStats::default();
        let entries = match self.cache.entries(self.batch_size).await {
            Ok(entries) => entries,
            Err(e) => {
                error!("Failed to list cache entries: {e}");
                return stats;
            }
        };

        for path in entries {
            let cached = match self.cache.load(&path).await {
                Ok(cached) => cached,
                Err(e) => {
                    error!("Discarding unreadable cache entry: {e}");
                    if let Err(e) = self.cache.remove(&path).await {
                        error!("{e}");
                    }
                    stats.discarded += 1;
                    continue;
                }
            };
            let Some(destination) = self.registry.destination(&cached.destination) else {
                match self.cache.set_aside(&path).await {
                    Ok(moved) => warn!(
                        "Cache entry for unknown destination {} moved to {}",
                        cached.destination,
                        moved.display()
                    ),
                    Err(e) => error!(
                        "Cache entry for unknown destination {} could not be set aside: {e}",
                        cached.destination
                    ),
                }
                stats.orphaned += 1;
                continue;
            };
            if !destination.pool().has_capacity() {
                stats.deferred += 1;
                continue;
            }

            match destination.pool().submit(Batch::from(cached)) {
                Ok(()) => {
                    destination.record_replayed();
                    stats.replayed += 1;
                    if let Err(e) = self.cache.remove(&path).await {
                        error!("Replayed entry could not be removed and may be sent again: {e}");
                    }
                }
                Err(_) => {
                    error!("Delivery pool for {} is gone", destination.url());
                    stats.deferred += 1;
                }
            }
        }

        if stats.replayed > 0 || stats.discarded > 0 || stats.orphaned > 0 {
            info!(
                "Replayed {} cached batches ({} deferred, {} discarded, {} orphaned)",
                stats.replayed, stats.deferred, stats.discarded, stats.orphaned
            );
        }
        stats
    }
}
