// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;

use crate::limits::Limits;
use crate::pool::PoolHandle;
use crate::queue::DestinationQueue;

/// Set once when shutdown begins and never cleared.
#[derive(Clone, Debug, Default)]
pub struct DrainFlag(Arc<AtomicBool>);

impl DrainFlag {
    pub fn start(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A downstream write target: its queue and its delivery pool.
#[derive(Debug)]
pub struct Destination {
    url: String,
    queue: DestinationQueue,
    pool: PoolHandle,
    replayed: AtomicU64,
}

impl Destination {
    pub fn new(url: &str, queue: DestinationQueue, pool: PoolHandle) -> Self {
        Self {
            url: url.to_string(),
            queue,
            pool,
            replayed: AtomicU64::new(0),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn queue(&self) -> &DestinationQueue {
        &self.queue
    }

    pub fn pool(&self) -> &PoolHandle {
        &self.pool
    }

    pub fn record_replayed(&self) {
        self.replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn replayed(&self) -> u64 {
        self.replayed.load(Ordering::Relaxed)
    }

    /// Nothing queued, nothing waiting for a worker and nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.pool.is_idle()
    }
}

/// Everything the listeners and background loops share.
#[derive(Debug)]
pub struct Registry {
    destinations: Vec<Arc<Destination>>,
    index: HashMap<String, usize>,
    limits: Limits,
    drain: DrainFlag,
    max_pending: usize,
}

impl Registry {
    pub fn new(
        destinations: Vec<Destination>,
        limits: Limits,
        drain: DrainFlag,
        max_pending: usize,
    ) -> Self {
        let destinations: Vec<Arc<Destination>> =
            destinations.into_iter().map(Arc::new).collect();
        let index = destinations
            .iter()
            .enumerate()
            .map(|(i, destination)| (destination.url.clone(), i))
            .collect();
        Self {
            destinations,
            index,
            limits,
            drain,
            max_pending,
        }
    }

    pub fn destination(&self, url: &str) -> Option<&Arc<Destination>> {
        self.index.get(url).map(|&i| &self.destinations[i])
    }

    pub fn destinations(&self) -> &[Arc<Destination>] {
        &self.destinations
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn drain(&self) -> &DrainFlag {
        &self.drain
    }

    pub fn is_idle(&self) -> bool {
        self.destinations.iter().all(|d| d.is_idle())
    }

    /// True when some destination has more batches waiting for a worker than allowed.
    pub fn backlog_exceeded(&self) -> bool {
        self.destinations
            .iter()
            .any(|d| d.pool.pending() > self.max_pending)
    }
}
