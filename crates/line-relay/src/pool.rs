// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed pool of delivery workers for one destination.
//!
//! Batches handed to the pool wait in an unbounded channel and are picked up by exactly
//! `workers` tasks, so at most `workers` deliveries to the destination are ever in flight.
//! The dispatcher and the replay loop read [`PoolHandle::load`] to decide whether to hand
//! over more work.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::batch::Batch;
use crate::delivery::{Delivery, Outcome};

#[derive(Debug, Default)]
pub struct PoolStats {
    in_flight: AtomicUsize,
    pending: AtomicUsize,
    delivered: AtomicU64,
    cached: AtomicU64,
    lost: AtomicU64,
}

impl PoolStats {
    fn record(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Delivered(_) => &self.delivered,
            Outcome::Cached(_) => &self.cached,
            Outcome::Unsendable | Outcome::Lost => &self.lost,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn cached(&self) -> u64 {
        self.cached.load(Ordering::Relaxed)
    }

    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Debug)]
pub struct PoolHandle {
    tx: UnboundedSender<Batch>,
    stats: Arc<PoolStats>,
    workers: usize,
}

impl PoolHandle {
    pub(crate) fn channel(workers: usize) -> (Self, UnboundedReceiver<Batch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                stats: Arc::new(PoolStats::default()),
                workers,
            },
            rx,
        )
    }

    /// Hands a batch to the pool. The batch is returned when every worker is gone.
    pub fn submit(&self, batch: Batch) -> Result<(), Batch> {
        self.stats.pending.fetch_add(1, Ordering::SeqCst);
        self.tx.send(batch).map_err(|e| {
            self.stats.pending.fetch_sub(1, Ordering::SeqCst);
            e.0
        })
    }

    /// Deliveries currently running.
    pub fn in_flight(&self) -> usize {
        self.stats.in_flight.load(Ordering::SeqCst)
    }

    /// Batches waiting for a free worker.
    pub fn pending(&self) -> usize {
        self.stats.pending.load(Ordering::SeqCst)
    }

    pub fn load(&self) -> usize {
        self.in_flight() + self.pending()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// True while the pool could start another delivery right away.
    pub fn has_capacity(&self) -> bool {
        self.load() < self.workers
    }

    pub fn is_idle(&self) -> bool {
        self.load() == 0
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }
}

/// Starts `workers` delivery tasks for `destination`.
pub fn spawn(
    destination: &str,
    workers: usize,
    delivery: Arc<dyn Delivery>,
) -> (PoolHandle, Vec<JoinHandle<()>>) {
    let (handle, rx) = PoolHandle::channel(workers);
    let rx = Arc::new(Mutex::new(rx));
    let tasks = (0..workers)
        .map(|id| {
            tokio::spawn(run_worker(
                format!("{destination}#{id}"),
                Arc::clone(&rx),
                Arc::clone(&delivery),
                Arc::clone(&handle.stats),
            ))
        })
        .collect();
    (handle, tasks)
}

async fn run_worker(
    name: String,
    rx: Arc<Mutex<UnboundedReceiver<Batch>>>,
    delivery: Arc<dyn Delivery>,
    stats: Arc<PoolStats>,
) {
    loop {
        let batch = {
            let mut rx = rx.lock().await;
            match rx.recv().await {
                Some(batch) => batch,
                None => break,
            }
        };
        stats.in_flight.fetch_add(1, Ordering::SeqCst);
        stats.pending.fetch_sub(1, Ordering::SeqCst);

        let outcome = delivery.deliver(&batch).await;
        stats.record(&outcome);
        stats.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
    debug!("Delivery worker {name} stopped");
}
