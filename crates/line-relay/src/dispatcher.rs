// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns a destination's queued write requests into batches.
//!
//! Every cycle takes what is queued at that moment, groups lines by query string and
//! credential, and hands a batch to the delivery pool as soon as it reaches the batch
//! size. Whatever is left is flushed at the end of the cycle, then the dispatcher sleeps
//! for the batch window. No line waits longer than one window plus one cycle.

use std::time::Duration;

use hashbrown::HashMap;
use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::batch::{Batch, BatchBuilder, BatchKey, WriteRequest};
use crate::pool::PoolHandle;

pub struct Dispatcher {
    destination: String,
    rx: Receiver<WriteRequest>,
    pool: PoolHandle,
    batch_size: usize,
    max_wait: Duration,
}

impl Dispatcher {
    pub fn new(
        destination: &str,
        rx: Receiver<WriteRequest>,
        pool: PoolHandle,
        batch_size: usize,
        max_wait: Duration,
    ) -> Self {
        Self {
            destination: destination.to_string(),
            rx,
            pool,
            batch_size,
            max_wait,
        }
    }

    /// Runs cycles until `cancel` fires, then runs one last cycle for whatever was queued.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            self.dispatch_once();
            tokio::select! {
                () = cancel.cancelled() => {
                    self.dispatch_once();
                    debug!("Dispatcher for {} stopped", self.destination);
                    return;
                }
                () = tokio::time::sleep(self.max_wait) => {}
            }
        }
    }

    /// One cycle. Returns the number of batches handed to the pool.
    pub fn dispatch_once(&mut self) -> usize {
        let depth = self.rx.len();
        if depth == 0 {
            return 0;
        }

        let mut builders: HashMap<BatchKey, BatchBuilder> = HashMap::new();
        let mut flushed = 0;
        for _ in 0..depth {
            let Ok(request) = self.rx.try_recv() else {
                break;
            };
            let key = request.key();
            let builder = builders.entry(key).or_insert_with_key(|key| {
                BatchBuilder::new(&self.destination, key.clone(), self.batch_size)
            });
            for line in request.lines {
                builder.push(line);
                if builder.len() >= self.batch_size {
                    flushed += submit(&self.pool, builder.take());
                }
            }
        }
        for builder in builders.values_mut() {
            if !builder.is_empty() {
                flushed += submit(&self.pool, builder.take());
            }
        }
        debug!(
            "Dispatched {depth} requests for {} into {flushed} batches",
            self.destination
        );
        flushed
    }
}

fn submit(pool: &PoolHandle, batch: Batch) -> usize {
    match pool.submit(batch) {
        Ok(()) => 1,
        Err(batch) => {
            error!(
                "Delivery pool for {} is gone, dropping {} lines",
                batch.destination,
                batch.len()
            );
            0
        }
    }
}
