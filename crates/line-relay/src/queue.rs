// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded per-destination queue of write requests.
//!
//! The ingestion side never waits: when the queue is full the newest request is dropped
//! and counted. The receiving half belongs to the destination's dispatcher.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tracing::warn;

use crate::batch::WriteRequest;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    Dropped,
}

#[derive(Debug)]
pub struct DestinationQueue {
    destination: String,
    tx: Sender<WriteRequest>,
    dropped: AtomicU64,
}

impl DestinationQueue {
    pub fn new(destination: &str, capacity: usize) -> (Self, Receiver<WriteRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                destination: destination.to_string(),
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn try_enqueue(&self, request: WriteRequest) -> Enqueue {
        match self.tx.try_send(request) {
            Ok(()) => Enqueue::Queued,
            Err(TrySendError::Full(request)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Queue for {} is full, dropping request with {} lines",
                    self.destination,
                    request.lines.len()
                );
                Enqueue::Dropped
            }
            Err(TrySendError::Closed(request)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Queue for {} is closed, dropping request with {} lines",
                    self.destination,
                    request.lines.len()
                );
                Enqueue::Dropped
            }
        }
    }

    /// Requests currently waiting for the dispatcher.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn request(line: &str) -> WriteRequest {
        WriteRequest {
            destination: "http://a".to_string(),
            credential: None,
            query: "db=test".to_string(),
            lines: vec![line.to_string()],
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_full_queue_drops_newest() {
        let (queue, mut rx) = DestinationQueue::new("http://a", 1);

        assert_eq!(queue.try_enqueue(request("first v=1")), Enqueue::Queued);
        assert_eq!(queue.try_enqueue(request("second v=1")), Enqueue::Dropped);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.len(), 1);
        assert!(logs_contain("Queue for http://a is full"));

        let kept = rx.try_recv().expect("first request is queued");
        assert_eq!(kept.lines, vec!["first v=1".to_string()]);
        assert!(rx.try_recv().is_err());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_closed_queue_counts_drops() {
        let (queue, rx) = DestinationQueue::new("http://a", 4);
        drop(rx);
        assert_eq!(queue.try_enqueue(request("x v=1")), Enqueue::Dropped);
        assert_eq!(queue.dropped(), 1);
    }

    #[tokio::test]
    async fn test_len_tracks_depth() {
        let (queue, mut rx) = DestinationQueue::new("http://a", 8);
        for i in 0..5 {
            queue.try_enqueue(request(&format!("m v={i}")));
        }
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.capacity(), 8);
        rx.try_recv().expect("queued");
        assert_eq!(queue.len(), 4);
    }
}
