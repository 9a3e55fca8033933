// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// One accepted `/write` call, addressed to one destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRequest {
    pub destination: String,
    pub credential: Option<String>,
    pub query: String,
    pub lines: Vec<String>,
}

/// Lines can only share a downstream call when they share its parameters.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct BatchKey {
    pub query: String,
    pub credential: Option<String>,
}

impl WriteRequest {
    pub fn key(&self) -> BatchKey {
        BatchKey {
            query: self.query.clone(),
            credential: self.credential.clone(),
        }
    }
}

/// A group of lines delivered in a single downstream write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    pub destination: String,
    pub credential: Option<String>,
    pub query: String,
    pub lines: Vec<String>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Request body for the downstream write.
    pub fn body(&self) -> String {
        self.lines.join("\n")
    }

    /// `{destination}/write?{query}`
    pub fn write_url(&self) -> String {
        if self.query.is_empty() {
            format!("{}/write", self.destination)
        } else {
            format!("{}/write?{}", self.destination, self.query)
        }
    }
}

/// Accumulates lines for one key until it is flushed.
#[derive(Debug)]
pub struct BatchBuilder {
    destination: String,
    key: BatchKey,
    lines: Vec<String>,
}

impl BatchBuilder {
    pub fn new(destination: &str, key: BatchKey, capacity: usize) -> Self {
        Self {
            destination: destination.to_string(),
            key,
            lines: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, line: String) {
        self.lines.push(line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Hands out the accumulated lines and leaves the builder empty for the same key.
    pub fn take(&mut self) -> Batch {
        Batch {
            destination: self.destination.clone(),
            credential: self.key.credential.clone(),
            query: self.key.query.clone(),
            lines: std::mem::take(&mut self.lines),
        }
    }
}

/// The on-disk form of a batch that could not be delivered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedBatch {
    pub destination: String,
    pub credential: Option<String>,
    pub query: String,
    pub body: String,
}

impl From<&Batch> for CachedBatch {
    fn from(batch: &Batch) -> Self {
        Self {
            destination: batch.destination.clone(),
            credential: batch.credential.clone(),
            query: batch.query.clone(),
            body: batch.body(),
        }
    }
}

impl From<CachedBatch> for Batch {
    fn from(cached: CachedBatch) -> Self {
        Self {
            destination: cached.destination,
            credential: cached.credential,
            query: cached.query,
            lines: cached.body.split('\n').map(str::to_string).collect(),
        }
    }
}
