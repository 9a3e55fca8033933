// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Admission limits for incoming lines.
//!
//! Each limit matches lines with a regular expression and rewrites a matching line into a
//! tag (for instance `measurement:host`). Tags are counted per limit, and a limit with a
//! ceiling rejects lines whose tag was already seen more than `limit` times since the last
//! reset. Counters are reset by the monitor on every collection, so the collection interval
//! is the rate window.
//!
//! ```toml
//! [limits.per_host]
//! regexp = '^(\w+),.*host=([^,\s]+).*'
//! replace = "$1:$2"
//! limit = 100000
//! unmatched = "pass"
//! ```

use std::collections::BTreeMap;

use dashmap::DashMap;
use regex::Regex;
use serde::Deserialize;

use crate::config::LimitConfig;
use crate::errors::ConfigError;

/// What a limit does with a line its pattern does not match.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedPolicy {
    /// Skip this limit for the line.
    #[default]
    Pass,
    /// Reject the line as malformed for this relay.
    Reject,
    /// Reject the line as if it had exceeded the limit.
    Exceed,
}

/// A tag derived from a line by one limit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    pub limit: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    /// The line did not match a limit whose policy requires a match.
    Unmatched { limit: String },
    /// The line's tag is over the limit's ceiling, or it did not match a limit whose
    /// unmatched policy is [`UnmatchedPolicy::Exceed`] (then `tag` is `None`).
    VolumeExceeded { limit: String, tag: Option<String> },
}

impl Rejection {
    pub fn is_volume_exceeded(&self) -> bool {
        matches!(self, Rejection::VolumeExceeded { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// No limit matched the line.
    Accept,
    /// At least one limit matched and counted the line.
    Tagged(Vec<Tag>),
    Reject(Rejection),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Verdict::Reject(_))
    }
}

/// Observation counts per tag.
///
/// A snapshot drains the map shard by shard under the shard's write lock, so an increment
/// racing the reset lands either in the snapshot or in the next window.
#[derive(Debug, Default)]
pub struct TagCounter {
    counts: DashMap<String, u64>,
}

impl TagCounter {
    /// Counts one observation of `tag` and returns false when the count before this
    /// observation was already above `ceiling`. Rejected observations are not counted.
    pub fn observe(&self, tag: String, ceiling: u64) -> bool {
        let mut count = self.counts.entry(tag).or_insert(0);
        if ceiling > 0 && *count > ceiling {
            return false;
        }
        *count += 1;
        true
    }

    pub fn get(&self, tag: &str) -> Option<u64> {
        self.counts.get(tag).map(|count| *count)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Returns every count and zeroes the table.
    pub fn snapshot_and_reset(&self) -> Vec<(String, u64)> {
        let mut snapshot = Vec::with_capacity(self.counts.len());
        self.counts.retain(|tag, count| {
            snapshot.push((tag.clone(), *count));
            false
        });
        snapshot
    }
}

#[derive(Debug)]
pub struct LimitRule {
    name: String,
    pattern: Regex,
    replace: String,
    ceiling: u64,
    unmatched: UnmatchedPolicy,
    counter: TagCounter,
}

impl LimitRule {
    pub fn new(
        name: &str,
        pattern: &str,
        replace: &str,
        ceiling: u64,
        unmatched: UnmatchedPolicy,
    ) -> Result<Self, ConfigError> {
        let pattern = Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
            name: name.to_string(),
            source,
        })?;
        Ok(Self {
            name: name.to_string(),
            pattern,
            replace: replace.to_string(),
            ceiling,
            unmatched,
            counter: TagCounter::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn counter(&self) -> &TagCounter {
        &self.counter
    }

    /// Rewrites a matching line into its tag.
    pub fn tag(&self, line: &str) -> Option<String> {
        if !self.pattern.is_match(line) {
            return None;
        }
        Some(
            self.pattern
                .replace_all(line, self.replace.as_str())
                .into_owned(),
        )
    }
}

/// The admission filter: every enabled limit, evaluated in name order.
#[derive(Debug, Default)]
pub struct Limits {
    rules: Vec<LimitRule>,
}

impl Limits {
    pub fn new(rules: Vec<LimitRule>) -> Self {
        Self { rules }
    }

    pub fn from_config(limits: &BTreeMap<String, LimitConfig>) -> Result<Self, ConfigError> {
        let rules = limits
            .iter()
            .filter(|(_, limit)| limit.enabled)
            .map(|(name, limit)| {
                LimitRule::new(
                    name,
                    &limit.regexp,
                    &limit.replace,
                    limit.limit,
                    limit.unmatched,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[LimitRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Runs `line` through every limit. Evaluation stops at the first rejection, so later
    /// limits do not count a rejected line.
    pub fn check(&self, line: &str) -> Verdict {
        let mut tags = Vec::new();
        for rule in &self.rules {
            let Some(tag) = rule.tag(line) else {
                match rule.unmatched {
                    UnmatchedPolicy::Pass => continue,
                    UnmatchedPolicy::Reject => {
                        return Verdict::Reject(Rejection::Unmatched {
                            limit: rule.name.clone(),
                        })
                    }
                    UnmatchedPolicy::Exceed => {
                        return Verdict::Reject(Rejection::VolumeExceeded {
                            limit: rule.name.clone(),
                            tag: None,
                        })
                    }
                }
            };
            if !rule.counter.observe(tag.clone(), rule.ceiling) {
                return Verdict::Reject(Rejection::VolumeExceeded {
                    limit: rule.name.clone(),
                    tag: Some(tag),
                });
            }
            tags.push(Tag {
                limit: rule.name.clone(),
                value: tag,
            });
        }
        if tags.is_empty() {
            Verdict::Accept
        } else {
            Verdict::Tagged(tags)
        }
    }
}
