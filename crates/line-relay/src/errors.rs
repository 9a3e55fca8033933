// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

/// Errors raised while loading or validating the relay configuration.
///
/// All of these are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid pattern for limit '{name}': {source}")]
    InvalidPattern {
        name: String,
        #[source]
        source: regex::Error,
    },
}

/// Syntax errors reported by the line validator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LineError {
    #[error("missing measurement")]
    MissingMeasurement,

    #[error("missing fields")]
    MissingFields,

    #[error("invalid tag '{0}'")]
    InvalidTag(String),

    #[error("invalid field '{0}'")]
    InvalidField(String),

    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    #[error("unterminated string field value")]
    UnterminatedString,

    #[error("unexpected trailing data '{0}'")]
    TrailingData(String),
}

/// Errors from the overflow cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize batch: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to deserialize cache entry {path}: {source}")]
    Deserialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from the HTTP listeners.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("listener on {addr} failed: {source}")]
    Accept {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Everything that can keep the relay from starting.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ConfigError::Invalid("batch.size must be greater than 0".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid configuration: batch.size must be greater than 0"
        );
    }

    #[test]
    fn test_invalid_pattern_names_the_limit() {
        #[allow(clippy::invalid_regex)]
        let source = regex::Regex::new("(unclosed").unwrap_err();
        let error = ConfigError::InvalidPattern {
            name: "per_host".to_string(),
            source,
        };
        assert!(error.to_string().starts_with("Invalid pattern for limit 'per_host'"));
    }

    #[test]
    fn test_line_error_display() {
        assert_eq!(
            LineError::InvalidTimestamp("12ab".to_string()).to_string(),
            "invalid timestamp '12ab'"
        );
    }
}
