// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors raised while turning a request body into raw samples.
///
/// Atomic protocols fail the whole request on the first one. Best-effort protocols collect
/// `Record` errors and keep the well-formed records.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,

    #[error("unsupported content encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("failed to decompress {encoding} body: {reason}")]
    Decompress { encoding: String, reason: String },

    #[error("decompressed body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("invalid protobuf payload: {0}")]
    Protobuf(String),

    #[error("invalid JSON payload: {0}")]
    Json(String),

    #[error("payload is not valid UTF-8")]
    Utf8,

    #[error("invalid record {index}: {reason}")]
    Record { index: usize, reason: String },
}

impl DecodeError {
    pub(crate) fn record(index: usize, reason: impl Into<String>) -> Self {
        DecodeError::Record {
            index,
            reason: reason.into(),
        }
    }
}

/// Rejections of a heartbeat identifier. The registry is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid identity {ident:?}: {reason}")]
    InvalidIdentity { ident: String, reason: &'static str },
}

/// Heartbeat failures surfaced to the agent.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HeartbeatError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Per-sample rejections raised by the normalizer. Never fatal to the rest of a batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    #[error("timestamp {timestamp} of {metric} is outside the accepted window (now {now})")]
    ClockSkew {
        metric: String,
        timestamp: i64,
        now: i64,
    },
}

/// Failures reported by a writer backend.
///
/// Anything not explicitly `Permanent` is retried by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    #[error("transient write failure: {0}")]
    Transient(String),

    #[error("permanent write failure: {0}")]
    Permanent(String),
}

impl WriteError {
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, WriteError::Permanent(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelabelError {
    #[error("invalid relabel regex {regex:?}: {reason}")]
    Regex { regex: String, reason: String },

    #[error("relabel action {action} requires {field}")]
    MissingField {
        action: &'static str,
        field: &'static str,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum TargetsError {
    #[error("failed to read targets file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse targets file {path}: {reason}")]
    Parse { path: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<RelabelError> for ConfigError {
    fn from(e: RelabelError) -> Self {
        ConfigError::Invalid(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = DecodeError::record(2, "missing value");
        assert_eq!(error.to_string(), "invalid record 2: missing value");

        let error = IdentityError::InvalidIdentity {
            ident: String::new(),
            reason: "identifier is empty",
        };
        assert_eq!(error.to_string(), "invalid identity \"\": identifier is empty");
    }

    #[test]
    fn test_write_error_classification() {
        assert!(WriteError::Permanent("bad request".into()).is_permanent());
        assert!(!WriteError::Transient("timeout".into()).is_permanent());
    }

    #[test]
    fn test_relabel_error_converts_to_config_error() {
        let error: ConfigError = RelabelError::MissingField {
            action: "replace",
            field: "target_label",
        }
        .into();
        assert_eq!(
            error,
            ConfigError::Invalid("relabel action replace requires target_label".to_string())
        );
    }
}
