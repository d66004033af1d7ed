//! OF-018: Error types — API errors and crate errors.

use crate::api::ObjectKind;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by a [`crate::api::CloudApi`] implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error("{kind} {id} not found")]
    NotFound { kind: ObjectKind, id: u32 },

    #[error("{kind} named \"{name}\" already exists")]
    NameTaken { kind: ObjectKind, name: String },

    #[error("{kind} {id} is locked")]
    Locked { kind: ObjectKind, id: u32 },

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("{action} is not supported on {kind}")]
    Unsupported { kind: ObjectKind, action: String },

    #[error("backend error: {0}")]
    Backend(String),
}

/// Crate-level error.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("template parse error at line {line}: {message}")]
    Template { line: usize, message: String },

    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("resolve: {0}")]
    Resolve(String),

    #[error("timeout after {elapsed:?} waiting for {what} to reach {target} (last state: {last})")]
    Timeout {
        what: String,
        target: String,
        last: String,
        elapsed: Duration,
    },

    #[error("{what} entered unexpected state {state}{}", detail_suffix(.detail))]
    UnexpectedState {
        what: String,
        state: String,
        detail: Option<String>,
    },

    #[error("config: {0}")]
    Config(String),

    #[error("state file {path}: {message}")]
    State { path: String, message: String },

    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn detail_suffix(detail: &Option<String>) -> String {
    detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default()
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl Error {
    /// True when the underlying API call reported a missing object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api(e) if e.is_not_found())
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}
