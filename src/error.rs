//! Error taxonomy shared by every layer of the Supervisor.
//!
//! Errors are raised as [`SupervisorError`] inside the crate and cross every
//! boundary (frame bridge, host API result, proxy import result) as an
//! [`ErrorPayload`] carrying a stable [`ErrorKind`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable classification of a failure, serialized in snake_case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Link,
    Instantiate,
    Trap,
    PermissionDenied,
    ForgedRequest,
    CyclicCall,
    Plugin,
    Network,
    Storage,
    Transport,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Link => "link",
            ErrorKind::Instantiate => "instantiate",
            ErrorKind::Trap => "trap",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::ForgedRequest => "forged_request",
            ErrorKind::CyclicCall => "cyclic_call",
            ErrorKind::Plugin => "plugin",
            ErrorKind::Network => "network",
            ErrorKind::Storage => "storage",
            ErrorKind::Transport => "transport",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("invalid call: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("link error: {0}")]
    Link(String),

    #[error("instantiation failed: {0}")]
    Instantiate(String),

    #[error("component trapped: {0}")]
    Trap(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("forged permission request: {0}")]
    ForgedRequest(String),

    #[error("cyclic call: {0}")]
    CyclicCall(String),

    #[error("plugin error: {0}")]
    Plugin(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// Raised while `producer`'s component was executing.
    #[error("{inner}")]
    Produced {
        producer: String,
        inner: Box<SupervisorError>,
    },
}

impl SupervisorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SupervisorError::Validation(_) => ErrorKind::Validation,
            SupervisorError::NotFound(_) => ErrorKind::NotFound,
            SupervisorError::Link(_) => ErrorKind::Link,
            SupervisorError::Instantiate(_) => ErrorKind::Instantiate,
            SupervisorError::Trap(_) => ErrorKind::Trap,
            SupervisorError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            SupervisorError::ForgedRequest(_) => ErrorKind::ForgedRequest,
            SupervisorError::CyclicCall(_) => ErrorKind::CyclicCall,
            SupervisorError::Plugin(_) => ErrorKind::Plugin,
            SupervisorError::Network(_) => ErrorKind::Network,
            SupervisorError::Storage(_) => ErrorKind::Storage,
            SupervisorError::Transport(_) => ErrorKind::Transport,
            SupervisorError::Produced { inner, .. } => inner.kind(),
        }
    }

    /// The message without the kind prefix added by `Display`.
    pub fn message(&self) -> &str {
        match self {
            SupervisorError::Validation(m)
            | SupervisorError::NotFound(m)
            | SupervisorError::Link(m)
            | SupervisorError::Instantiate(m)
            | SupervisorError::Trap(m)
            | SupervisorError::PermissionDenied(m)
            | SupervisorError::ForgedRequest(m)
            | SupervisorError::CyclicCall(m)
            | SupervisorError::Plugin(m)
            | SupervisorError::Network(m)
            | SupervisorError::Storage(m)
            | SupervisorError::Transport(m) => m,
            SupervisorError::Produced { inner, .. } => inner.message(),
        }
    }

    /// Service whose component raised the error; `None` for errors raised
    /// by the Supervisor itself.
    pub fn producer(&self) -> Option<&str> {
        match self {
            SupervisorError::Produced { producer, .. } => Some(producer),
            _ => None,
        }
    }

    /// Attributes the error to `producer` unless it already has one.
    pub fn produced_by(self, producer: impl Into<String>) -> Self {
        match self {
            SupervisorError::Produced { .. } => self,
            inner => SupervisorError::Produced {
                producer: producer.into(),
                inner: Box::new(inner),
            },
        }
    }

    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Validation => SupervisorError::Validation(message),
            ErrorKind::NotFound => SupervisorError::NotFound(message),
            ErrorKind::Link => SupervisorError::Link(message),
            ErrorKind::Instantiate => SupervisorError::Instantiate(message),
            ErrorKind::Trap => SupervisorError::Trap(message),
            ErrorKind::PermissionDenied => SupervisorError::PermissionDenied(message),
            ErrorKind::ForgedRequest => SupervisorError::ForgedRequest(message),
            ErrorKind::CyclicCall => SupervisorError::CyclicCall(message),
            ErrorKind::Plugin => SupervisorError::Plugin(message),
            ErrorKind::Network => SupervisorError::Network(message),
            ErrorKind::Storage => SupervisorError::Storage(message),
            ErrorKind::Transport => SupervisorError::Transport(message),
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            message: self.message().to_string(),
            kind: self.kind(),
            producer: self.producer().map(str::to_string),
        }
    }
}

/// Wire form of an error: `{"message": ..., "kind": ...}`, plus
/// `"producer"` when a component raised it.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ErrorPayload {
    pub message: String,
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer: Option<String>,
}

impl From<SupervisorError> for ErrorPayload {
    fn from(err: SupervisorError) -> Self {
        err.to_payload()
    }
}

impl From<ErrorPayload> for SupervisorError {
    fn from(payload: ErrorPayload) -> Self {
        let err = SupervisorError::from_kind(payload.kind, payload.message);
        match payload.producer {
            Some(producer) => err.produced_by(producer),
            None => err,
        }
    }
}
