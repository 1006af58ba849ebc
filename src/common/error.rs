//! Error types for sds-controller

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Stable error classification carried in every RPC reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    ConflictStale,
    ConfigMismatch,
    CapacityExceeded,
    PreconditionFailed,
    Unreachable,
    Timeout,
    PartialFailure,
    Forbidden,
    InvalidArgument,
    NoQuorum,
    NoPeer,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Unreachable | ErrorKind::Timeout | ErrorKind::ConflictStale
        )
    }

    /// Derive a kind from a node agent failure message.
    pub fn from_agent_message(message: &str) -> Self {
        let msg = message.to_ascii_lowercase();
        if msg.contains("not found") || msg.contains("does not exist") || msg.contains("no such")
        {
            ErrorKind::NotFound
        } else if msg.contains("already exists") || msg.contains("already configured") {
            ErrorKind::AlreadyExists
        } else if msg.contains("insufficient") || msg.contains("no space") {
            ErrorKind::CapacityExceeded
        } else if msg.contains("mismatch") {
            ErrorKind::ConfigMismatch
        } else if msg.contains("quorum") {
            ErrorKind::NoQuorum
        } else if msg.contains("timed out") || msg.contains("timeout") {
            ErrorKind::Timeout
        } else {
            ErrorKind::Internal
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{:?}", self));
        f.write_str(&s)
    }
}

/// Outcome of the best-effort undo that follows a failed workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Complete,
    Partial,
    Failed,
}

impl RollbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackStatus::Complete => "complete",
            RollbackStatus::Partial => "partial",
            RollbackStatus::Failed => "failed",
        }
    }
}

/// Per-node failure detail attached to partial failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub node: String,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum Error {
    // === I/O & persistence ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("State store corrupted: {0}")]
    Corrupted(String),

    #[error("Stale revision for {key}: expected {expected}, current {current}")]
    ConflictStale {
        key: String,
        expected: u64,
        current: u64,
    },

    // === Cluster objects ===
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Configuration mismatch: {0}")]
    ConfigMismatch(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // === Nodes ===
    #[error("Node {node} unreachable: {message}")]
    Unreachable { node: String, message: String },

    #[error("Node {node}: {message}")]
    Agent {
        node: String,
        kind: ErrorKind,
        message: String,
    },

    #[error("{message}")]
    PartialFailure {
        message: String,
        failures: Vec<NodeFailure>,
    },

    // === Failover ===
    #[error("No quorum: {0}")]
    NoQuorum(String),

    #[error("No peer available: {0}")]
    NoPeer(String),

    // === Workflow ===
    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("{error}")]
    RolledBack {
        error: Box<Error>,
        rollback: RollbackStatus,
    },

    // === Config / transport ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::ConflictStale { .. } => ErrorKind::ConflictStale,
            Error::ConfigMismatch(_) => ErrorKind::ConfigMismatch,
            Error::CapacityExceeded(_) => ErrorKind::CapacityExceeded,
            Error::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Unreachable { .. } => ErrorKind::Unreachable,
            Error::Agent { kind, .. } => *kind,
            Error::PartialFailure { .. } => ErrorKind::PartialFailure,
            Error::NoQuorum(_) => ErrorKind::NoQuorum,
            Error::NoPeer(_) => ErrorKind::NoPeer,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::RolledBack { error, .. } => error.kind(),
            Error::Io(_)
            | Error::Serde(_)
            | Error::Corrupted(_)
            | Error::InvalidConfig(_)
            | Error::Http(_)
            | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn rollback_status(&self) -> Option<RollbackStatus> {
        match self {
            Error::RolledBack { rollback, .. } => Some(*rollback),
            _ => None,
        }
    }

    pub fn node_failures(&self) -> Vec<NodeFailure> {
        match self {
            Error::PartialFailure { failures, .. } => failures.clone(),
            Error::RolledBack { error, .. } => error.node_failures(),
            _ => Vec::new(),
        }
    }

    /// The node this error originated on, when it came from an agent call.
    pub fn node(&self) -> Option<&str> {
        match self {
            Error::Unreachable { node, .. } | Error::Agent { node, .. } => Some(node),
            Error::RolledBack { error, .. } => error.node(),
            _ => None,
        }
    }

    /// Human-readable message for RPC replies; retriable errors say so.
    pub fn user_message(&self) -> String {
        let mut message = self.to_string();
        if let Some(status) = self.rollback_status() {
            message.push_str(&format!(" (rollback: {:?})", status).to_lowercase());
        }
        if self.is_retryable() {
            message.push_str(" [retriable]");
        }
        message
    }

    /// Missing-on-node is success for idempotent teardown steps.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::AlreadyExists | ErrorKind::ConflictStale | ErrorKind::ConfigMismatch => {
                StatusCode::CONFLICT
            }
            ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
            ErrorKind::CapacityExceeded => StatusCode::INSUFFICIENT_STORAGE,
            ErrorKind::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::Unreachable | ErrorKind::NoQuorum | ErrorKind::NoPeer => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorKind::Timeout | ErrorKind::Cancelled => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::PartialFailure => StatusCode::MULTI_STATUS,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn node_failure(&self, node: &str) -> NodeFailure {
        NodeFailure {
            node: node.to_string(),
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Internal(e.to_string())
    }
}
