//! Crate-wide error type.
//!
//! Gateway-open and sync-session failures propagate to the caller as
//! `FleetError`. Per-target transfer failures travel through the target's
//! completion callback instead, and close timeouts are absorbed by the
//! teardown path.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    /// A host spec or configuration value is malformed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The transport to a host could not be established.
    #[error("connection to '{host}' failed: {reason}")]
    Connection { host: String, reason: String },

    /// A host identity already has a live gateway.
    #[error("host '{0}' already has a live gateway")]
    AlreadyConnected(String),

    /// A host identity's gateway was closed and cannot be reopened.
    #[error("gateway for '{0}' was closed; create a new host identity to reconnect")]
    GatewayClosed(String),

    /// A single sync target failed to transfer.
    #[error("sync to '{host}' failed: {message}")]
    SyncTransfer { host: String, message: String },

    /// A sync source root is missing or unreadable.
    #[error("sync source {}: {reason}", path.display())]
    SyncSource { path: PathBuf, reason: String },

    /// A channel did not close within the allotted time.
    #[error("channel to '{host}' did not close within {timeout_ms}ms")]
    CloseTimeout { host: String, timeout_ms: u64 },

    /// An orchestrator phase was invoked out of order.
    #[error("invalid orchestrator state: expected {expected}, was {actual}")]
    InvalidState { expected: String, actual: String },

    /// A message could not be delivered over a channel.
    #[error("channel error: {0}")]
    Channel(String),

    /// The worker-spawn collaborator failed.
    #[error("worker spawn on '{host}' failed: {reason}")]
    Spawn { host: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FleetError {
    /// Whether this error is a channel close timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, FleetError::CloseTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
