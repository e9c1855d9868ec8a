//! Gateway connections and their state tracking.
//!
//! `ConnectionTracker` holds per-host connection state keyed by host id and
//! enforces that a host has at most one live gateway, and that a closed one is
//! never reopened. `GatewayConnection` is an open gateway plus the destination
//! path resolved for its host.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{FleetError, Result};
use crate::rig::gateway::{Gateway, GatewayFactory, GatewayKind};
use crate::rig::host::HostIdentity;


// ---------------------------------------------------------------------------
// ChannelHandle
// ---------------------------------------------------------------------------

/// Opaque identifier of an open gateway, unique within its tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ChannelHandle(u64);

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gw-{}", self.0)
    }
}


// ---------------------------------------------------------------------------
// ConnState
// ---------------------------------------------------------------------------

/// The current state of a host's gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConnState {
    /// No gateway has been opened or attempted.
    Disconnected,
    /// A gateway is being opened.
    Connecting {
        /// Epoch-millisecond timestamp when the open started.
        since_ms: u64,
    },
    /// The gateway is live.
    Connected {
        /// Epoch-millisecond timestamp when the gateway came up.
        since_ms: u64,
        /// Handle allocated for this gateway.
        handle: ChannelHandle,
    },
    /// The last open attempt failed. The caller may try again.
    Failed {
        /// Human-readable failure reason.
        reason: String,
        /// Epoch-millisecond timestamp of the failure.
        at_ms: u64,
    },
    /// The gateway was torn down. Terminal.
    Closed {
        /// Epoch-millisecond timestamp of the teardown.
        at_ms: u64,
    },
}


// ---------------------------------------------------------------------------
// ConnectionInfo
// ---------------------------------------------------------------------------

/// Connection metadata for a single host.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Identity id (`<hostname>[<n>]`) this info belongs to.
    pub host_id: String,
    /// Current gateway state.
    pub state: ConnState,
    /// Total number of open attempts (successful or not).
    pub attempts: u32,
    /// Time the open round-trip took on success.
    pub latency_ms: Option<u64>,
}

impl ConnectionInfo {
    fn new(host_id: &str) -> Self {
        ConnectionInfo {
            host_id: host_id.to_string(),
            state: ConnState::Disconnected,
            attempts: 0,
            latency_ms: None,
        }
    }
}


/// Aggregate counts of connections by state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub total: usize,
    pub connected: usize,
    pub connecting: usize,
    pub failed: usize,
    pub closed: usize,
    pub disconnected: usize,
}


// ---------------------------------------------------------------------------
// ConnectionTracker
// ---------------------------------------------------------------------------

/// Tracks gateway state for every host id seen.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    connections: HashMap<String, ConnectionInfo>,
    next_handle: u64,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host for tracking. Idempotent.
    pub fn register(&mut self, host_id: &str) {
        self.connections
            .entry(host_id.to_string())
            .or_insert_with(|| ConnectionInfo::new(host_id));
    }

    /// Record the start of an open attempt. Fails fast if the host already
    /// has a live (or opening) gateway, or had one that was closed.
    pub fn begin_open(&mut self, host_id: &str, now_ms: u64) -> Result<()> {
        self.register(host_id);
        let info = self.info_mut(host_id)?;
        match info.state {
            ConnState::Connected { .. } | ConnState::Connecting { .. } => {
                Err(FleetError::AlreadyConnected(host_id.to_string()))
            }
            ConnState::Closed { .. } => Err(FleetError::GatewayClosed(host_id.to_string())),
            ConnState::Disconnected | ConnState::Failed { .. } => {
                info.state = ConnState::Connecting { since_ms: now_ms };
                info.attempts += 1;
                Ok(())
            }
        }
    }

    /// Record a successful open and allocate its handle.
    pub fn mark_connected(&mut self, host_id: &str, now_ms: u64, latency_ms: u64) -> Result<ChannelHandle> {
        let handle = ChannelHandle(self.next_handle);
        let info = self.info_mut(host_id)?;
        if !matches!(info.state, ConnState::Connecting { .. }) {
            return Err(FleetError::InvalidState {
                expected: "Connecting".into(),
                actual: format!("{:?}", info.state),
            });
        }
        info.state = ConnState::Connected { since_ms: now_ms, handle };
        info.latency_ms = Some(latency_ms);
        self.next_handle += 1;
        Ok(handle)
    }

    /// Record a failed open attempt.
    pub fn mark_failed(&mut self, host_id: &str, reason: &str, now_ms: u64) -> Result<()> {
        let info = self.info_mut(host_id)?;
        info.state = ConnState::Failed {
            reason: reason.to_string(),
            at_ms: now_ms,
        };
        Ok(())
    }

    /// Record that the host's gateway was torn down.
    pub fn mark_closed(&mut self, host_id: &str, now_ms: u64) -> Result<()> {
        let info = self.info_mut(host_id)?;
        info.state = ConnState::Closed { at_ms: now_ms };
        Ok(())
    }

    pub fn state(&self, host_id: &str) -> Option<&ConnState> {
        self.connections.get(host_id).map(|i| &i.state)
    }

    pub fn info(&self, host_id: &str) -> Option<&ConnectionInfo> {
        self.connections.get(host_id)
    }

    pub fn is_connected(&self, host_id: &str) -> bool {
        matches!(self.state(host_id), Some(ConnState::Connected { .. }))
    }

    /// Ids of all hosts with a live gateway, sorted.
    pub fn connected_hosts(&self) -> Vec<&str> {
        let mut hosts: Vec<&str> = self
            .connections
            .iter()
            .filter(|(_, info)| matches!(info.state, ConnState::Connected { .. }))
            .map(|(id, _)| id.as_str())
            .collect();
        hosts.sort_unstable();
        hosts
    }

    pub fn summary(&self) -> ConnectionSummary {
        let mut s = ConnectionSummary {
            total: self.connections.len(),
            connected: 0,
            connecting: 0,
            failed: 0,
            closed: 0,
            disconnected: 0,
        };
        for info in self.connections.values() {
            match info.state {
                ConnState::Disconnected => s.disconnected += 1,
                ConnState::Connecting { .. } => s.connecting += 1,
                ConnState::Connected { .. } => s.connected += 1,
                ConnState::Failed { .. } => s.failed += 1,
                ConnState::Closed { .. } => s.closed += 1,
            }
        }
        s
    }

    fn info_mut(&mut self, host_id: &str) -> Result<&mut ConnectionInfo> {
        self.connections
            .get_mut(host_id)
            .ok_or_else(|| FleetError::Configuration(format!("host '{}' not registered", host_id)))
    }
}


// ---------------------------------------------------------------------------
// GatewayConnection
// ---------------------------------------------------------------------------

/// An open gateway to a host and the host's resolved destination directory.
pub struct GatewayConnection {
    identity: HostIdentity,
    handle: ChannelHandle,
    gateway: Arc<dyn Gateway>,
    remote_base_path: String,
}

impl GatewayConnection {
    /// Open a gateway for `identity` and resolve its destination directory.
    ///
    /// The destination is the identity's relpath resolved against the gateway
    /// process's home directory (absolute relpaths pass through). Whether it
    /// exists is not checked. Transport failures are returned as-is and the
    /// tracker records the host as `Failed`.
    pub fn open(
        identity: &HostIdentity,
        interpreter: &str,
        factory: &dyn GatewayFactory,
        tracker: &mut ConnectionTracker,
    ) -> Result<Self> {
        let started = now_ms();
        tracker.begin_open(identity.id(), started)?;

        let opened = factory.open(identity, interpreter).and_then(|gateway| {
            match gateway.home_dir() {
                Ok(home) => Ok((gateway, home)),
                Err(e) => {
                    gateway.exit();
                    Err(e)
                }
            }
        });

        match opened {
            Ok((gateway, home)) => {
                let done = now_ms();
                let handle = tracker.mark_connected(identity.id(), done, done.saturating_sub(started))?;
                let remote_base_path = resolve_remote_path(&home, identity.relpath());
                tracing::info!(
                    host = identity.id(),
                    %handle,
                    "gateway open, destination {}",
                    remote_base_path
                );
                Ok(GatewayConnection {
                    identity: identity.clone(),
                    handle,
                    gateway,
                    remote_base_path,
                })
            }
            Err(e) => {
                tracker.mark_failed(identity.id(), &e.to_string(), now_ms())?;
                tracing::warn!(host = identity.id(), "gateway open failed: {}", e);
                Err(e)
            }
        }
    }

    pub fn identity(&self) -> &HostIdentity {
        &self.identity
    }

    pub fn handle(&self) -> ChannelHandle {
        self.handle
    }

    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    pub fn kind(&self) -> GatewayKind {
        self.gateway.kind()
    }

    pub fn remote_base_path(&self) -> &str {
        &self.remote_base_path
    }

    pub fn supports_remote_exec(&self) -> bool {
        self.gateway.supports_remote_exec()
    }

    /// Terminate the gateway and mark the host closed. The connection cannot
    /// be reopened afterwards.
    pub fn terminate(&self, tracker: &mut ConnectionTracker) {
        self.gateway.exit();
        if let Err(e) = tracker.mark_closed(self.identity.id(), now_ms()) {
            tracing::warn!(host = self.identity.id(), "could not record close: {}", e);
        }
    }
}

impl fmt::Debug for GatewayConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConnection")
            .field("host", &self.identity.id())
            .field("handle", &self.handle)
            .field("remote_base_path", &self.remote_base_path)
            .finish()
    }
}


/// Resolve `relpath` against `home` unless it is already absolute.
pub fn resolve_remote_path(home: &str, relpath: &str) -> String {
    if relpath.starts_with('/') {
        relpath.to_string()
    } else {
        join_remote(home, relpath)
    }
}

/// Join two POSIX path fragments with exactly one separator.
pub fn join_remote(base: &str, rel: &str) -> String {
    if rel.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), rel.trim_start_matches('/'))
}

/// Simple wall-clock milliseconds.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
