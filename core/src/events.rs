//! Lifecycle events and the sinks that receive them.
//!
//! The orchestrator reports each host's progress through an `EventSink`:
//! `GatewayReady`, then per (host, root) `Syncing` followed eventually by
//! `RsyncRootReady` (or `RsyncRootFailed`). Teardown reports its close
//! attempts through the same sink via `wrap_call`.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;

use crate::error::Result;
use crate::rig::host::HostIdentity;


// ---------------------------------------------------------------------------
// HostEvent
// ---------------------------------------------------------------------------

/// A single lifecycle notification.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
    /// A gateway to `host` is open and its destination path is resolved.
    GatewayReady { host: HostIdentity, roots: Vec<PathBuf> },
    /// `root` has been registered for transfer to `host`. `remote_path` is
    /// `None` when the target was skipped (rsync disabled or already queued).
    Syncing {
        host: HostIdentity,
        root: PathBuf,
        remote_path: Option<String>,
    },
    /// The transfer of `root` to `host` has finished (or was skipped).
    RsyncRootReady { host: HostIdentity, root: PathBuf },
    /// The transfer of `root` to `host` failed.
    RsyncRootFailed {
        host: HostIdentity,
        root: PathBuf,
        error: String,
    },
    CallStart { call: String },
    CallFinish { call: String },
    CallException { call: String, error: String },
    /// A channel to `host` did not close in time and was force-closed.
    CloseTimeout { host: HostIdentity, timeout_ms: u64 },
    /// The gateway process for `host` has been terminated.
    GatewayExit { host: HostIdentity },
}

impl HostEvent {
    /// Short snake_case name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            HostEvent::GatewayReady { .. } => "gateway_ready",
            HostEvent::Syncing { .. } => "syncing",
            HostEvent::RsyncRootReady { .. } => "rsync_root_ready",
            HostEvent::RsyncRootFailed { .. } => "rsync_root_failed",
            HostEvent::CallStart { .. } => "call_start",
            HostEvent::CallFinish { .. } => "call_finish",
            HostEvent::CallException { .. } => "call_exception",
            HostEvent::CloseTimeout { .. } => "close_timeout",
            HostEvent::GatewayExit { .. } => "gateway_exit",
        }
    }

    /// The host the event concerns, if any.
    pub fn host(&self) -> Option<&HostIdentity> {
        match self {
            HostEvent::GatewayReady { host, .. }
            | HostEvent::Syncing { host, .. }
            | HostEvent::RsyncRootReady { host, .. }
            | HostEvent::RsyncRootFailed { host, .. }
            | HostEvent::CloseTimeout { host, .. }
            | HostEvent::GatewayExit { host } => Some(host),
            HostEvent::CallStart { .. }
            | HostEvent::CallFinish { .. }
            | HostEvent::CallException { .. } => None,
        }
    }
}

impl fmt::Display for HostEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostEvent::GatewayReady { host, roots } => {
                write!(f, "gateway ready: {} ({} roots)", host, roots.len())
            }
            HostEvent::Syncing { host, root, remote_path } => match remote_path {
                Some(path) => write!(f, "syncing {} -> {} {}", root.display(), host, path),
                None => write!(f, "skipping sync of {} to {}", root.display(), host),
            },
            HostEvent::RsyncRootReady { host, root } => {
                write!(f, "synced {} to {}", root.display(), host)
            }
            HostEvent::RsyncRootFailed { host, root, error } => {
                write!(f, "sync of {} to {} failed: {}", root.display(), host, error)
            }
            HostEvent::CallStart { call } => write!(f, "call start: {}", call),
            HostEvent::CallFinish { call } => write!(f, "call finish: {}", call),
            HostEvent::CallException { call, error } => {
                write!(f, "call exception: {}: {}", call, error)
            }
            HostEvent::CloseTimeout { host, timeout_ms } => {
                write!(f, "close timeout after {}ms: {}", timeout_ms, host)
            }
            HostEvent::GatewayExit { host } => write!(f, "gateway exit: {}", host),
        }
    }
}


// ---------------------------------------------------------------------------
// EventSink
// ---------------------------------------------------------------------------

/// Receiver of lifecycle events. Results are never inspected.
pub trait EventSink: Send + Sync {
    fn notify(&self, event: HostEvent);
}

impl<F> EventSink for F
where
    F: Fn(HostEvent) + Send + Sync,
{
    fn notify(&self, event: HostEvent) {
        self(event)
    }
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn notify(&self, _event: HostEvent) {}
}

/// Sink that logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn notify(&self, event: HostEvent) {
        match &event {
            HostEvent::RsyncRootFailed { .. }
            | HostEvent::CallException { .. }
            | HostEvent::CloseTimeout { .. } => {
                tracing::warn!(event = event.kind(), "{}", event)
            }
            HostEvent::CallStart { .. } | HostEvent::CallFinish { .. } => {
                tracing::debug!(event = event.kind(), "{}", event)
            }
            _ => tracing::info!(event = event.kind(), "{}", event),
        }
    }
}

/// In-memory sink that keeps every event in arrival order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<HostEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything received so far.
    pub fn events(&self) -> Vec<HostEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Event kinds in arrival order.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(HostEvent::kind).collect()
    }
}

impl EventSink for RecordingSink {
    fn notify(&self, event: HostEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Sink that appends each event to a JSON Lines file.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlSink {
    /// Open `path` for appending, creating parent directories as needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(JsonlSink {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonlSink {
    fn notify(&self, event: HostEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("could not encode {} event: {}", event.kind(), e);
                return;
            }
        };
        let written = match self.file.lock() {
            Ok(mut file) => writeln!(file, "{}", line),
            Err(_) => return,
        };
        if let Err(e) = written {
            tracing::warn!("could not append to {}: {}", self.path.display(), e);
        }
    }
}

/// Forwards every event to each inner sink in order.
pub struct FanoutSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Box<dyn EventSink>>) -> Self {
        FanoutSink { sinks }
    }
}

impl EventSink for FanoutSink {
    fn notify(&self, event: HostEvent) {
        for sink in &self.sinks {
            sink.notify(event.clone());
        }
    }
}


// ---------------------------------------------------------------------------
// wrap_call
// ---------------------------------------------------------------------------

/// Run `f`, reporting its start and its finish or failure to `sink`.
pub fn wrap_call<T, F>(sink: &dyn EventSink, call: &str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    sink.notify(HostEvent::CallStart { call: call.to_string() });
    let result = f();
    match &result {
        Ok(_) => sink.notify(HostEvent::CallFinish { call: call.to_string() }),
        Err(e) => sink.notify(HostEvent::CallException {
            call: call.to_string(),
            error: e.to_string(),
        }),
    }
    result
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
