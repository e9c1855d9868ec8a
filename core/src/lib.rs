//! hostfleet core: provisioning and teardown of worker-host fleets.
//!
//! For each configured host this crate resolves a stable identity and
//! destination path, opens an execution gateway, mirrors source trees onto
//! the host, and coordinates a draining shutdown with a forced-close
//! fallback. See `rig::orchestrator::HostOrchestrator` for the entry point.

pub mod cli;
pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod help;
pub mod infrastructure;
pub mod logging;
pub mod rig;
pub mod sys;

pub use config::FleetConfig;
pub use error::{FleetError, Result};
pub use events::{EventSink, HostEvent};
pub use rig::host::{HostIdentity, IdentityRegistry};
pub use rig::orchestrator::{HostOrchestrator, RunState, SyncSummary};
