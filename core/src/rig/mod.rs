//! Worker-host fleet management: the "rig" subsystem.
//!
//! Everything needed to bring a fleet of worker hosts up and down: host
//! identities, gateways (local subprocess or ssh), connection tracking,
//! filtered deletion-aware tree mirroring, the worker collaborator
//! interfaces, and the orchestrator that sequences them.
//!
//! Data flows leaf-first: `host` → `connection`/`gateway` → `sync`/`mirror`
//! → `orchestrator`, with `worker` supplying the channel and node traits the
//! orchestrator drives at teardown.

pub mod connection;
pub mod gateway;
pub mod host;
pub mod mirror;
pub mod orchestrator;
pub mod sync;
pub mod worker;
