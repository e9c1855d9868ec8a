//! Process plumbing and test doubles.
//!
//! `runner` executes external programs (rsync) for ssh transfers. `mock`
//! holds in-memory gateways, channels and nodes for deterministic tests of
//! the orchestration layer.

pub mod mock;
pub mod runner;
