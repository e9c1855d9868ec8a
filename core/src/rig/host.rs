//! Host identity parsing and uniqueness.
//!
//! A host spec has the form `<hostname>[:<relpath>]`. Each parsed spec gets an
//! id of the form `hostname[N]`, where `N` counts how many identities the
//! owning `IdentityRegistry` has already handed out for that hostname.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::Serialize;

use crate::error::{FleetError, Result};


/// Hostname that selects a local subprocess gateway instead of ssh.
pub const LOCALHOST: &str = "localhost";

/// Prefix of the default destination directory, `<prefix>-<hostname>`.
pub const CACHE_PREFIX: &str = "fleetcache";


// ---------------------------------------------------------------------------
// IdentityRegistry
// ---------------------------------------------------------------------------

/// Hands out per-hostname id slots.
///
/// One registry per orchestration run is the normal usage. Two identities are
/// only ever equal if they came from the same slot, so independent registries
/// can produce colliding ids.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    slots: HashMap<String, usize>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next slot for `hostname` and return its id.
    fn allocate(&mut self, hostname: &str) -> String {
        let slot = self.slots.entry(hostname.to_string()).or_insert(0);
        let id = format!("{}[{}]", hostname, slot);
        *slot += 1;
        id
    }

    /// Number of identities issued so far for `hostname`.
    pub fn issued(&self, hostname: &str) -> usize {
        self.slots.get(hostname).copied().unwrap_or(0)
    }
}


// ---------------------------------------------------------------------------
// HostIdentity
// ---------------------------------------------------------------------------

/// Canonical identity of a configured worker host.
#[derive(Debug, Clone, Serialize)]
pub struct HostIdentity {
    hostname: String,
    relpath: String,
    rsync_enabled: bool,
    id: String,
}

impl HostIdentity {
    /// Parse a host spec, drawing the id from `registry`.
    ///
    /// Rsync is disabled only for a bare `localhost` spec: any `:` in the
    /// spec, even with an empty relpath, keeps it enabled.
    pub fn parse(spec: &str, registry: &mut IdentityRegistry) -> Result<Self> {
        let (hostname, relpath) = match spec.split_once(':') {
            Some((host, rel)) => (host, Some(rel)),
            None => (spec, None),
        };
        if hostname.is_empty() {
            return Err(FleetError::Configuration(format!(
                "host spec '{}' has an empty hostname",
                spec
            )));
        }

        let relpath = match relpath {
            Some(rel) if !rel.is_empty() => rel.to_string(),
            _ => format!("{}-{}", CACHE_PREFIX, hostname),
        };
        let rsync_enabled = !(relpath_absent(spec) && hostname == LOCALHOST);

        Ok(HostIdentity {
            hostname: hostname.to_string(),
            relpath,
            rsync_enabled,
            id: registry.allocate(hostname),
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn relpath(&self) -> &str {
        &self.relpath
    }

    pub fn rsync_enabled(&self) -> bool {
        self.rsync_enabled
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_local(&self) -> bool {
        self.hostname == LOCALHOST
    }
}

fn relpath_absent(spec: &str) -> bool {
    !spec.contains(':')
}

impl fmt::Display for HostIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<HostInfo {}:{}>", self.hostname, self.relpath)
    }
}

impl PartialEq for HostIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for HostIdentity {}

impl Hash for HostIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}


/// Parse every spec in order with one registry.
pub fn parse_all(specs: &[String], registry: &mut IdentityRegistry) -> Result<Vec<HostIdentity>> {
    specs
        .iter()
        .map(|spec| HostIdentity::parse(spec, registry))
        .collect()
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
