//! Fleet configuration.
//!
//! Read once at orchestration start from a YAML document:
//!
//! ```yaml
//! hosts:
//!   - localhost
//!   - gpu1:work/checkout
//! topdir: /src/project
//! rsync_roots: [pkg, tools]
//! rsync_ignore: [pkg/build]
//! remote_interpreter: sh
//! teardown:
//!   poll_interval_ms: 100
//!   close_timeout_ms: 1000
//! ```
//!
//! Relative `topdir` is taken relative to the config file and made absolute;
//! relative roots and ignores are taken relative to `topdir`.
//!
//! Each root lands on a host at its path relative to `topdir`. A root outside
//! `topdir` has no such path and lands on the host base directory itself, so
//! with deletion enabled it wipes whatever earlier roots put there. Keep roots
//! under `topdir` when there is more than one.

use std::env;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};
use crate::logging::LogConfig;
use crate::rig::host::{parse_all, IdentityRegistry};


#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeardownConfig {
    /// Pause between drain checks.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Bounded wait for each channel to close before it is force-closed.
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        TeardownConfig {
            poll_interval_ms: default_poll_interval_ms(),
            close_timeout_ms: default_close_timeout_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_close_timeout_ms() -> u64 {
    1000
}

fn default_topdir() -> PathBuf {
    PathBuf::from(".")
}

fn default_true() -> bool {
    true
}

fn default_interpreter() -> String {
    "sh".to_string()
}


#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FleetConfig {
    /// Host specs, `<hostname>[:<relpath>]`, in declaration order.
    pub hosts: Vec<String>,
    /// Top-level directory that rsync roots are made relative to.
    #[serde(default = "default_topdir")]
    pub topdir: PathBuf,
    /// Trees to mirror onto every host. Defaults to `[topdir]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsync_roots: Option<Vec<PathBuf>>,
    /// Paths excluded from every transfer.
    #[serde(default)]
    pub rsync_ignore: Vec<PathBuf>,
    /// Remove destination entries that are absent from the source.
    #[serde(default = "default_true")]
    pub rsync_delete: bool,
    /// Interpreter started by each gateway.
    #[serde(default = "default_interpreter")]
    pub remote_interpreter: String,
    #[serde(default)]
    pub verbose: bool,
    /// Skip draining at teardown.
    #[serde(default)]
    pub exitfirst: bool,
    #[serde(default)]
    pub teardown: TeardownConfig,
    #[serde(default)]
    pub logging: LogConfig,
}

impl FleetConfig {
    pub fn new(hosts: Vec<String>, topdir: impl Into<PathBuf>) -> Self {
        FleetConfig {
            hosts,
            topdir: topdir.into(),
            rsync_roots: None,
            rsync_ignore: Vec::new(),
            rsync_delete: true,
            remote_interpreter: default_interpreter(),
            verbose: false,
            exitfirst: false,
            teardown: TeardownConfig::default(),
            logging: LogConfig::default(),
        }
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            FleetError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_yaml(&text)?;
        if config.topdir.is_relative() {
            let base = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            config.topdir = absolute(&base.join(&config.topdir))?;
        }
        Ok(config)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: FleetConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check that there is at least one host, every host spec parses, and an
    /// interpreter is named.
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(FleetError::Configuration("no hosts configured".into()));
        }
        if self.remote_interpreter.trim().is_empty() {
            return Err(FleetError::Configuration("remote_interpreter is empty".into()));
        }
        parse_all(&self.hosts, &mut IdentityRegistry::new()).map(|_| ())
    }

    /// Resolve a configured path against `topdir`.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.topdir.join(path)
        }
    }

    /// Rsync roots, resolved. Defaults to the top-level directory.
    pub fn roots(&self) -> Vec<PathBuf> {
        match &self.rsync_roots {
            Some(roots) => roots.iter().map(|r| self.resolve(r)).collect(),
            None => vec![self.topdir.clone()],
        }
    }

    /// Ignored paths, resolved.
    pub fn ignores(&self) -> Vec<PathBuf> {
        self.rsync_ignore.iter().map(|p| self.resolve(p)).collect()
    }

    /// Destination subpath of `root` on each host: its path relative to
    /// `topdir`, or `None` when it is `topdir` itself or lies outside it.
    pub fn dest_subpath(&self, root: &Path) -> Option<String> {
        let rel = root.strip_prefix(&self.topdir).ok()?;
        if rel.as_os_str().is_empty() {
            return None;
        }
        Some(rel.to_string_lossy().replace('\\', "/"))
    }

    /// Whether `root` lies outside `topdir`.
    pub fn is_outside_topdir(&self, root: &Path) -> bool {
        !root.starts_with(&self.topdir)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.teardown.poll_interval_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown.close_timeout_ms)
    }
}

/// `path` against the working directory, with `.` components dropped.
fn absolute(path: &Path) -> Result<PathBuf> {
    let base = if path.is_absolute() {
        PathBuf::new()
    } else {
        env::current_dir()?
    };
    Ok(path
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .fold(base, |acc, c| acc.join(c)))
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
