//! Command dispatch for the `hostfleet` binary.
//!
//! `Sys` owns the gateway factory and turns each `Command` into a run of the
//! orchestrator, returning the text to print.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use crate::command::Command;
use crate::config::FleetConfig;
use crate::error::{FleetError, Result};
use crate::events::{EventSink, FanoutSink, JsonlSink, TracingSink};
use crate::help::help_text;
use crate::infrastructure::runner::ShellRunner;
use crate::rig::gateway::{GatewayFactory, ProcessGatewayFactory};
use crate::rig::host::{parse_all, IdentityRegistry};
use crate::rig::orchestrator::{HostOrchestrator, SyncSummary};


pub struct Sys {
    factory: Arc<dyn GatewayFactory>,
    registry: IdentityRegistry,
}

impl Sys {
    /// Sys backed by real local and ssh gateways.
    pub fn new() -> Self {
        Self::with_factory(Arc::new(ProcessGatewayFactory::new(Arc::new(ShellRunner))))
    }

    pub fn with_factory(factory: Arc<dyn GatewayFactory>) -> Self {
        Sys {
            factory,
            registry: IdentityRegistry::new(),
        }
    }

    /// Execute a command and return its output.
    pub fn execute(&mut self, cmd: Command) -> Result<String> {
        match cmd {
            Command::Hosts { config, format } => self.cmd_hosts(&config, format),
            Command::Sync { config, events, no_delete } => {
                self.cmd_sync(&config, events.as_deref(), no_delete)
            }
            Command::Help { topic } => Ok(help_text(topic.as_deref())),
        }
    }

    fn cmd_hosts(&mut self, config: &str, format: Option<String>) -> Result<String> {
        let config = FleetConfig::load(Path::new(config))?;
        let hosts = parse_all(&config.hosts, &mut self.registry)?;
        if format.as_deref() == Some("json") {
            return Ok(serde_json::to_string_pretty(&hosts)?);
        }
        let mut out = String::new();
        for host in &hosts {
            let _ = writeln!(
                out,
                "{:<16} {:<20} {:<32} {}",
                host.id(),
                host.hostname(),
                host.relpath(),
                if host.rsync_enabled() { "rsync" } else { "no-rsync" }
            );
        }
        Ok(out.trim_end().to_string())
    }

    fn cmd_sync(&mut self, config: &str, events: Option<&str>, no_delete: bool) -> Result<String> {
        let mut config = FleetConfig::load(Path::new(config))?;
        if no_delete {
            config.rsync_delete = false;
        }

        let mut sinks: Vec<Box<dyn EventSink>> = vec![Box::new(TracingSink)];
        if let Some(path) = events {
            sinks.push(Box::new(JsonlSink::open(Path::new(path))?));
        }
        let sink: Arc<dyn EventSink> = Arc::new(FanoutSink::new(sinks));

        let mut orch = HostOrchestrator::new(
            config,
            &mut self.registry,
            Arc::clone(&self.factory),
            sink,
        )?;
        let synced = orch.init_rsync();
        orch.close_gateways();
        let summary = synced?;

        let output = render_summary(&summary);
        match summary.failed().first() {
            None => Ok(output),
            Some(first) => Err(FleetError::SyncTransfer {
                host: first.host.id().to_string(),
                message: format!(
                    "{} of {} transfers failed\n{}",
                    summary.failed().len(),
                    summary.records.len(),
                    output
                ),
            }),
        }
    }
}

impl Default for Sys {
    fn default() -> Self {
        Self::new()
    }
}

fn render_summary(summary: &SyncSummary) -> String {
    let mut out = String::new();
    for record in &summary.records {
        let _ = writeln!(
            out,
            "{} {} -> {}: {}",
            record.host.id(),
            record.root.display(),
            record.dest.as_deref().unwrap_or("-"),
            record.outcome
        );
    }
    let _ = write!(
        out,
        "{} synced, {} skipped, {} failed",
        summary.completed(),
        summary.skipped(),
        summary.failed().len()
    );
    out
}
