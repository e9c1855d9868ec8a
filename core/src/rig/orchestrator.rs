//! Fleet lifecycle: gateways, sync, worker spawn and teardown.
//!
//! `HostOrchestrator` walks one run through
//! `Init -> GatewaysReady -> Synced -> NodesSpawned -> Draining -> Closed`.
//! Each phase runs the earlier ones first when they have not happened yet,
//! so `setup_hosts` alone is enough to bring a fleet up.
//!
//! Teardown is best-effort per host: a channel that will not close is
//! force-closed, and its gateway is terminated regardless.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::config::FleetConfig;
use crate::error::{FleetError, Result};
use crate::events::{wrap_call, EventSink, HostEvent};
use crate::rig::connection::{ConnectionTracker, GatewayConnection};
use crate::rig::gateway::GatewayFactory;
use crate::rig::host::{parse_all, HostIdentity, IdentityRegistry};
use crate::rig::sync::{DoneCallback, SyncOutcome, SyncSession};
use crate::rig::worker::{Channel, ControlMessage, NodeFactory, NodeHandle, Waiter, WorkerSpawner};


// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    GatewaysReady,
    Synced,
    NodesSpawned,
    Draining,
    Closed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Init => "init",
            RunState::GatewaysReady => "gateways_ready",
            RunState::Synced => "synced",
            RunState::NodesSpawned => "nodes_spawned",
            RunState::Draining => "draining",
            RunState::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}


// ---------------------------------------------------------------------------
// SyncSummary
// ---------------------------------------------------------------------------

/// Outcome of one (host, root) pair.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRecord {
    pub host: HostIdentity,
    /// Source root, resolved against `topdir`.
    pub root: PathBuf,
    /// Resolved destination; `None` when skipped.
    pub dest: Option<String>,
    pub outcome: SyncOutcome,
}

/// Everything `init_rsync` did, root by root.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSummary {
    pub records: Vec<SyncRecord>,
}

impl SyncSummary {
    pub fn completed(&self) -> usize {
        self.count(|o| matches!(o, SyncOutcome::Completed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, SyncOutcome::Skipped))
    }

    pub fn failed(&self) -> Vec<&SyncRecord> {
        self.records.iter().filter(|r| r.outcome.is_failure()).collect()
    }

    /// True when no transfer failed.
    pub fn is_clean(&self) -> bool {
        self.failed().is_empty()
    }

    fn count(&self, pred: impl Fn(&SyncOutcome) -> bool) -> usize {
        self.records.iter().filter(|r| pred(&r.outcome)).count()
    }
}


// ---------------------------------------------------------------------------
// HostOrchestrator
// ---------------------------------------------------------------------------

pub struct HostOrchestrator {
    config: FleetConfig,
    hosts: Vec<HostIdentity>,
    roots: Vec<PathBuf>,
    ignores: Vec<PathBuf>,
    /// Index-aligned with `hosts` once gateways are ready.
    connections: Vec<GatewayConnection>,
    tracker: ConnectionTracker,
    factory: Arc<dyn GatewayFactory>,
    sink: Arc<dyn EventSink>,
    channels: Vec<Arc<dyn Channel>>,
    state: RunState,
}

impl HostOrchestrator {
    /// Build an orchestrator for the hosts named in `config`, drawing ids
    /// from `registry`.
    pub fn new(
        config: FleetConfig,
        registry: &mut IdentityRegistry,
        factory: Arc<dyn GatewayFactory>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let hosts = parse_all(&config.hosts, registry)?;
        Ok(Self::with_hosts(config, hosts, factory, sink))
    }

    /// Build an orchestrator for already-parsed hosts. `config.hosts` is not
    /// consulted.
    pub fn with_hosts(
        config: FleetConfig,
        hosts: Vec<HostIdentity>,
        factory: Arc<dyn GatewayFactory>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let roots = config.roots();
        let ignores = config.ignores();
        let mut tracker = ConnectionTracker::new();
        for host in &hosts {
            tracker.register(host.id());
        }
        HostOrchestrator {
            config,
            hosts,
            roots,
            ignores,
            connections: Vec::new(),
            tracker,
            factory,
            sink,
            channels: Vec::new(),
            state: RunState::Init,
        }
    }

    pub fn hosts(&self) -> &[HostIdentity] {
        &self.hosts
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn connections(&self) -> &[GatewayConnection] {
        &self.connections
    }

    /// Worker channels spawned by `setup_hosts`.
    pub fn channels(&self) -> &[Arc<dyn Channel>] {
        &self.channels
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    // -- Bring-up --

    /// Open a gateway to every host, in declaration order.
    ///
    /// The first failure aborts the phase: gateways already opened are
    /// terminated, the run moves to `Closed` and the error is returned.
    pub fn prepare_gateways(&mut self) -> Result<()> {
        self.expect_state(RunState::Init)?;
        let interpreter = self.config.remote_interpreter.clone();

        for host in &self.hosts {
            match GatewayConnection::open(host, &interpreter, self.factory.as_ref(), &mut self.tracker) {
                Ok(conn) => {
                    self.sink.notify(HostEvent::GatewayReady {
                        host: host.clone(),
                        roots: self.roots.clone(),
                    });
                    self.connections.push(conn);
                }
                Err(e) => {
                    tracing::error!(host = host.id(), "aborting gateway setup: {}", e);
                    for conn in self.connections.drain(..) {
                        conn.terminate(&mut self.tracker);
                    }
                    self.state = RunState::Closed;
                    return Err(e);
                }
            }
        }

        self.state = RunState::GatewaysReady;
        Ok(())
    }

    /// Mirror every root to every host, one session per root, flushing each
    /// session before starting the next. Opens gateways first if needed.
    ///
    /// Per-target failures are reported through `RsyncRootFailed` and the
    /// summary. A missing root fails the phase.
    pub fn init_rsync(&mut self) -> Result<SyncSummary> {
        if self.state == RunState::Init {
            self.prepare_gateways()?;
        }
        self.expect_state(RunState::GatewaysReady)?;

        let mut summary = SyncSummary::default();
        for root in &self.roots {
            let mut session = SyncSession::new(root, self.ignores.clone(), self.config.verbose)
                .with_delete(self.config.rsync_delete);
            let dest_subpath = self.config.dest_subpath(root);
            if self.roots.len() > 1 && self.config.is_outside_topdir(root) {
                tracing::warn!(
                    root = %root.display(),
                    "root is outside topdir and mirrors onto the host base path"
                );
            }

            for conn in &self.connections {
                let host = conn.identity().clone();
                let dest = session.add_target(
                    conn,
                    dest_subpath.as_deref(),
                    Some(self.ready_callback(&host, root)),
                );
                self.sink.notify(HostEvent::Syncing {
                    host: host.clone(),
                    root: root.clone(),
                    remote_path: dest.clone(),
                });
                if dest.is_none() {
                    self.sink.notify(HostEvent::RsyncRootReady {
                        host: host.clone(),
                        root: root.clone(),
                    });
                    summary.records.push(SyncRecord {
                        host,
                        root: root.clone(),
                        dest: None,
                        outcome: SyncOutcome::Skipped,
                    });
                }
            }

            let report = session.flush()?;
            summary.records.extend(report.targets.into_iter().map(|t| SyncRecord {
                host: t.host,
                root: root.clone(),
                dest: Some(t.dest),
                outcome: t.outcome,
            }));
        }

        tracing::info!(
            completed = summary.completed(),
            skipped = summary.skipped(),
            failed = summary.failed().len(),
            "rsync finished"
        );
        self.state = RunState::Synced;
        Ok(summary)
    }

    /// Completion callback for a registered target. Skips are reported by
    /// `init_rsync` itself so that `Syncing` always comes first.
    fn ready_callback(&self, host: &HostIdentity, root: &Path) -> DoneCallback {
        let sink = Arc::clone(&self.sink);
        let host = host.clone();
        let root = root.to_path_buf();
        Box::new(move |outcome: &SyncOutcome| match outcome {
            SyncOutcome::Skipped => {}
            SyncOutcome::Completed { .. } => sink.notify(HostEvent::RsyncRootReady { host, root }),
            SyncOutcome::Failed { error } => sink.notify(HostEvent::RsyncRootFailed {
                host,
                root,
                error: error.clone(),
            }),
        })
    }

    /// Spawn a worker on every host that supports remote execution and wrap
    /// each channel in a node handle. Syncs first if needed.
    ///
    /// Hosts whose gateway cannot execute (in-process stand-ins used in
    /// tests) are skipped silently, so the returned nodes follow host order
    /// but may be fewer than the hosts.
    pub fn setup_hosts(
        &mut self,
        spawner: &dyn WorkerSpawner,
        nodes: &dyn NodeFactory,
    ) -> Result<Vec<Box<dyn NodeHandle>>> {
        if matches!(self.state, RunState::Init | RunState::GatewaysReady) {
            self.init_rsync()?;
        }
        self.expect_state(RunState::Synced)?;

        let mut handles = Vec::new();
        for conn in &self.connections {
            if !conn.supports_remote_exec() {
                tracing::debug!(host = conn.identity().id(), "no remote exec, not spawning");
                continue;
            }
            let channel = spawner.spawn(conn, &self.config)?;
            handles.push(nodes.create(Arc::clone(&channel), Arc::clone(&self.sink)));
            self.channels.push(channel);
        }

        self.state = RunState::NodesSpawned;
        Ok(handles)
    }

    // -- Teardown --

    /// Stop every channel, wait for every node to drain, then tear down the
    /// gateways.
    ///
    /// The stop message goes to all channels before any node is checked. With
    /// `exitfirst` the drain wait is skipped and in-flight work is abandoned.
    pub fn teardown_hosts(
        &mut self,
        channels: &[Arc<dyn Channel>],
        nodes: &[Box<dyn NodeHandle>],
        waiter: &mut dyn Waiter,
        exitfirst: bool,
    ) {
        self.state = RunState::Draining;
        for channel in channels {
            if let Err(e) = channel.send(ControlMessage::Stop) {
                tracing::warn!(host = channel.host().id(), "stop not delivered: {}", e);
            }
        }

        if !exitfirst {
            let mut rounds = 0u64;
            loop {
                let mut clean = true;
                for node in nodes {
                    if node.pending() {
                        clean = false;
                    }
                }
                if clean {
                    break;
                }
                rounds += 1;
                waiter.wait();
            }
            tracing::debug!(rounds, "all nodes drained");
        }

        self.teardown_gateways(channels);
    }

    /// `teardown_hosts` over the channels from `setup_hosts`, using the
    /// configured `exitfirst`.
    pub fn shutdown(&mut self, nodes: &[Box<dyn NodeHandle>], waiter: &mut dyn Waiter) {
        let channels = std::mem::take(&mut self.channels);
        let exitfirst = self.config.exitfirst;
        self.teardown_hosts(&channels, nodes, waiter, exitfirst);
    }

    /// Send the force-kill signal on every channel.
    pub fn kill_channels(&self, channels: &[Arc<dyn Channel>]) {
        for channel in channels {
            if let Err(e) = channel.send(ControlMessage::Kill) {
                tracing::warn!(host = channel.host().id(), "kill not delivered: {}", e);
            }
        }
    }

    /// Close every channel and terminate every gateway.
    ///
    /// Each channel gets a bounded wait to close on its own. If the wait
    /// fails it is force-closed. The gateway is terminated either way, and
    /// no host's failure affects the others. Gateways without a channel are
    /// terminated too.
    pub fn teardown_gateways(&mut self, channels: &[Arc<dyn Channel>]) {
        let timeout = self.config.close_timeout();
        let mut exited: HashSet<String> = HashSet::new();

        for channel in channels {
            let host = channel.host().clone();
            let call = format!("waitclose {}", host.id());
            if let Err(e) = wrap_call(self.sink.as_ref(), &call, || channel.wait_close(timeout)) {
                if e.is_timeout() {
                    tracing::warn!(host = host.id(), "channel did not close in {:?}, forcing", timeout);
                    self.sink.notify(HostEvent::CloseTimeout {
                        host: host.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                } else {
                    tracing::warn!(host = host.id(), "channel close failed: {}", e);
                }
                channel.close();
            }
            channel.exit_gateway();
            if let Some(conn) = self.connections.iter().find(|c| c.identity() == &host) {
                conn.terminate(&mut self.tracker);
            }
            self.sink.notify(HostEvent::GatewayExit { host: host.clone() });
            exited.insert(host.id().to_string());
        }

        self.release_connections(&exited);
        self.state = RunState::Closed;
    }

    /// Terminate every gateway without touching worker channels. For runs
    /// that only sync.
    pub fn close_gateways(&mut self) {
        self.release_connections(&HashSet::new());
        self.state = RunState::Closed;
    }

    fn release_connections(&mut self, already_exited: &HashSet<String>) {
        for conn in &self.connections {
            let id = conn.identity().id();
            if already_exited.contains(id) || !self.tracker.is_connected(id) {
                continue;
            }
            conn.terminate(&mut self.tracker);
            self.sink.notify(HostEvent::GatewayExit {
                host: conn.identity().clone(),
            });
        }
    }

    fn expect_state(&self, expected: RunState) -> Result<()> {
        if self.state != expected {
            return Err(FleetError::InvalidState {
                expected: expected.to_string(),
                actual: self.state.to_string(),
            });
        }
        Ok(())
    }
}

impl Drop for HostOrchestrator {
    fn drop(&mut self) {
        for conn in &self.connections {
            if conn.gateway().is_alive() {
                conn.gateway().exit();
            }
        }
    }
}

impl fmt::Debug for HostOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostOrchestrator")
            .field("hosts", &self.hosts.iter().map(|h| h.id()).collect::<Vec<_>>())
            .field("roots", &self.roots)
            .field("state", &self.state)
            .field("connections", &self.connections.len())
            .field("channels", &self.channels.len())
            .finish()
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
