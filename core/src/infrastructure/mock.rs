//! Test doubles for gateways, worker channels and nodes.
//!
//! Every double records what was done to it so orchestration tests can
//! assert on ordering. Doubles that share a `Journal` append to one ordered
//! log across hosts.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::config::FleetConfig;
use crate::error::{FleetError, Result};
use crate::events::EventSink;
use crate::rig::connection::GatewayConnection;
use crate::rig::gateway::{Gateway, GatewayFactory, GatewayKind};
use crate::rig::host::HostIdentity;
use crate::rig::mirror::{mirror_tree, MirrorOptions, SyncFilter, SyncStats};
use crate::rig::worker::{Channel, ControlMessage, NodeFactory, NodeHandle, WorkerSpawner};


// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

/// Ordered, shared log of mock operations, one line each.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: String) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Index of the first entry equal to `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    /// Entries starting with `prefix`.
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.starts_with(prefix))
            .collect()
    }
}


// ---------------------------------------------------------------------------
// MockGateway
// ---------------------------------------------------------------------------

/// In-memory gateway. Mirrors onto the local disk when built with a real
/// home directory, otherwise only records destinations.
#[derive(Debug)]
pub struct MockGateway {
    host: String,
    kind: GatewayKind,
    home: String,
    on_disk: bool,
    remote_exec: bool,
    sync_failure: Option<String>,
    sync_panic: bool,
    sync_delay: Duration,
    alive: AtomicBool,
    exits: AtomicUsize,
    mirrors: Mutex<Vec<String>>,
}

impl MockGateway {
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Destinations mirrored to, in order.
    pub fn mirrored(&self) -> Vec<String> {
        self.mirrors.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn exit_count(&self) -> usize {
        self.exits.load(Ordering::SeqCst)
    }
}

impl Gateway for MockGateway {
    fn kind(&self) -> GatewayKind {
        self.kind
    }

    fn home_dir(&self) -> Result<String> {
        if !self.is_alive() {
            return Err(FleetError::GatewayClosed(self.host.clone()));
        }
        Ok(self.home.clone())
    }

    fn mirror(
        &self,
        source: &Path,
        filter: &SyncFilter,
        dest: &str,
        opts: MirrorOptions,
    ) -> Result<SyncStats> {
        if !self.is_alive() {
            return Err(FleetError::GatewayClosed(self.host.clone()));
        }
        if !self.sync_delay.is_zero() {
            thread::sleep(self.sync_delay);
        }
        if let Ok(mut mirrors) = self.mirrors.lock() {
            mirrors.push(dest.to_string());
        }
        if self.sync_panic {
            panic!("mirror to {} blew up", self.host);
        }
        if let Some(message) = &self.sync_failure {
            return Err(FleetError::SyncTransfer {
                host: self.host.clone(),
                message: message.clone(),
            });
        }
        if !self.on_disk {
            return Ok(SyncStats::default());
        }
        mirror_tree(source, Path::new(dest), filter, opts).map_err(|e| FleetError::SyncTransfer {
            host: self.host.clone(),
            message: e.to_string(),
        })
    }

    fn supports_remote_exec(&self) -> bool {
        self.remote_exec
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn exit(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.exits.fetch_add(1, Ordering::SeqCst);
    }
}


// ---------------------------------------------------------------------------
// MockGatewayFactory
// ---------------------------------------------------------------------------

/// Factory of `MockGateway`s with per-host failure injection.
#[derive(Debug)]
pub struct MockGatewayFactory {
    home: String,
    on_disk: bool,
    open_failures: Mutex<HashMap<String, String>>,
    sync_failures: Mutex<HashMap<String, String>>,
    sync_delays: Mutex<HashMap<String, Duration>>,
    sync_panics: Mutex<HashSet<String>>,
    no_exec: Mutex<HashSet<String>>,
    opened: Mutex<Vec<Arc<MockGateway>>>,
}

impl MockGatewayFactory {
    /// Gateways report `home` but never touch the disk.
    pub fn new(home: &str) -> Self {
        MockGatewayFactory {
            home: home.to_string(),
            on_disk: false,
            open_failures: Mutex::new(HashMap::new()),
            sync_failures: Mutex::new(HashMap::new()),
            sync_delays: Mutex::new(HashMap::new()),
            sync_panics: Mutex::new(HashSet::new()),
            no_exec: Mutex::new(HashSet::new()),
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Gateways report `home` and mirror into it for real.
    pub fn on_disk(home: &Path) -> Self {
        MockGatewayFactory {
            on_disk: true,
            ..Self::new(&home.to_string_lossy())
        }
    }

    /// Opening a gateway to `hostname` fails with a connection error.
    pub fn fail_host(&self, hostname: &str, reason: &str) {
        insert(&self.open_failures, hostname, reason.to_string());
    }

    /// Every transfer to `hostname` fails with `message`.
    pub fn fail_sync(&self, hostname: &str, message: &str) {
        insert(&self.sync_failures, hostname, message.to_string());
    }

    /// Transfers to `hostname` take at least `delay`.
    pub fn delay_sync(&self, hostname: &str, delay: Duration) {
        insert(&self.sync_delays, hostname, delay);
    }

    /// Transfers to `hostname` panic inside the gateway.
    pub fn panic_sync(&self, hostname: &str) {
        if let Ok(mut set) = self.sync_panics.lock() {
            set.insert(hostname.to_string());
        }
    }

    /// Gateways to `hostname` cannot spawn workers.
    pub fn without_remote_exec(&self, hostname: &str) {
        if let Ok(mut set) = self.no_exec.lock() {
            set.insert(hostname.to_string());
        }
    }

    /// Gateways opened so far, in order.
    pub fn opened(&self) -> Vec<Arc<MockGateway>> {
        self.opened.lock().map(|o| o.clone()).unwrap_or_default()
    }

    /// Most recent gateway opened to `hostname`.
    pub fn gateway_for(&self, hostname: &str) -> Option<Arc<MockGateway>> {
        self.opened().into_iter().rev().find(|g| g.host == hostname)
    }
}

impl GatewayFactory for MockGatewayFactory {
    fn open(&self, host: &HostIdentity, _interpreter: &str) -> Result<Arc<dyn Gateway>> {
        let hostname = host.hostname();
        if let Some(reason) = lookup(&self.open_failures, hostname) {
            return Err(FleetError::Connection {
                host: hostname.to_string(),
                reason,
            });
        }
        let gateway = Arc::new(MockGateway {
            host: hostname.to_string(),
            kind: if host.is_local() { GatewayKind::Local } else { GatewayKind::Ssh },
            home: self.home.clone(),
            on_disk: self.on_disk,
            remote_exec: self.no_exec.lock().map(|s| !s.contains(hostname)).unwrap_or(true),
            sync_failure: lookup(&self.sync_failures, hostname),
            sync_panic: self.sync_panics.lock().map(|s| s.contains(hostname)).unwrap_or(false),
            sync_delay: lookup(&self.sync_delays, hostname).unwrap_or_default(),
            alive: AtomicBool::new(true),
            exits: AtomicUsize::new(0),
            mirrors: Mutex::new(Vec::new()),
        });
        if let Ok(mut opened) = self.opened.lock() {
            opened.push(Arc::clone(&gateway));
        }
        Ok(gateway)
    }
}

fn insert<V>(map: &Mutex<HashMap<String, V>>, key: &str, value: V) {
    if let Ok(mut map) = map.lock() {
        map.insert(key.to_string(), value);
    }
}

fn lookup<V: Clone>(map: &Mutex<HashMap<String, V>>, key: &str) -> Option<V> {
    map.lock().ok().and_then(|m| m.get(key).cloned())
}


// ---------------------------------------------------------------------------
// MockChannel
// ---------------------------------------------------------------------------

/// How `MockChannel::wait_close` behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseBehavior {
    /// The remote side closes promptly.
    Clean,
    /// The wait expires.
    Timeout,
    /// The wait fails with a non-timeout error.
    Broken,
}

/// Channel double. Journal entries are `<op> <host id>`, with sends written
/// as `send <host id> <wire value>`.
#[derive(Debug)]
pub struct MockChannel {
    host: HostIdentity,
    journal: Journal,
    behavior: CloseBehavior,
    sent: Mutex<Vec<ControlMessage>>,
    closed: AtomicBool,
    gateway_exited: AtomicBool,
}

impl MockChannel {
    pub fn new(host: HostIdentity, journal: Journal) -> Self {
        Self::with_behavior(host, journal, CloseBehavior::Clean)
    }

    pub fn with_behavior(host: HostIdentity, journal: Journal, behavior: CloseBehavior) -> Self {
        MockChannel {
            host,
            journal,
            behavior,
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            gateway_exited: AtomicBool::new(false),
        }
    }

    pub fn sent(&self) -> Vec<ControlMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn gateway_exited(&self) -> bool {
        self.gateway_exited.load(Ordering::SeqCst)
    }
}

impl Channel for MockChannel {
    fn host(&self) -> &HostIdentity {
        &self.host
    }

    fn send(&self, message: ControlMessage) -> Result<()> {
        if self.is_closed() {
            return Err(FleetError::Channel(format!("{} is closed", self.host.id())));
        }
        self.journal
            .record(format!("send {} {}", self.host.id(), message.to_wire()));
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(message);
        }
        Ok(())
    }

    fn wait_close(&self, timeout: Duration) -> Result<()> {
        self.journal.record(format!("waitclose {}", self.host.id()));
        match self.behavior {
            CloseBehavior::Clean => {
                self.closed.store(true, Ordering::SeqCst);
                Ok(())
            }
            CloseBehavior::Timeout => Err(FleetError::CloseTimeout {
                host: self.host.id().to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            CloseBehavior::Broken => Err(FleetError::Channel(format!(
                "{} lost during close",
                self.host.id()
            ))),
        }
    }

    fn close(&self) {
        self.journal.record(format!("close {}", self.host.id()));
        self.closed.store(true, Ordering::SeqCst);
    }

    fn exit_gateway(&self) {
        self.journal.record(format!("exit {}", self.host.id()));
        self.gateway_exited.store(true, Ordering::SeqCst);
    }
}


// ---------------------------------------------------------------------------
// MockNode
// ---------------------------------------------------------------------------

/// Node that reports pending for a fixed number of checks, then drains.
/// Each check is journaled as `pending <host id>`.
#[derive(Debug)]
pub struct MockNode {
    host: HostIdentity,
    remaining: AtomicUsize,
    checks: AtomicUsize,
    journal: Journal,
}

impl MockNode {
    pub fn new(host: HostIdentity, busy_checks: usize, journal: Journal) -> Self {
        MockNode {
            host,
            remaining: AtomicUsize::new(busy_checks),
            checks: AtomicUsize::new(0),
            journal,
        }
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

impl NodeHandle for MockNode {
    fn host(&self) -> &HostIdentity {
        &self.host
    }

    fn pending(&self) -> bool {
        self.journal.record(format!("pending {}", self.host.id()));
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}


// ---------------------------------------------------------------------------
// MockSpawner / MockNodeFactory
// ---------------------------------------------------------------------------

/// Spawner that hands out `MockChannel`s sharing one journal.
#[derive(Debug, Default)]
pub struct MockSpawner {
    journal: Journal,
    behaviors: Mutex<HashMap<String, CloseBehavior>>,
    spawn_failures: Mutex<HashMap<String, String>>,
    channels: Mutex<Vec<Arc<MockChannel>>>,
}

impl MockSpawner {
    pub fn new(journal: Journal) -> Self {
        MockSpawner {
            journal,
            ..Self::default()
        }
    }

    /// Channels to `hostname` close with `behavior`.
    pub fn close_behavior(&self, hostname: &str, behavior: CloseBehavior) {
        insert(&self.behaviors, hostname, behavior);
    }

    /// Spawning on `hostname` fails.
    pub fn fail_spawn(&self, hostname: &str, reason: &str) {
        insert(&self.spawn_failures, hostname, reason.to_string());
    }

    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.channels.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl WorkerSpawner for MockSpawner {
    fn spawn(&self, conn: &GatewayConnection, _config: &FleetConfig) -> Result<Arc<dyn Channel>> {
        let host = conn.identity();
        if let Some(reason) = lookup(&self.spawn_failures, host.hostname()) {
            return Err(FleetError::Spawn {
                host: host.id().to_string(),
                reason,
            });
        }
        self.journal.record(format!("spawn {}", host.id()));
        let behavior = lookup(&self.behaviors, host.hostname()).unwrap_or(CloseBehavior::Clean);
        let channel = Arc::new(MockChannel::with_behavior(
            host.clone(),
            self.journal.clone(),
            behavior,
        ));
        if let Ok(mut channels) = self.channels.lock() {
            channels.push(Arc::clone(&channel));
        }
        Ok(channel)
    }
}

/// Produces `MockNode`s that stay busy for `busy_checks` checks.
#[derive(Debug, Clone)]
pub struct MockNodeFactory {
    busy_checks: usize,
    journal: Journal,
}

impl MockNodeFactory {
    pub fn new(busy_checks: usize, journal: Journal) -> Self {
        MockNodeFactory { busy_checks, journal }
    }
}

impl NodeFactory for MockNodeFactory {
    fn create(&self, channel: Arc<dyn Channel>, _sink: Arc<dyn EventSink>) -> Box<dyn NodeHandle> {
        Box::new(MockNode::new(
            channel.host().clone(),
            self.busy_checks,
            self.journal.clone(),
        ))
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
