//! Deletion-aware tree synchronisation to many hosts.
//!
//! A `SyncSession` covers one source root. Targets are registered one at a
//! time with `add_target`, deduplicated on `(hostname, relpath)`, and then
//! transferred together by `flush`, which runs every target concurrently and
//! blocks until all of them have finished. Each target's completion callback
//! fires exactly once, whether the target was transferred, failed, or was
//! skipped at registration.

use std::collections::HashSet;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use serde::Serialize;

use crate::error::{FleetError, Result};
use crate::rig::connection::{join_remote, now_ms, GatewayConnection};
use crate::rig::gateway::Gateway;
use crate::rig::host::HostIdentity;
use crate::rig::mirror::{MirrorOptions, SyncFilter, SyncStats};


// ---------------------------------------------------------------------------
// SyncOutcome
// ---------------------------------------------------------------------------

/// How a single target ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Rsync disabled for the host, or the target was already registered.
    Skipped,
    Completed { stats: SyncStats },
    Failed { error: String },
}

impl SyncOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, SyncOutcome::Failed { .. })
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::Skipped => write!(f, "skipped"),
            SyncOutcome::Completed { stats } => write!(
                f,
                "completed ({} copied, {} removed)",
                stats.files_copied, stats.entries_removed
            ),
            SyncOutcome::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

/// Completion callback for one target.
pub type DoneCallback = Box<dyn FnOnce(&SyncOutcome) + Send>;


// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Result of one transferred target.
#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    /// Host the target belongs to.
    pub host: HostIdentity,
    /// Resolved destination directory on the host.
    pub dest: String,
    pub outcome: SyncOutcome,
    /// Wall-clock time of the transfer.
    pub duration_ms: u64,
}

/// Results of one flush, in registration order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlushReport {
    pub targets: Vec<TargetReport>,
}

impl FlushReport {
    pub fn completed(&self) -> usize {
        self.targets
            .iter()
            .filter(|t| matches!(t.outcome, SyncOutcome::Completed { .. }))
            .count()
    }

    pub fn failed(&self) -> Vec<&TargetReport> {
        self.targets.iter().filter(|t| t.outcome.is_failure()).collect()
    }
}


// ---------------------------------------------------------------------------
// SyncSession
// ---------------------------------------------------------------------------

struct SyncTarget {
    identity: HostIdentity,
    gateway: Arc<dyn Gateway>,
    dest: String,
    on_done: Option<DoneCallback>,
}

/// Transfer session for one source root.
pub struct SyncSession {
    root: PathBuf,
    filter: SyncFilter,
    opts: MirrorOptions,
    seen: HashSet<(String, String)>,
    targets: Vec<SyncTarget>,
}

impl SyncSession {
    /// New session mirroring `root` with deletion enabled.
    pub fn new(root: impl Into<PathBuf>, ignores: Vec<PathBuf>, verbose: bool) -> Self {
        SyncSession {
            root: root.into(),
            filter: SyncFilter::new(ignores),
            opts: MirrorOptions {
                delete: true,
                verbose,
            },
            seen: HashSet::new(),
            targets: Vec::new(),
        }
    }

    /// Turn deletion mirroring off (additive copy).
    pub fn with_delete(mut self, delete: bool) -> Self {
        self.opts.delete = delete;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn filter(&self) -> &SyncFilter {
        &self.filter
    }

    /// Number of targets waiting for `flush`.
    pub fn pending_targets(&self) -> usize {
        self.targets.len()
    }

    /// Register `conn` as a target.
    ///
    /// Returns the resolved destination, or `None` when the target is skipped
    /// because rsync is disabled for the host or `(hostname, relpath)` is
    /// already registered. Skipped targets have `on_done` called right away
    /// with `SyncOutcome::Skipped`.
    pub fn add_target(
        &mut self,
        conn: &GatewayConnection,
        dest_subpath: Option<&str>,
        on_done: Option<DoneCallback>,
    ) -> Option<String> {
        let identity = conn.identity();
        let key = (identity.hostname().to_string(), identity.relpath().to_string());

        if !identity.rsync_enabled() || self.seen.contains(&key) {
            tracing::debug!(
                host = identity.id(),
                root = %self.root.display(),
                "sync target skipped"
            );
            if let Some(callback) = on_done {
                callback(&SyncOutcome::Skipped);
            }
            return None;
        }

        let dest = match dest_subpath {
            Some(sub) => join_remote(conn.remote_base_path(), sub),
            None => conn.remote_base_path().to_string(),
        };
        self.seen.insert(key);
        self.targets.push(SyncTarget {
            identity: identity.clone(),
            gateway: Arc::clone(conn.gateway()),
            dest: dest.clone(),
            on_done,
        });
        tracing::debug!(host = identity.id(), "sync target {} -> {}", self.root.display(), dest);
        Some(dest)
    }

    /// Transfer to every registered target concurrently and wait for all of
    /// them.
    ///
    /// A missing source root fails the whole session; every pending callback
    /// still fires, with `Failed`. Individual transfer failures do not fail
    /// the flush and are reported per target.
    pub fn flush(&mut self) -> Result<FlushReport> {
        let targets = std::mem::take(&mut self.targets);
        if targets.is_empty() {
            return Ok(FlushReport::default());
        }

        if !self.root.is_dir() {
            let reason = "not a directory".to_string();
            let outcome = SyncOutcome::Failed {
                error: format!("{}: {}", self.root.display(), reason),
            };
            for target in targets {
                if let Some(callback) = target.on_done {
                    callback(&outcome);
                }
            }
            return Err(FleetError::SyncSource {
                path: self.root.clone(),
                reason,
            });
        }

        let root = self.root.as_path();
        let filter = &self.filter;
        let opts = self.opts;

        let targets: Vec<TargetReport> = thread::scope(|scope| {
            let running: Vec<_> = targets
                .into_iter()
                .map(|target| {
                    let host = target.identity.clone();
                    let dest = target.dest.clone();
                    let handle = scope.spawn(move || transfer(root, filter, opts, target));
                    (host, dest, handle)
                })
                .collect();

            running
                .into_iter()
                .map(|(host, dest, handle)| {
                    handle.join().unwrap_or_else(|_| TargetReport {
                        host,
                        dest,
                        outcome: SyncOutcome::Failed {
                            error: "transfer thread panicked".into(),
                        },
                        duration_ms: 0,
                    })
                })
                .collect()
        });

        Ok(FlushReport { targets })
    }
}

impl fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncSession")
            .field("root", &self.root)
            .field("filter", &self.filter)
            .field("opts", &self.opts)
            .field("targets", &self.targets.len())
            .finish()
    }
}

/// Run one target's transfer and fire its callback. A panicking gateway
/// counts as a failed transfer.
fn transfer(root: &Path, filter: &SyncFilter, opts: MirrorOptions, target: SyncTarget) -> TargetReport {
    let started = now_ms();
    let mirrored = panic::catch_unwind(AssertUnwindSafe(|| {
        target.gateway.mirror(root, filter, &target.dest, opts)
    }));
    let outcome = match mirrored {
        Ok(Ok(stats)) => {
            tracing::info!(
                host = target.identity.id(),
                copied = stats.files_copied,
                removed = stats.entries_removed,
                "synced {} -> {}",
                root.display(),
                target.dest
            );
            SyncOutcome::Completed { stats }
        }
        Ok(Err(e)) => {
            tracing::warn!(host = target.identity.id(), "sync to {} failed: {}", target.dest, e);
            SyncOutcome::Failed { error: e.to_string() }
        }
        Err(payload) => {
            let error = format!("transfer panicked: {}", panic_message(payload.as_ref()));
            tracing::error!(host = target.identity.id(), "sync to {} {}", target.dest, error);
            SyncOutcome::Failed { error }
        }
    };
    if let Some(callback) = target.on_done {
        callback(&outcome);
    }
    TargetReport {
        host: target.identity,
        dest: target.dest,
        outcome,
        duration_ms: now_ms().saturating_sub(started),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::infrastructure::mock::MockGatewayFactory;
    use crate::rig::connection::ConnectionTracker;
    use crate::rig::host::IdentityRegistry;

    fn connect(
        spec: &str,
        reg: &mut IdentityRegistry,
        factory: &MockGatewayFactory,
        tracker: &mut ConnectionTracker,
    ) -> GatewayConnection {
        let id = HostIdentity::parse(spec, reg).unwrap();
        GatewayConnection::open(&id, "sh", factory, tracker).unwrap()
    }

    fn counter() -> (Arc<AtomicUsize>, DoneCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        let callback: DoneCallback = Box::new(move |_| {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        (count, callback)
    }

    #[test]
    fn duplicate_target_is_skipped_but_calls_back() {
        let mut reg = IdentityRegistry::new();
        let mut tracker = ConnectionTracker::new();
        let factory = MockGatewayFactory::new("/home/w");
        let first = connect("gpu1:work", &mut reg, &factory, &mut tracker);
        let second = connect("gpu1:work", &mut reg, &factory, &mut tracker);

        let mut session = SyncSession::new("/src", vec![], false);
        let (first_count, first_cb) = counter();
        let (second_count, second_cb) = counter();

        assert_eq!(
            session.add_target(&first, None, Some(first_cb)),
            Some("/home/w/work".to_string())
        );
        assert_eq!(session.add_target(&second, None, Some(second_cb)), None);
        assert_eq!(second_count.load(Ordering::SeqCst), 1);
        assert_eq!(first_count.load(Ordering::SeqCst), 0);
        assert_eq!(session.pending_targets(), 1);
    }

    #[test]
    fn bare_localhost_is_skipped() {
        let mut reg = IdentityRegistry::new();
        let mut tracker = ConnectionTracker::new();
        let factory = MockGatewayFactory::new("/home/w");
        let local = connect("localhost", &mut reg, &factory, &mut tracker);

        let mut session = SyncSession::new("/src", vec![], false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let dest = session.add_target(
            &local,
            None,
            Some(Box::new(move |o: &SyncOutcome| sink.lock().unwrap().push(o.clone()))),
        );
        assert_eq!(dest, None);
        assert_eq!(*seen.lock().unwrap(), vec![SyncOutcome::Skipped]);
        assert_eq!(session.pending_targets(), 0);
    }

    #[test]
    fn dest_subpath_joins_base() {
        let mut reg = IdentityRegistry::new();
        let mut tracker = ConnectionTracker::new();
        let factory = MockGatewayFactory::new("/home/w");
        let conn = connect("gpu1", &mut reg, &factory, &mut tracker);

        let mut session = SyncSession::new("/src/pkg", vec![], false);
        assert_eq!(
            session.add_target(&conn, Some("pkg"), None),
            Some("/home/w/fleetcache-gpu1/pkg".to_string())
        );
    }

    #[test]
    fn flush_without_targets_is_noop() {
        let mut session = SyncSession::new("/does/not/exist", vec![], false);
        let report = session.flush().unwrap();
        assert!(report.targets.is_empty());
    }

    #[test]
    fn flush_mirrors_to_every_target() {
        let src = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.py"), "a").unwrap();
        fs::write(src.path().join("a.pyc"), "bytecode").unwrap();

        let mut reg = IdentityRegistry::new();
        let mut tracker = ConnectionTracker::new();
        let factory = MockGatewayFactory::on_disk(home.path());
        let one = connect("gpu1:one", &mut reg, &factory, &mut tracker);
        let two = connect("gpu2:two", &mut reg, &factory, &mut tracker);

        let mut session = SyncSession::new(src.path(), vec![], false);
        let (count, cb) = counter();
        let (count2, cb2) = counter();
        session.add_target(&one, None, Some(cb));
        session.add_target(&two, None, Some(cb2));

        let report = session.flush().unwrap();
        assert_eq!(report.completed(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(count2.load(Ordering::SeqCst), 1);
        for dest in ["one", "two"] {
            assert!(home.path().join(dest).join("a.py").exists());
            assert!(!home.path().join(dest).join("a.pyc").exists());
        }
        assert_eq!(session.pending_targets(), 0);
    }

    #[test]
    fn one_failing_target_does_not_block_others() {
        let src = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a"), "a").unwrap();

        let mut reg = IdentityRegistry::new();
        let mut tracker = ConnectionTracker::new();
        let factory = MockGatewayFactory::on_disk(home.path());
        factory.fail_sync("bad", "connection reset");
        factory.delay_sync("slow", Duration::from_millis(30));
        let bad = connect("bad:b", &mut reg, &factory, &mut tracker);
        let slow = connect("slow:s", &mut reg, &factory, &mut tracker);

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut session = SyncSession::new(src.path(), vec![], false);
        for conn in [&bad, &slow] {
            let order = Arc::clone(&order);
            let name = conn.identity().hostname().to_string();
            session.add_target(
                conn,
                None,
                Some(Box::new(move |o: &SyncOutcome| {
                    order.lock().unwrap().push((name, o.is_failure()));
                })),
            );
        }

        let report = session.flush().unwrap();
        assert_eq!(report.completed(), 1);
        assert_eq!(report.failed().len(), 1);
        assert_eq!(report.failed()[0].host.hostname(), "bad");
        assert!(home.path().join("s").join("a").exists());

        let order = order.lock().unwrap();
        assert_eq!(order.len(), 2);
        assert!(order.contains(&("bad".to_string(), true)));
        assert!(order.contains(&("slow".to_string(), false)));
    }

    #[test]
    fn panicking_gateway_still_calls_back_once() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a"), "a").unwrap();

        let mut reg = IdentityRegistry::new();
        let mut tracker = ConnectionTracker::new();
        let factory = MockGatewayFactory::new("/home/w");
        factory.panic_sync("boom");
        let boom = connect("boom", &mut reg, &factory, &mut tracker);
        let fine = connect("fine", &mut reg, &factory, &mut tracker);

        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let mut session = SyncSession::new(src.path(), vec![], false);
        for conn in [&boom, &fine] {
            let outcomes = Arc::clone(&outcomes);
            let name = conn.identity().hostname().to_string();
            session.add_target(
                conn,
                None,
                Some(Box::new(move |o: &SyncOutcome| {
                    outcomes.lock().unwrap().push((name, o.clone()));
                })),
            );
        }

        let report = session.flush().unwrap();
        assert_eq!(report.completed(), 1);
        assert_eq!(report.failed()[0].host.hostname(), "boom");

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 2);
        let (_, boom_outcome) = outcomes.iter().find(|(n, _)| n == "boom").unwrap();
        match boom_outcome {
            SyncOutcome::Failed { error } => assert!(error.contains("panicked")),
            other => panic!("unexpected outcome: {}", other),
        }
    }

    #[test]
    fn missing_root_fails_session_and_calls_back() {
        let mut reg = IdentityRegistry::new();
        let mut tracker = ConnectionTracker::new();
        let factory = MockGatewayFactory::new("/home/w");
        let conn = connect("gpu1", &mut reg, &factory, &mut tracker);

        let mut session = SyncSession::new("/definitely/missing/root", vec![], false);
        let failed = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&failed);
        session.add_target(
            &conn,
            None,
            Some(Box::new(move |o: &SyncOutcome| {
                if o.is_failure() {
                    inner.fetch_add(1, Ordering::SeqCst);
                }
            })),
        );
        let err = session.flush().unwrap_err();
        assert!(matches!(err, FleetError::SyncSource { .. }));
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn repeat_flush_after_sync_mirrors_deletions() {
        let src = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a"), "a").unwrap();
        fs::write(src.path().join("b"), "b").unwrap();
        let dest = home.path().join("d");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("a"), "old").unwrap();
        fs::write(dest.join("c"), "c").unwrap();

        let mut reg = IdentityRegistry::new();
        let mut tracker = ConnectionTracker::new();
        let factory = MockGatewayFactory::on_disk(home.path());
        let conn = connect("gpu1:d", &mut reg, &factory, &mut tracker);

        let mut session = SyncSession::new(src.path(), vec![], false);
        session.add_target(&conn, None, None);
        session.flush().unwrap();

        let mut names: Vec<String> = fs::read_dir(&dest)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(fs::read_to_string(dest.join("a")).unwrap(), "a");
    }
}
