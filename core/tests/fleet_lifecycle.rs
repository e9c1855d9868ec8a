//! End-to-end fleet run against in-memory gateways and workers:
//! prepare → sync → setup → teardown.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use hostfleet_core::events::{HostEvent, RecordingSink};
use hostfleet_core::infrastructure::mock::{
    CloseBehavior, Journal, MockGatewayFactory, MockNodeFactory, MockSpawner,
};
use hostfleet_core::rig::connection::ConnState;
use hostfleet_core::rig::gateway::Gateway;
use hostfleet_core::{FleetConfig, HostOrchestrator, IdentityRegistry, RunState};


fn project() -> tempfile::TempDir {
    let top = tempfile::tempdir().unwrap();
    let pkg = top.path().join("pkg");
    fs::create_dir_all(pkg.join("sub")).unwrap();
    fs::write(pkg.join("mod.py"), "def f(): pass").unwrap();
    fs::write(pkg.join("mod.pyc"), "bytecode").unwrap();
    fs::write(pkg.join("notes.txt~"), "backup").unwrap();
    fs::write(pkg.join(".secret"), "dotfile").unwrap();
    fs::write(pkg.join("sub/data.txt"), "data").unwrap();
    fs::create_dir_all(pkg.join("build")).unwrap();
    fs::write(pkg.join("build/out.bin"), "out").unwrap();
    top
}

fn config(top: &std::path::Path, hosts: &[&str]) -> FleetConfig {
    let mut config = FleetConfig::new(hosts.iter().map(|h| h.to_string()).collect(), top);
    config.rsync_roots = Some(vec![PathBuf::from("pkg")]);
    config.rsync_ignore = vec![PathBuf::from("pkg/build")];
    config.teardown.close_timeout_ms = 10;
    config
}

#[test]
fn full_run_mirrors_spawns_and_drains() {
    let top = project();
    let home = tempfile::tempdir().unwrap();
    let stale = home.path().join("w1/pkg");
    fs::create_dir_all(&stale).unwrap();
    fs::write(stale.join("removed.py"), "gone").unwrap();

    let factory = Arc::new(MockGatewayFactory::on_disk(home.path()));
    let sink = Arc::new(RecordingSink::new());
    let mut registry = IdentityRegistry::new();
    let mut orch = HostOrchestrator::new(
        config(top.path(), &["gpu1:w1", "gpu2:w2", "localhost"]),
        &mut registry,
        factory.clone(),
        sink.clone(),
    )
    .unwrap();

    let journal = Journal::new();
    let spawner = MockSpawner::new(journal.clone());
    spawner.close_behavior("gpu2", CloseBehavior::Timeout);
    let nodes = orch
        .setup_hosts(&spawner, &MockNodeFactory::new(2, journal.clone()))
        .unwrap();
    assert_eq!(nodes.len(), 3);
    assert_eq!(orch.state(), RunState::NodesSpawned);

    // Filtered, deletion-aware mirror on both remote hosts.
    for dest in ["w1", "w2"] {
        let pkg = home.path().join(dest).join("pkg");
        assert!(pkg.join("mod.py").exists());
        assert!(pkg.join("sub/data.txt").exists());
        assert!(!pkg.join("mod.pyc").exists());
        assert!(!pkg.join("notes.txt~").exists());
        assert!(!pkg.join(".secret").exists());
        assert!(!pkg.join("build").exists());
    }
    assert!(!stale.join("removed.py").exists());

    let mut waits = 0;
    orch.shutdown(&nodes, &mut || waits += 1);
    assert_eq!(waits, 2);
    assert_eq!(orch.state(), RunState::Closed);

    // Stop goes out to everyone before the first drain check.
    let entries = journal.entries();
    let last_stop = entries.iter().rposition(|e| e.starts_with("send")).unwrap();
    let first_check = entries.iter().position(|e| e.starts_with("pending")).unwrap();
    assert!(last_stop < first_check);

    // The stuck channel was forced closed and its gateway still exited.
    assert!(journal.position("close gpu2[0]").is_some());
    for channel in spawner.channels() {
        assert!(channel.gateway_exited());
    }
    for host in orch.hosts() {
        assert!(matches!(
            orch.tracker().state(host.id()),
            Some(ConnState::Closed { .. })
        ));
    }
    assert!(factory.opened().iter().all(|g| !g.is_alive()));

    let events = sink.events();
    let timeouts: Vec<&HostEvent> = events
        .iter()
        .filter(|e| matches!(e, HostEvent::CloseTimeout { .. }))
        .collect();
    assert_eq!(timeouts.len(), 1);
    assert_eq!(timeouts[0].host().unwrap().hostname(), "gpu2");
}

#[test]
fn per_host_event_order() {
    let top = project();
    let factory = Arc::new(MockGatewayFactory::new("/home/worker"));
    let sink = Arc::new(RecordingSink::new());
    let mut orch = HostOrchestrator::new(
        config(top.path(), &["gpu1", "localhost"]),
        &mut IdentityRegistry::new(),
        factory,
        sink.clone(),
    )
    .unwrap();

    orch.init_rsync().unwrap();
    orch.close_gateways();

    for host in orch.hosts() {
        let kinds: Vec<&str> = sink
            .events()
            .iter()
            .filter(|e| e.host() == Some(host))
            .map(|e| e.kind())
            .collect();
        assert_eq!(
            kinds,
            vec!["gateway_ready", "syncing", "rsync_root_ready", "gateway_exit"]
        );
    }

    let remote_paths: Vec<Option<String>> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            HostEvent::Syncing { remote_path, .. } => Some(remote_path),
            _ => None,
        })
        .collect();
    assert_eq!(
        remote_paths,
        vec![Some("/home/worker/fleetcache-gpu1/pkg".to_string()), None]
    );
}

#[test]
fn unreachable_host_aborts_the_run() {
    let top = project();
    let factory = Arc::new(MockGatewayFactory::new("/h"));
    factory.fail_host("gpu2", "No route to host");
    let sink = Arc::new(RecordingSink::new());
    let mut orch = HostOrchestrator::new(
        config(top.path(), &["gpu1", "gpu2", "gpu3"]),
        &mut IdentityRegistry::new(),
        factory.clone(),
        sink.clone(),
    )
    .unwrap();

    let journal = Journal::new();
    let result = orch.setup_hosts(&MockSpawner::new(journal.clone()), &MockNodeFactory::new(0, journal.clone()));
    assert!(result.is_err());
    assert!(journal.entries().is_empty());
    assert_eq!(sink.kinds(), vec!["gateway_ready"]);
    assert!(factory.opened().iter().all(|g| !g.is_alive()));
}
