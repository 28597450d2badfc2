use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::net::{TcpListener, TcpStream};

use tunnelbox_rs::config::{ConnectionMode, TargetServer, Topology, TunnelProfile};
use tunnelbox_rs::manager::{ActiveTunnel, StartOptions, TunnelManager};
use tunnelbox_rs::pool::{ConnectionPool, PoolSettings};
use tunnelbox_rs::registry::{JsonFileStore, RegistryEntry, RegistryStore, RegistrySync};
use tunnelbox_rs::transport_tcp::TcpFactory;

fn scratch_registry(name: &str) -> PathBuf {
    let tmp = std::env::temp_dir().join(name);
    let _ = std::fs::remove_dir_all(&tmp);
    std::fs::create_dir_all(&tmp).unwrap();
    tmp.join("registry.json")
}

fn manager() -> TunnelManager {
    let pool = ConnectionPool::new(Arc::new(TcpFactory), PoolSettings::default());
    TunnelManager::new(pool, ConnectionMode::Shared)
}

fn sync_at(path: &PathBuf) -> RegistrySync {
    RegistrySync::new(Arc::new(JsonFileStore::new(path.clone())), manager())
}

fn active_tunnel(profile_id: &str, local_port: u16) -> ActiveTunnel {
    ActiveTunnel {
        id: format!("tunnel-{profile_id}"),
        profile_id: profile_id.into(),
        server_id: "srv".into(),
        topology: Topology::Local,
        connection_mode: ConnectionMode::Shared,
        local_port,
        remote_host: "db.internal".into(),
        remote_port: 5432,
        remote_bind_addr: None,
        local_target: None,
        started_at: Utc::now(),
        bytes_in: 0,
        bytes_out: 0,
    }
}

fn foreign_entry(profile_id: &str, session_id: &str, local_port: u16) -> RegistryEntry {
    RegistryEntry {
        profile_id: profile_id.into(),
        server_id: "srv".into(),
        local_port,
        remote_host: "db.internal".into(),
        remote_port: 5432,
        connection_mode: ConnectionMode::Shared,
        topology: Topology::Local,
        remote_bind_addr: None,
        local_target: None,
        started_at: Utc::now(),
        last_seen: Utc::now(),
        session_id: session_id.into(),
    }
}

#[tokio::test]
async fn foreign_live_entry_is_found_by_port_and_profile() {
    let path = scratch_registry("tunnelbox-rs-reg-ownership");
    let sync_a = sync_at(&path);
    let sync_b = sync_at(&path);

    // A real listener makes sibling A's tunnel probe-alive.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    sync_a
        .register_tunnel(&active_tunnel("p-owned", port))
        .await
        .unwrap();

    let by_profile = sync_b.check_remote_ownership("p-owned", 0).await.unwrap();
    assert_eq!(by_profile.unwrap().session_id, sync_a.session_id());

    let by_port = sync_b
        .check_remote_ownership("some-other-profile", port)
        .await
        .unwrap();
    assert_eq!(by_port.unwrap().local_port, port);

    // A process's own entries are never "remote ownership".
    let own = sync_a.check_remote_ownership("p-owned", port).await.unwrap();
    assert!(own.is_none());
}

#[tokio::test]
async fn dead_foreign_entry_is_invisible_and_evicted_by_probe() {
    let path = scratch_registry("tunnelbox-rs-reg-probe");
    let store = JsonFileStore::new(path.clone());
    let sync_b = sync_at(&path);

    // Port with nothing listening: probe-dead.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = listener.local_addr().unwrap().port();
    drop(listener);

    store
        .save_entries(vec![foreign_entry("p-dead", "sibling-1", dead_port)])
        .await
        .unwrap();

    let found = sync_b.check_remote_ownership("p-dead", 0).await.unwrap();
    assert!(found.is_none(), "dead entry must not count as ownership");

    sync_b.sync_with_probe().await.unwrap();
    assert!(store.get_entries().await.unwrap().is_empty());
}

#[tokio::test]
async fn stale_reverse_entry_is_evicted_without_a_probe() {
    let path = scratch_registry("tunnelbox-rs-reg-reverse");
    let store = JsonFileStore::new(path.clone());
    let sync_b = sync_at(&path);

    let mut stale = foreign_entry("p-rev-stale", "sibling-1", 0);
    stale.topology = Topology::Reverse;
    stale.last_seen = Utc::now() - chrono::Duration::seconds(600);

    let mut fresh = foreign_entry("p-rev-fresh", "sibling-2", 0);
    fresh.topology = Topology::Reverse;

    store.save_entries(vec![stale, fresh]).await.unwrap();

    sync_b.sync_with_probe().await.unwrap();
    let remaining = store.get_entries().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].profile_id, "p-rev-fresh");
}

#[tokio::test]
async fn fast_poll_reinserts_own_missing_entries() {
    let path = scratch_registry("tunnelbox-rs-reg-selfheal");
    let store = JsonFileStore::new(path.clone());

    // Echo target so the managed tunnel is a real listener.
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_port = echo.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = echo.accept().await else { break };
            tokio::spawn(async move {
                let (mut read, mut write) = sock.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });

    let manager = manager();
    let sync = RegistrySync::new(Arc::new(JsonFileStore::new(path.clone())), manager.clone());

    let profile = TunnelProfile {
        id: "p-heal".into(),
        name: String::new(),
        topology: Topology::Local,
        local_port: 0,
        remote_host: "127.0.0.1".into(),
        remote_port: echo_port,
        remote_bind_addr: None,
        local_target_host: None,
        local_target_port: None,
        connection_mode: None,
        server_id: Some("srv".into()),
        auto_start: false,
    };
    let server = TargetServer {
        id: "srv".into(),
        name: String::new(),
        host: "127.0.0.1".into(),
        port: 22,
        username: "tester".into(),
        multiplexing: None,
    };
    let tunnel = manager
        .start(&profile, &server, StartOptions::default())
        .await
        .unwrap();
    sync.register_tunnel(&tunnel).await.unwrap();
    assert_eq!(store.get_entries().await.unwrap().len(), 1);

    // External reset wipes the registry.
    store.save_entries(Vec::new()).await.unwrap();

    sync.sync_now().await.unwrap();
    let healed = store.get_entries().await.unwrap();
    assert_eq!(healed.len(), 1);
    assert_eq!(healed[0].profile_id, "p-heal");
    assert_eq!(healed[0].session_id, sync.session_id());
}

#[tokio::test]
async fn foreign_set_is_republished_only_on_change() {
    let path = scratch_registry("tunnelbox-rs-reg-publish");
    let sync_a = sync_at(&path);
    let sync_b = sync_at(&path);
    let mut remote = sync_b.subscribe_remote();

    // Live listener so the entry survives future probes.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    sync_a
        .register_tunnel(&active_tunnel("p-pub", port))
        .await
        .unwrap();

    sync_b.sync_now().await.unwrap();
    assert!(remote.has_changed().unwrap());
    let published = remote.borrow_and_update().clone();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].profile_id, "p-pub");

    // Nothing changed: no republish.
    sync_b.sync_now().await.unwrap();
    assert!(!remote.has_changed().unwrap());

    // Connectivity check stays truthful while the listener lives.
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_ok());
}
