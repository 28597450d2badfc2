use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as TokioMutex, Notify};
use uuid::Uuid;

use crate::config::{ConnectionMode, Topology};
use crate::manager::{ActiveTunnel, TunnelManager};

pub const FAST_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const PROBE_INTERVAL: Duration = Duration::from_secs(60);

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
/// Own heartbeats are re-stamped during fast poll once this old.
const HEARTBEAT_REFRESH_SECS: i64 = 15;
/// Reverse entries with a heartbeat older than this are judged dead.
const HEARTBEAT_STALE_SECS: i64 = 120;

/// One sibling process's active tunnel, as persisted in the shared registry.
/// Entries are partitioned by `session_id`: a process only ever rewrites its
/// own partition, so whole-list last-writer-wins stays safe in practice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub profile_id: String,
    pub server_id: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub connection_mode: ConnectionMode,
    pub topology: Topology,
    #[serde(default)]
    pub remote_bind_addr: Option<String>,
    #[serde(default)]
    pub local_target: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub session_id: String,
}

impl RegistryEntry {
    pub fn from_active(tunnel: &ActiveTunnel, session_id: &str) -> Self {
        Self {
            profile_id: tunnel.profile_id.clone(),
            server_id: tunnel.server_id.clone(),
            local_port: tunnel.local_port,
            remote_host: tunnel.remote_host.clone(),
            remote_port: tunnel.remote_port,
            connection_mode: tunnel.connection_mode,
            topology: tunnel.topology,
            remote_bind_addr: tunnel.remote_bind_addr.clone(),
            local_target: tunnel.local_target.clone(),
            started_at: tunnel.started_at,
            last_seen: Utc::now(),
            session_id: session_id.to_string(),
        }
    }
}

/// Whole-list replace semantics; the store itself carries no merge logic.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn get_entries(&self) -> Result<Vec<RegistryEntry>>;
    async fn save_entries(&self, entries: Vec<RegistryEntry>) -> Result<()>;
}

/// JSON file store shared by sibling processes. Writes go through a temp
/// file and rename so a sibling never reads a half-written list.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl RegistryStore for JsonFileStore {
    async fn get_entries(&self) -> Result<Vec<RegistryEntry>> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.path.display()))
            }
        };
        serde_json::from_str(&data).with_context(|| format!("parse {}", self.path.display()))
    }

    async fn save_entries(&self, entries: Vec<RegistryEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let data = serde_json::to_string_pretty(&entries)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("rename into {}", self.path.display()))?;
        Ok(())
    }
}

struct SyncShared {
    store: Arc<dyn RegistryStore>,
    manager: TunnelManager,
    session_id: String,
    remote_tx: watch::Sender<Vec<RegistryEntry>>,
    last_published: StdMutex<Vec<RegistryEntry>>,
    // Serializes this process's read-modify-write cycles on the store.
    write_gate: TokioMutex<()>,
}

/// Best-effort coordinator across sibling processes sharing one registry
/// store. No shared memory, no sockets between siblings: everyone polls,
/// probes, and rewrites its own partition.
#[derive(Clone)]
pub struct RegistrySync {
    inner: Arc<SyncShared>,
}

impl RegistrySync {
    pub fn new(store: Arc<dyn RegistryStore>, manager: TunnelManager) -> Self {
        let (remote_tx, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(SyncShared {
                store,
                manager,
                session_id: Uuid::new_v4().to_string(),
                remote_tx,
                last_published: StdMutex::new(Vec::new()),
                write_gate: TokioMutex::new(()),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Observable list of foreign tunnels, republished only on change.
    pub fn subscribe_remote(&self) -> watch::Receiver<Vec<RegistryEntry>> {
        self.inner.remote_tx.subscribe()
    }

    pub fn remote_tunnels(&self) -> Vec<RegistryEntry> {
        self.inner.remote_tx.borrow().clone()
    }

    /// Spawn the fast-poll and probe-reconciliation loops; both exit when
    /// `shutdown` fires.
    pub fn initialize(&self, shutdown: Arc<Notify>) {
        let sync = self.clone();
        let sd = shutdown.clone();
        tokio::spawn(async move {
            loop {
                if let Err(err) = sync.sync_now().await {
                    crate::logging::warn(format!("registry fast poll failed: {err:#}"));
                }
                tokio::select! {
                    _ = tokio::time::sleep(FAST_POLL_INTERVAL) => {}
                    _ = sd.notified() => break,
                }
            }
        });

        let sync = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(PROBE_INTERVAL) => {}
                    _ = shutdown.notified() => break,
                }
                if let Err(err) = sync.sync_with_probe().await {
                    crate::logging::warn(format!("registry reconciliation failed: {err:#}"));
                }
            }
        });
    }

    pub async fn register_tunnel(&self, tunnel: &ActiveTunnel) -> Result<()> {
        let _gate = self.inner.write_gate.lock().await;
        let mut entries = self.inner.store.get_entries().await?;
        entries.retain(|e| {
            !(e.session_id == self.inner.session_id && e.profile_id == tunnel.profile_id)
        });
        entries.push(RegistryEntry::from_active(tunnel, &self.inner.session_id));
        self.inner.store.save_entries(entries.clone()).await?;
        self.publish_foreign(&entries);
        Ok(())
    }

    pub async fn unregister_tunnel(&self, profile_id: &str) -> Result<()> {
        let _gate = self.inner.write_gate.lock().await;
        let mut entries = self.inner.store.get_entries().await?;
        let before = entries.len();
        entries.retain(|e| {
            !(e.session_id == self.inner.session_id && e.profile_id == profile_id)
        });
        if entries.len() != before {
            self.inner.store.save_entries(entries.clone()).await?;
        }
        self.publish_foreign(&entries);
        Ok(())
    }

    /// A live foreign entry matching the profile id or the local port, if
    /// any. Liveness is a TCP probe for listener topologies and heartbeat
    /// freshness for reverse (which has no local listener to probe).
    pub async fn check_remote_ownership(
        &self,
        profile_id: &str,
        local_port: u16,
    ) -> Result<Option<RegistryEntry>> {
        let entries = self.inner.store.get_entries().await?;
        for entry in entries
            .iter()
            .filter(|e| e.session_id != self.inner.session_id)
        {
            let matches = entry.profile_id == profile_id
                || (local_port != 0 && entry.local_port == local_port);
            if matches && entry_alive(entry).await {
                return Ok(Some(entry.clone()));
            }
        }
        Ok(None)
    }

    /// Fast poll: republish the foreign set when it changed, refresh own
    /// heartbeats, and self-heal entries lost to an external registry reset.
    pub async fn sync_now(&self) -> Result<()> {
        let _gate = self.inner.write_gate.lock().await;
        let mut entries = self.inner.store.get_entries().await?;
        let mut dirty = false;

        let own_active = self.inner.manager.list_active().await;
        for tunnel in &own_active {
            let found = entries.iter_mut().find(|e| {
                e.session_id == self.inner.session_id && e.profile_id == tunnel.profile_id
            });
            match found {
                Some(entry) => {
                    let age = Utc::now() - entry.last_seen;
                    if age.num_seconds() >= HEARTBEAT_REFRESH_SECS {
                        entry.last_seen = Utc::now();
                        dirty = true;
                    }
                }
                None => {
                    crate::logging::info_kv(
                        "re-registering tunnel missing from registry",
                        &[("profile", tunnel.profile_id.as_str())],
                    );
                    entries.push(RegistryEntry::from_active(tunnel, &self.inner.session_id));
                    dirty = true;
                }
            }
        }

        // Drop own entries whose tunnel no longer runs (a lost unregister).
        let before = entries.len();
        entries.retain(|e| {
            e.session_id != self.inner.session_id
                || own_active.iter().any(|t| t.profile_id == e.profile_id)
        });
        dirty |= entries.len() != before;

        if dirty {
            self.inner.store.save_entries(entries.clone()).await?;
        }
        self.publish_foreign(&entries);
        Ok(())
    }

    /// Slow reconciliation: probe every foreign entry concurrently and
    /// remove the ones found dead.
    pub async fn sync_with_probe(&self) -> Result<()> {
        let _gate = self.inner.write_gate.lock().await;
        let entries = self.inner.store.get_entries().await?;

        let foreign: Vec<&RegistryEntry> = entries
            .iter()
            .filter(|e| e.session_id != self.inner.session_id)
            .collect();
        let alive =
            futures_util::future::join_all(foreign.iter().map(|e| entry_alive(e))).await;
        let dead: Vec<(String, String)> = foreign
            .iter()
            .zip(alive)
            .filter(|(_, alive)| !alive)
            .map(|(e, _)| (e.session_id.clone(), e.profile_id.clone()))
            .collect();

        if dead.is_empty() {
            self.publish_foreign(&entries);
            return Ok(());
        }

        crate::logging::info_kv(
            "evicting stale registry entries",
            &[("count", &dead.len().to_string())],
        );
        let mut kept = entries;
        kept.retain(|e| {
            !dead
                .iter()
                .any(|(sid, pid)| &e.session_id == sid && &e.profile_id == pid)
        });
        self.inner.store.save_entries(kept.clone()).await?;
        self.publish_foreign(&kept);
        Ok(())
    }

    /// Remove everything this process registered; used on shutdown.
    pub async fn cleanup_own_entries(&self) -> Result<()> {
        let _gate = self.inner.write_gate.lock().await;
        let mut entries = self.inner.store.get_entries().await?;
        let before = entries.len();
        entries.retain(|e| e.session_id != self.inner.session_id);
        if entries.len() != before {
            self.inner.store.save_entries(entries).await?;
        }
        Ok(())
    }

    fn publish_foreign(&self, entries: &[RegistryEntry]) {
        let mut foreign: Vec<RegistryEntry> = entries
            .iter()
            .filter(|e| e.session_id != self.inner.session_id)
            .cloned()
            .collect();
        foreign.sort_by(|a, b| {
            (&a.session_id, &a.profile_id).cmp(&(&b.session_id, &b.profile_id))
        });
        let mut last = self.inner.last_published.lock().unwrap();
        if *last != foreign {
            *last = foreign.clone();
            let _ = self.inner.remote_tx.send(foreign);
        }
    }
}

async fn entry_alive(entry: &RegistryEntry) -> bool {
    match entry.topology {
        Topology::Reverse => {
            let age = Utc::now() - entry.last_seen;
            age.num_seconds() < HEARTBEAT_STALE_SECS
        }
        Topology::Local | Topology::Dynamic => probe_port(entry.local_port).await,
    }
}

async fn probe_port(port: u16) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn scratch_store(name: &str) -> JsonFileStore {
        let tmp = env::temp_dir().join(name);
        let _ = std::fs::remove_dir_all(&tmp);
        std::fs::create_dir_all(&tmp).unwrap();
        JsonFileStore::new(tmp.join("registry.json"))
    }

    fn entry(profile: &str, session: &str, port: u16) -> RegistryEntry {
        RegistryEntry {
            profile_id: profile.into(),
            server_id: "srv".into(),
            local_port: port,
            remote_host: "db.internal".into(),
            remote_port: 5432,
            connection_mode: ConnectionMode::Shared,
            topology: Topology::Local,
            remote_bind_addr: None,
            local_target: None,
            started_at: Utc::now(),
            last_seen: Utc::now(),
            session_id: session.into(),
        }
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let store = scratch_store("tunnelbox-rs-registry-empty");
        assert!(store.get_entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_and_reload_round_trips() {
        let store = scratch_store("tunnelbox-rs-registry-roundtrip");
        let entries = vec![entry("p1", "s1", 15432), entry("p2", "s2", 1080)];
        store.save_entries(entries.clone()).await.unwrap();
        let loaded = store.get_entries().await.unwrap();
        assert_eq!(loaded, entries);
        // No temp file left behind.
        assert!(!store.path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn stale_reverse_entry_is_judged_dead() {
        let mut e = entry("p1", "s1", 0);
        e.topology = Topology::Reverse;
        e.last_seen = Utc::now() - chrono::Duration::seconds(HEARTBEAT_STALE_SECS + 10);
        assert!(!entry_alive(&e).await);

        e.last_seen = Utc::now();
        assert!(entry_alive(&e).await);
    }

    #[tokio::test]
    async fn dead_port_is_judged_dead() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let e = entry("p1", "s1", port);
        assert!(entry_alive(&e).await);

        drop(listener);
        assert!(!entry_alive(&e).await);
    }
}
