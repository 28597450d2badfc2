use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;

use crate::config::Config;
use crate::events::TunnelEvent;
use crate::manager::{StartOptions, TunnelManager};
use crate::pool::{ConnectionPool, PoolSettings};
use crate::registry::{JsonFileStore, RegistrySync};
use crate::transport::TransportFactory;

#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    pub log_path: Option<PathBuf>,
}

/// Run the tunnel daemon on the current tokio runtime until `shutdown` is
/// notified: pool + manager + registry sync, with manager lifecycle events
/// bridged into the shared registry.
pub async fn run_daemon_with_shutdown(
    cfg: Config,
    factory: Arc<dyn TransportFactory>,
    opts: DaemonOptions,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let log_path = opts.log_path.unwrap_or_else(|| daemon_log_path(&cfg));
    crate::logging::init_log_file(&log_path)?;
    crate::logging::info(format!(
        "daemon start version={} config={} log={}",
        env!("CARGO_PKG_VERSION"),
        cfg.config_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        log_path.display()
    ));

    let pool = ConnectionPool::new(factory, PoolSettings::from_defaults(&cfg.defaults));
    let manager = TunnelManager::new(pool.clone(), cfg.defaults.connection_mode);
    let store = Arc::new(JsonFileStore::new(cfg.registry_path.clone()));
    let sync = RegistrySync::new(store, manager.clone());
    crate::logging::info_kv(
        "registry sync session",
        &[
            ("session_id", sync.session_id()),
            ("registry", &cfg.registry_path.display().to_string()),
        ],
    );

    let mut events = manager.subscribe();
    let bridge_sync = sync.clone();
    let bridge = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TunnelEvent::Started { tunnel }) => {
                    if let Err(err) = bridge_sync.register_tunnel(&tunnel).await {
                        crate::logging::warn(format!(
                            "register tunnel {} failed: {err:#}",
                            tunnel.profile_id
                        ));
                    }
                }
                Ok(TunnelEvent::Stopped { profile_id, .. }) => {
                    if let Err(err) = bridge_sync.unregister_tunnel(&profile_id).await {
                        crate::logging::warn(format!(
                            "unregister tunnel {profile_id} failed: {err:#}"
                        ));
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    sync.initialize(shutdown.clone());

    for profile in cfg.profiles.iter().filter(|p| p.auto_start) {
        let Some(server) = profile
            .server_id
            .as_deref()
            .and_then(|id| cfg.server(id))
        else {
            crate::logging::warn(format!(
                "auto-start profile {} has no target server, skipping",
                profile.id
            ));
            continue;
        };
        match sync
            .check_remote_ownership(&profile.id, profile.local_port)
            .await
        {
            Ok(Some(owner)) => {
                crate::logging::info_kv(
                    "auto-start skipped, tunnel owned by sibling process",
                    &[
                        ("profile", profile.id.as_str()),
                        ("owner_session", owner.session_id.as_str()),
                    ],
                );
                continue;
            }
            Ok(None) => {}
            Err(err) => {
                crate::logging::warn(format!("ownership check failed: {err:#}"));
            }
        }
        if let Err(err) = manager
            .start(profile, server, StartOptions::default())
            .await
        {
            crate::logging::error(format!(
                "auto-start of profile {} failed: {err:#}",
                profile.id
            ));
        }
    }

    shutdown.notified().await;
    crate::logging::info("daemon shutting down");
    manager.stop_all().await;
    if let Err(err) = sync.cleanup_own_entries().await {
        crate::logging::warn(format!("registry cleanup failed: {err:#}"));
    }
    pool.dispose().await;
    bridge.abort();
    Ok(())
}

fn daemon_log_path(cfg: &Config) -> PathBuf {
    if let Some(parent) = cfg.config_path.as_ref().and_then(|p| p.parent()) {
        return parent.join("logs").join("tunnelbox.log");
    }
    crate::config::default_log_file_path()
}
