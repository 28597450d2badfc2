use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Which of the three forwarding topologies a profile describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    Local,
    Reverse,
    Dynamic,
}

impl std::fmt::Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topology::Local => write!(f, "local"),
            Topology::Reverse => write!(f, "reverse"),
            Topology::Dynamic => write!(f, "dynamic"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    Shared,
    Isolated,
}

impl std::fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionMode::Shared => write!(f, "shared"),
            ConnectionMode::Isolated => write!(f, "isolated"),
        }
    }
}

/// A remote endpoint the transport factory can authenticate against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetServer {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    /// Per-server override of the global multiplexing default.
    #[serde(default)]
    pub multiplexing: Option<bool>,
}

fn default_server_port() -> u16 {
    22
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelProfile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub topology: Topology,
    pub local_port: u16,
    #[serde(default)]
    pub remote_host: String,
    #[serde(default)]
    pub remote_port: u16,
    /// Reverse only: address the remote side binds. Empty means loopback.
    #[serde(default)]
    pub remote_bind_addr: Option<String>,
    /// Reverse only: where accepted remote connections are delivered locally.
    #[serde(default)]
    pub local_target_host: Option<String>,
    #[serde(default)]
    pub local_target_port: Option<u16>,
    #[serde(default)]
    pub connection_mode: Option<ConnectionMode>,
    #[serde(default)]
    pub server_id: Option<String>,
    /// Started by the daemon at boot.
    #[serde(default)]
    pub auto_start: bool,
}

impl TunnelProfile {
    /// Resolve the effective connection mode for a start request.
    /// Reverse tunnels always run shared regardless of profile or override.
    pub fn resolved_mode(
        &self,
        default_mode: ConnectionMode,
        override_mode: Option<ConnectionMode>,
    ) -> ConnectionMode {
        if self.topology == Topology::Reverse {
            return ConnectionMode::Shared;
        }
        override_mode
            .or(self.connection_mode)
            .unwrap_or(default_mode)
    }

    pub fn local_target(&self) -> (String, u16) {
        (
            self.local_target_host
                .clone()
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            self.local_target_port.unwrap_or(self.local_port),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_connection_mode")]
    pub connection_mode: ConnectionMode,
    #[serde(default = "default_multiplexing")]
    pub multiplexing: bool,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            connection_mode: default_connection_mode(),
            multiplexing: default_multiplexing(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

fn default_connection_mode() -> ConnectionMode {
    ConnectionMode::Shared
}

fn default_multiplexing() -> bool {
    true
}

fn default_idle_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub servers: Vec<TargetServer>,
    #[serde(default)]
    pub profiles: Vec<TunnelProfile>,
    #[serde(default)]
    pub defaults: Defaults,
    /// Shared registry file, one list per machine/user scope.
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,
    #[serde(default)]
    pub config_path: Option<PathBuf>,
}

pub fn default_registry_path() -> PathBuf {
    base_dir().join("registry.json")
}

pub fn default_log_file_path() -> PathBuf {
    base_dir().join("logs").join("tunnelbox.log")
}

fn base_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) if !home.is_empty() => PathBuf::from(home).join(".tunnelbox"),
        _ => std::env::temp_dir().join("tunnelbox"),
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut cfg: Config = serde_json::from_str(&data).context("parse config json")?;
        cfg.config_path = Some(path.to_path_buf());
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    fn normalize(&mut self) {
        for server in &mut self.servers {
            server.host = server.host.trim().to_string();
        }
        if self.registry_path.is_relative() {
            if let Some(base) = self.config_path.as_ref().and_then(|p| p.parent()) {
                self.registry_path = base.join(&self.registry_path);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if server.id.trim().is_empty() {
                anyhow::bail!("server with empty id");
            }
            if !seen.insert(&server.id) {
                anyhow::bail!("duplicate server id: {}", server.id);
            }
            if server.host.is_empty() {
                anyhow::bail!("server {} has empty host", server.id);
            }
        }

        let mut seen = std::collections::HashSet::new();
        for profile in &self.profiles {
            if profile.id.trim().is_empty() {
                anyhow::bail!("profile with empty id");
            }
            if !seen.insert(&profile.id) {
                anyhow::bail!("duplicate profile id: {}", profile.id);
            }
            if let Some(server_id) = &profile.server_id {
                if !self.servers.iter().any(|s| &s.id == server_id) {
                    anyhow::bail!(
                        "profile {} references unknown server {}",
                        profile.id,
                        server_id
                    );
                }
            }
            match profile.topology {
                Topology::Local => {
                    if profile.local_port == 0 {
                        anyhow::bail!("profile {} needs a nonzero local port", profile.id);
                    }
                    if profile.remote_host.is_empty() || profile.remote_port == 0 {
                        anyhow::bail!("profile {} needs a remote host and port", profile.id);
                    }
                }
                Topology::Dynamic => {
                    // Remote address/port are ignored for dynamic profiles.
                    if profile.local_port == 0 {
                        anyhow::bail!("profile {} needs a nonzero local port", profile.id);
                    }
                }
                Topology::Reverse => {
                    let (_, port) = profile.local_target();
                    if port == 0 {
                        anyhow::bail!("profile {} needs a local target port", profile.id);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn server(&self, id: &str) -> Option<&TargetServer> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn profile(&self, id: &str) -> Option<&TunnelProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs};

    fn write_config(name: &str, json: &str) -> PathBuf {
        let tmp = env::temp_dir().join(name);
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        let cfg_path = tmp.join("config.json");
        fs::write(&cfg_path, json).unwrap();
        cfg_path
    }

    #[test]
    fn load_config_and_resolve_lookups() {
        let cfg_path = write_config(
            "tunnelbox-rs-config-test",
            r#"{
                "servers": [
                    {"id": "srv1", "host": " bastion.example.com ", "port": 2222, "username": "alice"}
                ],
                "profiles": [
                    {"id": "p1", "topology": "local", "local_port": 15432,
                     "remote_host": "db.internal", "remote_port": 5432, "server_id": "srv1"}
                ],
                "registry_path": "registry.json"
            }"#,
        );

        let cfg = Config::load(&cfg_path).unwrap();
        assert_eq!(cfg.server("srv1").unwrap().host, "bastion.example.com");
        assert_eq!(cfg.profile("p1").unwrap().remote_port, 5432);
        assert!(cfg.registry_path.is_absolute());
        assert_eq!(cfg.defaults.connection_mode, ConnectionMode::Shared);
    }

    #[test]
    fn reject_duplicate_profile_id() {
        let cfg_path = write_config(
            "tunnelbox-rs-config-test-dup",
            r#"{
                "profiles": [
                    {"id": "p1", "topology": "dynamic", "local_port": 1080},
                    {"id": "p1", "topology": "dynamic", "local_port": 1081}
                ]
            }"#,
        );
        let err = Config::load(&cfg_path).unwrap_err();
        assert!(err.to_string().contains("duplicate profile id"));
    }

    #[test]
    fn reject_local_profile_without_remote() {
        let cfg_path = write_config(
            "tunnelbox-rs-config-test-noremote",
            r#"{
                "profiles": [
                    {"id": "p1", "topology": "local", "local_port": 8080}
                ]
            }"#,
        );
        let err = Config::load(&cfg_path).unwrap_err();
        assert!(err.to_string().contains("remote host"));
    }

    #[test]
    fn reverse_profiles_always_resolve_shared() {
        let profile = TunnelProfile {
            id: "r1".into(),
            name: String::new(),
            topology: Topology::Reverse,
            local_port: 0,
            remote_host: String::new(),
            remote_port: 0,
            remote_bind_addr: None,
            local_target_host: Some("127.0.0.1".into()),
            local_target_port: Some(3000),
            connection_mode: Some(ConnectionMode::Isolated),
            server_id: None,
            auto_start: false,
        };
        let mode = profile.resolved_mode(
            ConnectionMode::Isolated,
            Some(ConnectionMode::Isolated),
        );
        assert_eq!(mode, ConnectionMode::Shared);
    }
}
