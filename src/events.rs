use crate::manager::ActiveTunnel;

/// Lifecycle and traffic notifications emitted by the tunnel manager.
///
/// `Traffic` is coalesced: at most one event per tunnel within the
/// notification window, always carrying the latest cumulative totals.
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    Started {
        tunnel: ActiveTunnel,
    },
    Traffic {
        tunnel_id: String,
        bytes_in: u64,
        bytes_out: u64,
    },
    Stopped {
        tunnel_id: String,
        profile_id: String,
    },
    Error {
        tunnel_id: Option<String>,
        profile_id: String,
        message: String,
    },
}

/// Per-target notifications emitted by the connection pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    Connected { target_id: String },
    Disconnected { target_id: String },
}
