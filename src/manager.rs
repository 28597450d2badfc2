use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{ConnectionMode, TargetServer, Topology, TunnelProfile};
use crate::events::TunnelEvent;
use crate::pool::{ConnectionPool, PooledSession};
use crate::socks5;
use crate::traffic::TrafficCounters;
use crate::transport::{ChannelStream, IncomingChannel, TransportError};

/// Coalescing window for `Traffic` notifications.
const TRAFFIC_NOTIFY_WINDOW: Duration = Duration::from_millis(300);

const PIPE_BUF_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub connection_mode: Option<ConnectionMode>,
}

/// Snapshot of one running tunnel. Byte counters are read at snapshot time
/// and always current; the `Traffic` event stream is the coalesced view.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveTunnel {
    pub id: String,
    pub profile_id: String,
    pub server_id: String,
    pub topology: Topology,
    pub connection_mode: ConnectionMode,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub remote_bind_addr: Option<String>,
    pub local_target: Option<String>,
    pub started_at: DateTime<Utc>,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[derive(Debug, Clone, Copy)]
enum ConnKind {
    Local,
    Dynamic,
}

struct ReverseBinding {
    bind_addr: String,
    bind_port: u16,
}

struct TunnelRuntime {
    tunnel_id: String,
    profile: TunnelProfile,
    server: TargetServer,
    mode: ConnectionMode,
    started_at: DateTime<Utc>,
    local_port: u16,
    remote_host: String,
    remote_port: u16,
    local_target: Option<String>,
    reverse: Option<ReverseBinding>,
    counters: TrafficCounters,
    stopping: AtomicBool,
    next_conn: AtomicU64,
    conns: StdMutex<HashMap<u64, JoinHandle<()>>>,
    listener_task: StdMutex<Option<JoinHandle<()>>>,
    watcher_task: StdMutex<Option<JoinHandle<()>>>,
    shared_lease: StdMutex<Option<PooledSession>>,
    traffic_pending: StdMutex<Option<JoinHandle<()>>>,
    traffic_scheduled: AtomicBool,
}

impl TunnelRuntime {
    fn snapshot(&self) -> ActiveTunnel {
        let traffic = self.counters.snapshot();
        ActiveTunnel {
            id: self.tunnel_id.clone(),
            profile_id: self.profile.id.clone(),
            server_id: self.server.id.clone(),
            topology: self.profile.topology,
            connection_mode: self.mode,
            local_port: self.local_port,
            remote_host: self.remote_host.clone(),
            remote_port: self.remote_port,
            remote_bind_addr: self.reverse.as_ref().map(|r| r.bind_addr.clone()),
            local_target: self.local_target.clone(),
            started_at: self.started_at,
            bytes_in: traffic.bytes_in,
            bytes_out: traffic.bytes_out,
        }
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

struct ManagerShared {
    pool: ConnectionPool,
    default_mode: ConnectionMode,
    active: RwLock<HashMap<String, Arc<TunnelRuntime>>>,
    events: broadcast::Sender<TunnelEvent>,
}

/// Runs the per-topology tunnel state machines and moves the bytes.
#[derive(Clone)]
pub struct TunnelManager {
    inner: Arc<ManagerShared>,
}

impl TunnelManager {
    pub fn new(pool: ConnectionPool, default_mode: ConnectionMode) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(ManagerShared {
                pool,
                default_mode,
                active: RwLock::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.inner.events.subscribe()
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    /// Start a tunnel for `profile`. Starting an already-running profile
    /// returns the existing tunnel unchanged.
    pub async fn start(
        &self,
        profile: &TunnelProfile,
        server: &TargetServer,
        opts: StartOptions,
    ) -> Result<ActiveTunnel> {
        if let Some(existing) = self.inner.active.read().await.get(&profile.id) {
            return Ok(existing.snapshot());
        }
        let mode = profile.resolved_mode(self.inner.default_mode, opts.connection_mode);
        match profile.topology {
            Topology::Local => {
                self.start_listening(profile, server, mode, ConnKind::Local).await
            }
            Topology::Dynamic => {
                self.start_listening(profile, server, mode, ConnKind::Dynamic).await
            }
            Topology::Reverse => self.start_reverse(profile, server).await,
        }
    }

    /// Stop by runtime tunnel id. Removes the tunnel from the active index
    /// before any asynchronous teardown; unknown ids are a no-op.
    pub async fn stop(&self, tunnel_id: &str) {
        let runtime = {
            let mut active = self.inner.active.write().await;
            let key = active
                .iter()
                .find(|(_, rt)| rt.tunnel_id == tunnel_id)
                .map(|(profile_id, _)| profile_id.clone());
            key.and_then(|k| active.remove(&k))
        };
        if let Some(runtime) = runtime {
            self.teardown(runtime, true).await;
        }
    }

    pub async fn stop_all(&self) {
        let runtimes: Vec<Arc<TunnelRuntime>> = {
            let mut active = self.inner.active.write().await;
            active.drain().map(|(_, rt)| rt).collect()
        };
        futures_util::future::join_all(
            runtimes
                .into_iter()
                .map(|rt| self.teardown(rt, true)),
        )
        .await;
    }

    pub async fn list_active(&self) -> Vec<ActiveTunnel> {
        self.inner
            .active
            .read()
            .await
            .values()
            .map(|rt| rt.snapshot())
            .collect()
    }

    pub async fn find(&self, profile_id: &str) -> Option<ActiveTunnel> {
        self.inner
            .active
            .read()
            .await
            .get(profile_id)
            .map(|rt| rt.snapshot())
    }

    async fn start_listening(
        &self,
        profile: &TunnelProfile,
        server: &TargetServer,
        mode: ConnectionMode,
        kind: ConnKind,
    ) -> Result<ActiveTunnel> {
        let listener = match TcpListener::bind(("127.0.0.1", profile.local_port)).await {
            Ok(listener) => listener,
            Err(err) => {
                let msg = format!(
                    "bind 127.0.0.1:{} failed: {err}",
                    profile.local_port
                );
                self.emit_error(None, &profile.id, &msg);
                anyhow::bail!(msg);
            }
        };
        let local_port = listener.local_addr()?.port();

        // Shared mode authenticates eagerly so interactive prompts happen
        // once, at start, instead of on the first client connection.
        let mut shared_lease = None;
        if mode == ConnectionMode::Shared {
            match self.inner.pool.connect(server).await {
                Ok(lease) => shared_lease = Some(lease),
                Err(err) => {
                    drop(listener);
                    let msg =
                        format!("transport connect to {} failed: {err}", server.id);
                    self.emit_error(None, &profile.id, &msg);
                    anyhow::bail!(msg);
                }
            }
        }

        let (remote_host, remote_port) = match kind {
            ConnKind::Local => (profile.remote_host.clone(), profile.remote_port),
            // Dynamic resolves destinations per connection.
            ConnKind::Dynamic => (String::new(), 0),
        };
        let runtime = Arc::new(TunnelRuntime {
            tunnel_id: Uuid::new_v4().to_string(),
            profile: profile.clone(),
            server: server.clone(),
            mode,
            started_at: Utc::now(),
            local_port,
            remote_host,
            remote_port,
            local_target: None,
            reverse: None,
            counters: TrafficCounters::default(),
            stopping: AtomicBool::new(false),
            next_conn: AtomicU64::new(0),
            conns: StdMutex::new(HashMap::new()),
            listener_task: StdMutex::new(None),
            watcher_task: StdMutex::new(None),
            shared_lease: StdMutex::new(None),
            traffic_pending: StdMutex::new(None),
            traffic_scheduled: AtomicBool::new(false),
        });
        self.install_shared_lease(&runtime, shared_lease);

        let mgr = self.clone();
        let rt = runtime.clone();
        let accept = tokio::spawn(async move { mgr.accept_loop(rt, listener, kind).await });
        *runtime.listener_task.lock().unwrap() = Some(accept);

        self.commit(runtime).await
    }

    async fn start_reverse(
        &self,
        profile: &TunnelProfile,
        server: &TargetServer,
    ) -> Result<ActiveTunnel> {
        // Reverse always rides a shared session, whatever the profile says.
        let lease = match self.inner.pool.connect(server).await {
            Ok(lease) => lease,
            Err(err) => {
                let msg = format!("transport connect to {} failed: {err}", server.id);
                self.emit_error(None, &profile.id, &msg);
                anyhow::bail!(msg);
            }
        };

        let bind_addr = profile
            .remote_bind_addr
            .clone()
            .unwrap_or_default();
        let allocated = match lease
            .request_remote_forward(&bind_addr, profile.remote_port)
            .await
        {
            Ok(port) => port,
            Err(err) => {
                let msg = format!(
                    "remote forward {}:{} failed: {err}",
                    bind_addr, profile.remote_port
                );
                self.emit_error(None, &profile.id, &msg);
                anyhow::bail!(msg);
            }
        };
        let mut incoming = lease.incoming_on_port(allocated).await;

        let (target_host, target_port) = profile.local_target();
        let effective_bind = if bind_addr.is_empty() {
            "127.0.0.1".to_string()
        } else {
            bind_addr
        };
        let runtime = Arc::new(TunnelRuntime {
            tunnel_id: Uuid::new_v4().to_string(),
            profile: profile.clone(),
            server: server.clone(),
            mode: ConnectionMode::Shared,
            started_at: Utc::now(),
            local_port: target_port,
            remote_host: effective_bind.clone(),
            remote_port: allocated,
            local_target: Some(format!("{target_host}:{target_port}")),
            reverse: Some(ReverseBinding {
                bind_addr: effective_bind,
                bind_port: allocated,
            }),
            counters: TrafficCounters::default(),
            stopping: AtomicBool::new(false),
            next_conn: AtomicU64::new(0),
            conns: StdMutex::new(HashMap::new()),
            listener_task: StdMutex::new(None),
            watcher_task: StdMutex::new(None),
            shared_lease: StdMutex::new(None),
            traffic_pending: StdMutex::new(None),
            traffic_scheduled: AtomicBool::new(false),
        });
        self.install_shared_lease(&runtime, Some(lease));

        let mgr = self.clone();
        let rt = runtime.clone();
        let task = tokio::spawn(async move {
            while let Some(offered) = incoming.recv().await {
                if rt.is_stopping() {
                    break;
                }
                let mgr2 = mgr.clone();
                let rt2 = rt.clone();
                mgr.spawn_conn(&rt, async move {
                    mgr2.handle_reverse_conn(rt2, offered).await;
                });
            }
        });
        *runtime.listener_task.lock().unwrap() = Some(task);

        self.commit(runtime).await
    }

    /// Insert into the active index, or lose the race to a concurrent start
    /// for the same profile and quietly dismantle the newcomer.
    async fn commit(&self, runtime: Arc<TunnelRuntime>) -> Result<ActiveTunnel> {
        let existing = {
            let mut active = self.inner.active.write().await;
            match active.get(&runtime.profile.id) {
                Some(existing) => Some(existing.clone()),
                None => {
                    active.insert(runtime.profile.id.clone(), runtime.clone());
                    None
                }
            }
        };
        if let Some(existing) = existing {
            self.teardown(runtime, false).await;
            return Ok(existing.snapshot());
        }
        let snapshot = runtime.snapshot();
        crate::logging::info_kv(
            "tunnel started",
            &[
                ("profile", runtime.profile.id.as_str()),
                ("topology", &runtime.profile.topology.to_string()),
                ("mode", &runtime.mode.to_string()),
                ("local_port", &runtime.local_port.to_string()),
                ("remote_port", &runtime.remote_port.to_string()),
            ],
        );
        let _ = self.inner.events.send(TunnelEvent::Started {
            tunnel: snapshot.clone(),
        });
        Ok(snapshot)
    }

    async fn teardown(&self, runtime: Arc<TunnelRuntime>, announce: bool) {
        runtime.stopping.store(true, Ordering::SeqCst);

        // Cancel the remote forward before dropping the lease; the transport
        // may already be gone, which is fine.
        let lease = runtime.shared_lease.lock().unwrap().take();
        if let Some(lease) = lease {
            if let Some(reverse) = &runtime.reverse {
                if let Err(err) = lease
                    .cancel_remote_forward(&reverse.bind_addr, reverse.bind_port)
                    .await
                {
                    crate::logging::warn(format!(
                        "cancel remote forward {}:{} failed (ignored): {err}",
                        reverse.bind_addr, reverse.bind_port
                    ));
                }
            }
            drop(lease);
        }

        if let Some(task) = runtime.watcher_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(task) = runtime.listener_task.lock().unwrap().take() {
            task.abort();
        }
        let conns: Vec<JoinHandle<()>> = runtime
            .conns
            .lock()
            .unwrap()
            .drain()
            .map(|(_, task)| task)
            .collect();
        for task in &conns {
            task.abort();
        }
        for task in conns {
            let _ = task.await;
        }

        self.flush_traffic(&runtime);
        if announce {
            crate::logging::info_kv(
                "tunnel stopped",
                &[
                    ("profile", runtime.profile.id.as_str()),
                    ("tunnel", runtime.tunnel_id.as_str()),
                ],
            );
            let _ = self.inner.events.send(TunnelEvent::Stopped {
                tunnel_id: runtime.tunnel_id.clone(),
                profile_id: runtime.profile.id.clone(),
            });
        }
    }

    fn install_shared_lease(&self, runtime: &Arc<TunnelRuntime>, lease: Option<PooledSession>) {
        let Some(lease) = lease else { return };
        let mut closed = lease.closed();
        *runtime.shared_lease.lock().unwrap() = Some(lease);

        // An unexpected close is reported but does not stop the tunnel:
        // in-flight connections fail individually and later ones trigger a
        // fresh pooled session.
        let mgr = self.clone();
        let rt = runtime.clone();
        let watcher = tokio::spawn(async move {
            let _ = closed.recv().await;
            if !rt.is_stopping() {
                mgr.emit_error(
                    Some(&rt.tunnel_id),
                    &rt.profile.id,
                    "shared transport session closed unexpectedly",
                );
            }
        });
        *runtime.watcher_task.lock().unwrap() = Some(watcher);
    }

    async fn accept_loop(&self, runtime: Arc<TunnelRuntime>, listener: TcpListener, kind: ConnKind) {
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    if runtime.is_stopping() {
                        break;
                    }
                    let _ = stream.set_nodelay(true);
                    let mgr = self.clone();
                    let rt = runtime.clone();
                    self.spawn_conn(&runtime, async move {
                        match kind {
                            ConnKind::Local => mgr.handle_local_conn(rt, stream).await,
                            ConnKind::Dynamic => mgr.handle_dynamic_conn(rt, stream).await,
                        }
                    });
                }
                Err(err) => {
                    if runtime.is_stopping() {
                        break;
                    }
                    crate::logging::warn(format!(
                        "accept failed on tunnel {}: {err}",
                        runtime.tunnel_id
                    ));
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_local_conn(&self, runtime: Arc<TunnelRuntime>, stream: TcpStream) {
        let lease = match self.lease_for(&runtime).await {
            Ok(lease) => lease,
            Err(err) => {
                self.conn_error(&runtime, format!("transport connect failed: {err}"));
                return;
            }
        };
        let channel = match lease
            .open_direct_channel(&runtime.remote_host, runtime.remote_port)
            .await
        {
            Ok(channel) => channel,
            Err(err) => {
                self.channel_failure(
                    &runtime,
                    &lease,
                    &runtime.remote_host,
                    runtime.remote_port,
                    &err,
                );
                return;
            }
        };
        self.pipe(&runtime, stream, channel).await;
    }

    async fn handle_dynamic_conn(&self, runtime: Arc<TunnelRuntime>, mut stream: TcpStream) {
        let request = match socks5::handshake(&mut stream, socks5::HANDSHAKE_TIMEOUT).await {
            Ok(request) => request,
            Err(socks5::Socks5Error::Aborted) => {
                // Probe connections and dead clients land here; expected.
                return;
            }
            Err(err) => {
                crate::logging::info_kv(
                    "socks5 handshake rejected",
                    &[
                        ("tunnel", runtime.tunnel_id.as_str()),
                        ("error", &err.to_string()),
                    ],
                );
                return;
            }
        };

        let lease = match self.lease_for(&runtime).await {
            Ok(lease) => lease,
            Err(err) => {
                let _ = socks5::reply_failure(&mut stream, socks5::reply::GENERAL_FAILURE).await;
                self.conn_error(&runtime, format!("transport connect failed: {err}"));
                return;
            }
        };
        let channel = match lease
            .open_direct_channel(&request.host, request.port)
            .await
        {
            Ok(channel) => channel,
            Err(err) => {
                let _ = socks5::reply_failure(&mut stream, socks5::reply::HOST_UNREACHABLE).await;
                self.channel_failure(&runtime, &lease, &request.host, request.port, &err);
                return;
            }
        };
        if socks5::reply_success(&mut stream).await.is_err() {
            return;
        }
        self.pipe(&runtime, stream, channel).await;
    }

    async fn handle_reverse_conn(&self, runtime: Arc<TunnelRuntime>, offered: IncomingChannel) {
        let (host, port) = runtime.profile.local_target();
        let local = match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => stream,
            Err(err) => {
                self.conn_error(
                    &runtime,
                    format!("local target {host}:{port} unreachable: {err}"),
                );
                return;
            }
        };
        let _ = local.set_nodelay(true);
        self.pipe(&runtime, local, offered.stream).await;
    }

    async fn lease_for(&self, runtime: &Arc<TunnelRuntime>) -> Result<PooledSession, TransportError> {
        match runtime.mode {
            ConnectionMode::Shared => self.inner.pool.connect(&runtime.server).await,
            ConnectionMode::Isolated => self.inner.pool.connect_isolated(&runtime.server).await,
        }
    }

    fn channel_failure(
        &self,
        runtime: &Arc<TunnelRuntime>,
        lease: &PooledSession,
        host: &str,
        port: u16,
        err: &TransportError,
    ) {
        // If the shared session itself is implicated, invalidate the pool
        // entry so the next attempt re-creates it.
        if lease.is_pooled()
            && (matches!(err, TransportError::SessionClosed) || lease.is_closed())
        {
            let target = lease.target_id().unwrap_or(runtime.server.id.as_str());
            self.inner.pool.invalidate(target);
        }
        self.conn_error(
            runtime,
            format!("channel open to {host}:{port} failed: {err}"),
        );
    }

    /// Pump bytes both ways until either side closes. Counters are
    /// channel-centric: reads off the channel count as `in`, reads off the
    /// local socket count as `out`.
    async fn pipe<L>(&self, runtime: &Arc<TunnelRuntime>, local: L, channel: ChannelStream)
    where
        L: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut local_read, mut local_write) = tokio::io::split(local);
        let (mut chan_read, mut chan_write) = tokio::io::split(channel);

        let outbound = async {
            let mut buf = vec![0u8; PIPE_BUF_SIZE];
            loop {
                let n = match local_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if chan_write.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                runtime.counters.add_out(n as u64);
                self.schedule_traffic(runtime);
            }
            let _ = chan_write.shutdown().await;
        };
        let inbound = async {
            let mut buf = vec![0u8; PIPE_BUF_SIZE];
            loop {
                let n = match chan_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if local_write.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                runtime.counters.add_in(n as u64);
                self.schedule_traffic(runtime);
            }
            let _ = local_write.shutdown().await;
        };
        tokio::join!(outbound, inbound);
    }

    /// At most one pending `Traffic` notification per tunnel; the event that
    /// eventually fires carries the cumulative totals at that moment.
    fn schedule_traffic(&self, runtime: &Arc<TunnelRuntime>) {
        if runtime.traffic_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let mgr = self.clone();
        let rt = runtime.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(TRAFFIC_NOTIFY_WINDOW).await;
            if rt.is_stopping() {
                return;
            }
            rt.traffic_scheduled.store(false, Ordering::Release);
            let traffic = rt.counters.snapshot();
            let _ = mgr.inner.events.send(TunnelEvent::Traffic {
                tunnel_id: rt.tunnel_id.clone(),
                bytes_in: traffic.bytes_in,
                bytes_out: traffic.bytes_out,
            });
            rt.traffic_pending.lock().unwrap().take();
        });
        *runtime.traffic_pending.lock().unwrap() = Some(task);
    }

    fn flush_traffic(&self, runtime: &Arc<TunnelRuntime>) {
        if let Some(task) = runtime.traffic_pending.lock().unwrap().take() {
            task.abort();
        }
        if runtime.traffic_scheduled.swap(false, Ordering::AcqRel) {
            let traffic = runtime.counters.snapshot();
            let _ = self.inner.events.send(TunnelEvent::Traffic {
                tunnel_id: runtime.tunnel_id.clone(),
                bytes_in: traffic.bytes_in,
                bytes_out: traffic.bytes_out,
            });
        }
    }

    fn spawn_conn<F>(&self, runtime: &Arc<TunnelRuntime>, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let id = runtime.next_conn.fetch_add(1, Ordering::SeqCst);
        let rt = runtime.clone();
        let task = tokio::spawn(async move {
            fut.await;
            rt.conns.lock().unwrap().remove(&id);
        });
        let mut conns = runtime.conns.lock().unwrap();
        if !task.is_finished() {
            conns.insert(id, task);
        }
    }

    fn conn_error(&self, runtime: &Arc<TunnelRuntime>, message: String) {
        if runtime.is_stopping() {
            return;
        }
        self.emit_error(Some(&runtime.tunnel_id), &runtime.profile.id, &message);
    }

    fn emit_error(&self, tunnel_id: Option<&str>, profile_id: &str, message: &str) {
        crate::logging::error(format!("tunnel {profile_id}: {message}"));
        let _ = self.inner.events.send(TunnelEvent::Error {
            tunnel_id: tunnel_id.map(|s| s.to_string()),
            profile_id: profile_id.to_string(),
            message: message.to_string(),
        });
    }
}
