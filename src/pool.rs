use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::RegexSet;
use tokio::sync::{broadcast, Mutex as TokioMutex};
use tokio::task::JoinHandle;

use crate::config::{Defaults, TargetServer};
use crate::events::PoolEvent;
use crate::transport::{
    open_reason, ChannelStream, IncomingChannel, TransportError, TransportFactory,
    TransportSession,
};

/// Hard cap on the idle-eviction timer regardless of configuration.
const IDLE_TIMEOUT_MAX: Duration = Duration::from_secs(3600);

/// Classifies a channel-open failure as exhaustion (retry on a private
/// session) versus a definitive rejection. Pluggable because the phrase
/// list is inherently server-specific.
pub type ExhaustionPolicy = Arc<dyn Fn(&TransportError) -> bool + Send + Sync>;

static EXHAUSTION_PHRASES: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)too many (sessions|channels|connections)",
        r"(?i)channel limit",
        r"(?i)resource (shortage|exhausted|temporarily unavailable)",
        r"(?i)no more sessions",
        r"(?i)administratively prohibited",
    ])
    .unwrap()
});

static DEFINITIVE_PHRASES: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([r"(?i)connection refused", r"(?i)unknown channel type"]).unwrap()
});

pub fn default_exhaustion_policy(err: &TransportError) -> bool {
    let TransportError::ChannelOpen { code, message } = err else {
        return false;
    };
    if DEFINITIVE_PHRASES.is_match(message) {
        return false;
    }
    matches!(
        *code,
        open_reason::ADMINISTRATIVELY_PROHIBITED | open_reason::RESOURCE_SHORTAGE
    ) || EXHAUSTION_PHRASES.is_match(message)
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub multiplexing: bool,
    pub idle_timeout: Duration,
}

impl PoolSettings {
    pub fn from_defaults(defaults: &Defaults) -> Self {
        Self {
            multiplexing: defaults.multiplexing,
            idle_timeout: Duration::from_secs(defaults.idle_timeout_secs),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_defaults(&Defaults::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Healthy,
    Unhealthy,
    Evicted,
}

struct EntryInner {
    state: EntryState,
    refs: usize,
    idle_timer: Option<JoinHandle<()>>,
}

/// One pool-owned shared session, keyed by target identity.
struct PoolEntry {
    target_id: String,
    session: Arc<dyn TransportSession>,
    inner: StdMutex<EntryInner>,
}

struct Slot {
    create_gate: TokioMutex<()>,
    entry: StdMutex<Option<Arc<PoolEntry>>>,
}

struct PoolShared {
    factory: Arc<dyn TransportFactory>,
    settings: PoolSettings,
    slots: StdMutex<HashMap<String, Arc<Slot>>>,
    events: broadcast::Sender<PoolEvent>,
    exhaustion: ExhaustionPolicy,
}

/// Owns at most one healthy shared transport session per target identity and
/// hands out reference-counted leases. Tunnels never close a shared session
/// directly; they drop their lease and the pool decides when to evict.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolShared>,
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn TransportFactory>, settings: PoolSettings) -> Self {
        Self::with_exhaustion_policy(factory, settings, Arc::new(default_exhaustion_policy))
    }

    pub fn with_exhaustion_policy(
        factory: Arc<dyn TransportFactory>,
        settings: PoolSettings,
        exhaustion: ExhaustionPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(PoolShared {
                factory,
                settings,
                slots: StdMutex::new(HashMap::new()),
                events,
                exhaustion,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    fn multiplexing_enabled(&self, server: &TargetServer) -> bool {
        server
            .multiplexing
            .unwrap_or(self.inner.settings.multiplexing)
    }

    /// Lease a session for `server`. With multiplexing enabled this finds or
    /// creates the shared pool entry; concurrent callers for one target share
    /// a single in-flight creation. With multiplexing disabled the lease
    /// wraps a private session owned by the caller.
    pub async fn connect(&self, server: &TargetServer) -> Result<PooledSession, TransportError> {
        if !self.multiplexing_enabled(server) {
            let session = self.inner.factory.connect(server).await?;
            return Ok(PooledSession::direct(session));
        }

        let slot = self.slot(&server.id);
        loop {
            if let Some(entry) = current_entry(&slot) {
                if try_acquire(&entry) {
                    return Ok(PooledSession::pooled(
                        self.clone(),
                        entry,
                        server.clone(),
                        true,
                    ));
                }
            }

            let _gate = slot.create_gate.lock().await;
            if current_entry(&slot).is_some() {
                // Someone else finished creating while we waited for the
                // gate; retry the acquire path.
                continue;
            }
            let session = self.inner.factory.connect(server).await?;
            let entry = Arc::new(PoolEntry {
                target_id: server.id.clone(),
                session,
                inner: StdMutex::new(EntryInner {
                    state: EntryState::Healthy,
                    refs: 1,
                    idle_timer: None,
                }),
            });
            *slot.entry.lock().unwrap() = Some(entry.clone());
            self.spawn_close_watcher(entry.clone());
            crate::logging::info_kv(
                "pool session created",
                &[("target", server.id.as_str())],
            );
            let _ = self.inner.events.send(PoolEvent::Connected {
                target_id: server.id.clone(),
            });
            return Ok(PooledSession::pooled(self.clone(), entry, server.clone(), false));
        }
    }

    /// Always-private session, bypassing the pool. Used by isolated-mode
    /// tunnels that want one transport per proxied connection.
    pub async fn connect_isolated(
        &self,
        server: &TargetServer,
    ) -> Result<PooledSession, TransportError> {
        let session = self.inner.factory.connect(server).await?;
        Ok(PooledSession::direct(session))
    }

    /// Mark the target's shared session unhealthy so the next lease request
    /// re-creates it. The session is not disposed while leases still hold it.
    pub fn invalidate(&self, target_id: &str) {
        let entry = {
            let slots = self.inner.slots.lock().unwrap();
            slots
                .get(target_id)
                .and_then(|slot| slot.entry.lock().unwrap().clone())
        };
        if let Some(entry) = entry {
            self.mark_unhealthy(&entry, "invalidated");
        }
    }

    /// Administrative override: evict and dispose regardless of leases.
    pub async fn disconnect(&self, target_id: &str) {
        let entry = {
            let slots = self.inner.slots.lock().unwrap();
            slots
                .get(target_id)
                .and_then(|slot| slot.entry.lock().unwrap().take())
        };
        if let Some(entry) = entry {
            self.evict(&entry).await;
        }
    }

    pub async fn dispose(&self) {
        let entries: Vec<Arc<PoolEntry>> = {
            let slots = self.inner.slots.lock().unwrap();
            slots
                .values()
                .filter_map(|slot| slot.entry.lock().unwrap().take())
                .collect()
        };
        futures_util::future::join_all(entries.iter().map(|entry| self.evict(entry))).await;
    }

    async fn evict(&self, entry: &Arc<PoolEntry>) {
        let was_healthy = {
            let mut inner = entry.inner.lock().unwrap();
            let was_healthy = inner.state == EntryState::Healthy;
            inner.state = EntryState::Evicted;
            if let Some(timer) = inner.idle_timer.take() {
                timer.abort();
            }
            was_healthy
        };
        if was_healthy {
            let _ = self.inner.events.send(PoolEvent::Disconnected {
                target_id: entry.target_id.clone(),
            });
        }
        entry.session.dispose().await;
    }

    fn slot(&self, target_id: &str) -> Arc<Slot> {
        let mut slots = self.inner.slots.lock().unwrap();
        slots
            .entry(target_id.to_string())
            .or_insert_with(|| {
                Arc::new(Slot {
                    create_gate: TokioMutex::new(()),
                    entry: StdMutex::new(None),
                })
            })
            .clone()
    }

    fn spawn_close_watcher(&self, entry: Arc<PoolEntry>) {
        let pool = self.clone();
        spawn_detached(async move {
            let mut closed = entry.session.closed();
            let _ = closed.recv().await;
            pool.mark_unhealthy(&entry, "session closed");
        });
    }

    /// Healthy → Unhealthy transition: removed from the index and announced
    /// once; the session itself is disposed by the last lease to release it.
    fn mark_unhealthy(&self, entry: &Arc<PoolEntry>, reason: &str) {
        let dispose_now = {
            let mut inner = entry.inner.lock().unwrap();
            if inner.state != EntryState::Healthy {
                return;
            }
            inner.state = EntryState::Unhealthy;
            if let Some(timer) = inner.idle_timer.take() {
                timer.abort();
            }
            inner.refs == 0
        };
        self.remove_from_slot(entry);
        crate::logging::info_kv(
            "pool session removed",
            &[
                ("target", entry.target_id.as_str()),
                ("reason", reason),
            ],
        );
        let _ = self.inner.events.send(PoolEvent::Disconnected {
            target_id: entry.target_id.clone(),
        });
        if dispose_now {
            let session = entry.session.clone();
            spawn_detached(async move { session.dispose().await });
        }
    }

    fn remove_from_slot(&self, entry: &Arc<PoolEntry>) {
        let slots = self.inner.slots.lock().unwrap();
        if let Some(slot) = slots.get(&entry.target_id) {
            let mut current = slot.entry.lock().unwrap();
            if current
                .as_ref()
                .map(|e| Arc::ptr_eq(e, entry))
                .unwrap_or(false)
            {
                *current = None;
            }
        }
    }

    /// Called when a lease drops. Zero references arm the idle timer; a
    /// soft-removed entry is disposed by its last lease.
    fn release(&self, entry: &Arc<PoolEntry>) {
        let dispose_now = {
            let mut inner = entry.inner.lock().unwrap();
            inner.refs = inner.refs.saturating_sub(1);
            if inner.refs > 0 {
                return;
            }
            match inner.state {
                EntryState::Healthy => {
                    if let Ok(handle) = tokio::runtime::Handle::try_current() {
                        let pool = self.clone();
                        let entry = entry.clone();
                        let timeout = self.inner.settings.idle_timeout.min(IDLE_TIMEOUT_MAX);
                        inner.idle_timer = Some(handle.spawn(async move {
                            tokio::time::sleep(timeout).await;
                            pool.evict_if_idle(&entry).await;
                        }));
                    }
                    false
                }
                EntryState::Unhealthy | EntryState::Evicted => true,
            }
        };
        if dispose_now {
            let session = entry.session.clone();
            spawn_detached(async move { session.dispose().await });
        }
    }

    async fn evict_if_idle(&self, entry: &Arc<PoolEntry>) {
        {
            let mut inner = entry.inner.lock().unwrap();
            if inner.refs > 0 || inner.state != EntryState::Healthy {
                return;
            }
            inner.state = EntryState::Evicted;
            inner.idle_timer = None;
        }
        self.remove_from_slot(entry);
        crate::logging::info_kv(
            "pool session evicted idle",
            &[("target", entry.target_id.as_str())],
        );
        let _ = self.inner.events.send(PoolEvent::Disconnected {
            target_id: entry.target_id.clone(),
        });
        entry.session.dispose().await;
    }
}

fn current_entry(slot: &Slot) -> Option<Arc<PoolEntry>> {
    slot.entry.lock().unwrap().clone()
}

fn try_acquire(entry: &Arc<PoolEntry>) -> bool {
    let mut inner = entry.inner.lock().unwrap();
    if inner.state != EntryState::Healthy {
        return false;
    }
    inner.refs += 1;
    if let Some(timer) = inner.idle_timer.take() {
        timer.abort();
    }
    true
}

fn spawn_detached<F>(fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(fut);
    }
}

enum FallbackState {
    NotAttempted,
    Active(Arc<dyn TransportSession>),
    Failed(TransportError),
}

/// A lease on a transport session.
///
/// Pooled leases forward operations to the shared session and release their
/// reference on drop. A reused pooled lease may, once, transparently migrate
/// to a private fallback session when the shared one runs out of channels.
/// Direct leases own their session outright and dispose it on drop.
pub struct PooledSession {
    pool: Option<ConnectionPool>,
    entry: Option<Arc<PoolEntry>>,
    primary: Arc<dyn TransportSession>,
    server: Option<TargetServer>,
    reused: bool,
    owns_primary: bool,
    fallback: TokioMutex<FallbackState>,
}

impl PooledSession {
    fn direct(session: Arc<dyn TransportSession>) -> Self {
        Self {
            pool: None,
            entry: None,
            primary: session,
            server: None,
            reused: false,
            owns_primary: true,
            fallback: TokioMutex::new(FallbackState::NotAttempted),
        }
    }

    fn pooled(
        pool: ConnectionPool,
        entry: Arc<PoolEntry>,
        server: TargetServer,
        reused: bool,
    ) -> Self {
        Self {
            primary: entry.session.clone(),
            pool: Some(pool),
            entry: Some(entry),
            server: Some(server),
            reused,
            owns_primary: false,
            fallback: TokioMutex::new(FallbackState::NotAttempted),
        }
    }

    pub fn is_pooled(&self) -> bool {
        self.entry.is_some()
    }

    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn target_id(&self) -> Option<&str> {
        self.entry.as_ref().map(|e| e.target_id.as_str())
    }

    pub fn closed(&self) -> broadcast::Receiver<()> {
        self.primary.closed()
    }

    pub fn is_closed(&self) -> bool {
        self.primary.is_closed()
    }

    pub async fn open_direct_channel(
        &self,
        host: &str,
        port: u16,
    ) -> Result<ChannelStream, TransportError> {
        {
            let state = self.fallback.lock().await;
            if let FallbackState::Active(session) = &*state {
                return session.open_direct_channel(host, port).await;
            }
        }
        match self.primary.open_direct_channel(host, port).await {
            Ok(stream) => Ok(stream),
            Err(err) if self.fallback_eligible() && self.is_exhaustion(&err) => {
                let session = self.acquire_fallback().await?;
                session.open_direct_channel(host, port).await
            }
            Err(err) => Err(err),
        }
    }

    pub async fn request_remote_forward(
        &self,
        bind_addr: &str,
        bind_port: u16,
    ) -> Result<u16, TransportError> {
        self.active_session().await.request_remote_forward(bind_addr, bind_port).await
    }

    pub async fn cancel_remote_forward(
        &self,
        bind_addr: &str,
        bind_port: u16,
    ) -> Result<(), TransportError> {
        self.active_session().await.cancel_remote_forward(bind_addr, bind_port).await
    }

    pub async fn incoming_on_port(
        &self,
        bind_port: u16,
    ) -> tokio::sync::mpsc::UnboundedReceiver<IncomingChannel> {
        self.active_session().await.incoming_on_port(bind_port)
    }

    async fn active_session(&self) -> Arc<dyn TransportSession> {
        let state = self.fallback.lock().await;
        if let FallbackState::Active(session) = &*state {
            session.clone()
        } else {
            self.primary.clone()
        }
    }

    fn fallback_eligible(&self) -> bool {
        self.reused && self.entry.is_some() && self.pool.is_some() && self.server.is_some()
    }

    fn is_exhaustion(&self, err: &TransportError) -> bool {
        self.pool
            .as_ref()
            .map(|pool| (pool.inner.exhaustion)(err))
            .unwrap_or(false)
    }

    /// One fallback attempt per lease; the outcome is cached so concurrent
    /// operations on this lease share it rather than racing the factory.
    async fn acquire_fallback(&self) -> Result<Arc<dyn TransportSession>, TransportError> {
        let mut state = self.fallback.lock().await;
        match &*state {
            FallbackState::Active(session) => Ok(session.clone()),
            FallbackState::Failed(err) => Err(err.clone()),
            FallbackState::NotAttempted => {
                let pool = self.pool.as_ref().unwrap();
                let server = self.server.as_ref().unwrap();
                crate::logging::info_kv(
                    "pool fallback: shared session exhausted, opening private session",
                    &[("target", server.id.as_str())],
                );
                match pool.inner.factory.connect(server).await {
                    Ok(session) => {
                        if let Some(entry) = &self.entry {
                            pool.mark_unhealthy(entry, "channel exhaustion");
                        }
                        *state = FallbackState::Active(session.clone());
                        Ok(session)
                    }
                    Err(err) => {
                        crate::logging::error(format!(
                            "pool fallback connect failed for {}: {err}",
                            server.id
                        ));
                        *state = FallbackState::Failed(err.clone());
                        Err(err)
                    }
                }
            }
        }
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let (Some(pool), Some(entry)) = (self.pool.take(), self.entry.take()) {
            pool.release(&entry);
        }
        let fallback =
            std::mem::replace(self.fallback.get_mut(), FallbackState::NotAttempted);
        if let FallbackState::Active(session) = fallback {
            spawn_detached(async move { session.dispose().await });
        }
        if self.owns_primary {
            let session = self.primary.clone();
            spawn_detached(async move { session.dispose().await });
        }
    }
}
