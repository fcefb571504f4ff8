use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use serde::Serialize;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    sync::{Mutex, RwLock, watch},
    task::JoinSet,
};

use crate::backhaul::{
    net, telemetry,
    tunnel::{
        pipe,
        protocol::{self, ProtocolError},
        registry::{PendingRegistry, RegistryError},
    },
};

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub control_addr: String,
    pub proxy_addr: String,
    pub transfer_addr: String,
    /// Pending connections older than this are closed by the reaper. Zero disables expiry.
    pub pending_ttl: Duration,
    pub reap_interval: Duration,
    /// Bound on reading the claim line of a transfer connection. Zero disables it.
    pub handshake_timeout: Duration,
    pub max_key_bytes: usize,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            control_addr: ":8082".into(),
            proxy_addr: ":8081".into(),
            transfer_addr: ":8083".into(),
            pending_ttl: Duration::from_secs(30),
            reap_interval: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            max_key_bytes: protocol::DEFAULT_MAX_KEY_BYTES,
        }
    }
}

pub type SharedRegistry = Arc<PendingRegistry<TcpStream>>;

/// The agent's control connection as seen by the broker.
pub struct ControlSession {
    id: String,
    remote: String,
    started_at_unix_ms: u64,
    writer: Mutex<OwnedWriteHalf>,
}

impl std::fmt::Debug for ControlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSession")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl ControlSession {
    async fn notify(&self, key: &str) -> Result<(), ProtocolError> {
        let mut w = self.writer.lock().await;
        protocol::write_notify(&mut *w, key).await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlSnapshot {
    pub id: String,
    pub remote: String,
    pub started_at_unix_ms: u64,
}

/// Holds the session currently addressed by notifies.
#[derive(Debug, Default)]
pub struct ControlCell {
    current: RwLock<Option<Arc<ControlSession>>>,
}

impl ControlCell {
    pub fn new() -> Self {
        Self::default()
    }

    async fn replace(&self, sess: Arc<ControlSession>) -> Option<Arc<ControlSession>> {
        self.current.write().await.replace(sess)
    }

    pub async fn current(&self) -> Option<Arc<ControlSession>> {
        self.current.read().await.clone()
    }

    /// Clears the cell only if `id` is still the current session.
    async fn clear_if(&self, id: &str) -> bool {
        let mut cur = self.current.write().await;
        if cur.as_ref().is_some_and(|s| s.id == id) {
            *cur = None;
            return true;
        }
        false
    }

    pub async fn snapshot(&self) -> Option<ControlSnapshot> {
        self.current.read().await.as_ref().map(|s| ControlSnapshot {
            id: s.id.clone(),
            remote: s.remote.clone(),
            started_at_unix_ms: s.started_at_unix_ms,
        })
    }
}

struct Shared {
    opts: BrokerOptions,
    registry: SharedRegistry,
    control: Arc<ControlCell>,
    sessions: telemetry::SharedSessions,
    id_seq: AtomicU64,
}

impl Shared {
    fn next_id(&self, prefix: &str) -> String {
        let n = self.id_seq.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}-{n}")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BrokerAddrs {
    pub control: SocketAddr,
    pub proxy: SocketAddr,
    pub transfer: SocketAddr,
}

pub struct Broker {
    control_ln: TcpListener,
    proxy_ln: TcpListener,
    transfer_ln: TcpListener,
    addrs: BrokerAddrs,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("addrs", &self.addrs)
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// Binds all three listeners. Any bind failure aborts startup.
    pub async fn bind(opts: BrokerOptions, sessions: telemetry::SharedSessions) -> anyhow::Result<Self> {
        let control_ln = bind_listener("control", &opts.control_addr).await?;
        let proxy_ln = bind_listener("proxy", &opts.proxy_addr).await?;
        let transfer_ln = bind_listener("transfer", &opts.transfer_addr).await?;

        let addrs = BrokerAddrs {
            control: control_ln.local_addr()?,
            proxy: proxy_ln.local_addr()?,
            transfer: transfer_ln.local_addr()?,
        };

        Ok(Self {
            control_ln,
            proxy_ln,
            transfer_ln,
            addrs,
            shared: Arc::new(Shared {
                opts,
                registry: Arc::new(PendingRegistry::new()),
                control: Arc::new(ControlCell::new()),
                sessions,
                id_seq: AtomicU64::new(1),
            }),
        })
    }

    pub fn local_addrs(&self) -> BrokerAddrs {
        self.addrs
    }

    pub fn registry(&self) -> SharedRegistry {
        self.shared.registry.clone()
    }

    pub fn control(&self) -> Arc<ControlCell> {
        self.shared.control.clone()
    }

    /// Runs the accept loops and the reaper until `shutdown` flips to true.
    pub async fn serve(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let Broker {
            control_ln,
            proxy_ln,
            transfer_ln,
            addrs,
            shared,
        } = self;

        tracing::info!(
            control = %addrs.control,
            proxy = %addrs.proxy,
            transfer = %addrs.transfer,
            pending_ttl = %humantime::format_duration(shared.opts.pending_ttl),
            "broker: listening"
        );

        let mut tasks = JoinSet::new();
        tasks.spawn(accept_loop(
            "control",
            control_ln,
            shared.clone(),
            shutdown.clone(),
            handle_control,
        ));
        tasks.spawn(accept_loop(
            "proxy",
            proxy_ln,
            shared.clone(),
            shutdown.clone(),
            handle_public,
        ));
        tasks.spawn(accept_loop(
            "transfer",
            transfer_ln,
            shared.clone(),
            shutdown.clone(),
            handle_transfer,
        ));
        tasks.spawn(reap_loop(shared, shutdown));

        while let Some(res) = tasks.join_next().await {
            if let Err(err) = res {
                tracing::warn!(err = %err, "broker: task failed");
            }
        }

        tracing::info!("broker: stopped");
        Ok(())
    }
}

async fn bind_listener(role: &str, addr: &str) -> anyhow::Result<TcpListener> {
    let bind_addr = net::normalize_bind_addr(addr);
    TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("broker: bind {role} listener {addr}"))
}

async fn accept_loop<F, Fut>(
    role: &'static str,
    ln: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
    handler: F,
) where
    F: Fn(Arc<Shared>, TcpStream, SocketAddr, watch::Receiver<bool>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                match res {
                    Ok((conn, peer)) => {
                        tracing::debug!(role, peer = %peer, "broker: accepted");
                        tokio::spawn(handler(shared.clone(), conn, peer, shutdown.clone()));
                    }
                    Err(err) => {
                        tracing::warn!(role, err = %err, "broker: accept failed");
                    }
                }
            }
        }
    }
}

async fn handle_control(
    shared: Arc<Shared>,
    conn: TcpStream,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut rd, wr) = conn.into_split();
    let sess = Arc::new(ControlSession {
        id: shared.next_id("ctl"),
        remote: peer.to_string(),
        started_at_unix_ms: telemetry::now_unix_ms(),
        writer: Mutex::new(wr),
    });

    // The superseded session is left open; it just stops receiving notifies.
    if let Some(prev) = shared.control.replace(sess.clone()).await {
        tracing::info!(prev = %prev.id, prev_remote = %prev.remote, "control: session superseded");
    }
    tracing::info!(cid = %sess.id, remote = %sess.remote, "control: session established");

    // Agents never send anything on the control connection; reading only detects loss.
    let mut buf = [0u8; 512];
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            res = rd.read(&mut buf) => {
                match res {
                    Ok(0) => {
                        tracing::info!(cid = %sess.id, "control: session closed by peer");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(cid = %sess.id, err = %err, "control: read failed");
                        break;
                    }
                }
            }
        }
    }

    if shared.control.clear_if(&sess.id).await {
        tracing::info!(cid = %sess.id, "control: no active session");
    }
}

async fn handle_public(
    shared: Arc<Shared>,
    conn: TcpStream,
    peer: SocketAddr,
    _shutdown: watch::Receiver<bool>,
) {
    metrics::counter!("backhaul_public_connections_total").increment(1);
    let key = peer.to_string();

    if let Some(stale) = shared.registry.put(key.clone(), conn).await {
        tracing::warn!(key = %key, "proxy: replaced stale pending connection");
        close_quietly(stale.conn).await;
    }

    let Some(sess) = shared.control.current().await else {
        tracing::debug!(key = %key, "proxy: no control session; connection stays pending");
        return;
    };

    match sess.notify(&key).await {
        Ok(()) => {
            metrics::counter!("backhaul_notify_total").increment(1);
            tracing::debug!(key = %key, cid = %sess.id, "proxy: notified agent");
        }
        Err(err) => {
            metrics::counter!("backhaul_notify_failures_total").increment(1);
            tracing::warn!(key = %key, cid = %sess.id, err = %err, "proxy: notify failed");
        }
    }
}

async fn handle_transfer(
    shared: Arc<Shared>,
    mut conn: TcpStream,
    peer: SocketAddr,
    _shutdown: watch::Receiver<bool>,
) {
    let key = if shared.opts.handshake_timeout > Duration::ZERO {
        tokio::time::timeout(
            shared.opts.handshake_timeout,
            protocol::read_claim(&mut conn, shared.opts.max_key_bytes),
        )
        .await
        .unwrap_or_else(|_| {
            Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "timed out waiting for key",
            )))
        })
    } else {
        protocol::read_claim(&mut conn, shared.opts.max_key_bytes).await
    };

    let key = match key {
        Ok(k) => k,
        Err(err) => {
            tracing::warn!(peer = %peer, err = %err, "transfer: bad claim line");
            close_quietly(conn).await;
            return;
        }
    };

    let entry = match shared.registry.take(&key).await {
        Ok(e) => e,
        Err(RegistryError::NotFound(_)) => {
            metrics::counter!("backhaul_claim_misses_total").increment(1);
            tracing::warn!(peer = %peer, key = %key, "transfer: unknown key; closing");
            close_quietly(conn).await;
            return;
        }
    };

    metrics::counter!("backhaul_claims_total").increment(1);
    let waited = entry.registered_at.elapsed();
    let sid = shared.next_id("t");
    tracing::info!(
        sid = %sid,
        key = %key,
        transfer = %peer,
        waited = %humantime::format_duration(Duration::from_millis(waited.as_millis() as u64)),
        "transfer: claimed; piping"
    );

    shared.sessions.add(telemetry::SessionInfo {
        id: sid.clone(),
        client: key.clone(),
        upstream: peer.to_string(),
        started_at_unix_ms: telemetry::now_unix_ms(),
    });
    let stats = {
        let _active = telemetry::ActivePipeGuard::new();
        pipe::pipe(entry.conn, conn).await
    };
    shared.sessions.remove(&sid);

    metrics::counter!("backhaul_bytes_ingress_total").increment(stats.a_to_b);
    metrics::counter!("backhaul_bytes_egress_total").increment(stats.b_to_a);
    tracing::info!(
        sid = %sid,
        key = %key,
        ingress = stats.a_to_b,
        egress = stats.b_to_a,
        "transfer: tunnel closed"
    );
}

async fn reap_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let ttl = shared.opts.pending_ttl;
    if ttl == Duration::ZERO {
        while shutdown.changed().await.is_ok() {
            if *shutdown.borrow() {
                break;
            }
        }
        return;
    }

    let period = shared.opts.reap_interval.max(Duration::from_millis(10));
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = tick.tick() => {
                let now = Instant::now();
                let expired = shared.registry.take_expired(ttl, now).await;
                for e in expired {
                    metrics::counter!("backhaul_pending_expired_total").increment(1);
                    let age = now.saturating_duration_since(e.registered_at);
                    tracing::warn!(
                        key = %e.key,
                        age = %humantime::format_duration(Duration::from_millis(age.as_millis() as u64)),
                        "reaper: pending connection expired; closing"
                    );
                    close_quietly(e.conn).await;
                }
            }
        }
    }
}

async fn close_quietly(mut conn: TcpStream) {
    let _ = tokio::time::timeout(Duration::from_secs(1), conn.shutdown()).await;
}
