//! The connection pool.
//!
//! Sessions are bucketed by [`PoolKey`]. Acquisition is FIFO within a key:
//! a request either reserves a stream slot on an existing acquirable
//! session, queues against an in-flight connect attempt, or opens a new
//! connection (DNS, TCP, TLS, preface/upgrade). Failures that occur before
//! a request was committed to the wire surface as `Unprocessed` so callers
//! may retry them safely.

pub mod key;
pub(crate) mod keepalive;
pub mod outlier;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use http::StatusCode;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::dns::CachingResolver;
use crate::endpoint::Endpoint;
use crate::error::{Error, ErrorKind, SharedSource};
use crate::event::{CloseHint, ConnectionEventListener, ConnectionInfo, ConnectionPoolListener};
use crate::session::h2::H2Config;
use crate::session::{h1, h2, Session, SessionProtocol, SessionState, Transport};
use crate::tls::TlsContextCache;

pub use key::PoolKey;
pub use outlier::{OutlierDecision, OutlierDetection, OutlierRule};

/// Pool tuning, extracted from the client options.
#[derive(Debug, Clone)]
pub(crate) struct PoolConfig {
    pub connect_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub ping_interval: Option<Duration>,
    pub max_connection_age: Option<Duration>,
    pub preface_timeout: Duration,
    /// Queued acquisitions allowed behind an in-flight connect; `0` fails
    /// extra acquirers immediately.
    pub max_pending_acquisitions: usize,
    /// Parallel sessions per pool key; `0` is unbounded.
    pub max_sessions_per_endpoint: usize,
    pub use_http2_preface: bool,
    pub h2: H2Config,
    /// Path for HTTP/1.1 keep-alive probes, when configured.
    pub h1_ping_path: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(10)),
            ping_interval: None,
            max_connection_age: None,
            preface_timeout: Duration::from_secs(15),
            max_pending_acquisitions: usize::MAX,
            max_sessions_per_endpoint: 0,
            use_http2_preface: false,
            h2: H2Config::default(),
            h1_ping_path: None,
        }
    }
}

type Waiter = oneshot::Sender<Result<Arc<Session>, Error>>;

#[derive(Default)]
struct Pending {
    connects: usize,
    waiters: VecDeque<Waiter>,
    origin: Option<(Endpoint, SessionProtocol)>,
}

struct PoolInner {
    config: PoolConfig,
    resolver: CachingResolver,
    tls: Arc<TlsContextCache>,
    events: Arc<dyn ConnectionEventListener>,
    pool_listener: Option<Arc<dyn ConnectionPoolListener>>,
    outlier: Option<OutlierDetection>,
    // Lock order: `pending` may nest `sessions`, never the reverse.
    sessions: Mutex<HashMap<PoolKey, Vec<Arc<Session>>>>,
    pending: Mutex<HashMap<PoolKey, Pending>>,
}

#[derive(Clone)]
pub(crate) struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub(crate) fn new(
        config: PoolConfig,
        resolver: CachingResolver,
        tls: Arc<TlsContextCache>,
        events: Arc<dyn ConnectionEventListener>,
        pool_listener: Option<Arc<dyn ConnectionPoolListener>>,
        outlier: Option<OutlierDetection>,
    ) -> Self {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                resolver,
                tls,
                events,
                pool_listener,
                outlier,
                sessions: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn resolver(&self) -> &CachingResolver {
        &self.inner.resolver
    }

    /// Reserves a stream slot on a session for `endpoint`, opening a new
    /// connection when no acquirable session has capacity.
    pub(crate) async fn acquire(
        &self,
        endpoint: &Endpoint,
        desired: SessionProtocol,
    ) -> Result<Arc<Session>, Error> {
        let inner = &self.inner;
        let port = endpoint.port_or(desired.default_port());
        let addr = match endpoint.ip() {
            Some(ip) => SocketAddr::new(ip, port),
            None => {
                let ips = inner
                    .resolver
                    .resolve_host(endpoint.host())
                    .await
                    .map_err(Error::unprocessed)?;
                let ip = *ips.first().ok_or_else(|| {
                    Error::unprocessed(
                        Error::new(ErrorKind::DnsFailure)
                            .with(format!("no addresses for {}", endpoint.host())),
                    )
                })?;
                SocketAddr::new(ip, port)
            }
        };

        let sni = desired
            .is_tls()
            .then(|| endpoint.host_for_sni().to_owned());
        let tls_profile = sni.as_deref().and_then(|s| inner.tls.profile_of(s));
        let key = PoolKey {
            protocol: desired,
            addr,
            sni,
            tls_profile,
        };

        // Acquisition within a key is FIFO: the fast path may only run when
        // nobody is queued ahead.
        let has_waiters = inner
            .pending
            .lock()
            .unwrap()
            .get(&key)
            .map(|entry| !entry.waiters.is_empty())
            .unwrap_or(false);
        if !has_waiters {
            if let Some(session) = try_existing(inner, &key) {
                return Ok(session);
            }
        }

        let (rx, spawn_connect) = {
            let mut pending = inner.pending.lock().unwrap();
            let entry = pending.entry(key.clone()).or_default();
            entry
                .origin
                .get_or_insert_with(|| (endpoint.clone(), desired));

            let spawn_connect = entry.connects == 0 && may_open(inner, &key, entry.connects);
            if !spawn_connect && entry.waiters.len() >= inner.config.max_pending_acquisitions {
                return Err(Error::unprocessed(
                    Error::new(ErrorKind::TooManyPendingAcquisitions).with(format!(
                        "{} queued acquisitions for {addr}",
                        entry.waiters.len()
                    )),
                ));
            }
            if spawn_connect {
                entry.connects += 1;
            }
            let (tx, rx) = oneshot::channel();
            entry.waiters.push_back(tx);
            (rx, spawn_connect)
        };

        if spawn_connect {
            tokio::spawn(connect_and_pump(
                inner.clone(),
                key.clone(),
                endpoint.clone(),
                desired,
            ));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::unprocessed(Error::new(ErrorKind::ClosedSession))),
        }
    }

    /// Returns a stream slot. Called when the exchange's response stream
    /// terminates.
    pub(crate) fn release(&self, session: &Arc<Session>) {
        session.release();
        pump(&self.inner, session.key());
    }

    /// Feeds the outcome of one attempt into the session's outlier
    /// detector.
    pub(crate) fn record_outcome(
        &self,
        session: &Arc<Session>,
        status: Option<StatusCode>,
        cause: Option<&Error>,
    ) {
        if let Some(detector) = session.outlier.as_ref() {
            if detector.record(status, cause) == OutlierDecision::Fatal {
                session.drain(CloseHint::Abnormal);
            }
        }
    }

    /// Sessions currently open for introspection and tests.
    pub(crate) fn session_count(&self) -> usize {
        self.inner
            .sessions
            .lock()
            .unwrap()
            .values()
            .map(|v| v.len())
            .sum()
    }
}

fn try_existing(inner: &Arc<PoolInner>, key: &PoolKey) -> Option<Arc<Session>> {
    let mut sessions = inner.sessions.lock().unwrap();
    let list = sessions.get_mut(key)?;
    list.retain(|s| s.state() != SessionState::Closed);
    list.iter().find(|s| s.try_reserve()).cloned()
}

/// Whether a new connect attempt should start. Callers hold the `pending`
/// lock. A session whose SETTINGS exchange is still pending counts as
/// undetermined capacity, so further opens wait for it rather than racing
/// past the (unknown) concurrency limit.
fn may_open(inner: &Arc<PoolInner>, key: &PoolKey, connects: usize) -> bool {
    let cap = inner.config.max_sessions_per_endpoint;
    let sessions = inner.sessions.lock().unwrap();
    let list = sessions.get(key);

    let settling = list.is_some_and(|list| {
        list.iter().any(|s| {
            s.state() == SessionState::Active && s.is_acquirable() && !s.is_settings_acked()
        })
    });
    if settling {
        return false;
    }
    if cap == 0 {
        return true;
    }
    let open = list
        .map(|list| {
            list.iter()
                .filter(|s| s.state() != SessionState::Closed)
                .count()
        })
        .unwrap_or(0);
    open + connects < cap
}

async fn connect_and_pump(
    inner: Arc<PoolInner>,
    key: PoolKey,
    endpoint: Endpoint,
    desired: SessionProtocol,
) {
    let authority = endpoint.authority();
    inner.events.connection_pending(desired, &authority);

    let result = open_session(&inner, &key, &endpoint, desired).await;
    {
        let mut pending = inner.pending.lock().unwrap();
        if let Some(entry) = pending.get_mut(&key) {
            entry.connects -= 1;
        }
    }

    match result {
        Ok(session) => {
            inner
                .sessions
                .lock()
                .unwrap()
                .entry(key.clone())
                .or_default()
                .push(session.clone());
            watch_close(inner.clone(), key.clone(), session.clone());
            watch_settings_ack(inner.clone(), key.clone(), session);
            pump(&inner, &key);
        }
        Err(cause) => {
            inner
                .events
                .connection_failed(desired, &authority, &cause);
            let shared = Arc::new(cause);
            let waiters: Vec<Waiter> = {
                let mut pending = inner.pending.lock().unwrap();
                let drained = match pending.get_mut(&key) {
                    Some(entry) => entry.waiters.drain(..).collect(),
                    None => Vec::new(),
                };
                if pending.get(&key).is_some_and(|e| e.connects == 0) {
                    pending.remove(&key);
                }
                drained
            };
            for waiter in waiters {
                let _ = waiter.send(Err(share_unprocessed(&shared)));
            }
        }
    }
}

/// One failure fanned out to many waiters, wrapped as `Unprocessed`
/// exactly once.
fn share_unprocessed(shared: &Arc<Error>) -> Error {
    if shared.is_unprocessed() {
        SharedSource(shared.clone()).as_error()
    } else {
        Error::unprocessed(SharedSource(shared.clone()))
    }
}

/// Removes the session from its bucket when it closes, failing queued
/// acquirers if the server went away before the session ever carried a
/// request.
fn watch_close(inner: Arc<PoolInner>, key: PoolKey, session: Arc<Session>) {
    tokio::spawn(async move {
        let mut closed = session.closed_signal();
        while !*closed.borrow() {
            if closed.changed().await.is_err() {
                break;
            }
        }

        {
            let mut sessions = inner.sessions.lock().unwrap();
            if let Some(list) = sessions.get_mut(&key) {
                list.retain(|s| !Arc::ptr_eq(s, &session));
                if list.is_empty() {
                    sessions.remove(&key);
                }
            }
        }

        if session.hint() == Some(CloseHint::GoAway) && session.streams_started() == 0 {
            let shared = Arc::new(Error::new(ErrorKind::GoAwayReceived));
            let waiters: Vec<Waiter> = {
                let mut pending = inner.pending.lock().unwrap();
                match pending.get_mut(&key) {
                    Some(entry) => entry.waiters.drain(..).collect(),
                    None => Vec::new(),
                }
            };
            for waiter in waiters {
                let _ = waiter.send(Err(Error::unprocessed(SharedSource(shared.clone()))));
            }
        }

        pump(&inner, &key);
    });
}

/// Re-pumps the key once the session's concurrency limit is known, so
/// acquirers queued behind the SETTINGS exchange get matched (or trigger
/// further opens).
fn watch_settings_ack(inner: Arc<PoolInner>, key: PoolKey, session: Arc<Session>) {
    if session.is_settings_acked() {
        return;
    }
    tokio::spawn(async move {
        let mut acked = session.settings_acked_signal();
        let mut closed = session.closed_signal();
        loop {
            if *acked.borrow() {
                pump(&inner, &key);
                return;
            }
            tokio::select! {
                changed = acked.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = closed.changed() => return,
            }
        }
    });
}

/// Matches queued acquirers with available stream slots, opening further
/// connections when capacity ran out.
fn pump(inner: &Arc<PoolInner>, key: &PoolKey) {
    loop {
        let waiter = {
            let mut pending = inner.pending.lock().unwrap();
            let Some(entry) = pending.get_mut(key) else { return };
            match entry.waiters.pop_front() {
                Some(waiter) => waiter,
                None => {
                    if entry.connects == 0 {
                        pending.remove(key);
                    }
                    return;
                }
            }
        };
        if waiter.is_closed() {
            continue;
        }

        match try_existing(inner, key) {
            Some(session) => {
                if waiter.send(Ok(session.clone())).is_err() {
                    session.release();
                }
            }
            None => {
                let connect = {
                    let mut pending = inner.pending.lock().unwrap();
                    let entry = pending.entry(key.clone()).or_default();
                    entry.waiters.push_front(waiter);
                    if entry.connects == 0 && may_open(inner, key, entry.connects) {
                        entry.connects += 1;
                        entry.origin.clone()
                    } else {
                        None
                    }
                };
                if let Some((endpoint, desired)) = connect {
                    tokio::spawn(connect_and_pump(
                        inner.clone(),
                        key.clone(),
                        endpoint,
                        desired,
                    ));
                }
                return;
            }
        }
    }
}

async fn open_session(
    inner: &Arc<PoolInner>,
    key: &PoolKey,
    endpoint: &Endpoint,
    desired: SessionProtocol,
) -> Result<Arc<Session>, Error> {
    let authority = endpoint.authority();
    let tcp = dial(inner, key.addr).await?;
    let local_addr = tcp.local_addr()?;
    let remote_addr = tcp.peer_addr()?;

    if desired.is_tls() {
        let sni = key
            .sni
            .clone()
            .unwrap_or_else(|| endpoint.host_for_sni().to_owned());
        let tls_ctx = inner.tls.acquire(&sni, desired.is_multiplex())?;
        let stream = tls_ctx.connect(&sni, tcp).await?;
        let negotiated_h2 =
            stream.get_ref().1.alpn_protocol() == Some(crate::tls::ALPN_H2);
        let actual = if negotiated_h2 {
            SessionProtocol::H2
        } else {
            SessionProtocol::H1
        };
        let info = ConnectionInfo {
            protocol: actual,
            authority,
            remote_addr,
            local_addr,
        };
        inner.events.connection_opened(&info);
        return if actual.is_multiplex() {
            start_h2(inner, key, stream, info, Some(tls_ctx)).await
        } else {
            start_h1(inner, key, stream, BytesMut::new(), info, Some(tls_ctx))
        };
    }

    match desired {
        SessionProtocol::H2C if inner.config.use_http2_preface => {
            let info = ConnectionInfo {
                protocol: SessionProtocol::H2C,
                authority,
                remote_addr,
                local_addr,
            };
            inner.events.connection_opened(&info);
            start_h2(inner, key, tcp, info, None).await
        }
        SessionProtocol::H2C => {
            let mut tcp = tcp;
            let mut buf = BytesMut::new();
            if h1::upgrade_probe(&mut tcp, &mut buf, &authority).await? {
                // The peer switched protocols on the probe connection; a
                // fresh connection speaks the preface directly.
                drop(tcp);
                let tcp = dial(inner, key.addr).await?;
                let local_addr = tcp.local_addr()?;
                let remote_addr = tcp.peer_addr()?;
                let info = ConnectionInfo {
                    protocol: SessionProtocol::H2C,
                    authority,
                    remote_addr,
                    local_addr,
                };
                inner.events.connection_opened(&info);
                start_h2(inner, key, tcp, info, None).await
            } else {
                let info = ConnectionInfo {
                    protocol: SessionProtocol::H1C,
                    authority,
                    remote_addr,
                    local_addr,
                };
                inner.events.connection_opened(&info);
                start_h1(inner, key, tcp, buf, info, None)
            }
        }
        _ => {
            let info = ConnectionInfo {
                protocol: SessionProtocol::H1C,
                authority,
                remote_addr,
                local_addr,
            };
            inner.events.connection_opened(&info);
            start_h1(inner, key, tcp, BytesMut::new(), info, None)
        }
    }
}

async fn dial(inner: &Arc<PoolInner>, addr: SocketAddr) -> Result<TcpStream, Error> {
    let tcp = tokio::time::timeout(inner.config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::new(ErrorKind::ConnectTimeout).with(format!("connecting to {addr}")))?
        .map_err(Error::from)?;
    tcp.set_nodelay(true)?;
    Ok(tcp)
}

async fn start_h2<IO>(
    inner: &Arc<PoolInner>,
    key: &PoolKey,
    io: IO,
    info: ConnectionInfo,
    tls: Option<crate::tls::TlsContext>,
) -> Result<Arc<Session>, Error>
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let builder = h2::builder(&inner.config.h2);
    let handshake = tokio::time::timeout(inner.config.preface_timeout, builder.handshake(io))
        .await
        .map_err(|_| Error::new(ErrorKind::ClosedSession).with("HTTP/2 handshake timed out"))?;
    let (send_request, mut connection) =
        handshake.map_err(|e| Error::unprocessed(Error::from(e)))?;
    let ping_pong = connection.ping_pong();

    let session = Session::new(
        info.protocol,
        key.clone(),
        info,
        Transport::H2(send_request),
        inner.events.clone(),
        inner.outlier.as_ref().map(|d| d.detector()),
        tls,
    );
    h2::spawn_driver(connection, session.clone());
    keepalive::spawn(
        session.clone(),
        keepalive_config(inner),
        ping_pong.map(keepalive::Pinger::H2),
        inner.pool_listener.clone(),
    );
    Ok(session)
}

fn start_h1<IO>(
    inner: &Arc<PoolInner>,
    key: &PoolKey,
    io: IO,
    buf: BytesMut,
    info: ConnectionInfo,
    tls: Option<crate::tls::TlsContext>,
) -> Result<Arc<Session>, Error>
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(4);
    let session = Session::new(
        info.protocol,
        key.clone(),
        info.clone(),
        Transport::H1(tx.clone()),
        inner.events.clone(),
        inner.outlier.as_ref().map(|d| d.detector()),
        tls,
    );
    h1::spawn(io, buf, rx, session.clone());

    let pinger = inner.config.h1_ping_path.clone().map(|path| keepalive::Pinger::H1 {
        tx,
        authority: info.authority.clone(),
        path,
    });
    keepalive::spawn(
        session.clone(),
        keepalive_config(inner),
        pinger,
        inner.pool_listener.clone(),
    );
    inner.events.connection_active(&info);
    Ok(session)
}

fn keepalive_config(inner: &Arc<PoolInner>) -> keepalive::KeepAliveConfig {
    keepalive::KeepAliveConfig {
        idle_timeout: inner.config.idle_timeout,
        ping_interval: inner.config.ping_interval,
        max_connection_age: inner.config.max_connection_age,
        preface_timeout: Some(inner.config.preface_timeout),
    }
}
