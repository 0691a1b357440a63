//! Transport sessions.
//!
//! A session is one pooled transport connection. HTTP/1.1 sessions run a
//! strictly serial exchange loop; HTTP/2 sessions multiplex streams over an
//! `h2` connection. Both share the accounting the pool relies on:
//! acquirability, unfinished-stream counts and the advertised concurrency
//! limit.

pub(crate) mod h1;
pub(crate) mod h2;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use crate::body::Body;
use crate::context::ClientRequestContext;
use crate::error::{Error, ErrorKind};
use crate::event::{CloseHint, ConnectionEventListener, ConnectionInfo};
use crate::pool::key::PoolKey;
use crate::pool::outlier::OutlierDetector;
use crate::tls::TlsContext;

/// Wire protocol of a session. The `C` variants are cleartext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionProtocol {
    H1,
    H1C,
    H2,
    H2C,
}

impl SessionProtocol {
    pub fn is_tls(&self) -> bool {
        matches!(self, SessionProtocol::H1 | SessionProtocol::H2)
    }

    /// Whether streams multiplex over one connection.
    pub fn is_multiplex(&self) -> bool {
        matches!(self, SessionProtocol::H2 | SessionProtocol::H2C)
    }

    pub fn default_port(&self) -> u16 {
        if self.is_tls() {
            443
        } else {
            80
        }
    }

    pub fn scheme(&self) -> http::uri::Scheme {
        if self.is_tls() {
            http::uri::Scheme::HTTPS
        } else {
            http::uri::Scheme::HTTP
        }
    }

    /// The H1 flavour on the same security level.
    pub(crate) fn downgrade(&self) -> SessionProtocol {
        if self.is_tls() {
            SessionProtocol::H1
        } else {
            SessionProtocol::H1C
        }
    }
}

impl fmt::Display for SessionProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionProtocol::H1 => "h1",
            SessionProtocol::H1C => "h1c",
            SessionProtocol::H2 => "h2",
            SessionProtocol::H2C => "h2c",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Active,
    Draining,
    Closed,
}

pub(crate) enum Transport {
    H1(tokio::sync::mpsc::Sender<h1::Exchange>),
    H2(::h2::client::SendRequest<bytes::Bytes>),
}

/// One pooled transport connection.
pub(crate) struct Session {
    protocol: SessionProtocol,
    key: PoolKey,
    info: ConnectionInfo,
    opened_at: Instant,
    state: Mutex<SessionState>,
    acquirable: AtomicBool,
    unfinished_streams: AtomicU32,
    peer_max_streams: AtomicU32,
    settings_acked: watch::Sender<bool>,
    streams_started: AtomicU64,
    last_activity: Mutex<Instant>,
    next_ping_id: AtomicU64,
    transport: Transport,
    closed_tx: watch::Sender<bool>,
    close_hint: Mutex<Option<CloseHint>>,
    pub(crate) activity: Notify,
    pub(crate) events: Arc<dyn ConnectionEventListener>,
    pub(crate) outlier: Option<Arc<OutlierDetector>>,
    // Held for its refcount: the TLS context stays cached while any session
    // uses it.
    _tls: Option<TlsContext>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        protocol: SessionProtocol,
        key: PoolKey,
        info: ConnectionInfo,
        transport: Transport,
        events: Arc<dyn ConnectionEventListener>,
        outlier: Option<Arc<OutlierDetector>>,
        tls: Option<TlsContext>,
    ) -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        // H1 sessions are serial and never negotiate: one stream, settled.
        let multiplex = protocol.is_multiplex();
        Arc::new(Session {
            protocol,
            key,
            info,
            opened_at: Instant::now(),
            state: Mutex::new(SessionState::Active),
            acquirable: AtomicBool::new(true),
            unfinished_streams: AtomicU32::new(0),
            peer_max_streams: AtomicU32::new(if multiplex { u32::MAX } else { 1 }),
            settings_acked: watch::channel(!multiplex).0,
            streams_started: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
            next_ping_id: AtomicU64::new(0),
            transport,
            closed_tx,
            close_hint: Mutex::new(None),
            activity: Notify::new(),
            events,
            outlier,
            _tls: tls,
        })
    }

    pub(crate) fn protocol(&self) -> SessionProtocol {
        self.protocol
    }

    pub(crate) fn key(&self) -> &PoolKey {
        &self.key
    }

    pub(crate) fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub(crate) fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn is_acquirable(&self) -> bool {
        self.acquirable.load(Ordering::Acquire) && self.state() == SessionState::Active
    }

    pub(crate) fn unfinished_streams(&self) -> u32 {
        self.unfinished_streams.load(Ordering::Acquire)
    }

    /// The stream budget the pool may hand out. Until the initial SETTINGS
    /// exchange is acknowledged a multiplexed session reports one stream so
    /// the pool does not over-commit.
    pub(crate) fn max_concurrent_streams(&self) -> u32 {
        if self.is_settings_acked() {
            self.peer_max_streams.load(Ordering::Acquire)
        } else {
            1
        }
    }

    pub(crate) fn is_settings_acked(&self) -> bool {
        *self.settings_acked.borrow()
    }

    pub(crate) fn settings_acked_signal(&self) -> watch::Receiver<bool> {
        self.settings_acked.subscribe()
    }

    /// Records the peer's advertised `MAX_CONCURRENT_STREAMS`.
    pub(crate) fn observe_peer_max_streams(&self, value: u32) {
        let previous = self.peer_max_streams.swap(value, Ordering::AcqRel);
        if previous != value && self.is_settings_acked() {
            self.activity.notify_waiters();
        }
    }

    /// Called once the initial SETTINGS exchange is known to have been
    /// processed by the peer. The session is fully ready to serve from
    /// here on.
    pub(crate) fn mark_settings_acked(&self) {
        if !self.settings_acked.send_replace(true) {
            self.events.connection_active(&self.info);
        }
        self.activity.notify_waiters();
    }

    pub(crate) fn streams_started(&self) -> u64 {
        self.streams_started.load(Ordering::Acquire)
    }

    pub(crate) fn next_ping_id(&self) -> u64 {
        self.next_ping_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub(crate) fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap()
    }

    /// Reserves one stream slot. Fails when the session is not acquirable
    /// or already at its concurrency limit.
    pub(crate) fn try_reserve(&self) -> bool {
        if !self.is_acquirable() {
            return false;
        }
        let max = self.max_concurrent_streams();
        let reserved = self
            .unfinished_streams
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n < max {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_ok();
        if reserved {
            self.streams_started.fetch_add(1, Ordering::AcqRel);
            self.touch();
        }
        reserved
    }

    /// Returns a reserved slot. The pool calls this when the stream's
    /// response completes (or the exchange fails).
    pub(crate) fn release(&self) {
        let remaining = self.unfinished_streams.fetch_sub(1, Ordering::AcqRel) - 1;
        self.touch();
        if remaining == 0 {
            if self.state() == SessionState::Draining {
                self.close(self.pending_hint());
            } else {
                self.events.connection_idle(&self.info);
            }
        }
        self.activity.notify_waiters();
    }

    fn pending_hint(&self) -> CloseHint {
        self.close_hint.lock().unwrap().unwrap_or(CloseHint::Unknown)
    }

    pub(crate) fn hint(&self) -> Option<CloseHint> {
        *self.close_hint.lock().unwrap()
    }

    /// Stops handing the session out; in-flight streams finish, then the
    /// session closes with `hint`.
    pub(crate) fn drain(&self, hint: CloseHint) {
        self.acquirable.store(false, Ordering::Release);
        {
            let mut state = self.state.lock().unwrap();
            if *state != SessionState::Active {
                return;
            }
            *state = SessionState::Draining;
        }
        self.close_hint.lock().unwrap().get_or_insert(hint);
        if self.unfinished_streams() == 0 {
            self.close(hint);
        }
        self.activity.notify_waiters();
    }

    /// Closes immediately. Idempotent; the first caller's hint wins.
    pub(crate) fn close(&self, hint: CloseHint) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        self.acquirable.store(false, Ordering::Release);
        let hint = *self.close_hint.lock().unwrap().get_or_insert(hint);
        let _ = self.closed_tx.send(true);
        self.events.connection_closed(&self.info, hint);
        self.activity.notify_waiters();
    }

    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Writes one request and returns its streaming response.
    pub(crate) async fn execute(
        self: &Arc<Self>,
        ctx: &ClientRequestContext,
        request: http::Request<Body>,
    ) -> Result<http::Response<Body>, Error> {
        if self.state() == SessionState::Closed {
            return Err(Error::unprocessed(Error::new(ErrorKind::ClosedSession)));
        }
        match &self.transport {
            Transport::H1(tx) => h1::execute(tx.clone(), ctx, request).await,
            Transport::H2(send_request) => {
                h2::execute(self, send_request.clone(), ctx, request).await
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("protocol", &self.protocol)
            .field("authority", &self.info.authority)
            .field("state", &self.state())
            .field("unfinished_streams", &self.unfinished_streams())
            .finish()
    }
}
