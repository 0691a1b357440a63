//! Per-request logs.
//!
//! A [`RequestLog`] is an append-only record of request lifecycle
//! properties. Each property transitions from absent to present exactly
//! once; later writes are ignored. Observers registered for a property run
//! as soon as it becomes available, in registration order.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use http::{HeaderMap, Method, StatusCode};
use tokio::time::Instant;

use crate::error::Error;
use crate::session::SessionProtocol;

/// Lifecycle properties a log can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum LogProperty {
    RequestHeaders = 1 << 0,
    RequestFirstBytes = 1 << 1,
    RequestEnd = 1 << 2,
    ResponseHeaders = 1 << 3,
    ResponseFirstBytes = 1 << 4,
    ResponseEnd = 1 << 5,
    Session = 1 << 6,
}

const COMPLETE: u32 = LogProperty::RequestEnd as u32 | LogProperty::ResponseEnd as u32;

/// The request head as frozen for the wire.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub authority: String,
    pub path: String,
    pub headers: HeaderMap,
}

/// The transport the request was bound to.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub protocol: SessionProtocol,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

struct LogState {
    started_at: Instant,
    request_head: Option<RequestHead>,
    request_end_at: Option<Instant>,
    request_cause: Option<Arc<Error>>,
    response_status: Option<StatusCode>,
    response_headers: Option<HeaderMap>,
    response_end_at: Option<Instant>,
    response_cause: Option<Arc<Error>>,
    session: Option<SessionInfo>,
    request_length: u64,
    response_length: u64,
}

impl Default for LogState {
    fn default() -> Self {
        LogState {
            started_at: Instant::now(),
            request_head: None,
            request_end_at: None,
            request_cause: None,
            response_status: None,
            response_headers: None,
            response_end_at: None,
            response_cause: None,
            session: None,
            request_length: 0,
            response_length: 0,
        }
    }
}

struct Observer {
    mask: u32,
    callback: Box<dyn Fn(&RequestLog) + Send + Sync>,
}

struct LogInner {
    flags: AtomicU32,
    state: Mutex<LogState>,
    observers: Mutex<Vec<Observer>>,
}

/// Append-only request lifecycle record.
#[derive(Clone)]
pub struct RequestLog {
    inner: Arc<LogInner>,
}

impl RequestLog {
    pub fn new() -> Self {
        RequestLog {
            inner: Arc::new(LogInner {
                flags: AtomicU32::new(0),
                state: Mutex::new(LogState::default()),
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Whether `property` has been recorded.
    pub fn is_available(&self, property: LogProperty) -> bool {
        self.inner.flags.load(Ordering::Acquire) & property as u32 != 0
    }

    /// Whether both directions have terminated.
    pub fn is_complete(&self) -> bool {
        self.inner.flags.load(Ordering::Acquire) & COMPLETE == COMPLETE
    }

    /// Runs `callback` once `property` becomes available; immediately if it
    /// already is.
    pub fn on(
        &self,
        property: LogProperty,
        callback: impl Fn(&RequestLog) + Send + Sync + 'static,
    ) {
        if self.is_available(property) {
            callback(self);
            return;
        }
        let mut observers = self.inner.observers.lock().unwrap();
        // Re-check under the lock so a concurrent setter cannot slip
        // between the fast path and registration.
        if self.is_available(property) {
            drop(observers);
            callback(self);
            return;
        }
        observers.push(Observer {
            mask: property as u32,
            callback: Box::new(callback),
        });
    }

    /// Runs `callback` when the log completes (request and response end).
    /// Either direction may finish last.
    pub fn on_complete(&self, callback: impl Fn(&RequestLog) + Send + Sync + 'static) {
        let callback = Arc::new(callback);
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        for property in [LogProperty::RequestEnd, LogProperty::ResponseEnd] {
            let callback = callback.clone();
            let fired = fired.clone();
            self.on(property, move |log| {
                if log.is_complete() && !fired.swap(true, Ordering::AcqRel) {
                    callback(log);
                }
            });
        }
    }

    fn set(&self, property: LogProperty, fill: impl FnOnce(&mut LogState)) {
        {
            let mut state = self.inner.state.lock().unwrap();
            let prev = self
                .inner
                .flags
                .fetch_or(property as u32, Ordering::AcqRel);
            if prev & property as u32 != 0 {
                // Properties transition exactly once.
                return;
            }
            fill(&mut state);
        }
        self.fire(property as u32);
    }

    fn fire(&self, newly: u32) {
        let due: Vec<Box<dyn Fn(&RequestLog) + Send + Sync>> = {
            let mut observers = self.inner.observers.lock().unwrap();
            let mut due = Vec::new();
            let mut i = 0;
            while i < observers.len() {
                if observers[i].mask & newly != 0 {
                    due.push(observers.remove(i).callback);
                } else {
                    i += 1;
                }
            }
            due
        };
        for callback in due {
            callback(self);
        }
    }

    pub(crate) fn set_request_head(&self, head: RequestHead) {
        self.set(LogProperty::RequestHeaders, |s| s.request_head = Some(head));
    }

    pub(crate) fn request_first_bytes(&self) {
        self.set(LogProperty::RequestFirstBytes, |_| {});
    }

    pub(crate) fn add_request_length(&self, n: u64) {
        self.inner.state.lock().unwrap().request_length += n;
    }

    pub(crate) fn end_request(&self) {
        self.set(LogProperty::RequestEnd, |s| {
            s.request_end_at = Some(Instant::now())
        });
    }

    pub(crate) fn end_request_with(&self, cause: Arc<Error>) {
        self.set(LogProperty::RequestEnd, |s| {
            s.request_end_at = Some(Instant::now());
            s.request_cause = Some(cause);
        });
    }

    pub(crate) fn set_response_headers(&self, status: StatusCode, headers: HeaderMap) {
        self.set(LogProperty::ResponseHeaders, |s| {
            s.response_status = Some(status);
            s.response_headers = Some(headers);
        });
    }

    pub(crate) fn response_first_bytes(&self) {
        self.set(LogProperty::ResponseFirstBytes, |_| {});
    }

    pub(crate) fn add_response_length(&self, n: u64) {
        self.inner.state.lock().unwrap().response_length += n;
    }

    pub(crate) fn end_response(&self) {
        self.set(LogProperty::ResponseEnd, |s| {
            s.response_end_at = Some(Instant::now())
        });
    }

    pub(crate) fn end_response_with(&self, cause: Arc<Error>) {
        self.set(LogProperty::ResponseEnd, |s| {
            s.response_end_at = Some(Instant::now());
            s.response_cause = Some(cause);
        });
    }

    pub(crate) fn set_session(&self, session: SessionInfo) {
        self.set(LogProperty::Session, |s| s.session = Some(session));
    }

    pub fn request_head(&self) -> Option<RequestHead> {
        self.inner.state.lock().unwrap().request_head.clone()
    }

    pub fn response_status(&self) -> Option<StatusCode> {
        self.inner.state.lock().unwrap().response_status
    }

    pub fn response_headers(&self) -> Option<HeaderMap> {
        self.inner.state.lock().unwrap().response_headers.clone()
    }

    pub fn session(&self) -> Option<SessionInfo> {
        self.inner.state.lock().unwrap().session.clone()
    }

    /// The final failure recorded on either direction, response side first.
    pub fn cause(&self) -> Option<Arc<Error>> {
        let state = self.inner.state.lock().unwrap();
        state
            .response_cause
            .clone()
            .or_else(|| state.request_cause.clone())
    }

    pub fn request_length(&self) -> u64 {
        self.inner.state.lock().unwrap().request_length
    }

    pub fn response_length(&self) -> u64 {
        self.inner.state.lock().unwrap().response_length
    }

    /// Time from submission to request end, once available.
    pub fn request_duration(&self) -> Option<std::time::Duration> {
        let state = self.inner.state.lock().unwrap();
        state
            .request_end_at
            .map(|end| end.saturating_duration_since(state.started_at))
    }

    /// Time from submission to response end, once available.
    pub fn total_duration(&self) -> Option<std::time::Duration> {
        let state = self.inner.state.lock().unwrap();
        state
            .response_end_at
            .map(|end| end.saturating_duration_since(state.started_at))
    }
}

impl Default for RequestLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RequestLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestLog")
            .field("flags", &self.inner.flags.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn properties_transition_once() {
        let log = RequestLog::new();
        log.set_response_headers(StatusCode::OK, HeaderMap::new());
        log.set_response_headers(StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new());
        assert_eq!(log.response_status(), Some(StatusCode::OK));
    }

    #[tokio::test]
    async fn observers_fire_in_registration_order() {
        let log = RequestLog::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = order.clone();
            log.on(LogProperty::RequestEnd, move |_| {
                order.lock().unwrap().push(n)
            });
        }
        log.end_request();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn late_observer_fires_immediately() {
        let log = RequestLog::new();
        log.end_request();
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = fired.clone();
        log.on(LogProperty::RequestEnd, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn completion_requires_both_directions() {
        let log = RequestLog::new();
        let complete = Arc::new(AtomicUsize::new(0));
        let seen = complete.clone();
        log.on_complete(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        log.end_request();
        assert_eq!(complete.load(Ordering::SeqCst), 0);
        log.end_response();
        assert_eq!(complete.load(Ordering::SeqCst), 1);
        assert!(log.is_complete());
    }
}
