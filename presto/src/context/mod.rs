//! Per-request state.
//!
//! A [`ClientRequestContext`] is created when a request is submitted and
//! lives until its response stream completes. Decorators may mutate it up
//! to the point the wire request is frozen. Contexts are pushed onto a
//! thread-local stack while user code runs, so that nested client calls can
//! discover their enclosing scope.

pub mod log;
pub mod stack;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use uuid::Uuid;

pub use log::{LogProperty, RequestHead, RequestLog, SessionInfo};
pub use stack::{current, current_or_null, ContextGuard, RequestContext};

use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::session::SessionProtocol;

/// Whether each direction of the exchange is streamed or aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    Unary,
    RequestStreaming,
    ResponseStreaming,
    BidiStreaming,
}

impl ExchangeType {
    /// Derives the exchange type from the request body shape: a fixed
    /// request defaults to a streaming response, a streaming request to a
    /// bidirectional exchange. An explicit per-request option overrides
    /// this.
    pub(crate) fn derive(request_fixed: bool) -> ExchangeType {
        if request_fixed {
            ExchangeType::ResponseStreaming
        } else {
            ExchangeType::BidiStreaming
        }
    }

    pub fn is_request_streaming(&self) -> bool {
        matches!(self, ExchangeType::RequestStreaming | ExchangeType::BidiStreaming)
    }

    pub fn is_response_streaming(&self) -> bool {
        matches!(self, ExchangeType::ResponseStreaming | ExchangeType::BidiStreaming)
    }
}

/// Handler invoked when the response timeout fires, instead of failing the
/// request outright. It may abort the request or response through the
/// context it receives.
pub type ResponseTimeoutHandler = Arc<dyn Fn(&ClientRequestContext) + Send + Sync>;

/// A minimal server-side scope, used as the root of client contexts
/// created while handling an inbound request.
#[derive(Clone)]
pub struct ServerContext {
    inner: Arc<ServerContextInner>,
}

struct ServerContextInner {
    id: Uuid,
}

impl ServerContext {
    pub fn new() -> Self {
        ServerContext {
            inner: Arc::new(ServerContextInner { id: Uuid::new_v4() }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Makes this the current context for the scope of the returned guard.
    pub fn push(&self) -> Result<ContextGuard, Error> {
        stack::push(RequestContext::Server(self.clone()))
    }

    pub(crate) fn same(&self, other: &ServerContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for ServerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext").field("id", &self.inner.id).finish()
    }
}

/// Defaults a context inherits from its client at creation time.
#[derive(Debug, Clone, Default)]
pub struct ContextDefaults {
    pub response_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub max_response_length: Option<u64>,
    pub auto_abort_delay: Duration,
}

struct MutableState {
    authority: Option<String>,
    additional_headers: HeaderMap,
    attributes: http::Extensions,
    response_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    max_response_length: Option<u64>,
    response_timeout_handler: Option<ResponseTimeoutHandler>,
    auto_abort_delay: Duration,
    response_aborter: Option<Arc<dyn Fn(Error) + Send + Sync>>,
}

struct ContextInner {
    id: Uuid,
    protocol: SessionProtocol,
    endpoint: Endpoint,
    method: Method,
    path: String,
    query: Option<String>,
    exchange_type: ExchangeType,
    root: Option<ServerContext>,
    parent: Option<ClientRequestContext>,
    log: RequestLog,
    state: Mutex<MutableState>,
}

/// Mutable per-request state, shared between the caller, decorators and the
/// transport.
#[derive(Clone)]
pub struct ClientRequestContext {
    inner: Arc<ContextInner>,
}

impl ClientRequestContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        protocol: SessionProtocol,
        endpoint: Endpoint,
        method: Method,
        path: String,
        query: Option<String>,
        exchange_type: ExchangeType,
        defaults: ContextDefaults,
    ) -> Self {
        ClientRequestContext {
            inner: Arc::new(ContextInner {
                id: Uuid::new_v4(),
                protocol,
                endpoint,
                method,
                path,
                query,
                exchange_type,
                // The root is whatever server scope is current where the
                // request is submitted.
                root: stack::ambient_root(),
                parent: None,
                log: RequestLog::new(),
                state: Mutex::new(MutableState {
                    authority: None,
                    additional_headers: HeaderMap::new(),
                    attributes: http::Extensions::new(),
                    response_timeout: defaults.response_timeout,
                    write_timeout: defaults.write_timeout,
                    max_response_length: defaults.max_response_length,
                    response_timeout_handler: None,
                    auto_abort_delay: defaults.auto_abort_delay,
                    response_aborter: None,
                }),
            }),
        }
    }

    /// Snapshot-copies this context for a retry attempt or an internal
    /// sub-request. Immutable fields are shared, additional headers and
    /// attributes are snapshotted, the log is fresh, and `parent` becomes
    /// this context. Later mutations of either context do not propagate to
    /// the other.
    pub fn new_derived(&self) -> ClientRequestContext {
        self.derive_with(
            self.inner.endpoint.clone(),
            self.inner.protocol,
            self.inner.path.clone(),
            self.inner.query.clone(),
        )
    }

    pub(crate) fn derive_with(
        &self,
        endpoint: Endpoint,
        protocol: SessionProtocol,
        path: String,
        query: Option<String>,
    ) -> ClientRequestContext {
        let state = self.inner.state.lock().unwrap();
        ClientRequestContext {
            inner: Arc::new(ContextInner {
                id: Uuid::new_v4(),
                protocol,
                endpoint,
                method: self.inner.method.clone(),
                path,
                query,
                exchange_type: self.inner.exchange_type,
                root: self.inner.root.clone(),
                parent: Some(self.clone()),
                log: RequestLog::new(),
                state: Mutex::new(MutableState {
                    authority: None,
                    additional_headers: state.additional_headers.clone(),
                    attributes: state.attributes.clone(),
                    response_timeout: state.response_timeout,
                    write_timeout: state.write_timeout,
                    max_response_length: state.max_response_length,
                    response_timeout_handler: state.response_timeout_handler.clone(),
                    auto_abort_delay: state.auto_abort_delay,
                    response_aborter: None,
                }),
            }),
        }
    }

    /// Makes this the current context for the scope of the returned guard.
    /// Re-pushing the context that is already current nests.
    pub fn push(&self) -> Result<ContextGuard, Error> {
        stack::push(RequestContext::Client(self.clone()))
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn protocol(&self) -> SessionProtocol {
        self.inner.protocol
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn query(&self) -> Option<&str> {
        self.inner.query.as_deref()
    }

    pub fn exchange_type(&self) -> ExchangeType {
        self.inner.exchange_type
    }

    /// The server context this client call was made under, if any.
    pub fn root(&self) -> Option<&ServerContext> {
        self.inner.root.as_ref()
    }

    /// The enclosing client context this one was derived from, if any.
    pub fn parent(&self) -> Option<&ClientRequestContext> {
        self.inner.parent.as_ref()
    }

    pub fn log(&self) -> &RequestLog {
        &self.inner.log
    }

    /// The effective `:authority`, once the request head has been frozen.
    pub fn authority(&self) -> Option<String> {
        self.inner.state.lock().unwrap().authority.clone()
    }

    pub(crate) fn freeze_authority(&self, authority: String) {
        self.inner.state.lock().unwrap().authority = Some(authority);
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        self.inner.state.lock().unwrap().response_timeout
    }

    pub fn set_response_timeout(&self, timeout: Option<Duration>) {
        self.inner.state.lock().unwrap().response_timeout = timeout;
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.inner.state.lock().unwrap().write_timeout
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        self.inner.state.lock().unwrap().write_timeout = timeout;
    }

    pub fn max_response_length(&self) -> Option<u64> {
        self.inner.state.lock().unwrap().max_response_length
    }

    pub fn set_max_response_length(&self, limit: Option<u64>) {
        self.inner.state.lock().unwrap().max_response_length = limit;
    }

    pub fn auto_abort_delay(&self) -> Duration {
        self.inner.state.lock().unwrap().auto_abort_delay
    }

    pub fn set_auto_abort_delay(&self, delay: Duration) {
        self.inner.state.lock().unwrap().auto_abort_delay = delay;
    }

    pub fn response_timeout_handler(&self) -> Option<ResponseTimeoutHandler> {
        self.inner.state.lock().unwrap().response_timeout_handler.clone()
    }

    pub fn set_response_timeout_handler(
        &self,
        handler: impl Fn(&ClientRequestContext) + Send + Sync + 'static,
    ) {
        self.inner.state.lock().unwrap().response_timeout_handler = Some(Arc::new(handler));
    }

    /// Aborts the in-flight response with `cause`; the abort propagates to
    /// the wire and, after the auto-abort delay, to the request stream.
    /// A no-op before the transport attaches the response.
    pub fn abort_response(&self, cause: Error) {
        let aborter = self.inner.state.lock().unwrap().response_aborter.clone();
        if let Some(aborter) = aborter {
            aborter(cause);
        }
    }

    pub(crate) fn set_response_aborter(&self, aborter: Arc<dyn Fn(Error) + Send + Sync>) {
        self.inner.state.lock().unwrap().response_aborter = Some(aborter);
    }

    /// Headers that take precedence over the request's own headers when the
    /// wire request is materialised.
    pub fn additional_headers(&self) -> HeaderMap {
        self.inner.state.lock().unwrap().additional_headers.clone()
    }

    pub fn add_additional_header(&self, name: HeaderName, value: HeaderValue) {
        self.inner
            .state
            .lock()
            .unwrap()
            .additional_headers
            .insert(name, value);
    }

    pub fn attr<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.inner.state.lock().unwrap().attributes.get::<T>().cloned()
    }

    pub fn set_attr<T: Clone + Send + Sync + 'static>(&self, value: T) {
        self.inner.state.lock().unwrap().attributes.insert(value);
    }

    pub(crate) fn same(&self, other: &ClientRequestContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn roots_match(&self, other: &ClientRequestContext) -> bool {
        match (&self.inner.root, &other.inner.root) {
            (None, None) => true,
            (Some(a), Some(b)) => a.same(b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for ClientRequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRequestContext")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .field("method", &self.inner.method)
            .field("path", &self.inner.path)
            .finish()
    }
}
