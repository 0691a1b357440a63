//! Client-wide and per-request options.

use std::time::Duration;

use crate::context::ExchangeType;
use crate::dns::DnsCacheConfig;

/// Client-wide configuration. Durations that disable a feature when unset
/// are `Option`s rather than zero sentinels.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    /// Close a connection with no unfinished streams after this long.
    pub idle_timeout: Option<Duration>,
    /// PING cadence on pooled connections.
    pub ping_interval: Option<Duration>,
    /// Close a connection this long after it was opened, regardless of
    /// activity.
    pub max_connection_age: Option<Duration>,
    pub connect_timeout: Duration,
    /// Response deadline, measured from request end.
    pub response_timeout: Option<Duration>,
    /// Per-write deadline.
    pub write_timeout: Option<Duration>,
    /// Parallel sessions per endpoint; `0` is unbounded.
    pub max_num_event_loops_per_endpoint: usize,
    /// Acquisitions that may queue behind an in-flight connect.
    pub max_pending_acquisitions: usize,
    /// Hard ceiling on attempts when a retry rule is installed.
    pub max_total_attempts: u32,
    pub max_redirects: u32,
    pub http2_initial_connection_window_size: Option<u32>,
    pub http2_initial_stream_window_size: Option<u32>,
    /// Open cleartext HTTP/2 with the connection preface instead of the
    /// `Upgrade: h2c` probe.
    pub use_http2_preface: bool,
    /// Prefer HTTP/1.1 even where HTTP/2 would be negotiated.
    pub prefer_http1: bool,
    pub tls_no_verify: bool,
    /// Permit building a client over a group that is currently empty.
    pub allow_empty_endpoints: bool,
    /// Grace period before an open request stream is aborted once its
    /// response has completed.
    pub request_auto_abort_delay: Duration,
    pub max_response_length: Option<u64>,
    /// How long to wait for the HTTP/2 server preface.
    pub preface_timeout: Duration,
    /// Optional path probed by HTTP/1.1 keep-alive pings.
    pub h1_ping_path: Option<String>,
    pub dns: DnsCacheConfig,
    pub dns_query_timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            idle_timeout: Some(Duration::from_secs(10)),
            ping_interval: None,
            max_connection_age: None,
            connect_timeout: Duration::from_secs(10),
            response_timeout: Some(Duration::from_secs(15)),
            write_timeout: None,
            max_num_event_loops_per_endpoint: 0,
            max_pending_acquisitions: usize::MAX,
            max_total_attempts: 3,
            max_redirects: 10,
            http2_initial_connection_window_size: None,
            http2_initial_stream_window_size: None,
            use_http2_preface: false,
            prefer_http1: false,
            tls_no_verify: false,
            allow_empty_endpoints: false,
            request_auto_abort_delay: Duration::ZERO,
            max_response_length: None,
            preface_timeout: Duration::from_secs(15),
            h1_ping_path: None,
            dns: DnsCacheConfig::default(),
            dns_query_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// Per-request overrides, attached to a request via its extensions:
///
/// ```
/// # use presto::client::RequestOptions;
/// # use std::time::Duration;
/// let mut request = http::Request::new(presto::Body::empty());
/// request.extensions_mut().insert(
///     RequestOptions::new().response_timeout(Duration::from_secs(3)),
/// );
/// ```
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub(crate) response_timeout: Option<Duration>,
    pub(crate) write_timeout: Option<Duration>,
    pub(crate) max_response_length: Option<u64>,
    pub(crate) exchange_type: Option<ExchangeType>,
    pub(crate) auto_abort_delay: Option<Duration>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    pub fn max_response_length(mut self, limit: u64) -> Self {
        self.max_response_length = Some(limit);
        self
    }

    /// Overrides the derived exchange type.
    pub fn exchange_type(mut self, exchange_type: ExchangeType) -> Self {
        self.exchange_type = Some(exchange_type);
        self
    }

    pub fn auto_abort_delay(mut self, delay: Duration) -> Self {
        self.auto_abort_delay = Some(delay);
        self
    }
}
