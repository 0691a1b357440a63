//! The client front.
//!
//! A [`WebClient`] is a configured facade over the execution pipeline: it
//! resolves the target endpoint, builds a [`ClientRequestContext`] per
//! call, and hands the request to the decorator chain. Clients are cheap
//! to clone and share one pool.

pub mod options;

use std::sync::Arc;

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Uri};

use crate::body::Body;
use crate::context::{
    ClientRequestContext, ContextDefaults, ExchangeType,
};
use crate::dns::{CachingResolver, DnsCache, SystemResolver};
use crate::endpoint::{Endpoint, EndpointGroup, EndpointSelector, RoundRobin, StaticEndpointGroup};
use crate::error::{Error, ErrorKind};
use crate::event::{
    attach_log_listener, ConnectionEventListener, ConnectionPoolListener,
    LoggingConnectionEventListener, RequestLogListener,
};
use crate::pool::outlier::OutlierDetection;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::response::{aggregate, AggregatedResponse};
use crate::service::circuit_breaker::{CircuitBreakerClient, CircuitBreakerConfig};
use crate::service::redirect::{RedirectConfig, RedirectingClient};
use crate::service::retry::{RetryConfig, RetryingClient};
use crate::service::transport::TransportClient;
use crate::service::user_agent::UserAgentClient;
use crate::service::{compose, BoxFuture, Decorator, SharedHttpClient};
use crate::session::h2::H2Config;
use crate::session::SessionProtocol;
use crate::tls::{TlsKeyPair, TlsContextCache, TlsSettings};

pub use options::{ClientOptions, RequestOptions};

#[derive(Clone)]
enum Target {
    /// The client carries a base target; request URIs are paths and an
    /// additional authority changes only the header, never the connect
    /// target.
    Base {
        protocol: SessionProtocol,
        path_prefix: String,
        group: Arc<dyn EndpointGroup>,
        selector: Arc<dyn EndpointSelector>,
    },
    /// No base URI: every request carries an absolute URI that determines
    /// the endpoint.
    PerRequest,
}

#[derive(Clone)]
struct BuilderState {
    options: ClientOptions,
    target: Target,
    default_headers: HeaderMap,
    user_agent: Option<HeaderValue>,
    tls: TlsSettings,
    decorators: Vec<Decorator>,
    retry: Option<RetryConfig>,
    circuit_breaker: Option<CircuitBreakerConfig>,
    redirects: Option<RedirectConfig>,
    events: Option<Arc<dyn ConnectionEventListener>>,
    pool_listener: Option<Arc<dyn ConnectionPoolListener>>,
    log_listener: Option<Arc<dyn RequestLogListener>>,
    outlier: Option<OutlierDetection>,
}

struct ClientInner {
    state: BuilderState,
    chain: SharedHttpClient,
    pool: ConnectionPool,
}

/// An HTTP client over pooled HTTP/1.1 and HTTP/2 connections.
#[derive(Clone)]
pub struct WebClient {
    inner: Arc<ClientInner>,
}

impl WebClient {
    /// A builder rooted at `base_uri` (e.g. `"http://api.example:8080"`;
    /// the schemes `h1`, `h1c`, `h2` and `h2c` pin the protocol).
    pub fn builder(base_uri: impl AsRef<str>) -> Result<WebClientBuilder, Error> {
        let uri: Uri = base_uri
            .as_ref()
            .parse()
            .map_err(|e| Error::new(ErrorKind::InvalidUri).with(e))?;
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| Error::new(ErrorKind::InvalidUri).with("base URI needs a scheme"))?
            .to_owned();
        let authority = uri
            .authority()
            .ok_or_else(|| Error::new(ErrorKind::InvalidUri).with("base URI needs an authority"))?;
        let endpoint = Endpoint::parse(authority.as_str())?;
        let path_prefix = uri.path().trim_end_matches('/').to_owned();

        let mut builder = WebClientBuilder::new(Target::PerRequest);
        builder.scheme = Some(scheme);
        builder.pending_group = Some(PendingGroup {
            group: Arc::new(StaticEndpointGroup::of(endpoint)),
            selector: Arc::new(RoundRobin::new()),
            path_prefix,
        });
        Ok(builder)
    }

    /// A builder over a dynamic endpoint group.
    pub fn builder_for_group(
        scheme: impl AsRef<str>,
        group: Arc<dyn EndpointGroup>,
        selector: Arc<dyn EndpointSelector>,
    ) -> WebClientBuilder {
        let mut builder = WebClientBuilder::new(Target::PerRequest);
        builder.scheme = Some(scheme.as_ref().to_owned());
        builder.pending_group = Some(PendingGroup {
            group,
            selector,
            path_prefix: String::new(),
        });
        builder
    }

    /// A client without a base URI: request URIs must be absolute, and the
    /// request authority determines the connect target.
    pub fn without_base() -> WebClientBuilder {
        WebClientBuilder::new(Target::PerRequest)
    }

    /// A builder carrying this client's exact configuration; building it
    /// unchanged yields an equivalent client.
    pub fn to_builder(&self) -> WebClientBuilder {
        WebClientBuilder::from_state(self.inner.state.clone())
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.state.options
    }

    /// Executes one request, returning the streaming response.
    pub async fn execute(
        &self,
        request: http::Request<Body>,
    ) -> Result<http::Response<Body>, Error> {
        let state = &self.inner.state;
        let request_options = request
            .extensions()
            .get::<RequestOptions>()
            .cloned()
            .unwrap_or_default();

        let (endpoint, protocol, path, query) = match &state.target {
            Target::Base {
                protocol,
                path_prefix,
                group,
                selector,
            } => {
                let snapshot = group.endpoints();
                let endpoint = selector
                    .select(&snapshot, request.uri(), request.headers())
                    .ok_or_else(|| {
                        Error::new(ErrorKind::EmptyEndpointGroup)
                            .with("endpoint selection yielded no endpoint")
                    })?;
                let path = format!("{path_prefix}{}", request.uri().path());
                (
                    endpoint,
                    *protocol,
                    path,
                    request.uri().query().map(str::to_owned),
                )
            }
            Target::PerRequest => {
                let uri = request.uri();
                let authority = uri.authority().ok_or_else(|| {
                    Error::new(ErrorKind::InvalidUri)
                        .with("a client without a base URI requires absolute request URIs")
                })?;
                let scheme = uri.scheme_str().ok_or_else(|| {
                    Error::new(ErrorKind::InvalidUri)
                        .with("a client without a base URI requires absolute request URIs")
                })?;
                let protocol = protocol_for_scheme(scheme, state.options.prefer_http1)?;
                (
                    Endpoint::parse(authority.as_str())?,
                    protocol,
                    uri.path().to_owned(),
                    uri.query().map(str::to_owned),
                )
            }
        };

        let exchange_type = request_options
            .exchange_type
            .unwrap_or_else(|| ExchangeType::derive(request.body().content_length().is_some()));
        let defaults = ContextDefaults {
            response_timeout: request_options
                .response_timeout
                .or(state.options.response_timeout),
            write_timeout: request_options.write_timeout.or(state.options.write_timeout),
            max_response_length: request_options
                .max_response_length
                .or(state.options.max_response_length),
            auto_abort_delay: request_options
                .auto_abort_delay
                .unwrap_or(state.options.request_auto_abort_delay),
        };

        let ctx = ClientRequestContext::new(
            protocol,
            endpoint,
            request.method().clone(),
            path,
            query,
            exchange_type,
            defaults,
        );
        if let Some(listener) = &state.log_listener {
            attach_log_listener(ctx.log(), listener.clone());
        }

        // The context is current while the chain assembles its futures;
        // decorator bodies observing `context::current()` synchronously see
        // this request.
        let response = {
            let _guard = ctx.push()?;
            self.inner.chain.execute(ctx, request)
        };
        response.await
    }

    /// Executes and buffers the response, enforcing the configured
    /// `max_response_length`. An aggregating call with a fixed request is
    /// a unary exchange unless the caller said otherwise.
    pub async fn execute_aggregated(
        &self,
        mut request: http::Request<Body>,
    ) -> Result<AggregatedResponse, Error> {
        let mut request_options = request
            .extensions()
            .get::<RequestOptions>()
            .cloned()
            .unwrap_or_default();
        let limit = request_options
            .max_response_length
            .or(self.inner.state.options.max_response_length);
        if request_options.exchange_type.is_none()
            && request.body().content_length().is_some()
        {
            request_options.exchange_type = Some(ExchangeType::Unary);
            request.extensions_mut().insert(request_options);
        }
        let response = self.execute(request).await?;
        aggregate(response, limit).await
    }

    pub async fn get(&self, path_or_uri: impl AsRef<str>) -> Result<AggregatedResponse, Error> {
        self.send(Method::GET, path_or_uri.as_ref(), Body::empty()).await
    }

    pub async fn head(&self, path_or_uri: impl AsRef<str>) -> Result<AggregatedResponse, Error> {
        self.send(Method::HEAD, path_or_uri.as_ref(), Body::empty()).await
    }

    pub async fn post(
        &self,
        path_or_uri: impl AsRef<str>,
        body: impl Into<Body>,
    ) -> Result<AggregatedResponse, Error> {
        self.send(Method::POST, path_or_uri.as_ref(), body.into()).await
    }

    pub async fn put(
        &self,
        path_or_uri: impl AsRef<str>,
        body: impl Into<Body>,
    ) -> Result<AggregatedResponse, Error> {
        self.send(Method::PUT, path_or_uri.as_ref(), body.into()).await
    }

    pub async fn delete(&self, path_or_uri: impl AsRef<str>) -> Result<AggregatedResponse, Error> {
        self.send(Method::DELETE, path_or_uri.as_ref(), Body::empty()).await
    }

    async fn send(
        &self,
        method: Method,
        target: &str,
        body: Body,
    ) -> Result<AggregatedResponse, Error> {
        let mut request = http::Request::new(body);
        *request.method_mut() = method;
        *request.uri_mut() = target
            .parse()
            .map_err(|e| Error::new(ErrorKind::InvalidUri).with(e))?;
        self.execute_aggregated(request).await
    }

    /// The number of currently open pooled connections.
    pub fn open_connections(&self) -> usize {
        self.inner.pool.session_count()
    }

    /// The DNS layer backing this client's pool.
    pub fn dns_cache(&self) -> &DnsCache {
        self.inner.pool.resolver().cache()
    }
}

impl std::fmt::Debug for WebClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebClient").finish()
    }
}

impl WebClient {
    /// Wraps this client in a tower [`Layer`], for interop with tower
    /// middleware stacks.
    ///
    /// [`Layer`]: tower_layer::Layer
    pub fn wrap_with<L>(&self, layer: L) -> L::Service
    where
        L: tower_layer::Layer<WebClient>,
    {
        layer.layer(self.clone())
    }
}

impl tower_service::Service<http::Request<Body>> for WebClient {
    type Response = http::Response<Body>;
    type Error = Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<Body>) -> Self::Future {
        let client = self.clone();
        Box::pin(async move { client.execute(request).await })
    }
}

#[derive(Clone)]
struct PendingGroup {
    group: Arc<dyn EndpointGroup>,
    selector: Arc<dyn EndpointSelector>,
    path_prefix: String,
}

/// Configures and builds a [`WebClient`].
pub struct WebClientBuilder {
    state: BuilderState,
    scheme: Option<String>,
    pending_group: Option<PendingGroup>,
}

impl WebClientBuilder {
    fn new(target: Target) -> Self {
        WebClientBuilder {
            state: BuilderState {
                options: ClientOptions::default(),
                target,
                default_headers: HeaderMap::new(),
                user_agent: None,
                tls: TlsSettings::default(),
                decorators: Vec::new(),
                retry: None,
                circuit_breaker: None,
                redirects: None,
                events: None,
                pool_listener: None,
                log_listener: None,
                outlier: None,
            },
            scheme: None,
            pending_group: None,
        }
    }

    fn from_state(state: BuilderState) -> Self {
        WebClientBuilder {
            state,
            scheme: None,
            pending_group: None,
        }
    }

    /// Replaces the full option set.
    pub fn options(mut self, options: ClientOptions) -> Self {
        self.state.options = options;
        self
    }

    /// Mutates the option set in place.
    pub fn with_options(mut self, f: impl FnOnce(&mut ClientOptions)) -> Self {
        f(&mut self.state.options);
        self
    }

    /// A header sent with every request unless overridden per request.
    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.state.default_headers.append(name, value);
        self
    }

    /// Prefix prepended to the built-in user agent.
    pub fn user_agent(mut self, value: HeaderValue) -> Self {
        self.state.user_agent = Some(value);
        self
    }

    pub fn tls(mut self, settings: TlsSettings) -> Self {
        self.state.tls = settings;
        self
    }

    pub fn tls_key_pair(mut self, pair: TlsKeyPair) -> Self {
        self.state.tls.key_pairs.push(pair);
        self
    }

    pub fn tls_no_verify_host(mut self, host: impl Into<String>) -> Self {
        self.state.tls.no_verify_hosts.push(host.into());
        self
    }

    /// A user decorator; decorators registered first sit outermost.
    pub fn decorator(mut self, decorator: Decorator) -> Self {
        self.state.decorators.push(decorator);
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.state.retry = Some(config);
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.state.circuit_breaker = Some(config);
        self
    }

    /// Follow redirects with the given policy. Cross-host redirects are
    /// permitted by default only for clients without a base URI.
    pub fn follow_redirects(mut self, config: RedirectConfig) -> Self {
        self.state.redirects = Some(config);
        self
    }

    pub fn connection_events(mut self, listener: Arc<dyn ConnectionEventListener>) -> Self {
        self.state.events = Some(listener);
        self
    }

    pub fn pool_events(mut self, listener: Arc<dyn ConnectionPoolListener>) -> Self {
        self.state.pool_listener = Some(listener);
        self
    }

    pub fn request_logs(mut self, listener: Arc<dyn RequestLogListener>) -> Self {
        self.state.log_listener = Some(listener);
        self
    }

    pub fn outlier_detection(mut self, detection: OutlierDetection) -> Self {
        self.state.outlier = Some(detection);
        self
    }

    /// Builds the client. Must be called within a tokio runtime (the DNS
    /// cache and pool spawn background tasks).
    pub fn build(mut self) -> Result<WebClient, Error> {
        if let (Some(scheme), Some(pending)) = (self.scheme.take(), self.pending_group.take()) {
            let protocol = protocol_for_scheme(&scheme, self.state.options.prefer_http1)?;
            self.state.target = Target::Base {
                protocol,
                path_prefix: pending.path_prefix,
                group: pending.group,
                selector: pending.selector,
            };
        }
        let state = self.state;
        let options = &state.options;

        if let Target::Base { group, .. } = &state.target {
            if !options.allow_empty_endpoints && group.endpoints().is_empty() {
                return Err(Error::new(ErrorKind::EmptyEndpointGroup)
                    .with("endpoint group is empty at build time"));
            }
        }

        let mut tls = state.tls.clone();
        tls.no_verify |= options.tls_no_verify;

        let cache = DnsCache::new(options.dns.clone());
        let resolver = CachingResolver::new(
            cache,
            Arc::new(SystemResolver::new()),
            options.dns_query_timeout,
        );
        let events: Arc<dyn ConnectionEventListener> = state
            .events
            .clone()
            .unwrap_or_else(|| Arc::new(LoggingConnectionEventListener));

        let pool = ConnectionPool::new(
            PoolConfig {
                connect_timeout: options.connect_timeout,
                idle_timeout: options.idle_timeout,
                ping_interval: options.ping_interval,
                max_connection_age: options.max_connection_age,
                preface_timeout: options.preface_timeout,
                max_pending_acquisitions: options.max_pending_acquisitions,
                max_sessions_per_endpoint: options.max_num_event_loops_per_endpoint,
                use_http2_preface: options.use_http2_preface,
                h2: H2Config {
                    initial_stream_window_size: options.http2_initial_stream_window_size,
                    initial_connection_window_size: options.http2_initial_connection_window_size,
                },
                h1_ping_path: options.h1_ping_path.clone(),
            },
            resolver,
            Arc::new(TlsContextCache::new(tls)),
            events,
            state.pool_listener.clone(),
            state.outlier.clone(),
        );

        let mut chain: SharedHttpClient =
            Arc::new(TransportClient::new(pool.clone(), state.default_headers.clone()));
        chain = Arc::new(UserAgentClient::new(chain, state.user_agent.clone()));
        if let Some(redirects) = &state.redirects {
            let mut config = redirects.clone();
            config.max_redirects = config.max_redirects.min(options.max_redirects);
            if matches!(state.target, Target::PerRequest) {
                config.allow_cross_host = true;
            }
            chain = Arc::new(RedirectingClient::new(chain, config));
        }
        if let Some(circuit_breaker) = &state.circuit_breaker {
            chain = Arc::new(CircuitBreakerClient::new(chain, circuit_breaker.clone()));
        }
        if let Some(retry) = &state.retry {
            let config = retry.clone().max_total_attempts(options.max_total_attempts);
            chain = Arc::new(RetryingClient::new(chain, config));
        }
        let chain = compose(chain, &state.decorators);

        Ok(WebClient {
            inner: Arc::new(ClientInner { state, chain, pool }),
        })
    }
}

fn protocol_for_scheme(scheme: &str, prefer_http1: bool) -> Result<SessionProtocol, Error> {
    match scheme {
        "https" => Ok(if prefer_http1 {
            SessionProtocol::H1
        } else {
            SessionProtocol::H2
        }),
        "http" => Ok(if prefer_http1 {
            SessionProtocol::H1C
        } else {
            SessionProtocol::H2C
        }),
        "h1" => Ok(SessionProtocol::H1),
        "h1c" => Ok(SessionProtocol::H1C),
        "h2" => Ok(SessionProtocol::H2),
        "h2c" => Ok(SessionProtocol::H2C),
        other => Err(Error::new(ErrorKind::InvalidUri)
            .with(format!("unsupported scheme {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(WebClient: Send, Sync, Clone);
    assert_impl_all!(Body: Send);

    #[test]
    fn scheme_mapping_honors_prefer_http1() {
        assert_eq!(
            protocol_for_scheme("https", false).unwrap(),
            SessionProtocol::H2
        );
        assert_eq!(
            protocol_for_scheme("https", true).unwrap(),
            SessionProtocol::H1
        );
        assert_eq!(
            protocol_for_scheme("http", false).unwrap(),
            SessionProtocol::H2C
        );
        assert_eq!(
            protocol_for_scheme("h1c", true).unwrap(),
            SessionProtocol::H1C
        );
        assert!(protocol_for_scheme("ftp", false).is_err());
    }

    #[tokio::test]
    async fn rebuilding_preserves_options_and_target() {
        let client = WebClient::builder("http://api.example:8080")
            .unwrap()
            .with_options(|o| {
                o.max_redirects = 4;
                o.prefer_http1 = true;
            })
            .default_header(
                HeaderName::from_static("x-team"),
                HeaderValue::from_static("core"),
            )
            .build()
            .unwrap();

        let rebuilt = client.to_builder().build().unwrap();
        assert_eq!(client.options(), rebuilt.options());
        assert_eq!(
            rebuilt.inner.state.default_headers["x-team"],
            "core"
        );
        match (&client.inner.state.target, &rebuilt.inner.state.target) {
            (
                Target::Base {
                    protocol: a,
                    group: ga,
                    ..
                },
                Target::Base {
                    protocol: b,
                    group: gb,
                    ..
                },
            ) => {
                assert_eq!(a, b);
                assert_eq!(*ga.endpoints(), *gb.endpoints());
            }
            _ => panic!("expected base targets"),
        }
    }

    #[tokio::test]
    async fn empty_group_fails_at_build_unless_allowed() {
        let group: Arc<dyn EndpointGroup> =
            Arc::new(crate::endpoint::DynamicEndpointGroup::new());
        let err = WebClient::builder_for_group("http", group.clone(), Arc::new(RoundRobin::new()))
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyEndpointGroup);

        let client = WebClient::builder_for_group("http", group, Arc::new(RoundRobin::new()))
            .with_options(|o| o.allow_empty_endpoints = true)
            .build()
            .unwrap();
        let err = client
            .get("/")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyEndpointGroup);
    }

    #[tokio::test]
    async fn without_base_requires_absolute_uris() {
        let client = WebClient::without_base().build().unwrap();
        let err = client.get("/relative").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUri);
    }

    #[tokio::test]
    async fn client_is_usable_as_a_tower_service() {
        use tower::ServiceExt;

        let client = WebClient::without_base().build().unwrap();
        let err = client
            .clone()
            .oneshot(http::Request::new(Body::empty()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUri);
    }
}
