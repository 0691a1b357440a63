//! Circuit-breaking decorator.
//!
//! Breakers are scoped per host, per method, or per host-and-method. Each
//! breaker runs the three-state machine Closed → Open → HalfOpen over a
//! [`SlidingWindowCounter`]; while Open, requests fail with `FailFast`
//! without touching the transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::StatusCode;
use tokio::time::Instant;

use crate::body::Body;
use crate::context::ClientRequestContext;
use crate::error::{Error, ErrorKind};
use crate::metrics::SlidingWindowCounter;
use crate::service::{BoxFuture, HttpClient, SharedHttpClient};

/// How breaker instances are keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerScope {
    PerHost,
    PerMethod,
    PerHostAndMethod,
}

/// Distinguishes failures from successes; the default counts transport
/// failures and 5xx responses as failures.
pub type FailurePredicate =
    Arc<dyn Fn(Option<StatusCode>, Option<&Error>) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct CircuitBreakerConfig {
    pub scope: BreakerScope,
    pub minimum_request_threshold: u64,
    pub failure_rate_threshold: f64,
    pub counter_window: Duration,
    pub counter_bucket: Duration,
    /// How long an opened circuit stays open before permitting a probe.
    pub circuit_open_window: Duration,
    /// Spacing between half-open trial requests.
    pub trial_request_interval: Duration,
    pub failure_predicate: FailurePredicate,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            scope: BreakerScope::PerHost,
            minimum_request_threshold: 10,
            failure_rate_threshold: 0.5,
            counter_window: Duration::from_secs(20),
            counter_bucket: Duration::from_secs(2),
            circuit_open_window: Duration::from_secs(10),
            trial_request_interval: Duration::from_secs(3),
            failure_predicate: Arc::new(|status, cause| match (status, cause) {
                (_, Some(_)) => true,
                (Some(status), None) => status.is_server_error(),
                (None, None) => false,
            }),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn scope(mut self, scope: BreakerScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn minimum_request_threshold(mut self, threshold: u64) -> Self {
        self.minimum_request_threshold = threshold;
        self
    }

    pub fn failure_rate_threshold(mut self, threshold: f64) -> Self {
        self.failure_rate_threshold = threshold;
        self
    }

    pub fn counter_update_interval(mut self, interval: Duration) -> Self {
        // The counter is bucketised by this interval. Closed→Open is
        // evaluated at the next update boundary, never inline with the
        // outcome that crossed the threshold.
        self.counter_bucket = interval.max(Duration::from_millis(1));
        self
    }

    pub fn circuit_open_window(mut self, window: Duration) -> Self {
        self.circuit_open_window = window;
        self
    }

    pub fn trial_request_interval(mut self, interval: Duration) -> Self {
        self.trial_request_interval = interval;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

struct StateCell {
    state: State,
    since: Instant,
    last_trial: Option<Instant>,
}

struct Breaker {
    config: CircuitBreakerConfig,
    counter: SlidingWindowCounter,
    cell: Mutex<StateCell>,
}

impl Breaker {
    fn new(config: CircuitBreakerConfig) -> Self {
        let counter = SlidingWindowCounter::new(config.counter_window, config.counter_bucket);
        Breaker {
            config,
            counter,
            cell: Mutex::new(StateCell {
                state: State::Closed,
                since: Instant::now(),
                last_trial: None,
            }),
        }
    }

    /// Whether a request may proceed right now.
    fn try_acquire(&self) -> bool {
        let mut cell = self.cell.lock().unwrap();
        let now = Instant::now();
        match cell.state {
            State::Closed => true,
            State::Open => {
                if now.saturating_duration_since(cell.since) >= self.config.circuit_open_window {
                    cell.state = State::HalfOpen;
                    cell.since = now;
                    cell.last_trial = Some(now);
                    true
                } else {
                    false
                }
            }
            State::HalfOpen => match cell.last_trial {
                None => {
                    cell.last_trial = Some(now);
                    true
                }
                Some(last) => {
                    if now.saturating_duration_since(last)
                        >= self.config.trial_request_interval
                    {
                        cell.last_trial = Some(now);
                        true
                    } else {
                        false
                    }
                }
            },
        }
    }

    /// Whether the live window has crossed the failure threshold. Checked
    /// before each outcome is recorded: a crossing takes effect on the
    /// next update, and the attempt that crossed it has already been
    /// delivered.
    fn exceeded(&self) -> bool {
        let counts = self.counter.snapshot();
        counts.total() >= self.config.minimum_request_threshold
            && counts.failure_rate() >= self.config.failure_rate_threshold
    }

    fn on_success(&self) {
        let mut cell = self.cell.lock().unwrap();
        match cell.state {
            State::HalfOpen => {
                cell.state = State::Closed;
                cell.since = Instant::now();
                cell.last_trial = None;
                self.counter.reset();
            }
            State::Closed => {
                if self.exceeded() {
                    cell.state = State::Open;
                    cell.since = Instant::now();
                    return;
                }
                self.counter.record_success();
            }
            State::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut cell = self.cell.lock().unwrap();
        match cell.state {
            State::HalfOpen => {
                cell.state = State::Open;
                cell.since = Instant::now();
            }
            State::Closed => {
                if self.exceeded() {
                    cell.state = State::Open;
                    cell.since = Instant::now();
                    return;
                }
                self.counter.record_failure();
            }
            State::Open => {}
        }
    }
}

pub(crate) struct CircuitBreakerClient {
    inner: SharedHttpClient,
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<Breaker>>>,
}

impl CircuitBreakerClient {
    pub(crate) fn new(inner: SharedHttpClient, config: CircuitBreakerConfig) -> Self {
        CircuitBreakerClient {
            inner,
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn breaker_for(&self, ctx: &ClientRequestContext) -> Arc<Breaker> {
        let key = match self.config.scope {
            BreakerScope::PerHost => ctx.endpoint().authority(),
            BreakerScope::PerMethod => ctx.method().to_string(),
            BreakerScope::PerHostAndMethod => {
                format!("{}#{}", ctx.endpoint().authority(), ctx.method())
            }
        };
        self.breakers
            .lock()
            .unwrap()
            .entry(key)
            .or_insert_with(|| Arc::new(Breaker::new(self.config.clone())))
            .clone()
    }
}

impl HttpClient for CircuitBreakerClient {
    fn execute(
        &self,
        ctx: ClientRequestContext,
        request: http::Request<Body>,
    ) -> BoxFuture<'static, Result<http::Response<Body>, Error>> {
        let breaker = self.breaker_for(&ctx);
        if !breaker.try_acquire() {
            return Box::pin(async move {
                Err(Error::new(ErrorKind::FailFast)
                    .with(format!("circuit breaker is open for {}", ctx.endpoint())))
            });
        }

        let inner = self.inner.clone();
        let predicate = self.config.failure_predicate.clone();
        Box::pin(async move {
            let result = inner.execute(ctx, request).await;
            match &result {
                Ok(response) => {
                    if predicate(Some(response.status()), None) {
                        breaker.on_failure();
                    } else {
                        breaker.on_success();
                    }
                }
                Err(cause) => {
                    if predicate(None, Some(cause)) {
                        breaker.on_failure();
                    } else {
                        breaker.on_success();
                    }
                }
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextDefaults, ExchangeType};
    use crate::endpoint::Endpoint;
    use crate::session::SessionProtocol;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedStatus {
        status: StatusCode,
        calls: Arc<AtomicU32>,
    }

    impl HttpClient for FixedStatus {
        fn execute(
            &self,
            _ctx: ClientRequestContext,
            _request: http::Request<Body>,
        ) -> BoxFuture<'static, Result<http::Response<Body>, Error>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let status = self.status;
            Box::pin(async move {
                let mut response = http::Response::new(Body::empty());
                *response.status_mut() = status;
                Ok(response)
            })
        }
    }

    fn ctx() -> ClientRequestContext {
        ClientRequestContext::new(
            SessionProtocol::H1C,
            Endpoint::new("flaky.example").unwrap(),
            http::Method::GET,
            "/".into(),
            None,
            ExchangeType::ResponseStreaming,
            ContextDefaults::default(),
        )
    }

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig::default()
            .minimum_request_threshold(2)
            .failure_rate_threshold(1.0)
            .counter_update_interval(Duration::from_millis(1))
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_fails_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let client = CircuitBreakerClient::new(
            Arc::new(FixedStatus {
                status: StatusCode::SERVICE_UNAVAILABLE,
                calls: calls.clone(),
            }),
            config(),
        );

        for _ in 0..3 {
            let response = client
                .execute(ctx(), http::Request::new(Body::empty()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        }

        // The breaker is now open: the transport must not be touched.
        let err = client
            .execute(ctx(), http::Request::new(Body::empty()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailFast);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_probe_closes_on_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let failing = Arc::new(FixedStatus {
            status: StatusCode::SERVICE_UNAVAILABLE,
            calls: calls.clone(),
        });
        let client = CircuitBreakerClient::new(failing, config());

        for _ in 0..3 {
            let _ = client.execute(ctx(), http::Request::new(Body::empty())).await;
        }
        assert_eq!(
            client
                .execute(ctx(), http::Request::new(Body::empty()))
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::FailFast
        );

        // After the open window a single probe is permitted. Swap the
        // breaker's view by waiting and sending a success through a healthy
        // inner client.
        tokio::time::advance(Duration::from_secs(11)).await;
        let healthy = CircuitBreakerClient {
            inner: Arc::new(FixedStatus {
                status: StatusCode::OK,
                calls: calls.clone(),
            }),
            config: config(),
            breakers: Mutex::new(
                client
                    .breakers
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
        };
        let response = healthy
            .execute(ctx(), http::Request::new(Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Back to Closed: requests flow freely again.
        let response = healthy
            .execute(ctx(), http::Request::new(Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn scopes_key_independent_breakers() {
        let calls = Arc::new(AtomicU32::new(0));
        let client = CircuitBreakerClient::new(
            Arc::new(FixedStatus {
                status: StatusCode::SERVICE_UNAVAILABLE,
                calls: calls.clone(),
            }),
            config().scope(BreakerScope::PerHostAndMethod),
        );
        for _ in 0..3 {
            let _ = client.execute(ctx(), http::Request::new(Body::empty())).await;
        }

        // Same host, different method: separate breaker, still closed.
        let post_ctx = ClientRequestContext::new(
            SessionProtocol::H1C,
            Endpoint::new("flaky.example").unwrap(),
            http::Method::POST,
            "/".into(),
            None,
            ExchangeType::ResponseStreaming,
            ContextDefaults::default(),
        );
        let response = client
            .execute(post_ctx, http::Request::new(Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
