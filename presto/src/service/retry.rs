//! Retrying decorator.
//!
//! A [`RetryRule`] asynchronously decides per attempt whether to retry and
//! with which backoff. Every retry runs on a context derived from the
//! original, so logs and stream state are per-attempt while configuration
//! is shared. A [`RetryLimiter`] may veto retries; a panicking limiter
//! fails open.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};

use crate::body::Body;
use crate::context::ClientRequestContext;
use crate::error::Error;
use crate::service::{BoxFuture, HttpClient, SharedHttpClient};

/// What one attempt produced, as visible to a rule: the response head or
/// the failure.
pub struct AttemptOutcome<'a> {
    pub status: Option<StatusCode>,
    pub headers: Option<&'a HeaderMap>,
    pub cause: Option<&'a Error>,
}

/// Verdict for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given backoff.
    Retry(Duration),
    NoRetry,
}

/// Decides asynchronously whether an attempt's outcome warrants a retry.
pub trait RetryRule: Send + Sync + 'static {
    fn decide(
        &self,
        ctx: &ClientRequestContext,
        attempt: u32,
        outcome: AttemptOutcome<'_>,
    ) -> BoxFuture<'static, RetryDecision>;
}

/// Exponential backoff with full jitter disabled by default.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Backoff {
            initial,
            max,
            multiplier: 2.0,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Backoff {
            initial: delay,
            max: delay,
            multiplier: 1.0,
        }
    }

    pub fn without_delay() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// The delay before attempt `attempt + 1`, given `attempt` failures so
    /// far.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max.as_secs_f64()))
    }
}

/// Retries anything the transport reports as unprocessed: the request
/// never reached the server, so replay is always safe.
pub fn on_unprocessed(backoff: Backoff) -> Arc<dyn RetryRule> {
    rule_fn(move |_, attempt, outcome| match outcome.cause {
        Some(cause) if cause.is_unprocessed() => RetryDecision::Retry(backoff.delay(attempt)),
        _ => RetryDecision::NoRetry,
    })
}

/// Retries unprocessed failures, timeouts, and 5xx responses.
pub fn on_server_errors(backoff: Backoff) -> Arc<dyn RetryRule> {
    rule_fn(move |_, attempt, outcome| {
        let should = match (&outcome.status, &outcome.cause) {
            (Some(status), _) => status.is_server_error(),
            (_, Some(cause)) => cause.is_unprocessed() || cause.is_timeout(),
            _ => false,
        };
        if should {
            RetryDecision::Retry(backoff.delay(attempt))
        } else {
            RetryDecision::NoRetry
        }
    })
}

/// Wraps a synchronous decision function as a [`RetryRule`].
pub fn rule_fn<F>(f: F) -> Arc<dyn RetryRule>
where
    F: Fn(&ClientRequestContext, u32, AttemptOutcome<'_>) -> RetryDecision
        + Send
        + Sync
        + 'static,
{
    struct FnRule<F>(F);
    impl<F> RetryRule for FnRule<F>
    where
        F: Fn(&ClientRequestContext, u32, AttemptOutcome<'_>) -> RetryDecision
            + Send
            + Sync
            + 'static,
    {
        fn decide(
            &self,
            ctx: &ClientRequestContext,
            attempt: u32,
            outcome: AttemptOutcome<'_>,
        ) -> BoxFuture<'static, RetryDecision> {
            let decision = (self.0)(ctx, attempt, outcome);
            Box::pin(async move { decision })
        }
    }
    Arc::new(FnRule(f))
}

/// Vetoes retries. `None` means unlimited; a limiter that panics is
/// treated as allowing the retry.
pub trait RetryLimiter: Send + Sync + 'static {
    fn allow(&self, ctx: &ClientRequestContext, attempt: u32) -> bool;
}

impl<F> RetryLimiter for F
where
    F: Fn(&ClientRequestContext, u32) -> bool + Send + Sync + 'static,
{
    fn allow(&self, ctx: &ClientRequestContext, attempt: u32) -> bool {
        self(ctx, attempt)
    }
}

#[derive(Clone)]
pub struct RetryConfig {
    pub rule: Arc<dyn RetryRule>,
    pub max_total_attempts: u32,
    pub limiter: Option<Arc<dyn RetryLimiter>>,
}

impl RetryConfig {
    pub fn new(rule: Arc<dyn RetryRule>) -> Self {
        RetryConfig {
            rule,
            max_total_attempts: 3,
            limiter: None,
        }
    }

    pub fn max_total_attempts(mut self, attempts: u32) -> Self {
        self.max_total_attempts = attempts.max(1);
        self
    }

    pub fn limiter(mut self, limiter: Arc<dyn RetryLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }
}

pub(crate) struct RetryingClient {
    inner: SharedHttpClient,
    config: RetryConfig,
}

impl RetryingClient {
    pub(crate) fn new(inner: SharedHttpClient, config: RetryConfig) -> Self {
        RetryingClient { inner, config }
    }
}

impl HttpClient for RetryingClient {
    fn execute(
        &self,
        ctx: ClientRequestContext,
        request: http::Request<Body>,
    ) -> BoxFuture<'static, Result<http::Response<Body>, Error>> {
        let inner = self.inner.clone();
        let config = self.config.clone();
        Box::pin(async move {
            let (parts, body) = request.into_parts();

            // Only a fixed body can be replayed; a streaming request gets
            // exactly one attempt.
            if body.content_length().is_none() {
                let request = http::Request::from_parts(parts, body);
                return inner.execute(ctx, request).await;
            }
            let (payload, _) = body.collect_bytes(None).await?;

            let mut attempt: u32 = 0;
            loop {
                attempt += 1;
                let attempt_ctx = if attempt == 1 {
                    ctx.clone()
                } else {
                    ctx.new_derived()
                };
                let request = rebuild(&parts, payload.clone());
                let result = inner.execute(attempt_ctx.clone(), request).await;

                if attempt >= config.max_total_attempts {
                    return result;
                }

                let decision = match &result {
                    Ok(response) => {
                        config
                            .rule
                            .decide(
                                &attempt_ctx,
                                attempt,
                                AttemptOutcome {
                                    status: Some(response.status()),
                                    headers: Some(response.headers()),
                                    cause: None,
                                },
                            )
                            .await
                    }
                    Err(cause) => {
                        config
                            .rule
                            .decide(
                                &attempt_ctx,
                                attempt,
                                AttemptOutcome {
                                    status: None,
                                    headers: None,
                                    cause: Some(cause),
                                },
                            )
                            .await
                    }
                };

                match decision {
                    RetryDecision::NoRetry => return result,
                    RetryDecision::Retry(delay) => {
                        if !limiter_allows(config.limiter.as_deref(), &attempt_ctx, attempt) {
                            return result;
                        }
                        // Abandon the failed attempt's response before
                        // replaying.
                        drop(result);
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        })
    }
}

fn rebuild(parts: &http::request::Parts, payload: Bytes) -> http::Request<Body> {
    let mut request = http::Request::new(Body::from_bytes(payload));
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = parts.uri.clone();
    *request.headers_mut() = parts.headers.clone();
    *request.version_mut() = parts.version;
    request
}

fn limiter_allows(
    limiter: Option<&dyn RetryLimiter>,
    ctx: &ClientRequestContext,
    attempt: u32,
) -> bool {
    let Some(limiter) = limiter else { return true };
    // Fail open: a misbehaving limiter must not strand the request.
    std::panic::catch_unwind(AssertUnwindSafe(|| limiter.allow(ctx, attempt))).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextDefaults, ExchangeType};
    use crate::endpoint::Endpoint;
    use crate::error::ErrorKind;
    use crate::session::SessionProtocol;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyClient {
        calls: Arc<AtomicU32>,
        fail_first: u32,
    }

    impl HttpClient for FlakyClient {
        fn execute(
            &self,
            _ctx: ClientRequestContext,
            _request: http::Request<Body>,
        ) -> BoxFuture<'static, Result<http::Response<Body>, Error>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let fail = n <= self.fail_first;
            Box::pin(async move {
                if fail {
                    Err(Error::unprocessed(Error::new(ErrorKind::ClosedSession)))
                } else {
                    Ok(http::Response::new(Body::empty()))
                }
            })
        }
    }

    fn ctx() -> ClientRequestContext {
        ClientRequestContext::new(
            SessionProtocol::H1C,
            Endpoint::new("example.com").unwrap(),
            http::Method::GET,
            "/".into(),
            None,
            ExchangeType::ResponseStreaming,
            ContextDefaults::default(),
        )
    }

    fn get() -> http::Request<Body> {
        http::Request::new(Body::empty())
    }

    #[test]
    fn backoff_grows_and_caps() {
        let backoff = Backoff::exponential(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(5), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn retries_unprocessed_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let client = RetryingClient::new(
            Arc::new(FlakyClient {
                calls: calls.clone(),
                fail_first: 2,
            }),
            RetryConfig::new(on_unprocessed(Backoff::without_delay())).max_total_attempts(5),
        );
        let response = client.execute(ctx(), get()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempt_ceiling_returns_last_cause() {
        let calls = Arc::new(AtomicU32::new(0));
        let client = RetryingClient::new(
            Arc::new(FlakyClient {
                calls: calls.clone(),
                fail_first: u32::MAX,
            }),
            RetryConfig::new(on_unprocessed(Backoff::without_delay())).max_total_attempts(3),
        );
        let err = client.execute(ctx(), get()).await.unwrap_err();
        assert!(err.is_unprocessed());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn limiter_vetoes_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let limiter: Arc<dyn RetryLimiter> =
            Arc::new(|_: &ClientRequestContext, _attempt: u32| false);
        let client = RetryingClient::new(
            Arc::new(FlakyClient {
                calls: calls.clone(),
                fail_first: u32::MAX,
            }),
            RetryConfig::new(on_unprocessed(Backoff::without_delay()))
                .max_total_attempts(5)
                .limiter(limiter),
        );
        let err = client.execute(ctx(), get()).await.unwrap_err();
        assert!(err.is_unprocessed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_limiter_fails_open() {
        let calls = Arc::new(AtomicU32::new(0));
        let limiter: Arc<dyn RetryLimiter> =
            Arc::new(|_: &ClientRequestContext, _attempt: u32| -> bool {
                panic!("limiter bug")
            });
        let client = RetryingClient::new(
            Arc::new(FlakyClient {
                calls: calls.clone(),
                fail_first: 1,
            }),
            RetryConfig::new(on_unprocessed(Backoff::without_delay()))
                .max_total_attempts(3)
                .limiter(limiter),
        );
        let response = client.execute(ctx(), get()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn streaming_requests_get_one_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let client = RetryingClient::new(
            Arc::new(FlakyClient {
                calls: calls.clone(),
                fail_first: u32::MAX,
            }),
            RetryConfig::new(on_unprocessed(Backoff::without_delay())).max_total_attempts(5),
        );
        let (_tx, body) = Body::channel();
        let err = client
            .execute(ctx(), http::Request::new(body))
            .await
            .unwrap_err();
        assert!(err.is_unprocessed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
