//! The request execution pipeline.
//!
//! Decorators implement [`HttpClient`]: a small capability, `execute(ctx,
//! request) -> response`, composed outermost-first. User decorators wrap
//! the built-in policy decorators (retry, circuit breaker, redirects),
//! which wrap the transport decorator that talks to the connection pool.

pub mod authority;
pub mod circuit_breaker;
pub mod redirect;
pub mod retry;
pub(crate) mod transport;
pub mod user_agent;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::body::Body;
use crate::context::ClientRequestContext;
use crate::error::Error;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A client or decorator in the execution chain.
pub trait HttpClient: Send + Sync + 'static {
    fn execute(
        &self,
        ctx: ClientRequestContext,
        request: http::Request<Body>,
    ) -> BoxFuture<'static, Result<http::Response<Body>, Error>>;
}

pub type SharedHttpClient = Arc<dyn HttpClient>;

/// Wraps an inner client into a decorated one. Decorators registered first
/// sit outermost in the chain.
pub type Decorator = Arc<dyn Fn(SharedHttpClient) -> SharedHttpClient + Send + Sync>;

/// Builds a decorator from an async closure receiving
/// `(inner, ctx, request)`.
///
/// ```
/// # use presto::service::decorator;
/// let logging = decorator(|inner, ctx, request| async move {
///     tracing::debug!(id = %ctx.id(), "sending");
///     inner.execute(ctx, request).await
/// });
/// ```
pub fn decorator<F, Fut>(f: F) -> Decorator
where
    F: Fn(SharedHttpClient, ClientRequestContext, http::Request<Body>) -> Fut
        + Send
        + Sync
        + 'static,
    Fut: Future<Output = Result<http::Response<Body>, Error>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |inner| {
        Arc::new(FnClient {
            inner,
            f: f.clone(),
            _marker: std::marker::PhantomData,
        })
    })
}

struct FnClient<F, Fut> {
    inner: SharedHttpClient,
    f: Arc<F>,
    _marker: std::marker::PhantomData<fn() -> Fut>,
}

impl<F, Fut> HttpClient for FnClient<F, Fut>
where
    F: Fn(SharedHttpClient, ClientRequestContext, http::Request<Body>) -> Fut
        + Send
        + Sync
        + 'static,
    Fut: Future<Output = Result<http::Response<Body>, Error>> + Send + 'static,
{
    fn execute(
        &self,
        ctx: ClientRequestContext,
        request: http::Request<Body>,
    ) -> BoxFuture<'static, Result<http::Response<Body>, Error>> {
        Box::pin((self.f)(self.inner.clone(), ctx, request))
    }
}

/// Applies `decorators` around `innermost`, first registered outermost.
pub(crate) fn compose(innermost: SharedHttpClient, decorators: &[Decorator]) -> SharedHttpClient {
    let mut chain = innermost;
    for decorate in decorators.iter().rev() {
        chain = decorate(chain);
    }
    chain
}
