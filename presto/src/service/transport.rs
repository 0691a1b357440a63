//! The innermost decorator: materialises the wire request, acquires a
//! session from the pool, and wires up timeouts, aborts and completion
//! accounting around the streaming response.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use http::header::HOST;
use http::{HeaderMap, HeaderName, StatusCode, Uri};
use tokio::sync::{oneshot, watch};
use tokio_stream::wrappers::WatchStream;
use tokio_stream::Stream;

use crate::body::Body;
use crate::context::{ClientRequestContext, LogProperty, RequestHead, SessionInfo};
use crate::error::{Error, ErrorKind, SharedSource};
use crate::pool::ConnectionPool;
use crate::service::{authority, BoxFuture, HttpClient};
use crate::session::Session;

pub(crate) struct TransportClient {
    pool: ConnectionPool,
    default_headers: HeaderMap,
}

impl TransportClient {
    pub(crate) fn new(pool: ConnectionPool, default_headers: HeaderMap) -> Self {
        TransportClient {
            pool,
            default_headers,
        }
    }
}

impl HttpClient for TransportClient {
    fn execute(
        &self,
        ctx: ClientRequestContext,
        request: http::Request<Body>,
    ) -> BoxFuture<'static, Result<http::Response<Body>, Error>> {
        let pool = self.pool.clone();
        let defaults = self.default_headers.clone();
        Box::pin(run(pool, defaults, ctx, request))
    }
}

async fn run(
    pool: ConnectionPool,
    defaults: HeaderMap,
    ctx: ClientRequestContext,
    request: http::Request<Body>,
) -> Result<http::Response<Body>, Error> {
    let desired = ctx.protocol();
    let endpoint = ctx.endpoint().clone();
    let (parts, body) = request.into_parts();

    // Freeze the wire request: path normalisation, authority resolution,
    // header merging. From here on context mutations no longer affect this
    // attempt.
    let path = normalize_path(ctx.path());
    let authority = authority::resolve(
        &ctx,
        &parts.headers,
        &defaults,
        &endpoint,
        desired.default_port(),
    );
    ctx.freeze_authority(authority.clone());

    let headers = merge_headers(&defaults, &parts.headers, &ctx.additional_headers());
    let path_and_query = match ctx.query() {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };
    let uri = Uri::builder()
        .scheme(desired.scheme())
        .authority(authority.as_str())
        .path_and_query(path_and_query.clone())
        .build()
        .map_err(|e| Error::new(ErrorKind::InvalidUri).with(e))?;

    ctx.log().set_request_head(RequestHead {
        method: parts.method.clone(),
        authority: authority.clone(),
        path: path_and_query,
        headers: headers.clone(),
    });

    // A still-streaming request body gets an abort lever so the response
    // side can cut it off after completion.
    let (body, request_abort) = if body.content_length().is_none() {
        let (handle, body) = abortable(body);
        (body, Some(handle))
    } else {
        (body, None)
    };

    let mut request = http::Request::new(body);
    *request.method_mut() = parts.method;
    *request.uri_mut() = uri;
    *request.headers_mut() = headers;
    *request.version_mut() = parts.version;

    let session = pool.acquire(&endpoint, desired).await?;
    let info = session.info();
    ctx.log().set_session(SessionInfo {
        protocol: session.protocol(),
        remote_addr: info.remote_addr,
        local_addr: info.local_addr,
    });

    let (abort_handle, abort_rx) = abort_channel();
    {
        let handle = abort_handle.clone();
        ctx.set_response_aborter(Arc::new(move |cause| handle.abort(cause)));
    }
    spawn_response_timeout(&ctx);

    let result = {
        let mut abort_rx = abort_rx.clone();
        tokio::select! {
            result = session.execute(&ctx, request) => result,
            cause = wait_abort(&mut abort_rx) => Err(cause),
        }
    };

    let response = match result {
        Ok(response) => response,
        Err(cause) => {
            let shared = Arc::new(cause);
            ctx.log().end_response_with(shared.clone());
            pool.record_outcome(&session, None, Some(shared.as_ref()));
            pool.release(&session);
            return Err(SharedSource(shared).as_error());
        }
    };

    let (parts, body) = response.into_parts();
    let completion = Completion {
        pool,
        session,
        ctx: ctx.clone(),
        request_abort,
        status: parts.status,
    };
    let body = Body::wrap(CompletionBody {
        inner: AbortableBody {
            inner: body,
            aborts: WatchStream::new(abort_rx),
            aborted: None,
        },
        completion: Some(completion),
        length_limit: ctx.max_response_length(),
        seen: 0,
    });
    Ok(http::Response::from_parts(parts, body))
}

/// Collapses runs of slashes in the path to a single slash. The query
/// string is never touched.
pub(crate) fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut last_slash = false;
    for c in path.chars() {
        if c == '/' {
            if last_slash {
                continue;
            }
            last_slash = true;
        } else {
            last_slash = false;
        }
        out.push(c);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Default headers (lowest precedence), then the request's own headers,
/// then the context's additional headers. `Host` and the escaped authority
/// never pass through; the authority travels in the URI.
fn merge_headers(
    defaults: &HeaderMap,
    request: &HeaderMap,
    additional: &HeaderMap,
) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(defaults.len() + request.len() + additional.len());
    for source in [defaults, request, additional] {
        let mut last: Option<HeaderName> = None;
        for (name, value) in source {
            if last.as_ref() == Some(name) {
                // Preserve multi-valued headers within one source.
                out.append(name.clone(), value.clone());
            } else {
                out.insert(name.clone(), value.clone());
            }
            last = Some(name.clone());
        }
    }
    out.remove(HOST);
    out.remove(authority::ESCAPED_AUTHORITY);
    out
}

/// Arms the response timeout: measured from request end, it invokes the
/// user handler when installed, and aborts the response with
/// `ResponseTimeout` otherwise.
fn spawn_response_timeout(ctx: &ClientRequestContext) {
    let Some(timeout) = ctx.response_timeout() else {
        return;
    };
    let (armed_tx, armed_rx) = oneshot::channel();
    let armed_tx = Mutex::new(Some(armed_tx));
    ctx.log().on(LogProperty::RequestEnd, move |_| {
        if let Some(tx) = armed_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    });

    let ctx = ctx.clone();
    tokio::spawn(async move {
        if armed_rx.await.is_err() {
            return;
        }
        tokio::time::sleep(timeout).await;
        if ctx.log().is_complete() {
            return;
        }
        match ctx.response_timeout_handler() {
            Some(handler) => handler(&ctx),
            None => ctx.abort_response(Error::new(ErrorKind::ResponseTimeout)),
        }
    });
}

#[derive(Clone)]
pub(crate) struct AbortHandle {
    tx: Arc<watch::Sender<Option<Arc<Error>>>>,
}

impl AbortHandle {
    /// Triggers the abort; the first cause wins.
    pub(crate) fn abort(&self, cause: Error) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(Arc::new(cause));
                true
            } else {
                false
            }
        });
    }
}

fn abort_channel() -> (AbortHandle, watch::Receiver<Option<Arc<Error>>>) {
    let (tx, rx) = watch::channel(None);
    (AbortHandle { tx: Arc::new(tx) }, rx)
}

async fn wait_abort(rx: &mut watch::Receiver<Option<Arc<Error>>>) -> Error {
    loop {
        if let Some(cause) = rx.borrow().clone() {
            return SharedSource(cause).as_error();
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Wraps `body` so that [`AbortHandle::abort`] fails it with the abort
/// cause; dropping the wrapped body cancels the underlying stream.
fn abortable(body: Body) -> (AbortHandle, Body) {
    let (handle, rx) = abort_channel();
    let body = Body::wrap(AbortableBody {
        inner: body,
        aborts: WatchStream::new(rx),
        aborted: None,
    });
    (handle, body)
}

struct AbortableBody<B> {
    inner: B,
    aborts: WatchStream<Option<Arc<Error>>>,
    aborted: Option<Arc<Error>>,
}

impl<B> http_body::Body for AbortableBody<B>
where
    B: http_body::Body<Data = Bytes, Error = Error> + Unpin,
{
    type Data = Bytes;
    type Error = Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Bytes>, Error>>> {
        let this = self.get_mut();
        if this.aborted.is_none() {
            while let Poll::Ready(Some(value)) = Pin::new(&mut this.aborts).poll_next(cx) {
                if let Some(cause) = value {
                    this.aborted = Some(cause);
                    break;
                }
            }
        }
        if let Some(cause) = &this.aborted {
            return Poll::Ready(Some(Err(SharedSource(cause.clone()).as_error())));
        }
        Pin::new(&mut this.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.aborted.is_none() && self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

/// Runs the end-of-exchange bookkeeping exactly once: request log
/// completion, outlier accounting, pool release, and the delayed
/// auto-abort of a still-open request stream.
struct Completion {
    pool: ConnectionPool,
    session: Arc<Session>,
    ctx: ClientRequestContext,
    request_abort: Option<AbortHandle>,
    status: StatusCode,
}

impl Completion {
    fn finish(self, cause: Option<Arc<Error>>) {
        match &cause {
            Some(cause) => self.ctx.log().end_response_with(cause.clone()),
            None => self.ctx.log().end_response(),
        }
        self.pool
            .record_outcome(&self.session, Some(self.status), cause.as_deref());
        self.pool.release(&self.session);

        if let Some(abort) = self.request_abort {
            if !self.ctx.log().is_available(LogProperty::RequestEnd) {
                let delay = self.ctx.auto_abort_delay();
                let fire = move || abort.abort(Error::new(ErrorKind::ResponseComplete));
                if delay.is_zero() || tokio::runtime::Handle::try_current().is_err() {
                    fire();
                } else {
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        fire();
                    });
                }
            }
        }
    }
}

struct CompletionBody<B> {
    inner: B,
    completion: Option<Completion>,
    length_limit: Option<u64>,
    seen: u64,
}

impl<B> http_body::Body for CompletionBody<B>
where
    B: http_body::Body<Data = Bytes, Error = Error> + Unpin,
{
    type Data = Bytes;
    type Error = Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Bytes>, Error>>> {
        let this = self.get_mut();
        match std::task::ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.seen += data.len() as u64;
                    if let Some(limit) = this.length_limit {
                        if this.seen > limit {
                            let cause = Arc::new(
                                Error::new(ErrorKind::InvalidHttpResponse).with(format!(
                                    "content exceeds maxResponseLength {limit}"
                                )),
                            );
                            if let Some(completion) = this.completion.take() {
                                completion.finish(Some(cause.clone()));
                            }
                            return Poll::Ready(Some(Err(SharedSource(cause).as_error())));
                        }
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(cause)) => {
                let shared = Arc::new(cause);
                if let Some(completion) = this.completion.take() {
                    completion.finish(Some(shared.clone()));
                }
                Poll::Ready(Some(Err(SharedSource(shared).as_error())))
            }
            None => {
                if let Some(completion) = this.completion.take() {
                    completion.finish(None);
                }
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for CompletionBody<B> {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            completion.finish(Some(Arc::new(
                Error::new(ErrorKind::ClosedStream).with("response stream dropped"),
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn double_slashes_collapse_in_path_only() {
        assert_eq!(normalize_path("/a//b"), "/a/b");
        assert_eq!(normalize_path("//"), "/");
        assert_eq!(normalize_path("/a///b//c"), "/a/b/c");
        assert_eq!(normalize_path(""), "/");
    }

    #[quickcheck]
    fn normalization_is_idempotent_and_slash_free(path: String) -> bool {
        let once = normalize_path(&path);
        !once.contains("//") && normalize_path(&once) == once
    }

    #[test]
    fn merged_headers_respect_precedence() {
        let mut defaults = HeaderMap::new();
        defaults.insert("x-tier", "default".parse().unwrap());
        defaults.insert("x-base", "base".parse().unwrap());
        let mut request = HeaderMap::new();
        request.insert("x-tier", "request".parse().unwrap());
        let mut additional = HeaderMap::new();
        additional.insert("x-tier", "additional".parse().unwrap());

        let merged = merge_headers(&defaults, &request, &additional);
        assert_eq!(merged["x-tier"], "additional");
        assert_eq!(merged["x-base"], "base");
    }

    #[test]
    fn host_never_passes_through_merge() {
        let mut request = HeaderMap::new();
        request.insert(HOST, "stale.example".parse().unwrap());
        let merged = merge_headers(&HeaderMap::new(), &request, &HeaderMap::new());
        assert!(merged.is_empty());
    }

    #[tokio::test]
    async fn abort_fails_the_body_with_the_first_cause() {
        use http_body_util::BodyExt;

        let (handle, body) = abortable(Body::from("data"));
        handle.abort(Error::new(ErrorKind::ResponseComplete));
        handle.abort(Error::new(ErrorKind::ResponseTimeout));
        let mut body = body;
        let err = body.frame().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResponseComplete);
    }
}
