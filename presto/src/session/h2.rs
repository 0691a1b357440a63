//! HTTP/2 session.
//!
//! Built on the `h2` crate: a cloneable `SendRequest` handle issues
//! streams while a spawned driver task owns the connection, propagates the
//! server's `SETTINGS`-derived concurrency limit into the session
//! accounting, and classifies GOAWAY shutdowns. Until the initial SETTINGS
//! exchange is acknowledged the session reports a concurrency limit of one
//! so the pool cannot over-commit streams.

use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use h2::client::{Connection, SendRequest};
use h2::{Reason, RecvStream, SendStream};
use http_body_util::BodyExt;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::body::Body;
use crate::context::{ClientRequestContext, RequestLog};
use crate::error::{Error, ErrorKind};
use crate::event::CloseHint;
use crate::session::Session;

/// HTTP/2 connection tuning from the client options.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct H2Config {
    pub initial_stream_window_size: Option<u32>,
    pub initial_connection_window_size: Option<u32>,
}

pub(crate) fn builder(config: &H2Config) -> h2::client::Builder {
    let mut builder = h2::client::Builder::new();
    if let Some(size) = config.initial_stream_window_size {
        builder.initial_window_size(size);
    }
    if let Some(size) = config.initial_connection_window_size {
        builder.initial_connection_window_size(size);
    }
    builder
}

/// Drives the connection until it terminates, mirroring the peer's
/// concurrency limit into the session after every poll.
pub(crate) fn spawn_driver<IO>(connection: Connection<IO, Bytes>, session: Arc<Session>)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut closed = session.closed_signal();
        let mut connection = Box::pin(connection);
        let drive = {
            let session = session.clone();
            poll_fn(move |cx| {
                let result = connection.as_mut().poll(cx);
                let peer_max = connection.max_concurrent_send_streams();
                session.observe_peer_max_streams(peer_max.min(u32::MAX as usize) as u32);
                result
            })
        };
        tokio::select! {
            result = drive => match result {
                Ok(()) => session.close(CloseHint::Unknown),
                Err(cause) if cause.is_go_away() => {
                    session.drain(CloseHint::GoAway);
                }
                Err(_) => session.close(CloseHint::Abnormal),
            },
            _ = closed.changed() => {
                // Dropping the connection resets outstanding streams and
                // closes the socket.
            }
        }
    });
}

/// Issues one stream on the session.
pub(crate) async fn execute(
    session: &Arc<Session>,
    send_request: SendRequest<Bytes>,
    ctx: &ClientRequestContext,
    request: http::Request<Body>,
) -> Result<http::Response<Body>, Error> {
    let log = ctx.log().clone();
    let (parts, body) = request.into_parts();
    let end_of_stream = body.is_empty();

    let mut send_request = send_request
        .ready()
        .await
        .map_err(|e| fail(session, e.into()))?;

    let head = http::Request::from_parts(parts, ());
    let (response, send_stream) = send_request
        .send_request(head, end_of_stream)
        .map_err(|e| fail(session, e.into()))?;
    log.request_first_bytes();
    session.touch();

    if end_of_stream {
        log.end_request();
    } else {
        tokio::spawn(flush_body(
            body,
            send_stream,
            log.clone(),
            ctx.write_timeout(),
        ));
    }

    let response = response.await.map_err(|e| fail(session, e.into()))?;
    session.touch();
    let (parts, recv) = response.into_parts();
    log.response_first_bytes();
    log.set_response_headers(parts.status, parts.headers.clone());

    let body = Body::wrap(RecvBody {
        inner: recv,
        log,
        data_done: false,
    });
    Ok(http::Response::from_parts(parts, body))
}

/// Marks the session for drain when the failure was a GOAWAY.
fn fail(session: &Arc<Session>, error: Error) -> Error {
    if error.root_kind() == ErrorKind::GoAwayReceived {
        session.drain(CloseHint::GoAway);
    }
    error
}

/// Moves the request body onto the wire, honoring stream flow control.
/// Each flow-control-limited write is bounded by `write_timeout`.
async fn flush_body(
    mut body: Body,
    mut stream: SendStream<Bytes>,
    log: RequestLog,
    write_timeout: Option<std::time::Duration>,
) {
    loop {
        match body.frame().await {
            None => {
                if stream.send_data(Bytes::new(), true).is_ok() {
                    log.end_request();
                } else {
                    log.end_request_with(Arc::new(Error::new(ErrorKind::ClosedStream)));
                }
                return;
            }
            Some(Err(cause)) => {
                stream.send_reset(Reason::CANCEL);
                log.end_request_with(Arc::new(cause));
                return;
            }
            Some(Ok(frame)) => match frame.into_data() {
                Ok(mut data) => {
                    while !data.is_empty() {
                        stream.reserve_capacity(data.len());
                        let granted = match write_timeout {
                            Some(timeout) => {
                                let granted = tokio::time::timeout(
                                    timeout,
                                    poll_fn(|cx| stream.poll_capacity(cx)),
                                )
                                .await;
                                match granted {
                                    Ok(granted) => granted,
                                    Err(_) => {
                                        stream.send_reset(Reason::CANCEL);
                                        log.end_request_with(Arc::new(Error::new(
                                            ErrorKind::WriteTimeout,
                                        )));
                                        return;
                                    }
                                }
                            }
                            None => poll_fn(|cx| stream.poll_capacity(cx)).await,
                        };
                        let granted = match granted {
                            Some(Ok(n)) if n > 0 => n,
                            _ => {
                                // The stream was reset before the body
                                // finished.
                                log.end_request_with(Arc::new(Error::new(
                                    ErrorKind::ClosedStream,
                                )));
                                return;
                            }
                        };
                        let chunk = data.split_to(granted.min(data.len()));
                        let len = chunk.len() as u64;
                        if stream.send_data(chunk, false).is_err() {
                            log.end_request_with(Arc::new(Error::new(ErrorKind::ClosedStream)));
                            return;
                        }
                        log.add_request_length(len);
                    }
                }
                Err(frame) => {
                    if let Ok(trailers) = frame.into_trailers() {
                        let _ = stream.send_trailers(trailers);
                        log.end_request();
                        return;
                    }
                }
            },
        }
    }
}

/// Response body adapter over `h2::RecvStream`, releasing flow-control
/// capacity as the consumer takes data.
struct RecvBody {
    inner: RecvStream,
    log: RequestLog,
    data_done: bool,
}

impl http_body::Body for RecvBody {
    type Data = Bytes;
    type Error = Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Bytes>, Error>>> {
        let this = self.get_mut();

        if !this.data_done {
            match std::task::ready!(this.inner.poll_data(cx)) {
                Some(Ok(data)) => {
                    let _ = this
                        .inner
                        .flow_control()
                        .release_capacity(data.len());
                    this.log.add_response_length(data.len() as u64);
                    return Poll::Ready(Some(Ok(http_body::Frame::data(data))));
                }
                Some(Err(cause)) => return Poll::Ready(Some(Err(cause.into()))),
                None => this.data_done = true,
            }
        }

        match std::task::ready!(this.inner.poll_trailers(cx)) {
            Ok(Some(trailers)) => Poll::Ready(Some(Ok(http_body::Frame::trailers(trailers)))),
            Ok(None) => Poll::Ready(None),
            Err(cause) => Poll::Ready(Some(Err(cause.into()))),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.data_done && self.inner.is_end_stream()
    }
}
