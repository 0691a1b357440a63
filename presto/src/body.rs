//! HTTP message bodies.
//!
//! [`Body`] is the single body type used for both requests and responses.
//! Fixed bodies carry their bytes inline; streaming bodies are fed through
//! an mpsc channel by the session that owns the wire connection. Dropping a
//! streaming `Body` cancels the producing stream, which is how response
//! aborts propagate back to the transport.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::HeaderMap;
use http_body::{Frame, SizeHint};
use tokio::sync::mpsc;

use crate::error::{Error, ErrorKind};

/// A request or response body.
pub struct Body {
    inner: Inner,
}

enum Inner {
    Empty,
    Full(Option<Bytes>),
    Channel(ChannelBody),
    Boxed(http_body_util::combinators::BoxBody<Bytes, Error>),
}

struct ChannelBody {
    rx: mpsc::Receiver<Result<Frame<Bytes>, Error>>,
}

impl Body {
    /// An empty body. Requests with an empty body emit neither
    /// `content-length` nor `transfer-encoding`.
    pub fn empty() -> Self {
        Body { inner: Inner::Empty }
    }

    /// A fixed body with a known length.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        if data.is_empty() {
            return Body::empty();
        }
        Body {
            inner: Inner::Full(Some(data)),
        }
    }

    /// A streaming body fed by the returned [`BodySender`].
    ///
    /// The body ends when the sender is dropped after `send_trailers` or a
    /// final data frame; it fails if the sender reports an error.
    pub fn channel() -> (BodySender, Body) {
        let (tx, rx) = mpsc::channel(8);
        (
            BodySender { tx },
            Body {
                inner: Inner::Channel(ChannelBody { rx }),
            },
        )
    }

    /// Wraps an arbitrary `http_body::Body`.
    pub fn wrap<B>(body: B) -> Self
    where
        B: http_body::Body<Data = Bytes, Error = Error> + Send + Sync + 'static,
    {
        Body {
            inner: Inner::Boxed(http_body_util::combinators::BoxBody::new(body)),
        }
    }

    /// `Some(len)` when the total body length is known up front.
    pub fn content_length(&self) -> Option<u64> {
        http_body::Body::size_hint(self).exact()
    }

    /// Whether this body is known to be empty with no trailers.
    pub fn is_empty(&self) -> bool {
        self.content_length() == Some(0) && http_body::Body::is_end_stream(self)
    }

    /// Reads the body to completion, enforcing `limit` when given.
    pub(crate) async fn collect_bytes(self, limit: Option<u64>) -> Result<(Bytes, Option<HeaderMap>), Error> {
        use http_body_util::BodyExt;

        let mut body = self;
        let mut buf = Vec::new();
        let mut trailers = None;
        while let Some(frame) = body.frame().await {
            let frame = frame?;
            match frame.into_data() {
                Ok(data) => {
                    if let Some(limit) = limit {
                        if (buf.len() + data.len()) as u64 > limit {
                            return Err(Error::new(ErrorKind::InvalidHttpResponse)
                                .with(format!("content exceeds maxResponseLength {limit}")));
                        }
                    }
                    buf.extend_from_slice(&data);
                }
                Err(frame) => {
                    if let Ok(t) = frame.into_trailers() {
                        trailers = Some(t);
                    }
                }
            }
        }
        Ok((Bytes::from(buf), trailers))
    }
}

impl http_body::Body for Body {
    type Data = Bytes;
    type Error = Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match &mut self.get_mut().inner {
            Inner::Empty => Poll::Ready(None),
            Inner::Full(data) => Poll::Ready(data.take().map(|d| Ok(Frame::data(d)))),
            Inner::Channel(ch) => match std::task::ready!(ch.rx.poll_recv(cx)) {
                Some(item) => Poll::Ready(Some(item)),
                None => Poll::Ready(None),
            },
            Inner::Boxed(b) => Pin::new(b).poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.inner {
            Inner::Empty => true,
            Inner::Full(data) => data.is_none(),
            Inner::Channel(_) => false,
            Inner::Boxed(b) => b.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.inner {
            Inner::Empty => SizeHint::with_exact(0),
            Inner::Full(data) => {
                SizeHint::with_exact(data.as_ref().map(|d| d.len() as u64).unwrap_or(0))
            }
            Inner::Channel(_) => SizeHint::default(),
            Inner::Boxed(b) => b.size_hint(),
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match &self.inner {
            Inner::Empty => "Body::Empty",
            Inner::Full(_) => "Body::Full",
            Inner::Channel(_) => "Body::Channel",
            Inner::Boxed(_) => "Body::Boxed",
        };
        f.debug_struct(name).finish()
    }
}

impl From<Bytes> for Body {
    fn from(data: Bytes) -> Self {
        Body::from_bytes(data)
    }
}

impl From<Vec<u8>> for Body {
    fn from(data: Vec<u8>) -> Self {
        Body::from_bytes(data)
    }
}

impl From<String> for Body {
    fn from(data: String) -> Self {
        Body::from_bytes(data.into_bytes())
    }
}

impl From<&'static str> for Body {
    fn from(data: &'static str) -> Self {
        Body::from_bytes(Bytes::from_static(data.as_bytes()))
    }
}

impl From<&'static [u8]> for Body {
    fn from(data: &'static [u8]) -> Self {
        Body::from_bytes(Bytes::from_static(data))
    }
}

/// Producer half of a streaming [`Body`].
#[derive(Clone)]
pub struct BodySender {
    tx: mpsc::Sender<Result<Frame<Bytes>, Error>>,
}

impl BodySender {
    /// Sends one data frame, waiting for channel capacity.
    pub async fn send_data(&self, data: Bytes) -> Result<(), Error> {
        self.tx
            .send(Ok(Frame::data(data)))
            .await
            .map_err(|_| Error::new(ErrorKind::ClosedStream))
    }

    /// Sends the trailing headers. The body should be dropped afterwards.
    pub async fn send_trailers(&self, trailers: HeaderMap) -> Result<(), Error> {
        self.tx
            .send(Ok(Frame::trailers(trailers)))
            .await
            .map_err(|_| Error::new(ErrorKind::ClosedStream))
    }

    /// Fails the body with `cause`. Consumers observe the error on their
    /// next frame read.
    pub fn fail(&self, cause: Error) {
        let _ = self.tx.try_send(Err(cause));
    }

    /// Resolves once the consumer has gone away (body dropped or fully
    /// read); used to propagate response aborts back to the wire.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    /// Whether the consumer has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for BodySender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodySender").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_has_exact_zero_length() {
        let body = Body::empty();
        assert_eq!(body.content_length(), Some(0));
        assert!(body.is_empty());
    }

    #[test]
    fn fixed_body_has_exact_length() {
        let body = Body::from("hello");
        assert_eq!(body.content_length(), Some(5));
        assert!(!http_body::Body::is_end_stream(&body));
    }

    #[tokio::test]
    async fn channel_body_streams_frames_in_order() {
        let (tx, body) = Body::channel();
        tokio::spawn(async move {
            tx.send_data(Bytes::from_static(b"a")).await.unwrap();
            tx.send_data(Bytes::from_static(b"b")).await.unwrap();
        });
        let (bytes, trailers) = body.collect_bytes(None).await.unwrap();
        assert_eq!(&bytes[..], b"ab");
        assert!(trailers.is_none());
    }

    #[tokio::test]
    async fn collect_enforces_length_limit() {
        let body = Body::from("0123456789");
        let err = body.collect_bytes(Some(4)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidHttpResponse);
    }

    #[tokio::test]
    async fn dropping_body_closes_sender() {
        let (tx, body) = Body::channel();
        drop(body);
        tx.closed().await;
        assert!(tx.is_closed());
    }
}
