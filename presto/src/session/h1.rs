//! HTTP/1.1 session.
//!
//! One task owns the socket and serves exchanges strictly serially: a
//! request is written only after the previous response reached its end of
//! message. Responses are framed by `content-length`, chunked transfer
//! coding, or connection close.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use bytes::{Buf, BytesMut};
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, StatusCode, Version};
use http_body_util::BodyExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use crate::body::{Body, BodySender};
use crate::context::RequestLog;
use crate::error::{Error, ErrorKind};
use crate::event::CloseHint;
use crate::session::Session;

const MAX_HEADERS: usize = 64;
const READ_CHUNK: usize = 8 * 1024;

/// One serial request/response exchange.
pub(crate) struct Exchange {
    /// Request whose URI carries scheme, authority and path; the session
    /// derives the request line and `host` header from it.
    pub request: http::Request<Body>,
    pub write_timeout: Option<Duration>,
    pub log: RequestLog,
    pub respond: oneshot::Sender<Result<http::Response<Body>, Error>>,
}

/// Submits an exchange to the session task and waits for the response
/// head.
pub(crate) async fn execute(
    tx: mpsc::Sender<Exchange>,
    ctx: &crate::context::ClientRequestContext,
    request: http::Request<Body>,
) -> Result<http::Response<Body>, Error> {
    let (respond, response) = oneshot::channel();
    let exchange = Exchange {
        request,
        write_timeout: ctx.write_timeout(),
        log: ctx.log().clone(),
        respond,
    };
    if tx.send(exchange).await.is_err() {
        return Err(Error::unprocessed(Error::new(ErrorKind::ClosedSession)));
    }
    match response.await {
        Ok(result) => result,
        Err(_) => Err(Error::unprocessed(Error::new(ErrorKind::ClosedSession))),
    }
}

/// `buf` carries bytes already read from the socket, e.g. left over from
/// an upgrade probe.
pub(crate) fn spawn<IO>(io: IO, buf: BytesMut, rx: mpsc::Receiver<Exchange>, session: Arc<Session>)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(run(io, buf, rx, session));
}

async fn run<IO>(
    mut io: IO,
    mut buf: BytesMut,
    mut rx: mpsc::Receiver<Exchange>,
    session: Arc<Session>,
) where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut closed = session.closed_signal();

    loop {
        let exchange = tokio::select! {
            _ = closed.changed() => break,
            next = rx.recv() => match next {
                Some(exchange) => exchange,
                None => break,
            },
        };

        match serve(&mut io, &mut buf, exchange, &session).await {
            Ok(true) => continue,
            Ok(false) => {
                session.drain(CloseHint::Unknown);
                break;
            }
            Err(_) => {
                session.close(CloseHint::Abnormal);
                break;
            }
        }
    }

    let _ = io.shutdown().await;
    session.close(CloseHint::Unknown);
}

/// Serves one exchange. `Ok(true)` means the connection may be reused.
async fn serve<IO>(
    io: &mut IO,
    buf: &mut BytesMut,
    exchange: Exchange,
    session: &Arc<Session>,
) -> Result<bool, Error>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let Exchange {
        request,
        write_timeout,
        log,
        respond,
    } = exchange;
    let method = request.method().clone();

    if let Err(cause) = write_request(io, request, write_timeout, &log).await {
        log.end_request_with(Arc::new(Error::new(cause.kind())));
        let _ = respond.send(Err(cause));
        return Err(Error::new(ErrorKind::ClosedSession));
    }
    log.end_request();
    session.touch();

    let head = match read_response_head(io, buf).await {
        Ok(head) => head,
        Err(cause) => {
            let kind = cause.kind();
            let _ = respond.send(Err(cause));
            return Err(Error::new(kind));
        }
    };
    log.response_first_bytes();
    log.set_response_headers(head.status, head.headers.clone());
    session.touch();

    let reusable = head.keep_alive && session.is_acquirable();
    let framing = response_framing(&method, &head)?;

    if matches!(framing, Framing::None) {
        let mut response = http::Response::new(Body::empty());
        *response.status_mut() = head.status;
        *response.version_mut() = head.version;
        *response.headers_mut() = head.headers;
        log.end_response();
        let _ = respond.send(Ok(response));
        return Ok(reusable);
    }

    let (body_tx, body) = Body::channel();
    let mut response = http::Response::new(body);
    *response.status_mut() = head.status;
    *response.version_mut() = head.version;
    *response.headers_mut() = head.headers;
    if respond.send(Ok(response)).is_err() {
        // Nobody wants the response; the only way out mid-message is to
        // drop the connection.
        return Ok(false);
    }

    match pump_response_body(io, buf, framing, &body_tx, &log).await {
        Ok(()) => {
            log.end_response();
            Ok(reusable)
        }
        Err(PumpError::Receiver) => Ok(false),
        Err(PumpError::Transport(cause)) => {
            log.end_response_with(Arc::new(Error::new(cause.kind())));
            body_tx.fail(cause);
            Err(Error::new(ErrorKind::ClosedSession))
        }
    }
}

async fn write_request<IO>(
    io: &mut IO,
    request: http::Request<Body>,
    write_timeout: Option<Duration>,
    log: &RequestLog,
) -> Result<(), Error>
where
    IO: AsyncWrite + Unpin,
{
    let (parts, body) = request.into_parts();
    let content_length = body.content_length();
    let head = encode_request_head(&parts, content_length);

    write_all(io, &head, write_timeout).await?;
    log.request_first_bytes();
    log.add_request_length(head.len() as u64);

    match content_length {
        Some(0) => {}
        Some(_) => {
            let mut body = body;
            while let Some(frame) = body.frame().await {
                let frame = frame?;
                if let Ok(data) = frame.into_data() {
                    write_all(io, &data, write_timeout).await?;
                    log.add_request_length(data.len() as u64);
                }
            }
        }
        None => {
            let mut body = body;
            while let Some(frame) = body.frame().await {
                let frame = frame?;
                if let Ok(data) = frame.into_data() {
                    if data.is_empty() {
                        continue;
                    }
                    let size = format!("{:x}\r\n", data.len());
                    write_all(io, size.as_bytes(), write_timeout).await?;
                    write_all(io, &data, write_timeout).await?;
                    write_all(io, b"\r\n", write_timeout).await?;
                    log.add_request_length(data.len() as u64);
                }
            }
            write_all(io, b"0\r\n\r\n", write_timeout).await?;
        }
    }
    io.flush().await.map_err(Error::from)?;
    Ok(())
}

async fn write_all<IO>(io: &mut IO, data: &[u8], timeout: Option<Duration>) -> Result<(), Error>
where
    IO: AsyncWrite + Unpin,
{
    match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, io.write_all(data)).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::new(ErrorKind::WriteTimeout)),
        },
        None => io.write_all(data).await.map_err(Error::from),
    }
}

/// Serialises the request line and headers. The `host` header always comes
/// first, derived from the request URI's authority; an empty body emits
/// neither `content-length` nor `transfer-encoding`.
pub(crate) fn encode_request_head(
    parts: &http::request::Parts,
    content_length: Option<u64>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(parts.method.as_str().as_bytes());
    out.push(b' ');
    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    out.extend_from_slice(target.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");

    if let Some(authority) = parts.uri.authority() {
        out.extend_from_slice(b"host: ");
        out.extend_from_slice(authority.as_str().as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    for (name, value) in &parts.headers {
        if name == http::header::HOST {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    match content_length {
        Some(0) => {}
        Some(n) => {
            out.extend_from_slice(format!("content-length: {n}\r\n").as_bytes());
        }
        None => {
            out.extend_from_slice(b"transfer-encoding: chunked\r\n");
        }
    }
    out.extend_from_slice(b"\r\n");
    out
}

pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub keep_alive: bool,
}

/// Reads one response head, transparently skipping interim 1xx responses
/// other than 101.
pub(crate) async fn read_response_head<IO>(
    io: &mut IO,
    buf: &mut BytesMut,
) -> Result<ResponseHead, Error>
where
    IO: AsyncRead + Unpin,
{
    loop {
        let head = read_head_once(io, buf).await?;
        if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
            continue;
        }
        return Ok(head);
    }
}

async fn read_head_once<IO>(io: &mut IO, buf: &mut BytesMut) -> Result<ResponseHead, Error>
where
    IO: AsyncRead + Unpin,
{
    loop {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response
            .parse(buf)
            .map_err(|e| Error::new(ErrorKind::Protocol).with(e))?
        {
            httparse::Status::Complete(consumed) => {
                let status = StatusCode::from_u16(response.code.unwrap_or(0))
                    .map_err(|e| Error::new(ErrorKind::Protocol).with(e))?;
                let version = match response.version {
                    Some(0) => Version::HTTP_10,
                    _ => Version::HTTP_11,
                };

                let mut map = HeaderMap::with_capacity(response.headers.len());
                for header in response.headers.iter() {
                    let name = HeaderName::from_bytes(header.name.as_bytes())
                        .map_err(|e| Error::new(ErrorKind::Protocol).with(e))?;
                    let value = HeaderValue::from_bytes(header.value)
                        .map_err(|e| Error::new(ErrorKind::Protocol).with(e))?;
                    map.append(name, value);
                }

                let keep_alive = match map.get(CONNECTION).and_then(|v| v.to_str().ok()) {
                    Some(v) if v.eq_ignore_ascii_case("close") => false,
                    Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
                    _ => version == Version::HTTP_11,
                };

                buf.advance(consumed);
                return Ok(ResponseHead {
                    status,
                    version,
                    headers: map,
                    keep_alive,
                });
            }
            httparse::Status::Partial => {
                if read_more(io, buf).await? == 0 {
                    return Err(Error::new(ErrorKind::ClosedSession)
                        .with("connection closed before response head"));
                }
            }
        }
    }
}

async fn read_more<IO>(io: &mut IO, buf: &mut BytesMut) -> Result<usize, Error>
where
    IO: AsyncRead + Unpin,
{
    buf.reserve(READ_CHUNK);
    io.read_buf(buf).await.map_err(Error::from)
}

enum Framing {
    None,
    ContentLength(u64),
    Chunked,
    Close,
}

fn response_framing(method: &http::Method, head: &ResponseHead) -> Result<Framing, Error> {
    if method == http::Method::HEAD
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
        || head.status.is_informational()
    {
        return Ok(Framing::None);
    }
    if let Some(te) = head.headers.get(TRANSFER_ENCODING) {
        let te = te
            .to_str()
            .map_err(|e| Error::new(ErrorKind::Protocol).with(e))?;
        if te.to_ascii_lowercase().contains("chunked") {
            return Ok(Framing::Chunked);
        }
    }
    if let Some(cl) = head.headers.get(CONTENT_LENGTH) {
        let n: u64 = cl
            .to_str()
            .ok()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::new(ErrorKind::Protocol).with("bad content-length"))?;
        if n == 0 {
            return Ok(Framing::None);
        }
        return Ok(Framing::ContentLength(n));
    }
    Ok(Framing::Close)
}

enum PumpError {
    /// The response consumer went away; the connection must be dropped.
    Receiver,
    Transport(Error),
}

async fn pump_response_body<IO>(
    io: &mut IO,
    buf: &mut BytesMut,
    framing: Framing,
    body_tx: &BodySender,
    log: &RequestLog,
) -> Result<(), PumpError>
where
    IO: AsyncRead + Unpin,
{
    match framing {
        Framing::None => Ok(()),
        Framing::ContentLength(mut remaining) => {
            while remaining > 0 {
                if buf.is_empty() {
                    let n = read_more(io, buf).await.map_err(PumpError::Transport)?;
                    if n == 0 {
                        return Err(PumpError::Transport(
                            Error::new(ErrorKind::ClosedStream)
                                .with("connection closed mid-body"),
                        ));
                    }
                }
                let take = buf.len().min(remaining as usize);
                let data = buf.split_to(take).freeze();
                remaining -= data.len() as u64;
                log.add_response_length(data.len() as u64);
                if body_tx.send_data(data).await.is_err() {
                    return Err(PumpError::Receiver);
                }
            }
            Ok(())
        }
        Framing::Close => loop {
            if buf.is_empty() {
                let n = read_more(io, buf).await.map_err(PumpError::Transport)?;
                if n == 0 {
                    return Ok(());
                }
            }
            let data = buf.split().freeze();
            log.add_response_length(data.len() as u64);
            if body_tx.send_data(data).await.is_err() {
                return Err(PumpError::Receiver);
            }
        },
        Framing::Chunked => pump_chunked(io, buf, body_tx, log).await,
    }
}

async fn pump_chunked<IO>(
    io: &mut IO,
    buf: &mut BytesMut,
    body_tx: &BodySender,
    log: &RequestLog,
) -> Result<(), PumpError>
where
    IO: AsyncRead + Unpin,
{
    loop {
        let (consumed, size) = loop {
            match httparse::parse_chunk_size(buf) {
                Ok(httparse::Status::Complete(parsed)) => break parsed,
                Ok(httparse::Status::Partial) => {
                    if read_more(io, buf).await.map_err(PumpError::Transport)? == 0 {
                        return Err(PumpError::Transport(
                            Error::new(ErrorKind::ClosedStream).with("truncated chunk size"),
                        ));
                    }
                }
                Err(_) => {
                    return Err(PumpError::Transport(
                        Error::new(ErrorKind::Protocol).with("invalid chunk size"),
                    ));
                }
            }
        };
        buf.advance(consumed);

        if size == 0 {
            let trailers = read_trailers(io, buf).await.map_err(PumpError::Transport)?;
            if let Some(trailers) = trailers {
                if body_tx.send_trailers(trailers).await.is_err() {
                    return Err(PumpError::Receiver);
                }
            }
            return Ok(());
        }

        let mut remaining = size;
        while remaining > 0 {
            if buf.is_empty() {
                let n = read_more(io, buf).await.map_err(PumpError::Transport)?;
                if n == 0 {
                    return Err(PumpError::Transport(
                        Error::new(ErrorKind::ClosedStream).with("truncated chunk"),
                    ));
                }
            }
            let take = buf.len().min(remaining as usize);
            let data = buf.split_to(take).freeze();
            remaining -= data.len() as u64;
            log.add_response_length(data.len() as u64);
            if body_tx.send_data(data).await.is_err() {
                return Err(PumpError::Receiver);
            }
        }

        // Chunk-terminating CRLF.
        while buf.len() < 2 {
            if read_more(io, buf).await.map_err(PumpError::Transport)? == 0 {
                return Err(PumpError::Transport(
                    Error::new(ErrorKind::ClosedStream).with("truncated chunk terminator"),
                ));
            }
        }
        buf.advance(2);
    }
}

async fn read_trailers<IO>(io: &mut IO, buf: &mut BytesMut) -> Result<Option<HeaderMap>, Error>
where
    IO: AsyncRead + Unpin,
{
    loop {
        if buf.starts_with(b"\r\n") {
            buf.advance(2);
            return Ok(None);
        }
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        match httparse::parse_headers(buf, &mut headers) {
            Ok(httparse::Status::Complete((consumed, parsed))) => {
                let mut map = HeaderMap::new();
                for header in parsed {
                    let name = HeaderName::from_bytes(header.name.as_bytes())
                        .map_err(|e| Error::new(ErrorKind::Protocol).with(e))?;
                    let value = HeaderValue::from_bytes(header.value)
                        .map_err(|e| Error::new(ErrorKind::Protocol).with(e))?;
                    map.append(name, value);
                }
                buf.advance(consumed);
                return Ok(if map.is_empty() { None } else { Some(map) });
            }
            Ok(httparse::Status::Partial) => {
                if read_more(io, buf).await? == 0 {
                    return Err(Error::new(ErrorKind::ClosedStream).with("truncated trailers"));
                }
            }
            Err(e) => return Err(Error::new(ErrorKind::Protocol).with(e)),
        }
    }
}

/// Probes `h2c` support with an `OPTIONS *` upgrade request on a fresh
/// cleartext connection. Returns whether the server accepted the upgrade;
/// on rejection the interim response is fully consumed so the connection
/// remains usable for HTTP/1.1.
pub(crate) async fn upgrade_probe<IO>(
    io: &mut IO,
    buf: &mut BytesMut,
    authority: &str,
) -> Result<bool, Error>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let settings = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode([]);
    let head = format!(
        "OPTIONS * HTTP/1.1\r\nhost: {authority}\r\nconnection: upgrade, http2-settings\r\n\
         upgrade: h2c\r\nhttp2-settings: {settings}\r\n\r\n"
    );
    io.write_all(head.as_bytes()).await?;
    io.flush().await?;

    let head = read_head_once(io, buf).await?;
    if head.status == StatusCode::SWITCHING_PROTOCOLS {
        return Ok(true);
    }

    // Consume the rejection response so the next request starts clean.
    let framing = response_framing(&http::Method::OPTIONS, &head)?;
    discard_response_body(io, buf, framing).await?;
    Ok(false)
}

async fn discard_response_body<IO>(
    io: &mut IO,
    buf: &mut BytesMut,
    framing: Framing,
) -> Result<(), Error>
where
    IO: AsyncRead + Unpin,
{
    match framing {
        Framing::None | Framing::Close => {
            buf.clear();
            Ok(())
        }
        Framing::ContentLength(mut remaining) => {
            while remaining > 0 {
                if buf.is_empty() && read_more(io, buf).await? == 0 {
                    return Err(Error::new(ErrorKind::ClosedStream));
                }
                let take = buf.len().min(remaining as usize);
                buf.advance(take);
                remaining -= take as u64;
            }
            Ok(())
        }
        Framing::Chunked => {
            let (tx, body) = Body::channel();
            let drain = tokio::spawn(async move {
                let _ = body.collect_bytes(None).await;
            });
            let result = pump_chunked(io, buf, &tx, &RequestLog::new()).await;
            drop(tx);
            let _ = drain.await;
            match result {
                Ok(()) | Err(PumpError::Receiver) => Ok(()),
                Err(PumpError::Transport(e)) => Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(method: http::Method, uri: &str) -> http::request::Parts {
        let (parts, _) = http::Request::builder()
            .method(method)
            .uri(uri)
            .body(())
            .unwrap()
            .into_parts();
        parts
    }

    #[test]
    fn empty_body_request_has_no_framing_headers() {
        let mut parts = parts(http::Method::GET, "http://127.0.0.1:8080/foo");
        parts.headers.insert(
            http::header::USER_AGENT,
            HeaderValue::from_static("presto/0.1.0"),
        );
        let head = encode_request_head(&parts, Some(0));
        assert_eq!(
            std::str::from_utf8(&head).unwrap(),
            "GET /foo HTTP/1.1\r\nhost: 127.0.0.1:8080\r\nuser-agent: presto/0.1.0\r\n\r\n"
        );
    }

    #[test]
    fn fixed_body_request_carries_content_length() {
        let parts = parts(http::Method::POST, "http://example.com/submit");
        let head = encode_request_head(&parts, Some(4));
        let text = std::str::from_utf8(&head).unwrap();
        assert!(text.contains("content-length: 4\r\n"));
        assert!(!text.contains("transfer-encoding"));
    }

    #[test]
    fn streaming_request_is_chunked() {
        let parts = parts(http::Method::POST, "http://example.com/stream");
        let head = encode_request_head(&parts, None);
        let text = std::str::from_utf8(&head).unwrap();
        assert!(text.contains("transfer-encoding: chunked\r\n"));
        assert!(!text.contains("content-length"));
    }

    #[tokio::test]
    async fn parses_content_length_response() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            server
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello")
                .await
                .unwrap();
        });
        let mut buf = BytesMut::new();
        let head = read_response_head(&mut client, &mut buf).await.unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert!(head.keep_alive);

        let (tx, body) = Body::channel();
        let log = RequestLog::new();
        pump_response_body(
            &mut client,
            &mut buf,
            Framing::ContentLength(5),
            &tx,
            &log,
        )
        .await
        .map_err(|_| "pump failed")
        .unwrap();
        drop(tx);
        let (bytes, _) = body.collect_bytes(None).await.unwrap();
        assert_eq!(&bytes[..], b"hello");
        assert_eq!(log.response_length(), 5);
    }

    #[tokio::test]
    async fn parses_chunked_response() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            server
                .write_all(
                    b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n\
                      3\r\nfoo\r\n4\r\nbars\r\n0\r\n\r\n",
                )
                .await
                .unwrap();
        });
        let mut buf = BytesMut::new();
        let head = read_response_head(&mut client, &mut buf).await.unwrap();
        let (tx, body) = Body::channel();
        pump_response_body(&mut client, &mut buf, Framing::Chunked, &tx, &RequestLog::new())
            .await
            .map_err(|_| "pump failed")
            .unwrap();
        drop(tx);
        let (bytes, trailers) = body.collect_bytes(None).await.unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(&bytes[..], b"foobars");
        assert!(trailers.is_none());
    }

    #[tokio::test]
    async fn connection_close_marks_session_not_reusable() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            server
                .write_all(b"HTTP/1.1 200 OK\r\nconnection: close\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
        });
        let mut buf = BytesMut::new();
        let head = read_response_head(&mut client, &mut buf).await.unwrap();
        assert!(!head.keep_alive);
    }

    #[tokio::test]
    async fn upgrade_probe_accepts_101() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut sink = vec![0u8; 1024];
            let _ = server.read(&mut sink).await;
            server
                .write_all(b"HTTP/1.1 101 Switching Protocols\r\nconnection: upgrade\r\nupgrade: h2c\r\n\r\n")
                .await
                .unwrap();
        });
        let mut buf = BytesMut::new();
        assert!(upgrade_probe(&mut client, &mut buf, "example.com:80")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn upgrade_probe_consumes_rejection() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut sink = vec![0u8; 1024];
            let _ = server.read(&mut sink).await;
            server
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                .await
                .unwrap();
        });
        let mut buf = BytesMut::new();
        assert!(!upgrade_probe(&mut client, &mut buf, "example.com:80")
            .await
            .unwrap());
        assert!(buf.is_empty());
    }
}
