//! Byte-level HTTP/1.1 behavior against raw in-process sockets.

use std::time::Duration;

use presto::WebClient;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const USER_AGENT: &str = concat!("presto/", env!("CARGO_PKG_VERSION"));

async fn read_head(socket: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "peer closed before the request head completed");
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            return buf;
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_body_request_emits_exact_bytes_and_nothing_more() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let head = read_head(&mut socket).await;

        // No body must follow an empty-body request.
        let mut extra = [0u8; 64];
        let quiet =
            tokio::time::timeout(Duration::from_secs(1), socket.read(&mut extra)).await;
        assert!(quiet.is_err(), "unexpected bytes after the request head");

        socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
            .await
            .unwrap();
        head
    });

    let client = WebClient::builder(format!("h1c://127.0.0.1:{}", addr.port()))
        .unwrap()
        .build()
        .unwrap();
    let response = client.get("/foo").await.unwrap();
    assert_eq!(response.status(), http::StatusCode::OK);

    let head = server.await.unwrap();
    let expected = format!(
        "GET /foo HTTP/1.1\r\nhost: 127.0.0.1:{}\r\nuser-agent: {USER_AGENT}\r\n\r\n",
        addr.port()
    );
    assert_eq!(
        std::str::from_utf8(&head).unwrap(),
        expected,
        "wire bytes differ"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn exchanges_are_strictly_serial_on_one_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        for n in 0..3u8 {
            let head = read_head(&mut socket).await;
            let text = String::from_utf8(head).unwrap();
            assert!(text.starts_with(&format!("GET /serial/{n} ")));
            let body = format!("response {n}");
            socket
                .write_all(
                    format!(
                        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n{body}",
                        body.len()
                    )
                    .as_bytes(),
                )
                .await
                .unwrap();
        }
    });

    let client = WebClient::builder(format!("h1c://127.0.0.1:{}", addr.port()))
        .unwrap()
        .build()
        .unwrap();
    for n in 0..3 {
        let response = client.get(format!("/serial/{n}")).await.unwrap();
        assert_eq!(response.content_utf8().unwrap(), format!("response {n}"));
    }
    // All three went over one pooled connection.
    assert_eq!(client.open_connections(), 1);
    server.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn chunked_responses_stream_through() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_head(&mut socket).await;
        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n\
                  5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
            )
            .await
            .unwrap();
    });

    let client = WebClient::builder(format!("h1c://127.0.0.1:{}", addr.port()))
        .unwrap()
        .build()
        .unwrap();
    let response = client.get("/chunked").await.unwrap();
    assert_eq!(response.content_utf8().unwrap(), "hello world");
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_close_is_honored() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        // Two sequential connections, one exchange each.
        for _ in 0..2 {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_head(&mut socket).await;
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\nconnection: close\r\ncontent-length: 2\r\n\r\nok",
                )
                .await
                .unwrap();
        }
    });

    let client = WebClient::builder(format!("h1c://127.0.0.1:{}", addr.port()))
        .unwrap()
        .build()
        .unwrap();
    for _ in 0..2 {
        let response = client.get("/close").await.unwrap();
        assert_eq!(response.content_utf8().unwrap(), "ok");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn double_slash_paths_collapse_but_query_survives() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let head = read_head(&mut socket).await;
        socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
            .await
            .unwrap();
        String::from_utf8(head).unwrap()
    });

    let client = WebClient::builder(format!("h1c://127.0.0.1:{}", addr.port()))
        .unwrap()
        .build()
        .unwrap();
    client.get("/a//b?a//b").await.unwrap();
    let head = server.await.unwrap();
    assert!(head.starts_with("GET /a/b?a//b HTTP/1.1\r\n"), "{head:?}");
}
