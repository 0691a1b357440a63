//! End-to-end redirect chains over real sockets.

use presto::service::redirect::RedirectConfig;
use presto::WebClient;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Serves `/foo -> /fooRedirect1 -> /fooRedirect2 -> "fooRedirection2"`
/// over HTTP/1.1, any number of times, on any number of connections.
async fn spawn_redirect_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    let Ok(n) = socket.read(&mut chunk).await else { return };
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    let Some(head_end) =
                        buf.windows(4).position(|w| w == b"\r\n\r\n")
                    else {
                        continue;
                    };
                    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                    buf.drain(..head_end + 4);

                    let path = head.split_whitespace().nth(1).unwrap_or("/").to_owned();
                    let reply = match path.as_str() {
                        "/foo" => "HTTP/1.1 307 Temporary Redirect\r\nlocation: /fooRedirect1\r\ncontent-length: 0\r\n\r\n".to_string(),
                        "/fooRedirect1" => "HTTP/1.1 307 Temporary Redirect\r\nlocation: /fooRedirect2\r\ncontent-length: 0\r\n\r\n".to_string(),
                        "/fooRedirect2" => {
                            let body = "fooRedirection2";
                            format!(
                                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n{body}",
                                body.len()
                            )
                        }
                        _ => "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n".to_string(),
                    };
                    if socket.write_all(reply.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    addr
}

#[tokio::test(flavor = "multi_thread")]
async fn redirect_chain_resolves_within_the_limit() {
    let addr = spawn_redirect_server().await;
    let client = WebClient::builder(format!("h1c://127.0.0.1:{}", addr.port()))
        .unwrap()
        .follow_redirects(RedirectConfig::default().max_redirects(2))
        .build()
        .unwrap();

    let response = client.get("/foo").await.unwrap();
    assert_eq!(response.status(), http::StatusCode::OK);
    assert_eq!(response.content_utf8().unwrap(), "fooRedirection2");
}

#[tokio::test(flavor = "multi_thread")]
async fn exceeding_the_limit_surfaces_the_raw_redirect() {
    let addr = spawn_redirect_server().await;
    let client = WebClient::builder(format!("h1c://127.0.0.1:{}", addr.port()))
        .unwrap()
        .follow_redirects(RedirectConfig::default().max_redirects(1))
        .build()
        .unwrap();

    let response = client.get("/foo").await.unwrap();
    assert_eq!(response.status(), http::StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(response.headers()["location"], "/fooRedirect2");
}

#[tokio::test(flavor = "multi_thread")]
async fn redirects_disabled_by_default() {
    let addr = spawn_redirect_server().await;
    let client = WebClient::builder(format!("h1c://127.0.0.1:{}", addr.port()))
        .unwrap()
        .build()
        .unwrap();

    let response = client.get("/foo").await.unwrap();
    assert_eq!(response.status(), http::StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(response.headers()["location"], "/fooRedirect1");
}
