//! Redirect-following decorator.
//!
//! `Location` values are resolved against the current absolute URI with
//! RFC 3986 reference resolution (including dot-segment removal). `303`
//! rewrites the method to GET and drops the body; `301`/`302` behave like
//! `303` for non-GET/HEAD methods; `307`/`308` preserve method and body.
//! Loops are detected on `(method, absolute-URI)` pairs; cross-host
//! redirects require an allow-list unless the client was built without a
//! base URI.

use std::collections::HashSet;

use http::header::LOCATION;
use http::{Method, StatusCode};
use url::Url;

use crate::body::Body;
use crate::context::ClientRequestContext;
use crate::endpoint::Endpoint;
use crate::error::{Error, ErrorKind};
use crate::service::transport::normalize_path;
use crate::service::{BoxFuture, HttpClient, SharedHttpClient};
use crate::session::SessionProtocol;

#[derive(Clone)]
pub struct RedirectConfig {
    pub max_redirects: u32,
    /// Whether a redirect may leave the original host. Clients built
    /// without a base URI allow this by default.
    pub allow_cross_host: bool,
    /// Hosts a cross-host redirect may target even when `allow_cross_host`
    /// is false.
    pub allowed_hosts: Vec<String>,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        RedirectConfig {
            max_redirects: 10,
            allow_cross_host: false,
            allowed_hosts: Vec::new(),
        }
    }
}

impl RedirectConfig {
    pub fn max_redirects(mut self, max: u32) -> Self {
        self.max_redirects = max;
        self
    }

    pub fn allow_cross_host(mut self, allow: bool) -> Self {
        self.allow_cross_host = allow;
        self
    }

    pub fn allow_host(mut self, host: impl Into<String>) -> Self {
        self.allowed_hosts.push(host.into().to_ascii_lowercase());
        self
    }
}

pub(crate) struct RedirectingClient {
    inner: SharedHttpClient,
    config: RedirectConfig,
}

impl RedirectingClient {
    pub(crate) fn new(inner: SharedHttpClient, config: RedirectConfig) -> Self {
        RedirectingClient { inner, config }
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Whether the redirect rewrites the method to GET and drops the body.
fn downgrades_to_get(status: StatusCode, method: &Method) -> bool {
    match status {
        StatusCode::SEE_OTHER => method != Method::GET && method != Method::HEAD,
        // Historical clients rewrote these too; treating them like 303 for
        // non-idempotent methods is the safe reading.
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => {
            method != Method::GET && method != Method::HEAD
        }
        _ => false,
    }
}

impl HttpClient for RedirectingClient {
    fn execute(
        &self,
        ctx: ClientRequestContext,
        request: http::Request<Body>,
    ) -> BoxFuture<'static, Result<http::Response<Body>, Error>> {
        let inner = self.inner.clone();
        let config = self.config.clone();
        Box::pin(async move {
            let (mut parts, mut body) = request.into_parts();
            // Replaying the body across hops requires a fixed payload.
            let replayable = body.content_length().is_some();
            let payload = if replayable {
                let bytes = body.collect_bytes(None).await?.0;
                body = Body::from_bytes(bytes.clone());
                Some(bytes)
            } else {
                None
            };

            let mut current_ctx = ctx.clone();
            let mut visited: HashSet<(Method, String)> = HashSet::new();
            let mut hops: u32 = 0;
            let mut body = payload
                .clone()
                .map(Body::from_bytes)
                .unwrap_or(body);

            loop {
                let request = {
                    let mut request = http::Request::new(body);
                    *request.method_mut() = parts.method.clone();
                    *request.uri_mut() = parts.uri.clone();
                    *request.headers_mut() = parts.headers.clone();
                    request
                };

                let origin_host = current_ctx.endpoint().host().to_owned();
                visited.insert((
                    parts.method.clone(),
                    absolute_uri(&current_ctx)?.to_string(),
                ));

                let response = inner.execute(current_ctx.clone(), request).await?;
                let status = response.status();
                if !is_redirect(status) || hops >= config.max_redirects {
                    return Ok(response);
                }
                let Some(location) = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned)
                else {
                    return Ok(response);
                };

                let target = absolute_uri(&current_ctx)?
                    .join(&location)
                    .map_err(|e| Error::new(ErrorKind::InvalidRedirect).with(e))?;
                let target_host = target
                    .host_str()
                    .ok_or_else(|| {
                        Error::new(ErrorKind::InvalidRedirect)
                            .with(format!("no host in Location {location:?}"))
                    })?
                    .to_ascii_lowercase();

                if target_host != origin_host
                    && !config.allow_cross_host
                    && !config.allowed_hosts.contains(&target_host)
                {
                    return Err(Error::new(ErrorKind::InvalidRedirect).with(format!(
                        "cross-host redirect from {origin_host} to {target_host} is not allowed"
                    )));
                }

                let next_method = if downgrades_to_get(status, &parts.method) {
                    Method::GET
                } else {
                    parts.method.clone()
                };
                if next_method != Method::GET && payload.is_none() && !replayable {
                    // A streaming body cannot be replayed; surface the
                    // redirect to the caller instead.
                    return Ok(response);
                }
                if !visited.insert((next_method.clone(), target.to_string())) {
                    return Err(Error::new(ErrorKind::InvalidRedirect).with(format!(
                        "redirect loop detected: {next_method} {target}"
                    )));
                }

                // Abandon the interim response and follow.
                drop(response);
                hops += 1;

                let endpoint = endpoint_for(&target)?;
                let protocol = protocol_for(&target, current_ctx.protocol())?;
                let path = normalize_path(target.path());
                let query = target.query().map(str::to_owned);
                current_ctx =
                    current_ctx.derive_with(endpoint, protocol, path.clone(), query.clone());

                parts.method = next_method.clone();
                let path_and_query = match &query {
                    Some(q) => format!("{path}?{q}"),
                    None => path,
                };
                parts.uri = path_and_query
                    .parse()
                    .map_err(|e| Error::new(ErrorKind::InvalidRedirect).with(e))?;
                body = if next_method == Method::GET {
                    Body::empty()
                } else {
                    payload.clone().map(Body::from_bytes).unwrap_or_default()
                };
            }
        })
    }
}

/// The absolute URI of the context's frozen request target.
fn absolute_uri(ctx: &ClientRequestContext) -> Result<Url, Error> {
    let authority = ctx
        .authority()
        .unwrap_or_else(|| ctx.endpoint().authority());
    let scheme = ctx.protocol().scheme();
    let query = match ctx.query() {
        Some(q) => format!("?{q}"),
        None => String::new(),
    };
    Url::parse(&format!("{scheme}://{authority}{}{query}", ctx.path()))
        .map_err(|e| Error::new(ErrorKind::InvalidRedirect).with(e))
}

fn endpoint_for(url: &Url) -> Result<Endpoint, Error> {
    let host = url.host_str().ok_or_else(|| {
        Error::new(ErrorKind::InvalidRedirect).with("redirect target has no host")
    })?;
    let endpoint = Endpoint::new(host)?;
    Ok(match url.port() {
        Some(port) => endpoint.with_port(port),
        None => endpoint,
    })
}

fn protocol_for(url: &Url, current: SessionProtocol) -> Result<SessionProtocol, Error> {
    match url.scheme() {
        "https" => Ok(if current.is_multiplex() {
            SessionProtocol::H2
        } else {
            SessionProtocol::H1
        }),
        "http" => Ok(if current.is_multiplex() {
            SessionProtocol::H2C
        } else {
            SessionProtocol::H1C
        }),
        other => {
            Err(Error::new(ErrorKind::InvalidRedirect)
                .with(format!("unsupported redirect scheme {other:?}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextDefaults, ExchangeType};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    struct Scripted {
        // (expected path, response status, location header)
        script: Mutex<VecDeque<(String, StatusCode, Option<String>)>>,
    }

    impl HttpClient for Scripted {
        fn execute(
            &self,
            ctx: ClientRequestContext,
            _request: http::Request<Body>,
        ) -> BoxFuture<'static, Result<http::Response<Body>, Error>> {
            let (expected, status, location) =
                self.script.lock().unwrap().pop_front().expect("script ran dry");
            assert_eq!(ctx.path(), expected);
            ctx.freeze_authority(ctx.endpoint().authority());
            Box::pin(async move {
                let mut response = http::Response::new(Body::from("done"));
                *response.status_mut() = status;
                if let Some(location) = location {
                    response
                        .headers_mut()
                        .insert(LOCATION, location.parse().unwrap());
                }
                Ok(response)
            })
        }
    }

    fn ctx(path: &str) -> ClientRequestContext {
        ClientRequestContext::new(
            SessionProtocol::H1C,
            Endpoint::parse("origin.example:8080").unwrap(),
            Method::GET,
            path.into(),
            None,
            ExchangeType::ResponseStreaming,
            ContextDefaults::default(),
        )
    }

    fn scripted(steps: Vec<(&str, StatusCode, Option<&str>)>) -> Arc<Scripted> {
        Arc::new(Scripted {
            script: Mutex::new(
                steps
                    .into_iter()
                    .map(|(p, s, l)| (p.to_owned(), s, l.map(str::to_owned)))
                    .collect(),
            ),
        })
    }

    #[tokio::test]
    async fn follows_relative_redirects_within_limit() {
        let inner = scripted(vec![
            ("/foo", StatusCode::TEMPORARY_REDIRECT, Some("/fooRedirect1")),
            (
                "/fooRedirect1",
                StatusCode::TEMPORARY_REDIRECT,
                Some("/fooRedirect2"),
            ),
            ("/fooRedirect2", StatusCode::OK, None),
        ]);
        let client =
            RedirectingClient::new(inner, RedirectConfig::default().max_redirects(2));
        let response = client
            .execute(ctx("/foo"), http::Request::new(Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn exceeding_the_limit_returns_the_raw_redirect() {
        let inner = scripted(vec![
            ("/foo", StatusCode::TEMPORARY_REDIRECT, Some("/fooRedirect1")),
            (
                "/fooRedirect1",
                StatusCode::TEMPORARY_REDIRECT,
                Some("/fooRedirect2"),
            ),
        ]);
        let client =
            RedirectingClient::new(inner, RedirectConfig::default().max_redirects(1));
        let response = client
            .execute(ctx("/foo"), http::Request::new(Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers()[LOCATION], "/fooRedirect2");
    }

    #[tokio::test]
    async fn dot_segments_resolve_per_rfc3986() {
        let inner = scripted(vec![
            ("/a/b/c", StatusCode::FOUND, Some("../d")),
            ("/a/d", StatusCode::OK, None),
        ]);
        let client = RedirectingClient::new(inner, RedirectConfig::default());
        let response = client
            .execute(ctx("/a/b/c"), http::Request::new(Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cross_host_redirects_are_rejected_by_default() {
        let inner = scripted(vec![(
            "/foo",
            StatusCode::FOUND,
            Some("http://elsewhere.example/bar"),
        )]);
        let client = RedirectingClient::new(inner, RedirectConfig::default());
        let err = client
            .execute(ctx("/foo"), http::Request::new(Body::empty()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRedirect);
    }

    #[tokio::test]
    async fn allow_listed_hosts_may_be_redirected_to() {
        let inner = scripted(vec![
            ("/foo", StatusCode::FOUND, Some("http://elsewhere.example/bar")),
            ("/bar", StatusCode::OK, None),
        ]);
        let client = RedirectingClient::new(
            inner,
            RedirectConfig::default().allow_host("elsewhere.example"),
        );
        let response = client
            .execute(ctx("/foo"), http::Request::new(Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn same_method_loop_is_detected() {
        let inner = scripted(vec![
            ("/a", StatusCode::FOUND, Some("/b")),
            ("/b", StatusCode::FOUND, Some("/a")),
        ]);
        let client = RedirectingClient::new(inner, RedirectConfig::default());
        let err = client
            .execute(ctx("/a"), http::Request::new(Body::empty()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRedirect);
    }

    #[tokio::test]
    async fn see_other_downgrades_post_to_get() {
        let inner = scripted(vec![
            ("/submit", StatusCode::SEE_OTHER, Some("/result")),
            ("/result", StatusCode::OK, None),
        ]);
        let client = RedirectingClient::new(inner, RedirectConfig::default());
        let mut request = http::Request::new(Body::from("payload"));
        *request.method_mut() = Method::POST;
        let post_ctx = ClientRequestContext::new(
            SessionProtocol::H1C,
            Endpoint::parse("origin.example:8080").unwrap(),
            Method::POST,
            "/submit".into(),
            None,
            ExchangeType::ResponseStreaming,
            ContextDefaults::default(),
        );
        let response = client.execute(post_ctx, request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
