//! Default `user-agent` decorator.

use http::header::USER_AGENT;
use http::HeaderValue;

use crate::body::Body;
use crate::context::ClientRequestContext;
use crate::error::Error;
use crate::service::{BoxFuture, HttpClient, SharedHttpClient};

const DEFAULT_USER_AGENT: &str = concat!("presto/", env!("CARGO_PKG_VERSION"));

/// Sets `user-agent` when absent; a user-agent already present on the
/// request gets this client's agent appended rather than overwritten.
pub(crate) struct UserAgentClient {
    inner: SharedHttpClient,
    user_agent: HeaderValue,
}

impl UserAgentClient {
    pub(crate) fn new(inner: SharedHttpClient, custom: Option<HeaderValue>) -> Self {
        let user_agent = custom
            .map(|value| {
                let mut buf = Vec::new();
                buf.extend(value.as_bytes());
                buf.push(b' ');
                buf.extend(DEFAULT_USER_AGENT.as_bytes());
                HeaderValue::from_bytes(&buf).expect("user-agent should be valid")
            })
            .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_USER_AGENT));
        UserAgentClient { inner, user_agent }
    }
}

impl HttpClient for UserAgentClient {
    fn execute(
        &self,
        ctx: ClientRequestContext,
        mut request: http::Request<Body>,
    ) -> BoxFuture<'static, Result<http::Response<Body>, Error>> {
        if let Ok(Some(existing)) = request
            .headers_mut()
            .try_insert(USER_AGENT, self.user_agent.clone())
        {
            let mut buf = Vec::new();
            buf.extend(existing.as_bytes());
            buf.push(b' ');
            buf.extend(self.user_agent.as_bytes());
            request.headers_mut().insert(
                USER_AGENT,
                HeaderValue::from_bytes(&buf).expect("user-agent should be valid"),
            );
        }
        self.inner.execute(ctx, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextDefaults, ExchangeType};
    use crate::endpoint::Endpoint;
    use crate::session::SessionProtocol;
    use std::sync::Arc;

    struct CaptureAgent {
        expected: String,
    }

    impl HttpClient for CaptureAgent {
        fn execute(
            &self,
            _ctx: ClientRequestContext,
            request: http::Request<Body>,
        ) -> BoxFuture<'static, Result<http::Response<Body>, Error>> {
            let seen = request
                .headers()
                .get(USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_owned();
            assert_eq!(seen, self.expected);
            Box::pin(async { Ok(http::Response::new(Body::empty())) })
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

    #[tokio::test]
    async fn sets_default_when_absent() {
        let client = UserAgentClient::new(
            Arc::new(CaptureAgent {
                expected: DEFAULT_USER_AGENT.to_owned(),
            }),
            None,
        );
        let _ = client
            .execute(ctx(), http::Request::new(Body::empty()))
            .await;
    }

    #[tokio::test]
    async fn custom_agent_is_prepended() {
        let client = UserAgentClient::new(
            Arc::new(CaptureAgent {
                expected: format!("my-app/2.0 {DEFAULT_USER_AGENT}"),
            }),
            Some(HeaderValue::from_static("my-app/2.0")),
        );
        let _ = client
            .execute(ctx(), http::Request::new(Body::empty()))
            .await;
    }

    #[tokio::test]
    async fn request_agent_keeps_the_lead() {
        let client = UserAgentClient::new(
            Arc::new(CaptureAgent {
                expected: format!("caller/1.0 {DEFAULT_USER_AGENT}"),
            }),
            None,
        );
        let mut request = http::Request::new(Body::empty());
        request
            .headers_mut()
            .insert(USER_AGENT, HeaderValue::from_static("caller/1.0"));
        let _ = client.execute(ctx(), request).await;
    }
}
