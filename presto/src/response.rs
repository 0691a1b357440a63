//! Aggregated responses.
//!
//! The core always returns a streaming `http::Response<Body>`; aggregation
//! is a thin preparation layer that buffers the body in memory. Conversions
//! to richer representations (JSON, user types) live outside this crate and
//! consume [`AggregatedResponse`].

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};

use crate::body::Body;
use crate::error::Error;

/// A fully buffered response: status, headers and content bytes.
#[derive(Debug, Clone)]
pub struct AggregatedResponse {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    content: Bytes,
    trailers: Option<HeaderMap>,
}

impl AggregatedResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    /// The content interpreted as UTF-8.
    pub fn content_utf8(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.content)
    }

    /// Consumes the response, returning the content bytes.
    pub fn into_content(self) -> Bytes {
        self.content
    }
}

/// Buffers `response` fully in memory. `max_length`, when set, bounds the
/// total content size; exceeding it fails with `InvalidHttpResponse`.
pub async fn aggregate(
    response: http::Response<Body>,
    max_length: Option<u64>,
) -> Result<AggregatedResponse, Error> {
    let (parts, body) = response.into_parts();
    let (content, trailers) = body.collect_bytes(max_length).await?;
    Ok(AggregatedResponse {
        status: parts.status,
        version: parts.version,
        headers: parts.headers,
        content,
        trailers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn aggregate_buffers_status_headers_and_content() {
        let response = http::Response::builder()
            .status(StatusCode::CREATED)
            .header("x-test", "1")
            .body(Body::from("payload"))
            .unwrap();
        let aggregated = aggregate(response, None).await.unwrap();
        assert_eq!(aggregated.status(), StatusCode::CREATED);
        assert_eq!(aggregated.headers()["x-test"], "1");
        assert_eq!(aggregated.content_utf8().unwrap(), "payload");
    }
}
