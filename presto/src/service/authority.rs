//! Authority resolution for the outgoing `:authority` / `Host` header.

use http::header::HOST;
use http::HeaderMap;

use crate::context::ClientRequestContext;
use crate::endpoint::Endpoint;

/// The `:authority` pseudo-header name as it appears in additional request
/// headers.
pub const PSEUDO_AUTHORITY: &str = ":authority";

/// Resolves the effective authority for a request. First non-null wins:
///
/// 1. The context's additional request headers' `:authority`.
/// 2. The context's additional request headers' `Host`.
/// 3. The request headers' `Host` (the incoming authority).
/// 4. The client's default headers (`:authority`, then `Host`).
/// 5. Derived from the endpoint, omitting the port when it is the default
///    for the scheme.
pub fn resolve(
    ctx: &ClientRequestContext,
    request_headers: &HeaderMap,
    default_headers: &HeaderMap,
    endpoint: &Endpoint,
    default_port: u16,
) -> String {
    let additional = ctx.additional_headers();

    header_authority(&additional, PSEUDO_AUTHORITY)
        .or_else(|| header_authority(&additional, "host"))
        .or_else(|| header_authority(request_headers, "host"))
        .or_else(|| header_authority(default_headers, PSEUDO_AUTHORITY))
        .or_else(|| header_authority(default_headers, "host"))
        .unwrap_or_else(|| endpoint.authority_for_port(default_port))
}

fn header_authority(headers: &HeaderMap, name: &str) -> Option<String> {
    let value = if name == PSEUDO_AUTHORITY {
        // `HeaderName` rejects pseudo headers, so they are stored under an
        // escaped name.
        headers.get(ESCAPED_AUTHORITY)
    } else {
        headers.get(HOST)
    }?;
    value.to_str().ok().map(str::to_owned)
}

/// `HeaderMap` cannot hold `:authority` literally; additional and default
/// header maps store it under this name instead.
pub const ESCAPED_AUTHORITY: &str = "x-presto-authority";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextDefaults, ExchangeType};
    use crate::session::SessionProtocol;
    use http::header::{HeaderName, HeaderValue};
    use http::Method;

    fn ctx(endpoint: &Endpoint) -> ClientRequestContext {
        ClientRequestContext::new(
            SessionProtocol::H1C,
            endpoint.clone(),
            Method::GET,
            "/".into(),
            None,
            ExchangeType::ResponseStreaming,
            ContextDefaults::default(),
        )
    }

    fn endpoint() -> Endpoint {
        Endpoint::parse("backend.example:8080").unwrap()
    }

    #[test]
    fn additional_authority_wins_over_everything() {
        let ep = endpoint();
        let ctx = ctx(&ep);
        ctx.add_additional_header(
            HeaderName::from_static(ESCAPED_AUTHORITY),
            HeaderValue::from_static("override.example"),
        );

        let mut request_headers = HeaderMap::new();
        request_headers.insert(HOST, HeaderValue::from_static("request.example"));

        let authority = resolve(&ctx, &request_headers, &HeaderMap::new(), &ep, 80);
        assert_eq!(authority, "override.example");
    }

    #[test]
    fn additional_host_beats_request_host() {
        let ep = endpoint();
        let ctx = ctx(&ep);
        ctx.add_additional_header(HOST, HeaderValue::from_static("added.example"));

        let mut request_headers = HeaderMap::new();
        request_headers.insert(HOST, HeaderValue::from_static("request.example"));

        assert_eq!(
            resolve(&ctx, &request_headers, &HeaderMap::new(), &ep, 80),
            "added.example"
        );
    }

    #[test]
    fn request_host_beats_defaults() {
        let ep = endpoint();
        let ctx = ctx(&ep);
        let mut request_headers = HeaderMap::new();
        request_headers.insert(HOST, HeaderValue::from_static("request.example"));
        let mut defaults = HeaderMap::new();
        defaults.insert(HOST, HeaderValue::from_static("default.example"));

        assert_eq!(
            resolve(&ctx, &request_headers, &defaults, &ep, 80),
            "request.example"
        );
    }

    #[test]
    fn endpoint_is_the_fallback_and_omits_default_port() {
        let ep = Endpoint::parse("backend.example:443").unwrap();
        let ctx = ctx(&ep);
        assert_eq!(
            resolve(&ctx, &HeaderMap::new(), &HeaderMap::new(), &ep, 443),
            "backend.example"
        );
        assert_eq!(
            resolve(&ctx, &HeaderMap::new(), &HeaderMap::new(), &ep, 80),
            "backend.example:443"
        );
    }
}
