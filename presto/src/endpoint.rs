//! Remote endpoints and endpoint groups.

pub mod group;
pub mod selection;

use std::fmt;
use std::net::IpAddr;

use crate::error::{Error, ErrorKind};

pub use group::{
    CompositeEndpointGroup, DynamicEndpointGroup, EndpointGroup, HealthChecker,
    HealthCheckedEndpointGroup, StaticEndpointGroup,
};
pub use selection::{EndpointSelector, RoundRobin, Sticky, WeightedRoundRobin};

/// A named remote target.
///
/// The hostname is stored as lowercased ASCII with any trailing dot
/// preserved; [`Endpoint::authority`] renders `host[:port]` for HTTP
/// headers while [`Endpoint::host_for_sni`] strips the trailing dot for the
/// TLS handshake.
#[derive(Clone)]
pub struct Endpoint {
    host: String,
    ip: Option<IpAddr>,
    port: Option<u16>,
    weight: u32,
    attributes: http::Extensions,
}

impl Endpoint {
    /// Creates an endpoint from a hostname or IP literal.
    pub fn new(host: impl AsRef<str>) -> Result<Self, Error> {
        let raw = host.as_ref();
        if let Ok(ip) = raw.parse::<IpAddr>() {
            return Ok(Endpoint {
                host: raw.to_ascii_lowercase(),
                ip: Some(ip),
                port: None,
                weight: 1,
                attributes: http::Extensions::new(),
            });
        }
        let host = normalize_host(raw)?;
        Ok(Endpoint {
            host,
            ip: None,
            port: None,
            weight: 1,
            attributes: http::Extensions::new(),
        })
    }

    /// Parses `host[:port]`, including the bracketed IPv6 form
    /// `[addr]:port`.
    pub fn parse(authority: impl AsRef<str>) -> Result<Self, Error> {
        let authority = authority.as_ref();
        if let Some(rest) = authority.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| {
                Error::new(ErrorKind::InvalidUri).with(format!("unclosed bracket in {authority:?}"))
            })?;
            return match tail.strip_prefix(':') {
                Some(port) => {
                    let port: u16 = port.parse().map_err(|_| {
                        Error::new(ErrorKind::InvalidUri)
                            .with(format!("invalid port in {authority:?}"))
                    })?;
                    Ok(Endpoint::new(host)?.with_port(port))
                }
                None => Endpoint::new(host),
            };
        }
        match authority.rsplit_once(':') {
            // An IPv6 literal without brackets has multiple colons.
            Some((host, port)) if !host.contains(':') => {
                let port: u16 = port.parse().map_err(|_| {
                    Error::new(ErrorKind::InvalidUri).with(format!("invalid port in {authority:?}"))
                })?;
                Ok(Endpoint::new(host)?.with_port(port))
            }
            _ => Endpoint::new(authority),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_ip_addr(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Attaches a typed attribute, replacing any previous value of the same
    /// type.
    pub fn with_attr<T: Clone + Send + Sync + 'static>(mut self, value: T) -> Self {
        self.attributes.insert(value);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The resolved address, when the endpoint was created from (or
    /// assigned) an IP.
    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// The explicit port, or `default` otherwise.
    pub fn port_or(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn attr<T: Clone + Send + Sync + 'static>(&self) -> Option<&T> {
        self.attributes.get()
    }

    fn host_in_authority(&self) -> String {
        // IPv6 literals are bracketed in authority position.
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    /// `host[:port]` as it appears in `:authority` / `Host` headers.
    pub fn authority(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host_in_authority(), port),
            None => self.host_in_authority(),
        }
    }

    /// `host[:port]`, omitting the port when it equals `default_port`.
    pub fn authority_for_port(&self, default_port: u16) -> String {
        match self.port {
            Some(port) if port != default_port => {
                format!("{}:{}", self.host_in_authority(), port)
            }
            _ => self.host_in_authority(),
        }
    }

    /// The SNI hostname: the host with any trailing dot stripped.
    pub fn host_for_sni(&self) -> &str {
        self.host.strip_suffix('.').unwrap_or(&self.host)
    }

    /// Whether the hostname is an IP literal (no DNS resolution needed).
    pub fn is_ip(&self) -> bool {
        self.ip.is_some() && self.host.parse::<IpAddr>().is_ok()
    }
}

fn normalize_host(raw: &str) -> Result<String, Error> {
    if raw.is_empty() {
        return Err(Error::new(ErrorKind::InvalidUri).with("empty host"));
    }
    if !raw.is_ascii() {
        return Err(Error::new(ErrorKind::InvalidUri)
            .with(format!("non-ASCII host {raw:?}; A-label encode it first")));
    }
    let ok = raw
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.' || b == b'_');
    if !ok {
        return Err(Error::new(ErrorKind::InvalidUri).with(format!("invalid host {raw:?}")));
    }
    Ok(raw.to_ascii_lowercase())
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host
            && self.ip == other.ip
            && self.port == other.port
            && self.weight == other.weight
    }
}

impl Eq for Endpoint {}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("ip", &self.ip)
            .field("port", &self.port)
            .field("weight", &self.weight)
            .finish()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_is_lowercased_and_trailing_dot_preserved() {
        let ep = Endpoint::new("Example.COM.").unwrap();
        assert_eq!(ep.host(), "example.com.");
        assert_eq!(ep.authority(), "example.com.");
        assert_eq!(ep.host_for_sni(), "example.com");
    }

    #[test]
    fn authority_includes_port() {
        let ep = Endpoint::parse("example.com:8080").unwrap();
        assert_eq!(ep.authority(), "example.com:8080");
        assert_eq!(ep.authority_for_port(8080), "example.com");
        assert_eq!(ep.authority_for_port(80), "example.com:8080");
    }

    #[test]
    fn ip_literals_skip_dns() {
        let ep = Endpoint::parse("127.0.0.1:9000").unwrap();
        assert_eq!(ep.ip(), Some("127.0.0.1".parse().unwrap()));
        assert!(ep.is_ip());
    }

    #[test]
    fn non_ascii_hosts_are_rejected() {
        assert!(Endpoint::new("bücher.example").is_err());
    }

    #[test]
    fn attributes_are_typed() {
        #[derive(Clone, PartialEq, Debug)]
        struct Zone(&'static str);
        let ep = Endpoint::new("example.com").unwrap().with_attr(Zone("us-east"));
        assert_eq!(ep.attr::<Zone>(), Some(&Zone("us-east")));
    }
}
