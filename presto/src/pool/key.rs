//! Pool keys.

use std::net::SocketAddr;

use crate::session::SessionProtocol;

/// Identity of a set of interchangeable sessions: two sessions share a key
/// iff any request routed to one could equally be served by the other.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub protocol: SessionProtocol,
    pub addr: SocketAddr,
    /// SNI hostname (trailing dot stripped); `None` for cleartext.
    pub sni: Option<String>,
    /// Discriminates client key-pair/trust profiles that would otherwise
    /// collide on the same `(protocol, addr, sni)`.
    pub tls_profile: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_distinguish_protocol_and_sni() {
        let addr: SocketAddr = "10.0.0.1:443".parse().unwrap();
        let a = PoolKey {
            protocol: SessionProtocol::H2,
            addr,
            sni: Some("a.example".into()),
            tls_profile: None,
        };
        let mut b = a.clone();
        assert_eq!(a, b);
        b.sni = Some("b.example".into());
        assert_ne!(a, b);
        let mut c = a.clone();
        c.protocol = SessionProtocol::H1;
        assert_ne!(a, c);
    }
}
