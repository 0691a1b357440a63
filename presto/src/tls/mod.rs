//! TLS context factory.
//!
//! Client configurations are expensive to build (root store parsing, key
//! loading), so they are cached per `(SNI, key pair, trust profile)` and
//! handed out as refcounted [`TlsContext`] handles. A session holds its
//! handle for its lifetime; contexts with no remaining references may be
//! evicted.

use std::fmt;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::error::{Error, ErrorKind};

pub(crate) const ALPN_H2: &[u8] = b"h2";
pub(crate) const ALPN_H1: &[u8] = b"http/1.1";

/// A client certificate/key pair, optionally scoped to a hostname pattern.
///
/// `pattern` is an exact hostname or a wildcard covering one left-most
/// label (`*.example.com`); `None` is the default pair used when no SNI
/// pattern matches.
#[derive(Clone)]
pub struct TlsKeyPair {
    pattern: Option<String>,
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
}

impl TlsKeyPair {
    pub fn new(cert_pem: impl Into<Vec<u8>>, key_pem: impl Into<Vec<u8>>) -> Self {
        TlsKeyPair {
            pattern: None,
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
        }
    }

    pub fn for_host(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into().to_ascii_lowercase());
        self
    }

    fn matches(&self, sni: &str) -> KeyPairMatch {
        match &self.pattern {
            None => KeyPairMatch::Default,
            Some(pattern) if pattern == sni => KeyPairMatch::Exact,
            Some(pattern) => match pattern.strip_prefix("*.") {
                Some(suffix) => {
                    // A wildcard covers exactly one additional label.
                    let matched = sni
                        .strip_suffix(suffix)
                        .and_then(|head| head.strip_suffix('.'))
                        .is_some_and(|label| !label.is_empty() && !label.contains('.'));
                    if matched {
                        KeyPairMatch::Wildcard
                    } else {
                        KeyPairMatch::None
                    }
                }
                None => KeyPairMatch::None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum KeyPairMatch {
    None,
    Default,
    Wildcard,
    Exact,
}

/// Client-wide TLS settings.
#[derive(Clone, Default)]
pub struct TlsSettings {
    /// Client auth key pairs; resolution order is exact > wildcard >
    /// default.
    pub key_pairs: Vec<TlsKeyPair>,
    /// Extra trusted CA certificates in PEM form, added to the root set.
    pub trusted_certs_pem: Vec<Vec<u8>>,
    /// Disable certificate verification for every host.
    pub no_verify: bool,
    /// Disable certificate verification for these hosts only.
    pub no_verify_hosts: Vec<String>,
}

impl TlsSettings {
    fn verification_disabled_for(&self, sni: &str) -> bool {
        self.no_verify || self.no_verify_hosts.iter().any(|h| h == sni)
    }

    fn key_pair_for(&self, sni: &str) -> Option<usize> {
        self.key_pairs
            .iter()
            .enumerate()
            .map(|(i, kp)| (kp.matches(sni), i))
            .filter(|(m, _)| *m != KeyPairMatch::None)
            .max_by_key(|(m, _)| *m)
            .map(|(_, i)| i)
    }
}

/// Identifies one cached context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct TlsContextKey {
    sni: Option<String>,
    key_pair: Option<usize>,
    no_verify: bool,
    alpn_h2: bool,
}

/// A refcounted handle on a built `rustls` client configuration.
pub struct TlsContext {
    config: Arc<ClientConfig>,
    refs: Arc<AtomicUsize>,
}

impl TlsContext {
    pub(crate) fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.config.clone())
    }

    /// Performs the client handshake. `sni` must already have any trailing
    /// dot stripped.
    pub(crate) async fn connect<IO>(&self, sni: &str, io: IO) -> Result<TlsStream<IO>, Error>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let name = ServerName::try_from(sni.to_owned())
            .map_err(|e| Error::new(ErrorKind::Tls).with(e))?;
        let stream = self
            .connector()
            .connect(name, io)
            .await
            .map_err(|e| Error::unprocessed(Error::new(ErrorKind::Tls).with(e)))?;
        crate::metrics::record_certificate(sni, stream.get_ref().1);
        Ok(stream)
    }

    /// The ALPN protocol list this context offers.
    pub(crate) fn alpn(&self) -> &[Vec<u8>] {
        &self.config.alpn_protocols
    }
}

impl Clone for TlsContext {
    fn clone(&self) -> Self {
        self.refs.fetch_add(1, Ordering::Relaxed);
        TlsContext {
            config: self.config.clone(),
            refs: self.refs.clone(),
        }
    }
}

impl Drop for TlsContext {
    fn drop(&mut self) {
        self.refs.fetch_sub(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .finish()
    }
}

struct CachedContext {
    config: Arc<ClientConfig>,
    refs: Arc<AtomicUsize>,
}

/// Builds and caches [`TlsContext`]s.
pub struct TlsContextCache {
    settings: TlsSettings,
    contexts: Mutex<HashMap<TlsContextKey, CachedContext>>,
}

impl TlsContextCache {
    pub fn new(settings: TlsSettings) -> Self {
        TlsContextCache {
            settings,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// The context for `sni` (trailing dot already stripped), reusing a
    /// cached configuration when one exists for the same key.
    pub(crate) fn acquire(&self, sni: &str, offer_h2: bool) -> Result<TlsContext, Error> {
        let key = TlsContextKey {
            sni: Some(sni.to_owned()),
            key_pair: self.settings.key_pair_for(sni),
            no_verify: self.settings.verification_disabled_for(sni),
            alpn_h2: offer_h2,
        };

        let mut contexts = self.contexts.lock().unwrap();
        if let Some(cached) = contexts.get(&key) {
            cached.refs.fetch_add(1, Ordering::Relaxed);
            return Ok(TlsContext {
                config: cached.config.clone(),
                refs: cached.refs.clone(),
            });
        }

        let config = Arc::new(self.build(&key)?);
        let refs = Arc::new(AtomicUsize::new(1));
        contexts.insert(
            key,
            CachedContext {
                config: config.clone(),
                refs: refs.clone(),
            },
        );
        Ok(TlsContext { config, refs })
    }

    /// Key-pair profile discriminator for pool keys: sessions built with
    /// different client identities must not share a pool bucket.
    pub(crate) fn profile_of(&self, sni: &str) -> Option<u64> {
        self.settings.key_pair_for(sni).map(|i| i as u64)
    }

    /// Drops cached configurations that no session references.
    pub fn evict_unused(&self) {
        self.contexts
            .lock()
            .unwrap()
            .retain(|_, cached| cached.refs.load(Ordering::Relaxed) > 0);
    }

    /// Number of cached configurations, for introspection and tests.
    pub fn len(&self) -> usize {
        self.contexts.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn build(&self, key: &TlsContextKey) -> Result<ClientConfig, Error> {
        let builder = ClientConfig::builder();

        let builder = if key.no_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::NoVerifier::new()))
        } else {
            let mut roots = RootCertStore::empty();
            #[cfg(feature = "tls-native-roots")]
            {
                for cert in rustls_native_certs::load_native_certs().certs {
                    let _ = roots.add(cert);
                }
            }
            #[cfg(feature = "tls-webpki-roots")]
            {
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
            for pem in &self.settings.trusted_certs_pem {
                add_certs_from_pem(pem, &mut roots)?;
            }
            builder.with_root_certificates(roots)
        };

        let mut config = match key.key_pair {
            Some(index) => {
                let pair = &self.settings.key_pairs[index];
                let (certs, key) = load_identity(&pair.cert_pem, &pair.key_pem)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| Error::new(ErrorKind::Tls).with(e))?
            }
            None => builder.with_no_client_auth(),
        };

        if key.alpn_h2 {
            config.alpn_protocols.push(ALPN_H2.into());
        }
        config.alpn_protocols.push(ALPN_H1.into());
        Ok(config)
    }
}

fn add_certs_from_pem(pem: &[u8], roots: &mut RootCertStore) -> Result<(), Error> {
    for cert in rustls_pemfile::certs(&mut Cursor::new(pem)) {
        let cert = cert.map_err(|e| Error::new(ErrorKind::Tls).with(e))?;
        roots
            .add(cert)
            .map_err(|e| Error::new(ErrorKind::Tls).with(e))?;
    }
    Ok(())
}

fn load_identity(
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), Error> {
    let certs = rustls_pemfile::certs(&mut Cursor::new(cert_pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::new(ErrorKind::Tls).with(e))?;
    let key = rustls_pemfile::private_key(&mut Cursor::new(key_pem))
        .map_err(|e| Error::new(ErrorKind::Tls).with(e))?
        .ok_or_else(|| Error::new(ErrorKind::Tls).with("no private key in PEM"))?;
    Ok((certs, key))
}

mod danger {
    use tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use tokio_rustls::rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature};
    use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use tokio_rustls::rustls::{DigitallySignedStruct, SignatureScheme};

    /// Accepts any server certificate; installed only for hosts the caller
    /// explicitly opted out of verification for.
    #[derive(Debug)]
    pub(super) struct NoVerifier {
        provider: tokio_rustls::rustls::crypto::CryptoProvider,
    }

    impl NoVerifier {
        pub(super) fn new() -> Self {
            NoVerifier {
                provider: ring::default_provider(),
            }
        }
    }

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
            verify_tls12_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
            verify_tls13_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.provider
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(pattern: Option<&str>) -> TlsKeyPair {
        let pair = TlsKeyPair::new(b"cert".to_vec(), b"key".to_vec());
        match pattern {
            Some(p) => pair.for_host(p),
            None => pair,
        }
    }

    #[test]
    fn key_pair_resolution_prefers_exact_then_wildcard_then_default() {
        let settings = TlsSettings {
            key_pairs: vec![
                pair(None),
                pair(Some("*.example.com")),
                pair(Some("api.example.com")),
            ],
            ..Default::default()
        };
        assert_eq!(settings.key_pair_for("api.example.com"), Some(2));
        assert_eq!(settings.key_pair_for("web.example.com"), Some(1));
        assert_eq!(settings.key_pair_for("other.test"), Some(0));
    }

    #[test]
    fn wildcard_covers_exactly_one_label() {
        let kp = pair(Some("*.example.com"));
        assert_eq!(kp.matches("a.example.com"), KeyPairMatch::Wildcard);
        assert_eq!(kp.matches("a.b.example.com"), KeyPairMatch::None);
        assert_eq!(kp.matches("example.com"), KeyPairMatch::None);
    }

    #[test]
    fn no_verify_hosts_scope_the_permissive_verifier() {
        let settings = TlsSettings {
            no_verify_hosts: vec!["self-signed.test".into()],
            ..Default::default()
        };
        assert!(settings.verification_disabled_for("self-signed.test"));
        assert!(!settings.verification_disabled_for("example.com"));
    }

    #[test]
    fn contexts_are_cached_and_refcounted() {
        let cache = TlsContextCache::new(TlsSettings {
            no_verify: true,
            ..Default::default()
        });

        let a = cache.acquire("example.com", true).unwrap();
        let b = cache.acquire("example.com", true).unwrap();
        assert!(Arc::ptr_eq(&a.config, &b.config));
        assert_eq!(cache.len(), 1);

        // Still referenced, so eviction keeps it.
        cache.evict_unused();
        assert_eq!(cache.len(), 1);

        drop(a);
        drop(b);
        cache.evict_unused();
        assert!(cache.is_empty());
    }

    #[test]
    fn alpn_follows_the_desired_protocol() {
        let cache = TlsContextCache::new(TlsSettings {
            no_verify: true,
            ..Default::default()
        });
        let h2 = cache.acquire("example.com", true).unwrap();
        assert_eq!(h2.alpn(), &[ALPN_H2.to_vec(), ALPN_H1.to_vec()]);
        let h1 = cache.acquire("example.com", false).unwrap();
        assert_eq!(h1.alpn(), &[ALPN_H1.to_vec()]);
    }
}
