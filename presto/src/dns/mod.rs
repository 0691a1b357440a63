//! Hostname resolution.
//!
//! [`Resolver`] is the seam between the engine and the actual DNS client;
//! [`SystemResolver`] implements it with hickory against the system
//! configuration, and [`CachingResolver`] layers the TTL cache plus
//! single-flight deduplication on top of any resolver.

pub mod cache;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::proto::rr::{RData, RecordType as WireRecordType};
use hickory_resolver::TokioAsyncResolver;

pub use cache::{
    CacheValue, DnsCache, DnsCacheConfig, DnsRecord, Question, RecordType, RemovalCause,
};

use crate::error::{Error, ErrorKind};

/// Resolves one question to address records.
pub trait Resolver: Send + Sync + 'static {
    fn resolve(&self, question: &Question) -> BoxFuture<'static, Result<Vec<DnsRecord>, Error>>;
}

/// Hickory-backed resolver using the system configuration when available.
pub struct SystemResolver {
    inner: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn new() -> Self {
        let inner = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        SystemResolver { inner }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver for SystemResolver {
    fn resolve(&self, question: &Question) -> BoxFuture<'static, Result<Vec<DnsRecord>, Error>> {
        let resolver = self.inner.clone();
        let question = question.clone();
        Box::pin(async move {
            let record_type = match question.record_type {
                RecordType::A => WireRecordType::A,
                RecordType::Aaaa => WireRecordType::AAAA,
            };
            let lookup = resolver
                .lookup(question.name.as_str(), record_type)
                .await
                .map_err(|e| match e.kind() {
                    ResolveErrorKind::Timeout => Error::new(ErrorKind::DnsTimeout).with(e),
                    _ => Error::new(ErrorKind::DnsFailure).with(e),
                })?;

            let records: Vec<DnsRecord> = lookup
                .record_iter()
                .filter_map(|record| {
                    let ttl = Duration::from_secs(u64::from(record.ttl()));
                    match record.data() {
                        Some(RData::A(a)) => Some(DnsRecord {
                            addr: IpAddr::V4(a.0),
                            ttl,
                        }),
                        Some(RData::AAAA(aaaa)) => Some(DnsRecord {
                            addr: IpAddr::V6(aaaa.0),
                            ttl,
                        }),
                        _ => None,
                    }
                })
                .collect();

            if records.is_empty() {
                return Err(Error::new(ErrorKind::DnsFailure)
                    .with(format!("no address records for {question}")));
            }
            Ok(records)
        })
    }
}

type InflightLookup = Shared<BoxFuture<'static, CacheValue>>;

/// Combines a [`DnsCache`] with a delegate [`Resolver`].
///
/// Cache misses for the same question are collapsed into a single delegate
/// lookup; every waiter observes the same outcome, which is then cached
/// with the configured TTL rules.
#[derive(Clone)]
pub struct CachingResolver {
    cache: DnsCache,
    delegate: Arc<dyn Resolver>,
    query_timeout: Option<Duration>,
    inflight: Arc<Mutex<HashMap<Question, InflightLookup>>>,
}

impl CachingResolver {
    pub fn new(
        cache: DnsCache,
        delegate: Arc<dyn Resolver>,
        query_timeout: Option<Duration>,
    ) -> Self {
        CachingResolver {
            cache,
            delegate,
            query_timeout,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn cache(&self) -> &DnsCache {
        &self.cache
    }

    /// Resolves `question`, consulting the cache first. A cached failure is
    /// returned immediately with the original cause attached.
    pub async fn resolve(&self, question: &Question) -> Result<Arc<Vec<DnsRecord>>, Error> {
        if let Some(value) = self.cache.get(question) {
            return unshare(value);
        }

        let lookup = {
            let mut inflight = self.inflight.lock().unwrap();
            match inflight.get(question) {
                Some(existing) => existing.clone(),
                None => {
                    let fut = self.start_lookup(question.clone());
                    inflight.insert(question.clone(), fut.clone());
                    fut
                }
            }
        };
        unshare(lookup.await)
    }

    fn start_lookup(&self, question: Question) -> InflightLookup {
        let delegate = self.delegate.clone();
        let cache = self.cache.clone();
        let inflight = self.inflight.clone();
        let query_timeout = self.query_timeout;
        let fut: BoxFuture<'static, CacheValue> = Box::pin(async move {
            let lookup = delegate.resolve(&question);
            let outcome = match query_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, lookup).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::new(ErrorKind::DnsTimeout)
                        .with(format!("no answer for {question} within {timeout:?}"))),
                },
                None => lookup.await,
            };

            let value: CacheValue = match outcome {
                Ok(records) => {
                    cache.cache(question.clone(), records);
                    // Read back what the cache stored so all callers share
                    // one allocation.
                    match cache.get(&question) {
                        Some(value) => value,
                        None => Ok(Arc::new(Vec::new())),
                    }
                }
                Err(cause) => {
                    let cause = Arc::new(cause);
                    cache.cache_failure_shared(question.clone(), cause.clone());
                    Err(cause)
                }
            };
            inflight.lock().unwrap().remove(&question);
            value
        });
        fut.shared()
    }

    /// Resolves `host` to socket addresses: A records first, falling back
    /// to AAAA when no IPv4 answer exists.
    pub async fn resolve_host(&self, host: &str) -> Result<Vec<IpAddr>, Error> {
        let v4 = self.resolve(&Question::new(host, RecordType::A)).await;
        match v4 {
            Ok(records) => Ok(records.iter().map(|r| r.addr).collect()),
            Err(v4_err) => {
                match self.resolve(&Question::new(host, RecordType::Aaaa)).await {
                    Ok(records) => Ok(records.iter().map(|r| r.addr).collect()),
                    Err(_) => Err(v4_err),
                }
            }
        }
    }
}

fn unshare(value: CacheValue) -> Result<Arc<Vec<DnsRecord>>, Error> {
    match value {
        Ok(records) => Ok(records),
        Err(shared) => Err(crate::error::SharedSource(shared).as_error()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResolver {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Resolver for CountingResolver {
        fn resolve(
            &self,
            question: &Question,
        ) -> BoxFuture<'static, Result<Vec<DnsRecord>, Error>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail;
            let name = question.name.clone();
            Box::pin(async move {
                // Yield once so concurrent callers pile onto the in-flight
                // lookup instead of racing past it.
                tokio::task::yield_now().await;
                if fail {
                    Err(Error::new(ErrorKind::DnsFailure).with(format!("NXDOMAIN {name}")))
                } else {
                    Ok(vec![DnsRecord {
                        addr: "10.0.0.1".parse().unwrap(),
                        ttl: Duration::from_secs(30),
                    }])
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_share_one_lookup() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = CachingResolver::new(
            DnsCache::new(DnsCacheConfig::default()),
            Arc::new(CountingResolver {
                calls: calls.clone(),
                fail: false,
            }),
            None,
        );

        let question = Question::new("example.com", RecordType::A);
        let (a, b) = tokio::join!(resolver.resolve(&question), resolver.resolve(&question));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Subsequent hits are served from cache.
        resolver.resolve(&question).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn negative_result_is_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = CachingResolver::new(
            DnsCache::new(DnsCacheConfig {
                negative_ttl: Duration::from_secs(3),
                ..Default::default()
            }),
            Arc::new(CountingResolver {
                calls: calls.clone(),
                fail: true,
            }),
            None,
        );

        let question = Question::new("missing.example", RecordType::A);
        assert_eq!(
            resolver.resolve(&question).await.unwrap_err().kind(),
            ErrorKind::DnsFailure
        );
        assert_eq!(
            resolver.resolve(&question).await.unwrap_err().kind(),
            ErrorKind::DnsFailure
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
