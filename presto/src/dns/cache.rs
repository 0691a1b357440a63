//! TTL-bounded DNS cache with eviction listeners.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::Error;

/// A cache lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Question {
    /// Lowercased ASCII name; a trailing dot is preserved and significant.
    pub name: String,
    pub record_type: RecordType,
}

impl Question {
    pub fn new(name: impl Into<String>, record_type: RecordType) -> Self {
        Question {
            name: name.into().to_ascii_lowercase(),
            record_type,
        }
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.name, self.record_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Aaaa,
}

/// One resolved address with the TTL the authority returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsRecord {
    pub addr: IpAddr,
    pub ttl: Duration,
}

/// What a cache entry holds: records, or the failure that produced a
/// negative entry. Errors are shared so that repeated hits observe the
/// same cause object.
pub type CacheValue = Result<Arc<Vec<DnsRecord>>, Arc<Error>>;

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    Expired,
    Removed,
    Replaced,
}

type RemovalListener = Arc<dyn Fn(&Question, &CacheValue, RemovalCause) + Send + Sync>;

/// Cache tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsCacheConfig {
    /// Lower clamp for positive TTLs.
    pub min_ttl: Duration,
    /// Upper clamp for positive TTLs.
    pub max_ttl: Duration,
    /// TTL applied to negative entries (NXDOMAIN and friends).
    pub negative_ttl: Duration,
}

impl Default for DnsCacheConfig {
    fn default() -> Self {
        DnsCacheConfig {
            min_ttl: Duration::from_secs(1),
            max_ttl: Duration::from_secs(3600),
            negative_ttl: Duration::from_secs(10),
        }
    }
}

/// Thread-safe DNS cache with active TTL expiry.
///
/// Each eviction, whether by TTL, explicit removal or overwrite, invokes
/// every registered listener exactly once. Listeners run on the sweeper
/// task and must be cheap.
#[derive(Clone)]
pub struct DnsCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    config: DnsCacheConfig,
    entries: Mutex<HashMap<Question, Entry>>,
    listeners: Mutex<Vec<RemovalListener>>,
    changed: Arc<Notify>,
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        // Wake the sweeper so it observes the dead weak handle and exits.
        self.changed.notify_one();
    }
}

struct Entry {
    value: CacheValue,
    expire_at: Instant,
}

impl DnsCache {
    /// Creates the cache and spawns its expiry sweeper. Must be called
    /// within a tokio runtime.
    pub fn new(config: DnsCacheConfig) -> Self {
        let inner = Arc::new(CacheInner {
            config,
            entries: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            changed: Arc::new(Notify::new()),
        });
        tokio::spawn(sweep(Arc::downgrade(&inner)));
        DnsCache { inner }
    }

    /// The cached value for `question`, or `None` on a miss. Entries past
    /// their deadline are treated as absent (the sweeper fires the
    /// listener).
    pub fn get(&self, question: &Question) -> Option<CacheValue> {
        let entries = self.inner.entries.lock().unwrap();
        let entry = entries.get(question)?;
        if entry.expire_at <= Instant::now() {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Caches records for `question`, clamping the answer TTL into
    /// `[min_ttl, max_ttl]`. An existing entry is replaced and its
    /// listeners fired with [`RemovalCause::Replaced`].
    pub fn cache(&self, question: Question, records: Vec<DnsRecord>) {
        let answer_ttl = records
            .iter()
            .map(|r| r.ttl)
            .min()
            .unwrap_or(self.inner.config.min_ttl);
        let ttl = answer_ttl.clamp(self.inner.config.min_ttl, self.inner.config.max_ttl);
        self.insert(question, Ok(Arc::new(records)), ttl);
    }

    /// Caches a resolution failure for `negative_ttl`.
    pub fn cache_failure(&self, question: Question, cause: Error) {
        self.cache_failure_shared(question, Arc::new(cause));
    }

    pub(crate) fn cache_failure_shared(&self, question: Question, cause: Arc<Error>) {
        let ttl = self.inner.config.negative_ttl;
        self.insert(question, Err(cause), ttl);
    }

    fn insert(&self, question: Question, value: CacheValue, ttl: Duration) {
        let entry = Entry {
            value,
            expire_at: Instant::now() + ttl,
        };
        let replaced = self
            .inner
            .entries
            .lock()
            .unwrap()
            .insert(question.clone(), entry);
        if let Some(old) = replaced {
            self.inner.notify(&question, &old.value, RemovalCause::Replaced);
        }
        self.inner.changed.notify_one();
    }

    /// Drops `question` from the cache, firing listeners if it was present.
    pub fn remove(&self, question: &Question) {
        let removed = self.inner.entries.lock().unwrap().remove(question);
        if let Some(entry) = removed {
            self.inner.notify(question, &entry.value, RemovalCause::Removed);
        }
    }

    /// Drops every entry, firing listeners for each.
    pub fn remove_all(&self) {
        let drained: Vec<(Question, Entry)> =
            self.inner.entries.lock().unwrap().drain().collect();
        for (question, entry) in &drained {
            self.inner.notify(question, &entry.value, RemovalCause::Removed);
        }
    }

    /// Registers an eviction listener. Listeners must be cheap; they run
    /// inline with cache mutation or on the sweeper task.
    pub fn add_listener(
        &self,
        listener: impl Fn(&Question, &CacheValue, RemovalCause) + Send + Sync + 'static,
    ) {
        self.inner.listeners.lock().unwrap().push(Arc::new(listener));
    }

    pub fn config(&self) -> &DnsCacheConfig {
        &self.inner.config
    }
}

impl CacheInner {
    fn notify(&self, question: &Question, value: &CacheValue, cause: RemovalCause) {
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener(question, value, cause);
        }
    }
}

async fn sweep(inner: Weak<CacheInner>) {
    loop {
        let Some(cache) = inner.upgrade() else { return };

        let now = Instant::now();
        let mut due = Vec::new();
        let next_deadline = {
            let mut entries = cache.entries.lock().unwrap();
            let expired: Vec<Question> = entries
                .iter()
                .filter(|(_, e)| e.expire_at <= now)
                .map(|(q, _)| q.clone())
                .collect();
            for question in expired {
                if let Some(entry) = entries.remove(&question) {
                    due.push((question, entry));
                }
            }
            entries.values().map(|e| e.expire_at).min()
        };
        for (question, entry) in &due {
            cache.notify(question, &entry.value, RemovalCause::Expired);
        }

        // Park without holding the cache alive: keep only the Notify handle
        // so dropping the last user-facing handle frees the entries.
        let changed = cache.changed.clone();
        drop(cache);
        match next_deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = changed.notified() => {}
                }
            }
            None => changed.notified().await,
        }
    }
}
