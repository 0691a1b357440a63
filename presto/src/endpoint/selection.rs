//! Endpoint selection strategies.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use http::{HeaderMap, Uri};

use super::Endpoint;

/// Picks one endpoint out of a snapshot for a request. `None` means the
/// group was empty (or every member had zero weight); the caller fails the
/// request with `EmptyEndpointGroup` before the transport is touched.
pub trait EndpointSelector: Send + Sync + 'static {
    fn select(&self, endpoints: &[Endpoint], uri: &Uri, headers: &HeaderMap) -> Option<Endpoint>;
}

/// Cycles through members in order, ignoring weights.
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        RoundRobin {
            next: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointSelector for RoundRobin {
    fn select(&self, endpoints: &[Endpoint], _: &Uri, _: &HeaderMap) -> Option<Endpoint> {
        if endpoints.is_empty() {
            return None;
        }
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        Some(endpoints[n % endpoints.len()].clone())
    }
}

/// Round-robin where each member is visited `weight` times per cycle.
pub struct WeightedRoundRobin {
    next: AtomicUsize,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        WeightedRoundRobin {
            next: AtomicUsize::new(0),
        }
    }
}

impl Default for WeightedRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointSelector for WeightedRoundRobin {
    fn select(&self, endpoints: &[Endpoint], _: &Uri, _: &HeaderMap) -> Option<Endpoint> {
        let total: u64 = endpoints.iter().map(|e| u64::from(e.weight())).sum();
        if total == 0 {
            return None;
        }
        let mut slot = (self.next.fetch_add(1, Ordering::Relaxed) as u64) % total;
        for endpoint in endpoints {
            let weight = u64::from(endpoint.weight());
            if slot < weight {
                return Some(endpoint.clone());
            }
            slot -= weight;
        }
        unreachable!("slot < total")
    }
}

/// Maps a request-derived key to a stable member, so equal keys land on the
/// same endpoint as long as the membership does not change.
pub struct Sticky {
    key: Box<dyn Fn(&Uri, &HeaderMap) -> u64 + Send + Sync>,
}

impl Sticky {
    pub fn new(key: impl Fn(&Uri, &HeaderMap) -> u64 + Send + Sync + 'static) -> Self {
        Sticky { key: Box::new(key) }
    }

    /// Sticks on a header value, falling back to the path when absent.
    pub fn on_header(name: http::header::HeaderName) -> Self {
        Sticky::new(move |uri, headers| {
            let mut hasher = DefaultHasher::new();
            match headers.get(&name) {
                Some(value) => value.as_bytes().hash(&mut hasher),
                None => uri.path().hash(&mut hasher),
            }
            hasher.finish()
        })
    }
}

impl EndpointSelector for Sticky {
    fn select(&self, endpoints: &[Endpoint], uri: &Uri, headers: &HeaderMap) -> Option<Endpoint> {
        if endpoints.is_empty() {
            return None;
        }
        let key = (self.key)(uri, headers);
        Some(endpoints[(key % endpoints.len() as u64) as usize].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eps(hosts: &[(&str, u32)]) -> Vec<Endpoint> {
        hosts
            .iter()
            .map(|(h, w)| Endpoint::new(h).unwrap().with_weight(*w))
            .collect()
    }

    fn plain_uri() -> Uri {
        Uri::from_static("/")
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let selector = RoundRobin::new();
        let endpoints = eps(&[("a.example", 1), ("b.example", 1)]);
        let headers = HeaderMap::new();
        let picks: Vec<String> = (0..4)
            .map(|_| {
                selector
                    .select(&endpoints, &plain_uri(), &headers)
                    .unwrap()
                    .host()
                    .to_owned()
            })
            .collect();
        assert_eq!(picks, ["a.example", "b.example", "a.example", "b.example"]);
    }

    #[test]
    fn empty_group_selects_nothing() {
        let selector = RoundRobin::new();
        assert!(selector
            .select(&[], &plain_uri(), &HeaderMap::new())
            .is_none());
    }

    #[test]
    fn weighted_respects_weights() {
        let selector = WeightedRoundRobin::new();
        let endpoints = eps(&[("heavy.example", 3), ("light.example", 1)]);
        let headers = HeaderMap::new();
        let heavy = (0..8)
            .filter(|_| {
                selector
                    .select(&endpoints, &plain_uri(), &headers)
                    .unwrap()
                    .host()
                    == "heavy.example"
            })
            .count();
        assert_eq!(heavy, 6);
    }

    #[test]
    fn zero_total_weight_selects_nothing() {
        let selector = WeightedRoundRobin::new();
        let endpoints = eps(&[("a.example", 0)]);
        assert!(selector
            .select(&endpoints, &plain_uri(), &HeaderMap::new())
            .is_none());
    }

    #[test]
    fn sticky_is_stable_for_equal_keys() {
        let selector = Sticky::on_header(http::header::HeaderName::from_static("x-user"));
        let endpoints = eps(&[("a.example", 1), ("b.example", 1), ("c.example", 1)]);
        let mut headers = HeaderMap::new();
        headers.insert("x-user", "alice".parse().unwrap());
        let first = selector
            .select(&endpoints, &plain_uri(), &headers)
            .unwrap();
        for _ in 0..10 {
            let again = selector
                .select(&endpoints, &plain_uri(), &headers)
                .unwrap();
            assert_eq!(again.host(), first.host());
        }
    }
}
