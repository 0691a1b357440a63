//! Endpoint groups: dynamically updated, composable sets of [`Endpoint`]s.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;

use super::Endpoint;

/// Snapshot of a group's members. Groups memoise snapshots: two calls with
/// no intervening change return the same `Arc`.
pub type EndpointSnapshot = Arc<Vec<Endpoint>>;

/// A dynamically updated ordered set of endpoints.
pub trait EndpointGroup: Send + Sync + 'static {
    /// The current membership snapshot.
    fn endpoints(&self) -> EndpointSnapshot;
}

/// A fixed membership group.
pub struct StaticEndpointGroup {
    endpoints: EndpointSnapshot,
}

impl StaticEndpointGroup {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        StaticEndpointGroup {
            endpoints: Arc::new(endpoints),
        }
    }

    pub fn of(endpoint: Endpoint) -> Self {
        Self::new(vec![endpoint])
    }
}

impl EndpointGroup for StaticEndpointGroup {
    fn endpoints(&self) -> EndpointSnapshot {
        self.endpoints.clone()
    }
}

/// A group whose membership is replaced wholesale by a discovery source.
pub struct DynamicEndpointGroup {
    current: ArcSwap<Vec<Endpoint>>,
}

impl DynamicEndpointGroup {
    pub fn new() -> Self {
        DynamicEndpointGroup {
            current: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Replaces the membership. Readers observe the new snapshot on their
    /// next `endpoints()` call.
    pub fn set_endpoints(&self, endpoints: Vec<Endpoint>) {
        self.current.store(Arc::new(endpoints));
    }
}

impl Default for DynamicEndpointGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointGroup for DynamicEndpointGroup {
    fn endpoints(&self) -> EndpointSnapshot {
        self.current.load_full()
    }
}

/// The union of child groups, in child order. The combined snapshot is
/// memoised against the child snapshots that produced it.
pub struct CompositeEndpointGroup {
    children: Vec<Arc<dyn EndpointGroup>>,
    memo: Mutex<Option<CompositeMemo>>,
}

struct CompositeMemo {
    inputs: Vec<EndpointSnapshot>,
    combined: EndpointSnapshot,
}

impl CompositeEndpointGroup {
    pub fn new(children: Vec<Arc<dyn EndpointGroup>>) -> Self {
        CompositeEndpointGroup {
            children,
            memo: Mutex::new(None),
        }
    }
}

impl EndpointGroup for CompositeEndpointGroup {
    fn endpoints(&self) -> EndpointSnapshot {
        let inputs: Vec<EndpointSnapshot> =
            self.children.iter().map(|c| c.endpoints()).collect();

        let mut memo = self.memo.lock().unwrap();
        if let Some(m) = memo.as_ref() {
            let unchanged = m.inputs.len() == inputs.len()
                && m.inputs
                    .iter()
                    .zip(&inputs)
                    .all(|(a, b)| Arc::ptr_eq(a, b));
            if unchanged {
                return m.combined.clone();
            }
        }

        let combined: EndpointSnapshot =
            Arc::new(inputs.iter().flat_map(|s| s.iter().cloned()).collect());
        *memo = Some(CompositeMemo {
            inputs,
            combined: combined.clone(),
        });
        combined
    }
}

/// Health verdicts come from an external prober; the core only consumes
/// them.
pub trait HealthChecker: Send + Sync + 'static {
    fn is_healthy(&self, endpoint: &Endpoint) -> bool;
}

impl<F> HealthChecker for F
where
    F: Fn(&Endpoint) -> bool + Send + Sync + 'static,
{
    fn is_healthy(&self, endpoint: &Endpoint) -> bool {
        self(endpoint)
    }
}

/// Narrows a delegate group to its currently healthy members. Duplicates in
/// the delegate are preserved in the narrowed snapshot.
pub struct HealthCheckedEndpointGroup {
    delegate: Arc<dyn EndpointGroup>,
    checker: Arc<dyn HealthChecker>,
    memo: Mutex<Option<EndpointSnapshot>>,
}

impl HealthCheckedEndpointGroup {
    pub fn new(delegate: Arc<dyn EndpointGroup>, checker: Arc<dyn HealthChecker>) -> Self {
        HealthCheckedEndpointGroup {
            delegate,
            checker,
            memo: Mutex::new(None),
        }
    }
}

impl EndpointGroup for HealthCheckedEndpointGroup {
    fn endpoints(&self) -> EndpointSnapshot {
        let healthy: Vec<Endpoint> = self
            .delegate
            .endpoints()
            .iter()
            .filter(|e| self.checker.is_healthy(e))
            .cloned()
            .collect();

        let mut memo = self.memo.lock().unwrap();
        if let Some(last) = memo.as_ref() {
            if **last == healthy {
                return last.clone();
            }
        }
        let snapshot: EndpointSnapshot = Arc::new(healthy);
        *memo = Some(snapshot.clone());
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(host: &str) -> Endpoint {
        Endpoint::new(host).unwrap()
    }

    #[test]
    fn static_group_returns_same_snapshot() {
        let group = StaticEndpointGroup::new(vec![ep("a.example"), ep("b.example")]);
        let first = group.endpoints();
        let second = group.endpoints();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn dynamic_group_swaps_snapshots() {
        let group = DynamicEndpointGroup::new();
        let empty = group.endpoints();
        group.set_endpoints(vec![ep("a.example")]);
        let updated = group.endpoints();
        assert!(!Arc::ptr_eq(&empty, &updated));
        assert_eq!(updated.len(), 1);
        assert!(Arc::ptr_eq(&updated, &group.endpoints()));
    }

    #[test]
    fn composite_unions_children_and_memoises() {
        let left = Arc::new(DynamicEndpointGroup::new());
        left.set_endpoints(vec![ep("a.example")]);
        let right = Arc::new(DynamicEndpointGroup::new());
        right.set_endpoints(vec![ep("b.example"), ep("c.example")]);

        let composite = CompositeEndpointGroup::new(vec![left.clone(), right]);
        let first = composite.endpoints();
        assert_eq!(
            first.iter().map(Endpoint::host).collect::<Vec<_>>(),
            vec!["a.example", "b.example", "c.example"]
        );
        assert!(Arc::ptr_eq(&first, &composite.endpoints()));

        left.set_endpoints(vec![ep("a2.example")]);
        let second = composite.endpoints();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second[0].host(), "a2.example");
    }

    #[test]
    fn health_checked_group_preserves_duplicates() {
        let triple = StaticEndpointGroup::new(vec![ep("dup.example"); 3]);
        let group =
            HealthCheckedEndpointGroup::new(Arc::new(triple), Arc::new(|_: &Endpoint| true));
        assert_eq!(group.endpoints().len(), 3);
    }

    #[test]
    fn health_checked_group_filters_unhealthy() {
        let inner = StaticEndpointGroup::new(vec![ep("up.example"), ep("down.example")]);
        let group = HealthCheckedEndpointGroup::new(
            Arc::new(inner),
            Arc::new(|e: &Endpoint| e.host() != "down.example"),
        );
        let snapshot = group.endpoints();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].host(), "up.example");
        assert!(Arc::ptr_eq(&snapshot, &group.endpoints()));
    }
}
