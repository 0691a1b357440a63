//! Connection outlier detection.
//!
//! An [`OutlierRule`] classifies each completed attempt on a session; the
//! per-session detector accumulates the classifications in a sliding
//! window. A session whose recent failure rate crosses the configured
//! threshold is marked non-acquirable on the next update interval; a
//! `Fatal` classification marks it immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;

use crate::error::Error;
use crate::metrics::SlidingWindowCounter;

/// Classification of one completed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutlierDecision {
    Success,
    Failure,
    /// Marks the session non-acquirable immediately, regardless of
    /// thresholds.
    Fatal,
    Ignore,
}

/// Maps an attempt's outcome to an [`OutlierDecision`].
pub trait OutlierRule: Send + Sync + 'static {
    fn decide(&self, status: Option<StatusCode>, cause: Option<&Error>) -> OutlierDecision;
}

impl<F> OutlierRule for F
where
    F: Fn(Option<StatusCode>, Option<&Error>) -> OutlierDecision + Send + Sync + 'static,
{
    fn decide(&self, status: Option<StatusCode>, cause: Option<&Error>) -> OutlierDecision {
        self(status, cause)
    }
}

/// Pool-level outlier detection policy.
#[derive(Clone)]
pub struct OutlierDetection {
    pub rule: Arc<dyn OutlierRule>,
    pub minimum_request_threshold: u64,
    pub failure_rate_threshold: f64,
    pub counter_window: Duration,
    pub counter_bucket: Duration,
    pub update_interval: Duration,
}

impl OutlierDetection {
    pub fn new(rule: Arc<dyn OutlierRule>) -> Self {
        OutlierDetection {
            rule,
            minimum_request_threshold: 10,
            failure_rate_threshold: 0.5,
            counter_window: Duration::from_secs(20),
            counter_bucket: Duration::from_secs(2),
            update_interval: Duration::from_secs(1),
        }
    }

    pub fn minimum_request_threshold(mut self, threshold: u64) -> Self {
        self.minimum_request_threshold = threshold;
        self
    }

    pub fn failure_rate_threshold(mut self, threshold: f64) -> Self {
        self.failure_rate_threshold = threshold;
        self
    }

    pub fn update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub(crate) fn detector(&self) -> Arc<OutlierDetector> {
        Arc::new(OutlierDetector {
            policy: self.clone(),
            counter: SlidingWindowCounter::new(self.counter_window, self.counter_bucket),
            fatal: AtomicBool::new(false),
        })
    }
}

/// Per-session accumulator.
pub(crate) struct OutlierDetector {
    policy: OutlierDetection,
    counter: SlidingWindowCounter,
    fatal: AtomicBool,
}

impl OutlierDetector {
    /// Classifies and records one outcome. Returns the decision so the
    /// caller can act on `Fatal` immediately.
    pub(crate) fn record(
        &self,
        status: Option<StatusCode>,
        cause: Option<&Error>,
    ) -> OutlierDecision {
        let decision = self.policy.rule.decide(status, cause);
        match decision {
            OutlierDecision::Success => self.counter.record_success(),
            OutlierDecision::Failure => self.counter.record_failure(),
            OutlierDecision::Fatal => self.fatal.store(true, Ordering::Release),
            OutlierDecision::Ignore => {}
        }
        decision
    }

    /// Whether the session has crossed the failure threshold (checked on
    /// the update interval) or took a fatal decision.
    pub(crate) fn exceeded(&self) -> bool {
        if self.fatal.load(Ordering::Acquire) {
            return true;
        }
        let counts = self.counter.snapshot();
        counts.total() >= self.policy.minimum_request_threshold
            && counts.failure_rate() >= self.policy.failure_rate_threshold
    }

    pub(crate) fn update_interval(&self) -> Duration {
        self.policy.update_interval
    }
}

/// Classifies server errors and transport failures as outliers.
pub fn default_rule() -> Arc<dyn OutlierRule> {
    Arc::new(
        |status: Option<StatusCode>, cause: Option<&Error>| match (status, cause) {
            (_, Some(_)) => OutlierDecision::Failure,
            (Some(status), None) if status.is_server_error() => OutlierDecision::Failure,
            (Some(_), None) => OutlierDecision::Success,
            (None, None) => OutlierDecision::Ignore,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test(start_paused = true)]
    async fn threshold_requires_minimum_requests() {
        let detection = OutlierDetection::new(default_rule())
            .minimum_request_threshold(3)
            .failure_rate_threshold(0.5);
        let detector = detection.detector();

        detector.record(Some(StatusCode::SERVICE_UNAVAILABLE), None);
        detector.record(Some(StatusCode::SERVICE_UNAVAILABLE), None);
        assert!(!detector.exceeded());

        detector.record(Some(StatusCode::SERVICE_UNAVAILABLE), None);
        assert!(detector.exceeded());
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_trips_without_threshold() {
        let rule: Arc<dyn OutlierRule> =
            Arc::new(|_: Option<StatusCode>, _: Option<&Error>| OutlierDecision::Fatal);
        let detector = OutlierDetection::new(rule)
            .minimum_request_threshold(100)
            .detector();
        assert_eq!(detector.record(None, None), OutlierDecision::Fatal);
        assert!(detector.exceeded());
    }

    #[tokio::test(start_paused = true)]
    async fn successes_keep_the_session_healthy() {
        let detector = OutlierDetection::new(default_rule())
            .minimum_request_threshold(2)
            .failure_rate_threshold(0.9)
            .detector();
        for _ in 0..10 {
            detector.record(Some(StatusCode::OK), None);
        }
        detector.record(
            None,
            Some(&Error::new(ErrorKind::ClosedStream)),
        );
        assert!(!detector.exceeded());
    }
}
