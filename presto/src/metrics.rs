//! Time-bucketed accounting.
//!
//! [`SlidingWindowCounter`] backs both the circuit breaker and per-session
//! outlier detection. The certificate gauges are the only direct metrics
//! emission in the crate; everything else surfaces through request logs and
//! event listeners.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// A success/failure tally over the live window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counts {
    pub success: u64,
    pub failure: u64,
}

impl Counts {
    pub fn total(&self) -> u64 {
        self.success + self.failure
    }

    /// Failures over total, `0.0` when nothing was recorded.
    pub fn failure_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.failure as f64 / total as f64
        }
    }
}

/// Thread-safe accumulator of success/failure counts bucketised by time.
///
/// A snapshot sums the buckets intersecting `[now - window, now]`; buckets
/// that have slid out are reused lazily. Writes stamped before the earliest
/// live bucket are discarded.
pub struct SlidingWindowCounter {
    window: Duration,
    bucket_size: Duration,
    origin: Instant,
    slots: Mutex<Vec<Slot>>,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    start: Instant,
    success: u64,
    failure: u64,
}

impl SlidingWindowCounter {
    /// `bucket_size` must divide into a non-zero number of buckets per
    /// window; it is clamped to `window` otherwise.
    pub fn new(window: Duration, bucket_size: Duration) -> Self {
        let bucket_size = bucket_size.min(window).max(Duration::from_millis(1));
        let origin = Instant::now();
        let n = (window.as_nanos() / bucket_size.as_nanos()) as usize + 1;
        SlidingWindowCounter {
            window,
            bucket_size,
            origin,
            slots: Mutex::new(vec![
                Slot {
                    start: origin,
                    success: 0,
                    failure: 0,
                };
                n
            ]),
        }
    }

    pub fn record_success(&self) {
        self.record_at(Instant::now(), true);
    }

    pub fn record_failure(&self) {
        self.record_at(Instant::now(), false);
    }

    /// Records an event stamped at `t`. Events older than the live window
    /// are dropped without effect.
    pub fn record_at(&self, t: Instant, success: bool) {
        let now = Instant::now();
        if now.saturating_duration_since(t) > self.window {
            return;
        }
        let aligned = self.align(t);
        let mut slots = self.slots.lock().unwrap();
        let index = self.index_of(aligned, slots.len());
        let slot = &mut slots[index];
        if slot.start > aligned {
            // The ring already reused this slot for a newer bucket.
            return;
        }
        if slot.start < aligned {
            *slot = Slot {
                start: aligned,
                success: 0,
                failure: 0,
            };
        }
        if success {
            slot.success += 1;
        } else {
            slot.failure += 1;
        }
    }

    /// The tally over `[now - window, now]`.
    pub fn snapshot(&self) -> Counts {
        let now = Instant::now();
        let slots = self.slots.lock().unwrap();
        let mut counts = Counts::default();
        for slot in slots.iter() {
            let live = slot.start + self.bucket_size > now.checked_sub(self.window).unwrap_or(self.origin)
                && slot.start <= now;
            if live {
                counts.success += slot.success;
                counts.failure += slot.failure;
            }
        }
        counts
    }

    /// Clears every bucket, e.g. when a circuit breaker re-closes.
    pub fn reset(&self) {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            slot.success = 0;
            slot.failure = 0;
        }
    }

    fn align(&self, t: Instant) -> Instant {
        let since = t.saturating_duration_since(self.origin);
        let buckets = since.as_nanos() / self.bucket_size.as_nanos();
        self.origin + mul(self.bucket_size, buckets)
    }

    fn index_of(&self, aligned: Instant, n: usize) -> usize {
        let since = aligned.saturating_duration_since(self.origin);
        ((since.as_nanos() / self.bucket_size.as_nanos()) % n as u128) as usize
    }
}

fn mul(d: Duration, times: u128) -> Duration {
    Duration::from_nanos((d.as_nanos() * times) as u64)
}

/// Records `tls.certificate.validity` and `tls.certificate.validity.days`
/// for the peer certificate presented under `hostname`. An expired (or
/// not-yet-valid) certificate reports `(0, -1)`.
pub(crate) fn record_certificate(
    hostname: &str,
    connection: &tokio_rustls::rustls::ClientConnection,
) {
    let Some(certs) = connection.peer_certificates() else {
        return;
    };
    let Some(end_entity) = certs.first() else {
        return;
    };
    let Ok((_, cert)) = x509_parser::parse_x509_certificate(end_entity.as_ref()) else {
        return;
    };

    let validity = cert.validity();
    let valid = validity.is_valid();
    let days = if valid {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        (validity.not_after.timestamp() - now) / 86_400
    } else {
        -1
    };

    metrics::gauge!("tls.certificate.validity", "hostname" => hostname.to_owned())
        .set(if valid { 1.0 } else { 0.0 });
    metrics::gauge!("tls.certificate.validity.days", "hostname" => hostname.to_owned())
        .set(days as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn counts_equal_the_sum_in_the_live_window() {
        let counter = SlidingWindowCounter::new(Duration::from_secs(10), Duration::from_secs(1));
        counter.record_success();
        counter.record_failure();
        tokio::time::advance(Duration::from_secs(3)).await;
        counter.record_success();

        let counts = counter.snapshot();
        assert_eq!(
            counts,
            Counts {
                success: 2,
                failure: 1
            }
        );
        assert!((counts.failure_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn old_buckets_slide_out() {
        let counter = SlidingWindowCounter::new(Duration::from_secs(5), Duration::from_secs(1));
        counter.record_failure();
        tokio::time::advance(Duration::from_secs(7)).await;
        counter.record_success();
        assert_eq!(
            counter.snapshot(),
            Counts {
                success: 1,
                failure: 0
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn late_writes_are_discarded() {
        let counter = SlidingWindowCounter::new(Duration::from_secs(5), Duration::from_secs(1));
        let stale = Instant::now();
        tokio::time::advance(Duration::from_secs(8)).await;
        counter.record_at(stale, true);
        assert_eq!(counter.snapshot(), Counts::default());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_counter_reports_zero_rate() {
        let counter = SlidingWindowCounter::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(counter.snapshot().failure_rate(), 0.0);
    }
}
