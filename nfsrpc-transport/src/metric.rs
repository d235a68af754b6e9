//! Call latency accounting.

use std::time::Duration;

use parking_lot::Mutex;

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    calls: u64,
    latency_us: u64,
}

/// Running average of RPC call latency.
///
/// Count and total are updated together; [`CallMetric::get_and_reset`]
/// reads and clears them in one step, so no sample is lost or counted twice.
#[derive(Debug, Default)]
pub struct CallMetric {
    totals: Mutex<Totals>,
}

impl CallMetric {
    /// Create an empty metric.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed call.
    pub fn add(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        let mut totals = self.totals.lock();
        totals.calls += 1;
        totals.latency_us = totals.latency_us.saturating_add(micros);
    }

    /// Number of calls recorded since the last reset.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.totals.lock().calls
    }

    /// Average latency since the last reset, then start over.
    ///
    /// Returns `None` when no call was recorded in the window.
    pub fn get_and_reset(&self) -> Option<Duration> {
        let totals = std::mem::take(&mut *self.totals.lock());
        (totals.calls > 0).then(|| Duration::from_micros(totals.latency_us / totals.calls))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_average_and_reset() {
        let metric = CallMetric::new();
        metric.add(Duration::from_micros(100));
        metric.add(Duration::from_micros(300));
        assert_eq!(metric.calls(), 2);

        assert_eq!(metric.get_and_reset(), Some(Duration::from_micros(200)));
        assert_eq!(metric.calls(), 0);
        assert_eq!(metric.get_and_reset(), None);
    }

    #[test]
    fn test_empty_window() {
        assert_eq!(CallMetric::new().get_and_reset(), None);
    }

    #[test]
    fn test_concurrent_samples() {
        let metric = Arc::new(CallMetric::new());

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let metric = metric.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metric.add(Duration::from_micros(50));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(metric.calls(), 8000);
        assert_eq!(metric.get_and_reset(), Some(Duration::from_micros(50)));
    }
}
