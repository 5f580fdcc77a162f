//! In-memory latency histograms.
//! Feed collector records batch-write latency; the fetch client records request latency.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

/// One HDR histogram, values in microseconds.
pub struct LatencyStats {
    inner: Mutex<hdrhistogram::Histogram<u64>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LatencySummary {
    pub samples: u64,
    pub p50_us: Option<u64>,
    pub p95_us: Option<u64>,
    pub p99_us: Option<u64>,
    pub max_us: Option<u64>,
}

impl LatencyStats {
    /// Tracks 1us to 10 minutes, 3 significant figures.
    pub fn new() -> Self {
        let histogram = hdrhistogram::Histogram::new_with_bounds(1, 600_000_000, 3)
            .expect("valid histogram bounds");
        Self {
            inner: Mutex::new(histogram),
        }
    }

    pub fn record(&self, d: Duration) {
        let us = d.as_micros().clamp(1, 600_000_000) as u64;
        if let Ok(mut h) = self.inner.lock() {
            let _ = h.record(us);
        }
    }

    pub fn summary(&self) -> LatencySummary {
        let Ok(h) = self.inner.lock() else {
            return LatencySummary::empty();
        };
        if h.len() == 0 {
            return LatencySummary::empty();
        }
        LatencySummary {
            samples: h.len(),
            p50_us: Some(h.value_at_quantile(0.5)),
            p95_us: Some(h.value_at_quantile(0.95)),
            p99_us: Some(h.value_at_quantile(0.99)),
            max_us: Some(h.max()),
        }
    }
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencySummary {
    fn empty() -> Self {
        Self {
            samples: 0,
            p50_us: None,
            p95_us: None,
            p99_us: None,
            max_us: None,
        }
    }
}

/// All histograms the service keeps, shared between writers and the API.
#[derive(Default)]
pub struct Latencies {
    pub feed_write: Arc<LatencyStats>,
    pub fetch: Arc<LatencyStats>,
}

#[derive(Debug, Serialize)]
pub struct LatencyReport {
    pub feed_write: LatencySummary,
    pub fetch: LatencySummary,
}

impl Latencies {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn report(&self) -> LatencyReport {
        LatencyReport {
            feed_write: self.feed_write.summary(),
            fetch: self.fetch.summary(),
        }
    }
}
