//! Latency measurement utilities.
//!
//! Reservation and commit paths are I/O bound (cache + database round trips),
//! so samples are recorded in microseconds rather than nanoseconds.

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use std::time::Instant;

/// Upper bound of a recordable sample: 10 minutes.
const MAX_TRACKED_MICROS: u64 = 600_000_000;

/// Latency histogram backed by HDR histogram.
#[derive(Debug)]
pub struct LatencyHistogram {
    hist: Mutex<Histogram<u64>>,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        let hist = Histogram::new_with_bounds(1, MAX_TRACKED_MICROS, 3)
            .unwrap_or_else(|_| Histogram::new(3).expect("hdr histogram"));
        Self {
            hist: Mutex::new(hist),
        }
    }

    /// Record a sample in microseconds.
    pub fn record_micros(&self, micros: u64) {
        let value = micros.clamp(1, MAX_TRACKED_MICROS);
        let _ = self.hist.lock().record(value);
    }

    /// Record the time elapsed since `started`.
    pub fn record_since(&self, started: Instant) {
        self.record_micros(started.elapsed().as_micros() as u64);
    }

    pub fn snapshot(&self) -> LatencyStats {
        let hist = self.hist.lock();
        if hist.is_empty() {
            return LatencyStats::default();
        }
        LatencyStats {
            count: hist.len(),
            max_micros: hist.max(),
            mean_micros: hist.mean().round() as u64,
            p50_micros: hist.value_at_quantile(0.50),
            p95_micros: hist.value_at_quantile(0.95),
            p99_micros: hist.value_at_quantile(0.99),
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LatencyStats {
    pub count: u64,
    pub max_micros: u64,
    pub mean_micros: u64,
    pub p50_micros: u64,
    pub p95_micros: u64,
    pub p99_micros: u64,
}

impl LatencyStats {
    /// Render as Prometheus summary-style gauges under `name`.
    pub fn prometheus(&self, name: &str) -> String {
        format!(
            "{name}_count {}\n\
             {name}_us{{quantile=\"0.5\"}} {}\n\
             {name}_us{{quantile=\"0.95\"}} {}\n\
             {name}_us{{quantile=\"0.99\"}} {}\n\
             {name}_us_max {}\n",
            self.count, self.p50_micros, self.p95_micros, self.p99_micros, self.max_micros,
        )
    }
}
