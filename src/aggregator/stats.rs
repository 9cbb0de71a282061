use hdrhistogram::Histogram;
use serde::Serialize;

/// HdrHistogram precision used for p99 estimation.
const HIST_SIGFIG: u8 = 3;

/// Summary of one metric inside one bucket.
/// Serialized straight into the report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricStats {
    pub cnt: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub p99: f64,
}

impl Default for MetricStats {
    fn default() -> Self {
        Self::empty()
    }
}

impl MetricStats {
    /// All-zero placeholder for a metric with no observations.
    pub fn empty() -> Self {
        Self {
            cnt: 0,
            sum: 0.0,
            min: 0.0,
            max: 0.0,
            p99: 0.0,
        }
    }
}

/// Running totals for one metric.
///
/// Values are recorded in integer units (milliseconds, bytes, documents);
/// the histogram auto-resizes so any `u64` fits.
pub struct MetricAccumulator {
    cnt: u64,
    sum: u64,
    min: u64,
    max: u64,
    hist: Histogram<u64>,
}

impl MetricAccumulator {
    pub fn new() -> Self {
        Self {
            cnt: 0,
            sum: 0,
            min: u64::MAX,
            max: 0,
            hist: Histogram::<u64>::new(HIST_SIGFIG).expect("histogram creation"),
        }
    }

    pub fn record(&mut self, value: u64) {
        self.cnt += 1;
        self.sum = self.sum.saturating_add(value);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        let _ = self.hist.record(value);
    }

    /// Current p99 estimate, in recorded units.
    ///
    /// The histogram answer is clamped to the observed `[min, max]`, so a
    /// single sample reports exactly that sample.
    pub fn p99(&self) -> u64 {
        if self.cnt == 0 {
            return 0;
        }
        self.hist.value_at_quantile(0.99).clamp(self.min, self.max)
    }

    /// Summary with every value divided by `divisor` (e.g. ms → s).
    pub fn stats(&self, divisor: f64) -> MetricStats {
        if self.cnt == 0 {
            return MetricStats::empty();
        }
        MetricStats {
            cnt: self.cnt,
            sum: self.sum as f64 / divisor,
            min: self.min as f64 / divisor,
            max: self.max as f64 / divisor,
            p99: self.p99() as f64 / divisor,
        }
    }
}

impl Default for MetricAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
