use crate::reporter::SeriesKind;
use crate::util;

/// Metric kind.
///
/// Defines the kind, or type, of a recorded point:
/// - counters
/// - gauges
/// - histograms
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    /// Returns the statsd wire type tag for this kind.
    ///
    /// Histogram samples are emitted with the classic `ms` timer unit tag.
    pub fn wire_type(self) -> &'static str {
        match self {
            MetricKind::Counter => "c",
            MetricKind::Gauge => "g",
            MetricKind::Histogram => "ms",
        }
    }
}

/// A single rolled-up value produced by flushing an accumulator.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Rollup {
    pub timestamp: u64,
    pub value: f64,
    pub name: String,
    pub tags: Option<Vec<String>>,
    pub kind: SeriesKind,
}

/// Kind-specific roll-up state for one metric within one bucket.
///
/// An accumulator is created lazily by the first point landing in its bucket,
/// mutated under its own lock while the bucket is open, and drained exactly
/// once when the bucket is finalized.
pub(crate) enum Accumulator {
    Counter(Counter),
    Gauge(Gauge),
    Histogram(Histogram),
}

impl Accumulator {
    pub fn new(kind: MetricKind, sample_size: usize) -> Self {
        match kind {
            MetricKind::Counter => Accumulator::Counter(Counter::new()),
            MetricKind::Gauge => Accumulator::Gauge(Gauge::new()),
            MetricKind::Histogram => Accumulator::Histogram(Histogram::new(sample_size)),
        }
    }

    pub fn add(&mut self, value: f64) {
        match self {
            Accumulator::Counter(counter) => counter.add(value),
            Accumulator::Gauge(gauge) => gauge.add(value),
            Accumulator::Histogram(histogram) => histogram.add(value),
        }
    }

    /// Drains this accumulator into output records for the given bucket.
    pub fn flush_into(
        &mut self,
        timestamp: u64,
        name: &str,
        tags: Option<&[String]>,
        percentiles: &[f64],
        out: &mut Vec<Rollup>,
    ) {
        match self {
            Accumulator::Counter(counter) => counter.flush_into(timestamp, name, tags, out),
            Accumulator::Gauge(gauge) => gauge.flush_into(timestamp, name, tags, out),
            Accumulator::Histogram(histogram) => {
                histogram.flush_into(timestamp, name, tags, percentiles, out);
            }
        }
    }
}

fn rollup(
    timestamp: u64,
    value: f64,
    name: String,
    tags: Option<&[String]>,
    kind: SeriesKind,
) -> Rollup {
    Rollup { timestamp, value, name, tags: tags.map(<[String]>::to_vec), kind }
}

/// Last-write-wins gauge.
pub(crate) struct Gauge {
    last: f64,
}

impl Gauge {
    fn new() -> Self {
        Gauge { last: 0.0 }
    }

    fn add(&mut self, value: f64) {
        self.last = value;
    }

    fn flush_into(&mut self, timestamp: u64, name: &str, tags: Option<&[String]>, out: &mut Vec<Rollup>) {
        out.push(rollup(timestamp, self.last, name.to_owned(), tags, SeriesKind::Gauge));
    }
}

/// Running-sum counter.
pub(crate) struct Counter {
    total: f64,
}

impl Counter {
    fn new() -> Self {
        Counter { total: 0.0 }
    }

    fn add(&mut self, value: f64) {
        self.total += value;
    }

    fn flush_into(&mut self, timestamp: u64, name: &str, tags: Option<&[String]>, out: &mut Vec<Rollup>) {
        out.push(rollup(timestamp, self.total, name.to_owned(), tags, SeriesKind::Counter));
    }
}

/// Distribution statistics plus a bounded reservoir for percentile estimates.
pub(crate) struct Histogram {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    samples: ReservoirSample,
}

impl Histogram {
    fn new(sample_size: usize) -> Self {
        Histogram {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            samples: ReservoirSample::new(sample_size),
        }
    }

    fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.samples.push(value);
    }

    fn flush_into(
        &mut self,
        timestamp: u64,
        name: &str,
        tags: Option<&[String]>,
        percentiles: &[f64],
        out: &mut Vec<Rollup>,
    ) {
        // The aggregator only ever flushes accumulators that have seen at
        // least one point.
        debug_assert!(self.count > 0, "flushed an empty histogram: {name}");

        let avg = self.sum / self.count as f64;
        out.push(rollup(timestamp, self.min, format!("{name}.min"), tags, SeriesKind::Gauge));
        out.push(rollup(timestamp, self.max, format!("{name}.max"), tags, SeriesKind::Gauge));
        out.push(rollup(timestamp, avg, format!("{name}.avg"), tags, SeriesKind::Gauge));
        out.push(rollup(
            timestamp,
            self.count as f64,
            format!("{name}.count"),
            tags,
            SeriesKind::Gauge,
        ));

        let mut samples = self.samples.take();
        samples.sort_unstable_by(f64::total_cmp);
        for &p in percentiles {
            let value = samples[nearest_rank(p, samples.len())];
            let label = (p * 100.0).round() as u32;
            out.push(rollup(
                timestamp,
                value,
                format!("{name}.{label}percentile"),
                tags,
                SeriesKind::Gauge,
            ));
        }
    }
}

/// Index of the nearest-rank percentile `p` within `len` sorted samples.
fn nearest_rank(p: f64, len: usize) -> usize {
    let index = (p * len as f64 - 1.0).round().max(0.0) as usize;
    index.min(len - 1)
}

/// A bounded, uniformly-representative sample of an arbitrarily long stream
/// of values, per Vitter's "Algorithm R".
pub(crate) struct ReservoirSample {
    values: Vec<f64>,
    capacity: usize,
    seen: usize,
}

impl ReservoirSample {
    fn new(capacity: usize) -> Self {
        ReservoirSample { values: Vec::new(), capacity, seen: 0 }
    }

    fn push(&mut self, value: f64) {
        let idx = self.seen;
        self.seen += 1;
        if self.values.len() < self.capacity {
            self.values.push(value);
        } else {
            let maybe_idx = util::random_index(idx);
            if maybe_idx < self.capacity {
                self.values[maybe_idx] = value;
            }
        }
    }

    fn take(&mut self) -> Vec<f64> {
        self.seen = 0;
        std::mem::take(&mut self.values)
    }
}

#[cfg(test)]
mod tests {
    use super::{nearest_rank, Accumulator, MetricKind, ReservoirSample, Rollup};
    use crate::reporter::SeriesKind;

    fn flush(acc: &mut Accumulator, timestamp: u64, name: &str) -> Vec<Rollup> {
        let mut out = Vec::new();
        acc.flush_into(timestamp, name, None, &[0.75, 0.85, 0.95, 0.99], &mut out);
        out
    }

    #[test]
    fn gauge_last_write_wins() {
        let mut acc = Accumulator::new(MetricKind::Gauge, 1000);
        acc.add(20.0);
        acc.add(22.0);

        let records = flush(&mut acc, 100, "test.gauge.1");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp, 100);
        assert_eq!(records[0].value, 22.0);
        assert_eq!(records[0].name, "test.gauge.1");
        assert_eq!(records[0].kind, SeriesKind::Gauge);
    }

    #[test]
    fn counter_sums_increments() {
        let mut acc = Accumulator::new(MetricKind::Counter, 1000);
        acc.add(1.0);
        acc.add(2.0);
        acc.add(1.0);

        let records = flush(&mut acc, 1000, "test.counter");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, 4.0);
        assert_eq!(records[0].kind, SeriesKind::Counter);
    }

    #[test]
    fn histogram_basic_stats() {
        let mut acc = Accumulator::new(MetricKind::Histogram, 1000);
        for value in [10.0, 15.0, 20.0] {
            acc.add(value);
        }

        let records = flush(&mut acc, 100, "test.hist");
        let value_of = |suffix: &str| {
            records
                .iter()
                .find(|r| r.name == format!("test.hist.{suffix}"))
                .unwrap_or_else(|| panic!("missing record for {suffix}"))
                .value
        };

        assert_eq!(records.len(), 8);
        assert_eq!(value_of("count"), 3.0);
        assert_eq!(value_of("avg"), 15.0);
        assert_eq!(value_of("min"), 10.0);
        assert_eq!(value_of("max"), 20.0);
    }

    #[test]
    fn histogram_percentiles_within_tolerance() {
        let mut acc = Accumulator::new(MetricKind::Histogram, 1000);
        for _ in 0..20 {
            for i in 0..100 {
                acc.add(f64::from(i));
            }
        }

        let records = flush(&mut acc, 0, "perf");
        for p in [75, 85, 95, 99] {
            let estimate = records
                .iter()
                .find(|r| r.name == format!("perf.{p}percentile"))
                .expect("missing percentile record")
                .value;
            assert!(
                (estimate - f64::from(p)).abs() <= 5.0,
                "p{p} estimate {estimate} out of tolerance"
            );
        }
    }

    #[test]
    fn nearest_rank_clamps_to_bounds() {
        assert_eq!(nearest_rank(0.99, 1), 0);
        assert_eq!(nearest_rank(0.01, 100), 0);
        assert_eq!(nearest_rank(0.75, 4), 2);
        assert_eq!(nearest_rank(0.99, 100), 98);
    }

    #[test]
    fn reservoir_is_bounded() {
        let mut reservoir = ReservoirSample::new(100);
        for i in 0..5000 {
            reservoir.push(f64::from(i));
        }

        let values = reservoir.take();
        assert_eq!(values.len(), 100);
    }

    #[test]
    fn reservoir_keeps_everything_under_capacity() {
        let mut reservoir = ReservoirSample::new(100);
        for i in 0..50 {
            reservoir.push(f64::from(i));
        }

        let values = reservoir.take();
        assert_eq!(values.len(), 50);
    }
}
