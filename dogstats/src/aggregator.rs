use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::metric::{Accumulator, MetricKind, Rollup};

/// Identity of one logical metric: a name plus a canonicalized tag set.
///
/// Tags are sorted so that the same set in any order maps to the same series.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct MetricKey {
    name: String,
    tags: Option<Vec<String>>,
}

impl MetricKey {
    fn new(name: &str, tags: &[&str]) -> Self {
        let tags = if tags.is_empty() {
            None
        } else {
            let mut tags: Vec<String> = tags.iter().map(|tag| (*tag).to_owned()).collect();
            tags.sort_unstable();
            Some(tags)
        };

        MetricKey { name: name.to_owned(), tags }
    }
}

type Bucket = HashMap<MetricKey, Arc<Mutex<Accumulator>>>;

/// Routes incoming points into per-bucket accumulators and finalizes buckets
/// once they have fully elapsed.
///
/// The bucket index lock is held only long enough to locate or insert an
/// accumulator handle; all mutation happens under the accumulator's own lock,
/// so unrelated metrics never contend with each other.
pub(crate) struct MetricsAggregator {
    roll_up_interval: u64,
    sample_size: usize,
    percentiles: Vec<f64>,
    buckets: Mutex<HashMap<u64, Bucket>>,
}

impl MetricsAggregator {
    pub fn new(roll_up_interval: u64, sample_size: usize, percentiles: Vec<f64>) -> Self {
        MetricsAggregator {
            roll_up_interval,
            sample_size,
            percentiles,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the aligned start of the bucket the given timestamp falls in.
    fn bucket_start(&self, timestamp: f64) -> u64 {
        (timestamp / self.roll_up_interval as f64).floor() as u64 * self.roll_up_interval
    }

    /// Adds one point to the accumulator for `(name, tags)` within the bucket
    /// its timestamp falls in, creating the accumulator on first use.
    ///
    /// A point whose kind disagrees with the existing accumulator for the
    /// same key is folded into that accumulator: the first kind seen in a
    /// bucket wins for that window.
    pub fn add(&self, name: &str, tags: &[&str], timestamp: f64, value: f64, kind: MetricKind) {
        let bucket_ts = self.bucket_start(timestamp);
        let key = MetricKey::new(name, tags);

        let handle = {
            let mut buckets = self.buckets.lock();
            let bucket = buckets.entry(bucket_ts).or_default();
            Arc::clone(bucket.entry(key).or_insert_with(|| {
                Arc::new(Mutex::new(Accumulator::new(kind, self.sample_size)))
            }))
        };

        handle.lock().add(value);
    }

    /// Finalizes every bucket strictly before the one `now` falls in,
    /// returning the concatenated roll-up records and discarding the buckets.
    ///
    /// Buckets are finalized in ascending time order, so successive flushes
    /// of the same metric always observe non-decreasing bucket timestamps.
    /// The bucket containing `now` (and anything later) is left untouched and
    /// keeps accumulating.
    pub fn flush(&self, now: f64) -> Vec<Rollup> {
        let current = self.bucket_start(now);

        let past = {
            let mut buckets = self.buckets.lock();
            let mut elapsed: Vec<u64> =
                buckets.keys().copied().filter(|bucket_ts| *bucket_ts < current).collect();
            elapsed.sort_unstable();
            elapsed
                .into_iter()
                .filter_map(|bucket_ts| buckets.remove(&bucket_ts).map(|b| (bucket_ts, b)))
                .collect::<Vec<_>>()
        };

        let mut rollups = Vec::new();
        for (bucket_ts, bucket) in past {
            for (key, handle) in bucket {
                handle.lock().flush_into(
                    bucket_ts,
                    &key.name,
                    key.tags.as_deref(),
                    &self.percentiles,
                    &mut rollups,
                );
            }
        }

        rollups
    }
}
