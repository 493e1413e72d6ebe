use std::sync::atomic::{
    AtomicBool, AtomicU64,
    Ordering::{AcqRel, Acquire, Release},
};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use quanta::{Clock, Instant};
use tracing::{debug, error, info};

use crate::aggregator::MetricsAggregator;
use crate::builder::{BuildError, SchedulingMode, StatsClientBuilder};
use crate::metric::{MetricKind, Rollup};
use crate::reporter::{Reporter, Series};
use crate::scheduler::{CooperativeTask, FlushScheduler, PeriodicTimer};
use crate::statsd::StatsdForwarder;

/// Where recorded points go: through the in-process aggregator and out via a
/// reporter, or straight onto the wire as statsd datagrams.
pub(crate) enum Route {
    Aggregated { aggregator: MetricsAggregator, reporter: Box<dyn Reporter> },
    Statsd(StatsdForwarder),
}

struct Inner {
    route: Route,
    host: Option<String>,
    device: Option<String>,
    disabled: bool,
    flush_interval: Duration,
    scheduling: SchedulingMode,
    flush_in_progress: AtomicBool,
    flush_count: AtomicU64,
    scheduler: Mutex<Option<FlushScheduler>>,
    clock: Clock,
}

/// Client-side metrics collection facade.
///
/// Application threads record gauge, counter, and histogram points through
/// this handle; a single background scheduler periodically finalizes elapsed
/// roll-up windows and hands them to the configured [`Reporter`]. Recording
/// never blocks on delivery, and delivery failures never propagate back into
/// application code.
///
/// The client is cheaply clonable; clones share all state, including the
/// scheduler.
#[derive(Clone)]
pub struct StatsClient {
    inner: Arc<Inner>,
}

impl StatsClient {
    /// Returns a builder with default configuration.
    pub fn builder() -> StatsClientBuilder {
        StatsClientBuilder::default()
    }

    pub(crate) fn new(
        route: Route,
        host: Option<String>,
        device: Option<String>,
        disabled: bool,
        flush_interval: Duration,
        scheduling: SchedulingMode,
    ) -> Self {
        StatsClient {
            inner: Arc::new(Inner {
                route,
                host,
                device,
                disabled,
                flush_interval,
                scheduling,
                flush_in_progress: AtomicBool::new(false),
                flush_count: AtomicU64::new(0),
                scheduler: Mutex::new(None),
                clock: Clock::new(),
            }),
        }
    }

    /// Records the instantaneous value of the given gauge.
    pub fn gauge(&self, name: &str, value: f64) {
        self.record(name, &[], None, value, MetricKind::Gauge);
    }

    /// Records a tagged gauge value.
    pub fn gauge_tagged(&self, name: &str, value: f64, tags: &[&str]) {
        self.record(name, tags, None, value, MetricKind::Gauge);
    }

    /// Records a gauge value at an explicit timestamp (epoch seconds).
    pub fn gauge_at(&self, name: &str, value: f64, timestamp: f64, tags: &[&str]) {
        self.record(name, tags, Some(timestamp), value, MetricKind::Gauge);
    }

    /// Increments the given counter by 1.
    pub fn increment(&self, name: &str) {
        self.record(name, &[], None, 1.0, MetricKind::Counter);
    }

    /// Increments the given counter by an arbitrary amount.
    pub fn increment_by(&self, name: &str, value: f64) {
        self.record(name, &[], None, value, MetricKind::Counter);
    }

    /// Increments a tagged counter.
    pub fn increment_tagged(&self, name: &str, value: f64, tags: &[&str]) {
        self.record(name, tags, None, value, MetricKind::Counter);
    }

    /// Increments a counter at an explicit timestamp (epoch seconds).
    pub fn increment_at(&self, name: &str, value: f64, timestamp: f64, tags: &[&str]) {
        self.record(name, tags, Some(timestamp), value, MetricKind::Counter);
    }

    /// Samples a value of the given histogram.
    pub fn histogram(&self, name: &str, value: f64) {
        self.record(name, &[], None, value, MetricKind::Histogram);
    }

    /// Samples a tagged histogram value.
    pub fn histogram_tagged(&self, name: &str, value: f64, tags: &[&str]) {
        self.record(name, tags, None, value, MetricKind::Histogram);
    }

    /// Samples a histogram value at an explicit timestamp (epoch seconds).
    pub fn histogram_at(&self, name: &str, value: f64, timestamp: f64, tags: &[&str]) {
        self.record(name, tags, Some(timestamp), value, MetricKind::Histogram);
    }

    /// Runs `f`, recording its wall-clock duration in seconds as a sample of
    /// the given histogram.
    pub fn time<T, F>(&self, name: &str, tags: &[&str], f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let start = self.inner.clock.now();
        let result = f();
        let elapsed = self.inner.clock.now().duration_since(start);
        self.record(name, tags, None, elapsed.as_secs_f64(), MetricKind::Histogram);
        result
    }

    /// Starts measuring a unit of work; the returned guard records the
    /// elapsed seconds as a histogram sample when dropped.
    pub fn timer(&self, name: &str, tags: &[&str]) -> Timer {
        Timer {
            client: self.clone(),
            name: name.to_owned(),
            tags: tags.iter().map(|tag| (*tag).to_owned()).collect(),
            start: self.inner.clock.now(),
        }
    }

    fn record(&self, name: &str, tags: &[&str], timestamp: Option<f64>, value: f64, kind: MetricKind) {
        if self.inner.disabled {
            return;
        }

        match &self.inner.route {
            Route::Aggregated { aggregator, .. } => {
                let timestamp = timestamp.unwrap_or_else(now_epoch);
                aggregator.add(name, tags, timestamp, value, kind);
            }
            Route::Statsd(forwarder) => forwarder.send(name, tags, value, kind),
        }
    }

    /// Finalizes all elapsed roll-up windows and delivers them to the
    /// reporter.
    ///
    /// A call that overlaps a flush already in progress is a no-op rather
    /// than queued, which bounds the backlog when the reporter is slow. In
    /// statsd mode there is nothing to finalize and this does nothing.
    pub fn flush(&self) {
        self.flush_at(now_epoch());
    }

    /// Like [`flush`](StatsClient::flush), with an explicit notion of "now"
    /// (epoch seconds). Only windows strictly before the bucket containing
    /// `timestamp` are finalized.
    pub fn flush_at(&self, timestamp: f64) {
        if self.inner.disabled {
            return;
        }
        let Route::Aggregated { aggregator, reporter } = &self.inner.route else {
            return;
        };

        if self.inner.flush_in_progress.compare_exchange(false, true, AcqRel, Acquire).is_err() {
            debug!("flush already in progress, skipping");
            return;
        }

        let rollups = aggregator.flush(timestamp);
        if rollups.is_empty() {
            debug!("no metrics to flush");
        } else {
            let flush = self.inner.flush_count.fetch_add(1, AcqRel) + 1;
            let batch: Vec<Series> = rollups.into_iter().map(|r| self.to_series(r)).collect();
            debug!(flush, num_series = batch.len(), "flushing series");
            if let Err(e) = reporter.flush(batch) {
                error!(error = %e, "failed to deliver metrics, dropping window");
            }
        }

        self.inner.flush_in_progress.store(false, Release);
    }

    /// Starts the background flush scheduler configured at build time.
    ///
    /// Idempotent: calling it while a scheduler is already running logs and
    /// does nothing. On a disabled client, and in statsd mode, there is
    /// nothing to schedule.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::MissingRuntime`] when cooperative scheduling is
    /// requested outside of a tokio runtime, or [`BuildError::Backend`] when
    /// the flush thread could not be spawned.
    pub fn start(&self) -> Result<(), BuildError> {
        if self.inner.disabled {
            debug!("client is disabled, not starting flush scheduler");
            return Ok(());
        }
        if matches!(self.inner.route, Route::Statsd(_)) {
            debug!("statsd transport delivers immediately, not starting flush scheduler");
            return Ok(());
        }

        let mut scheduler = self.inner.scheduler.lock();
        if scheduler.is_some() {
            info!("flush scheduler already running");
            return Ok(());
        }

        let client = self.clone();
        let interval = self.inner.flush_interval;
        let handle = match self.inner.scheduling {
            SchedulingMode::Thread => {
                let timer = PeriodicTimer::spawn(interval, move || client.flush())
                    .map_err(|_| BuildError::Backend)?;
                FlushScheduler::Thread(timer)
            }
            SchedulingMode::Cooperative => {
                let runtime = tokio::runtime::Handle::try_current()
                    .map_err(|_| BuildError::MissingRuntime)?;
                FlushScheduler::Cooperative(CooperativeTask::spawn(&runtime, interval, move || {
                    client.flush();
                }))
            }
        };

        info!(interval = ?interval, mode = ?self.inner.scheduling, "started flush scheduler");
        *scheduler = Some(handle);
        Ok(())
    }

    /// Signals the background scheduler to halt.
    ///
    /// Callable from any thread, including from within a flush. An in-flight
    /// flush is never interrupted; only future scheduled flushes are
    /// prevented. The client remains usable for manual
    /// [`flush`](StatsClient::flush) calls afterward.
    pub fn stop(&self) {
        let handle = self.inner.scheduler.lock().take();
        if let Some(handle) = handle {
            handle.stop();
            info!("stopped flush scheduler");
        }
    }

    /// Number of flush cycles that delivered at least one series.
    pub fn flush_count(&self) -> u64 {
        self.inner.flush_count.load(Acquire)
    }

    fn to_series(&self, rollup: Rollup) -> Series {
        Series {
            metric: rollup.name,
            points: vec![(rollup.timestamp, rollup.value)],
            kind: rollup.kind,
            host: self.inner.host.clone(),
            device: self.inner.device.clone(),
            tags: rollup.tags,
        }
    }
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Guard measuring one unit of work; records the elapsed wall-clock seconds
/// as a histogram sample when dropped.
pub struct Timer {
    client: StatsClient,
    name: String,
    tags: Vec<String>,
    start: Instant,
}

impl Timer {
    /// Stops the timer, recording the sample immediately.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let elapsed = self.client.inner.clock.now().duration_since(self.start);
        let tags: Vec<&str> = self.tags.iter().map(String::as_str).collect();
        self.client.record(
            &self.name,
            &tags,
            None,
            elapsed.as_secs_f64(),
            MetricKind::Histogram,
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crossbeam_channel::{bounded, Receiver, Sender};
    use parking_lot::Mutex;

    use super::StatsClient;
    use crate::builder::SchedulingMode;
    use crate::reporter::{FlushError, Reporter, Series, SeriesKind};

    #[derive(Clone, Default)]
    struct MemoryReporter {
        batches: Arc<Mutex<Vec<Vec<Series>>>>,
    }

    impl MemoryReporter {
        fn series(&self) -> Vec<Series> {
            self.batches.lock().iter().flatten().cloned().collect()
        }
    }

    impl Reporter for MemoryReporter {
        fn flush(&self, batch: Vec<Series>) -> Result<(), FlushError> {
            self.batches.lock().push(batch);
            Ok(())
        }
    }

    fn client_with(reporter: MemoryReporter) -> StatsClient {
        StatsClient::builder()
            .with_reporter(reporter)
            .with_host("test-host")
            .with_device("eth0")
            .build()
            .expect("failed to build client")
    }

    #[test]
    fn manual_flush_delivers_rolled_up_series() {
        let reporter = MemoryReporter::default();
        let client = client_with(reporter.clone());

        client.gauge_at("test.gauge.1", 20.0, 100.0, &[]);
        client.gauge_at("test.gauge.1", 22.0, 105.0, &[]);
        client.flush_at(120.0);

        let series = reporter.series();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].metric, "test.gauge.1");
        assert_eq!(series[0].points, vec![(100, 22.0)]);
        assert_eq!(series[0].kind, SeriesKind::Gauge);
        assert_eq!(series[0].host.as_deref(), Some("test-host"));
        assert_eq!(series[0].device.as_deref(), Some("eth0"));
    }

    #[test]
    fn counters_roll_up_across_buckets() {
        let reporter = MemoryReporter::default();
        let client = client_with(reporter.clone());

        client.increment_at("c", 1.0, 1000.0, &[]);
        client.increment_at("c", 2.0, 1005.0, &[]);
        client.increment_at("c2", 1.0, 1015.0, &[]);
        client.flush_at(1021.0);

        let mut series = reporter.series();
        series.sort_by(|a, b| a.metric.cmp(&b.metric));

        assert_eq!(series.len(), 2);
        assert_eq!(series[0].metric, "c");
        assert_eq!(series[0].points, vec![(1000, 3.0)]);
        assert_eq!(series[0].kind, SeriesKind::Counter);
        assert_eq!(series[1].metric, "c2");
        assert_eq!(series[1].points, vec![(1010, 1.0)]);
    }

    #[test]
    fn flush_count_tracks_delivering_flushes_only() {
        let reporter = MemoryReporter::default();
        let client = client_with(reporter.clone());

        client.flush_at(1000.0);
        assert_eq!(client.flush_count(), 0);

        client.increment_at("c", 1.0, 1000.0, &[]);
        client.flush_at(2000.0);
        assert_eq!(client.flush_count(), 1);
    }

    #[test]
    fn disabled_client_is_silent() {
        let reporter = MemoryReporter::default();
        let client = StatsClient::builder()
            .with_reporter(reporter.clone())
            .disabled(true)
            .build()
            .expect("failed to build client");

        client.gauge_at("g", 1.0, 100.0, &[]);
        client.increment("c");
        client.flush_at(10_000_000_000.0);

        assert!(reporter.series().is_empty());
        assert_eq!(client.flush_count(), 0);
    }

    #[test]
    fn stop_leaves_manual_flush_working() {
        let reporter = MemoryReporter::default();
        let client = StatsClient::builder()
            .with_reporter(reporter.clone())
            .with_flush_interval(Duration::from_secs(3600))
            .build()
            .expect("failed to build client");

        client.start().expect("failed to start");
        client.start().expect("second start should no-op");
        client.stop();

        client.increment_at("late", 1.0, 500.0, &[]);
        client.flush_at(600.0);

        let series = reporter.series();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].metric, "late");
    }

    #[test]
    fn cooperative_start_fails_outside_runtime() {
        let client = StatsClient::builder()
            .with_scheduling_mode(SchedulingMode::Cooperative)
            .build()
            .expect("failed to build client");

        assert!(client.start().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cooperative_start_succeeds_inside_runtime() {
        let client = StatsClient::builder()
            .with_scheduling_mode(SchedulingMode::Cooperative)
            .with_flush_interval(Duration::from_secs(3600))
            .build()
            .expect("failed to build client");

        client.start().expect("failed to start");
        client.stop();
    }

    #[test]
    fn timing_helpers_record_histogram_samples() {
        let reporter = MemoryReporter::default();
        let client = client_with(reporter.clone());

        let result = client.time("op", &["env:test"], || 41 + 1);
        assert_eq!(result, 42);

        let guard = client.timer("op", &["env:test"]);
        guard.stop();

        // Samples land in the bucket around "now"; flush from far enough in
        // the future that it has certainly elapsed.
        client.flush_at(4_000_000_000.0);

        let series = reporter.series();
        let total: f64 = series
            .iter()
            .filter(|s| s.metric == "op.count")
            .map(|s| s.points[0].1)
            .sum();
        assert_eq!(total, 2.0);

        let count = series
            .iter()
            .find(|s| s.metric == "op.count")
            .expect("missing op.count series");
        assert_eq!(count.tags.as_deref(), Some(&["env:test".to_owned()][..]));
    }

    struct BlockingReporter {
        entered: Sender<()>,
        release: Receiver<()>,
        delivered: Arc<Mutex<Vec<Vec<Series>>>>,
    }

    impl Reporter for BlockingReporter {
        fn flush(&self, batch: Vec<Series>) -> Result<(), FlushError> {
            self.entered.send(()).expect("test harness went away");
            self.release.recv().expect("test harness went away");
            self.delivered.lock().push(batch);
            Ok(())
        }
    }

    #[test]
    fn overlapping_flush_is_a_noop() {
        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        let delivered = Arc::new(Mutex::new(Vec::new()));

        let reporter = BlockingReporter {
            entered: entered_tx,
            release: release_rx,
            delivered: Arc::clone(&delivered),
        };
        let client = StatsClient::builder()
            .with_reporter(reporter)
            .build()
            .expect("failed to build client");

        client.increment_at("c", 1.0, 1000.0, &[]);

        let flusher = {
            let client = client.clone();
            std::thread::spawn(move || client.flush_at(2000.0))
        };

        // Wait for the first flush to reach the reporter, then overlap it.
        entered_rx.recv().expect("first flush never reached the reporter");
        client.increment_at("c", 1.0, 1500.0, &[]);
        client.flush_at(2000.0);
        assert!(delivered.lock().is_empty());

        release_tx.send(()).expect("flusher went away");
        flusher.join().expect("flusher panicked");

        // Only the first flush delivered; the overlapped one was dropped,
        // not queued.
        assert_eq!(delivered.lock().len(), 1);

        // The point recorded during the in-progress flush is still pending;
        // pre-load the release so the follow-up flush can run to completion.
        release_tx.send(()).expect("flusher went away");
        client.flush_at(3000.0);
        assert_eq!(delivered.lock().len(), 2);
    }
}
