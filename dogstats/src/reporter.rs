use std::error::Error;

use thiserror::Error;
use tracing::info;

/// Error returned by a [`Reporter`] when a batch could not be delivered.
///
/// The client catches this at flush time, logs it, and drops that window's
/// records; it is never surfaced to recording call sites.
#[derive(Debug, Error)]
#[error("failed to deliver metric batch: {message}")]
pub struct FlushError {
    message: String,
    #[source]
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl FlushError {
    /// Creates a new `FlushError` with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        FlushError { message: message.into(), source: None }
    }

    /// Creates a new `FlushError` wrapping an underlying error.
    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn Error + Send + Sync>>,
    ) -> Self {
        FlushError { message: message.into(), source: Some(source.into()) }
    }
}

/// The series type reported for a rolled-up value.
///
/// Counters roll up to counter series; gauges and every histogram-derived
/// record roll up to gauge series.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SeriesKind {
    /// Point-in-time value.
    Gauge,
    /// Monotonic per-window sum.
    Counter,
}

impl SeriesKind {
    /// Returns the wire name used by Datadog-style series APIs.
    pub fn as_str(self) -> &'static str {
        match self {
            SeriesKind::Gauge => "gauge",
            SeriesKind::Counter => "counter",
        }
    }
}

/// One finalized metric series, ready for delivery.
#[derive(Clone, Debug, PartialEq)]
pub struct Series {
    /// Metric name, including any derived suffix such as `.95percentile`.
    pub metric: String,
    /// `(epoch seconds, value)` pairs, one per finalized bucket.
    pub points: Vec<(u64, f64)>,
    /// Series type.
    pub kind: SeriesKind,
    /// Effective host the series is scoped to, if any.
    pub host: Option<String>,
    /// Effective device the series is scoped to, if any.
    pub device: Option<String>,
    /// Canonicalized (sorted) tag set, if any.
    pub tags: Option<Vec<String>>,
}

/// A sink accepting finalized metric batches.
///
/// `flush` is invoked synchronously from whichever thread or task runs the
/// flush cycle. Delivery is attempted exactly once per batch; retries and
/// backoff, if any, belong to the implementation behind this boundary.
pub trait Reporter: Send + Sync {
    /// Delivers one batch of finalized series.
    ///
    /// # Errors
    ///
    /// Returns a [`FlushError`] when the batch could not be delivered; the
    /// caller logs the failure and drops the batch.
    fn flush(&self, batch: Vec<Series>) -> Result<(), FlushError>;
}

/// A reporter that discards every batch.
///
/// Useful in tests and as the default sink before a real one is wired in.
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn flush(&self, _batch: Vec<Series>) -> Result<(), FlushError> {
        Ok(())
    }
}

/// A reporter that writes each series to the log at info level.
pub struct LogReporter;

impl Reporter for LogReporter {
    fn flush(&self, batch: Vec<Series>) -> Result<(), FlushError> {
        for series in &batch {
            info!(
                metric = %series.metric,
                kind = series.kind.as_str(),
                points = ?series.points,
                tags = ?series.tags,
                "series"
            );
        }
        Ok(())
    }
}
