use std::time::Duration;

use thiserror::Error;

use crate::aggregator::MetricsAggregator;
use crate::client::{Route, StatsClient};
use crate::reporter::{NoopReporter, Reporter};
use crate::statsd::StatsdForwarder;

const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_ROLL_UP_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_SAMPLE_SIZE: usize = 1000;
const DEFAULT_PERCENTILES: &[f64] = &[0.75, 0.85, 0.95, 0.99];

/// Errors that could occur while building or starting a [`StatsClient`].
#[derive(Debug, Error)]
pub enum BuildError {
    /// The configured intervals, percentiles, or sampling parameters are
    /// invalid.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Details about the invalid parameter.
        reason: String,
    },

    /// The statsd remote address could not be parsed, or the socket could
    /// not be bound and connected.
    #[error("invalid statsd remote address: {reason}")]
    InvalidRemoteAddress {
        /// Details about the failure.
        reason: String,
    },

    /// Failed to spawn the background flush thread.
    #[error("failed to spawn background flush thread")]
    Backend,

    /// Cooperative scheduling was requested outside of a tokio runtime.
    #[error("cooperative flushing requires a running tokio runtime")]
    MissingRuntime,
}

/// How the background flusher is scheduled once [`StatsClient::start`] is
/// called.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SchedulingMode {
    /// A dedicated worker thread wakes every flush interval. The thread
    /// never keeps the process alive on its own.
    Thread,
    /// A cooperative task on the ambient tokio runtime loops
    /// flush-then-sleep, yielding between cycles. Requires `start` to be
    /// called from within a runtime.
    Cooperative,
}

enum TransportConfig {
    Aggregated(Box<dyn Reporter>),
    Statsd { addr: String },
}

/// Builder for a [`StatsClient`].
pub struct StatsClientBuilder {
    flush_interval: Duration,
    roll_up_interval: Duration,
    host: Option<String>,
    device: Option<String>,
    disabled: bool,
    scheduling: SchedulingMode,
    transport: TransportConfig,
    sample_rate: f64,
    sample_size: usize,
    percentiles: Vec<f64>,
}

impl StatsClientBuilder {
    /// Set the interval at which the background scheduler flushes.
    ///
    /// Defaults to 10 seconds.
    #[must_use]
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the width of the aligned time buckets points are rolled up into.
    ///
    /// Must be a whole, nonzero number of seconds. Defaults to 10 seconds.
    #[must_use]
    pub fn with_roll_up_interval(mut self, interval: Duration) -> Self {
        self.roll_up_interval = interval;
        self
    }

    /// Set the host every delivered series is scoped to.
    ///
    /// Defaults to the machine hostname, resolved once at build time.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the device every delivered series is scoped to.
    ///
    /// Defaults to none.
    #[must_use]
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    /// Fully silence the client: every recording call and flush becomes a
    /// no-op, without touching call sites.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// Set how the background flusher is scheduled.
    ///
    /// Defaults to [`SchedulingMode::Thread`].
    #[must_use]
    pub fn with_scheduling_mode(mut self, mode: SchedulingMode) -> Self {
        self.scheduling = mode;
        self
    }

    /// Deliver rolled-up windows to the given reporter.
    ///
    /// This selects the aggregated transport, which is also the default
    /// (with a [`NoopReporter`] sink).
    #[must_use]
    pub fn with_reporter<R>(mut self, reporter: R) -> Self
    where
        R: Reporter + 'static,
    {
        self.transport = TransportConfig::Aggregated(Box::new(reporter));
        self
    }

    /// Forward every point immediately to a statsd server at the given
    /// address, bypassing aggregation and scheduling.
    #[must_use]
    pub fn with_statsd_address(mut self, addr: impl Into<String>) -> Self {
        self.transport = TransportConfig::Statsd { addr: addr.into() };
        self
    }

    /// Set the statsd sample rate.
    ///
    /// With a rate below 1, each point is sent only with that probability;
    /// unsent points are silently dropped and the receiver is expected to
    /// scale counts back up. Must be in `(0, 1]`. Defaults to 1.
    #[must_use]
    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Set the histogram reservoir capacity.
    ///
    /// Must be nonzero. Defaults to 1000.
    #[must_use]
    pub fn with_histogram_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size;
        self
    }

    /// Set the percentiles emitted for every histogram.
    ///
    /// Each must be in `(0, 1)`. Defaults to `{0.75, 0.85, 0.95, 0.99}`.
    #[must_use]
    pub fn with_percentiles(mut self, percentiles: &[f64]) -> Self {
        self.percentiles = percentiles.to_vec();
        self
    }

    /// Builds the client.
    ///
    /// The effective host is resolved here, once; in statsd mode the socket
    /// is bound and connected here, once.
    ///
    /// # Errors
    ///
    /// Returns a [`BuildError`] if any configured parameter is out of range,
    /// or if the statsd socket could not be set up.
    pub fn build(self) -> Result<StatsClient, BuildError> {
        self.validate()?;

        let StatsClientBuilder {
            flush_interval,
            roll_up_interval,
            host,
            device,
            disabled,
            scheduling,
            transport,
            sample_rate,
            sample_size,
            percentiles,
        } = self;

        let host = host.or_else(default_hostname);
        let aggregated = |reporter: Box<dyn Reporter>, percentiles: Vec<f64>| Route::Aggregated {
            aggregator: MetricsAggregator::new(roll_up_interval.as_secs(), sample_size, percentiles),
            reporter,
        };

        let route = if disabled {
            // A disabled client never records or delivers anything, so skip
            // opening sockets on its behalf.
            aggregated(Box::new(NoopReporter), percentiles)
        } else {
            match transport {
                TransportConfig::Aggregated(reporter) => aggregated(reporter, percentiles),
                TransportConfig::Statsd { addr } => {
                    let forwarder = StatsdForwarder::connect(addr.as_str(), sample_rate)
                        .map_err(|e| BuildError::InvalidRemoteAddress { reason: e.to_string() })?;
                    Route::Statsd(forwarder)
                }
            }
        };

        Ok(StatsClient::new(route, host, device, disabled, flush_interval, scheduling))
    }

    fn validate(&self) -> Result<(), BuildError> {
        let invalid = |reason: String| Err(BuildError::InvalidConfiguration { reason });

        if self.roll_up_interval.as_secs() == 0 || self.roll_up_interval.subsec_nanos() != 0 {
            return invalid(format!(
                "roll-up interval must be a whole, nonzero number of seconds, got {:?}",
                self.roll_up_interval
            ));
        }
        if self.flush_interval.is_zero() {
            return invalid("flush interval must be nonzero".to_string());
        }
        if self.sample_size == 0 {
            return invalid("histogram sample size must be nonzero".to_string());
        }
        if self.percentiles.iter().any(|p| !(*p > 0.0 && *p < 1.0)) {
            return invalid(format!(
                "percentiles must be strictly between 0 and 1, got {:?}",
                self.percentiles
            ));
        }
        if !(self.sample_rate > 0.0 && self.sample_rate <= 1.0) {
            return invalid(format!("sample rate must be in (0, 1], got {}", self.sample_rate));
        }

        Ok(())
    }
}

impl Default for StatsClientBuilder {
    fn default() -> Self {
        StatsClientBuilder {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            roll_up_interval: DEFAULT_ROLL_UP_INTERVAL,
            host: None,
            device: None,
            disabled: false,
            scheduling: SchedulingMode::Thread,
            transport: TransportConfig::Aggregated(Box::new(NoopReporter)),
            sample_rate: 1.0,
            sample_size: DEFAULT_SAMPLE_SIZE,
            percentiles: DEFAULT_PERCENTILES.to_vec(),
        }
    }
}

fn default_hostname() -> Option<String> {
    hostname::get().ok().and_then(|name| name.into_string().ok())
}
