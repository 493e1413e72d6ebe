//! Client-side metrics collection and aggregation.
//!
//! `dogstats` is an in-process metrics engine: application threads record
//! gauge, counter, and histogram points from any call site, at any rate; the
//! client rolls them up into fixed, aligned time windows and asynchronously
//! delivers finished windows to a remote sink, without ever blocking the
//! instrumented code on delivery.
//!
//! # Usage
//!
//! ```no_run
//! use dogstats::{LogReporter, StatsClient};
//!
//! // Configure and build a client. The builder selects the transport, the
//! // scheduling mode, roll-up and flush intervals, and histogram tuning.
//! let client = StatsClient::builder()
//!     .with_reporter(LogReporter)
//!     .build()
//!     .expect("failed to build stats client");
//!
//! // Start the background flusher, then record from anywhere.
//! client.start().expect("failed to start flush scheduler");
//!
//! client.increment("page.views");
//! client.gauge("queue.depth", 12.0);
//! client.time("db.query", &["shard:primary"], || {
//!     // run the query
//! });
//!
//! // On shutdown, stop the scheduler and drain what's left.
//! client.stop();
//! client.flush();
//! ```
//!
//! # Features
//!
//! ## Windowed roll-ups
//!
//! Points are bucketed by `floor(timestamp / roll_up_interval)`. A window is
//! finalized only once it has fully elapsed, so late-arriving points for the
//! open window keep accumulating correctly, and every window is delivered
//! exactly once. Counters roll up to per-window sums, gauges to the last
//! written value, and histograms to min/max/avg/count plus a configurable
//! set of percentiles.
//!
//! ## Bounded-memory percentiles
//!
//! Histograms keep a fixed-size [reservoir sample][reservoir] of the values
//! recorded in each window, so percentile estimates cost the same whether a
//! histogram sees a thousand points or millions.
//!
//! ## Two transports
//!
//! The default transport aggregates in-process and hands finished windows to
//! a [`Reporter`] — the boundary behind which a real delivery client (such
//! as an HTTP API client) lives. Alternatively, the statsd transport skips
//! aggregation entirely and emits one UDP datagram per point, optionally
//! sampled, for a statsd-compatible receiver to aggregate instead.
//!
//! ## Thread or cooperative scheduling
//!
//! The periodic flush runs either on a dedicated worker thread with an
//! interruptible wait, or as a task on the ambient tokio runtime — chosen
//! explicitly at configuration time.
//!
//! [reservoir]: https://en.wikipedia.org/wiki/Reservoir_sampling

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![deny(missing_docs)]

mod aggregator;

mod builder;
pub use self::builder::{BuildError, SchedulingMode, StatsClientBuilder};

mod client;
pub use self::client::{StatsClient, Timer};

mod metric;

mod reporter;
pub use self::reporter::{FlushError, LogReporter, NoopReporter, Reporter, Series, SeriesKind};

mod scheduler;
mod statsd;
pub(crate) mod util;
