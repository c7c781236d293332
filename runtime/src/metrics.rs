//! Prometheus metrics for the read side.
//!
//! Covers every stage of the pipeline:
//! - Paged reads and per-record outcomes
//! - Subscription lifecycle (attempts, polling, live streams)
//! - Projection cache application and stash traffic
//! - Checkpoint saves
//!
//! Recording goes through the `metrics` facade and is a no-op until a
//! recorder is installed, e.g. with [`MetricsServer::start`].
//!
//! # Example
//!
//! ```rust,no_run
//! use eventview_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other crates
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics recorder handle.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server for `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe all metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// A recorder can only be installed once per process. A second call logs a
    /// warning and keeps the existing recorder.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") || err_msg.contains("already installed") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// The socket address this server was configured with.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Reader
    describe_counter!(
        "eventview_records_read_total",
        "Records read from the event store, by stream"
    );
    describe_counter!(
        "eventview_records_skipped_total",
        "Records consumed without reaching a handler, by stream and reason"
    );
    describe_histogram!(
        "eventview_read_page_duration_seconds",
        "Time taken to read one page from the event store"
    );

    // Subscriptions
    describe_counter!(
        "eventview_subscription_attempts_total",
        "Attempts to open a live subscription"
    );
    describe_counter!(
        "eventview_poll_attempts_total",
        "Existence checks made while waiting for a stream to appear"
    );
    describe_gauge!(
        "eventview_live_subscriptions",
        "Subscriptions currently delivering live records"
    );

    // Cache
    describe_counter!(
        "eventview_cache_events_applied_total",
        "Messages applied to cached DTOs, by projection"
    );
    describe_gauge!("eventview_cache_entries", "Entries in a projection cache");
    describe_counter!(
        "eventview_stash_enqueued_total",
        "Messages parked in a stash, by projection and stash"
    );
    describe_counter!(
        "eventview_stash_drained_total",
        "Stashed messages applied after resolution"
    );
    describe_counter!(
        "eventview_stash_evicted_total",
        "Stashed messages dropped because a stash bound was hit"
    );

    // Checkpoints
    describe_counter!("eventview_checkpoint_saves_total", "Checkpoint saves");
    describe_counter!(
        "eventview_checkpoint_errors_total",
        "Checkpoint saves or loads that failed"
    );
}

/// Why a record did not reach a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The payload failed to deserialize.
    Decode,
    /// The stream does not accept the record's type.
    Filtered,
    /// The record was delivered again below the stream's position.
    Duplicate,
}

impl SkipReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::Filtered => "filtered",
            Self::Duplicate => "duplicate",
        }
    }
}

/// Reader metrics recorder.
pub struct ReaderMetrics;

impl ReaderMetrics {
    /// Record one page read.
    pub fn record_page(stream: &str, count: usize, duration: Duration) {
        counter!("eventview_records_read_total", "stream" => stream.to_string())
            .increment(count as u64);
        histogram!("eventview_read_page_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a record that was consumed without reaching a handler.
    pub fn record_skip(stream: &str, reason: SkipReason) {
        counter!(
            "eventview_records_skipped_total",
            "stream" => stream.to_string(),
            "reason" => reason.as_str()
        )
        .increment(1);
    }

    /// Record a checkpoint save.
    pub fn record_checkpoint_save() {
        counter!("eventview_checkpoint_saves_total").increment(1);
    }

    /// Record a failed checkpoint operation.
    pub fn record_checkpoint_error() {
        counter!("eventview_checkpoint_errors_total").increment(1);
    }
}

/// Subscription metrics recorder.
pub struct SubscriptionMetrics;

impl SubscriptionMetrics {
    /// Record an attempt to subscribe.
    pub fn record_attempt(stream: &str) {
        counter!("eventview_subscription_attempts_total", "stream" => stream.to_string())
            .increment(1);
    }

    /// Record an existence poll.
    pub fn record_poll(stream: &str) {
        counter!("eventview_poll_attempts_total", "stream" => stream.to_string()).increment(1);
    }

    /// A subscription went live.
    pub fn record_live() {
        gauge!("eventview_live_subscriptions").increment(1.0);
    }

    /// A live subscription ended.
    pub fn record_not_live() {
        gauge!("eventview_live_subscriptions").decrement(1.0);
    }
}

/// Projection cache metrics recorder.
pub struct CacheMetrics;

impl CacheMetrics {
    /// Record a message applied to a DTO.
    pub fn record_applied(projection: &str) {
        counter!("eventview_cache_events_applied_total", "projection" => projection.to_string())
            .increment(1);
    }

    /// Record the current number of cache entries.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_entries(projection: &str, entries: usize) {
        gauge!("eventview_cache_entries", "projection" => projection.to_string())
            .set(entries as f64);
    }

    /// Record a message parked in `stash`.
    pub fn record_stashed(projection: &str, stash: &'static str) {
        counter!(
            "eventview_stash_enqueued_total",
            "projection" => projection.to_string(),
            "stash" => stash
        )
        .increment(1);
    }

    /// Record stashed messages applied after resolution.
    pub fn record_drained(projection: &str, stash: &'static str, count: usize) {
        counter!(
            "eventview_stash_drained_total",
            "projection" => projection.to_string(),
            "stash" => stash
        )
        .increment(count as u64);
    }

    /// Record stashed messages dropped by a bound.
    pub fn record_evicted(projection: &str, stash: &'static str, count: usize) {
        counter!(
            "eventview_stash_evicted_total",
            "projection" => projection.to_string(),
            "stash" => stash
        )
        .increment(count as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap_or_else(|_| unreachable!());
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert_eq!(server.addr(), addr);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_metrics_server_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        ReaderMetrics::record_page("$ce-Account", 5, Duration::from_millis(3));
        CacheMetrics::record_stashed("accounts", "foreign");

        // Another test may have installed the recorder first; then there is
        // nothing to render from this handle.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("eventview_records_read_total"));
            assert!(rendered.contains("eventview_stash_enqueued_total"));
        }
    }

    #[test]
    fn test_recorders_are_noops_without_recorder() {
        ReaderMetrics::record_skip("$ce-Account", SkipReason::Decode);
        SubscriptionMetrics::record_attempt("$ce-Account");
        SubscriptionMetrics::record_poll("$ce-Account");
        CacheMetrics::record_applied("accounts");
        CacheMetrics::record_entries("accounts", 3);
    }

    #[test]
    fn test_skip_reason_labels() {
        assert_eq!(SkipReason::Decode.as_str(), "decode");
        assert_eq!(SkipReason::Filtered.as_str(), "filtered");
        assert_eq!(SkipReason::Duplicate.as_str(), "duplicate");
    }
}
