use std::sync::Arc;

#[cfg(feature = "prometheus")]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(feature = "prometheus")]
use std::sync::Mutex;
#[cfg(feature = "prometheus")]
use std::thread::JoinHandle;
use std::time::Duration;

/// Structured, in-process event hook for observability.
///
/// The engine is a library and never prints. Callers plug in an implementation
/// that forwards these events to `tracing`, metrics, or a custom sink.
pub trait QueryEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: QueryEvent);
}

/// Structured events emitted while resolving and evaluating a request.
#[derive(Debug, Clone)]
pub enum QueryEvent {
    FinderFailed { finder: String, pattern: String, error: String },
    FinderTimedOut { finder: String, pattern: String },
    CompositeLeafBuilt { path: String, readers: usize },

    FetchFailed { path: String, error: String },
    FetchTimedOut { path: String },
    ProtocolViolation { path: String, expected: usize, actual: usize },
    BatchFetched { finder: String, leaves: usize },

    FetchCycle { path_expression: String, leaves: usize },
    CacheHit { path_expression: String },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl QueryEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: QueryEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn QueryEventListener> {
    Arc::new(NoopEventListener)
}

/// Forwards events to `tracing`: failures at `warn`, bookkeeping at `debug`.
#[derive(Debug, Default)]
pub struct TracingEventListener;

impl QueryEventListener for TracingEventListener {
    fn on_event(&self, event: QueryEvent) {
        match event {
            QueryEvent::FinderFailed { finder, pattern, error } => {
                tracing::warn!(%finder, %pattern, %error, "finder failed")
            }
            QueryEvent::FinderTimedOut { finder, pattern } => {
                tracing::warn!(%finder, %pattern, "finder timed out")
            }
            QueryEvent::CompositeLeafBuilt { path, readers } => {
                tracing::debug!(%path, readers, "composite leaf built")
            }
            QueryEvent::FetchFailed { path, error } => tracing::warn!(%path, %error, "fetch failed"),
            QueryEvent::FetchTimedOut { path } => tracing::warn!(%path, "fetch timed out"),
            QueryEvent::ProtocolViolation { path, expected, actual } => {
                tracing::warn!(%path, expected, actual, "reader returned wrong value count")
            }
            QueryEvent::BatchFetched { finder, leaves } => {
                tracing::debug!(%finder, leaves, "batched fetch")
            }
            QueryEvent::FetchCycle { path_expression, leaves } => {
                tracing::debug!(%path_expression, leaves, "fetch cycle")
            }
            QueryEvent::CacheHit { path_expression } => {
                tracing::debug!(%path_expression, "request cache hit")
            }
        }
    }
}

pub fn tracing_event_listener() -> Arc<dyn QueryEventListener> {
    Arc::new(TracingEventListener)
}

/// Metrics instrumentation for the read path.
///
/// Emitting is a no-op until a recorder is installed. With the `prometheus`
/// feature, [`query_metrics::InProcessPrometheus`] installs one and renders the
/// exposition text in-process.
pub mod query_metrics {
    use super::*;

    use ::metrics::{describe_counter, describe_histogram, Unit};

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

    // Counters are exposed as `<name>_total` by the Prometheus exporter.
    pub const FIND_REQUESTS: &str = "strand_find_requests";
    pub const FINDER_FAILURES: &str = "strand_finder_failures";
    pub const FETCHED_LEAVES: &str = "strand_fetched_leaves";
    pub const FETCH_FAILURES: &str = "strand_fetch_failures";
    pub const PROTOCOL_VIOLATIONS: &str = "strand_protocol_violations";
    pub const DEADLINE_EXPIRIES: &str = "strand_deadline_expiries";
    pub const CACHE_HITS: &str = "strand_request_cache_hits";

    pub const FETCH_DURATION_SECONDS: &str = "strand_fetch_duration_seconds";
    pub const EVALUATE_DURATION_SECONDS: &str = "strand_evaluate_duration_seconds";

    /// Handle to the in-process Prometheus recorder/scrape renderer.
    ///
    /// This does **not** start an HTTP server. Call [`InProcessPrometheus::render`] to scrape.
    #[cfg(feature = "prometheus")]
    #[derive(Debug)]
    pub struct InProcessPrometheus {
        handle: PrometheusHandle,
        stop: Arc<AtomicBool>,
        upkeep_thread: Mutex<Option<JoinHandle<()>>>,
    }

    #[cfg(feature = "prometheus")]
    impl InProcessPrometheus {
        /// Installs a global Prometheus recorder (once per process) and starts an
        /// upkeep thread that calls `run_upkeep()` every `upkeep_interval`.
        pub fn install(upkeep_interval: Duration) -> Result<Self, MetricsInitError> {
            describe_all();

            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(MetricsInitError::from_build_error)?;

            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            let handle_clone = handle.clone();
            let upkeep_thread = std::thread::Builder::new()
                .name("strand-metrics-upkeep".to_string())
                .spawn(move || {
                    while !stop_clone.load(Ordering::Relaxed) {
                        std::thread::sleep(upkeep_interval);
                        handle_clone.run_upkeep();
                    }
                })
                .map_err(|e| MetricsInitError::ThreadSpawn(e.to_string()))?;

            Ok(Self {
                handle,
                stop,
                upkeep_thread: Mutex::new(Some(upkeep_thread)),
            })
        }

        /// Renders the current metrics in the Prometheus text exposition format.
        pub fn render(&self) -> String {
            self.handle.render()
        }
    }

    #[cfg(feature = "prometheus")]
    impl Drop for InProcessPrometheus {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Ok(mut guard) = self.upkeep_thread.lock() {
                if let Some(t) = guard.take() {
                    let _ = t.join();
                }
            }
        }
    }

    #[cfg(feature = "prometheus")]
    #[derive(Debug, thiserror::Error)]
    pub enum MetricsInitError {
        #[error("metrics recorder already installed")]
        AlreadyInstalled,
        #[error("failed to install prometheus recorder: {0}")]
        Install(String),
        #[error("failed to spawn upkeep thread: {0}")]
        ThreadSpawn(String),
    }

    #[cfg(feature = "prometheus")]
    impl MetricsInitError {
        fn from_build_error(e: BuildError) -> Self {
            match e {
                BuildError::FailedToSetGlobalRecorder(_) => MetricsInitError::AlreadyInstalled,
                other => MetricsInitError::Install(other.to_string()),
            }
        }
    }

    #[inline]
    pub fn record_find_request() {
        ::metrics::counter!(FIND_REQUESTS).increment(1);
    }

    #[inline]
    pub fn record_finder_failure() {
        ::metrics::counter!(FINDER_FAILURES).increment(1);
    }

    #[inline]
    pub fn record_fetch(duration: Duration, leaves: u64) {
        ::metrics::histogram!(FETCH_DURATION_SECONDS).record(duration.as_secs_f64());
        if leaves > 0 {
            ::metrics::counter!(FETCHED_LEAVES).increment(leaves);
        }
    }

    #[inline]
    pub fn record_fetch_failure() {
        ::metrics::counter!(FETCH_FAILURES).increment(1);
    }

    #[inline]
    pub fn record_protocol_violation() {
        ::metrics::counter!(PROTOCOL_VIOLATIONS).increment(1);
    }

    #[inline]
    pub fn record_deadline_expiry() {
        ::metrics::counter!(DEADLINE_EXPIRIES).increment(1);
    }

    #[inline]
    pub fn record_cache_hit() {
        ::metrics::counter!(CACHE_HITS).increment(1);
    }

    #[inline]
    pub fn record_evaluate(duration: Duration) {
        ::metrics::histogram!(EVALUATE_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Registers descriptions with the installed recorder.
    pub fn describe_all() {
        describe_counter!(FIND_REQUESTS, Unit::Count, "Find queries fanned out to the finder federation.");
        describe_counter!(FINDER_FAILURES, Unit::Count, "Finder calls that failed or timed out.");
        describe_counter!(FETCHED_LEAVES, Unit::Count, "Leaves fetched by the fetch planner.");
        describe_counter!(FETCH_FAILURES, Unit::Count, "Leaf fetches that failed and were gap-filled.");
        describe_counter!(
            PROTOCOL_VIOLATIONS,
            Unit::Count,
            "Reader responses whose value count did not match their time info."
        );
        describe_counter!(DEADLINE_EXPIRIES, Unit::Count, "Backend calls abandoned at the request deadline.");
        describe_counter!(CACHE_HITS, Unit::Count, "Path expressions served from the request cache.");

        describe_histogram!(FETCH_DURATION_SECONDS, Unit::Seconds, "Wall time of one fetch planner pass.");
        describe_histogram!(
            EVALUATE_DURATION_SECONDS,
            Unit::Seconds,
            "Wall time of resolve_and_evaluate for one request."
        );
    }
}
