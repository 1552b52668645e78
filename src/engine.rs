//! Engine entry points: namespace browsing (`find`), raw fetches, and
//! `resolve_and_evaluate` for rendering call graphs.

use crate::align::DEFAULT_MAX_GRID_STEP;
use crate::consolidate::consolidate_series;
use crate::error::QueryError;
use crate::evaluator::{EvalValue, Evaluator, Expr, RequestContext};
use crate::fetch::{FetchOutcome, FetchPlanner, FetchRequest};
use crate::finder::{FindQuery, Finder};
use crate::functions::FunctionRegistry;
use crate::node::LeafNode;
use crate::pattern::GlobPattern;
use crate::store::{FindResult, Store};
use crate::telemetry::{noop_event_listener, query_metrics, QueryEventListener};
use crate::types::{ConsolidationFunc, Series, Timestamp};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Overrides the consolidation function of every metric matching `pattern`.
#[derive(Debug, Clone)]
pub struct ConsolidationRule {
    pub pattern: GlobPattern,
    pub func: ConsolidationFunc,
}

impl ConsolidationRule {
    pub fn new(pattern: &str, func: ConsolidationFunc) -> Result<Self, QueryError> {
        Ok(ConsolidationRule {
            pattern: GlobPattern::compile(pattern)?,
            func,
        })
    }
}

/// Configuration options for the [`QueryEngine`]
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound for the alignment grid step (seconds)
    pub max_grid_step: i64,
    /// Step of the all-gap series substituted for a failed fetch (seconds)
    pub fallback_step: i64,
    /// Deadline applied to every request; `None` waits for every backend.
    pub fetch_timeout: Option<Duration>,
    /// Worker pool size; defaults to one thread per finder.
    pub worker_threads: Option<usize>,
    /// Consolidation overrides, first match wins. Unmatched metrics use `avg`.
    pub consolidation_rules: Vec<ConsolidationRule>,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn QueryEventListener>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_grid_step: DEFAULT_MAX_GRID_STEP,
            fallback_step: 60,
            fetch_timeout: None,
            worker_threads: None,
            consolidation_rules: Vec::new(),
            event_listener: noop_event_listener(),
        }
    }
}

impl EngineConfig {
    /// The consolidation function for a resolved metric path.
    pub fn consolidation_for(&self, path: &str) -> ConsolidationFunc {
        self.consolidation_rules
            .iter()
            .find(|rule| rule.pattern.matches(path))
            .map(|rule| rule.func)
            .unwrap_or_default()
    }
}

/// Output of [`QueryEngine::resolve_and_evaluate`].
#[derive(Debug, Clone, Default)]
pub struct RenderResult {
    /// Series lists keyed by target, in target syntax.
    pub series: BTreeMap<String, Vec<Series>>,
    /// Non-fatal errors: failed finders, failed or malformed fetches.
    pub errors: Vec<QueryError>,
    /// Path expressions resolved and fetched while serving the request.
    pub fetch_cycles: usize,
}

/// The read-path query engine over a fixed set of finders.
#[derive(Debug)]
pub struct QueryEngine {
    store: Store,
    registry: FunctionRegistry,
    config: EngineConfig,
}

impl QueryEngine {
    /// Creates an engine with the default configuration and every built-in function.
    pub fn new(finders: Vec<Arc<dyn Finder>>) -> Result<Self, QueryError> {
        QueryEngine::with_config(finders, EngineConfig::default())
    }

    /// Creates an engine over `finders` with the provided configuration.
    ///
    /// # Arguments
    /// * `finders` - Backends in declaration order, which breaks ties between
    ///   backends serving the same path.
    /// * `config` - Engine configuration.
    ///
    /// # Errors
    /// Returns `ConfigError` for a non-positive step setting or a zero worker count.
    pub fn with_config(finders: Vec<Arc<dyn Finder>>, config: EngineConfig) -> Result<Self, QueryError> {
        if config.max_grid_step <= 0 {
            return Err(QueryError::ConfigError("max_grid_step must be positive".to_string()));
        }
        if config.fallback_step <= 0 {
            return Err(QueryError::ConfigError("fallback_step must be positive".to_string()));
        }
        let store = Store::with_listener(finders, config.worker_threads, config.event_listener.clone())?;
        Ok(QueryEngine {
            store,
            registry: FunctionRegistry::builtin(),
            config,
        })
    }

    /// Replaces the function registry.
    pub fn with_registry(mut self, registry: FunctionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn deadline(&self) -> Option<Instant> {
        self.config.fetch_timeout.map(|timeout| Instant::now() + timeout)
    }

    /// Resolves a namespace query across every finder.
    ///
    /// # Errors
    /// Returns `NoBackendsAvailable` when every finder failed.
    pub fn find(&self, query: &FindQuery) -> Result<FindResult, QueryError> {
        self.store.find(query, self.deadline())
    }

    /// Fetches raw series for already resolved leaves, one per leaf in order.
    pub fn fetch(
        &self,
        leaves: &[LeafNode],
        start: Timestamp,
        end: Timestamp,
        max_points: Option<usize>,
    ) -> Result<FetchOutcome, QueryError> {
        let request = FetchRequest::new(start, end)
            .with_max_points(max_points)
            .with_deadline(self.deadline())
            .with_fallback_step(self.config.fallback_step);
        FetchPlanner::new(&self.store).fetch(leaves, &request)
    }

    /// Evaluates `targets` over `[start, end)`.
    ///
    /// Every path expression across all targets is resolved and fetched in one
    /// planner pass before evaluation; repeated references hit the request
    /// cache. Each output series is consolidated to at most `max_points`.
    ///
    /// # Returns
    /// Series lists keyed by the target's display form, together with the
    /// non-fatal errors met on the way.
    ///
    /// # Errors
    /// `InvalidPattern`, `InvalidTimeRange`, `NoBackendsAvailable` and
    /// `EvaluationError` abort the request.
    pub fn resolve_and_evaluate(
        &self,
        targets: &[Expr],
        start: Timestamp,
        end: Timestamp,
        max_points: Option<usize>,
    ) -> Result<RenderResult, QueryError> {
        let started = Instant::now();
        let ctx = RequestContext::new(start, end)
            .with_max_points(max_points)
            .with_deadline(self.deadline());
        let mut evaluator = Evaluator::new(&self.store, &self.registry, &self.config);
        evaluator.prefetch(targets, &ctx)?;

        let mut result = RenderResult::default();
        for target in targets {
            let key = target.to_string();
            let series = match evaluator.evaluate(target, &ctx)? {
                EvalValue::Series(series) => series,
                other => {
                    return Err(QueryError::evaluation(
                        &key,
                        format!("target evaluates to a {}, not a series list", other.type_name()),
                    ))
                }
            };
            let series = match max_points {
                Some(max_points) => series
                    .into_iter()
                    .map(|s| consolidate_series(s, max_points))
                    .collect(),
                None => series,
            };
            result.series.insert(key, series);
        }

        result.errors = evaluator.take_errors();
        result.fetch_cycles = evaluator.fetch_cycles();
        query_metrics::record_evaluate(started.elapsed());
        Ok(result)
    }
}
