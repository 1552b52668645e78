//! Finder federation: fans a find query out to every configured backend and
//! merges the answers into one deduplicated node set.

use crate::error::QueryError;
use crate::finder::{FindQuery, Finder, FinderCapabilities};
use crate::node::{LeafNode, Node, Reader};
use crate::readers::MultiReader;
use crate::telemetry::{noop_event_listener, query_metrics, QueryEvent, QueryEventListener};
use crate::types::MetricPath;
use rayon::ThreadPoolBuilder;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc};
use std::time::Instant;

/// A finder plus the capabilities it declared at registration.
#[derive(Debug, Clone)]
pub struct RegisteredFinder {
    finder: Arc<dyn Finder>,
    capabilities: FinderCapabilities,
}

impl RegisteredFinder {
    pub fn finder(&self) -> &Arc<dyn Finder> {
        &self.finder
    }

    pub fn capabilities(&self) -> &FinderCapabilities {
        &self.capabilities
    }

    pub fn name(&self) -> &str {
        self.finder.name()
    }
}

/// Nodes matching a find query, plus the non-fatal per-finder errors met
/// while producing them.
#[derive(Debug, Clone, Default)]
pub struct FindResult {
    pub nodes: Vec<Node>,
    pub errors: Vec<QueryError>,
}

impl FindResult {
    pub fn leaves(&self) -> impl Iterator<Item = &LeafNode> {
        self.nodes.iter().filter_map(Node::as_leaf)
    }
}

#[derive(Default)]
struct MergedPath {
    branch: bool,
    leaves: Vec<(usize, LeafNode)>,
}

/// The set of configured finders. Backend calls run on a worker pool built
/// per request, so a call abandoned at the deadline never holds a worker
/// another request needs.
#[derive(Debug)]
pub struct Store {
    finders: Vec<RegisteredFinder>,
    worker_threads: usize,
    events: Arc<dyn QueryEventListener>,
}

impl Store {
    /// Registers `finders` in declaration order and resolves their capabilities once.
    ///
    /// # Arguments
    /// * `finders` - Backends in declaration order (the tie-break order).
    /// * `worker_threads` - Per-request pool size; defaults to one thread per finder.
    ///
    /// # Errors
    /// Returns `ConfigError` if `worker_threads` is zero.
    pub fn new(finders: Vec<Arc<dyn Finder>>, worker_threads: Option<usize>) -> Result<Self, QueryError> {
        Store::with_listener(finders, worker_threads, noop_event_listener())
    }

    pub fn with_listener(
        finders: Vec<Arc<dyn Finder>>,
        worker_threads: Option<usize>,
        events: Arc<dyn QueryEventListener>,
    ) -> Result<Self, QueryError> {
        if worker_threads == Some(0) {
            return Err(QueryError::ConfigError("worker_threads must be at least 1".to_string()));
        }
        let worker_threads = worker_threads.unwrap_or(finders.len()).max(1);

        let finders = finders
            .into_iter()
            .map(|finder| RegisteredFinder {
                capabilities: finder.capabilities(),
                finder,
            })
            .collect();
        Ok(Store {
            finders,
            worker_threads,
            events,
        })
    }

    pub fn finders(&self) -> &[RegisteredFinder] {
        &self.finders
    }

    pub fn finder(&self, index: usize) -> Option<&RegisteredFinder> {
        self.finders.get(index)
    }

    /// Runs one request's backend calls; see [`scatter_gather`].
    pub(crate) fn run_calls<T, F>(&self, tasks: Vec<F>, deadline: Option<Instant>) -> Result<Vec<CallOutcome<T>>, QueryError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let threads = self.worker_threads.min(tasks.len()).max(1);
        scatter_gather(threads, tasks, deadline)
    }

    pub(crate) fn events(&self) -> &Arc<dyn QueryEventListener> {
        &self.events
    }

    /// Resolves `query` against every finder.
    ///
    /// Finders run in parallel. A finder that fails or misses the deadline is
    /// recorded in [`FindResult::errors`] and contributes nothing. Leaves whose
    /// intervals miss the query window are dropped (branches never are). Leaves
    /// returned by more than one finder for the same path are merged behind a
    /// [`MultiReader`]; a path that is a branch anywhere is a branch.
    ///
    /// # Errors
    /// Returns `NoBackendsAvailable` when no finder succeeded.
    pub fn find(&self, query: &FindQuery, deadline: Option<Instant>) -> Result<FindResult, QueryError> {
        query_metrics::record_find_request();
        let pattern = query.pattern().to_string();

        let tasks: Vec<_> = self
            .finders
            .iter()
            .map(|registered| {
                let finder = registered.finder.clone();
                let query = query.clone();
                move || finder.find_nodes(&query)
            })
            .collect();
        let outcomes = self.run_calls(tasks, deadline)?;

        let mut errors = Vec::new();
        let mut answered = Vec::with_capacity(outcomes.len());
        for (index, outcome) in outcomes.into_iter().enumerate() {
            let name = self.finders[index].name();
            let result = match outcome {
                CallOutcome::Done(result) => result,
                CallOutcome::Panicked(reason) => Err(QueryError::BackendUnavailable {
                    backend: name.to_string(),
                    path: None,
                    reason,
                }),
                CallOutcome::TimedOut => {
                    query_metrics::record_finder_failure();
                    query_metrics::record_deadline_expiry();
                    self.events.on_event(QueryEvent::FinderTimedOut {
                        finder: name.to_string(),
                        pattern: pattern.clone(),
                    });
                    errors.push(QueryError::DeadlineExceeded(format!(
                        "finder {} did not answer {}",
                        name, query
                    )));
                    continue;
                }
            };
            match result {
                Ok(nodes) => answered.push((index, nodes)),
                Err(e) => {
                    query_metrics::record_finder_failure();
                    self.events.on_event(QueryEvent::FinderFailed {
                        finder: name.to_string(),
                        pattern: pattern.clone(),
                        error: e.to_string(),
                    });
                    errors.push(backend_error(name, None, e));
                }
            }
        }

        if answered.is_empty() {
            return Err(QueryError::NoBackendsAvailable {
                pattern,
                failures: errors.len(),
            });
        }
        Ok(FindResult {
            nodes: self.merge(query, answered),
            errors,
        })
    }

    fn merge(&self, query: &FindQuery, answered: Vec<(usize, Vec<Node>)>) -> Vec<Node> {
        let window = query.has_window().then(|| query.interval());
        let mut by_path: BTreeMap<MetricPath, MergedPath> = BTreeMap::new();

        for (index, nodes) in answered {
            for node in nodes {
                match node {
                    Node::Branch { path } => by_path.entry(path).or_default().branch = true,
                    Node::Leaf(leaf) => {
                        if let Some(window) = &window {
                            if !leaf.intervals().intersects(window) {
                                continue;
                            }
                        }
                        let entry = by_path.entry(leaf.path().clone()).or_default();
                        if entry.leaves.iter().any(|(i, _)| *i == index) {
                            continue;
                        }
                        entry.leaves.push((index, leaf));
                    }
                }
            }
        }

        by_path
            .into_iter()
            .filter_map(|(path, merged)| {
                if merged.branch {
                    return Some(Node::Branch { path });
                }
                let mut leaves = merged.leaves;
                match leaves.len() {
                    0 => None,
                    1 => leaves.pop().map(|(index, leaf)| Node::Leaf(leaf.with_source(Some(index)))),
                    n => {
                        self.events.on_event(QueryEvent::CompositeLeafBuilt {
                            path: path.to_string(),
                            readers: n,
                        });
                        let readers: Vec<Arc<dyn Reader>> =
                            leaves.iter().map(|(_, leaf)| leaf.reader().clone()).collect();
                        Some(Node::Leaf(LeafNode::new(path, Arc::new(MultiReader::new(readers)))))
                    }
                }
            })
            .collect()
    }
}

/// Wraps a backend failure as `BackendUnavailable` unless it already is a
/// recoverable error.
pub(crate) fn backend_error(backend: &str, path: Option<&str>, error: QueryError) -> QueryError {
    match error {
        e @ (QueryError::BackendUnavailable { .. }
        | QueryError::ProtocolViolation { .. }
        | QueryError::DeadlineExceeded(_)) => e,
        other => QueryError::BackendUnavailable {
            backend: backend.to_string(),
            path: path.map(str::to_string),
            reason: other.to_string(),
        },
    }
}

/// How one backend call scheduled by [`scatter_gather`] ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CallOutcome<T> {
    Done(T),
    /// The call panicked; carries `"panicked: <payload>"`.
    Panicked(String),
    /// No answer before the deadline.
    TimedOut,
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    format!("panicked: {}", message)
}

/// Runs `tasks` on a pool of `threads` workers built for this call and
/// collects their outcomes in task order.
///
/// Tasks still running at `deadline` are abandoned: their results are
/// discarded and the pool is dropped without waiting for them, so its
/// threads exit once the stalled calls return.
///
/// # Errors
/// Returns `Internal` if the worker pool cannot be built.
pub(crate) fn scatter_gather<T, F>(
    threads: usize,
    tasks: Vec<F>,
    deadline: Option<Instant>,
) -> Result<Vec<CallOutcome<T>>, QueryError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let pool = ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .thread_name(|i| format!("strand-worker-{}", i))
        .build()
        .map_err(|e| QueryError::Internal(format!("failed to build worker pool: {}", e)))?;

    let total = tasks.len();
    let (tx, rx) = mpsc::channel::<(usize, CallOutcome<T>)>();
    for (index, task) in tasks.into_iter().enumerate() {
        let tx = tx.clone();
        pool.spawn(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(task)) {
                Ok(value) => CallOutcome::Done(value),
                Err(payload) => CallOutcome::Panicked(panic_reason(payload)),
            };
            let _ = tx.send((index, outcome));
        });
    }
    drop(tx);

    let mut slots: Vec<CallOutcome<T>> = (0..total).map(|_| CallOutcome::TimedOut).collect();
    let mut pending = total;
    while pending > 0 {
        let received = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                rx.recv_timeout(deadline - now).ok()
            }
            None => rx.recv().ok(),
        };
        let Some((index, outcome)) = received else {
            break;
        };
        slots[index] = outcome;
        pending -= 1;
    }
    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryFinder;
    use std::time::Duration;

    #[derive(Debug)]
    struct Broken;

    impl Finder for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn find_nodes(&self, _query: &FindQuery) -> Result<Vec<Node>, QueryError> {
            Err(QueryError::Internal("disk on fire".into()))
        }
    }

    #[test]
    fn scatter_gather_keeps_task_order() {
        let tasks: Vec<_> = (0..6u64)
            .map(|i| {
                move || {
                    std::thread::sleep(Duration::from_millis(30 - i * 5));
                    i
                }
            })
            .collect();
        let out = scatter_gather(3, tasks, None).unwrap();
        assert_eq!(out, (0..6).map(CallOutcome::Done).collect::<Vec<_>>());
    }

    #[test]
    fn scatter_gather_abandons_late_tasks() {
        let tasks: Vec<Box<dyn FnOnce() -> u32 + Send>> = vec![
            Box::new(|| 1),
            Box::new(|| {
                std::thread::sleep(Duration::from_millis(500));
                2
            }),
        ];
        let deadline = Instant::now() + Duration::from_millis(100);
        let out = scatter_gather(2, tasks, Some(deadline)).unwrap();
        assert_eq!(out, vec![CallOutcome::Done(1), CallOutcome::TimedOut]);
    }

    #[test]
    fn scatter_gather_reports_panics_separately() {
        let tasks: Vec<Box<dyn FnOnce() -> u32 + Send>> = vec![Box::new(|| panic!("boom")), Box::new(|| 7)];
        let out = scatter_gather(2, tasks, None).unwrap();
        assert_eq!(
            out,
            vec![CallOutcome::Panicked("panicked: boom".to_string()), CallOutcome::Done(7)]
        );
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(matches!(
            Store::new(Vec::new(), Some(0)),
            Err(QueryError::ConfigError(_))
        ));
    }

    #[test]
    fn failing_finder_is_recorded_not_fatal() {
        let good = Arc::new(MemoryFinder::new("good"));
        good.insert_series("a.b", 0, 60, &[Some(1.0)]).unwrap();
        let store = Store::new(vec![Arc::new(Broken) as Arc<dyn Finder>, good], None).unwrap();

        let result = store.find(&FindQuery::pattern_only("a.*").unwrap(), None).unwrap();
        assert_eq!(result.nodes.len(), 1);
        assert_eq!(result.errors.len(), 1);
        assert!(matches!(
            &result.errors[0],
            QueryError::BackendUnavailable { backend, .. } if backend == "broken"
        ));
    }

    #[test]
    fn all_finders_failing_is_fatal() {
        let store = Store::new(vec![Arc::new(Broken) as Arc<dyn Finder>], None).unwrap();
        let err = store.find(&FindQuery::pattern_only("a.*").unwrap(), None).unwrap_err();
        assert_eq!(
            err,
            QueryError::NoBackendsAvailable {
                pattern: "a.*".into(),
                failures: 1
            }
        );

        let empty = Store::new(Vec::new(), None).unwrap();
        assert!(matches!(
            empty.find(&FindQuery::pattern_only("a").unwrap(), None),
            Err(QueryError::NoBackendsAvailable { failures: 0, .. })
        ));
    }

    #[test]
    fn branch_wins_over_leaf() {
        let a = Arc::new(MemoryFinder::new("a"));
        a.insert_series("x.y", 0, 60, &[Some(1.0)]).unwrap();
        let b = Arc::new(MemoryFinder::new("b"));
        b.insert_series("x.y.z", 0, 60, &[Some(1.0)]).unwrap();
        let store = Store::new(vec![a as Arc<dyn Finder>, b], None).unwrap();

        let result = store.find(&FindQuery::pattern_only("x.*").unwrap(), None).unwrap();
        assert_eq!(result.nodes.len(), 1);
        assert!(!result.nodes[0].is_leaf());
    }

    #[test]
    fn window_prunes_leaves_only() {
        let f = Arc::new(MemoryFinder::new("f"));
        f.insert_series("m.old", 0, 60, &[Some(1.0)]).unwrap();
        f.insert_series("m.new", 6000, 60, &[Some(1.0)]).unwrap();
        f.insert_series("m.dir.leaf", 0, 60, &[Some(1.0)]).unwrap();
        let store = Store::new(vec![f as Arc<dyn Finder>], None).unwrap();

        let query = FindQuery::new("m.*", Some(3000), Some(7000)).unwrap();
        let paths: Vec<String> = store
            .find(&query, None)
            .unwrap()
            .nodes
            .iter()
            .map(|n| n.path().to_string())
            .collect();
        assert_eq!(paths, vec!["m.dir", "m.new"]);
    }
}
