//! Fetch planning: groups resolved leaves by backend batching capability and
//! retrieves one [`RawSeries`] per leaf, in parallel.

use crate::error::QueryError;
use crate::node::{FetchResult, LeafNode};
use crate::store::{backend_error, CallOutcome, Store};
use crate::telemetry::{query_metrics, QueryEvent};
use crate::types::{RawSeries, TimeInfo, Timestamp};
use std::collections::HashMap;
use std::time::Instant;

/// Window and limits for one planner pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    pub start: Timestamp,
    pub end: Timestamp,
    /// Forwarded to aggregating backends only.
    pub max_points: Option<usize>,
    pub deadline: Option<Instant>,
    /// Step of the all-gap placeholder given to leaves whose fetch failed.
    pub fallback_step: i64,
}

impl FetchRequest {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        FetchRequest {
            start,
            end,
            max_points: None,
            deadline: None,
            fallback_step: 60,
        }
    }

    pub fn with_max_points(mut self, max_points: Option<usize>) -> Self {
        self.max_points = max_points;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_fallback_step(mut self, step: i64) -> Self {
        self.fallback_step = step;
        self
    }

    fn placeholder_grid(&self) -> TimeInfo {
        TimeInfo::new(self.start, self.end, self.fallback_step.max(1))
    }
}

/// One RawSeries per requested leaf (in request order) plus the non-fatal
/// errors met while fetching.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub series: Vec<RawSeries>,
    pub errors: Vec<QueryError>,
}

/// Leaves served by one backend call (batched) or one reader fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchGroup {
    /// Finder index; `None` for composite leaves.
    pub source: Option<usize>,
    pub batch_tag: Option<String>,
    /// Indices into the planned leaf slice.
    pub members: Vec<usize>,
}

impl FetchGroup {
    pub fn is_batched(&self) -> bool {
        self.batch_tag.is_some() && self.members.len() > 1
    }
}

type MemberResult = (usize, Result<FetchResult, QueryError>);

/// Plans and executes fetches against a [`Store`].
#[derive(Debug, Clone, Copy)]
pub struct FetchPlanner<'a> {
    store: &'a Store,
}

impl<'a> FetchPlanner<'a> {
    pub fn new(store: &'a Store) -> Self {
        FetchPlanner { store }
    }

    /// Groups leaves by `(finder, batch tag)` for finders that declared
    /// multi-fetch; every other leaf forms its own group. Group order follows
    /// the first appearance of each group in `leaves`.
    pub fn plan(&self, leaves: &[LeafNode]) -> Vec<FetchGroup> {
        let mut groups: Vec<FetchGroup> = Vec::new();
        let mut by_tag: HashMap<(usize, String), usize> = HashMap::new();

        for (i, leaf) in leaves.iter().enumerate() {
            let batch = leaf.source().and_then(|source| {
                let caps = self.store.finder(source)?.capabilities();
                let tag = caps.batch_tag.as_ref().filter(|_| caps.multi_fetch)?;
                Some((source, tag.clone()))
            });
            match batch {
                Some(key) => {
                    if let Some(&g) = by_tag.get(&key) {
                        groups[g].members.push(i);
                    } else {
                        by_tag.insert(key.clone(), groups.len());
                        groups.push(FetchGroup {
                            source: Some(key.0),
                            batch_tag: Some(key.1),
                            members: vec![i],
                        });
                    }
                }
                None => groups.push(FetchGroup {
                    source: leaf.source(),
                    batch_tag: None,
                    members: vec![i],
                }),
            }
        }
        groups
    }

    /// Fetches every leaf over `request`'s window.
    ///
    /// Groups run concurrently on a worker pool built for this fetch. Failed, timed-out
    /// or malformed fetches degrade to all-gap series and are reported in
    /// [`FetchOutcome::errors`]; they never fail sibling fetches.
    pub fn fetch(&self, leaves: &[LeafNode], request: &FetchRequest) -> Result<FetchOutcome, QueryError> {
        if request.start >= request.end {
            return Err(QueryError::InvalidTimeRange {
                start: request.start,
                end: request.end,
            });
        }
        let started = Instant::now();
        let groups = self.plan(leaves);

        let tasks: Vec<_> = groups
            .iter()
            .map(|group| self.group_task(group, leaves, request))
            .collect();
        let gathered = self.store.run_calls(tasks, request.deadline)?;

        let mut results: Vec<Option<Result<FetchResult, QueryError>>> = (0..leaves.len()).map(|_| None).collect();
        for (group, outcome) in groups.iter().zip(gathered) {
            match outcome {
                CallOutcome::Done(members) => {
                    for (i, result) in members {
                        results[i] = Some(result);
                    }
                }
                CallOutcome::Panicked(reason) => {
                    let backend = group
                        .source
                        .and_then(|s| self.store.finder(s))
                        .map(|r| r.name())
                        .unwrap_or("composite");
                    for &i in &group.members {
                        results[i] = Some(Err(QueryError::BackendUnavailable {
                            backend: backend.to_string(),
                            path: Some(leaves[i].path().to_string()),
                            reason: reason.clone(),
                        }));
                    }
                }
                CallOutcome::TimedOut => {
                    query_metrics::record_deadline_expiry();
                    for &i in &group.members {
                        let path = leaves[i].path().to_string();
                        self.store
                            .events()
                            .on_event(QueryEvent::FetchTimedOut { path: path.clone() });
                        results[i] = Some(Err(QueryError::DeadlineExceeded(format!("fetch of {}", path))));
                    }
                }
            }
        }

        let mut outcome = FetchOutcome::default();
        for (leaf, result) in leaves.iter().zip(results) {
            let result = result.unwrap_or_else(|| {
                Err(QueryError::Internal(format!("no fetch planned for {}", leaf.path())))
            });
            let (series, error) = self.normalize(leaf, result, request);
            outcome.series.push(series);
            outcome.errors.extend(error);
        }

        query_metrics::record_fetch(started.elapsed(), leaves.len() as u64);
        Ok(outcome)
    }

    fn group_task(
        &self,
        group: &FetchGroup,
        leaves: &[LeafNode],
        request: &FetchRequest,
    ) -> impl FnOnce() -> Vec<MemberResult> + Send + 'static {
        let registered = group.source.and_then(|s| self.store.finder(s)).cloned();
        let aggregating = registered
            .as_ref()
            .map(|r| r.capabilities().aggregating)
            .unwrap_or(false);
        let max_points = request.max_points.filter(|_| aggregating);
        let members: Vec<(usize, LeafNode)> = group.members.iter().map(|&i| (i, leaves[i].clone())).collect();
        let batched = group.is_batched();
        let (start, end) = (request.start, request.end);
        let events = self.store.events().clone();

        move || match registered {
            Some(registered) if batched => {
                let batch: Vec<LeafNode> = members.iter().map(|(_, leaf)| leaf.clone()).collect();
                match registered.finder().fetch_multi(&batch, start, end, max_points) {
                    Ok(multi) => {
                        events.on_event(QueryEvent::BatchFetched {
                            finder: registered.name().to_string(),
                            leaves: batch.len(),
                        });
                        let expected = multi.time_info.point_count();
                        members
                            .into_iter()
                            .map(|(i, leaf)| {
                                let result = match multi.series.get(leaf.path().as_str()) {
                                    Some(values) => Ok(FetchResult::new(multi.time_info, values.clone())),
                                    None => Err(QueryError::ProtocolViolation {
                                        path: leaf.path().to_string(),
                                        expected,
                                        actual: 0,
                                    }),
                                };
                                (i, result)
                            })
                            .collect()
                    }
                    Err(e) => members.into_iter().map(|(i, _)| (i, Err(e.clone()))).collect(),
                }
            }
            _ => members
                .into_iter()
                .map(|(i, leaf)| (i, leaf.fetch(start, end, max_points)))
                .collect(),
        }
    }

    /// Enforces the gap contract and converts failures into all-gap series.
    fn normalize(
        &self,
        leaf: &LeafNode,
        result: Result<FetchResult, QueryError>,
        request: &FetchRequest,
    ) -> (RawSeries, Option<QueryError>) {
        let path = leaf.path().clone();
        let events = self.store.events();
        match result {
            Ok(fetched) if fetched.values.len() == fetched.time_info.point_count() && fetched.time_info.step > 0 => {
                (RawSeries::new(path, fetched.time_info, fetched.values), None)
            }
            Ok(fetched) => {
                let expected = fetched.time_info.point_count();
                let actual = fetched.values.len();
                query_metrics::record_protocol_violation();
                events.on_event(QueryEvent::ProtocolViolation {
                    path: path.to_string(),
                    expected,
                    actual,
                });
                let grid = if fetched.time_info.step > 0 {
                    fetched.time_info
                } else {
                    request.placeholder_grid()
                };
                let error = QueryError::ProtocolViolation {
                    path: path.to_string(),
                    expected,
                    actual,
                };
                (RawSeries::all_gap(path, grid), Some(error))
            }
            Err(e) => {
                if let QueryError::ProtocolViolation { expected, actual, .. } = &e {
                    query_metrics::record_protocol_violation();
                    events.on_event(QueryEvent::ProtocolViolation {
                        path: path.to_string(),
                        expected: *expected,
                        actual: *actual,
                    });
                } else if !matches!(e, QueryError::DeadlineExceeded(_)) {
                    query_metrics::record_fetch_failure();
                    events.on_event(QueryEvent::FetchFailed {
                        path: path.to_string(),
                        error: e.to_string(),
                    });
                }
                let backend = leaf
                    .source()
                    .and_then(|s| self.store.finder(s))
                    .map(|r| r.name())
                    .unwrap_or("composite");
                let error = backend_error(backend, Some(path.as_str()), e);
                (RawSeries::all_gap(path, request.placeholder_grid()), Some(error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finder::{FindQuery, Finder};
    use crate::intervals::{Interval, IntervalSet};
    use crate::memory::MemoryFinder;
    use crate::node::{Node, Reader};
    use std::sync::Arc;

    #[derive(Debug)]
    struct ShortReader;

    impl Reader for ShortReader {
        fn fetch(&self, start: Timestamp, end: Timestamp, _: Option<usize>) -> Result<FetchResult, QueryError> {
            Ok(FetchResult::new(TimeInfo::new(start, end, 60), vec![Some(1.0)]))
        }

        fn intervals(&self) -> IntervalSet {
            Interval::new(0, 600).into_iter().collect()
        }
    }

    fn leaves(store: &Store, pattern: &str) -> Vec<LeafNode> {
        store
            .find(&FindQuery::pattern_only(pattern).unwrap(), None)
            .unwrap()
            .nodes
            .into_iter()
            .filter_map(Node::into_leaf)
            .collect()
    }

    #[test]
    fn batched_finder_is_fetched_once() {
        let batch = Arc::new(MemoryFinder::builder("batch").batch_tag("b").build());
        let plain = Arc::new(MemoryFinder::new("plain"));
        for name in ["a.one", "a.two", "a.three"] {
            batch.insert_series(name, 0, 60, &[Some(1.0), Some(2.0)]).unwrap();
        }
        plain.insert_series("a.four", 0, 60, &[Some(4.0), None]).unwrap();
        let store = Store::new(vec![batch.clone() as Arc<dyn Finder>, plain.clone()], None).unwrap();
        let leaves = leaves(&store, "a.*");

        let planner = FetchPlanner::new(&store);
        let groups = planner.plan(&leaves);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups.iter().filter(|g| g.is_batched()).count(), 1);

        let outcome = planner.fetch(&leaves, &FetchRequest::new(0, 120)).unwrap();
        assert!(outcome.errors.is_empty());
        assert_eq!(batch.multi_fetch_calls(), 1);
        assert_eq!(batch.fetch_calls(), 0);
        assert_eq!(plain.fetch_calls(), 1);

        let paths: Vec<_> = outcome.series.iter().map(|s| s.path.to_string()).collect();
        assert_eq!(paths, vec!["a.four", "a.one", "a.three", "a.two"]);
        assert_eq!(outcome.series[0].values, vec![Some(4.0), None]);
    }

    #[test]
    fn max_points_only_reaches_aggregating_backends() {
        let agg = Arc::new(MemoryFinder::builder("agg").aggregating(true).build());
        let raw = Arc::new(MemoryFinder::new("raw"));
        let values: Vec<_> = (0..60).map(|v| Some(v as f64)).collect();
        agg.insert_series("x.agg", 0, 60, &values).unwrap();
        raw.insert_series("x.raw", 0, 60, &values).unwrap();
        let store = Store::new(vec![agg as Arc<dyn Finder>, raw], None).unwrap();
        let leaves = leaves(&store, "x.*");

        let request = FetchRequest::new(0, 3600).with_max_points(Some(10));
        let outcome = FetchPlanner::new(&store).fetch(&leaves, &request).unwrap();
        assert_eq!(outcome.series[0].values.len(), 10);
        assert_eq!(outcome.series[1].values.len(), 60);
    }

    #[test]
    fn protocol_violation_becomes_all_gap() {
        let store = Store::new(Vec::new(), None).unwrap();
        let leaf = LeafNode::new("bad.leaf", Arc::new(ShortReader));
        let outcome = FetchPlanner::new(&store)
            .fetch(&[leaf], &FetchRequest::new(0, 300))
            .unwrap();

        assert_eq!(outcome.series[0].time_info, TimeInfo::new(0, 300, 60));
        assert_eq!(outcome.series[0].values, vec![None; 5]);
        assert_eq!(
            outcome.errors,
            vec![QueryError::ProtocolViolation {
                path: "bad.leaf".into(),
                expected: 5,
                actual: 1
            }]
        );
    }

    #[test]
    fn empty_window_is_rejected() {
        let store = Store::new(Vec::new(), None).unwrap();
        assert!(matches!(
            FetchPlanner::new(&store).fetch(&[], &FetchRequest::new(10, 10)),
            Err(QueryError::InvalidTimeRange { .. })
        ));
    }
}
