//! In-memory reference backend.
//!
//! `MemoryFinder` keeps every metric as a step plus a timestamp-indexed map of
//! values. It is used by tests and benchmarks, and doubles as a template for
//! real backends: it derives branches from path prefixes, serves leaves through
//! [`MemoryReader`], and can advertise batching and aggregation capabilities.

use crate::align::resample;
use crate::consolidate::{bucket_size, consolidate_values};
use crate::error::QueryError;
use crate::finder::{FindQuery, Finder, FinderCapabilities, MultiFetch};
use crate::intervals::{Interval, IntervalSet};
use crate::node::{FetchResult, LeafNode, Node, Reader};
use crate::types::{ConsolidationFunc, MetricPath, Series, TimeInfo, Timestamp, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Datapoints of one metric, keyed by step-aligned timestamp.
#[derive(Debug)]
struct MemorySeries {
    step: i64,
    points: RwLock<BTreeMap<Timestamp, Value>>,
}

impl MemorySeries {
    fn grid(&self, start: Timestamp, end: Timestamp) -> TimeInfo {
        let from = start.div_euclid(self.step) * self.step;
        let until = -((-end).div_euclid(self.step)) * self.step;
        TimeInfo::new(from, until, self.step)
    }

    fn read(&self, time_info: TimeInfo) -> Result<Vec<Option<Value>>, QueryError> {
        let points = self.points.read()?;
        Ok((0..time_info.point_count())
            .map(|k| points.get(&time_info.timestamp_at(k)).copied())
            .collect())
    }
}

#[derive(Debug, Default)]
struct Counters {
    finds: AtomicUsize,
    fetches: AtomicUsize,
    multi_fetches: AtomicUsize,
}

/// Reader over one in-memory metric.
#[derive(Debug, Clone)]
pub struct MemoryReader {
    series: Arc<MemorySeries>,
    aggregating: bool,
    counters: Arc<Counters>,
}

impl Reader for MemoryReader {
    fn fetch(
        &self,
        start: Timestamp,
        end: Timestamp,
        max_points: Option<usize>,
    ) -> Result<FetchResult, QueryError> {
        if start >= end {
            return Err(QueryError::InvalidTimeRange { start, end });
        }
        self.counters.fetches.fetch_add(1, Ordering::Relaxed);

        let time_info = self.series.grid(start, end);
        let values = self.series.read(time_info)?;

        match max_points {
            Some(max) if self.aggregating => {
                let bucket = bucket_size(values.len(), max);
                let values = consolidate_values(&values, bucket, ConsolidationFunc::Avg);
                let time_info = TimeInfo::new(time_info.start, time_info.end, time_info.step * bucket as i64);
                Ok(FetchResult::new(time_info, values))
            }
            _ => Ok(FetchResult::new(time_info, values)),
        }
    }

    fn intervals(&self) -> IntervalSet {
        let Ok(points) = self.series.points.read() else {
            return IntervalSet::new();
        };
        match (points.keys().next(), points.keys().next_back()) {
            (Some(&first), Some(&last)) => Interval::new(first, last + self.series.step)
                .into_iter()
                .collect(),
            _ => IntervalSet::new(),
        }
    }
}

/// Builder for [`MemoryFinder`].
#[derive(Debug, Clone)]
pub struct MemoryFinderBuilder {
    name: String,
    capabilities: FinderCapabilities,
}

impl MemoryFinderBuilder {
    /// Leaves of this finder share `tag` and are fetched through one
    /// [`Finder::fetch_multi`] call.
    pub fn batch_tag(mut self, tag: impl Into<String>) -> Self {
        self.capabilities.batch_tag = Some(tag.into());
        self.capabilities.multi_fetch = true;
        self
    }

    /// Readers pre-aggregate (average) to the requested point count.
    pub fn aggregating(mut self, aggregating: bool) -> Self {
        self.capabilities.aggregating = aggregating;
        self
    }

    pub fn build(self) -> MemoryFinder {
        MemoryFinder {
            name: self.name,
            capabilities: self.capabilities,
            metrics: RwLock::new(BTreeMap::new()),
            counters: Arc::new(Counters::default()),
        }
    }
}

/// A [`Finder`] backed by in-process maps.
#[derive(Debug)]
pub struct MemoryFinder {
    name: String,
    capabilities: FinderCapabilities,
    metrics: RwLock<BTreeMap<String, Arc<MemorySeries>>>,
    counters: Arc<Counters>,
}

impl MemoryFinder {
    pub fn new(name: impl Into<String>) -> Self {
        MemoryFinder::builder(name).build()
    }

    pub fn builder(name: impl Into<String>) -> MemoryFinderBuilder {
        MemoryFinderBuilder {
            name: name.into(),
            capabilities: FinderCapabilities::default(),
        }
    }

    /// Stores `points` for `path`. Timestamps are snapped down to the metric's
    /// step; later writes to the same slot overwrite earlier ones.
    ///
    /// # Errors
    /// Returns `ConfigError` if `step` is not positive or conflicts with the
    /// step the metric was created with.
    pub fn insert(
        &self,
        path: &str,
        step: i64,
        points: impl IntoIterator<Item = (Timestamp, Value)>,
    ) -> Result<(), QueryError> {
        if step <= 0 {
            return Err(QueryError::ConfigError(format!("step must be positive, got {}", step)));
        }
        let series = {
            let mut metrics = self.metrics.write()?;
            metrics
                .entry(path.to_string())
                .or_insert_with(|| {
                    Arc::new(MemorySeries {
                        step,
                        points: RwLock::new(BTreeMap::new()),
                    })
                })
                .clone()
        };
        if series.step != step {
            return Err(QueryError::ConfigError(format!(
                "metric {} has step {}, cannot insert with step {}",
                path, series.step, step
            )));
        }

        let mut stored = series.points.write()?;
        for (ts, value) in points {
            stored.insert(ts.div_euclid(step) * step, value);
        }
        Ok(())
    }

    /// Convenience for tests: `values` are consecutive points starting at `start`;
    /// `None` entries are left unset.
    pub fn insert_series(
        &self,
        path: &str,
        start: Timestamp,
        step: i64,
        values: &[Option<Value>],
    ) -> Result<(), QueryError> {
        let points = values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.map(|v| (start + i as i64 * step, v)));
        self.insert(path, step, points)
    }

    /// Number of `find_nodes` calls served.
    pub fn find_calls(&self) -> usize {
        self.counters.finds.load(Ordering::Relaxed)
    }

    /// Number of single-leaf reader fetches served.
    pub fn fetch_calls(&self) -> usize {
        self.counters.fetches.load(Ordering::Relaxed)
    }

    /// Number of batched fetches served.
    pub fn multi_fetch_calls(&self) -> usize {
        self.counters.multi_fetches.load(Ordering::Relaxed)
    }

    fn reader_for(&self, series: Arc<MemorySeries>) -> MemoryReader {
        MemoryReader {
            series,
            aggregating: self.capabilities.aggregating,
            counters: self.counters.clone(),
        }
    }
}

impl Finder for MemoryFinder {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> FinderCapabilities {
        self.capabilities.clone()
    }

    fn find_nodes(&self, query: &FindQuery) -> Result<Vec<Node>, QueryError> {
        self.counters.finds.fetch_add(1, Ordering::Relaxed);
        let metrics = self.metrics.read()?;

        // A path that is both a metric and a prefix of a deeper metric is a branch.
        let mut found: BTreeMap<&str, Node> = BTreeMap::new();
        for (path, series) in metrics.iter() {
            let Some((prefix, is_whole)) = query.pattern().match_prefix(path) else {
                continue;
            };
            if is_whole {
                found
                    .entry(prefix)
                    .or_insert_with(|| Node::leaf(prefix, Arc::new(self.reader_for(series.clone()))));
            } else {
                found.insert(prefix, Node::branch(prefix));
            }
        }
        Ok(found.into_values().collect())
    }

    fn fetch_multi(
        &self,
        leaves: &[LeafNode],
        start: Timestamp,
        end: Timestamp,
        max_points: Option<usize>,
    ) -> Result<MultiFetch, QueryError> {
        if start >= end {
            return Err(QueryError::InvalidTimeRange { start, end });
        }
        self.counters.multi_fetches.fetch_add(1, Ordering::Relaxed);

        let metrics = self.metrics.read()?;
        let selected: Vec<(&MetricPath, &Arc<MemorySeries>)> = leaves
            .iter()
            .filter_map(|leaf| metrics.get(leaf.path().as_str()).map(|s| (leaf.path(), s)))
            .collect();

        // One grid for the whole batch, at the coarsest native step.
        let step = selected.iter().map(|(_, s)| s.step).max().unwrap_or(1);
        let from = start.div_euclid(step) * step;
        let until = -((-end).div_euclid(step)) * step;
        let mut time_info = TimeInfo::new(from, until, step);

        let mut series = HashMap::with_capacity(selected.len());
        for (path, stored) in &selected {
            let native = stored.grid(from, until);
            let values = stored.read(native)?;
            let values = if native == time_info {
                values
            } else {
                resample(&Series::new(path.as_str(), native, values), time_info)
            };
            series.insert(path.to_string(), values);
        }

        if let Some(max) = max_points.filter(|_| self.capabilities.aggregating) {
            let bucket = bucket_size(time_info.point_count(), max);
            if bucket > 1 {
                for values in series.values_mut() {
                    *values = consolidate_values(values, bucket, ConsolidationFunc::Avg);
                }
                time_info = TimeInfo::new(time_info.start, time_info.end, step * bucket as i64);
            }
        }
        Ok(MultiFetch { time_info, series })
    }
}
