//! Composite reader used when several finders serve the same leaf path.

use crate::error::QueryError;
use crate::intervals::{Interval, IntervalSet};
use crate::node::{FetchResult, Reader};
use crate::types::{Point, TimeInfo, Timestamp};
use std::sync::Arc;

/// A merged view over readers that serve one logical path.
///
/// Readers are kept in finder declaration order, which is the tie-break for
/// both reader selection and value conflicts.
#[derive(Debug, Clone)]
pub struct MultiReader {
    readers: Vec<Arc<dyn Reader>>,
}

impl MultiReader {
    pub fn new(readers: Vec<Arc<dyn Reader>>) -> Self {
        MultiReader { readers }
    }

    pub fn len(&self) -> usize {
        self.readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    /// Index of the reader covering the most of `window`; earliest wins ties.
    fn best_reader(&self, coverage: &[i64]) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, &c) in coverage.iter().enumerate() {
            if best.map_or(true, |b| c > coverage[b]) {
                best = Some(i);
            }
        }
        best
    }

    fn fetch_merged(
        &self,
        candidates: &[usize],
        start: Timestamp,
        end: Timestamp,
        max_points: Option<usize>,
    ) -> Result<FetchResult, QueryError> {
        let mut results = Vec::with_capacity(candidates.len());
        let mut last_error = None;
        for &i in candidates {
            match self.readers[i].fetch(start, end, max_points) {
                Ok(result) => results.push(result),
                Err(e) => last_error = Some(e),
            }
        }
        if results.is_empty() {
            return Err(last_error.unwrap_or_else(|| QueryError::BackendUnavailable {
                backend: "composite".to_string(),
                path: None,
                reason: "no reader available".to_string(),
            }));
        }
        Ok(merge(&results))
    }
}

impl Reader for MultiReader {
    /// Serves `[start, end)` from the single best-covering reader when it covers
    /// the whole window; otherwise merges every reader with any coverage.
    fn fetch(
        &self,
        start: Timestamp,
        end: Timestamp,
        max_points: Option<usize>,
    ) -> Result<FetchResult, QueryError> {
        let window = Interval::new(start, end).ok_or(QueryError::InvalidTimeRange { start, end })?;
        let coverage: Vec<i64> = self
            .readers
            .iter()
            .map(|r| r.intervals().coverage(&window))
            .collect();

        let best = self.best_reader(&coverage);
        if let Some(best) = best.filter(|&b| coverage[b] == window.size()) {
            if let Ok(result) = self.readers[best].fetch(start, end, max_points) {
                return Ok(result);
            }
        }

        let mut candidates: Vec<usize> = (0..self.readers.len()).filter(|&i| coverage[i] > 0).collect();
        if candidates.is_empty() {
            // Nobody claims the window; let every reader answer with gaps.
            candidates = (0..self.readers.len()).collect();
        }
        self.fetch_merged(&candidates, start, end, max_points)
    }

    fn intervals(&self) -> IntervalSet {
        self.readers
            .iter()
            .fold(IntervalSet::new(), |acc, r| acc.union(&r.intervals()))
    }
}

/// Merges fetch results onto the finest grid spanning all of them. Each
/// position takes the first non-gap value in reader order.
fn merge(results: &[FetchResult]) -> FetchResult {
    if let [only] = results {
        return only.clone();
    }
    let step = results.iter().map(|r| r.time_info.step).filter(|&s| s > 0).min().unwrap_or(1);
    let start = results.iter().map(|r| r.time_info.start).min().unwrap_or(0);
    let end = results.iter().map(|r| r.time_info.end).max().unwrap_or(start);
    let time_info = TimeInfo::new(start, end, step);
    let len = time_info.point_count();
    let mut values: Vec<Point> = vec![None; len];

    for result in results {
        let native = result.time_info;
        for (i, value) in result.values.iter().enumerate() {
            let Some(v) = value else { continue };
            let ts = native.timestamp_at(i);
            let first = ((ts - start) / step) as usize;
            let last = (((ts + native.step - start) + step - 1) / step) as usize;
            for slot in values.iter_mut().take(last.min(len)).skip(first) {
                if slot.is_none() {
                    *slot = Some(*v);
                }
            }
        }
    }
    FetchResult::new(time_info, values)
}
