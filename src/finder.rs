//! The storage backend contract: a `Finder` resolves glob queries to nodes and
//! may optionally fetch many leaves in one call.

use crate::error::QueryError;
use crate::intervals::Interval;
use crate::node::{LeafNode, Node};
use crate::pattern::GlobPattern;
use crate::types::{Point, TimeInfo, Timestamp};
use std::collections::HashMap;
use std::fmt;

/// A namespace query: a compiled glob plus an optional time window.
#[derive(Debug, Clone)]
pub struct FindQuery {
    pattern: GlobPattern,
    start: Option<Timestamp>,
    end: Option<Timestamp>,
}

impl FindQuery {
    /// Compiles `pattern`; fails with `InvalidPattern` before any backend is touched.
    pub fn new(
        pattern: &str,
        start: Option<Timestamp>,
        end: Option<Timestamp>,
    ) -> Result<Self, QueryError> {
        if let (Some(s), Some(e)) = (start, end) {
            if s >= e {
                return Err(QueryError::InvalidTimeRange { start: s, end: e });
            }
        }
        Ok(FindQuery {
            pattern: GlobPattern::compile(pattern)?,
            start,
            end,
        })
    }

    /// A query without a time window.
    pub fn pattern_only(pattern: &str) -> Result<Self, QueryError> {
        FindQuery::new(pattern, None, None)
    }

    pub fn pattern(&self) -> &GlobPattern {
        &self.pattern
    }

    pub fn start(&self) -> Option<Timestamp> {
        self.start
    }

    pub fn end(&self) -> Option<Timestamp> {
        self.end
    }

    pub fn has_window(&self) -> bool {
        self.start.is_some() || self.end.is_some()
    }

    /// The window as an interval; unbounded sides extend to the sentinels.
    pub fn interval(&self) -> Interval {
        Interval::window(self.start, self.end).unwrap_or_else(Interval::unbounded)
    }
}

impl fmt::Display for FindQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound = |t: Option<Timestamp>| t.map(|t| t.to_string()).unwrap_or_else(|| "*".to_string());
        write!(
            f,
            "<FindQuery: {} from {} until {}>",
            self.pattern,
            bound(self.start),
            bound(self.end)
        )
    }
}

/// Optional capabilities a finder declares once, at registration time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinderCapabilities {
    /// Leaves sharing this tag may be fetched together. `None` means every
    /// leaf from this finder is fetched on its own.
    pub batch_tag: Option<String>,
    /// The finder implements [`Finder::fetch_multi`].
    pub multi_fetch: bool,
    /// The backend can pre-aggregate to a requested point count.
    pub aggregating: bool,
}

/// Result of a batched fetch: one grid shared by every returned path.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiFetch {
    pub time_info: TimeInfo,
    pub series: HashMap<String, Vec<Point>>,
}

/// A storage backend. Implementations must be safe to query concurrently.
pub trait Finder: fmt::Debug + Send + Sync + 'static {
    /// Human-readable backend name used in errors and telemetry.
    fn name(&self) -> &str;

    fn capabilities(&self) -> FinderCapabilities {
        FinderCapabilities::default()
    }

    /// Returns every node whose path matches the query pattern. Time-window
    /// pruning is applied by the caller, so finders may ignore the window.
    fn find_nodes(&self, query: &FindQuery) -> Result<Vec<Node>, QueryError>;

    /// Fetches all `leaves` in one backend call. Only invoked when
    /// `capabilities().multi_fetch` is set.
    fn fetch_multi(
        &self,
        leaves: &[LeafNode],
        start: Timestamp,
        end: Timestamp,
        max_points: Option<usize>,
    ) -> Result<MultiFetch, QueryError> {
        let _ = (leaves, start, end, max_points);
        Err(QueryError::NotImplemented(format!(
            "finder {} does not support batched fetch",
            self.name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_query_rejects_bad_pattern_and_window() {
        assert!(matches!(
            FindQuery::new("a.{b", None, None),
            Err(QueryError::InvalidPattern { .. })
        ));
        assert!(matches!(
            FindQuery::new("a.b", Some(10), Some(10)),
            Err(QueryError::InvalidTimeRange { start: 10, end: 10 })
        ));
    }

    #[test]
    fn find_query_interval_and_display() {
        let q = FindQuery::new("a.*", Some(0), None).unwrap();
        assert_eq!(q.interval(), Interval::new(0, i64::MAX).unwrap());
        assert!(q.has_window());
        assert_eq!(q.to_string(), "<FindQuery: a.* from 0 until *>");
        assert!(!FindQuery::pattern_only("a").unwrap().has_window());
    }
}
