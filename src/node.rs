//! The metric namespace tree as seen by the query engine.

use crate::error::QueryError;
use crate::intervals::IntervalSet;
use crate::types::{MetricPath, Point, TimeInfo, Timestamp};
use std::fmt;
use std::sync::Arc;

/// Values returned by a single reader fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub time_info: TimeInfo,
    pub values: Vec<Point>,
}

impl FetchResult {
    pub fn new(time_info: TimeInfo, values: Vec<Point>) -> Self {
        FetchResult { time_info, values }
    }
}

/// Read access to the datapoints behind one leaf.
///
/// Implementations must return exactly `time_info.point_count()` values and must
/// tolerate concurrent calls.
pub trait Reader: fmt::Debug + Send + Sync + 'static {
    /// Fetches `[start, end)`. `max_points` is only passed to readers whose
    /// finder declared aggregation capability; others receive `None`.
    fn fetch(
        &self,
        start: Timestamp,
        end: Timestamp,
        max_points: Option<usize>,
    ) -> Result<FetchResult, QueryError>;

    /// Time ranges for which this reader holds data.
    fn intervals(&self) -> IntervalSet;
}

/// A resolvable metric with its backing reader.
#[derive(Debug, Clone)]
pub struct LeafNode {
    path: MetricPath,
    reader: Arc<dyn Reader>,
    /// Index of the finder that produced this leaf; `None` for composite leaves.
    source: Option<usize>,
}

impl LeafNode {
    pub fn new(path: impl Into<MetricPath>, reader: Arc<dyn Reader>) -> Self {
        LeafNode {
            path: path.into(),
            reader,
            source: None,
        }
    }

    pub fn path(&self) -> &MetricPath {
        &self.path
    }

    pub fn reader(&self) -> &Arc<dyn Reader> {
        &self.reader
    }

    pub fn source(&self) -> Option<usize> {
        self.source
    }

    pub(crate) fn with_source(mut self, source: Option<usize>) -> Self {
        self.source = source;
        self
    }

    pub fn intervals(&self) -> IntervalSet {
        self.reader.intervals()
    }

    pub fn fetch(
        &self,
        start: Timestamp,
        end: Timestamp,
        max_points: Option<usize>,
    ) -> Result<FetchResult, QueryError> {
        self.reader.fetch(start, end, max_points)
    }
}

/// A namespace entry: either a container (`Branch`) or a data-bearing `Leaf`.
#[derive(Debug, Clone)]
pub enum Node {
    Branch { path: MetricPath },
    Leaf(LeafNode),
}

impl Node {
    pub fn branch(path: impl Into<MetricPath>) -> Self {
        Node::Branch { path: path.into() }
    }

    pub fn leaf(path: impl Into<MetricPath>, reader: Arc<dyn Reader>) -> Self {
        Node::Leaf(LeafNode::new(path, reader))
    }

    pub fn path(&self) -> &MetricPath {
        match self {
            Node::Branch { path } => path,
            Node::Leaf(leaf) => leaf.path(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    pub fn as_leaf(&self) -> Option<&LeafNode> {
        match self {
            Node::Leaf(leaf) => Some(leaf),
            Node::Branch { .. } => None,
        }
    }

    pub fn into_leaf(self) -> Option<LeafNode> {
        match self {
            Node::Leaf(leaf) => Some(leaf),
            Node::Branch { .. } => None,
        }
    }
}
