use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Timestamp type (seconds since the Unix epoch).
pub type Timestamp = i64;

/// Value type.
pub type Value = f64;

/// A single grid position: `None` marks a gap.
pub type Point = Option<Value>;

/// Dot-delimited hierarchical metric name (`a.b.c`). Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetricPath(Arc<str>);

impl MetricPath {
    pub fn new(path: &str) -> Self {
        MetricPath(Arc::from(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    pub fn segment_count(&self) -> usize {
        self.0.split('.').count()
    }
}

impl fmt::Display for MetricPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MetricPath {
    fn from(s: &str) -> Self {
        MetricPath::new(s)
    }
}

impl From<String> for MetricPath {
    fn from(s: String) -> Self {
        MetricPath(Arc::from(s))
    }
}

impl AsRef<str> for MetricPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The regular time grid of a fetched series: `[start, end)` sampled every `step` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeInfo {
    pub start: Timestamp,
    pub end: Timestamp,
    pub step: i64,
}

impl TimeInfo {
    pub fn new(start: Timestamp, end: Timestamp, step: i64) -> Self {
        TimeInfo { start, end, step }
    }

    /// Number of grid positions: `ceil((end - start) / step)`.
    pub fn point_count(&self) -> usize {
        if self.step <= 0 || self.end <= self.start {
            return 0;
        }
        ((self.end - self.start + self.step - 1) / self.step) as usize
    }

    /// Timestamp of the grid position at `index`.
    #[inline]
    pub fn timestamp_at(&self, index: usize) -> Timestamp {
        self.start + index as i64 * self.step
    }
}

/// Series as returned by a backend, before any consolidation settings are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSeries {
    pub path: MetricPath,
    pub time_info: TimeInfo,
    pub values: Vec<Point>,
}

impl RawSeries {
    pub fn new(path: MetricPath, time_info: TimeInfo, values: Vec<Point>) -> Self {
        RawSeries {
            path,
            time_info,
            values,
        }
    }

    /// An entirely missing series: every grid position is a gap.
    pub fn all_gap(path: MetricPath, time_info: TimeInfo) -> Self {
        let values = vec![None; time_info.point_count()];
        RawSeries {
            path,
            time_info,
            values,
        }
    }

    pub fn is_all_gap(&self) -> bool {
        self.values.iter().all(Option::is_none)
    }
}

/// Reduction applied when several datapoints collapse into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsolidationFunc {
    #[default]
    #[serde(alias = "average")]
    Avg,
    Sum,
    Min,
    Max,
    First,
    Last,
    Count,
}

impl ConsolidationFunc {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsolidationFunc::Avg => "avg",
            ConsolidationFunc::Sum => "sum",
            ConsolidationFunc::Min => "min",
            ConsolidationFunc::Max => "max",
            ConsolidationFunc::First => "first",
            ConsolidationFunc::Last => "last",
            ConsolidationFunc::Count => "count",
        }
    }
}

impl fmt::Display for ConsolidationFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsolidationFunc {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "avg" | "average" => Ok(ConsolidationFunc::Avg),
            "sum" => Ok(ConsolidationFunc::Sum),
            "min" => Ok(ConsolidationFunc::Min),
            "max" => Ok(ConsolidationFunc::Max),
            "first" => Ok(ConsolidationFunc::First),
            "last" => Ok(ConsolidationFunc::Last),
            "count" => Ok(ConsolidationFunc::Count),
            other => Err(format!("unknown consolidation function {:?}", other)),
        }
    }
}

/// A series ready for function evaluation: raw data plus its consolidation
/// function, display name and the path expression that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    /// Display name; starts as the resolved metric path.
    pub name: String,
    /// The glob (or derived function signature) that produced this series.
    pub path_expression: String,
    pub time_info: TimeInfo,
    pub values: Vec<Point>,
    pub consolidation: ConsolidationFunc,
}

impl Series {
    pub fn new(name: impl Into<String>, time_info: TimeInfo, values: Vec<Point>) -> Self {
        let name = name.into();
        Series {
            path_expression: name.clone(),
            name,
            time_info,
            values,
            consolidation: ConsolidationFunc::default(),
        }
    }

    pub fn from_raw(raw: RawSeries, path_expression: &str, consolidation: ConsolidationFunc) -> Self {
        Series {
            name: raw.path.to_string(),
            path_expression: path_expression.to_string(),
            time_info: raw.time_info,
            values: raw.values,
            consolidation,
        }
    }

    /// Names the series and makes the name its own path expression, the way
    /// function outputs are labelled.
    pub fn renamed(mut self, name: String) -> Self {
        self.path_expression = name.clone();
        self.name = name;
        self
    }

    pub fn start(&self) -> Timestamp {
        self.time_info.start
    }

    pub fn end(&self) -> Timestamp {
        self.time_info.end
    }

    pub fn step(&self) -> i64 {
        self.time_info.step
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates over the present (non-gap) values.
    pub fn present(&self) -> impl Iterator<Item = Value> + '_ {
        self.values.iter().filter_map(|v| *v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_count_rounds_up() {
        assert_eq!(TimeInfo::new(0, 3600, 60).point_count(), 60);
        assert_eq!(TimeInfo::new(0, 3601, 60).point_count(), 61);
        assert_eq!(TimeInfo::new(10, 10, 60).point_count(), 0);
        assert_eq!(TimeInfo::new(0, 100, 0).point_count(), 0);
    }

    #[test]
    fn all_gap_has_exact_length() {
        let raw = RawSeries::all_gap("a.b".into(), TimeInfo::new(0, 65, 10));
        assert_eq!(raw.values.len(), 7);
        assert!(raw.is_all_gap());
    }

    #[test]
    fn consolidation_func_parses_aliases() {
        assert_eq!("average".parse::<ConsolidationFunc>(), Ok(ConsolidationFunc::Avg));
        assert_eq!("last".parse::<ConsolidationFunc>(), Ok(ConsolidationFunc::Last));
        assert!("median".parse::<ConsolidationFunc>().is_err());
    }

    #[test]
    fn metric_path_segments() {
        let p = MetricPath::new("servers.web1.cpu");
        assert_eq!(p.segment_count(), 3);
        assert_eq!(p.segments().collect::<Vec<_>>(), vec!["servers", "web1", "cpu"]);
    }
}
