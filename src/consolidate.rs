//! Resolution-reducing consolidation (downsampling).
//!
//! All reductions ignore gaps and yield a gap only when every input is a gap.
//! Sums accumulate strictly left to right so results are reproducible.

use crate::types::{ConsolidationFunc, Point, Series, TimeInfo, Value};

/// Reduces one bucket of points with `func`.
pub fn reduce(func: ConsolidationFunc, bucket: &[Point]) -> Point {
    let mut present = bucket.iter().filter_map(|v| *v);
    match func {
        ConsolidationFunc::First => present.next(),
        ConsolidationFunc::Last => present.last(),
        ConsolidationFunc::Sum => {
            let first = present.next()?;
            Some(present.fold(first, |acc, v| acc + v))
        }
        ConsolidationFunc::Avg => {
            let first = present.next()?;
            let (sum, count) = present.fold((first, 1usize), |(s, n), v| (s + v, n + 1));
            Some(sum / count as Value)
        }
        ConsolidationFunc::Min => present.reduce(Value::min),
        ConsolidationFunc::Max => present.reduce(Value::max),
        ConsolidationFunc::Count => {
            let count = present.count();
            (count > 0).then_some(count as Value)
        }
    }
}

/// Number of native points folded into each output point so that the output
/// has at most `max_points` entries. Always at least 1.
pub fn bucket_size(native_points: usize, max_points: usize) -> usize {
    if max_points == 0 || native_points <= max_points {
        return 1;
    }
    native_points.div_ceil(max_points)
}

/// Consolidates `values` in buckets of `bucket` points; the last bucket may be shorter.
pub fn consolidate_values(values: &[Point], bucket: usize, func: ConsolidationFunc) -> Vec<Point> {
    if bucket <= 1 {
        return values.to_vec();
    }
    values.chunks(bucket).map(|chunk| reduce(func, chunk)).collect()
}

/// Downsamples a series to at most `max_points` using its own consolidation
/// function. Series already within the limit are returned unchanged.
pub fn consolidate_series(series: Series, max_points: usize) -> Series {
    let bucket = bucket_size(series.values.len(), max_points);
    if bucket == 1 {
        return series;
    }
    let values = consolidate_values(&series.values, bucket, series.consolidation);
    let time_info = TimeInfo::new(
        series.time_info.start,
        series.time_info.end,
        series.time_info.step * bucket as i64,
    );
    Series {
        time_info,
        values,
        ..series
    }
}
