//! Common-grid normalization of series with differing step/start/end.

use crate::consolidate::reduce;
use crate::types::{Point, Series, TimeInfo, Timestamp};
use rayon::prelude::*;

/// Default cap on the common grid step (one day).
pub const DEFAULT_MAX_GRID_STEP: i64 = 86_400;

pub fn gcd(a: i64, b: i64) -> i64 {
    if b == 0 {
        a.abs()
    } else {
        gcd(b, a % b)
    }
}

/// Least common multiple; `None` on overflow.
pub fn lcm(a: i64, b: i64) -> Option<i64> {
    if a == b {
        return Some(a);
    }
    (a / gcd(a, b)).checked_mul(b)
}

/// Ceiling division that is correct for negative numerators.
#[inline]
fn ceil_div(a: i64, b: i64) -> i64 {
    -((-a).div_euclid(b))
}

/// Chooses the grid every input will be resampled onto.
///
/// The step is the LCM of the input steps, capped at `max_step` (but never finer
/// than the coarsest input). Series without any datapoints do not influence the
/// step. Start is the minimum start rounded down to a step multiple; end is the
/// maximum end rounded up so the grid covers every input.
pub fn common_grid(series: &[Series], max_step: i64) -> Option<TimeInfo> {
    let with_data: Vec<&Series> = series.iter().filter(|s| s.present().next().is_some()).collect();
    let step_sources: Vec<&Series> = if with_data.is_empty() {
        series.iter().collect()
    } else {
        with_data
    };

    let coarsest = step_sources.iter().map(|s| s.step()).max()?;
    let step = step_sources
        .iter()
        .map(|s| s.step())
        .try_fold(step_sources[0].step(), lcm)
        .filter(|&l| l <= max_step.max(coarsest))
        .unwrap_or(max_step.max(coarsest));
    if step <= 0 {
        return None;
    }

    let min_start = series.iter().map(Series::start).min()?;
    let max_end = series.iter().map(Series::end).max()?;
    let start = min_start.div_euclid(step) * step;
    let end = start + ceil_div(max_end - start, step).max(0) * step;
    Some(TimeInfo::new(start, end, step))
}

/// Resamples one series onto `grid`.
///
/// Finer native data is consolidated into each grid cell with the series'
/// consolidation function; coarser native data is repeated across every grid
/// cell it covers. Cells outside the native range are gaps.
pub fn resample(series: &Series, grid: TimeInfo) -> Vec<Point> {
    let native = series.time_info;
    let n = grid.point_count();
    let len = series.values.len() as i64;

    if native.step == grid.step && (native.start - grid.start).rem_euclid(grid.step) == 0 {
        let offset = (native.start - grid.start) / grid.step;
        return (0..n as i64)
            .map(|k| {
                let i = k - offset;
                if (0..len).contains(&i) {
                    series.values[i as usize]
                } else {
                    None
                }
            })
            .collect();
    }

    (0..n)
        .map(|k| {
            let cell_start: Timestamp = grid.timestamp_at(k);
            if native.step < grid.step {
                let lo = ceil_div(cell_start - native.start, native.step).clamp(0, len);
                let hi = ceil_div(cell_start + grid.step - native.start, native.step).clamp(0, len);
                reduce(series.consolidation, &series.values[lo as usize..hi as usize])
            } else {
                if cell_start < native.start {
                    return None;
                }
                let i = (cell_start - native.start).div_euclid(native.step);
                if i < len {
                    series.values[i as usize]
                } else {
                    None
                }
            }
        })
        .collect()
}

/// Normalizes `series` onto one common grid.
///
/// Inputs that already share an identical grid are returned unchanged.
pub fn align(series: Vec<Series>, max_step: i64) -> Vec<Series> {
    let Some(first) = series.first() else {
        return series;
    };
    if series.iter().all(|s| s.time_info == first.time_info) {
        return series;
    }
    let Some(grid) = common_grid(&series, max_step) else {
        return series;
    };

    series
        .into_par_iter()
        .map(|s| {
            let values = resample(&s, grid);
            Series {
                time_info: grid,
                values,
                ..s
            }
        })
        .collect()
}
