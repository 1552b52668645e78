//! Per-series value transforms.

use super::{format_d, format_g, format_path_expressions, Args};
use crate::align::align;
use crate::error::QueryError;
use crate::types::{ConsolidationFunc, Point, Series, Value};

/// Applies `f` to every value of every series and renames each output.
fn map_each<N, F>(series: Vec<Series>, name: N, f: F) -> Vec<Series>
where
    N: Fn(&Series) -> String,
    F: Fn(Point, &Series) -> Point,
{
    series
        .into_iter()
        .map(|s| {
            let new_name = name(&s);
            let values = s.values.iter().map(|v| f(*v, &s)).collect();
            Series { values, ..s }.renamed(new_name)
        })
        .collect()
}

/// Maps consecutive value pairs; the first point and any pair with a gap
/// become gaps.
fn map_deltas<F>(series: Vec<Series>, function: &str, f: F) -> Vec<Series>
where
    F: Fn(Value, Value, &Series) -> Point,
{
    series
        .into_iter()
        .map(|s| {
            let mut prev: Point = None;
            let values = s
                .values
                .iter()
                .map(|&val| {
                    let out = match (prev, val) {
                        (Some(p), Some(v)) => f(p, v, &s),
                        _ => None,
                    };
                    prev = val;
                    out
                })
                .collect();
            let name = format!("{}({})", function, s.name);
            Series { values, ..s }.renamed(name)
        })
        .collect()
}

pub(super) fn scale(mut args: Args) -> Result<Vec<Series>, QueryError> {
    let series = args.series_list(0, "seriesList")?;
    let factor = args.number(1, "factor")?;
    Ok(map_each(
        series,
        |s| format!("scale({},{})", s.name, format_g(factor)),
        |v, _| v.map(|v| v * factor),
    ))
}

pub(super) fn offset(mut args: Args) -> Result<Vec<Series>, QueryError> {
    let series = args.series_list(0, "seriesList")?;
    let factor = args.number(1, "factor")?;
    Ok(map_each(
        series,
        |s| format!("offset({},{})", s.name, format_g(factor)),
        |v, _| v.map(|v| v + factor),
    ))
}

pub(super) fn absolute(mut args: Args) -> Result<Vec<Series>, QueryError> {
    let series = args.series_list(0, "seriesList")?;
    Ok(map_each(series, |s| format!("absolute({})", s.name), |v, _| v.map(f64::abs)))
}

pub(super) fn invert(mut args: Args) -> Result<Vec<Series>, QueryError> {
    let series = args.series_list(0, "seriesList")?;
    Ok(map_each(
        series,
        |s| format!("invert({})", s.name),
        |v, _| v.filter(|v| *v != 0.0).map(|v| 1.0 / v),
    ))
}

/// Rescales each value from "per step" to "per `seconds`".
pub(super) fn scale_to_seconds(mut args: Args) -> Result<Vec<Series>, QueryError> {
    let series = args.series_list(0, "seriesList")?;
    let seconds = args.number(1, "seconds")?;
    Ok(map_each(
        series,
        |s| format!("scaleToSeconds({},{})", s.name, format_d(seconds)),
        |v, s| v.map(|v| v * seconds / s.step() as Value),
    ))
}

pub(super) fn transform_null(mut args: Args) -> Result<Vec<Series>, QueryError> {
    let series = args.series_list(0, "seriesList")?;
    let default = args.opt_number(1, "default")?.unwrap_or(0.0);
    Ok(map_each(
        series,
        |s| format!("transformNull({},{})", s.name, format_g(default)),
        |v, _| Some(v.unwrap_or(default)),
    ))
}

pub(super) fn is_non_null(mut args: Args) -> Result<Vec<Series>, QueryError> {
    let series = args.series_list(0, "seriesList")?;
    Ok(map_each(
        series,
        |s| format!("isNonNull({})", s.name),
        |v, _| Some(if v.is_some() { 1.0 } else { 0.0 }),
    ))
}

/// Fills runs of gaps with the preceding value. Interior runs longer than
/// `limit` stay gaps, as do trailing runs of `limit` or more.
fn fill_gaps(values: &mut [Point], limit: Option<usize>) {
    let within = |run: usize| limit.map_or(true, |l| run <= l);
    let mut run = 0;
    for i in 1..values.len() {
        if values[i].is_none() {
            run += 1;
            continue;
        }
        if run > 0 && within(run) {
            let fill = values[i - run - 1];
            for slot in &mut values[i - run..i] {
                *slot = fill;
            }
        }
        run = 0;
    }
    let len = values.len();
    if run > 0 && limit.map_or(true, |l| run < l) {
        let fill = values[len - run - 1];
        for slot in &mut values[len - run..] {
            *slot = fill;
        }
    }
}

pub(super) fn keep_last_value(mut args: Args) -> Result<Vec<Series>, QueryError> {
    let series = args.series_list(0, "seriesList")?;
    let limit = match args.opt_integer(1, "limit")? {
        Some(l) if l < 0 => return Err(QueryError::evaluation("keepLastValue", "limit must not be negative")),
        Some(l) => Some(l as usize),
        None => None,
    };
    Ok(series
        .into_iter()
        .map(|mut s| {
            fill_gaps(&mut s.values, limit);
            let name = format!("keepLastValue({})", s.name);
            s.renamed(name)
        })
        .collect())
}

pub(super) fn derivative(mut args: Args) -> Result<Vec<Series>, QueryError> {
    let series = args.series_list(0, "seriesList")?;
    Ok(map_deltas(series, "derivative", |prev, val, _| Some(val - prev)))
}

/// A counter delta that tolerates wrap-around at `max_value`. Decreases
/// without a wrap bound are gaps.
fn counter_delta(prev: Value, val: Value, max_value: Option<Value>) -> Point {
    let diff = val - prev;
    if diff >= 0.0 {
        Some(diff)
    } else {
        max_value
            .filter(|max| *max >= val)
            .map(|max| (max - prev) + val + 1.0)
    }
}

pub(super) fn non_negative_derivative(mut args: Args) -> Result<Vec<Series>, QueryError> {
    let series = args.series_list(0, "seriesList")?;
    let max_value = args.opt_number(1, "maxValue")?;
    Ok(map_deltas(series, "nonNegativeDerivative", |prev, val, _| {
        counter_delta(prev, val, max_value)
    }))
}

pub(super) fn per_second(mut args: Args) -> Result<Vec<Series>, QueryError> {
    let series = args.series_list(0, "seriesList")?;
    let max_value = args.opt_number(1, "maxValue")?;
    Ok(map_deltas(series, "perSecond", |prev, val, s| {
        counter_delta(prev, val, max_value).map(|d| d / s.step() as Value)
    }))
}

/// Running sum; gaps stay gaps and do not reset the total.
pub(super) fn integral(mut args: Args) -> Result<Vec<Series>, QueryError> {
    let series = args.series_list(0, "seriesList")?;
    Ok(series
        .into_iter()
        .map(|s| {
            let mut total = 0.0;
            let values = s
                .values
                .iter()
                .map(|v| {
                    v.map(|v| {
                        total += v;
                        total
                    })
                })
                .collect();
            let name = format!("integral({})", s.name);
            Series { values, ..s }.renamed(name)
        })
        .collect())
}

fn with_consolidation(series: Vec<Series>, func: ConsolidationFunc) -> Vec<Series> {
    series
        .into_iter()
        .map(|mut s| {
            s.consolidation = func;
            let name = format!("consolidateBy({},\"{}\")", s.name, func);
            s.renamed(name)
        })
        .collect()
}

/// Overrides the function used when the series is later reduced to fit
/// `max_points`.
pub(super) fn consolidate_by(mut args: Args) -> Result<Vec<Series>, QueryError> {
    let series = args.series_list(0, "seriesList")?;
    let name = args.string(1, "consolidationFunc")?;
    let func = name
        .parse::<ConsolidationFunc>()
        .map_err(|_| QueryError::evaluation("consolidateBy", format!("unknown consolidation function {:?}", name)))?;
    Ok(with_consolidation(series, func))
}

pub(super) fn cumulative(mut args: Args) -> Result<Vec<Series>, QueryError> {
    let series = args.series_list(0, "seriesList")?;
    Ok(with_consolidation(series, ConsolidationFunc::Sum))
}

fn percent(value: Point, total: Point) -> Point {
    match (value, total) {
        (Some(v), Some(t)) if t != 0.0 => Some(v / t * 100.0),
        _ => None,
    }
}

/// Each series as a percentage of `total`: a single series, a constant, or
/// when omitted, the row sums of the list itself.
pub(super) fn as_percent(mut args: Args) -> Result<Vec<Series>, QueryError> {
    let series = args.series_list(0, "seriesList")?;
    if series.is_empty() {
        return Ok(Vec::new());
    }
    let max_grid_step = args.max_grid_step();

    match args.take_value(1, "total") {
        None => {
            let aligned = align(series, max_grid_step);
            let expressions = format_path_expressions(&aligned);
            let width = aligned.iter().map(Series::len).max().unwrap_or(0);
            let totals: Vec<Point> = (0..width)
                .map(|i| {
                    let row = aligned.iter().filter_map(|s| s.values.get(i).copied().flatten());
                    row.fold(None, |acc: Point, v| Some(acc.unwrap_or(0.0) + v))
                })
                .collect();
            Ok(aligned
                .into_iter()
                .map(|s| {
                    let name = format!("asPercent({}, {})", s.name, expressions);
                    let values = s
                        .values
                        .iter()
                        .enumerate()
                        .map(|(i, v)| percent(*v, totals.get(i).copied().flatten()))
                        .collect();
                    Series { values, ..s }.renamed(name)
                })
                .collect())
        }
        Some(crate::evaluator::EvalValue::Series(mut total)) => {
            if total.len() != 1 {
                return Err(QueryError::evaluation(
                    "asPercent",
                    format!("total must reference exactly 1 series, got {}", total.len()),
                ));
            }
            let total_series = total.remove(0);
            let total_name = total_series.name.clone();
            let mut all = series;
            all.push(total_series);
            let mut aligned = align(all, max_grid_step);
            let Some(total) = aligned.pop() else {
                return Ok(Vec::new());
            };
            Ok(aligned
                .into_iter()
                .map(|s| {
                    let name = format!("asPercent({}, {})", s.name, total_name);
                    let values = s
                        .values
                        .iter()
                        .enumerate()
                        .map(|(i, v)| percent(*v, total.values.get(i).copied().flatten()))
                        .collect();
                    Series { values, ..s }.renamed(name)
                })
                .collect())
        }
        Some(crate::evaluator::EvalValue::Number(total)) => Ok(map_each(
            series,
            |s| format!("asPercent({}, {})", s.name, format_g(total)),
            |v, _| percent(v, Some(total)),
        )),
        Some(other) => Err(QueryError::evaluation(
            "asPercent",
            format!("total must be a series list or a number, got {}", other.type_name()),
        )),
    }
}
