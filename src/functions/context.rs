//! Functions that need the evaluator itself: they re-evaluate their series
//! argument over a different window, or look up other functions.

use super::{format_g, Args};
use crate::align::resample;
use crate::error::QueryError;
use crate::evaluator::{CallSite, EvalValue, Evaluator, RequestContext};
use crate::types::{Point, Series, TimeInfo, Value};

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;

fn unit_seconds(unit: &str) -> Option<i64> {
    if unit.starts_with('s') {
        Some(1)
    } else if unit.starts_with("min") {
        Some(MINUTE)
    } else if unit.starts_with('h') {
        Some(HOUR)
    } else if unit.starts_with('d') {
        Some(DAY)
    } else if unit.starts_with('w') {
        Some(7 * DAY)
    } else if unit.starts_with("mon") {
        Some(30 * DAY)
    } else if unit.starts_with('y') {
        Some(365 * DAY)
    } else {
        None
    }
}

/// Parses a relative time offset such as `"7d"`, `"-1h"` or `"+1h30min"`
/// into signed seconds. Without a sign the offset is positive; an empty
/// string is zero.
pub fn parse_time_offset(offset: &str) -> Result<i64, String> {
    let (sign, mut rest) = match offset.as_bytes().first() {
        None => return Ok(0),
        Some(b'-') => (-1, &offset[1..]),
        Some(b'+') => (1, &offset[1..]),
        Some(c) if c.is_ascii_digit() => (1, offset),
        Some(_) => return Err(format!("invalid time offset {:?}", offset)),
    };

    let mut total: i64 = 0;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        let number: i64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid time offset {:?}: expected a number", offset))?;
        rest = &rest[digits..];

        let letters = rest.find(|c: char| !c.is_ascii_alphabetic()).unwrap_or(rest.len());
        let unit = &rest[..letters];
        rest = &rest[letters..];
        let seconds = unit_seconds(unit).ok_or_else(|| format!("invalid offset unit {:?} in {:?}", unit, offset))?;
        total = number
            .checked_mul(seconds)
            .and_then(|s| total.checked_add(s))
            .ok_or_else(|| format!("time offset {:?} out of range", offset))?;
    }
    Ok(sign * total)
}

/// Evaluates every argument except the leading series list into an [`Args`]
/// bundle; slot 0 holds an empty placeholder list.
fn scalar_args(evaluator: &mut Evaluator<'_>, call: &CallSite<'_>, ctx: &RequestContext) -> Result<Args, QueryError> {
    let mut positional = vec![EvalValue::Series(Vec::new())];
    for expr in call.args.iter().skip(1) {
        positional.push(evaluator.evaluate(expr, ctx)?);
    }
    let mut named = Vec::with_capacity(call.kwargs.len());
    for (name, expr) in call.kwargs {
        if name != "seriesList" {
            named.push((name.clone(), evaluator.evaluate(expr, ctx)?));
        }
    }
    Ok(Args::new(call.function, positional, named, evaluator.max_grid_step()))
}

/// Evaluates the leading series-list argument under `ctx`.
fn series_arg(evaluator: &mut Evaluator<'_>, call: &CallSite<'_>, ctx: &RequestContext) -> Result<Vec<Series>, QueryError> {
    let expr = call
        .arg(0, "seriesList")
        .ok_or_else(|| QueryError::evaluation(call.function, "missing required argument seriesList"))?;
    evaluator.evaluate_series(expr, ctx)
}

/// Draws the series argument as it was `timeShift` ago (or ahead, with a
/// leading `+`). The shifted fetch is cached under its own window.
pub(super) fn time_shift(
    evaluator: &mut Evaluator<'_>,
    call: &CallSite<'_>,
    ctx: &RequestContext,
) -> Result<Vec<Series>, QueryError> {
    let args = scalar_args(evaluator, call, ctx)?;
    let mut shift = args.string(1, "timeShift")?;
    let reset_end = args.opt_bool(2, "resetEnd")?.unwrap_or(true);
    if shift.starts_with(|c: char| c.is_ascii_digit()) {
        shift.insert(0, '-');
    }
    let delta = parse_time_offset(&shift).map_err(|e| QueryError::evaluation("timeShift", e))?;

    let shifted_ctx = ctx.shifted(delta);
    let shifted = series_arg(evaluator, call, &shifted_ctx)?;
    Ok(shifted
        .into_iter()
        .map(|s| {
            let step = s.step();
            let start = s.start() - delta;
            let mut end = s.end() - delta;
            let mut values = s.values;
            if reset_end && end > ctx.end {
                end = ctx.end.max(start);
                values.truncate(TimeInfo::new(start, end, step).point_count());
            }
            let name = format!("timeShift({}, {})", s.name, shift);
            Series {
                time_info: TimeInfo::new(start, end, step),
                values,
                ..s
            }
            .renamed(name)
        })
        .collect())
}

enum Window {
    Points(usize),
    Seconds(i64, String),
}

fn mean(window: &[Point]) -> Point {
    let (sum, n) = window
        .iter()
        .filter_map(|v| *v)
        .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    (n > 0).then(|| sum / n as Value)
}

/// Averages each point's preceding window of points. The window is
/// bootstrapped by evaluating the argument again from an earlier start, so
/// the first points of the requested range are averaged too.
pub(super) fn moving_average(
    evaluator: &mut Evaluator<'_>,
    call: &CallSite<'_>,
    ctx: &RequestContext,
) -> Result<Vec<Series>, QueryError> {
    let args = scalar_args(evaluator, call, ctx)?;
    let window = match args.scalar(1, "windowSize") {
        Some(EvalValue::Number(n)) if *n >= 0.0 && n.fract() == 0.0 => Window::Points(*n as usize),
        Some(EvalValue::Str(s)) => {
            let seconds = parse_time_offset(s)
                .map_err(|e| QueryError::evaluation("movingAverage", e))?
                .abs();
            Window::Seconds(seconds, s.clone())
        }
        Some(other) => {
            return Err(QueryError::evaluation(
                "movingAverage",
                format!("windowSize must be a point count or a time offset, got {}", other.type_name()),
            ))
        }
        None => return Err(QueryError::evaluation("movingAverage", "missing required argument windowSize")),
    };

    let originals = series_arg(evaluator, call, ctx)?;
    if originals.is_empty() {
        return Ok(originals);
    }
    let bootstrap_seconds = match &window {
        Window::Points(n) => originals.iter().map(Series::step).max().unwrap_or(0) * *n as i64,
        Window::Seconds(seconds, _) => *seconds,
    };
    let bootstraps = if bootstrap_seconds > 0 {
        let bootstrap_ctx = ctx.with_start(ctx.start - bootstrap_seconds);
        series_arg(evaluator, call, &bootstrap_ctx)?
    } else {
        Vec::new()
    };

    Ok(originals
        .into_iter()
        .map(|s| {
            let step = s.step().max(1);
            let (points, name) = match &window {
                Window::Points(n) => (*n, format!("movingAverage({},{})", s.name, format_g(*n as f64))),
                Window::Seconds(seconds, text) => (
                    (*seconds / step) as usize,
                    format!("movingAverage({},\"{}\")", s.name, text),
                ),
            };
            let source = bootstraps.iter().find(|b| b.name == s.name).unwrap_or(&s);
            let grid = TimeInfo::new(s.start() - points as i64 * step, s.end(), step);
            let extended = resample(source, grid);
            let values = (0..s.len())
                .map(|i| {
                    let window = extended.get(i..i + points).unwrap_or(&[]);
                    mean(window)
                })
                .collect();
            Series { values, ..s }.renamed(name)
        })
        .collect())
}

/// Splits the series argument into groups keyed by one name segment and
/// folds each group with the named callback, e.g. `"sumSeries"`.
pub(super) fn group_by_node(
    evaluator: &mut Evaluator<'_>,
    call: &CallSite<'_>,
    ctx: &RequestContext,
) -> Result<Vec<Series>, QueryError> {
    let args = scalar_args(evaluator, call, ctx)?;
    let node = args.integer(1, "nodeNum")?;
    let callback = args.string(2, "callback")?;
    let def = *evaluator
        .registry()
        .get(&callback)
        .ok_or_else(|| QueryError::evaluation("groupByNode", format!("unknown callback {:?}", callback)))?;
    if matches!(def.implementation, super::Implementation::Contextual(_)) {
        return Err(QueryError::evaluation(
            "groupByNode",
            format!("callback {} cannot be used per group", callback),
        ));
    }

    let series = series_arg(evaluator, call, ctx)?;
    let mut keys: Vec<String> = Vec::new();
    let mut groups: Vec<Vec<Series>> = Vec::new();
    for s in series {
        let pieces: Vec<&str> = s.name.split('.').collect();
        let key = usize::try_from(node)
            .ok()
            .and_then(|n| pieces.get(n))
            .ok_or_else(|| QueryError::evaluation("groupByNode", format!("node {} out of range for {:?}", node, s.name)))?
            .to_string();
        match keys.iter().position(|k| *k == key) {
            Some(i) => groups[i].push(s),
            None => {
                keys.push(key);
                groups.push(vec![s]);
            }
        }
    }

    let mut out = Vec::with_capacity(keys.len());
    for (key, members) in keys.into_iter().zip(groups) {
        let args = Args::new(def.name, vec![EvalValue::Series(members)], Vec::new(), evaluator.max_grid_step());
        if let Some(first) = def.implementation.apply(args)?.into_iter().next() {
            out.push(Series { name: key, ..first });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_parse_with_units_and_sign() {
        assert_eq!(parse_time_offset("7d"), Ok(7 * DAY));
        assert_eq!(parse_time_offset("-1h"), Ok(-HOUR));
        assert_eq!(parse_time_offset("+1h30min"), Ok(HOUR + 30 * MINUTE));
        assert_eq!(parse_time_offset("2weeks"), Ok(14 * DAY));
        assert_eq!(parse_time_offset("1mon"), Ok(30 * DAY));
        assert_eq!(parse_time_offset("1y"), Ok(365 * DAY));
        assert_eq!(parse_time_offset("90s"), Ok(90));
        assert_eq!(parse_time_offset(""), Ok(0));
        assert!(parse_time_offset("5").is_err());
        assert!(parse_time_offset("5parsecs").is_err());
        assert!(parse_time_offset("yesterday").is_err());
    }

    #[test]
    fn mean_ignores_gaps() {
        assert_eq!(mean(&[Some(1.0), None, Some(3.0)]), Some(2.0));
        assert_eq!(mean(&[None, None]), None);
        assert_eq!(mean(&[]), None);
    }
}
