//! Series selection, sorting and value filtering.

use super::{format_d, Args};
use crate::error::QueryError;
use crate::types::{Point, Series, Value};
use regex::Regex;
use std::cmp::Ordering;

/// Last present value.
fn last(s: &Series) -> Point {
    s.values.iter().rev().find_map(|v| *v)
}

fn average(s: &Series) -> Point {
    let (sum, n) = s.present().fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    (n > 0).then(|| sum / n as Value)
}

fn maximum(s: &Series) -> Point {
    s.present().reduce(Value::max)
}

fn minimum(s: &Series) -> Point {
    s.present().reduce(Value::min)
}

fn total(s: &Series) -> Point {
    s.present().reduce(|a, b| a + b)
}

/// Stable ascending sort where gaps order before every value.
fn sort_by<F>(series: &mut [Series], key: F)
where
    F: Fn(&Series) -> Point,
{
    series.sort_by(|a, b| key(a).partial_cmp(&key(b)).unwrap_or(Ordering::Equal));
}

fn top(mut args: Args, key: fn(&Series) -> Point, highest: bool) -> Result<Vec<Series>, QueryError> {
    let mut series = args.series_list(0, "seriesList")?;
    let n = args.opt_integer(1, "n")?.unwrap_or(1).max(0) as usize;
    sort_by(&mut series, key);
    if highest {
        let skip = series.len().saturating_sub(n);
        Ok(series.split_off(skip))
    } else {
        series.truncate(n);
        Ok(series)
    }
}

pub(super) fn highest_current(args: Args) -> Result<Vec<Series>, QueryError> {
    top(args, last, true)
}

pub(super) fn lowest_current(args: Args) -> Result<Vec<Series>, QueryError> {
    top(args, last, false)
}

pub(super) fn highest_average(args: Args) -> Result<Vec<Series>, QueryError> {
    top(args, average, true)
}

pub(super) fn lowest_average(args: Args) -> Result<Vec<Series>, QueryError> {
    top(args, average, false)
}

/// The `n` series with the largest maximum, largest first.
pub(super) fn highest_max(args: Args) -> Result<Vec<Series>, QueryError> {
    let mut series = top(args, maximum, true)?;
    series.reverse();
    Ok(series)
}

/// Keeps series whose `key` satisfies `keep` against the threshold. Series
/// without any value never match.
fn retain(mut args: Args, key: fn(&Series) -> Point, keep: fn(Value, Value) -> bool) -> Result<Vec<Series>, QueryError> {
    let mut series = args.series_list(0, "seriesList")?;
    let n = args.number(1, "n")?;
    series.retain(|s| key(s).is_some_and(|k| keep(k, n)));
    Ok(series)
}

pub(super) fn current_above(args: Args) -> Result<Vec<Series>, QueryError> {
    retain(args, last, |k, n| k >= n)
}

pub(super) fn current_below(args: Args) -> Result<Vec<Series>, QueryError> {
    retain(args, last, |k, n| k <= n)
}

pub(super) fn average_above(args: Args) -> Result<Vec<Series>, QueryError> {
    retain(args, average, |k, n| k >= n)
}

pub(super) fn average_below(args: Args) -> Result<Vec<Series>, QueryError> {
    retain(args, average, |k, n| k <= n)
}

pub(super) fn maximum_above(args: Args) -> Result<Vec<Series>, QueryError> {
    retain(args, maximum, |k, n| k > n)
}

pub(super) fn maximum_below(args: Args) -> Result<Vec<Series>, QueryError> {
    retain(args, maximum, |k, n| k <= n)
}

pub(super) fn minimum_above(args: Args) -> Result<Vec<Series>, QueryError> {
    retain(args, minimum, |k, n| k > n)
}

pub(super) fn minimum_below(args: Args) -> Result<Vec<Series>, QueryError> {
    retain(args, minimum, |k, n| k <= n)
}

fn remove_values(mut args: Args, function: &str, drop: fn(Value, Value) -> bool) -> Result<Vec<Series>, QueryError> {
    let series = args.series_list(0, "seriesList")?;
    let n = args.number(1, "n")?;
    Ok(series
        .into_iter()
        .map(|mut s| {
            for v in s.values.iter_mut() {
                if v.is_some_and(|v| drop(v, n)) {
                    *v = None;
                }
            }
            let name = format!("{}({}, {})", function, s.name, format_d(n));
            s.renamed(name)
        })
        .collect())
}

pub(super) fn remove_above_value(args: Args) -> Result<Vec<Series>, QueryError> {
    remove_values(args, "removeAboveValue", |v, n| v > n)
}

pub(super) fn remove_below_value(args: Args) -> Result<Vec<Series>, QueryError> {
    remove_values(args, "removeBelowValue", |v, n| v < n)
}

pub(super) fn remove_empty_series(mut args: Args) -> Result<Vec<Series>, QueryError> {
    let mut series = args.series_list(0, "seriesList")?;
    series.retain(|s| s.present().next().is_some());
    Ok(series)
}

pub(super) fn limit(mut args: Args) -> Result<Vec<Series>, QueryError> {
    let mut series = args.series_list(0, "seriesList")?;
    let n = args.integer(1, "n")?;
    series.truncate(n.max(0) as usize);
    Ok(series)
}

pub(super) fn sort_by_name(mut args: Args) -> Result<Vec<Series>, QueryError> {
    let mut series = args.series_list(0, "seriesList")?;
    series.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(series)
}

/// Largest total first.
pub(super) fn sort_by_total(mut args: Args) -> Result<Vec<Series>, QueryError> {
    let mut series = args.series_list(0, "seriesList")?;
    series.sort_by(|a, b| total(b).partial_cmp(&total(a)).unwrap_or(Ordering::Equal));
    Ok(series)
}

pub(super) fn sort_by_maxima(mut args: Args) -> Result<Vec<Series>, QueryError> {
    let mut series = args.series_list(0, "seriesList")?;
    sort_by(&mut series, maximum);
    Ok(series)
}

pub(super) fn sort_by_minima(mut args: Args) -> Result<Vec<Series>, QueryError> {
    let mut series = args.series_list(0, "seriesList")?;
    sort_by(&mut series, minimum);
    Ok(series)
}

fn by_name_regex(mut args: Args, keep_matches: bool) -> Result<Vec<Series>, QueryError> {
    let mut series = args.series_list(0, "seriesList")?;
    let pattern = args.string(1, "pattern")?;
    let regex = Regex::new(&pattern)
        .map_err(|e| QueryError::evaluation(args.function(), format!("invalid pattern {:?}: {}", pattern, e)))?;
    series.retain(|s| regex.is_match(&s.name) == keep_matches);
    Ok(series)
}

pub(super) fn exclude(args: Args) -> Result<Vec<Series>, QueryError> {
    by_name_regex(args, false)
}

pub(super) fn grep(args: Args) -> Result<Vec<Series>, QueryError> {
    by_name_regex(args, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::EvalValue;
    use crate::types::TimeInfo;

    fn list() -> EvalValue {
        let s = |name: &str, values: Vec<Point>| Series::new(name, TimeInfo::new(0, 180, 60), values);
        EvalValue::Series(vec![
            s("web.a", vec![Some(1.0), Some(9.0), Some(2.0)]),
            s("web.b", vec![Some(5.0), Some(6.0), None]),
            s("db.c", vec![None, None, None]),
            s("web.d", vec![Some(3.0), Some(3.0), Some(3.0)]),
        ])
    }

    fn run(f: fn(Args) -> Result<Vec<Series>, QueryError>, extra: Vec<EvalValue>) -> Vec<String> {
        let mut values = vec![list()];
        values.extend(extra);
        f(Args::new("test", values, Vec::new(), 86_400))
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect()
    }

    #[test]
    fn highest_and_lowest_pick_by_key() {
        assert_eq!(run(highest_current, vec![EvalValue::Number(2.0)]), vec!["web.d", "web.b"]);
        assert_eq!(run(lowest_current, vec![]), vec!["db.c"]);
        assert_eq!(run(highest_max, vec![EvalValue::Number(2.0)]), vec!["web.a", "web.b"]);
        assert_eq!(run(highest_average, vec![]), vec!["web.b"]);
    }

    #[test]
    fn thresholds_skip_empty_series() {
        assert_eq!(run(current_above, vec![EvalValue::Number(3.0)]), vec!["web.b", "web.d"]);
        assert_eq!(run(maximum_below, vec![EvalValue::Number(6.0)]), vec!["web.b", "web.d"]);
        assert_eq!(run(minimum_above, vec![EvalValue::Number(2.0)]), vec!["web.b", "web.d"]);
        assert_eq!(run(average_below, vec![EvalValue::Number(100.0)]).len(), 3);
    }

    #[test]
    fn remove_value_names_truncate_threshold() {
        let out = remove_above_value(Args::new("removeAboveValue", vec![list(), EvalValue::Number(4.5)], Vec::new(), 86_400))
            .unwrap();
        assert_eq!(out[0].name, "removeAboveValue(web.a, 4)");
        assert_eq!(out[0].values, vec![Some(1.0), None, Some(2.0)]);
    }

    #[test]
    fn sorting_and_selection() {
        assert_eq!(run(sort_by_name, vec![]), vec!["db.c", "web.a", "web.b", "web.d"]);
        assert_eq!(run(sort_by_total, vec![]), vec!["web.a", "web.b", "web.d", "db.c"]);
        assert_eq!(run(sort_by_minima, vec![]), vec!["db.c", "web.a", "web.d", "web.b"]);
        assert_eq!(run(remove_empty_series, vec![]).len(), 3);
        assert_eq!(run(limit, vec![EvalValue::Number(1.0)]), vec!["web.a"]);
    }

    #[test]
    fn regex_filters() {
        assert_eq!(run(grep, vec![EvalValue::Str("^web\\.[ab]".into())]), vec!["web.a", "web.b"]);
        assert_eq!(run(exclude, vec![EvalValue::Str("web".into())]), vec!["db.c"]);
        let err = by_name_regex(Args::new("grep", vec![list(), EvalValue::Str("(".into())], Vec::new(), 86_400), true);
        assert!(matches!(err, Err(QueryError::EvaluationError { .. })));
    }
}
