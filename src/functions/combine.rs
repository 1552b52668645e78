//! Functions that fold several series into one.

use super::{format_path_expressions, Args};
use crate::align::align;
use crate::consolidate::reduce;
use crate::error::QueryError;
use crate::types::{ConsolidationFunc, Point, Series, Value};
use std::collections::HashMap;

/// Row reduction applied by a combining function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Combiner {
    Sum,
    Average,
    Min,
    Max,
    Diff,
    Multiply,
    Range,
    Stddev,
    Count,
}

impl Combiner {
    /// The canonical function name used in output series names.
    pub fn function_name(&self) -> &'static str {
        match self {
            Combiner::Sum => "sumSeries",
            Combiner::Average => "averageSeries",
            Combiner::Min => "minSeries",
            Combiner::Max => "maxSeries",
            Combiner::Diff => "diffSeries",
            Combiner::Multiply => "multiplySeries",
            Combiner::Range => "rangeOfSeries",
            Combiner::Stddev => "stddevSeries",
            Combiner::Count => "countSeries",
        }
    }

    /// Reduces one aligned row. Gaps are ignored except by `Multiply`, where
    /// any gap makes the product a gap.
    pub fn reduce_row(&self, row: &[Point]) -> Point {
        match self {
            Combiner::Sum => reduce(ConsolidationFunc::Sum, row),
            Combiner::Average => reduce(ConsolidationFunc::Avg, row),
            Combiner::Min => reduce(ConsolidationFunc::Min, row),
            Combiner::Max => reduce(ConsolidationFunc::Max, row),
            Combiner::Count => Some(row.len() as Value),
            Combiner::Diff => {
                let mut present = row.iter().filter_map(|v| *v);
                let first = present.next()?;
                Some(present.fold(first, |acc, v| acc - v))
            }
            Combiner::Multiply => row.iter().try_fold(1.0, |acc, v| v.map(|v| acc * v)),
            Combiner::Range => {
                let max = reduce(ConsolidationFunc::Max, row)?;
                let min = reduce(ConsolidationFunc::Min, row)?;
                Some(max - min)
            }
            Combiner::Stddev => {
                let present: Vec<Value> = row.iter().filter_map(|v| *v).collect();
                if present.is_empty() {
                    return None;
                }
                let n = present.len() as Value;
                let mean = present.iter().sum::<Value>() / n;
                let variance = present.iter().map(|v| (v - mean) * (v - mean)).sum::<Value>() / n;
                Some(variance.sqrt())
            }
        }
    }
}

/// Aligns `series` onto one grid and folds every row with `combiner`.
///
/// An empty input yields an empty list. `Multiply` over a single series
/// returns it unchanged.
pub fn combine(combiner: Combiner, series: Vec<Series>, max_grid_step: i64) -> Vec<Series> {
    if series.is_empty() {
        return Vec::new();
    }
    let aligned = align(series, max_grid_step);
    if combiner == Combiner::Multiply && aligned.len() == 1 {
        return aligned;
    }

    let name = match combiner {
        Combiner::Multiply => format!(
            "{}({})",
            combiner.function_name(),
            aligned.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(",")
        ),
        _ => format!("{}({})", combiner.function_name(), format_path_expressions(&aligned)),
    };

    let time_info = aligned[0].time_info;
    let width = aligned.iter().map(Series::len).max().unwrap_or(0);
    let mut row = Vec::with_capacity(aligned.len());
    let values = (0..width)
        .map(|i| {
            row.clear();
            row.extend(aligned.iter().map(|s| s.values.get(i).copied().flatten()));
            combiner.reduce_row(&row)
        })
        .collect();

    vec![Series::new(name, time_info, values)]
}

pub(super) fn run(combiner: Combiner, mut args: Args) -> Result<Vec<Series>, QueryError> {
    let series = args.series_lists_from(0)?;
    Ok(combine(combiner, series, args.max_grid_step()))
}

pub(super) fn group(mut args: Args) -> Result<Vec<Series>, QueryError> {
    args.series_lists_from(0)
}

/// Drops the given dot-separated positions from `name`.
fn without_positions(name: &str, positions: &[i64]) -> String {
    name.split('.')
        .enumerate()
        .filter(|(i, _)| !positions.contains(&(*i as i64)))
        .map(|(_, segment)| segment)
        .collect::<Vec<_>>()
        .join(".")
}

fn combine_with_wildcards(combiner: Combiner, mut args: Args) -> Result<Vec<Series>, QueryError> {
    let series = args.series_list(0, "seriesList")?;
    let positions = args.integers_from(1, "position")?;

    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<Series>> = HashMap::new();
    for s in series {
        let key = without_positions(&s.name, &positions);
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(s);
    }

    let mut out = Vec::with_capacity(order.len());
    for key in order {
        let members = groups.remove(&key).unwrap_or_default();
        if let Some(combined) = combine(combiner, members, args.max_grid_step()).pop() {
            out.push(combined.renamed(key));
        }
    }
    Ok(out)
}

pub(super) fn sum_with_wildcards(args: Args) -> Result<Vec<Series>, QueryError> {
    combine_with_wildcards(Combiner::Sum, args)
}

pub(super) fn average_with_wildcards(args: Args) -> Result<Vec<Series>, QueryError> {
    combine_with_wildcards(Combiner::Average, args)
}

/// Divides every dividend series by the single divisor series. Gaps and
/// division by zero produce gaps.
pub(super) fn divide_series(mut args: Args) -> Result<Vec<Series>, QueryError> {
    let dividends = args.series_list(0, "dividendSeriesList")?;
    let mut divisors = args.series_list(1, "divisorSeriesList")?;
    if divisors.len() != 1 {
        return Err(QueryError::evaluation(
            "divideSeries",
            format!("divisor must reference exactly 1 series, got {}", divisors.len()),
        ));
    }
    let divisor = divisors.remove(0);

    let mut out = Vec::with_capacity(dividends.len());
    for dividend in dividends {
        let name = format!("divideSeries({},{})", dividend.name, divisor.name);
        let mut pair = align(vec![dividend, divisor.clone()], args.max_grid_step());
        let (Some(den), Some(num)) = (pair.pop(), pair.pop()) else {
            continue;
        };
        let values = num
            .values
            .iter()
            .zip(den.values.iter())
            .map(|(a, b)| match (a, b) {
                (Some(a), Some(b)) if *b != 0.0 => Some(a / b),
                _ => None,
            })
            .collect();
        out.push(Series::new(name, num.time_info, values));
    }
    Ok(out)
}
