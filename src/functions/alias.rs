//! Legend renaming. These change only the display name; the path
//! expression is left as is.

use super::Args;
use crate::error::QueryError;
use crate::types::Series;
use regex::Regex;
use std::sync::OnceLock;

pub(super) fn alias(mut args: Args) -> Result<Vec<Series>, QueryError> {
    let mut series = args.series_list(0, "seriesList")?;
    let new_name = args.string(1, "newName")?;
    for s in series.iter_mut() {
        s.name = new_name.clone();
    }
    Ok(series)
}

/// Strips enclosing function calls, leaving the innermost metric path.
fn metric_of(name: &str) -> Option<&str> {
    static METRIC: OnceLock<Option<Regex>> = OnceLock::new();
    let regex = METRIC
        .get_or_init(|| Regex::new(r"(?:.*\()?(?P<name>[-\w*\.]+)(?:,|\)?.*)?").ok())
        .as_ref()?;
    regex.captures(name)?.name("name").map(|m| m.as_str())
}

/// Picks `index` from `pieces`; negative indices count from the end.
fn node_at<'a>(pieces: &[&'a str], index: i64) -> Option<&'a str> {
    let len = pieces.len() as i64;
    let resolved = if index < 0 { len + index } else { index };
    if (0..len).contains(&resolved) {
        Some(pieces[resolved as usize])
    } else {
        None
    }
}

pub(super) fn alias_by_node(mut args: Args) -> Result<Vec<Series>, QueryError> {
    let mut series = args.series_list(0, "seriesList")?;
    let nodes = args.integers_from(1, "nodes")?;
    for s in series.iter_mut() {
        let metric = metric_of(&s.name)
            .ok_or_else(|| QueryError::evaluation("aliasByNode", format!("no metric path in {:?}", s.name)))?;
        let pieces: Vec<&str> = metric.split('.').collect();
        let picked = nodes
            .iter()
            .map(|&n| {
                node_at(&pieces, n).ok_or_else(|| {
                    QueryError::evaluation("aliasByNode", format!("node {} out of range for {:?}", n, metric))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        s.name = picked.join(".");
    }
    Ok(series)
}

pub(super) fn alias_by_metric(mut args: Args) -> Result<Vec<Series>, QueryError> {
    let mut series = args.series_list(0, "seriesList")?;
    for s in series.iter_mut() {
        let last = s.name.rsplit('.').next().unwrap_or("");
        let metric = last.split(',').next().unwrap_or("").to_string();
        s.name = metric;
    }
    Ok(series)
}

/// Rewrites `\1` and `\g<name>` backreferences into `${1}` / `${name}` and
/// escapes literal dollar signs.
fn replacement_template(replace: &str) -> String {
    let mut out = String::with_capacity(replace.len());
    let mut chars = replace.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '$' => out.push_str("$$"),
            '\\' => match chars.peek().copied() {
                Some(d) if d.is_ascii_digit() => {
                    let mut group = String::new();
                    while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                        group.push(d);
                        chars.next();
                    }
                    out.push_str(&format!("${{{}}}", group));
                }
                Some('g') => {
                    chars.next();
                    if chars.peek() == Some(&'<') {
                        chars.next();
                        let group: String = chars.by_ref().take_while(|c| *c != '>').collect();
                        out.push_str(&format!("${{{}}}", group));
                    } else {
                        out.push_str("\\g");
                    }
                }
                Some('\\') => {
                    chars.next();
                    out.push('\\');
                }
                _ => out.push('\\'),
            },
            _ => out.push(c),
        }
    }
    out
}

pub(super) fn alias_sub(mut args: Args) -> Result<Vec<Series>, QueryError> {
    let mut series = args.series_list(0, "seriesList")?;
    let search = args.string(1, "search")?;
    let replace = replacement_template(&args.string(2, "replace")?);
    let regex = Regex::new(&search)
        .map_err(|e| QueryError::evaluation("aliasSub", format!("invalid pattern {:?}: {}", search, e)))?;
    for s in series.iter_mut() {
        s.name = regex.replace_all(&s.name, replace.as_str()).into_owned();
    }
    Ok(series)
}
