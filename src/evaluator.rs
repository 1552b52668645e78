//! Call graph evaluation with a request-scoped fetch cache.

use crate::align::align;
use crate::engine::EngineConfig;
use crate::error::QueryError;
use crate::fetch::{FetchPlanner, FetchRequest};
use crate::finder::FindQuery;
use crate::functions::{format_g, Args, FunctionDef, FunctionRegistry, Implementation, ParamType};
use crate::node::LeafNode;
use crate::store::Store;
use crate::telemetry::{query_metrics, QueryEvent};
use crate::types::{RawSeries, Series, Timestamp};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::time::Instant;

/// An already parsed target: path expressions at the leaves, function calls
/// at the inner nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Path(String),
    Call {
        name: String,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Number(f64),
    Str(String),
    Bool(bool),
}

impl Expr {
    pub fn path(path: impl Into<String>) -> Self {
        Expr::Path(path.into())
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            name: name.into(),
            args,
            kwargs: Vec::new(),
        }
    }

    pub fn call_with_kwargs(name: impl Into<String>, args: Vec<Expr>, kwargs: Vec<(String, Expr)>) -> Self {
        Expr::Call {
            name: name.into(),
            args,
            kwargs,
        }
    }

    pub fn number(value: f64) -> Self {
        Expr::Number(value)
    }

    pub fn string(value: impl Into<String>) -> Self {
        Expr::Str(value.into())
    }

    /// Every path expression in the graph, depth-first, duplicates included.
    pub fn paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Path(p) => out.push(p),
            Expr::Call { args, kwargs, .. } => {
                for arg in args {
                    arg.collect_paths(out);
                }
                for (_, arg) in kwargs {
                    arg.collect_paths(out);
                }
            }
            Expr::Number(_) | Expr::Str(_) | Expr::Bool(_) => {}
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Path(p) => f.write_str(p),
            Expr::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Expr::Number(n) => f.write_str(&format_g(*n)),
            Expr::Str(s) => write!(f, "\"{}\"", s.replace('"', "\\\"")),
            Expr::Bool(b) => write!(f, "{}", b),
            Expr::Call { name, args, kwargs } => {
                write!(f, "{}(", name)?;
                let mut first = true;
                for arg in args {
                    if !first {
                        f.write_str(",")?;
                    }
                    first = false;
                    write!(f, "{}", arg)?;
                }
                for (key, arg) in kwargs {
                    if !first {
                        f.write_str(",")?;
                    }
                    first = false;
                    write!(f, "{}={}", key, arg)?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Result of evaluating one expression.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalValue {
    Series(Vec<Series>),
    Number(f64),
    Str(String),
    Bool(bool),
}

impl EvalValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            EvalValue::Series(_) => "series list",
            EvalValue::Number(_) => "number",
            EvalValue::Str(_) => "string",
            EvalValue::Bool(_) => "boolean",
        }
    }

    /// The series list, or an `EvaluationError` attributed to `function`.
    pub fn into_series(self, function: &str) -> Result<Vec<Series>, QueryError> {
        match self {
            EvalValue::Series(series) => Ok(series),
            other => Err(QueryError::evaluation(
                function,
                format!("expected a series list, got {}", other.type_name()),
            )),
        }
    }
}

/// The ambient parameters of one evaluation: window, point budget and
/// deadline. Passed explicitly to every function that reads them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    pub start: Timestamp,
    pub end: Timestamp,
    pub max_points: Option<usize>,
    pub deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        RequestContext {
            start,
            end,
            max_points: None,
            deadline: None,
        }
    }

    pub fn with_max_points(mut self, max_points: Option<usize>) -> Self {
        self.max_points = max_points;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_start(mut self, start: Timestamp) -> Self {
        self.start = start;
        self
    }

    /// The same window moved by `delta` seconds.
    pub fn shifted(self, delta: i64) -> Self {
        RequestContext {
            start: self.start + delta,
            end: self.end + delta,
            ..self
        }
    }
}

/// An unevaluated call, handed to functions that drive evaluation themselves.
#[derive(Debug, Clone, Copy)]
pub struct CallSite<'a> {
    pub function: &'static str,
    pub args: &'a [Expr],
    pub kwargs: &'a [(String, Expr)],
}

impl<'a> CallSite<'a> {
    /// The argument at `index`, or the keyword argument `name`.
    pub fn arg(&self, index: usize, name: &str) -> Option<&'a Expr> {
        self.args
            .get(index)
            .or_else(|| self.kwargs.iter().find(|(k, _)| k == name).map(|(_, v)| v))
    }
}

type CacheKey = (String, Timestamp, Timestamp);

/// Evaluates call graphs for one request.
///
/// Path expressions are fetched at most once per window: the first reference
/// populates the cache, later references reuse it.
#[derive(Debug)]
pub struct Evaluator<'a> {
    store: &'a Store,
    registry: &'a FunctionRegistry,
    config: &'a EngineConfig,
    cache: HashMap<CacheKey, Vec<Series>>,
    served: HashSet<CacheKey>,
    errors: Vec<QueryError>,
    fetch_cycles: usize,
}

impl<'a> Evaluator<'a> {
    pub fn new(store: &'a Store, registry: &'a FunctionRegistry, config: &'a EngineConfig) -> Self {
        Evaluator {
            store,
            registry,
            config,
            cache: HashMap::new(),
            served: HashSet::new(),
            errors: Vec::new(),
            fetch_cycles: 0,
        }
    }

    pub fn registry(&self) -> &'a FunctionRegistry {
        self.registry
    }

    pub fn max_grid_step(&self) -> i64 {
        self.config.max_grid_step
    }

    /// Non-fatal errors collected so far.
    pub fn errors(&self) -> &[QueryError] {
        &self.errors
    }

    pub fn take_errors(&mut self) -> Vec<QueryError> {
        std::mem::take(&mut self.errors)
    }

    /// Number of path expressions resolved and fetched so far.
    pub fn fetch_cycles(&self) -> usize {
        self.fetch_cycles
    }

    /// Resolves and fetches every uncached path expression in `exprs` over
    /// `ctx` in a single planner pass.
    ///
    /// All patterns are compiled first, so an invalid pattern fails before
    /// any backend is called. Leaves shared between expressions are fetched
    /// once.
    ///
    /// # Errors
    /// `InvalidPattern`, `InvalidTimeRange` and `NoBackendsAvailable` abort;
    /// per-finder and per-leaf failures are collected in [`Evaluator::errors`].
    pub fn prefetch(&mut self, exprs: &[Expr], ctx: &RequestContext) -> Result<(), QueryError> {
        let paths: Vec<&str> = exprs.iter().flat_map(Expr::paths).collect();
        self.prefetch_paths(&paths, ctx)
    }

    fn prefetch_paths(&mut self, paths: &[&str], ctx: &RequestContext) -> Result<(), QueryError> {
        if ctx.start >= ctx.end {
            return Err(QueryError::InvalidTimeRange {
                start: ctx.start,
                end: ctx.end,
            });
        }

        let mut pending: Vec<(String, FindQuery)> = Vec::new();
        for &path in paths {
            let key = (path.to_string(), ctx.start, ctx.end);
            if self.cache.contains_key(&key) || pending.iter().any(|(p, _)| p == path) {
                continue;
            }
            pending.push((path.to_string(), FindQuery::new(path, Some(ctx.start), Some(ctx.end))?));
        }
        if pending.is_empty() {
            return Ok(());
        }

        let mut leaves: BTreeMap<String, LeafNode> = BTreeMap::new();
        let mut members: Vec<Vec<String>> = Vec::with_capacity(pending.len());
        for (_, query) in &pending {
            let found = self.store.find(query, ctx.deadline)?;
            let names = found
                .leaves()
                .map(|leaf| {
                    let name = leaf.path().to_string();
                    leaves.entry(name.clone()).or_insert_with(|| leaf.clone());
                    name
                })
                .collect();
            members.push(names);
            self.errors.extend(found.errors);
        }

        let mut fetched: HashMap<String, RawSeries> = HashMap::new();
        if !leaves.is_empty() {
            let ordered: Vec<LeafNode> = leaves.into_values().collect();
            let request = FetchRequest::new(ctx.start, ctx.end)
                .with_max_points(ctx.max_points)
                .with_deadline(ctx.deadline)
                .with_fallback_step(self.config.fallback_step);
            let outcome = FetchPlanner::new(self.store).fetch(&ordered, &request)?;
            self.errors.extend(outcome.errors);
            fetched.extend(outcome.series.into_iter().map(|raw| (raw.path.to_string(), raw)));
        }

        for ((path, _), names) in pending.into_iter().zip(members) {
            let series: Vec<Series> = names
                .iter()
                .filter_map(|name| fetched.get(name))
                .map(|raw| {
                    let func = self.config.consolidation_for(raw.path.as_str());
                    Series::from_raw(raw.clone(), &path, func)
                })
                .collect();
            self.store.events().on_event(QueryEvent::FetchCycle {
                path_expression: path.clone(),
                leaves: series.len(),
            });
            self.fetch_cycles += 1;
            self.cache
                .insert((path, ctx.start, ctx.end), align(series, self.config.max_grid_step));
        }
        Ok(())
    }

    /// The series for one path expression, fetching it on first use.
    fn series_for(&mut self, path: &str, ctx: &RequestContext) -> Result<Vec<Series>, QueryError> {
        let key = (path.to_string(), ctx.start, ctx.end);
        if !self.cache.contains_key(&key) {
            self.prefetch_paths(&[path], ctx)?;
        }
        let series = self.cache.get(&key).cloned().unwrap_or_default();
        if !self.served.insert(key) {
            query_metrics::record_cache_hit();
            self.store.events().on_event(QueryEvent::CacheHit {
                path_expression: path.to_string(),
            });
        }
        Ok(series)
    }

    /// Evaluates `expr` depth-first under `ctx`.
    ///
    /// # Errors
    /// `EvaluationError` for unknown functions and arity or type violations,
    /// plus anything fatal raised while fetching.
    pub fn evaluate(&mut self, expr: &Expr, ctx: &RequestContext) -> Result<EvalValue, QueryError> {
        match expr {
            Expr::Path(path) => Ok(EvalValue::Series(self.series_for(path, ctx)?)),
            Expr::Number(n) => Ok(EvalValue::Number(*n)),
            Expr::Str(s) => Ok(EvalValue::Str(s.clone())),
            Expr::Bool(b) => Ok(EvalValue::Bool(*b)),
            Expr::Call { name, args, kwargs } => {
                let def = *self
                    .registry
                    .get(name)
                    .ok_or_else(|| QueryError::evaluation(name, "unknown function"))?;
                let named: Vec<&str> = kwargs.iter().map(|(k, _)| k.as_str()).collect();
                def.check_arity(args.len(), &named)?;

                let call = CallSite {
                    function: def.name,
                    args,
                    kwargs,
                };
                let series = match def.implementation {
                    Implementation::Contextual(f) => f(self, &call, ctx)?,
                    implementation => {
                        let args = self.bind(&def, &call, ctx)?;
                        implementation.apply(args)?
                    }
                };
                Ok(EvalValue::Series(series))
            }
        }
    }

    /// Fetches and evaluates `expr`, which must produce a series list.
    pub fn evaluate_series(&mut self, expr: &Expr, ctx: &RequestContext) -> Result<Vec<Series>, QueryError> {
        self.prefetch(std::slice::from_ref(expr), ctx)?;
        let value = self.evaluate(expr, ctx)?;
        value.into_series(&expr.to_string())
    }

    /// Evaluates every argument of `call` and checks it against the schema.
    fn bind(&mut self, def: &FunctionDef, call: &CallSite<'_>, ctx: &RequestContext) -> Result<Args, QueryError> {
        let mut positional = Vec::with_capacity(call.args.len());
        for (i, expr) in call.args.iter().enumerate() {
            let value = self.evaluate(expr, ctx)?;
            check_type(def, def.param(Some(i), None), &value)?;
            positional.push(value);
        }
        let mut named = Vec::with_capacity(call.kwargs.len());
        for (name, expr) in call.kwargs {
            let value = self.evaluate(expr, ctx)?;
            check_type(def, def.param(None, Some(name)), &value)?;
            named.push((name.clone(), value));
        }
        Ok(Args::new(def.name, positional, named, self.config.max_grid_step))
    }
}

fn check_type(def: &FunctionDef, param: Option<&crate::functions::Param>, value: &EvalValue) -> Result<(), QueryError> {
    match param {
        Some(param) if !param.accepts(value) => Err(QueryError::evaluation(
            def.name,
            format!(
                "{} must be {}, got {}",
                param.name,
                expected_name(param.ty),
                value.type_name()
            ),
        )),
        _ => Ok(()),
    }
}

fn expected_name(ty: ParamType) -> &'static str {
    match ty {
        ParamType::SeriesList => "a series list",
        ParamType::Number => "a number",
        ParamType::Integer => "an integer",
        ParamType::String => "a string",
        ParamType::Boolean => "a boolean",
        ParamType::SeriesOrNumber => "a series list or a number",
        ParamType::NumberOrString => "a number or a time offset",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trips_target_syntax() {
        let expr = Expr::call(
            "sumSeries",
            vec![
                Expr::call("scale", vec![Expr::path("a.*"), Expr::number(2.0)]),
                Expr::call_with_kwargs(
                    "timeShift",
                    vec![Expr::path("b.c"), Expr::string("1d")],
                    vec![("resetEnd".into(), Expr::Bool(false))],
                ),
                Expr::number(0.25),
            ],
        );
        assert_eq!(
            expr.to_string(),
            "sumSeries(scale(a.*,2),timeShift(b.c,\"1d\",resetEnd=false),0.25)"
        );
        assert_eq!(expr.paths(), vec!["a.*", "b.c"]);
    }

    #[test]
    fn call_site_falls_back_to_keywords() {
        let args = [Expr::path("x")];
        let kwargs = [("windowSize".to_string(), Expr::number(5.0))];
        let call = CallSite {
            function: "movingAverage",
            args: &args,
            kwargs: &kwargs,
        };
        assert_eq!(call.arg(0, "seriesList"), Some(&Expr::path("x")));
        assert_eq!(call.arg(1, "windowSize"), Some(&Expr::number(5.0)));
        assert_eq!(call.arg(2, "other"), None);
    }

    #[test]
    fn shifted_context_keeps_limits() {
        let ctx = RequestContext::new(1000, 2000).with_max_points(Some(10));
        let shifted = ctx.shifted(-500);
        assert_eq!((shifted.start, shifted.end, shifted.max_points), (500, 1500, Some(10)));
        assert_eq!(ctx.with_start(0).end, 2000);
    }

    #[test]
    fn into_series_rejects_scalars() {
        assert!(matches!(
            EvalValue::Number(1.0).into_series("target"),
            Err(QueryError::EvaluationError { .. })
        ));
    }
}
