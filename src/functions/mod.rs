//! Render function library.
//!
//! Functions are registered once, in a static table, as [`FunctionDef`]s: a
//! name, a [`FunctionKind`], a parameter schema and an [`Implementation`]. The
//! evaluator checks arity against the schema, evaluates arguments depth-first
//! and hands the function an [`Args`] bundle with typed accessors.

mod alias;
mod combine;
mod context;
mod filter;
mod transform;

pub use combine::{combine, Combiner};
pub use context::parse_time_offset;

use crate::error::QueryError;
use crate::evaluator::{CallSite, EvalValue, Evaluator, RequestContext};
use crate::types::Series;
use std::collections::HashMap;
use std::fmt;

/// How a function consumes its series arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionKind {
    /// Variadic series lists folded into one series.
    Combine,
    /// One series list plus scalar parameters.
    Transform,
    /// Two series lists combined pairwise.
    Pair,
    /// Needs the evaluator itself (re-fetching or registry access).
    Contextual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    SeriesList,
    Number,
    Integer,
    String,
    Boolean,
    /// A series list or a number.
    SeriesOrNumber,
    /// A number of points or a time offset string.
    NumberOrString,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    pub name: &'static str,
    pub ty: ParamType,
    pub required: bool,
    /// Collects every remaining positional argument.
    pub variadic: bool,
}

impl Param {
    const fn required(name: &'static str, ty: ParamType) -> Self {
        Param {
            name,
            ty,
            required: true,
            variadic: false,
        }
    }

    const fn optional(name: &'static str, ty: ParamType) -> Self {
        Param {
            name,
            ty,
            required: false,
            variadic: false,
        }
    }

    const fn variadic(name: &'static str, ty: ParamType) -> Self {
        Param {
            name,
            ty,
            required: false,
            variadic: true,
        }
    }

    /// Whether an evaluated argument has a type this parameter takes.
    pub fn accepts(&self, value: &EvalValue) -> bool {
        match (self.ty, value) {
            (ParamType::SeriesList, EvalValue::Series(_)) => true,
            (ParamType::Number, EvalValue::Number(_)) => true,
            (ParamType::Integer, EvalValue::Number(n)) => n.fract() == 0.0,
            (ParamType::String, EvalValue::Str(_)) => true,
            (ParamType::Boolean, EvalValue::Bool(_)) => true,
            (ParamType::SeriesOrNumber, EvalValue::Series(_) | EvalValue::Number(_)) => true,
            (ParamType::NumberOrString, EvalValue::Number(_) | EvalValue::Str(_)) => true,
            _ => false,
        }
    }
}

pub type SeriesFn = fn(Args) -> Result<Vec<Series>, QueryError>;
pub type ContextualFn = fn(&mut Evaluator<'_>, &CallSite<'_>, &RequestContext) -> Result<Vec<Series>, QueryError>;

#[derive(Clone, Copy)]
pub enum Implementation {
    /// Aligns every series argument and folds rows with a [`Combiner`].
    Combine(Combiner),
    Series(SeriesFn),
    Contextual(ContextualFn),
}

impl Implementation {
    /// Runs a non-contextual implementation over already evaluated arguments.
    pub(crate) fn apply(&self, args: Args) -> Result<Vec<Series>, QueryError> {
        match self {
            Implementation::Combine(combiner) => combine::run(*combiner, args),
            Implementation::Series(f) => f(args),
            Implementation::Contextual(_) => Err(QueryError::evaluation(
                args.function(),
                "contextual function called without an evaluator",
            )),
        }
    }
}

impl fmt::Debug for Implementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Implementation::Combine(c) => write!(f, "Combine({:?})", c),
            Implementation::Series(_) => f.write_str("Series(..)"),
            Implementation::Contextual(_) => f.write_str("Contextual(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FunctionDef {
    pub name: &'static str,
    pub kind: FunctionKind,
    pub params: &'static [Param],
    pub implementation: Implementation,
}

impl FunctionDef {
    /// The parameter bound to positional `index` or keyword `name`.
    pub fn param(&self, index: Option<usize>, name: Option<&str>) -> Option<&Param> {
        if let Some(name) = name {
            return self.params.iter().find(|p| p.name == name);
        }
        let index = index?;
        self.params
            .get(index)
            .or_else(|| self.params.last().filter(|p| p.variadic))
    }

    /// Validates argument counts and keyword names before anything is evaluated.
    pub fn check_arity(&self, positional: usize, named: &[&str]) -> Result<(), QueryError> {
        let variadic = self.params.iter().any(|p| p.variadic);
        if !variadic && positional > self.params.len() {
            return Err(QueryError::evaluation(
                self.name,
                format!("takes at most {} arguments, got {}", self.params.len(), positional),
            ));
        }
        for name in named {
            let Some(index) = self.params.iter().position(|p| p.name == *name) else {
                return Err(QueryError::evaluation(self.name, format!("unexpected keyword argument {}", name)));
            };
            if index < positional && !self.params[index].variadic {
                return Err(QueryError::evaluation(self.name, format!("argument {} given twice", name)));
            }
        }
        for (index, param) in self.params.iter().enumerate() {
            if param.required && index >= positional && !named.contains(&param.name) {
                return Err(QueryError::evaluation(
                    self.name,
                    format!("missing required argument {}", param.name),
                ));
            }
        }
        Ok(())
    }
}

/// Static name → function table.
#[derive(Debug, Clone)]
pub struct FunctionRegistry {
    functions: HashMap<&'static str, FunctionDef>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        FunctionRegistry::builtin()
    }
}

impl FunctionRegistry {
    /// Every built-in function.
    pub fn builtin() -> Self {
        FunctionRegistry::from_defs(BUILTINS.iter().copied())
    }

    pub fn from_defs(defs: impl IntoIterator<Item = FunctionDef>) -> Self {
        FunctionRegistry {
            functions: defs.into_iter().map(|d| (d.name, d)).collect(),
        }
    }

    /// A registry without the named functions.
    pub fn without(mut self, names: &[&str]) -> Self {
        self.functions.retain(|name, _| !names.contains(name));
        self
    }

    pub fn get(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.functions.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Evaluated arguments of one call, with typed accessors that fail with an
/// `EvaluationError` naming the function.
#[derive(Debug)]
pub struct Args {
    function: &'static str,
    positional: Vec<Option<EvalValue>>,
    named: Vec<(String, Option<EvalValue>)>,
    max_grid_step: i64,
}

impl Args {
    pub fn new(
        function: &'static str,
        positional: Vec<EvalValue>,
        named: Vec<(String, EvalValue)>,
        max_grid_step: i64,
    ) -> Self {
        Args {
            function,
            positional: positional.into_iter().map(Some).collect(),
            named: named.into_iter().map(|(k, v)| (k, Some(v))).collect(),
            max_grid_step,
        }
    }

    pub fn function(&self) -> &'static str {
        self.function
    }

    pub fn max_grid_step(&self) -> i64 {
        self.max_grid_step
    }

    pub fn positional_len(&self) -> usize {
        self.positional.len()
    }

    fn error(&self, reason: impl Into<String>) -> QueryError {
        QueryError::evaluation(self.function, reason)
    }

    fn slot(&self, index: usize, name: &str) -> Option<&EvalValue> {
        match self.positional.get(index) {
            Some(value) => value.as_ref(),
            None => self
                .named
                .iter()
                .find(|(k, _)| k == name)
                .and_then(|(_, v)| v.as_ref()),
        }
    }

    fn take_slot(&mut self, index: usize, name: &str) -> Option<EvalValue> {
        if index < self.positional.len() {
            return self.positional[index].take();
        }
        self.named
            .iter_mut()
            .find(|(k, _)| k == name)
            .and_then(|(_, v)| v.take())
    }

    /// Moves a value out as-is (series list or scalar).
    pub fn take_value(&mut self, index: usize, name: &str) -> Option<EvalValue> {
        self.take_slot(index, name)
    }

    pub fn series_list(&mut self, index: usize, name: &str) -> Result<Vec<Series>, QueryError> {
        match self.take_slot(index, name) {
            Some(EvalValue::Series(series)) => Ok(series),
            Some(other) => Err(self.error(format!("{} must be a series list, got {}", name, other.type_name()))),
            None => Err(self.error(format!("missing required argument {}", name))),
        }
    }

    /// Concatenates every positional series list from `index` on.
    pub fn series_lists_from(&mut self, index: usize) -> Result<Vec<Series>, QueryError> {
        let mut out = Vec::new();
        for i in index..self.positional.len() {
            match self.positional[i].take() {
                Some(EvalValue::Series(series)) => out.extend(series),
                Some(other) => {
                    return Err(self.error(format!(
                        "argument {} must be a series list, got {}",
                        i + 1,
                        other.type_name()
                    )))
                }
                None => {}
            }
        }
        Ok(out)
    }

    pub fn opt_number(&self, index: usize, name: &str) -> Result<Option<f64>, QueryError> {
        match self.slot(index, name) {
            None => Ok(None),
            Some(EvalValue::Number(n)) => Ok(Some(*n)),
            Some(other) => Err(self.error(format!("{} must be a number, got {}", name, other.type_name()))),
        }
    }

    pub fn number(&self, index: usize, name: &str) -> Result<f64, QueryError> {
        self.opt_number(index, name)?
            .ok_or_else(|| self.error(format!("missing required argument {}", name)))
    }

    pub fn opt_integer(&self, index: usize, name: &str) -> Result<Option<i64>, QueryError> {
        match self.opt_number(index, name)? {
            None => Ok(None),
            Some(n) if n.fract() == 0.0 && n.is_finite() => Ok(Some(n as i64)),
            Some(n) => Err(self.error(format!("{} must be an integer, got {}", name, n))),
        }
    }

    pub fn integer(&self, index: usize, name: &str) -> Result<i64, QueryError> {
        self.opt_integer(index, name)?
            .ok_or_else(|| self.error(format!("missing required argument {}", name)))
    }

    /// Every positional integer from `index` on.
    pub fn integers_from(&self, index: usize, name: &str) -> Result<Vec<i64>, QueryError> {
        (index..self.positional.len())
            .map(|i| self.integer(i, name))
            .collect()
    }

    pub fn opt_string(&self, index: usize, name: &str) -> Result<Option<String>, QueryError> {
        match self.slot(index, name) {
            None => Ok(None),
            Some(EvalValue::Str(s)) => Ok(Some(s.clone())),
            Some(other) => Err(self.error(format!("{} must be a string, got {}", name, other.type_name()))),
        }
    }

    pub fn string(&self, index: usize, name: &str) -> Result<String, QueryError> {
        self.opt_string(index, name)?
            .ok_or_else(|| self.error(format!("missing required argument {}", name)))
    }

    pub fn opt_bool(&self, index: usize, name: &str) -> Result<Option<bool>, QueryError> {
        match self.slot(index, name) {
            None => Ok(None),
            Some(EvalValue::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(self.error(format!("{} must be a boolean, got {}", name, other.type_name()))),
        }
    }

    /// A raw scalar for parameters accepting several types.
    pub fn scalar(&self, index: usize, name: &str) -> Option<&EvalValue> {
        self.slot(index, name)
    }
}

/// Formats like C's `%g`: six significant digits, trailing zeros stripped.
pub(crate) fn format_g(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return "0".to_string();
    }
    let sci = format!("{:.5e}", value);
    let Some((mantissa, exponent)) = sci.split_once('e') else {
        return sci;
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if !(-4..6).contains(&exponent) {
        let mantissa = trim_fraction(mantissa);
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exponent.abs())
    } else {
        let decimals = (5 - exponent).max(0) as usize;
        trim_fraction(&format!("{:.*}", decimals, value)).to_string()
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

/// Formats like `%d`: truncates toward zero.
pub(crate) fn format_d(value: f64) -> String {
    format!("{}", value.trunc() as i64)
}

/// Sorted, deduplicated path expressions joined by commas.
pub(crate) fn format_path_expressions(series: &[Series]) -> String {
    let mut expressions: Vec<&str> = series.iter().map(|s| s.path_expression.as_str()).collect();
    expressions.sort_unstable();
    expressions.dedup();
    expressions.join(",")
}

use ParamType as P;

const SERIES: Param = Param::required("seriesList", P::SeriesList);
const SERIES_LISTS: &[Param] = &[Param::variadic("seriesLists", P::SeriesList)];
const SERIES_ONLY: &[Param] = &[SERIES];
const SERIES_N: &[Param] = &[SERIES, Param::required("n", P::Number)];
const SERIES_OPT_N: &[Param] = &[SERIES, Param::optional("n", P::Integer)];
const SERIES_REGEX: &[Param] = &[SERIES, Param::required("pattern", P::String)];
const SERIES_POSITIONS: &[Param] = &[SERIES, Param::variadic("position", P::Integer)];
const SERIES_MAX_VALUE: &[Param] = &[SERIES, Param::optional("maxValue", P::Number)];

macro_rules! def {
    ($name:literal, $kind:ident, $params:expr, $imp:expr) => {
        FunctionDef {
            name: $name,
            kind: FunctionKind::$kind,
            params: $params,
            implementation: $imp,
        }
    };
}

static BUILTINS: &[FunctionDef] = &[
    // Combine
    def!("sumSeries", Combine, SERIES_LISTS, Implementation::Combine(Combiner::Sum)),
    def!("sum", Combine, SERIES_LISTS, Implementation::Combine(Combiner::Sum)),
    def!("averageSeries", Combine, SERIES_LISTS, Implementation::Combine(Combiner::Average)),
    def!("avg", Combine, SERIES_LISTS, Implementation::Combine(Combiner::Average)),
    def!("minSeries", Combine, SERIES_LISTS, Implementation::Combine(Combiner::Min)),
    def!("maxSeries", Combine, SERIES_LISTS, Implementation::Combine(Combiner::Max)),
    def!("diffSeries", Combine, SERIES_LISTS, Implementation::Combine(Combiner::Diff)),
    def!("multiplySeries", Combine, SERIES_LISTS, Implementation::Combine(Combiner::Multiply)),
    def!("rangeOfSeries", Combine, SERIES_LISTS, Implementation::Combine(Combiner::Range)),
    def!("stddevSeries", Combine, SERIES_LISTS, Implementation::Combine(Combiner::Stddev)),
    def!("countSeries", Combine, SERIES_LISTS, Implementation::Combine(Combiner::Count)),
    def!("group", Combine, SERIES_LISTS, Implementation::Series(combine::group)),
    // Transform
    def!("scale", Transform, &[SERIES, Param::required("factor", P::Number)], Implementation::Series(transform::scale)),
    def!("offset", Transform, &[SERIES, Param::required("factor", P::Number)], Implementation::Series(transform::offset)),
    def!("absolute", Transform, SERIES_ONLY, Implementation::Series(transform::absolute)),
    def!("invert", Transform, SERIES_ONLY, Implementation::Series(transform::invert)),
    def!(
        "scaleToSeconds",
        Transform,
        &[SERIES, Param::required("seconds", P::Number)],
        Implementation::Series(transform::scale_to_seconds)
    ),
    def!(
        "transformNull",
        Transform,
        &[SERIES, Param::optional("default", P::Number)],
        Implementation::Series(transform::transform_null)
    ),
    def!("isNonNull", Transform, SERIES_ONLY, Implementation::Series(transform::is_non_null)),
    def!(
        "keepLastValue",
        Transform,
        &[SERIES, Param::optional("limit", P::Integer)],
        Implementation::Series(transform::keep_last_value)
    ),
    def!("derivative", Transform, SERIES_ONLY, Implementation::Series(transform::derivative)),
    def!(
        "nonNegativeDerivative",
        Transform,
        SERIES_MAX_VALUE,
        Implementation::Series(transform::non_negative_derivative)
    ),
    def!("perSecond", Transform, SERIES_MAX_VALUE, Implementation::Series(transform::per_second)),
    def!("integral", Transform, SERIES_ONLY, Implementation::Series(transform::integral)),
    def!(
        "consolidateBy",
        Transform,
        &[SERIES, Param::required("consolidationFunc", P::String)],
        Implementation::Series(transform::consolidate_by)
    ),
    def!("cumulative", Transform, SERIES_ONLY, Implementation::Series(transform::cumulative)),
    def!(
        "asPercent",
        Transform,
        &[SERIES, Param::optional("total", P::SeriesOrNumber)],
        Implementation::Series(transform::as_percent)
    ),
    def!(
        "sumSeriesWithWildcards",
        Transform,
        SERIES_POSITIONS,
        Implementation::Series(combine::sum_with_wildcards)
    ),
    def!(
        "averageSeriesWithWildcards",
        Transform,
        SERIES_POSITIONS,
        Implementation::Series(combine::average_with_wildcards)
    ),
    def!("alias", Transform, &[SERIES, Param::required("newName", P::String)], Implementation::Series(alias::alias)),
    def!(
        "aliasByNode",
        Transform,
        &[SERIES, Param::variadic("nodes", P::Integer)],
        Implementation::Series(alias::alias_by_node)
    ),
    def!("aliasByMetric", Transform, SERIES_ONLY, Implementation::Series(alias::alias_by_metric)),
    def!(
        "aliasSub",
        Transform,
        &[SERIES, Param::required("search", P::String), Param::required("replace", P::String)],
        Implementation::Series(alias::alias_sub)
    ),
    def!("highestCurrent", Transform, SERIES_OPT_N, Implementation::Series(filter::highest_current)),
    def!("lowestCurrent", Transform, SERIES_OPT_N, Implementation::Series(filter::lowest_current)),
    def!("highestMax", Transform, SERIES_OPT_N, Implementation::Series(filter::highest_max)),
    def!("highestAverage", Transform, SERIES_OPT_N, Implementation::Series(filter::highest_average)),
    def!("lowestAverage", Transform, SERIES_OPT_N, Implementation::Series(filter::lowest_average)),
    def!("currentAbove", Transform, SERIES_N, Implementation::Series(filter::current_above)),
    def!("currentBelow", Transform, SERIES_N, Implementation::Series(filter::current_below)),
    def!("averageAbove", Transform, SERIES_N, Implementation::Series(filter::average_above)),
    def!("averageBelow", Transform, SERIES_N, Implementation::Series(filter::average_below)),
    def!("maximumAbove", Transform, SERIES_N, Implementation::Series(filter::maximum_above)),
    def!("maximumBelow", Transform, SERIES_N, Implementation::Series(filter::maximum_below)),
    def!("minimumAbove", Transform, SERIES_N, Implementation::Series(filter::minimum_above)),
    def!("minimumBelow", Transform, SERIES_N, Implementation::Series(filter::minimum_below)),
    def!("removeAboveValue", Transform, SERIES_N, Implementation::Series(filter::remove_above_value)),
    def!("removeBelowValue", Transform, SERIES_N, Implementation::Series(filter::remove_below_value)),
    def!("removeEmptySeries", Transform, SERIES_ONLY, Implementation::Series(filter::remove_empty_series)),
    def!("limit", Transform, &[SERIES, Param::required("n", P::Integer)], Implementation::Series(filter::limit)),
    def!("sortByName", Transform, SERIES_ONLY, Implementation::Series(filter::sort_by_name)),
    def!("sortByMaxima", Transform, SERIES_ONLY, Implementation::Series(filter::sort_by_maxima)),
    def!("sortByMinima", Transform, SERIES_ONLY, Implementation::Series(filter::sort_by_minima)),
    def!("sortByTotal", Transform, SERIES_ONLY, Implementation::Series(filter::sort_by_total)),
    def!("exclude", Transform, SERIES_REGEX, Implementation::Series(filter::exclude)),
    def!("grep", Transform, SERIES_REGEX, Implementation::Series(filter::grep)),
    // Pair
    def!(
        "divideSeries",
        Pair,
        &[Param::required("dividendSeriesList", P::SeriesList), Param::required("divisorSeriesList", P::SeriesList)],
        Implementation::Series(combine::divide_series)
    ),
    // Contextual
    def!(
        "timeShift",
        Contextual,
        &[SERIES, Param::required("timeShift", P::String), Param::optional("resetEnd", P::Boolean)],
        Implementation::Contextual(context::time_shift)
    ),
    def!(
        "movingAverage",
        Contextual,
        &[SERIES, Param::required("windowSize", P::NumberOrString)],
        Implementation::Contextual(context::moving_average)
    ),
    def!(
        "groupByNode",
        Contextual,
        &[SERIES, Param::required("nodeNum", P::Integer), Param::required("callback", P::String)],
        Implementation::Contextual(context::group_by_node)
    ),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TimeInfo;

    #[test]
    fn format_g_matches_printf() {
        assert_eq!(format_g(2.0), "2");
        assert_eq!(format_g(0.5), "0.5");
        assert_eq!(format_g(-1.25), "-1.25");
        assert_eq!(format_g(1_000_000.0), "1e+06");
        assert_eq!(format_g(123456.0), "123456");
        assert_eq!(format_g(0.000015), "1.5e-05");
        assert_eq!(format_g(1.0 / 3.0), "0.333333");
        assert_eq!(format_d(2.9), "2");
    }

    #[test]
    fn registry_has_every_kind() {
        let registry = FunctionRegistry::builtin();
        for name in ["sumSeries", "sum", "scale", "divideSeries", "timeShift", "groupByNode"] {
            assert!(registry.contains(name), "{name}");
        }
        assert_eq!(registry.get("divideSeries").unwrap().kind, FunctionKind::Pair);
        assert_eq!(registry.get("movingAverage").unwrap().kind, FunctionKind::Contextual);
        assert!(!registry.clone().without(&["grep"]).contains("grep"));
    }

    #[test]
    fn arity_is_checked() {
        let registry = FunctionRegistry::builtin();
        let scale = registry.get("scale").unwrap();
        assert!(scale.check_arity(2, &[]).is_ok());
        assert!(scale.check_arity(1, &["factor"]).is_ok());
        assert!(matches!(
            scale.check_arity(1, &[]),
            Err(QueryError::EvaluationError { function, .. }) if function == "scale"
        ));
        assert!(scale.check_arity(3, &[]).is_err());
        assert!(scale.check_arity(2, &["bogus"]).is_err());
        assert!(registry.get("sumSeries").unwrap().check_arity(7, &[]).is_ok());
    }

    #[test]
    fn args_accessors_report_type_errors() {
        let series = Series::new("a", TimeInfo::new(0, 60, 60), vec![Some(1.0)]);
        let mut args = Args::new(
            "scale",
            vec![EvalValue::Series(vec![series]), EvalValue::Str("x".into())],
            Vec::new(),
            86_400,
        );
        assert!(args.number(1, "factor").is_err());
        assert_eq!(args.series_list(0, "seriesList").unwrap().len(), 1);
        assert_eq!(args.opt_number(5, "missing").unwrap(), None);
    }

    #[test]
    fn path_expressions_are_sorted_and_unique() {
        let mut a = Series::new("x", TimeInfo::new(0, 60, 60), vec![None]);
        a.path_expression = "b.*".into();
        let mut b = a.clone();
        b.path_expression = "a.*".into();
        let c = a.clone();
        assert_eq!(format_path_expressions(&[a, b, c]), "a.*,b.*");
    }
}
