//! End-to-end render requests: consolidation to a point budget, the request
//! cache, and function evaluation over fetched series.

use std::sync::{Arc, Mutex};

use strand::engine::ConsolidationRule;
use strand::*;

#[derive(Debug, Default)]
struct Recorder {
    events: Mutex<Vec<QueryEvent>>,
}

impl QueryEventListener for Recorder {
    fn on_event(&self, event: QueryEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn ramp(n: usize, from: f64) -> Vec<Option<f64>> {
    (0..n).map(|i| Some(from + i as f64)).collect()
}

fn engine_with(finder: MemoryFinder) -> (Arc<MemoryFinder>, QueryEngine) {
    let finder = Arc::new(finder);
    let engine = QueryEngine::new(vec![finder.clone() as Arc<dyn Finder>]).unwrap();
    (finder, engine)
}

fn render(engine: &QueryEngine, target: &Expr, start: i64, end: i64) -> Vec<Series> {
    let key = target.to_string();
    let mut result = engine
        .resolve_and_evaluate(std::slice::from_ref(target), start, end, None)
        .unwrap();
    assert!(result.errors.is_empty(), "errors: {:?}", result.errors);
    result.series.remove(&key).unwrap()
}

#[test]
fn output_is_consolidated_to_max_points() {
    let f = MemoryFinder::new("mem");
    f.insert_series("web.latency", 0, 60, &ramp(60, 1.0)).unwrap();
    let (_, engine) = engine_with(f);

    let result = engine
        .resolve_and_evaluate(&[Expr::path("web.latency")], 0, 3_600, Some(10))
        .unwrap();
    let series = &result.series["web.latency"][0];
    assert_eq!(series.values.len(), 10);
    assert_eq!(series.time_info, TimeInfo::new(0, 3_600, 360));
    assert_eq!(series.values[0], Some(3.5));
    assert_eq!(series.values[9], Some(57.5));
}

#[test]
fn uneven_point_count_leaves_a_short_last_bucket() {
    let f = MemoryFinder::new("mem");
    f.insert_series("web.latency", 0, 60, &ramp(65, 1.0)).unwrap();
    let (_, engine) = engine_with(f);

    let result = engine
        .resolve_and_evaluate(&[Expr::path("web.latency")], 0, 3_900, Some(10))
        .unwrap();
    let series = &result.series["web.latency"][0];
    assert_eq!(series.values.len(), 10);
    assert_eq!(series.step(), 420);
    assert_eq!(series.values[0], Some(4.0));
    assert_eq!(series.values[9], Some(64.5));
}

#[test]
fn consolidation_rules_pick_the_reduction() {
    let f = MemoryFinder::new("mem");
    f.insert_series("web.requests.count", 0, 60, &ramp(60, 1.0)).unwrap();
    let config = EngineConfig {
        consolidation_rules: vec![ConsolidationRule::new("*.*.count", ConsolidationFunc::Sum).unwrap()],
        ..EngineConfig::default()
    };
    let engine = QueryEngine::with_config(vec![Arc::new(f) as Arc<dyn Finder>], config).unwrap();

    let result = engine
        .resolve_and_evaluate(&[Expr::path("web.requests.count")], 0, 3_600, Some(10))
        .unwrap();
    let series = &result.series["web.requests.count"][0];
    assert_eq!(series.consolidation, ConsolidationFunc::Sum);
    assert_eq!(series.values[0], Some(21.0));
}

#[test]
fn repeated_path_expressions_are_fetched_once() {
    let f = MemoryFinder::new("mem");
    f.insert_series("app.a", 0, 60, &[Some(1.0), Some(2.0)]).unwrap();
    f.insert_series("app.b", 0, 60, &[Some(3.0), Some(4.0)]).unwrap();
    let f = Arc::new(f);
    let recorder = Arc::new(Recorder::default());
    let config = EngineConfig {
        event_listener: recorder.clone(),
        ..EngineConfig::default()
    };
    let engine = QueryEngine::with_config(vec![f.clone() as Arc<dyn Finder>], config).unwrap();

    let targets = [
        Expr::path("app.*"),
        Expr::call("sumSeries", vec![Expr::path("app.*")]),
    ];
    let result = engine.resolve_and_evaluate(&targets, 0, 120, None).unwrap();

    assert_eq!(result.fetch_cycles, 1);
    assert_eq!(f.find_calls(), 1);
    assert_eq!(f.fetch_calls(), 2);
    assert_eq!(result.series["app.*"].len(), 2);
    assert_eq!(result.series["sumSeries(app.*)"][0].values, vec![Some(4.0), Some(6.0)]);

    let events = recorder.events.lock().unwrap();
    let hits = events
        .iter()
        .filter(|e| matches!(e, QueryEvent::CacheHit { path_expression } if path_expression == "app.*"))
        .count();
    assert_eq!(hits, 1);
}

#[test]
fn invalid_pattern_fails_before_any_backend_call() {
    let f = MemoryFinder::new("mem");
    f.insert_series("a.b", 0, 60, &[Some(1.0)]).unwrap();
    let (f, engine) = engine_with(f);

    let targets = [Expr::path("a.b"), Expr::path("a.{b")];
    let err = engine.resolve_and_evaluate(&targets, 0, 60, None).unwrap_err();
    assert!(matches!(err, QueryError::InvalidPattern { .. }));
    assert_eq!(f.find_calls(), 0);
}

#[test]
fn empty_window_is_rejected() {
    let (_, engine) = engine_with(MemoryFinder::new("mem"));
    let err = engine
        .resolve_and_evaluate(&[Expr::path("a.b")], 100, 100, None)
        .unwrap_err();
    assert_eq!(err, QueryError::InvalidTimeRange { start: 100, end: 100 });
}

#[test]
fn unmatched_pattern_renders_an_empty_list() {
    let f = MemoryFinder::new("mem");
    f.insert_series("a.b", 0, 60, &[Some(1.0)]).unwrap();
    let (_, engine) = engine_with(f);
    assert!(render(&engine, &Expr::path("nothing.*"), 0, 60).is_empty());
}

#[test]
fn sum_ignores_gaps_and_mixed_resolutions_align() {
    let f = MemoryFinder::new("mem");
    f.insert_series("pool.fine", 0, 10, &[Some(1.0); 12]).unwrap();
    f.insert_series("pool.coarse", 0, 60, &[Some(2.0), None]).unwrap();
    let (_, engine) = engine_with(f);

    let sum = render(&engine, &Expr::call("sumSeries", vec![Expr::path("pool.*")]), 0, 120);
    assert_eq!(sum.len(), 1);
    assert_eq!(sum[0].name, "sumSeries(pool.*)");
    assert_eq!(sum[0].step(), 60);
    assert_eq!(sum[0].values, vec![Some(3.0), Some(1.0)]);
}

#[test]
fn divide_series_gaps_on_zero_divisor() {
    let f = MemoryFinder::new("mem");
    f.insert_series("req.errors", 0, 60, &[Some(5.0), Some(3.0), Some(1.0)]).unwrap();
    f.insert_series("req.total", 0, 60, &[Some(10.0), Some(0.0), None]).unwrap();
    let (_, engine) = engine_with(f);

    let target = Expr::call("divideSeries", vec![Expr::path("req.errors"), Expr::path("req.total")]);
    let ratio = render(&engine, &target, 0, 180);
    assert_eq!(ratio[0].name, "divideSeries(req.errors,req.total)");
    assert_eq!(ratio[0].values, vec![Some(0.5), None, None]);
}

#[test]
fn nested_calls_evaluate_depth_first() {
    let f = MemoryFinder::new("mem");
    f.insert_series("servers.web1.cpu", 0, 60, &[Some(10.0), Some(30.0)]).unwrap();
    f.insert_series("servers.web2.cpu", 0, 60, &[Some(50.0), Some(70.0)]).unwrap();
    f.insert_series("servers.web3.cpu", 0, 60, &[Some(1.0), Some(2.0)]).unwrap();
    let (_, engine) = engine_with(f);

    let target = Expr::call(
        "aliasByNode",
        vec![
            Expr::call(
                "highestAverage",
                vec![Expr::call("scale", vec![Expr::path("servers.*.cpu"), Expr::number(2.0)]), Expr::number(2.0)],
            ),
            Expr::number(1.0),
        ],
    );
    let series = render(&engine, &target, 0, 120);
    let names: Vec<&str> = series.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["web1", "web2"]);
    assert_eq!(series[1].values, vec![Some(100.0), Some(140.0)]);
}

#[test]
fn time_shift_reads_an_earlier_window() {
    let f = MemoryFinder::new("mem");
    f.insert_series("a.b", 0, 60, &ramp(120, 0.0)).unwrap();
    let (_, engine) = engine_with(f);

    let target = Expr::call("timeShift", vec![Expr::path("a.b"), Expr::string("1h")]);
    let shifted = render(&engine, &target, 3_600, 7_200);
    assert_eq!(shifted.len(), 1);
    assert_eq!(shifted[0].name, "timeShift(a.b, -1h)");
    assert_eq!(shifted[0].time_info, TimeInfo::new(3_600, 7_200, 60));
    assert_eq!(shifted[0].values.len(), 60);
    assert_eq!(shifted[0].values[0], Some(0.0));
    assert_eq!(shifted[0].values[59], Some(59.0));
}

#[test]
fn moving_average_bootstraps_its_first_window() {
    let f = MemoryFinder::new("mem");
    f.insert_series("a.b", 0, 60, &ramp(120, 0.0)).unwrap();
    let (_, engine) = engine_with(f);

    let target = Expr::call("movingAverage", vec![Expr::path("a.b"), Expr::number(2.0)]);
    let averaged = render(&engine, &target, 3_600, 7_200);
    assert_eq!(averaged[0].name, "movingAverage(a.b,2)");
    assert_eq!(averaged[0].values.len(), 60);
    // Point 60 averages points 58 and 59.
    assert_eq!(averaged[0].values[0], Some(58.5));
    assert_eq!(averaged[0].values[59], Some(117.5));
}

#[test]
fn group_by_node_folds_each_group() {
    let f = MemoryFinder::new("mem");
    f.insert_series("dc1.web1.cpu", 0, 60, &[Some(1.0)]).unwrap();
    f.insert_series("dc1.web2.cpu", 0, 60, &[Some(2.0)]).unwrap();
    f.insert_series("dc2.web1.cpu", 0, 60, &[Some(4.0)]).unwrap();
    let (_, engine) = engine_with(f);

    let target = Expr::call(
        "groupByNode",
        vec![Expr::path("*.*.cpu"), Expr::number(0.0), Expr::string("sumSeries")],
    );
    let groups = render(&engine, &target, 0, 60);
    let summary: Vec<(&str, Option<f64>)> = groups.iter().map(|s| (s.name.as_str(), s.values[0])).collect();
    assert_eq!(summary, vec![("dc1", Some(3.0)), ("dc2", Some(4.0))]);
}

#[test]
fn type_mismatch_is_an_evaluation_error() {
    let f = MemoryFinder::new("mem");
    f.insert_series("a.b", 0, 60, &[Some(1.0)]).unwrap();
    let (_, engine) = engine_with(f);

    let target = Expr::call("scale", vec![Expr::path("a.b"), Expr::string("two")]);
    let err = engine.resolve_and_evaluate(&[target], 0, 60, None).unwrap_err();
    assert!(matches!(err, QueryError::EvaluationError { function, .. } if function == "scale"));
}
