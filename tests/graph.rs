#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

use rand::Rng;
use stg::connector::Connector;
use stg::graph::{GraphError, TaskGraphConf};
use stg::pipeline::{DecompositionRule, ExecutionPipeline};
use stg::rule::{Bookkeeper, Rule};
use stg::runtime::{Runtime, RuntimeError};
use stg::task::{Task, TaskContext, TaskError};

/// Stateless 1:1 mapping stage with a configurable replica count.
struct Map<F> {
    name: &'static str,
    threads: usize,
    f: F,
}

impl<F> Map<F> {
    fn new(name: &'static str, threads: usize, f: F) -> Self {
        Self { name, threads, f }
    }
}

impl<I, O, F> Task<I, O> for Map<F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> O + Clone + Send + 'static,
{
    fn execute(&mut self, item: I, ctx: &mut TaskContext<O>) -> Result<(), TaskError> {
        ctx.add_result((self.f)(item));
        Ok(())
    }

    fn copy(&self) -> Box<dyn Task<I, O>> {
        Box::new(Self::new(self.name, self.threads, self.f.clone()))
    }

    fn name(&self) -> String {
        self.name.into()
    }

    fn num_threads(&self) -> usize {
        self.threads
    }
}

fn drain_sorted<I, T>(runtime: &Runtime<I, T>) -> Vec<T>
where
    I: Send + 'static,
    T: Ord + Send + 'static,
{
    let mut out: Vec<_> = std::iter::from_fn(|| runtime.consume()).collect();
    out.sort_unstable();
    out
}

// S1: three pure stages over [1..5].
#[test]
fn straight_pipe_three_stages() {
    let mut graph = TaskGraphConf::<i64, i64>::new();
    let a = graph.add_task(Map::new("a", 1, |x: i64| x + 1));
    let b = graph.add_task(Map::new("b", 1, |x: i64| x * 2));
    let c = graph.add_task(Map::new("c", 1, |x: i64| -x));
    graph.set_graph_consumer(&a).unwrap();
    graph.add_edge(&a, &b).unwrap();
    graph.add_edge(&b, &c).unwrap();
    graph.add_graph_producer(&c).unwrap();

    let mut runtime = Runtime::new(graph);
    runtime.execute().unwrap();
    for item in 1..=5 {
        runtime.produce(item);
    }
    runtime.finish_producing();
    let out = drain_sorted(&runtime);
    runtime.wait().unwrap();
    assert_eq!(out, vec![-12, -10, -8, -6, -4]);
}

struct ParityRule {
    want_even: bool,
}

impl Rule<i64, i64> for ParityRule {
    fn apply(&mut self, item: &i64, _pipeline_id: usize) -> Vec<i64> {
        if (item % 2 == 0) == self.want_even {
            vec![*item]
        } else {
            Vec::new()
        }
    }

    fn name(&self) -> String {
        if self.want_even { "even" } else { "odd" }.into()
    }
}

/// Folds its whole input into one record emitted at shutdown.
struct Fold {
    label: &'static str,
    acc: i64,
    count: bool,
}

impl Task<i64, (&'static str, i64)> for Fold {
    fn execute(
        &mut self,
        item: i64,
        _ctx: &mut TaskContext<(&'static str, i64)>,
    ) -> Result<(), TaskError> {
        self.acc += if self.count { 1 } else { item };
        Ok(())
    }

    fn shutdown(&mut self, ctx: &mut TaskContext<(&'static str, i64)>) -> Result<(), TaskError> {
        ctx.add_result((self.label, self.acc));
        Ok(())
    }

    fn copy(&self) -> Box<dyn Task<i64, (&'static str, i64)>> {
        Box::new(Self {
            label: self.label,
            acc: 0,
            count: self.count,
        })
    }

    fn name(&self) -> String {
        self.label.into()
    }
}

struct Merge {
    sum: i64,
    count: i64,
}

impl Task<(&'static str, i64), (i64, i64)> for Merge {
    fn execute(
        &mut self,
        (label, value): (&'static str, i64),
        _ctx: &mut TaskContext<(i64, i64)>,
    ) -> Result<(), TaskError> {
        match label {
            "sum" => self.sum = value,
            _ => self.count = value,
        }
        Ok(())
    }

    fn shutdown(&mut self, ctx: &mut TaskContext<(i64, i64)>) -> Result<(), TaskError> {
        ctx.add_result((self.sum, self.count));
        Ok(())
    }

    fn copy(&self) -> Box<dyn Task<(&'static str, i64), (i64, i64)>> {
        Box::new(Self { sum: 0, count: 0 })
    }

    fn name(&self) -> String {
        "merge".into()
    }
}

// S2: bookkeeper fans {1..6} into an even summer and an odd counter, and a
// merge stage recombines their folds.
#[test]
fn bookkeeper_split_merge() {
    let mut graph = TaskGraphConf::<i64, (i64, i64)>::new();
    let bookkeeper = graph.add_task(Bookkeeper::new());
    let evens = graph.add_task(Fold {
        label: "sum",
        acc: 0,
        count: false,
    });
    let odds = graph.add_task(Fold {
        label: "count",
        acc: 0,
        count: true,
    });
    let merge = graph.add_task(Merge { sum: 0, count: 0 });
    graph.set_graph_consumer(&bookkeeper).unwrap();
    graph
        .add_rule_edge(&bookkeeper, ParityRule { want_even: true }, &evens)
        .unwrap();
    graph
        .add_rule_edge(&bookkeeper, ParityRule { want_even: false }, &odds)
        .unwrap();
    graph.add_edge(&evens, &merge).unwrap();
    graph.add_edge(&odds, &merge).unwrap();
    graph.add_graph_producer(&merge).unwrap();

    let mut runtime = Runtime::new(graph);
    runtime.execute().unwrap();
    for item in 1..=6 {
        runtime.produce(item);
    }
    runtime.finish_producing();
    assert_eq!(runtime.consume(), Some((12, 3)));
    assert_eq!(runtime.consume(), None);
    runtime.wait().unwrap();
}

// S4: a stage replicated four ways produces the same multiset as one
// replica, with no loss and no duplication.
#[test]
fn replication_preserves_output_multiset() {
    let expected: Vec<u64> = (0..1000).map(|x| x * 3 + 1).collect();

    let mut graph = TaskGraphConf::<u64, u64>::new();
    let stage = graph.add_task(Map::new("stage", 4, |x: u64| x * 3 + 1));
    graph.set_graph_consumer(&stage).unwrap();
    graph.add_graph_producer(&stage).unwrap();

    let mut runtime = Runtime::new(graph);
    runtime.execute().unwrap();
    for item in 0..1000 {
        runtime.produce(item);
    }
    runtime.finish_producing();
    let out = drain_sorted(&runtime);
    runtime.wait().unwrap();
    assert_eq!(out, expected);
}

/// Tags every item with the replica that processed it.
struct TagPipeline;

impl Task<u64, (usize, u64)> for TagPipeline {
    fn execute(&mut self, item: u64, ctx: &mut TaskContext<(usize, u64)>) -> Result<(), TaskError> {
        ctx.add_result((ctx.pipeline_id(), item));
        Ok(())
    }

    fn copy(&self) -> Box<dyn Task<u64, (usize, u64)>> {
        Box::new(Self)
    }

    fn name(&self) -> String {
        "tag".into()
    }
}

struct ModuloRule;

impl DecompositionRule<u64> for ModuloRule {
    fn can_process(&mut self, item: &u64, pipeline_id: usize) -> bool {
        (item % 3) as usize == pipeline_id
    }
}

#[test]
fn pipeline_replica_count_clamps_to_one() {
    let inner = TaskGraphConf::<u64, (usize, u64)>::new();
    let pipeline = ExecutionPipeline::new(0, inner, ModuloRule);
    assert_eq!(pipeline.num_pipelines(), 1);
}

// S5: three replicas, inputs routed by residue class; each replica sees
// exactly its ten items.
#[test]
fn execution_pipeline_decomposition() {
    let mut inner = TaskGraphConf::<u64, (usize, u64)>::new();
    let tag = inner.add_task(TagPipeline);
    inner.set_graph_consumer(&tag).unwrap();
    inner.add_graph_producer(&tag).unwrap();

    let mut outer = TaskGraphConf::<u64, (usize, u64)>::new();
    let pipeline = outer.add_execution_pipeline(3, inner, ModuloRule);
    outer.set_graph_consumer(&pipeline).unwrap();
    outer.add_graph_producer(&pipeline).unwrap();

    let mut runtime = Runtime::new(outer);
    runtime.execute().unwrap();
    for item in 0..30 {
        runtime.produce(item);
    }
    runtime.finish_producing();
    let out: Vec<_> = std::iter::from_fn(|| runtime.consume()).collect();
    runtime.wait().unwrap();

    assert_eq!(out.len(), 30);
    let mut per_replica = [0usize; 3];
    for (pipeline_id, item) in out {
        assert_eq!((item % 3) as usize, pipeline_id);
        per_replica[pipeline_id] += 1;
    }
    assert_eq!(per_replica, [10, 10, 10]);
}

struct GroupsOfFour {
    buffer: Vec<i64>,
}

impl Rule<i64, Vec<i64>> for GroupsOfFour {
    fn apply(&mut self, item: &i64, _pipeline_id: usize) -> Vec<Vec<i64>> {
        self.buffer.push(*item);
        if self.buffer.len() == 4 {
            vec![std::mem::take(&mut self.buffer)]
        } else {
            Vec::new()
        }
    }

    fn shutdown(&mut self, _pipeline_id: usize) {
        // Incomplete trailing group: dropped, by contract.
        self.buffer.clear();
    }

    fn name(&self) -> String {
        "groups-of-four".into()
    }
}

// S6: ten items into a groups-of-four rule yield two complete groups; the
// two leftovers vanish at shutdown and termination still goes through.
#[test]
fn unsatisfied_rule_still_terminates() {
    let mut graph = TaskGraphConf::<i64, Vec<i64>>::new();
    let bookkeeper = graph.add_task(Bookkeeper::new());
    let forward = graph.add_task(Map::new("forward", 1, |group: Vec<i64>| group));
    graph.set_graph_consumer(&bookkeeper).unwrap();
    graph
        .add_rule_edge(&bookkeeper, GroupsOfFour { buffer: Vec::new() }, &forward)
        .unwrap();
    graph.add_graph_producer(&forward).unwrap();

    let mut runtime = Runtime::new(graph);
    runtime.execute().unwrap();
    for item in 0..10 {
        runtime.produce(item);
    }
    runtime.finish_producing();
    let groups: Vec<_> = std::iter::from_fn(|| runtime.consume()).collect();
    runtime.wait().unwrap();

    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0], vec![0, 1, 2, 3]);
    assert_eq!(groups[1], vec![4, 5, 6, 7]);
}

struct FailOn {
    trigger: i64,
}

impl Task<i64, i64> for FailOn {
    fn execute(&mut self, item: i64, ctx: &mut TaskContext<i64>) -> Result<(), TaskError> {
        if item == self.trigger {
            return Err(format!("refusing to process {item}").into());
        }
        ctx.add_result(item);
        Ok(())
    }

    fn copy(&self) -> Box<dyn Task<i64, i64>> {
        Box::new(Self {
            trigger: self.trigger,
        })
    }

    fn name(&self) -> String {
        "fail-on".into()
    }
}

// A failing task latches its error, downstream still drains, and the
// runtime surfaces the failure after join.
#[test]
fn task_error_is_latched_and_downstream_drains() {
    let mut graph = TaskGraphConf::<i64, i64>::new();
    let failing = graph.add_task(FailOn { trigger: 3 });
    let sink = graph.add_task(Map::new("sink", 1, |x: i64| x));
    graph.set_graph_consumer(&failing).unwrap();
    graph.add_edge(&failing, &sink).unwrap();
    graph.add_graph_producer(&sink).unwrap();

    let mut runtime = Runtime::new(graph);
    runtime.execute().unwrap();
    for item in 0..10 {
        runtime.produce(item);
    }
    runtime.finish_producing();
    // The output terminates even though the producer died mid-stream.
    let out: Vec<_> = std::iter::from_fn(|| runtime.consume()).collect();
    assert!(out.len() < 10);
    match runtime.wait() {
        Err(RuntimeError::Task { task, .. }) => assert_eq!(task, "fail-on"),
        other => panic!("expected a task error, got {other:?}"),
    }
}

struct PanicOn {
    trigger: i64,
}

impl Task<i64, i64> for PanicOn {
    fn execute(&mut self, item: i64, ctx: &mut TaskContext<i64>) -> Result<(), TaskError> {
        assert!(item != self.trigger, "hit the trigger item");
        ctx.add_result(item);
        Ok(())
    }

    fn copy(&self) -> Box<dyn Task<i64, i64>> {
        Box::new(Self {
            trigger: self.trigger,
        })
    }

    fn name(&self) -> String {
        "panic-on".into()
    }
}

#[test]
fn worker_panic_is_latched() {
    let mut graph = TaskGraphConf::<i64, i64>::new();
    let panicking = graph.add_task(PanicOn { trigger: 2 });
    graph.set_graph_consumer(&panicking).unwrap();
    graph.add_graph_producer(&panicking).unwrap();

    let mut runtime = Runtime::new(graph);
    runtime.execute().unwrap();
    for item in 0..5 {
        runtime.produce(item);
    }
    runtime.finish_producing();
    while runtime.consume().is_some() {}
    match runtime.wait() {
        Err(RuntimeError::Panic { task, .. }) => assert_eq!(task, "panic-on"),
        other => panic!("expected a panic report, got {other:?}"),
    }
}

/// A task whose `can_terminate` holds out until an item has been seen,
/// exercising the yield-and-repoll path.
struct WaitsForFirstItem {
    seen: bool,
}

impl Task<u8, u8> for WaitsForFirstItem {
    fn execute(&mut self, item: u8, ctx: &mut TaskContext<u8>) -> Result<(), TaskError> {
        self.seen = true;
        ctx.add_result(item);
        Ok(())
    }

    fn can_terminate(&mut self, _input: Option<&Connector<u8>>) -> bool {
        self.seen
    }

    fn copy(&self) -> Box<dyn Task<u8, u8>> {
        Box::new(Self { seen: false })
    }

    fn name(&self) -> String {
        "waits-for-first".into()
    }
}

#[test]
fn can_terminate_false_repolls_until_item_arrives() {
    let mut graph = TaskGraphConf::<u8, u8>::new();
    let waiter = graph.add_task(WaitsForFirstItem { seen: false });
    graph.set_graph_consumer(&waiter).unwrap();
    graph.add_graph_producer(&waiter).unwrap();

    let mut runtime = Runtime::new(graph);
    runtime.execute().unwrap();
    runtime.produce(7);
    runtime.finish_producing();
    assert_eq!(runtime.consume(), Some(7));
    runtime.wait().unwrap();
}

#[test]
fn config_errors_are_raised_at_build_time() {
    let mut graph = TaskGraphConf::<i64, i64>::new();
    let a = graph.add_task(Map::new("a", 1, |x: i64| x));
    let b = graph.add_task(Map::new("b", 1, |x: i64| x));
    let c = graph.add_task(Map::new("c", 1, |x: i64| x));
    graph.add_edge(&a, &b).unwrap();
    // `a` cannot also feed `c` through a second plain edge.
    graph.add_edge(&a, &c).unwrap();
    assert!(matches!(
        graph.finalize(),
        Err(GraphError::ProducerAlreadyConnected { .. })
    ));

    let mut other = TaskGraphConf::<i64, i64>::new();
    let foreign = other.add_task(Map::new("foreign", 1, |x: i64| x));
    let mut graph = TaskGraphConf::<i64, i64>::new();
    let local = graph.add_task(Map::new("local", 1, |x: i64| x));
    assert!(matches!(
        graph.add_edge(&foreign, &local),
        Err(GraphError::ForeignTask { .. })
    ));
}

struct ForwardRule;

impl Rule<i64, i64> for ForwardRule {
    fn apply(&mut self, item: &i64, _pipeline_id: usize) -> Vec<i64> {
        vec![*item]
    }

    fn name(&self) -> String {
        "forward".into()
    }
}

fn run_diamond(threads: usize, inputs: &[i64]) -> Vec<i64> {
    let mut graph = TaskGraphConf::<i64, i64>::new();
    let bookkeeper = graph.add_task(Bookkeeper::new());
    let left = graph.add_task(Map::new("left", threads, |x: i64| x * 2));
    let right = graph.add_task(Map::new("right", threads, |x: i64| x + 10));
    graph.set_graph_consumer(&bookkeeper).unwrap();
    graph.add_rule_edge(&bookkeeper, ForwardRule, &left).unwrap();
    graph.add_rule_edge(&bookkeeper, ForwardRule, &right).unwrap();
    graph.add_graph_producer(&left).unwrap();
    graph.add_graph_producer(&right).unwrap();

    let mut runtime = Runtime::new(graph);
    runtime.execute().unwrap();
    for &item in inputs {
        runtime.produce(item);
    }
    runtime.finish_producing();
    let out = drain_sorted(&runtime);
    runtime.wait().unwrap();
    out
}

// A broadcast fan-out into two branches merging on the graph output keeps
// its multiset under replication of both branches.
#[test]
fn diamond_fanout_is_thread_count_invariant() {
    let inputs: Vec<i64> = (0..100).collect();
    let baseline = run_diamond(1, &inputs);
    let mut expected: Vec<i64> = inputs
        .iter()
        .map(|x| x * 2)
        .chain(inputs.iter().map(|x| x + 10))
        .collect();
    expected.sort_unstable();
    assert_eq!(baseline, expected);
    for threads in [2, 4, 8] {
        assert_eq!(run_diamond(threads, &inputs), baseline);
    }
}

fn run_chain(ops: &[(u8, i64)], threads: &[usize], inputs: &[i64]) -> Vec<i64> {
    let mut graph = TaskGraphConf::<i64, i64>::new();
    let stages: Vec<_> = ops
        .iter()
        .zip(threads)
        .map(|(&(op, operand), &k)| {
            graph.add_task(Map::new("stage", k, move |x: i64| match op {
                0 => x.wrapping_add(operand),
                1 => x.wrapping_mul(operand),
                _ => x.wrapping_sub(operand),
            }))
        })
        .collect();
    graph.set_graph_consumer(&stages[0]).unwrap();
    for pair in stages.windows(2) {
        graph.add_edge(&pair[0], &pair[1]).unwrap();
    }
    graph.add_graph_producer(stages.last().unwrap()).unwrap();

    let mut runtime = Runtime::new(graph);
    runtime.execute().unwrap();
    for &item in inputs {
        runtime.produce(item);
    }
    runtime.finish_producing();
    let out = drain_sorted(&runtime);
    runtime.wait().unwrap();
    out
}

// Randomized pipelines produce identical output multisets under any
// per-stage thread count.
#[test]
fn random_chains_are_thread_count_invariant() {
    let mut rng = rand::thread_rng();
    for _ in 0..10 {
        let depth = rng.gen_range(1..=5);
        let ops: Vec<(u8, i64)> = (0..depth)
            .map(|_| (rng.gen_range(0..3), rng.gen_range(-5..=5)))
            .collect();
        let inputs: Vec<i64> = (0..rng.gen_range(1..=200))
            .map(|_| rng.gen_range(-1_000..1_000))
            .collect();

        let baseline = run_chain(&ops, &vec![1; depth], &inputs);
        for k in [2usize, 4, 8] {
            let threads: Vec<usize> = (0..depth).map(|_| k).collect();
            assert_eq!(run_chain(&ops, &threads, &inputs), baseline);
        }
        let mixed: Vec<usize> = (0..depth)
            .map(|_| [1usize, 2, 4, 8][rng.gen_range(0..4)])
            .collect();
        assert_eq!(run_chain(&ops, &mixed, &inputs), baseline);
    }
}
