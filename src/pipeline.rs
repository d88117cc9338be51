use crate::graph::TaskGraphConf;
use crate::runtime::{Runtime, RuntimeError};
use crate::task::{Task, TaskContext, TaskError};
use std::sync::{Arc, Mutex};

/// Predicate deciding which pipeline replicas receive an inbound item.
///
/// Consulted once per replica for every item entering an
/// [`ExecutionPipeline`]; each replica answering `true` gets its own clone
/// of the item. One rule instance serves all replicas of a pipeline (and
/// all copies of the pipeline), behind a lock.
pub trait DecompositionRule<T>: Send
where
    T: Send + 'static,
{
    /// Whether the replica identified by `pipeline_id` should process
    /// `item`.
    fn can_process(&mut self, item: &T, pipeline_id: usize) -> bool;

    /// Diagnostic label.
    fn name(&self) -> String {
        "decomposition".into()
    }
}

struct Replica<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    input: Arc<crate::connector::Connector<I>>,
    runtime: Runtime<I, O>,
}

/// A task that replicates an inner graph and routes its own input across
/// the replicas.
///
/// On initialization the pipeline copies the template graph once per
/// replica, stamps every copy with its pipeline id, redirects each copy's
/// external output into the pipeline's own output connector, and starts a
/// nested [`Runtime`] per copy. Each `execute` consults the decomposition
/// rule and clones the item into every accepting replica. Shutdown retires
/// the pipeline's producer registration on every replica input and then
/// joins the nested runtimes, so the happens-before chain from inner
/// workers to the pipeline's downstream is preserved.
///
/// Replicas share no mutable state unless a rule deliberately carries some.
pub struct ExecutionPipeline<I, O>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
{
    name: String,
    num_pipelines: usize,
    template: TaskGraphConf<I, O>,
    rule: Arc<Mutex<dyn DecompositionRule<I>>>,
    replicas: Vec<Replica<I, O>>,
}

impl<I, O> ExecutionPipeline<I, O>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
{
    /// Wraps `graph` for replication across `num_pipelines` copies routed
    /// by `rule`.
    #[must_use]
    pub fn new(
        num_pipelines: usize,
        graph: TaskGraphConf<I, O>,
        rule: impl DecompositionRule<I> + 'static,
    ) -> Self {
        Self {
            name: "execution-pipeline".into(),
            num_pipelines: num_pipelines.max(1),
            template: graph,
            rule: Arc::new(Mutex::new(rule)),
            replicas: Vec::new(),
        }
    }

    /// Number of replicas this pipeline spawns.
    pub fn num_pipelines(&self) -> usize {
        self.num_pipelines
    }
}

impl<I, O> Task<I, O> for ExecutionPipeline<I, O>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
{
    fn initialize(&mut self, ctx: &mut TaskContext<O>) -> Result<(), TaskError> {
        let shared_output = ctx.output_connector();
        for pipeline_id in 0..self.num_pipelines {
            let mut graph = self
                .template
                .copy_for_pipeline(pipeline_id, self.num_pipelines);
            if let Some(output) = &shared_output {
                graph.set_output_connector(Arc::clone(output));
            }
            let input = graph.input_connector();
            let mut runtime = Runtime::new(graph);
            runtime.execute()?;
            tracing::debug!(pipeline_id, "pipeline replica started");
            self.replicas.push(Replica { input, runtime });
        }
        Ok(())
    }

    fn execute(&mut self, item: I, _ctx: &mut TaskContext<O>) -> Result<(), TaskError> {
        let mut rule = self.rule.lock().expect("ExecutionPipeline::execute: [1]");
        for (pipeline_id, replica) in self.replicas.iter().enumerate() {
            if rule.can_process(&item, pipeline_id) {
                replica.input.produce(item.clone());
            }
        }
        Ok(())
    }

    fn shutdown(&mut self, _ctx: &mut TaskContext<O>) -> Result<(), TaskError> {
        for replica in &self.replicas {
            replica.input.producer_finished();
        }
        // Join every replica before reporting, so no inner worker outlives
        // the pipeline's own producer registrations.
        let mut first: Option<RuntimeError> = None;
        for replica in &mut self.replicas {
            if let Err(error) = replica.runtime.wait() {
                first.get_or_insert(error);
            }
        }
        match first {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    fn copy(&self) -> Box<dyn Task<I, O>> {
        Box::new(Self {
            name: self.name.clone(),
            num_pipelines: self.num_pipelines,
            template: self.template.copy(),
            rule: Arc::clone(&self.rule),
            replicas: Vec::new(),
        })
    }

    fn name(&self) -> String {
        let rule = self.rule.lock().expect("ExecutionPipeline::name: [1]");
        format!("{}(x{}, {})", self.name, self.num_pipelines, rule.name())
    }
}
