pub(crate) mod edge;

use crate::connector::{AnyConnector, Connector};
use crate::graph::edge::{
    EdgeContext, EdgeDescriptor, GraphConsumerEdge, GraphProducerEdge, MemoryEdge,
    ProducerConsumerEdge, RuleEdge,
};
use crate::manager::{AnyTaskManager, TaskManager};
use crate::memory::{MemoryData, MemoryManager};
use crate::pipeline::{DecompositionRule, ExecutionPipeline};
use crate::rule::{shared_rule, Rule, SharedRule};
use crate::task::Task;
use crate::types::{GraphId, IndexMap, TaskId};
use core::marker::PhantomData;
use derive_more::Debug;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Error raised while building or wiring a graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GraphError {
    /// The referenced task is not registered in this graph.
    #[error("task #{id} is not part of this graph")]
    UnknownTask {
        /// Id carried by the offending [`TaskRef`].
        id: TaskId,
    },
    /// The [`TaskRef`] was issued by an unrelated graph.
    #[error("task #{id} belongs to a different graph")]
    ForeignTask {
        /// Id carried by the offending [`TaskRef`].
        id: TaskId,
    },
    /// The producer side of the edge already feeds another connector.
    #[error("producer task `{task}` is already connected to an output")]
    ProducerAlreadyConnected {
        /// Name of the producer task.
        task: String,
    },
    /// The consumer side of the edge already reads from another connector.
    #[error("consumer task `{task}` is already connected to an input")]
    ConsumerAlreadyConnected {
        /// Name of the consumer task.
        task: String,
    },
    /// A memory edge with this name is already attached to the task.
    #[error("task `{task}` already has a memory edge named `{edge}`")]
    DuplicateMemoryEdge {
        /// Name of the getter task.
        task: String,
        /// Duplicated edge name.
        edge: String,
    },
    /// The memory manager is already wired to a memory edge.
    #[error("memory manager `{task}` is already wired to a memory edge")]
    MemoryManagerReused {
        /// Name of the memory manager task.
        task: String,
    },
    /// A rule edge was attached to a task that is not a [`Bookkeeper`].
    ///
    /// [`Bookkeeper`]: crate::rule::Bookkeeper
    #[error("task `{task}` is not a bookkeeper")]
    NotABookkeeper {
        /// Name of the offending task.
        task: String,
    },
    /// An edge tried to wire a connector of the wrong item type.
    #[error("connector type mismatch while wiring task `{task}`")]
    ConnectorTypeMismatch {
        /// Name of the task being wired.
        task: String,
    },
    /// The graph already has a consumer task for its external input.
    #[error("graph already has a consumer task for its input")]
    GraphConsumerAlreadySet,
    /// The graph was already finalized; no further edges can be added.
    #[error("graph is already finalized")]
    AlreadyFinalized,
}

/// Typed handle to a task registered in a [`TaskGraphConf`].
///
/// Refs are `Copy` and remain valid for every copy of the issuing graph,
/// since task ids are stable across copies.
#[derive(Debug)]
pub struct TaskRef<I, O> {
    id: TaskId,
    graph: GraphId,
    #[debug(skip)]
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O> Clone for TaskRef<I, O> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<I, O> Copy for TaskRef<I, O> {}

impl<I, O> TaskRef<I, O> {
    /// Id of the referenced task.
    pub fn id(&self) -> TaskId {
        self.id
    }
}

static NEXT_GRAPH_ID: AtomicU32 = AtomicU32::new(0);

/// A dataflow graph under construction: owns its tasks, the declarative
/// edge descriptors wiring them, and the graph's external input and output
/// connectors.
///
/// `I` and `O` are the types entering and leaving the graph. Build the
/// graph with the `add_*` methods, then hand it to a
/// [`Runtime`](crate::runtime::Runtime). The external input starts with one
/// registered producer, the driving thread; call
/// [`finish_producing`](TaskGraphConf::finish_producing) once it will
/// produce no more (immediately, if nothing feeds the graph from outside).
pub struct TaskGraphConf<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    graph_id: GraphId,
    next_task: u16,
    managers: IndexMap<TaskId, Box<dyn AnyTaskManager>>,
    edges: Vec<Box<dyn EdgeDescriptor>>,
    graph_consumer: Option<TaskId>,
    input: Arc<Connector<I>>,
    output: Arc<Connector<O>>,
    pipeline_id: usize,
    num_pipelines: usize,
    finalized: bool,
}

impl<I, O> TaskGraphConf<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        let input = Arc::new(Connector::new());
        // The driving thread counts as a producer for the graph input until
        // `finish_producing` retires it.
        input.register_producers(1);
        Self {
            graph_id: NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed),
            next_task: 0,
            managers: IndexMap::default(),
            edges: Vec::new(),
            graph_consumer: None,
            input,
            output: Arc::new(Connector::new()),
            pipeline_id: 0,
            num_pipelines: 1,
            finalized: false,
        }
    }

    /// Registers a task, returning a typed handle for wiring edges.
    pub fn add_task<T, TI, TO>(&mut self, task: T) -> TaskRef<TI, TO>
    where
        T: Task<TI, TO> + 'static,
        TI: Send + 'static,
        TO: Send + 'static,
    {
        self.add_boxed_task(Box::new(task))
    }

    fn add_boxed_task<TI, TO>(&mut self, task: Box<dyn Task<TI, TO>>) -> TaskRef<TI, TO>
    where
        TI: Send + 'static,
        TO: Send + 'static,
    {
        self.next_task = self
            .next_task
            .checked_add(1)
            .expect("TaskGraphConf::add_task: [1]");
        let id = TaskId::new(self.next_task).expect("TaskGraphConf::add_task: [2]");
        self.managers
            .insert(id, Box::new(TaskManager::new(id, task)));
        TaskRef {
            id,
            graph: self.graph_id,
            _marker: PhantomData,
        }
    }

    /// Declares a dataflow edge from `producer` to `consumer`. The item
    /// type of the connecting queue is checked at compile time.
    pub fn add_edge<A, B, C>(
        &mut self,
        producer: &TaskRef<A, B>,
        consumer: &TaskRef<B, C>,
    ) -> Result<(), GraphError>
    where
        A: Send + 'static,
        B: Send + 'static,
        C: Send + 'static,
    {
        self.ensure_open()?;
        self.check_ref(producer)?;
        self.check_ref(consumer)?;
        self.edges.push(Box::new(ProducerConsumerEdge::<B>::new(
            producer.id,
            consumer.id,
        )));
        Ok(())
    }

    /// Attaches `rule` to `bookkeeper`, routing its emissions to `consumer`.
    /// Rules are evaluated in the order their edges were added.
    pub fn add_rule_edge<A, B, C>(
        &mut self,
        bookkeeper: &TaskRef<A, ()>,
        rule: impl Rule<A, B> + 'static,
        consumer: &TaskRef<B, C>,
    ) -> Result<(), GraphError>
    where
        A: Send + 'static,
        B: Send + 'static,
        C: Send + 'static,
    {
        self.add_rule_edge_shared(bookkeeper, shared_rule(rule), consumer)
    }

    /// Like [`add_rule_edge`](TaskGraphConf::add_rule_edge) for a rule that
    /// is shared across edges, or across pipeline replicas that must
    /// coordinate through it.
    pub fn add_rule_edge_shared<A, B, C>(
        &mut self,
        bookkeeper: &TaskRef<A, ()>,
        rule: SharedRule<A, B>,
        consumer: &TaskRef<B, C>,
    ) -> Result<(), GraphError>
    where
        A: Send + 'static,
        B: Send + 'static,
        C: Send + 'static,
    {
        self.ensure_open()?;
        self.check_ref(bookkeeper)?;
        self.check_ref(consumer)?;
        self.edges
            .push(Box::new(RuleEdge::new(bookkeeper.id, consumer.id, rule)));
        Ok(())
    }

    /// Establishes a named memory channel between `getter` and `manager`.
    /// The manager is consumed: one instance serves exactly one edge.
    pub fn add_memory_edge<T, A, B>(
        &mut self,
        name: impl Into<String>,
        getter: &TaskRef<A, B>,
        manager: MemoryManager<T>,
    ) -> Result<(), GraphError>
    where
        T: Send + 'static,
        A: Send + 'static,
        B: Send + 'static,
    {
        self.ensure_open()?;
        self.check_ref(getter)?;
        let manager_ref = self.add_task(manager);
        self.edges.push(Box::new(MemoryEdge::<T>::new(
            name.into(),
            getter.id,
            manager_ref.id,
        )));
        Ok(())
    }

    /// Declares the task fed by the graph's external input.
    pub fn set_graph_consumer<B>(&mut self, task: &TaskRef<I, B>) -> Result<(), GraphError>
    where
        B: Send + 'static,
    {
        self.ensure_open()?;
        self.check_ref(task)?;
        if self.graph_consumer.is_some() {
            return Err(GraphError::GraphConsumerAlreadySet);
        }
        self.graph_consumer = Some(task.id);
        self.edges.push(Box::new(GraphConsumerEdge::<I>::new(task.id)));
        Ok(())
    }

    /// Declares a task whose output leaves the graph. Several producers may
    /// feed the external output.
    pub fn add_graph_producer<A>(&mut self, task: &TaskRef<A, O>) -> Result<(), GraphError>
    where
        A: Send + 'static,
    {
        self.ensure_open()?;
        self.check_ref(task)?;
        self.edges.push(Box::new(GraphProducerEdge::<O>::new(task.id)));
        Ok(())
    }

    /// Replicates `inner` as an [`ExecutionPipeline`] task inside this
    /// graph, routing its inputs with `rule`.
    pub fn add_execution_pipeline<PI, PO>(
        &mut self,
        num_pipelines: usize,
        inner: TaskGraphConf<PI, PO>,
        rule: impl DecompositionRule<PI> + 'static,
    ) -> TaskRef<PI, PO>
    where
        PI: Clone + Send + 'static,
        PO: Send + 'static,
    {
        self.add_task(ExecutionPipeline::new(num_pipelines, inner, rule))
    }

    /// Applies every edge descriptor, materializing the connectors.
    /// Idempotent; called implicitly by
    /// [`Runtime::execute`](crate::runtime::Runtime::execute).
    pub fn finalize(&mut self) -> Result<(), GraphError> {
        if self.finalized {
            return Ok(());
        }
        let Self {
            managers,
            edges,
            input,
            output,
            pipeline_id,
            num_pipelines,
            ..
        } = self;
        for manager in managers.values_mut() {
            manager.set_pipeline(*pipeline_id, *num_pipelines);
        }
        let mut ctx = EdgeContext {
            managers,
            graph_input: Arc::clone(input) as Arc<dyn AnyConnector>,
            graph_output: Arc::clone(output) as Arc<dyn AnyConnector>,
        };
        for edge in edges.iter() {
            edge.apply(&mut ctx)?;
        }
        self.finalized = true;
        Ok(())
    }

    /// Clones the graph: independent task instances via [`Task::copy`]
    /// under the same ids, copied descriptors, fresh external connectors.
    #[must_use]
    pub fn copy(&self) -> Self {
        self.copy_for_pipeline(self.pipeline_id, self.num_pipelines)
    }

    pub(crate) fn copy_for_pipeline(&self, pipeline_id: usize, num_pipelines: usize) -> Self {
        let input = Arc::new(Connector::new());
        input.register_producers(1);
        Self {
            graph_id: self.graph_id,
            next_task: self.next_task,
            managers: self
                .managers
                .iter()
                .map(|(id, manager)| (*id, manager.copy_for_graph()))
                .collect(),
            edges: self.edges.iter().map(|edge| edge.copy()).collect(),
            graph_consumer: self.graph_consumer,
            input,
            output: Arc::new(Connector::new()),
            pipeline_id,
            num_pipelines,
            finalized: false,
        }
    }

    /// Feeds one item into the graph's external input.
    pub fn produce(&self, item: I) {
        self.input.produce(item);
    }

    /// Retires the driving thread's producer registration on the external
    /// input. Call exactly once, after the last `produce`.
    pub fn finish_producing(&self) {
        self.input.producer_finished();
    }

    /// Pulls the next item from the graph's external output, blocking while
    /// producers remain. `None` once the output has terminated.
    pub fn consume(&self) -> Option<O> {
        self.output.consume()
    }

    /// Whether the external output has terminated.
    pub fn is_output_terminated(&self) -> bool {
        self.output.is_terminated()
    }

    /// Returns a buffer to its originating memory manager from outside the
    /// graph, for consumers that drain the graph output and release pooled
    /// memory found in it.
    pub fn release_memory<T: Send + 'static>(&self, data: MemoryData<T>) {
        data.release();
    }

    pub(crate) fn input_connector(&self) -> Arc<Connector<I>> {
        Arc::clone(&self.input)
    }

    pub(crate) fn set_output_connector(&mut self, output: Arc<Connector<O>>) {
        debug_assert!(!self.finalized, "TaskGraphConf::set_output_connector: [1]");
        self.output = output;
    }

    pub(crate) fn take_managers(&mut self) -> Vec<Box<dyn AnyTaskManager>> {
        self.managers.drain(..).map(|(_, manager)| manager).collect()
    }

    fn ensure_open(&self) -> Result<(), GraphError> {
        if self.finalized {
            return Err(GraphError::AlreadyFinalized);
        }
        Ok(())
    }

    fn check_ref<A, B>(&self, task: &TaskRef<A, B>) -> Result<(), GraphError> {
        if task.graph != self.graph_id {
            return Err(GraphError::ForeignTask { id: task.id });
        }
        if !self.managers.contains_key(&task.id) {
            return Err(GraphError::UnknownTask { id: task.id });
        }
        Ok(())
    }
}

impl<I, O> Default for TaskGraphConf<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
