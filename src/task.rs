use crate::connector::{downcast_connector, AnyConnector, Connector};
use crate::memory::{CountReleaseRule, MemoryData, MemoryError, MemoryReleaseRule};
use crate::types::HashMap;
use std::any::Any;
use std::error::Error;
use std::sync::Arc;

/// Error type carried out of a failing task hook.
///
/// Task failures are fatal for the worker that hit them: the worker stops its
/// loop, retires its producer registrations so downstream tasks can drain,
/// and the error surfaces from [`Runtime::wait`](crate::runtime::Runtime::wait).
pub type TaskError = Box<dyn Error + Send + Sync + 'static>;

/// A single unit of computation in the graph, transforming items of type `I`
/// into zero or more items of type `O`.
///
/// One task instance is driven by one worker thread. Declaring
/// [`num_threads`](Task::num_threads) above one replicates the task:
/// [`copy`](Task::copy) produces the extra instances, every replica shares
/// the group's input and output connectors, and items are split between
/// replicas rather than duplicated.
///
/// Lifecycle on the worker thread: [`initialize`](Task::initialize) once,
/// [`execute`](Task::execute) per input item, then, once the input reports
/// finished and [`can_terminate`](Task::can_terminate) agrees,
/// [`shutdown`](Task::shutdown) once.
pub trait Task<I, O>: Send
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Called once, before any `execute`, on the worker thread. A source task
    /// may already emit items here via [`TaskContext::add_result`].
    fn initialize(&mut self, _ctx: &mut TaskContext<O>) -> Result<(), TaskError> {
        Ok(())
    }

    /// Processes one input item. Results go out through
    /// [`TaskContext::add_result`], zero or more per call.
    fn execute(&mut self, item: I, ctx: &mut TaskContext<O>) -> Result<(), TaskError>;

    /// Called once after the loop ends, before the worker retires its
    /// producer registrations downstream.
    fn shutdown(&mut self, _ctx: &mut TaskContext<O>) -> Result<(), TaskError> {
        Ok(())
    }

    /// Consulted when the input connector has terminated. Returning `false`
    /// keeps the worker polling (it yields between polls); this is only
    /// meaningful when some other party, such as a rule shared with another
    /// pipeline replica, can still change the answer.
    fn can_terminate(&mut self, _input: Option<&Connector<I>>) -> bool {
        true
    }

    /// Produces an equivalent, independent instance. Used for thread
    /// replication and for graph copies; replicas share nothing through this
    /// call unless the implementation deliberately clones shared handles.
    fn copy(&self) -> Box<dyn Task<I, O>>;

    /// Diagnostic label.
    fn name(&self) -> String {
        "task".into()
    }

    /// Number of worker threads this task runs with.
    fn num_threads(&self) -> usize {
        1
    }

    #[doc(hidden)]
    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        None
    }
}

pub(crate) type MemoryEdges = HashMap<String, MemoryEdgePair>;

#[derive(Clone)]
pub(crate) struct MemoryEdgePair {
    pub(crate) get: Arc<dyn AnyConnector>,
    pub(crate) release: Arc<dyn AnyConnector>,
}

/// Per-worker handle a task uses to talk back to its manager: emitting
/// results, pulling and releasing pooled memory, and querying its replica
/// identity.
pub struct TaskContext<O: Send + 'static> {
    output: Option<Arc<Connector<O>>>,
    input: Option<Arc<dyn AnyConnector>>,
    memory_edges: MemoryEdges,
    pipeline_id: usize,
    num_pipelines: usize,
    thread_id: usize,
}

impl<O: Send + 'static> TaskContext<O> {
    pub(crate) fn new(
        output: Option<Arc<Connector<O>>>,
        input: Option<Arc<dyn AnyConnector>>,
        memory_edges: MemoryEdges,
        pipeline_id: usize,
        num_pipelines: usize,
        thread_id: usize,
    ) -> Self {
        Self {
            output,
            input,
            memory_edges,
            pipeline_id,
            num_pipelines,
            thread_id,
        }
    }

    /// Emits one result to the task's output connector. Silently discards
    /// the item when the task has no output wired (a sink).
    pub fn add_result(&self, item: O) {
        if let Some(output) = &self.output {
            output.produce(item);
        }
    }

    /// Pulls a free buffer from the named memory edge, blocking while the
    /// pool is exhausted. The handle is returned with the default
    /// release-once policy.
    pub fn get_memory<T: Send + 'static>(&self, name: &str) -> Result<MemoryData<T>, MemoryError> {
        self.get_memory_with_rule(name, Box::new(CountReleaseRule::new(1)))
    }

    /// Like [`get_memory`](TaskContext::get_memory), but attaches a caller
    /// supplied release policy to the handle.
    pub fn get_memory_with_rule<T: Send + 'static>(
        &self,
        name: &str,
        rule: Box<dyn MemoryReleaseRule>,
    ) -> Result<MemoryData<T>, MemoryError> {
        let pair = self
            .memory_edges
            .get(name)
            .ok_or_else(|| MemoryError::UnknownEdge { edge: name.into() })?;
        let connector = downcast_connector::<MemoryData<T>>(&pair.get)
            .ok_or_else(|| MemoryError::EdgeTypeMismatch { edge: name.into() })?;
        let mut data = connector
            .consume()
            .ok_or_else(|| MemoryError::PoolTerminated { edge: name.into() })?;
        data.set_release_rule(rule);
        Ok(data)
    }

    /// Sends a buffer back to its originating memory manager, which recycles
    /// or parks it according to the handle's release policy.
    pub fn release_memory<T: Send + 'static>(&self, data: MemoryData<T>) {
        data.release();
    }

    /// Whether a memory edge with this name is attached to the task.
    pub fn has_memory_edge(&self, name: &str) -> bool {
        self.memory_edges.contains_key(name)
    }

    /// Id of the pipeline replica this worker belongs to (0 outside of any
    /// [`ExecutionPipeline`](crate::pipeline::ExecutionPipeline)).
    pub fn pipeline_id(&self) -> usize {
        self.pipeline_id
    }

    /// Total number of pipeline replicas in this worker's pipeline group.
    pub fn num_pipelines(&self) -> usize {
        self.num_pipelines
    }

    /// Ordinal of this worker within the task's replication group.
    pub fn thread_id(&self) -> usize {
        self.thread_id
    }

    pub(crate) fn output_connector(&self) -> Option<Arc<Connector<O>>> {
        self.output.clone()
    }

    pub(crate) fn input_connector<I: Send + 'static>(&self) -> Option<Arc<Connector<I>>> {
        self.input.as_ref().and_then(downcast_connector)
    }
}
