use crate::connector::{downcast_connector, AnyConnector, Connector};
use crate::graph::GraphError;
use crate::runtime::RuntimeError;
use crate::sync::yield_now;
use crate::task::{MemoryEdgePair, MemoryEdges, Task, TaskContext, TaskError};
use crate::types::TaskId;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Drives one task instance on one worker thread.
///
/// A task declared with `k` threads is handled by `k` managers (the
/// original plus `k - 1` replicas made via [`Task::copy`]), all sharing the
/// same input and output connectors but each owning its task instance and
/// thread ordinal. Producer counts on the shared connectors are registered
/// per replica when edges are applied, and every replica retires its own
/// registrations on exit, success or failure alike, so downstream tasks
/// always drain.
pub(crate) struct TaskManager<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    id: TaskId,
    name: String,
    task: Box<dyn Task<I, O>>,
    input: Option<Arc<Connector<I>>>,
    output: Option<Arc<Connector<O>>>,
    memory_edges: MemoryEdges,
    num_threads: usize,
    thread_id: usize,
    pipeline_id: usize,
    num_pipelines: usize,
}

impl<I, O> TaskManager<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub(crate) fn new(id: TaskId, task: Box<dyn Task<I, O>>) -> Self {
        let name = task.name();
        let num_threads = task.num_threads().max(1);
        Self {
            id,
            name,
            task,
            input: None,
            output: None,
            memory_edges: MemoryEdges::default(),
            num_threads,
            thread_id: 0,
            pipeline_id: 0,
            num_pipelines: 1,
        }
    }

    /// The worker loop: initialize, pull-and-execute until the input is
    /// finished and the task agrees to stop, then shut down. The manager
    /// yields between termination re-polls so a task holding out (via a
    /// shared rule, say) does not starve runnable workers.
    fn drive(&mut self, ctx: &mut TaskContext<O>) -> Result<(), TaskError> {
        self.task.initialize(ctx)?;
        loop {
            let item = match &self.input {
                Some(input) => match input.consume() {
                    Some(item) => item,
                    None => {
                        if self.task.can_terminate(Some(input.as_ref())) {
                            break;
                        }
                        yield_now();
                        continue;
                    }
                },
                None => {
                    if self.task.can_terminate(None) {
                        break;
                    }
                    yield_now();
                    continue;
                }
            };
            self.task.execute(item, ctx)?;
        }
        self.task.shutdown(ctx)
    }
}

/// Object-safe face of [`TaskManager`], erasing the input/output types so a
/// graph can hold and wire heterogeneous managers in one registry.
pub(crate) trait AnyTaskManager: Send {
    fn name(&self) -> String;
    fn num_threads(&self) -> usize;
    fn set_pipeline(&mut self, pipeline_id: usize, num_pipelines: usize);
    fn input_any(&self) -> Option<Arc<dyn AnyConnector>>;
    fn output_any(&self) -> Option<Arc<dyn AnyConnector>>;
    fn set_input_any(&mut self, connector: Arc<dyn AnyConnector>) -> Result<(), GraphError>;
    fn set_output_any(&mut self, connector: Arc<dyn AnyConnector>) -> Result<(), GraphError>;
    fn has_memory_edge(&self, name: &str) -> bool;
    fn attach_memory_edge(&mut self, name: String, pair: MemoryEdgePair)
        -> Result<(), GraphError>;
    fn task_as_any_mut(&mut self) -> Option<&mut dyn Any>;
    /// Duplicate for a graph copy: same id, fresh task instance, no wiring.
    fn copy_for_graph(&self) -> Box<dyn AnyTaskManager>;
    /// Duplicate for thread replication: fresh task instance sharing this
    /// manager's connectors and memory edges, under the given ordinal.
    fn replicate(&self, thread_id: usize) -> Box<dyn AnyTaskManager>;
    fn run(self: Box<Self>) -> Result<(), RuntimeError>;
}

impl<I, O> AnyTaskManager for TaskManager<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn name(&self) -> String {
        self.name.clone()
    }

    fn num_threads(&self) -> usize {
        self.num_threads
    }

    fn set_pipeline(&mut self, pipeline_id: usize, num_pipelines: usize) {
        self.pipeline_id = pipeline_id;
        self.num_pipelines = num_pipelines;
    }

    fn input_any(&self) -> Option<Arc<dyn AnyConnector>> {
        self.input
            .clone()
            .map(|connector| connector as Arc<dyn AnyConnector>)
    }

    fn output_any(&self) -> Option<Arc<dyn AnyConnector>> {
        self.output
            .clone()
            .map(|connector| connector as Arc<dyn AnyConnector>)
    }

    fn set_input_any(&mut self, connector: Arc<dyn AnyConnector>) -> Result<(), GraphError> {
        let connector =
            downcast_connector::<I>(&connector).ok_or_else(|| GraphError::ConnectorTypeMismatch {
                task: self.name.clone(),
            })?;
        self.input = Some(connector);
        Ok(())
    }

    fn set_output_any(&mut self, connector: Arc<dyn AnyConnector>) -> Result<(), GraphError> {
        let connector =
            downcast_connector::<O>(&connector).ok_or_else(|| GraphError::ConnectorTypeMismatch {
                task: self.name.clone(),
            })?;
        self.output = Some(connector);
        Ok(())
    }

    fn has_memory_edge(&self, name: &str) -> bool {
        self.memory_edges.contains_key(name)
    }

    fn attach_memory_edge(
        &mut self,
        name: String,
        pair: MemoryEdgePair,
    ) -> Result<(), GraphError> {
        if self.memory_edges.contains_key(&name) {
            return Err(GraphError::DuplicateMemoryEdge {
                task: self.name.clone(),
                edge: name,
            });
        }
        self.memory_edges.insert(name, pair);
        Ok(())
    }

    fn task_as_any_mut(&mut self) -> Option<&mut dyn Any> {
        self.task.as_any_mut()
    }

    fn copy_for_graph(&self) -> Box<dyn AnyTaskManager> {
        Box::new(TaskManager {
            id: self.id,
            name: self.name.clone(),
            task: self.task.copy(),
            input: None,
            output: None,
            memory_edges: MemoryEdges::default(),
            num_threads: self.num_threads,
            thread_id: 0,
            pipeline_id: self.pipeline_id,
            num_pipelines: self.num_pipelines,
        })
    }

    fn replicate(&self, thread_id: usize) -> Box<dyn AnyTaskManager> {
        Box::new(TaskManager {
            id: self.id,
            name: self.name.clone(),
            task: self.task.copy(),
            input: self.input.clone(),
            output: self.output.clone(),
            memory_edges: self.memory_edges.clone(),
            num_threads: self.num_threads,
            thread_id,
            pipeline_id: self.pipeline_id,
            num_pipelines: self.num_pipelines,
        })
    }

    fn run(mut self: Box<Self>) -> Result<(), RuntimeError> {
        let span = tracing::debug_span!(
            "worker",
            task = %self.name,
            task_id = %self.id,
            pipeline = self.pipeline_id,
            thread = self.thread_id,
        );
        let _enter = span.enter();
        tracing::debug!("worker started");

        let mut ctx = TaskContext::new(
            self.output.clone(),
            self.input
                .clone()
                .map(|connector| connector as Arc<dyn AnyConnector>),
            self.memory_edges.clone(),
            self.pipeline_id,
            self.num_pipelines,
            self.thread_id,
        );
        let outcome = catch_unwind(AssertUnwindSafe(|| self.drive(&mut ctx)));

        // Retire producer registrations whatever happened above, so
        // downstream consumers observe termination instead of hanging.
        if let Some(output) = &self.output {
            output.producer_finished();
        }
        for pair in self.memory_edges.values() {
            pair.release.producer_finished();
        }

        match outcome {
            Ok(Ok(())) => {
                tracing::debug!("worker terminated");
                Ok(())
            }
            Ok(Err(source)) => {
                tracing::error!(error = %source, "task failed");
                Err(RuntimeError::Task {
                    task: self.name.clone(),
                    source,
                })
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(%message, "worker panicked");
                Err(RuntimeError::Panic {
                    task: self.name.clone(),
                    message,
                })
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
