use crate::graph::{GraphError, TaskGraphConf};
use crate::manager::panic_message;
use crate::task::TaskError;
use std::thread::{self, JoinHandle};
use thiserror::Error;

/// Error surfaced after the runtime joins its workers, or while wiring the
/// graph on execute.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// A task hook returned an error; its worker terminated and downstream
    /// tasks were allowed to drain.
    #[error("task `{task}` failed: {source}")]
    Task {
        /// Name of the failing task.
        task: String,
        /// The error the task returned.
        source: TaskError,
    },
    /// A worker thread panicked inside a task hook.
    #[error("worker for task `{task}` panicked: {message}")]
    Panic {
        /// Name of the task whose worker panicked.
        task: String,
        /// Rendered panic payload.
        message: String,
    },
    /// The graph could not be wired.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Executes a finalized graph: one OS thread per task-manager replica,
/// pinned to its task for the task's entire lifetime.
///
/// ```no_run
/// # use stg::{graph::TaskGraphConf, runtime::Runtime};
/// # let graph: TaskGraphConf<u32, u32> = TaskGraphConf::new();
/// let mut runtime = Runtime::new(graph);
/// runtime.execute()?;
/// for item in 0..5 {
///     runtime.produce(item);
/// }
/// runtime.finish_producing();
/// while let Some(out) = runtime.consume() {
///     println!("{out}");
/// }
/// runtime.wait()?;
/// # Ok::<(), stg::runtime::RuntimeError>(())
/// ```
pub struct Runtime<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    graph: TaskGraphConf<I, O>,
    workers: Vec<JoinHandle<Result<(), RuntimeError>>>,
    executed: bool,
}

impl<I, O> Runtime<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Takes ownership of `graph`; access its external connectors through
    /// the delegating methods below.
    #[must_use]
    pub fn new(graph: TaskGraphConf<I, O>) -> Self {
        Self {
            graph,
            workers: Vec::new(),
            executed: false,
        }
    }

    /// Finalizes the graph, replicates each manager to its task's thread
    /// count, and spawns every worker. Idempotent.
    pub fn execute(&mut self) -> Result<(), RuntimeError> {
        if self.executed {
            return Ok(());
        }
        self.graph.finalize()?;
        let managers = self.graph.take_managers();
        tracing::debug!(managers = managers.len(), "launching workers");
        for manager in managers {
            for thread_id in 1..manager.num_threads() {
                let replica = manager.replicate(thread_id);
                self.workers.push(thread::spawn(move || replica.run()));
            }
            self.workers.push(thread::spawn(move || manager.run()));
        }
        self.executed = true;
        Ok(())
    }

    /// Joins every worker and reports the first latched error. Returns
    /// normally on a clean drain. The runtime never restarts a worker.
    pub fn wait(&mut self) -> Result<(), RuntimeError> {
        let mut first: Option<RuntimeError> = None;
        for worker in self.workers.drain(..) {
            match worker.join() {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    first.get_or_insert(error);
                }
                Err(payload) => {
                    // Panics inside task hooks are latched by the manager;
                    // reaching here means the worker died outside of them.
                    first.get_or_insert(RuntimeError::Panic {
                        task: "worker".into(),
                        message: panic_message(payload.as_ref()),
                    });
                }
            }
        }
        match first {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// [`execute`](Runtime::execute) followed by [`wait`](Runtime::wait).
    /// The graph input must already be fully produced (or fed by another
    /// thread), otherwise this blocks forever.
    pub fn execute_and_wait(&mut self) -> Result<(), RuntimeError> {
        self.execute()?;
        self.wait()
    }

    /// Feeds one item into the graph's external input.
    pub fn produce(&self, item: I) {
        self.graph.produce(item);
    }

    /// Retires the driving thread's producer registration on the graph
    /// input. Call exactly once, after the last `produce`.
    pub fn finish_producing(&self) {
        self.graph.finish_producing();
    }

    /// Pulls the next item from the graph's external output; `None` once
    /// every producer has terminated.
    pub fn consume(&self) -> Option<O> {
        self.graph.consume()
    }

    /// The graph this runtime drives.
    pub fn graph(&self) -> &TaskGraphConf<I, O> {
        &self.graph
    }
}
