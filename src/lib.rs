//! Streaming task-graph runtime with typed connectors and replicated
//! workers.
//!
//! This crate executes dataflow pipelines expressed as directed graphs whose
//! nodes are user-defined tasks and whose edges are typed FIFO queues. It:
//! - Binds every task replica to its own OS worker thread for the task's
//!   entire lifetime; no migration, no work stealing.
//! - Routes termination backwards through per-connector producer counts, so
//!   a consumer observes end-of-stream exactly when every upstream worker
//!   has shut down and the queue has drained.
//! - Replicates tasks (and whole sub-graphs, via execution pipelines) from
//!   user-provided `copy` implementations, wiring the clones through
//!   re-applied edge descriptors.
//! - Manages fixed pools of reusable buffers whose exhaustion back-pressures
//!   producers, with pluggable release policies.
//!
//! Key modules:
//! - `connector`: the typed MPMC queue with producer counting and sticky
//!   termination.
//! - `task`: the `Task` trait implemented by user code and the
//!   `TaskContext` it talks back through.
//! - `rule`: conditional fan-out via `Bookkeeper` tasks evaluating stateful
//!   `Rule`s in registration order.
//! - `memory`: pooled buffers (`MemoryManager`, `MemoryData`) flowing along
//!   named memory edges.
//! - `graph`: `TaskGraphConf`, the builder owning tasks and declarative
//!   edge descriptors.
//! - `pipeline`: `ExecutionPipeline`, a task replicating an inner graph and
//!   routing inputs by a decomposition rule.
//! - `runtime`: thread spawning, joining, and error reporting.
//!
//! Quick start:
//! 1. Implement [`task::Task`] for each processing stage; emit results via
//!    [`task::TaskContext::add_result`].
//! 2. Register the stages on a [`graph::TaskGraphConf`] and wire them with
//!    `add_edge` / `add_rule_edge` / `add_memory_edge`; declare the graph's
//!    external ends with `set_graph_consumer` / `add_graph_producer`.
//! 3. Hand the graph to a [`runtime::Runtime`], `execute`, feed the input,
//!    `finish_producing`, drain the output, and `wait`.
//!
//! Termination is monotone and conservation holds per edge: every produced
//! item is consumed by exactly one replica of the downstream group, and a
//! graph of pure tasks yields the same output multiset under any thread
//! count.

/// Typed FIFO edges between task groups.
///
/// Exposes [`Connector`](connector::Connector): multi-producer,
/// multi-consumer, unbounded, with a producer count that drives the
/// termination protocol.
pub mod connector;
/// Graph construction: task registry, typed task handles, and declarative
/// edge descriptors applied at finalize time (and re-applied to copies).
pub mod graph;
mod manager;
/// Pooled memory: allocators, release policies, buffer handles, and the
/// pool-owning memory-manager task.
pub mod memory;
/// Execution pipelines: replicate an inner graph N times and route inputs
/// to replicas through a decomposition rule.
pub mod pipeline;
/// Conditional fan-out: bookkeepers, rules, and rule scheduling.
pub mod rule;
/// Worker-thread spawning, joining, and error surfacing.
pub mod runtime;
mod sync;
/// The user-implementable task contract and its execution context.
pub mod task;
/// Common identifier types and map aliases.
pub mod types;
