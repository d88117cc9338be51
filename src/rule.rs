use crate::connector::Connector;
use crate::task::{Task, TaskContext, TaskError};
use std::any::Any;
use std::sync::{Arc, Mutex};

/// Stateful routing predicate evaluated by a [`Bookkeeper`].
///
/// A rule sees every item that reaches its bookkeeper, in the order rule
/// edges were registered, and emits zero or more items toward its own
/// downstream consumer. Rules may hold state across calls; buffering
/// inputs until a group is complete is the typical use.
///
/// When one rule instance is shared between bookkeeper replicas inside an
/// [`ExecutionPipeline`](crate::pipeline::ExecutionPipeline), calls arrive
/// from several worker threads; sharing goes through a [`SharedRule`] whose
/// lock serializes them. Each bookkeeper serializes its own calls anyway.
pub trait Rule<T, U>: Send
where
    T: Send + 'static,
    U: Send + 'static,
{
    /// Routes one input, returning the items to emit downstream.
    fn apply(&mut self, item: &T, pipeline_id: usize) -> Vec<U>;

    /// Whether this rule agrees to let its bookkeeper terminate. Only
    /// consulted once the bookkeeper's input has finished; return `false`
    /// to hold termination open while state shared with another pipeline
    /// replica can still change.
    fn can_terminate(&mut self, _pipeline_id: usize) -> bool {
        true
    }

    /// Called once per bookkeeper replica during shutdown. Input groups
    /// still buffered at this point will never complete and are dropped
    /// with the rule.
    fn shutdown(&mut self, _pipeline_id: usize) {}

    /// Diagnostic label.
    fn name(&self) -> String {
        "rule".into()
    }
}

/// A rule behind a lock, shareable between bookkeeper replicas.
pub type SharedRule<T, U> = Arc<Mutex<dyn Rule<T, U>>>;

/// Wraps a rule for use on a rule edge; the same `SharedRule` handle may be
/// attached to several edges when replicas must coordinate.
pub fn shared_rule<T, U>(rule: impl Rule<T, U> + 'static) -> SharedRule<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    Arc::new(Mutex::new(rule))
}

/// Binds one rule to one downstream connector.
///
/// The scheduler owns the producer registration it made on its connector
/// and retires it exactly once, at bookkeeper shutdown.
pub(crate) struct RuleScheduler<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    rule: SharedRule<T, U>,
    connector: Arc<Connector<U>>,
    terminated: bool,
}

impl<T, U> RuleScheduler<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    pub(crate) fn new(rule: SharedRule<T, U>, connector: Arc<Connector<U>>) -> Self {
        Self {
            rule,
            connector,
            terminated: false,
        }
    }
}

/// Object-safe face of [`RuleScheduler`] stored by a bookkeeper, erasing
/// the per-rule output type.
pub(crate) trait AnyRuleScheduler<T: Send + 'static>: Send {
    fn execute(&mut self, item: &T, pipeline_id: usize);
    fn can_terminate(&self, pipeline_id: usize) -> bool;
    fn shutdown(&mut self, pipeline_id: usize);
    fn name(&self) -> String;
}

impl<T, U> AnyRuleScheduler<T> for RuleScheduler<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn execute(&mut self, item: &T, pipeline_id: usize) {
        if self.terminated {
            return;
        }
        let mut rule = self.rule.lock().expect("RuleScheduler::execute: [1]");
        for out in rule.apply(item, pipeline_id) {
            self.connector.produce(out);
        }
    }

    fn can_terminate(&self, pipeline_id: usize) -> bool {
        if self.terminated {
            return true;
        }
        self.rule
            .lock()
            .expect("RuleScheduler::can_terminate: [1]")
            .can_terminate(pipeline_id)
    }

    fn shutdown(&mut self, pipeline_id: usize) {
        if !self.terminated {
            self.terminated = true;
            self.connector.producer_finished();
        }
        self.rule
            .lock()
            .expect("RuleScheduler::shutdown: [1]")
            .shutdown(pipeline_id);
    }

    fn name(&self) -> String {
        self.rule
            .lock()
            .expect("RuleScheduler::name: [1]")
            .name()
    }
}

/// Conditional fan-out task: passes every input through its rule schedulers
/// in registration order.
///
/// A bookkeeper is added to a graph like any other task (its output type is
/// `()`: data leaves through rule edges, never a plain edge) and acquires
/// its schedulers when
/// [`TaskGraphConf::add_rule_edge`](crate::graph::TaskGraphConf::add_rule_edge)
/// descriptors are applied. It terminates once its input has finished and
/// every rule agrees.
pub struct Bookkeeper<T: Send + 'static> {
    schedulers: Vec<Box<dyn AnyRuleScheduler<T>>>,
    pipeline_id: usize,
}

impl<T: Send + 'static> Bookkeeper<T> {
    /// Creates a bookkeeper with no rules attached yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            schedulers: Vec::new(),
            pipeline_id: 0,
        }
    }

    pub(crate) fn add_scheduler(&mut self, scheduler: Box<dyn AnyRuleScheduler<T>>) {
        self.schedulers.push(scheduler);
    }
}

impl<T: Send + 'static> Default for Bookkeeper<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Task<T, ()> for Bookkeeper<T> {
    fn initialize(&mut self, ctx: &mut TaskContext<()>) -> Result<(), TaskError> {
        self.pipeline_id = ctx.pipeline_id();
        Ok(())
    }

    fn execute(&mut self, item: T, _ctx: &mut TaskContext<()>) -> Result<(), TaskError> {
        for scheduler in &mut self.schedulers {
            scheduler.execute(&item, self.pipeline_id);
        }
        Ok(())
    }

    fn shutdown(&mut self, _ctx: &mut TaskContext<()>) -> Result<(), TaskError> {
        for scheduler in &mut self.schedulers {
            scheduler.shutdown(self.pipeline_id);
        }
        Ok(())
    }

    fn can_terminate(&mut self, _input: Option<&Connector<T>>) -> bool {
        self.schedulers
            .iter()
            .all(|scheduler| scheduler.can_terminate(self.pipeline_id))
    }

    // A copy starts empty: rule edges are re-applied against the copy when
    // its graph is wired, rebinding the shared rules to the copy's
    // connectors.
    fn copy(&self) -> Box<dyn Task<T, ()>> {
        Box::new(Self::new())
    }

    fn name(&self) -> String {
        let rules: Vec<_> = self.schedulers.iter().map(|s| s.name()).collect();
        format!("bookkeeper[{}]", rules.join(", "))
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        Some(self)
    }
}
