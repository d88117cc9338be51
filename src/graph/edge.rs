use crate::connector::{downcast_connector, AnyConnector, Connector};
use crate::graph::GraphError;
use crate::manager::AnyTaskManager;
use crate::memory::MemoryData;
use crate::rule::{Bookkeeper, RuleScheduler, SharedRule};
use crate::task::MemoryEdgePair;
use crate::types::{IndexMap, TaskId};
use core::marker::PhantomData;
use std::sync::Arc;

/// Wiring view of a graph handed to descriptors while they are applied:
/// the manager registry plus the graph's external connectors, type-erased.
pub(crate) struct EdgeContext<'a> {
    pub(crate) managers: &'a mut IndexMap<TaskId, Box<dyn AnyTaskManager>>,
    pub(crate) graph_input: Arc<dyn AnyConnector>,
    pub(crate) graph_output: Arc<dyn AnyConnector>,
}

impl EdgeContext<'_> {
    fn manager_mut(&mut self, id: TaskId) -> Result<&mut Box<dyn AnyTaskManager>, GraphError> {
        self.managers
            .get_mut(&id)
            .ok_or(GraphError::UnknownTask { id })
    }

    /// Returns the consumer's input connector, creating and wiring a fresh
    /// one typed `M` when no edge has touched the consumer yet.
    fn consumer_input<M: Send + 'static>(
        &mut self,
        consumer: TaskId,
    ) -> Result<Arc<Connector<M>>, GraphError> {
        let manager = self.manager_mut(consumer)?;
        match manager.input_any() {
            Some(existing) => {
                downcast_connector::<M>(&existing).ok_or_else(|| GraphError::ConnectorTypeMismatch {
                    task: manager.name(),
                })
            }
            None => {
                let connector = Arc::new(Connector::<M>::new());
                manager.set_input_any(connector.clone())?;
                Ok(connector)
            }
        }
    }
}

/// Deferred wiring instruction. Descriptors capture their endpoints by task
/// id; because ids are stable across graph copies, a copied descriptor
/// re-resolves its endpoints against the copy's registry directly.
pub(crate) trait EdgeDescriptor: Send {
    fn apply(&self, graph: &mut EdgeContext<'_>) -> Result<(), GraphError>;
    fn copy(&self) -> Box<dyn EdgeDescriptor>;
}

/// Plain dataflow edge: producer's output connector becomes the consumer's
/// input connector, carrying items of type `M`.
pub(crate) struct ProducerConsumerEdge<M> {
    producer: TaskId,
    consumer: TaskId,
    _carries: PhantomData<fn() -> M>,
}

impl<M> ProducerConsumerEdge<M> {
    pub(crate) fn new(producer: TaskId, consumer: TaskId) -> Self {
        Self {
            producer,
            consumer,
            _carries: PhantomData,
        }
    }
}

impl<M: Send + 'static> EdgeDescriptor for ProducerConsumerEdge<M> {
    fn apply(&self, graph: &mut EdgeContext<'_>) -> Result<(), GraphError> {
        let connector = graph.consumer_input::<M>(self.consumer)?;
        let producer = graph.manager_mut(self.producer)?;
        if producer.output_any().is_some() {
            return Err(GraphError::ProducerAlreadyConnected {
                task: producer.name(),
            });
        }
        connector.register_producers(producer.num_threads());
        producer.set_output_any(connector)?;
        Ok(())
    }

    fn copy(&self) -> Box<dyn EdgeDescriptor> {
        Box::new(Self::new(self.producer, self.consumer))
    }
}

/// Routing edge: attaches a rule to a bookkeeper, materializing a scheduler
/// bound to the consumer's input connector.
pub(crate) struct RuleEdge<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    bookkeeper: TaskId,
    consumer: TaskId,
    rule: SharedRule<T, U>,
}

impl<T, U> RuleEdge<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    pub(crate) fn new(bookkeeper: TaskId, consumer: TaskId, rule: SharedRule<T, U>) -> Self {
        Self {
            bookkeeper,
            consumer,
            rule,
        }
    }
}

impl<T, U> EdgeDescriptor for RuleEdge<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn apply(&self, graph: &mut EdgeContext<'_>) -> Result<(), GraphError> {
        let connector = graph.consumer_input::<U>(self.consumer)?;
        // One producer per scheduler: bookkeepers are single-threaded.
        connector.register_producers(1);
        let manager = graph.manager_mut(self.bookkeeper)?;
        let name = manager.name();
        let bookkeeper = manager
            .task_as_any_mut()
            .and_then(|task| task.downcast_mut::<Bookkeeper<T>>())
            .ok_or(GraphError::NotABookkeeper { task: name })?;
        bookkeeper.add_scheduler(Box::new(RuleScheduler::new(
            Arc::clone(&self.rule),
            connector,
        )));
        Ok(())
    }

    fn copy(&self) -> Box<dyn EdgeDescriptor> {
        // The rule itself is shared, not copied: replicas coordinate
        // through its lock.
        Box::new(Self::new(
            self.bookkeeper,
            self.consumer,
            Arc::clone(&self.rule),
        ))
    }
}

/// Memory edge: wires a getter task to a memory manager through a pair of
/// connectors: free buffers flow from the manager to the getter, returned
/// handles flow back.
pub(crate) struct MemoryEdge<T: Send + 'static> {
    name: String,
    getter: TaskId,
    manager: TaskId,
    _carries: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> MemoryEdge<T> {
    pub(crate) fn new(name: String, getter: TaskId, manager: TaskId) -> Self {
        Self {
            name,
            getter,
            manager,
            _carries: PhantomData,
        }
    }
}

impl<T: Send + 'static> EdgeDescriptor for MemoryEdge<T> {
    fn apply(&self, graph: &mut EdgeContext<'_>) -> Result<(), GraphError> {
        let getter = graph.manager_mut(self.getter)?;
        if getter.has_memory_edge(&self.name) {
            return Err(GraphError::DuplicateMemoryEdge {
                task: getter.name(),
                edge: self.name.clone(),
            });
        }
        let getter_threads = getter.num_threads();

        let get_connector: Arc<Connector<MemoryData<T>>> = Arc::new(Connector::new());
        let release_connector: Arc<Connector<MemoryData<T>>> = Arc::new(Connector::new());
        get_connector.register_producers(1);
        release_connector.register_producers(getter_threads);

        let manager = graph.manager_mut(self.manager)?;
        if manager.input_any().is_some() || manager.output_any().is_some() {
            return Err(GraphError::MemoryManagerReused {
                task: manager.name(),
            });
        }
        manager.set_input_any(release_connector.clone())?;
        manager.set_output_any(get_connector.clone())?;

        let getter = graph.manager_mut(self.getter)?;
        getter.attach_memory_edge(
            self.name.clone(),
            MemoryEdgePair {
                get: get_connector,
                release: release_connector,
            },
        )
    }

    fn copy(&self) -> Box<dyn EdgeDescriptor> {
        Box::new(Self::new(self.name.clone(), self.getter, self.manager))
    }
}

/// Declares the task that consumes the graph's external input.
pub(crate) struct GraphConsumerEdge<I> {
    task: TaskId,
    _carries: PhantomData<fn() -> I>,
}

impl<I> GraphConsumerEdge<I> {
    pub(crate) fn new(task: TaskId) -> Self {
        Self {
            task,
            _carries: PhantomData,
        }
    }
}

impl<I: Send + 'static> EdgeDescriptor for GraphConsumerEdge<I> {
    fn apply(&self, graph: &mut EdgeContext<'_>) -> Result<(), GraphError> {
        let input = Arc::clone(&graph.graph_input);
        let manager = graph.manager_mut(self.task)?;
        if manager.input_any().is_some() {
            return Err(GraphError::ConsumerAlreadyConnected {
                task: manager.name(),
            });
        }
        manager.set_input_any(input)
    }

    fn copy(&self) -> Box<dyn EdgeDescriptor> {
        Box::new(Self::new(self.task))
    }
}

/// Declares a task whose output feeds the graph's external output.
pub(crate) struct GraphProducerEdge<O> {
    task: TaskId,
    _carries: PhantomData<fn() -> O>,
}

impl<O> GraphProducerEdge<O> {
    pub(crate) fn new(task: TaskId) -> Self {
        Self {
            task,
            _carries: PhantomData,
        }
    }
}

impl<O: Send + 'static> EdgeDescriptor for GraphProducerEdge<O> {
    fn apply(&self, graph: &mut EdgeContext<'_>) -> Result<(), GraphError> {
        let output = Arc::clone(&graph.graph_output);
        let manager = graph.manager_mut(self.task)?;
        if manager.output_any().is_some() {
            return Err(GraphError::ProducerAlreadyConnected {
                task: manager.name(),
            });
        }
        output.register_producers(manager.num_threads());
        manager.set_output_any(output)
    }

    fn copy(&self) -> Box<dyn EdgeDescriptor> {
        Box::new(Self::new(self.task))
    }
}
