use crate::sync::{Condvar, Mutex, MutexGuard};
use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

/// Typed FIFO edge between task groups.
///
/// A connector carries items of type `T` from one group of producing workers
/// to one group of consuming workers. Alongside the queue it tracks a
/// *producer count*: the number of workers still alive upstream. Consumers
/// block in [`consume`](Connector::consume) while the queue is empty and at
/// least one producer remains; once the count reaches zero and the queue
/// drains, the connector is terminated and every subsequent `consume`
/// returns `None` forever.
///
/// Producers never block; backpressure is expressed through memory pools,
/// not queue bounds.
pub struct Connector<T> {
    state: Mutex<State<T>>,
    available: Condvar,
}

struct State<T> {
    queue: VecDeque<T>,
    producers: usize,
}

impl<T> Connector<T> {
    /// Creates an empty connector with no registered producers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                producers: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Enqueues an item and wakes one blocked consumer.
    ///
    /// Accepted even with no producer registered: memory released from
    /// outside the graph arrives on a release connector whose counted
    /// producers may already have retired.
    pub fn produce(&self, item: T) {
        let mut state = self.lock();
        state.queue.push_back(item);
        drop(state);
        self.available.notify_one();
    }

    /// Dequeues the next item, blocking while the connector is live but
    /// empty. Returns `None` only once the connector is terminated, and then
    /// forever after.
    pub fn consume(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if let Some(item) = state.queue.pop_front() {
                return Some(item);
            }
            if state.producers == 0 {
                return None;
            }
            state = self
                .available
                .wait(state)
                .expect("Connector::consume: [1]");
        }
    }

    /// Dequeues the next item if one is immediately available.
    pub fn try_consume(&self) -> Option<T> {
        self.lock().queue.pop_front()
    }

    /// Records `count` additional producers feeding this connector.
    ///
    /// Every producer registered here must eventually be retired through
    /// [`producer_finished`](Connector::producer_finished).
    pub fn register_producers(&self, count: usize) {
        self.lock().producers += count;
    }

    /// Retires one producer. When the last producer retires, all blocked
    /// consumers are woken so they can observe termination.
    pub fn producer_finished(&self) {
        let mut state = self.lock();
        state.producers = state
            .producers
            .checked_sub(1)
            .expect("Connector::producer_finished: [1]");
        let finished = state.producers == 0;
        drop(state);
        if finished {
            self.available.notify_all();
        }
    }

    /// Number of producers still registered.
    pub fn producer_count(&self) -> usize {
        self.lock().producers
    }

    /// Whether the connector has terminated: no producers left and nothing
    /// queued. Termination is monotone: once observed it never reverts.
    pub fn is_terminated(&self) -> bool {
        let state = self.lock();
        state.producers == 0 && state.queue.is_empty()
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().expect("Connector: poisoned mutex")
    }
}

impl<T> Default for Connector<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Type-erased view of a [`Connector`], used to wire heterogeneously typed
/// edges through one graph registry.
pub(crate) trait AnyConnector: Send + Sync {
    fn register_producers(&self, count: usize);
    fn producer_finished(&self);
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Send + 'static> AnyConnector for Connector<T> {
    fn register_producers(&self, count: usize) {
        Connector::register_producers(self, count);
    }

    fn producer_finished(&self) {
        Connector::producer_finished(self);
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Recovers the typed connector behind an erased handle.
pub(crate) fn downcast_connector<T: Send + 'static>(
    connector: &Arc<dyn AnyConnector>,
) -> Option<Arc<Connector<T>>> {
    Arc::clone(connector).as_any_arc().downcast().ok()
}
