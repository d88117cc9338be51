use crate::connector::Connector;
use crate::memory::{CountReleaseRule, MemoryAllocator, MemoryReleaseRule};
use core::fmt;
use core::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

/// Handle to one pooled buffer, owned by whichever task currently holds it.
///
/// The handle knows its originating [`MemoryManager`] through a weak
/// reference to that manager's release connector, never an owning link, as
/// the manager outlives its handles by construction. Releasing the handle
/// (via [`TaskContext::release_memory`] or
/// [`TaskGraphConf::release_memory`]) sends it back along that connector;
/// the manager then recycles or parks it per the attached
/// [`MemoryReleaseRule`].
///
/// Dereferences to the buffer itself.
///
/// [`MemoryManager`]: crate::memory::MemoryManager
/// [`TaskContext::release_memory`]: crate::task::TaskContext::release_memory
/// [`TaskGraphConf::release_memory`]: crate::graph::TaskGraphConf::release_memory
pub struct MemoryData<T: Send + 'static> {
    buffer: Option<T>,
    allocator: Arc<dyn MemoryAllocator<T>>,
    release_connector: Weak<Connector<MemoryData<T>>>,
    manager_name: Arc<str>,
    pipeline_id: usize,
    rule: Box<dyn MemoryReleaseRule>,
}

impl<T: Send + 'static> MemoryData<T> {
    pub(crate) fn new(
        buffer: T,
        allocator: Arc<dyn MemoryAllocator<T>>,
        release_connector: Weak<Connector<MemoryData<T>>>,
        manager_name: Arc<str>,
        pipeline_id: usize,
    ) -> Self {
        Self {
            buffer: Some(buffer),
            allocator,
            release_connector,
            manager_name,
            pipeline_id,
            rule: Box::new(CountReleaseRule::new(1)),
        }
    }

    /// Pipeline replica in which this buffer's manager lives. Lets
    /// device-affined tasks detect buffers crossing replica boundaries.
    pub fn pipeline_id(&self) -> usize {
        self.pipeline_id
    }

    /// Name of the memory manager that issued this handle.
    pub fn manager_name(&self) -> &str {
        &self.manager_name
    }

    /// Replaces the handle's release policy.
    pub fn set_release_rule(&mut self, rule: Box<dyn MemoryReleaseRule>) {
        self.rule = rule;
    }

    pub(crate) fn memory_used(&mut self) {
        self.rule.memory_used();
    }

    pub(crate) fn can_release(&self) -> bool {
        self.rule.can_release()
    }

    pub(crate) fn reset_release_state(&mut self) {
        self.rule = Box::new(CountReleaseRule::new(1));
    }

    pub(crate) fn release(self) {
        match self.release_connector.upgrade() {
            Some(connector) => connector.produce(self),
            None => {
                tracing::warn!(
                    manager = %self.manager_name,
                    "memory released after its manager shut down; buffer freed"
                );
            }
        }
    }
}

impl<T: Send + 'static> Deref for MemoryData<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.buffer.as_ref().expect("MemoryData::deref: [1]")
    }
}

impl<T: Send + 'static> DerefMut for MemoryData<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.buffer.as_mut().expect("MemoryData::deref_mut: [1]")
    }
}

impl<T: Send + 'static> Drop for MemoryData<T> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.allocator.free(buffer);
        }
    }
}

impl<T: Send + 'static> fmt::Debug for MemoryData<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryData")
            .field("manager", &self.manager_name)
            .field("pipeline_id", &self.pipeline_id)
            .finish_non_exhaustive()
    }
}
