use crate::memory::MemoryData;

/// Fixed-capacity freelist staging recycled buffers between a release
/// arrival and their re-issue onto the get connector.
pub(crate) struct MemoryPool<T: Send + 'static> {
    free: Vec<MemoryData<T>>,
    capacity: usize,
}

impl<T: Send + 'static> MemoryPool<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            free: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn add(&mut self, data: MemoryData<T>) {
        debug_assert!(self.free.len() < self.capacity, "MemoryPool::add: [1]");
        self.free.push(data);
    }

    pub(crate) fn take(&mut self) -> Option<MemoryData<T>> {
        self.free.pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}
