use crate::memory::{MemoryAllocator, MemoryData, MemoryPool};
use crate::task::{Task, TaskContext, TaskError};
use std::sync::Arc;

/// Task that owns a fixed pool of reusable buffers behind a memory edge.
///
/// On startup the manager allocates its pool and pushes every buffer onto
/// the edge's get connector, where the getter task blocks when the pool is
/// exhausted; that blocking is the backpressure mechanism. Returned
/// handles arrive on the release connector; the handle's release policy
/// decides whether each return recycles the buffer or parks it for a later
/// arrival.
///
/// The manager terminates once its release connector is finished. Buffers
/// still outstanding at that point were leaked by their holders and are
/// reported at `warn`; buffers free their allocation through the shared
/// allocator when dropped, wherever they are.
///
/// A `MemoryManager` is consumed by
/// [`TaskGraphConf::add_memory_edge`](crate::graph::TaskGraphConf::add_memory_edge),
/// so one instance can never serve two edges.
pub struct MemoryManager<T: Send + 'static> {
    name: Arc<str>,
    allocator: Arc<dyn MemoryAllocator<T>>,
    pool: MemoryPool<T>,
    parked: Vec<MemoryData<T>>,
}

impl<T: Send + 'static> MemoryManager<T> {
    /// Creates a manager for `pool_size` buffers produced by `allocator`.
    /// The allocator is shared with every handle the manager issues.
    #[must_use]
    pub fn new<A>(name: impl Into<String>, pool_size: usize, allocator: Arc<A>) -> Self
    where
        A: MemoryAllocator<T> + 'static,
    {
        let name: String = name.into();
        Self {
            name: name.into(),
            allocator,
            pool: MemoryPool::new(pool_size),
            parked: Vec::new(),
        }
    }

    /// Number of buffers this manager circulates.
    pub fn pool_size(&self) -> usize {
        self.pool.capacity()
    }

    fn recycle(&mut self, mut data: MemoryData<T>) {
        data.reset_release_state();
        self.pool.add(data);
    }

    fn emit_free(&mut self, ctx: &TaskContext<MemoryData<T>>) {
        while let Some(data) = self.pool.take() {
            ctx.add_result(data);
        }
    }
}

impl<T: Send + 'static> Task<MemoryData<T>, MemoryData<T>> for MemoryManager<T> {
    fn initialize(&mut self, ctx: &mut TaskContext<MemoryData<T>>) -> Result<(), TaskError> {
        let release = ctx
            .input_connector::<MemoryData<T>>()
            .ok_or_else(|| TaskError::from("memory manager has no release connector wired"))?;
        let release = Arc::downgrade(&release);
        for _ in 0..self.pool.capacity() {
            self.pool.add(MemoryData::new(
                self.allocator.allocate(),
                Arc::clone(&self.allocator),
                release.clone(),
                Arc::clone(&self.name),
                ctx.pipeline_id(),
            ));
        }
        self.emit_free(ctx);
        Ok(())
    }

    fn execute(
        &mut self,
        mut data: MemoryData<T>,
        ctx: &mut TaskContext<MemoryData<T>>,
    ) -> Result<(), TaskError> {
        if data.pipeline_id() != ctx.pipeline_id() {
            // A buffer from another replica cannot rejoin this pool; its
            // allocation is returned through the shared allocator on drop.
            tracing::warn!(
                manager = %self.name,
                from_pipeline = data.pipeline_id(),
                pipeline = ctx.pipeline_id(),
                "dropping buffer returned from another pipeline"
            );
            return Ok(());
        }
        data.memory_used();
        if data.can_release() {
            self.recycle(data);
        } else {
            self.parked.push(data);
        }
        let mut idx = 0;
        while idx < self.parked.len() {
            if self.parked[idx].can_release() {
                let data = self.parked.swap_remove(idx);
                self.recycle(data);
            } else {
                idx += 1;
            }
        }
        self.emit_free(ctx);
        Ok(())
    }

    fn shutdown(&mut self, ctx: &mut TaskContext<MemoryData<T>>) -> Result<(), TaskError> {
        let free = self.pool.len() + ctx.output_connector().map_or(0, |conn| conn.len());
        let accounted = free + self.parked.len();
        let leaked = self.pool.capacity().saturating_sub(accounted);
        if leaked > 0 {
            tracing::warn!(manager = %self.name, leaked, "pool buffers were never returned");
        }
        if !self.parked.is_empty() {
            tracing::warn!(
                manager = %self.name,
                parked = self.parked.len(),
                "buffers returned but never became releasable"
            );
        }
        self.parked.clear();
        Ok(())
    }

    fn copy(&self) -> Box<dyn Task<MemoryData<T>, MemoryData<T>>> {
        Box::new(Self {
            name: Arc::clone(&self.name),
            allocator: Arc::clone(&self.allocator),
            pool: MemoryPool::new(self.pool.capacity()),
            parked: Vec::new(),
        })
    }

    fn name(&self) -> String {
        format!("memory-manager({})", self.name)
    }
}
