//! Host-side wrapper around one sandbox instance.

use crate::error::{IgnoreError, Result, Trap};
use crate::matcher::MatcherHandle;
use crate::sandbox::{entry, SandboxInstance};

/// A sandbox instance owned by exactly one caller at a time.
///
/// Every entry point goes through this wrapper. A trap taints the instance:
/// the error is returned to the caller, later calls fail fast, and the pool
/// discards the instance instead of recycling it.
pub struct Instance {
    id: u64,
    pool_id: u64,
    name: String,
    inner: Box<dyn SandboxInstance>,
    tainted: bool,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("pool_id", &self.pool_id)
            .field("name", &self.name)
            .field("tainted", &self.tainted)
            .field("memory", &self.inner.memory().len())
            .finish()
    }
}

impl Instance {
    pub(crate) fn new(
        id: u64,
        pool_id: u64,
        name: String,
        inner: Box<dyn SandboxInstance>,
    ) -> Self {
        Self {
            id,
            pool_id,
            name,
            inner,
            tainted: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Id of the pool that created this instance.
    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    /// Mark the instance as untrustworthy. One-way.
    pub fn taint(&mut self) {
        self.tainted = true;
    }

    pub fn memory(&self) -> &[u8] {
        self.inner.memory()
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        self.inner.memory_mut()
    }

    fn call<T>(
        &mut self,
        call: &'static str,
        f: impl FnOnce(&mut dyn SandboxInstance) -> std::result::Result<T, Trap>,
    ) -> Result<T> {
        if self.tainted {
            return Err(IgnoreError::Transport {
                call,
                message: format!("{} was tainted by an earlier fault", self.name),
            });
        }
        f(self.inner.as_mut()).map_err(|trap| {
            self.tainted = true;
            tracing::warn!("{}: {} faulted, instance tainted: {}", self.name, call, trap);
            IgnoreError::Transport {
                call,
                message: trap.to_string(),
            }
        })
    }

    fn check_handle(&self, handle: MatcherHandle) -> Result<i32> {
        if handle.instance_id() != self.id {
            return Err(IgnoreError::InvalidHandle);
        }
        Ok(handle.raw())
    }

    /// Request `size` bytes. Returns the raw pointer; 0 means out of memory.
    pub fn alloc(&mut self, size: usize) -> Result<u32> {
        let size = i32::try_from(size).map_err(|_| IgnoreError::AllocationFailed { size })?;
        self.call(entry::ALLOC, |inner| inner.alloc(size))
            .map(|ptr| ptr as u32)
    }

    pub fn dealloc(&mut self, ptr: u32, len: u32) -> Result<()> {
        self.call(entry::DEALLOC, |inner| inner.dealloc(ptr as i32, len as i32))
    }

    /// Raw `create_matcher` code for rule text already written at `ptr`.
    pub fn create_matcher(&mut self, ptr: u32, len: u32) -> Result<i32> {
        self.call(entry::CREATE_MATCHER, |inner| {
            inner.create_matcher(ptr as i32, len as i32)
        })
    }

    pub fn destroy_matcher(&mut self, handle: MatcherHandle) -> Result<()> {
        let raw = self.check_handle(handle)?;
        self.call(entry::DESTROY_MATCHER, |inner| inner.destroy_matcher(raw))
    }

    /// Raw `is_match` code for a path already written at `ptr`.
    pub fn is_match(
        &mut self,
        handle: MatcherHandle,
        ptr: u32,
        len: u32,
        is_dir: bool,
    ) -> Result<i32> {
        let raw = self.check_handle(handle)?;
        self.call(entry::IS_MATCH, |inner| {
            inner.is_match(raw, ptr as i32, len as i32, i32::from(is_dir))
        })
    }

    /// Raw `batch_filter` code for a path blob already written at `ptr`.
    pub fn batch_filter(
        &mut self,
        handle: MatcherHandle,
        ptr: u32,
        len: u32,
        info_ptr: u32,
    ) -> Result<i32> {
        let raw = self.check_handle(handle)?;
        self.call(entry::BATCH_FILTER, |inner| {
            inner.batch_filter(raw, ptr as i32, len as i32, info_ptr as i32)
        })
    }
}
