//! Moving bytes across the sandbox boundary.
//!
//! Data written into an instance lives in memory allocated by the instance's
//! own allocator and must be freed exactly once. [`GuestBuffer`] ties that
//! free to scope exit. Data read back is always copied into host memory:
//! a view of guest memory is invalid after the next call into the instance.

use std::ops::{Deref, DerefMut};

use crate::error::{IgnoreError, Result};
use crate::pool::Instance;

/// Copy `data` into freshly allocated guest memory.
///
/// Empty input allocates nothing and returns `(0, 0)`.
pub fn write_bytes(instance: &mut Instance, data: &[u8]) -> Result<(u32, u32)> {
    if data.is_empty() {
        return Ok((0, 0));
    }

    let ptr = instance.alloc(data.len())?;
    if ptr == 0 {
        return Err(IgnoreError::AllocationFailed { size: data.len() });
    }
    let len = data.len() as u32;

    let start = ptr as usize;
    let end = start + data.len();
    if end > instance.memory().len() {
        free_bytes(instance, ptr, len);
        return Err(IgnoreError::AllocationFailed { size: data.len() });
    }
    instance.memory_mut()[start..end].copy_from_slice(data);

    Ok((ptr, len))
}

/// Copy `len` bytes at `ptr` out of guest memory.
pub fn read_bytes(instance: &Instance, ptr: u32, len: u32) -> Result<Vec<u8>> {
    if ptr == 0 || len == 0 {
        return Ok(Vec::new());
    }

    let memory = instance.memory();
    let start = ptr as usize;
    let end = start + len as usize;
    if end > memory.len() {
        return Err(IgnoreError::OutOfRange {
            ptr,
            len,
            memory: memory.len(),
        });
    }
    Ok(memory[start..end].to_vec())
}

/// Release a guest allocation. No-op for a null pointer or zero length.
///
/// A failed free is not reported; the instance is tainted instead.
pub fn free_bytes(instance: &mut Instance, ptr: u32, len: u32) {
    if ptr == 0 || len == 0 {
        return;
    }
    if let Err(e) = instance.dealloc(ptr, len) {
        tracing::debug!("{}: free of {} bytes at {} failed: {}", instance.name(), len, ptr, e);
    }
}

/// A guest allocation that is freed when dropped.
///
/// The buffer dereferences to the instance that owns it, so further calls
/// (including nested buffers) borrow through the guard.
pub struct GuestBuffer<'a> {
    instance: &'a mut Instance,
    ptr: u32,
    len: u32,
}

impl<'a> GuestBuffer<'a> {
    /// Write `data` into the instance.
    pub fn write(instance: &'a mut Instance, data: &[u8]) -> Result<Self> {
        let (ptr, len) = write_bytes(instance, data)?;
        Ok(Self { instance, ptr, len })
    }

    /// Allocate `size` zeroed bytes.
    pub fn zeroed(instance: &'a mut Instance, size: usize) -> Result<Self> {
        let data = vec![0u8; size];
        Self::write(instance, &data)
    }

    pub fn ptr(&self) -> u32 {
        self.ptr
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy the buffer's current contents out of guest memory.
    pub fn read(&self) -> Result<Vec<u8>> {
        read_bytes(&*self.instance, self.ptr, self.len)
    }
}

impl Deref for GuestBuffer<'_> {
    type Target = Instance;

    fn deref(&self) -> &Instance {
        self.instance
    }
}

impl DerefMut for GuestBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Instance {
        self.instance
    }
}

impl Drop for GuestBuffer<'_> {
    fn drop(&mut self) {
        free_bytes(self.instance, self.ptr, self.len);
    }
}
