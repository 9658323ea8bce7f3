//! Sandbox engine abstraction.
//!
//! A [`SandboxModule`] is compiled once and shared by every instance created
//! from it. A [`SandboxInstance`] owns a private linear memory and its own
//! handle table, and exposes the six entry points the matcher core calls
//! through. Instances are `Send` but never `Sync`: exactly one thread may be
//! inside an instance at a time.

pub mod native;

use crate::error::{IgnoreError, Trap};

pub use native::NativeModule;

/// Entry point names, used in transport errors and logs.
pub mod entry {
    pub const ALLOC: &str = "alloc";
    pub const DEALLOC: &str = "dealloc";
    pub const CREATE_MATCHER: &str = "create_matcher";
    pub const DESTROY_MATCHER: &str = "destroy_matcher";
    pub const IS_MATCH: &str = "is_match";
    pub const BATCH_FILTER: &str = "batch_filter";
}

/// A compiled, immutable sandbox module.
pub trait SandboxModule: Send + Sync {
    /// Human-readable module name.
    fn name(&self) -> &str;

    /// Create a fresh instance with its own memory and handle table.
    fn instantiate(&self, name: &str) -> Result<Box<dyn SandboxInstance>, IgnoreError>;
}

/// One instantiation of a [`SandboxModule`].
///
/// Arguments are 32-bit signed values; pointers are offsets into
/// [`memory`](SandboxInstance::memory). An `Err(Trap)` means the call itself
/// faulted and the instance state is no longer trustworthy.
pub trait SandboxInstance: Send {
    /// Allocate `size` bytes. Returns 0 when out of memory.
    fn alloc(&mut self, size: i32) -> Result<i32, Trap>;

    /// Release an allocation. No-op on a null pointer or zero size.
    fn dealloc(&mut self, ptr: i32, size: i32) -> Result<(), Trap>;

    /// Compile `\n`-joined rule text. Returns a positive handle or a negative code.
    fn create_matcher(&mut self, ptr: i32, len: i32) -> Result<i32, Trap>;

    fn destroy_matcher(&mut self, handle: i32) -> Result<(), Trap>;

    /// Test one path. Returns a match code or a negative error code.
    fn is_match(&mut self, handle: i32, ptr: i32, len: i32, is_dir: i32) -> Result<i32, Trap>;

    /// Filter a `\n`-joined path blob, writing the result pointer and length
    /// into the 8-byte descriptor at `info_ptr`. Returns the kept count or a
    /// negative error code.
    fn batch_filter(&mut self, handle: i32, ptr: i32, len: i32, info_ptr: i32)
        -> Result<i32, Trap>;

    /// Current view of the instance's linear memory.
    fn memory(&self) -> &[u8];

    fn memory_mut(&mut self) -> &mut [u8];
}
