//! In-process sandbox backend.
//!
//! Each instance keeps its state behind the same narrow call surface a
//! foreign module would expose: a private linear memory addressed by 32-bit
//! offsets, an allocator over it, and a handle table of compiled rule sets.
//! Guest-side faults (out-of-bounds access, bad frees, panics) surface as
//! [`Trap`]s.
//!
//! This backend runs in the host process and gives no isolation from it.
//! Only unwinding panics are caught; an abort or a stack overflow inside
//! rule evaluation takes the whole process down. A backend over a real
//! WebAssembly engine can be plugged in through [`SandboxModule`].

pub mod heap;
pub mod rules;

use std::panic::{self, AssertUnwindSafe};

use crate::config::EngineConfig;
use crate::error::{IgnoreError, Trap};
use crate::sandbox::{SandboxInstance, SandboxModule};

use self::heap::{Heap, LinearMemory};
use self::rules::RuleTable;

/// Compiled native module. Immutable once built.
#[derive(Debug, Clone)]
pub struct NativeModule {
    initial_pages: u32,
    max_pages: u32,
}

impl NativeModule {
    /// Build the module for the given engine configuration.
    pub fn compile(config: &EngineConfig) -> Result<Self, IgnoreError> {
        config
            .validate()
            .map_err(|e| IgnoreError::ModuleCompile(e.to_string()))?;

        tracing::debug!(
            "compiled native sandbox module ({} initial pages, {} max pages)",
            config.initial_memory_pages,
            config.max_memory_pages
        );

        Ok(Self {
            initial_pages: config.initial_memory_pages,
            max_pages: config.max_memory_pages,
        })
    }
}

impl SandboxModule for NativeModule {
    fn name(&self) -> &str {
        "native"
    }

    fn instantiate(&self, name: &str) -> Result<Box<dyn SandboxInstance>, IgnoreError> {
        Ok(Box::new(NativeInstance::new(
            name,
            self.initial_pages,
            self.max_pages,
        )))
    }
}

/// One native instance.
#[derive(Debug)]
pub struct NativeInstance {
    name: String,
    memory: LinearMemory,
    heap: Heap,
    rules: RuleTable,
}

impl NativeInstance {
    pub fn new(name: &str, initial_pages: u32, max_pages: u32) -> Self {
        Self {
            name: name.to_string(),
            memory: LinearMemory::new(initial_pages, max_pages),
            heap: Heap::new(),
            rules: RuleTable::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Allocations not yet released by the host.
    pub fn live_allocations(&self) -> usize {
        self.heap.live_allocations()
    }

    /// Compiled rule sets currently held.
    pub fn matcher_count(&self) -> usize {
        self.rules.len()
    }

    /// Borrow `len` bytes of guest input at `ptr`. Empty for a zero length.
    fn input(&self, ptr: i32, len: i32) -> Result<&[u8], Trap> {
        if len == 0 {
            return Ok(&[]);
        }
        self.memory.slice(ptr as u32, len as u32)
    }

    fn do_batch_filter(
        &mut self,
        handle: i32,
        ptr: i32,
        len: i32,
        info_ptr: i32,
    ) -> Result<i32, Trap> {
        if handle <= 0 {
            return Ok(-1);
        }
        if info_ptr == 0 {
            return Ok(-2);
        }
        if len < 0 || (len > 0 && ptr == 0) {
            return Ok(-3);
        }

        let kept = {
            let text = match std::str::from_utf8(self.input(ptr, len)?) {
                Ok(text) => text,
                Err(_) => return Ok(-4),
            };
            let rules = match self.rules.get(handle as u32) {
                Some(rules) => rules,
                None => return Ok(-5),
            };
            let kept = rules::filter_paths(rules, text);
            (kept.len(), kept.join("\n"))
        };
        let (count, blob) = kept;

        let (result_ptr, result_len) = if count == 0 {
            (0u32, 0u32)
        } else {
            let result_len = u32::try_from(blob.len())
                .map_err(|_| Trap::new("batch result exceeds addressable memory"))?;
            let result_ptr = self
                .heap
                .alloc(&mut self.memory, result_len)
                .ok_or_else(|| Trap::new("out of memory while writing batch result"))?;
            self.memory
                .slice_mut(result_ptr, result_len)?
                .copy_from_slice(blob.as_bytes());
            (result_ptr, result_len)
        };

        let info = self.memory.slice_mut(info_ptr as u32, 8)?;
        info[0..4].copy_from_slice(&(result_ptr as i32).to_le_bytes());
        info[4..8].copy_from_slice(&(result_len as i32).to_le_bytes());

        i32::try_from(count).map_err(|_| Trap::new("kept path count overflows i32"))
    }
}

/// Run one entry point, converting a panic into a trap.
fn guarded<T>(call: &str, f: impl FnOnce() -> Result<T, Trap>) -> Result<T, Trap> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(Trap::new(format!("{} panicked: {}", call, message)))
        }
    }
}

impl SandboxInstance for NativeInstance {
    fn alloc(&mut self, size: i32) -> Result<i32, Trap> {
        guarded("alloc", || {
            if size <= 0 {
                return Ok(0);
            }
            Ok(self
                .heap
                .alloc(&mut self.memory, size as u32)
                .map(|ptr| ptr as i32)
                .unwrap_or(0))
        })
    }

    fn dealloc(&mut self, ptr: i32, size: i32) -> Result<(), Trap> {
        guarded("dealloc", || {
            if ptr == 0 || size <= 0 {
                return Ok(());
            }
            self.heap.dealloc(ptr as u32, size as u32)
        })
    }

    fn create_matcher(&mut self, ptr: i32, len: i32) -> Result<i32, Trap> {
        guarded("create_matcher", || {
            if len < 0 {
                return Ok(-1);
            }
            if len > 0 && ptr == 0 {
                return Ok(-2);
            }
            let compiled = match rules::build(self.input(ptr, len)?) {
                Ok(compiled) => compiled,
                Err(e) => {
                    tracing::debug!("{}: rule build failed: {}", self.name, e);
                    return Ok(-3);
                }
            };
            Ok(self.rules.insert(compiled) as i32)
        })
    }

    fn destroy_matcher(&mut self, handle: i32) -> Result<(), Trap> {
        guarded("destroy_matcher", || {
            if handle > 0 {
                self.rules.remove(handle as u32);
            }
            Ok(())
        })
    }

    fn is_match(&mut self, handle: i32, ptr: i32, len: i32, is_dir: i32) -> Result<i32, Trap> {
        guarded("is_match", || {
            if handle <= 0 {
                return Ok(-1);
            }
            if len < 0 || (len > 0 && ptr == 0) {
                return Ok(-2);
            }
            let path = match std::str::from_utf8(self.input(ptr, len)?) {
                Ok(path) => path,
                Err(_) => return Ok(-3),
            };
            let rules = match self.rules.get(handle as u32) {
                Some(rules) => rules,
                None => return Ok(-4),
            };
            Ok(rules::match_path(rules, path, is_dir != 0) as i32)
        })
    }

    fn batch_filter(
        &mut self,
        handle: i32,
        ptr: i32,
        len: i32,
        info_ptr: i32,
    ) -> Result<i32, Trap> {
        guarded("batch_filter", || {
            self.do_batch_filter(handle, ptr, len, info_ptr)
        })
    }

    fn memory(&self) -> &[u8] {
        self.memory.as_slice()
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        self.memory.as_mut_slice()
    }
}
