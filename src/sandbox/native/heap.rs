//! Linear memory and allocator for native sandbox instances.

use std::collections::{BTreeMap, HashMap};

use crate::config::PAGE_SIZE;
use crate::error::Trap;

/// First offset handed out by the allocator. Offset 0 is the null pointer.
const HEAP_BASE: u32 = 16;

/// Allocation granularity.
const ALIGN: u32 = 8;

/// Page-granular byte region that grows on demand up to a ceiling.
#[derive(Debug)]
pub struct LinearMemory {
    bytes: Vec<u8>,
    max_pages: u32,
}

impl LinearMemory {
    pub fn new(initial_pages: u32, max_pages: u32) -> Self {
        Self {
            bytes: vec![0; initial_pages as usize * PAGE_SIZE],
            max_pages,
        }
    }

    pub fn pages(&self) -> u32 {
        (self.bytes.len() / PAGE_SIZE) as u32
    }

    /// Grow by `delta` pages. Returns false if that would pass the ceiling.
    pub fn grow(&mut self, delta: u32) -> bool {
        let target = self.pages() as u64 + delta as u64;
        if target > self.max_pages as u64 {
            return false;
        }
        self.bytes.resize(target as usize * PAGE_SIZE, 0);
        true
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Borrow `len` bytes at `ptr`, trapping when out of bounds.
    pub fn slice(&self, ptr: u32, len: u32) -> Result<&[u8], Trap> {
        let range = self.range(ptr, len)?;
        Ok(&self.bytes[range])
    }

    pub fn slice_mut(&mut self, ptr: u32, len: u32) -> Result<&mut [u8], Trap> {
        let range = self.range(ptr, len)?;
        Ok(&mut self.bytes[range])
    }

    fn range(&self, ptr: u32, len: u32) -> Result<std::ops::Range<usize>, Trap> {
        let start = ptr as usize;
        let end = start + len as usize;
        if end > self.bytes.len() {
            return Err(Trap::new(format!(
                "out of bounds memory access (ptr={}, len={}, mem={})",
                ptr,
                len,
                self.bytes.len()
            )));
        }
        Ok(start..end)
    }
}

/// First-fit allocator over a [`LinearMemory`].
#[derive(Debug)]
pub struct Heap {
    /// End of the bump region.
    top: u32,
    /// Free blocks below `top`, keyed by offset.
    free: BTreeMap<u32, u32>,
    /// Live allocations, offset to rounded size.
    live: HashMap<u32, u32>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            top: HEAP_BASE,
            free: BTreeMap::new(),
            live: HashMap::new(),
        }
    }

    /// Allocate `size` bytes, growing memory when needed. None when exhausted.
    pub fn alloc(&mut self, memory: &mut LinearMemory, size: u32) -> Option<u32> {
        if size == 0 {
            return None;
        }
        let size = round_up(size)?;

        let fit = self
            .free
            .iter()
            .find(|(_, block)| **block >= size)
            .map(|(&offset, &block)| (offset, block));

        let ptr = match fit {
            Some((offset, block)) => {
                self.free.remove(&offset);
                if block > size {
                    self.free.insert(offset + size, block - size);
                }
                offset
            }
            None => {
                let end = self.top as u64 + size as u64;
                if end > u32::MAX as u64 {
                    return None;
                }
                if end > memory.len() as u64 {
                    let missing = end - memory.len() as u64;
                    let pages = missing.div_ceil(PAGE_SIZE as u64);
                    if pages > u32::MAX as u64 || !memory.grow(pages as u32) {
                        return None;
                    }
                }
                let ptr = self.top;
                self.top = end as u32;
                ptr
            }
        };

        self.live.insert(ptr, size);
        Some(ptr)
    }

    /// Release an allocation. Unknown pointers and size mismatches trap.
    pub fn dealloc(&mut self, ptr: u32, size: u32) -> Result<(), Trap> {
        let rounded = round_up(size).ok_or_else(|| Trap::new("dealloc size overflow"))?;
        match self.live.get(&ptr) {
            None => {
                return Err(Trap::new(format!(
                    "dealloc of unallocated pointer {}",
                    ptr
                )))
            }
            Some(&live) if live != rounded => {
                return Err(Trap::new(format!(
                    "dealloc size mismatch at {} (allocated {}, freed {})",
                    ptr, live, rounded
                )))
            }
            Some(_) => {}
        }
        self.live.remove(&ptr);

        let mut start = ptr;
        let mut len = rounded;

        if let Some((&next, &next_len)) = self.free.range(start + len..).next() {
            if next == start + len {
                self.free.remove(&next);
                len += next_len;
            }
        }
        if let Some((&prev, &prev_len)) = self.free.range(..start).next_back() {
            if prev + prev_len == start {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }

        if start + len == self.top {
            self.top = start;
        } else {
            self.free.insert(start, len);
        }
        Ok(())
    }

    /// Number of allocations not yet released.
    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }
}

fn round_up(size: u32) -> Option<u32> {
    size.checked_add(ALIGN - 1).map(|s| s & !(ALIGN - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_never_returns_null() {
        let mut memory = LinearMemory::new(1, 1);
        let mut heap = Heap::new();
        let ptr = heap.alloc(&mut memory, 1).unwrap();
        assert!(ptr >= HEAP_BASE);
        assert_eq!(ptr % ALIGN, 0);
    }

    #[test]
    fn test_alloc_zero_fails() {
        let mut memory = LinearMemory::new(1, 1);
        let mut heap = Heap::new();
        assert!(heap.alloc(&mut memory, 0).is_none());
    }

    #[test]
    fn test_alloc_grows_memory() {
        let mut memory = LinearMemory::new(1, 4);
        let mut heap = Heap::new();
        heap.alloc(&mut memory, PAGE_SIZE as u32 * 2).unwrap();
        assert_eq!(memory.pages(), 3);
    }

    #[test]
    fn test_alloc_respects_ceiling() {
        let mut memory = LinearMemory::new(1, 2);
        let mut heap = Heap::new();
        assert!(heap.alloc(&mut memory, PAGE_SIZE as u32 * 3).is_none());
        assert_eq!(memory.pages(), 1);
    }

    #[test]
    fn test_freed_blocks_are_reused() {
        let mut memory = LinearMemory::new(1, 1);
        let mut heap = Heap::new();
        let a = heap.alloc(&mut memory, 32).unwrap();
        let _b = heap.alloc(&mut memory, 32).unwrap();
        heap.dealloc(a, 32).unwrap();
        let c = heap.alloc(&mut memory, 16).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn test_coalescing_returns_to_base() {
        let mut memory = LinearMemory::new(1, 1);
        let mut heap = Heap::new();
        let a = heap.alloc(&mut memory, 24).unwrap();
        let b = heap.alloc(&mut memory, 40).unwrap();
        let c = heap.alloc(&mut memory, 8).unwrap();
        heap.dealloc(b, 40).unwrap();
        heap.dealloc(a, 24).unwrap();
        heap.dealloc(c, 8).unwrap();
        assert_eq!(heap.live_allocations(), 0);
        assert_eq!(heap.alloc(&mut memory, 8), Some(HEAP_BASE));
    }

    #[test]
    fn test_double_free_traps() {
        let mut memory = LinearMemory::new(1, 1);
        let mut heap = Heap::new();
        let a = heap.alloc(&mut memory, 8).unwrap();
        heap.dealloc(a, 8).unwrap();
        assert!(heap.dealloc(a, 8).is_err());
    }

    #[test]
    fn test_size_mismatch_traps() {
        let mut memory = LinearMemory::new(1, 1);
        let mut heap = Heap::new();
        let a = heap.alloc(&mut memory, 64).unwrap();
        assert!(heap.dealloc(a, 8).is_err());
    }

    #[test]
    fn test_out_of_bounds_slice_traps() {
        let memory = LinearMemory::new(1, 1);
        assert!(memory.slice(PAGE_SIZE as u32 - 4, 8).is_err());
        assert!(memory.slice(PAGE_SIZE as u32 - 8, 8).is_ok());
    }
}
