//! Pass-through to the platform allocator
//!
//! Requests that are too large for the size classes are forwarded here. The
//! adapter remembers the layout of everything it hands out, because Rust's
//! allocator API demands it back upon deallocation, and this also lets us
//! turn away pointers that were never ours instead of passing them on to the
//! system allocator and corrupting its heap.

use crate::{AllocError, RawAllocator};

use log::{trace, warn};

use std::{
    alloc::{self, Layout},
    collections::HashMap,
    ptr::NonNull,
};


/// System allocator adapter, tracking the allocations it handed out
#[derive(Debug)]
pub struct SystemAllocator {
    /// Alignment of every allocation (power of 2)
    alignment: usize,

    /// Layout of each outstanding allocation, keyed by address
    outstanding: HashMap<usize, Layout>,
}

impl SystemAllocator {
    /// Set up a system allocator adapter with a certain alignment
    ///
    /// # Panics
    ///
    /// If `alignment` is not a power of 2.
    pub fn new(alignment: usize) -> Self {
        assert!(alignment.is_power_of_two(), "Alignment must be a power of 2");
        Self {
            alignment,
            outstanding: HashMap::new(),
        }
    }

    /// Alignment of the allocations produced by this adapter
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Number of allocations that were handed out and not freed yet
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Truth that a pointer was handed out by this adapter and not freed yet
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.outstanding.contains_key(&(ptr.as_ptr() as usize))
    }
}

impl Default for SystemAllocator {
    fn default() -> Self {
        Self::new(std::mem::align_of::<usize>())
    }
}

impl RawAllocator for SystemAllocator {
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        // Rust's allocator does not support zero-sized allocations
        let oom = AllocError::OutOfMemory { size, align: self.alignment };
        let layout = Layout::from_size_align(size.max(1), self.alignment)
                            .map_err(|_| oom)?;

        // This is safe because the layout has a nonzero size
        let ptr = NonNull::new(unsafe { alloc::alloc(layout) }).ok_or(oom)?;
        trace!("System allocator provided {} bytes at {:p}", size, ptr);
        self.outstanding.insert(ptr.as_ptr() as usize, layout);
        Ok(ptr)
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let addr = ptr.as_ptr() as usize;
        let layout = match self.outstanding.remove(&addr) {
            Some(layout) => layout,
            None => {
                warn!("Refusing to free unknown pointer {:p}", ptr);
                return Err(AllocError::InvalidFree { addr });
            }
        };
        trace!("System allocator liberates {} bytes at {:p}", layout.size(), ptr);

        // This is safe because we allocated this pointer with this layout and
        // just removed it from the set of outstanding allocations.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }
}

impl Drop for SystemAllocator {
    fn drop(&mut self) {
        // Whatever was not freed by the client becomes dangling now
        for (addr, layout) in self.outstanding.drain() {
            // This is safe because every tracked allocation is live and was
            // allocated with its recorded layout.
            unsafe { alloc::dealloc(addr as *mut u8, layout) };
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn allocate_and_free() {
        let mut system = SystemAllocator::new(16);
        let ptr = system.allocate(4000).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 16, 0);
        assert!(system.owns(ptr));
        assert_eq!(system.outstanding(), 1);

        // The memory must be usable
        unsafe { ptr.as_ptr().write_bytes(0x5A, 4000) };
        assert_eq!(unsafe { *ptr.as_ptr().add(3999) }, 0x5A);

        unsafe { system.free(ptr) }.unwrap();
        assert!(!system.owns(ptr));
        assert_eq!(system.outstanding(), 0);
    }

    #[test]
    fn zero_sized() {
        let mut system = SystemAllocator::default();
        let a = system.allocate(0).unwrap();
        let b = system.allocate(0).unwrap();
        assert_ne!(a, b);
        unsafe {
            system.free(a).unwrap();
            system.free(b).unwrap();
        }
    }

    #[test]
    fn foreign_pointer_is_rejected() {
        let mut system = SystemAllocator::default();
        let mut local = 42u64;
        let foreign = NonNull::from(&mut local).cast::<u8>();
        assert_eq!(unsafe { system.free(foreign) },
                   Err(AllocError::InvalidFree { addr: foreign.as_ptr() as usize }));
    }

    #[test]
    fn double_free_is_rejected() {
        let mut system = SystemAllocator::default();
        let ptr = system.allocate(100).unwrap();
        unsafe { system.free(ptr) }.unwrap();
        assert!(matches!(unsafe { system.free(ptr) },
                         Err(AllocError::InvalidFree { .. })));
    }

    #[test]
    fn oversized_request_fails() {
        let mut system = SystemAllocator::default();
        assert_eq!(system.allocate(usize::MAX),
                   Err(AllocError::OutOfMemory {
                       size: usize::MAX,
                       align: std::mem::align_of::<usize>(),
                   }));
    }

    #[test]
    fn leftovers_are_released_on_drop() {
        let mut system = SystemAllocator::default();
        for size in 1..100 {
            system.allocate(size * 8).unwrap();
        }
        assert_eq!(system.outstanding(), 99);
        drop(system);
    }
}
