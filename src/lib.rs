//! This crate provides a segregated bitmap slab allocator, which you can use
//! for your dynamic memory allocation needs when a workload is dominated by
//! many small, similarly sized and short-lived objects.
//!
//! Allocation requests below a configurable size limit are served from large,
//! pre-reserved memory **chunks**, while larger requests are forwarded to the
//! system allocator. Compared to calling the system allocator for every small
//! object, this removes most per-allocation bookkeeping and keeps objects of a
//! given size packed together instead of fragmenting the heap.
//!
//! # Slab allocation primer
//!
//! Managed sizes are split into evenly sized bands called **size classes**.
//! Every chunk contains, for each size class, an array of fixed-size
//! **blocks** which are just large enough for the largest request of that
//! class, along with a **bitmap** that tracks which of these blocks are free.
//!
//! Allocation classifies the requested size, then walks the chunks in address
//! order until one of them has a free block of the right class. If none does,
//! a new chunk is allocated from the system. Deallocation finds the chunk that
//! owns the pointer by looking up the closest chunk below it, marks the block
//! as free, and gives the chunk back to the system once all of its blocks, of
//! every class, are free again.
//!
//! The size class width is the most important tuning parameter:
//!
//! - Each block may waste up to one class width (minus one byte) of memory,
//!   so narrow classes use memory more efficiently.
//! - But every chunk reserves blocks for every class, so narrow classes mean
//!   more classes and larger chunks.
//!
//! Because bitmaps are always scanned from their first block, low addresses
//! are reused first. This keeps the working set compact, but allocation slows
//! down as chunks fill up and more fully occupied bitmap words must be skipped.
//!
//! # Limitations
//!
//! - The allocator is not thread-safe. It is `Send`, so you can use one
//!   allocator per thread or wrap a shared one in a `Mutex`.
//! - Blocks are never coalesced across size classes, and chunks are never
//!   compacted.
//! - Double frees and use after free are not detected.
//!
//! # Example
//!
//! ```
//! use slabmap::{BitmapAllocator, RawAllocator};
//!
//! let mut allocator = BitmapAllocator::builder().managed_max(512)
//!                                               .chunk_capacity(256)
//!                                               .build();
//! let ptr = allocator.allocate(100).unwrap();
//! unsafe {
//!     ptr.as_ptr().write_bytes(0xAB, 100);
//!     allocator.free(ptr).unwrap();
//! }
//! assert_eq!(allocator.chunk_count(), 0);
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

mod bitmap;
mod builder;
mod chunk;
mod error;
mod registry;
mod size_class;
mod system;

use crate::{
    chunk::Chunk,
    registry::{BlockRef, ChunkRegistry},
};

use log::{debug, trace, warn};

use std::ptr::NonNull;


// Re-export the public API at the crate root
pub use crate::{
    bitmap::{BlockBitmap, BLOCKS_PER_WORD},
    builder::{
        Builder,
        DEFAULT_CHUNK_CAPACITY,
        DEFAULT_CLASS_COUNT,
        DEFAULT_MANAGED_MAX,
        MAX_DEFAULT_ALIGNMENT,
    },
    chunk::ChunkLayout,
    error::AllocError,
    size_class::{ClassIndex, SizeClass, SizeClasses},
    system::SystemAllocator,
};


/// Allocate-by-size and free-by-pointer capability
///
/// This is all that clients of an allocator get to see, so that allocators
/// can be swapped for one another (e.g. to compare a `BitmapAllocator` with
/// the `SystemAllocator` baseline).
pub trait RawAllocator {
    /// Allocate a buffer of at least `size` bytes
    ///
    /// The buffer is uninitialized. It stays valid until it is passed to
    /// `free()` or the allocator is dropped, whichever comes first.
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError>;

    /// Liberate a buffer that was previously allocated via `allocate()`
    ///
    /// Pointers that the allocator does not know about are reported as
    /// `AllocError::InvalidFree`, as far as the allocator can tell.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate()` on this allocator and must
    /// not have been freed already. Neither condition is reliably detected.
    ///
    /// `ptr` will be dangling after calling this function, and should neither
    /// be dereferenced nor passed to `free()` again.
    unsafe fn free(&mut self, ptr: NonNull<u8>) -> Result<(), AllocError>;
}


/// Allocation counters of a `BitmapAllocator`
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AllocatorStats {
    /// Requests served from chunks
    pub managed_allocations: u64,

    /// Requests forwarded to the system allocator
    pub unmanaged_allocations: u64,

    /// Blocks given back to chunks
    pub managed_frees: u64,

    /// Buffers given back to the system allocator
    pub unmanaged_frees: u64,

    /// Blocks that are currently allocated from chunks
    pub live_blocks: u64,

    /// Total bytes requested by managed allocations
    pub requested_bytes: u64,

    /// Total bytes reserved for managed allocations (block sizes)
    pub reserved_bytes: u64,

    /// Chunks allocated from the system
    pub chunks_grown: u64,

    /// Chunks given back to the system
    pub chunks_retired: u64,
}

impl AllocatorStats {
    /// Bytes lost to rounding managed requests up to their block size
    pub fn internal_fragmentation(&self) -> u64 {
        self.reserved_bytes - self.requested_bytes
    }
}


/// Free block count of every size class within one chunk
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChunkOccupancy {
    /// Base address of the chunk
    pub base: usize,

    /// Number of free blocks of each class, smallest class first
    pub free_blocks: Vec<usize>,
}


/// A segregated bitmap slab allocator
///
/// See the crate documentation for an overview of how it works.
#[derive(Debug)]
pub struct BitmapAllocator {
    /// Layout shared by every chunk, including the size class table
    layout: ChunkLayout,

    /// Chunks owned by the allocator, in address order
    chunks: ChunkRegistry,

    /// Fallback for requests that are too large for the size classes
    system: SystemAllocator,

    /// Allocation counters
    stats: AllocatorStats,
}

impl BitmapAllocator {
    /// Build an allocator with the default configuration
    pub fn new() -> Self {
        Builder::new().build()
    }

    /// Start building an allocator
    ///
    /// See the `Builder` documentation for more details on the subsequent
    /// allocator configuration process.
    pub const fn builder() -> Builder {
        Builder::new()
    }

    /// Allocator constructor proper, used by `Builder`
    pub(crate) fn with_layout(layout: ChunkLayout) -> Self {
        debug!("Setting up bitmap allocator: {} size classes of {} bytes below {} bytes, \
                {} blocks per class, {} bytes per chunk",
               layout.classes().class_count(),
               layout.classes().unit_range(),
               layout.classes().managed_max(),
               layout.capacity(),
               layout.chunk_size());
        let system = SystemAllocator::new(layout.alignment());
        Self {
            layout,
            chunks: ChunkRegistry::new(),
            system,
            stats: AllocatorStats::default(),
        }
    }

    /// Size class table of this allocator
    pub fn size_classes(&self) -> &SizeClasses {
        self.layout.classes()
    }

    /// Memory layout of this allocator's chunks
    pub fn chunk_layout(&self) -> &ChunkLayout {
        &self.layout
    }

    /// Alignment of every allocation (in bytes)
    pub fn alignment(&self) -> usize {
        self.system.alignment()
    }

    /// Number of chunks currently held by the allocator
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Allocation counters
    pub fn stats(&self) -> AllocatorStats {
        self.stats
    }

    /// Per-class free block counts of every chunk, in address order
    pub fn occupancy(&self) -> Vec<ChunkOccupancy> {
        self.chunks
            .iter()
            .map(|chunk| ChunkOccupancy {
                base: chunk.base_addr(),
                free_blocks: chunk.free_blocks_per_class(),
            })
            .collect()
    }

    /// Truth that a pointer lies within a block of one of this allocator's
    /// chunks, free or not
    pub fn is_managed(&self, ptr: NonNull<u8>) -> bool {
        self.chunks.find_owner(ptr.as_ptr() as usize).is_some()
    }

    /// Serve a managed request from the chunks, growing if needed
    fn allocate_block(&mut self, class: ClassIndex) -> Result<NonNull<u8>, AllocError> {
        // Try existing chunks first, lowest addresses first
        for chunk in self.chunks.iter_mut() {
            if let Some(index) = chunk.bitmap_mut(class).acquire() {
                return Ok(chunk.block_address(class, index));
            }
        }

        // Every chunk is full for this class, so we need a new one
        let chunk = Chunk::new(&self.layout)?;
        debug!("Growing: allocated chunk {:#x} ({} bytes) for class {}, now at {} chunks",
               chunk.base_addr(),
               chunk.size(),
               class.get(),
               self.chunks.len() + 1);
        self.stats.chunks_grown += 1;
        let chunk = self.chunks.register(chunk);
        let index = chunk.bitmap_mut(class)
                         .acquire()
                         .expect("A fresh chunk should have free blocks");
        Ok(chunk.block_address(class, index))
    }

    /// Give a block back to its chunk, retiring the chunk if it became empty
    ///
    /// Returns whether the block was allocated beforehand.
    fn free_block(&mut self, block: BlockRef) -> bool {
        let chunk = self.chunks
                        .get_mut(block.chunk_base)
                        .expect("Owner lookup returned an unregistered chunk");

        // Flag the block as free
        let was_allocated = chunk.bitmap_mut(block.class).release(block.index);
        if !was_allocated {
            warn!("Block {} of class {} in chunk {:#x} was already free, \
                   this looks like a double free",
                  block.index, block.class.get(), block.chunk_base);
        }

        // Give the chunk back to the system once it's empty
        if chunk.is_all_free() {
            let chunk = self.chunks.retire(block.chunk_base);
            debug_assert!(chunk.is_some(), "Retired chunk was not registered");
            drop(chunk);
            self.stats.chunks_retired += 1;
            debug!("Retired empty chunk {:#x}, now at {} chunks",
                   block.chunk_base, self.chunks.len());
        }
        was_allocated
    }
}

impl Default for BitmapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RawAllocator for BitmapAllocator {
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        match self.layout.classes().classify(size) {
            // Too large for us, send it to the system allocator
            SizeClass::Unmanaged => {
                trace!("Forwarding {}-byte request to the system allocator", size);
                let ptr = self.system.allocate(size)?;
                self.stats.unmanaged_allocations += 1;
                Ok(ptr)
            }

            // Serve it from the chunks
            SizeClass::Managed(class) => {
                let ptr = self.allocate_block(class)?;
                trace!("Allocated {} bytes at {:p} from class {}", size, ptr, class.get());
                self.stats.managed_allocations += 1;
                self.stats.live_blocks += 1;
                self.stats.requested_bytes += size as u64;
                self.stats.reserved_bytes += self.layout.classes().class_size(class) as u64;
                Ok(ptr)
            }
        }
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        match self.chunks.find_owner(ptr.as_ptr() as usize) {
            // Not one of our blocks, so it should come from the system
            None => {
                // This is safe because the caller guarantees that the pointer
                // came from allocate(), and the system allocator rejects
                // pointers that it did not produce.
                unsafe { self.system.free(ptr)? };
                self.stats.unmanaged_frees += 1;
                Ok(())
            }

            // One of our blocks
            Some(block) => {
                trace!("Freeing block {} of class {} at {:p}",
                       block.index, block.class.get(), ptr);
                if self.free_block(block) {
                    self.stats.managed_frees += 1;
                    self.stats.live_blocks -= 1;
                }
                Ok(())
            }
        }
    }
}

impl Drop for BitmapAllocator {
    fn drop(&mut self) {
        // Remaining chunks and system allocations are liberated when the
        // registry and the system allocator adapter are dropped, so any
        // pointer that wasn't freed becomes dangling.
        if !self.chunks.is_empty() || self.system.outstanding() != 0 {
            debug!("Dropping allocator with {} live blocks in {} chunks and {} \
                    system allocations",
                   self.stats.live_blocks,
                   self.chunks.len(),
                   self.system.outstanding());
        }
    }
}

// TODO: Implement GlobalAlloc on top of a Mutex<BitmapAllocator>? This would
//       require accepting a `Layout` and refusing alignments above the block
//       alignment.
