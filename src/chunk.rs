//! Chunks, the unit of memory that the allocator requests from the system
//!
//! A chunk is one contiguous backing buffer that holds a block array for every
//! size class, one after the other, smallest class first:
//!
//! `| class 0 blocks | class 1 blocks | ... | class N-1 blocks | padding |`
//!
//! The occupancy of each block array is tracked by a `BlockBitmap` that lives
//! next to the buffer, and the start address of each block array is recorded
//! in a per-chunk table when the chunk is created.

use crate::{
    bitmap::BlockBitmap,
    size_class::{ClassIndex, SizeClasses},
    AllocError,
};

use std::{
    alloc::{self, Layout},
    ptr::NonNull,
};


/// Memory layout shared by all chunks of an allocator
///
/// This is computed once when the allocator is built, since it only depends on
/// the allocator's configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChunkLayout {
    /// Size class table that the chunk is partitioned for
    classes: SizeClasses,

    /// Number of blocks per size class
    capacity: usize,

    /// Offset of each class' block array from the start of the chunk
    class_offsets: Box<[usize]>,

    /// Size and alignment of the backing buffer
    buffer_layout: Layout,
}

impl ChunkLayout {
    /// Lay out a chunk with `capacity` blocks for each size class
    ///
    /// The backing buffer is rounded up to a whole number of memory pages, so
    /// that chunk retirement gives entire pages back to the system allocator.
    ///
    /// # Panics
    ///
    /// If `capacity` is zero, if `alignment` is not a power of 2 dividing the
    /// class width, or if the chunk size does not fit in an allocation.
    pub fn new(classes: SizeClasses, capacity: usize, alignment: usize) -> Self {
        // Check interface preconditions
        assert!(capacity != 0, "Chunk capacity must not be zero");
        assert!(alignment.is_power_of_two(), "Alignment must be a power of 2");
        assert_eq!(classes.unit_range() % alignment, 0,
                   "Size class width must be a multiple of alignment");

        // Walk the classes in order, advancing a cursor by each block array
        let mut cursor = 0usize;
        let mut class_offsets = Vec::with_capacity(classes.class_count());
        for class in classes.classes() {
            class_offsets.push(cursor);
            cursor = capacity.checked_mul(classes.class_size(class))
                             .and_then(|len| len.checked_add(cursor))
                             .expect("Excessive chunk size requested");
        }
        let class_offsets = class_offsets.into_boxed_slice();

        // Round the buffer size to the next multiple of the page size
        let page_size = region::page::size();
        let extra_bytes = cursor % page_size;
        if extra_bytes != 0 {
            cursor = cursor.checked_add(page_size - extra_bytes)
                           .expect("Excessive chunk size requested");
        }
        let buffer_layout = Layout::from_size_align(cursor, alignment)
                                   .expect("Excessive chunk size requested");

        Self {
            classes,
            capacity,
            class_offsets,
            buffer_layout,
        }
    }

    /// Size class table of the chunks
    pub fn classes(&self) -> &SizeClasses {
        &self.classes
    }

    /// Number of blocks per size class in a chunk
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Alignment of a chunk's backing buffer, and thus of every block
    pub fn alignment(&self) -> usize {
        self.buffer_layout.align()
    }

    /// Size of a chunk's backing buffer (in bytes)
    pub fn chunk_size(&self) -> usize {
        self.buffer_layout.size()
    }

    /// Offset of a class' block array within the chunk (in bytes)
    pub fn class_offset(&self, class: ClassIndex) -> usize {
        self.class_offsets[class.get()]
    }

    /// Size of a class' block array (in bytes)
    pub fn class_len(&self, class: ClassIndex) -> usize {
        self.capacity * self.classes.class_size(class)
    }
}


/// A chunk of memory holding one block array per size class
///
/// The backing buffer is owned by the chunk and liberated when it is dropped.
#[derive(Debug)]
pub struct Chunk {
    /// Start of the backing buffer
    base: NonNull<u8>,

    /// Layout of the backing buffer, needed again to liberate it
    buffer_layout: Layout,

    /// Size classes that this chunk is partitioned for
    classes: SizeClasses,

    /// Number of blocks per size class
    capacity: usize,

    /// Start address of each class' block array
    data_bases: Box<[usize]>,

    /// Occupancy of each class' block array
    bitmaps: Box<[BlockBitmap]>,
}

impl Chunk {
    /// Allocate a new chunk where every block is free
    pub fn new(layout: &ChunkLayout) -> Result<Self, AllocError> {
        // Allocate the backing buffer. This is safe because chunk layouts
        // cannot have a zero size, as both capacity and class count are
        // nonzero.
        let buffer_layout = layout.buffer_layout;
        let base = NonNull::new(unsafe { alloc::alloc(buffer_layout) })
                           .ok_or(AllocError::OutOfMemory {
                               size: buffer_layout.size(),
                               align: buffer_layout.align(),
                           })?;

        // Record where each block array begins, and start with empty bitmaps
        let base_addr = base.as_ptr() as usize;
        let data_bases = layout.class_offsets
                               .iter()
                               .map(|offset| base_addr + offset)
                               .collect::<Box<[_]>>();
        let bitmaps = layout.classes
                            .classes()
                            .map(|_| BlockBitmap::new(layout.capacity))
                            .collect::<Box<[_]>>();

        Ok(Self {
            base,
            buffer_layout,
            classes: layout.classes,
            capacity: layout.capacity,
            data_bases,
            bitmaps,
        })
    }

    /// Start address of the chunk's backing buffer
    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Size of the chunk's backing buffer (in bytes)
    pub fn size(&self) -> usize {
        self.buffer_layout.size()
    }

    /// Start address of a class' block array
    pub fn data_base(&self, class: ClassIndex) -> usize {
        self.data_bases[class.get()]
    }

    /// Address of a block
    pub fn block_address(&self, class: ClassIndex, index: usize) -> NonNull<u8> {
        // Check interface preconditions in debug builds
        debug_assert!(index < self.capacity, "Block index is out of chunk range");

        // This is safe because the block lies within the backing buffer, so
        // the offset cannot overflow or wrap around.
        let offset = self.data_base(class) - self.base_addr()
                     + index * self.classes.class_size(class);
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    /// Find which class and block an address belongs to, if any
    ///
    /// Addresses pointing inside a block map to that block.
    pub fn locate(&self, addr: usize) -> Option<(ClassIndex, usize)> {
        self.classes.classes().find_map(|class| {
            let data_base = self.data_base(class);
            let class_size = self.classes.class_size(class);
            let data_end = data_base + self.capacity * class_size;
            if (data_base..data_end).contains(&addr) {
                Some((class, (addr - data_base) / class_size))
            } else {
                None
            }
        })
    }

    /// Mutable access to the occupancy bitmap of a given class
    pub fn bitmap_mut(&mut self, class: ClassIndex) -> &mut BlockBitmap {
        &mut self.bitmaps[class.get()]
    }

    /// Truth that every block of every class is free
    pub fn is_all_free(&self) -> bool {
        self.bitmaps.iter().all(BlockBitmap::is_all_free)
    }

    /// Number of free blocks of each class, smallest class first
    pub fn free_blocks_per_class(&self) -> Vec<usize> {
        self.bitmaps.iter().map(BlockBitmap::free_blocks).collect()
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // Liberate the backing buffer. This is safe because...
        // - A chunk is always created with a backing buffer allocation
        // - Only Drop, which happens at most once, can liberate that buffer
        // - The layout is the one used in `Chunk::new()`
        unsafe { alloc::dealloc(self.base.as_ptr(), self.buffer_layout) }
    }
}

// A chunk owns its backing buffer exclusively, like a Box<[u8]> would
unsafe impl Send for Chunk {}


#[cfg(test)]
mod tests {
    use super::*;

    fn small_layout() -> ChunkLayout {
        ChunkLayout::new(SizeClasses::new(64, 16), 10, 16)
    }

    #[test]
    fn layout_offsets() {
        let layout = small_layout();
        let classes = *layout.classes();
        let offsets = classes.classes()
                             .map(|class| layout.class_offset(class))
                             .collect::<Vec<_>>();
        assert_eq!(offsets, vec![0, 160, 160 + 320, 160 + 320 + 480]);
        let used = 160 + 320 + 480 + 640;
        assert!(layout.chunk_size() >= used);
        assert_eq!(layout.chunk_size() % region::page::size(), 0);
        assert_eq!(layout.class_len(classes.class(3).unwrap()), 640);
    }

    #[test]
    fn default_layout_size() {
        let layout = ChunkLayout::new(SizeClasses::new(1024, 16), 1024, 16);
        let used = 1024 * 16 * (64 * 65 / 2);
        assert!(layout.chunk_size() >= used);
        assert!(layout.chunk_size() < used + region::page::size());
    }

    #[test]
    fn fresh_chunk() {
        let layout = small_layout();
        let chunk = Chunk::new(&layout).unwrap();
        assert!(chunk.is_all_free());
        assert_eq!(chunk.size(), layout.chunk_size());
        assert_eq!(chunk.free_blocks_per_class(), vec![10; 4]);
        assert_eq!(chunk.base_addr() % 16, 0);
        for class in layout.classes().classes() {
            assert_eq!(chunk.data_base(class),
                       chunk.base_addr() + layout.class_offset(class));
        }
    }

    #[test]
    fn block_addresses_round_trip() {
        let layout = small_layout();
        let chunk = Chunk::new(&layout).unwrap();
        for class in layout.classes().classes() {
            let class_size = layout.classes().class_size(class);
            for index in 0..layout.capacity() {
                let addr = chunk.block_address(class, index).as_ptr() as usize;
                assert_eq!(addr, chunk.data_base(class) + index * class_size);
                assert_eq!(chunk.locate(addr), Some((class, index)));
                assert_eq!(chunk.locate(addr + class_size - 1), Some((class, index)));
            }
        }
    }

    #[test]
    fn foreign_addresses() {
        let layout = small_layout();
        let chunk = Chunk::new(&layout).unwrap();
        let base = chunk.base_addr();
        assert_eq!(chunk.locate(base - 1), None);
        let last = layout.classes().class(3).unwrap();
        let end = chunk.data_base(last) + layout.class_len(last);
        assert_eq!(chunk.locate(end), None);
        assert_eq!(chunk.locate(base + chunk.size()), None);
    }

    #[test]
    fn emptiness_spans_all_classes() {
        let layout = small_layout();
        let mut chunk = Chunk::new(&layout).unwrap();
        let first = layout.classes().class(0).unwrap();
        let last = layout.classes().class(3).unwrap();
        let a = chunk.bitmap_mut(first).acquire().unwrap();
        let b = chunk.bitmap_mut(last).acquire().unwrap();
        assert!(!chunk.is_all_free());
        chunk.bitmap_mut(first).release(a);
        assert!(!chunk.is_all_free());
        chunk.bitmap_mut(last).release(b);
        assert!(chunk.is_all_free());
    }

    #[test]
    #[should_panic]
    fn misaligned_classes() {
        ChunkLayout::new(SizeClasses::new(96, 24), 16, 16);
    }
}
