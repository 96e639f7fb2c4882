//! Mechanism for building a `BitmapAllocator`, with proper invariant checking

use crate::{chunk::ChunkLayout, size_class::SizeClasses, BitmapAllocator};


/// Default exclusive upper bound of managed allocation sizes (in bytes)
pub const DEFAULT_MANAGED_MAX: usize = 1024;

/// Default number of size classes, used to derive the default class width
pub const DEFAULT_CLASS_COUNT: usize = 64;

/// Default number of blocks per size class in each chunk
pub const DEFAULT_CHUNK_CAPACITY: usize = 1024;

/// Upper limit of the default block alignment (in bytes)
pub const MAX_DEFAULT_ALIGNMENT: usize = 16;


/// Builder for a bitmap allocator
//
// NOTE: The main purpose of this builder is to ensure that a certain number of
//       preconditions are upheld upon constructing the allocator. These are
//       listed as "must" bullet points in the struct members' doc comments.
#[derive(Clone, Debug, Default)]
pub struct Builder {
    /// Exclusive upper bound of the sizes served from chunks, in bytes
    /// - Will be set to `DEFAULT_MANAGED_MAX` if unspecified
    /// - Must be nonzero
    /// - Must be a multiple of the size class width
    managed_max: Option<usize>,

    /// Width of each size class band, in bytes
    /// - Will be set to `managed_max / DEFAULT_CLASS_COUNT` if unspecified
    /// - Must be nonzero
    /// - Must be a multiple of block alignment, so that all blocks are aligned
    unit_range: Option<usize>,

    /// Number of blocks per size class in each chunk
    /// - Will be set to `DEFAULT_CHUNK_CAPACITY` if unspecified
    /// - Must be nonzero
    /// - The resulting chunk size must not overflow `isize::MAX`
    chunk_capacity: Option<usize>,

    /// Block alignment in bytes
    /// - Will be set to the largest power of 2 that divides the size class
    ///   width, up to `MAX_DEFAULT_ALIGNMENT`, if unspecified
    /// - Must be a power of 2 (and thus nonzero), per `alloc::Layout` demands
    alignment: Option<usize>,
}

impl Builder {
    /// Start building an allocator
    pub const fn new() -> Self {
        Self {
            managed_max: None,
            unit_range: None,
            chunk_capacity: None,
            alignment: None,
        }
    }

    /// Set the exclusive upper bound of managed allocation sizes (in bytes)
    ///
    /// Requests of this size or larger bypass the chunks and go straight to
    /// the system allocator.
    pub fn managed_max(&mut self, managed_max: usize) -> &mut Self {
        assert!(managed_max != 0, "Managed size limit must not be zero");
        assert!(self.managed_max.replace(managed_max).is_none(),
                "Managed size limit must only be set once");
        self
    }

    /// Set the width of the size class bands (in bytes)
    ///
    /// Every managed allocation wastes at most this many bytes minus one, but
    /// narrower bands mean more size classes and thus larger chunks.
    pub fn unit_range(&mut self, unit_range: usize) -> &mut Self {
        assert!(unit_range != 0, "Size class width must not be zero");
        assert!(self.unit_range.replace(unit_range).is_none(),
                "Size class width must only be set once");
        self
    }

    /// Set the number of blocks that each chunk provides for every size class
    pub fn chunk_capacity(&mut self, chunk_capacity: usize) -> &mut Self {
        assert!(chunk_capacity != 0, "Chunk capacity must not be zero");
        assert!(self.chunk_capacity.replace(chunk_capacity).is_none(),
                "Chunk capacity must only be set once");
        self
    }

    /// Set the alignment of allocated blocks (in bytes)
    ///
    /// Both chunk blocks and system allocator fallbacks get this alignment.
    /// The size class width must be a multiple of it.
    pub fn alignment(&mut self, align: usize) -> &mut Self {
        assert!(align.is_power_of_two(), "Alignment must be a power of 2");
        assert!(self.alignment.replace(align).is_none(),
                "Alignment must only be set once");
        self
    }

    /// Build the previously configured allocator
    pub fn build(&self) -> BitmapAllocator {
        // Select the size class geometry
        let managed_max = self.managed_max.unwrap_or(DEFAULT_MANAGED_MAX);
        let unit_range = self.unit_range.unwrap_or_else(|| {
            let unit_range = managed_max / DEFAULT_CLASS_COUNT;
            assert!(unit_range != 0,
                    "Managed size limit is too small for the default size \
                     class width, please set the width explicitly");
            unit_range
        });
        assert_eq!(managed_max % unit_range, 0,
                   "Managed size limit must be a multiple of size class width");
        let classes = SizeClasses::new(managed_max, unit_range);

        // Select block alignment
        let alignment = self.alignment.unwrap_or_else(|| {
            let largest_pow2_divisor = unit_range & unit_range.wrapping_neg();
            largest_pow2_divisor.min(MAX_DEFAULT_ALIGNMENT)
        });
        assert_eq!(unit_range % alignment, 0,
                   "Size class width must be a multiple of alignment");

        // Lay out chunks, checking that they fit in memory
        let chunk_capacity = self.chunk_capacity.unwrap_or(DEFAULT_CHUNK_CAPACITY);
        let layout = ChunkLayout::new(classes, chunk_capacity, alignment);

        BitmapAllocator::with_layout(layout)
    }
}
