//! Address-ordered registry of the chunks owned by an allocator

use crate::{chunk::Chunk, size_class::ClassIndex};

use std::collections::BTreeMap;


/// Coordinates of a block: owning chunk, size class, and index in the class'
/// block array
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockRef {
    /// Base address of the owning chunk, which is its registry key
    pub chunk_base: usize,

    /// Size class of the block
    pub class: ClassIndex,

    /// Index of the block within the class' block array
    pub index: usize,
}


/// Set of live chunks, ordered by base address
///
/// The registry owns its chunks, so a chunk's backing memory lives exactly as
/// long as its registry entry.
#[derive(Debug, Default)]
pub struct ChunkRegistry {
    chunks: BTreeMap<usize, Chunk>,
}

impl ChunkRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered chunks
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Truth that no chunk is registered
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Take ownership of a new chunk, returning a reference to it
    pub fn register(&mut self, chunk: Chunk) -> &mut Chunk {
        // Chunks are distinct live allocations, so their ranges can't overlap
        let base = chunk.base_addr();
        debug_assert!(self.chunks
                          .range(..=base)
                          .next_back()
                          .map_or(true, |(&prev_base, prev)| prev_base + prev.size() <= base),
                      "New chunk overlaps a registered chunk");
        debug_assert!(self.chunks
                          .range(base..)
                          .next()
                          .map_or(true, |(&next_base, _)| next_base >= base + chunk.size()),
                      "New chunk overlaps a registered chunk");
        self.chunks.entry(base).or_insert(chunk)
    }

    /// Remove a chunk from the registry, handing it back to the caller
    pub fn retire(&mut self, chunk_base: usize) -> Option<Chunk> {
        self.chunks.remove(&chunk_base)
    }

    /// Mutably access a registered chunk
    pub fn get_mut(&mut self, chunk_base: usize) -> Option<&mut Chunk> {
        self.chunks.get_mut(&chunk_base)
    }

    /// Registered chunks, in ascending address order
    pub fn iter(&self) -> impl Iterator<Item = &Chunk> + '_ {
        self.chunks.values()
    }

    /// Mutable access to registered chunks, in ascending address order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Chunk> + '_ {
        self.chunks.values_mut()
    }

    /// Find the block that an address belongs to
    ///
    /// Returns `None` for addresses that are not within a block of one of the
    /// registered chunks, which were not allocated from the chunks.
    pub fn find_owner(&self, addr: usize) -> Option<BlockRef> {
        let chunk = self.find_chunk(addr)?;
        let (class, index) = chunk.locate(addr)?;
        Some(BlockRef {
            chunk_base: chunk.base_addr(),
            class,
            index,
        })
    }

    /// Find the chunk with the highest base address that is not above `addr`
    fn find_chunk(&self, addr: usize) -> Option<&Chunk> {
        self.chunks
            .range(..=addr)
            .next_back()
            .map(|(_, chunk)| chunk)
    }
}
