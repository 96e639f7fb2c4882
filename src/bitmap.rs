//! Mechanisms for tracking block occupancy within a chunk's block array
//!
//! Since modern CPUs are not bit-addressable, arrays of unsigned integers must
//! be used as vectors of bits. This module provides an abstraction to ease
//! correct manipulation of such a bit vector, where each bit tells whether the
//! matching block of a size class is free (1) or occupied (0).
//!
//! Free blocks are found by scanning the bitmap one machine word at a time,
//! starting from the first word, and using a find-first-set instruction on the
//! first word that has any free block. This gives a first-fit policy that
//! favors reuse of low block indices. The flip side is that allocation gets
//! slower as the bitmap fills up, since more fully occupied words must be
//! skipped before a free block is found.

use log::error;


/// Number of blocks tracked by one word of the bitmap
pub const BLOCKS_PER_WORD: usize = std::mem::size_of::<usize>() * 8;


/// Occupancy bitmap of one size class within one chunk
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockBitmap {
    /// Bit vector, 1 means free and 0 means occupied
    ///
    /// Bits past `capacity` in the last word are padding. They are kept at 0
    /// and must never be reported as free blocks.
    words: Box<[usize]>,

    /// Number of blocks tracked by this bitmap
    capacity: usize,

    /// Number of bits currently set within `0..capacity`
    free_blocks: usize,
}

impl BlockBitmap {
    /// Build a bitmap where every block is free
    pub fn new(capacity: usize) -> Self {
        // Check interface preconditions
        assert!(capacity != 0, "Bitmap capacity must not be zero");

        // Set every valid bit, clear the padding of the last word
        let num_words = div_round_up(capacity, BLOCKS_PER_WORD);
        let mut words = vec![usize::MAX; num_words].into_boxed_slice();
        let tail_blocks = capacity % BLOCKS_PER_WORD;
        if tail_blocks != 0 {
            words[num_words - 1] = (1 << tail_blocks) - 1;
        }

        Self {
            words,
            capacity,
            free_blocks: capacity,
        }
    }

    /// Number of blocks tracked by this bitmap
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of blocks that are currently free
    pub fn free_blocks(&self) -> usize {
        self.free_blocks
    }

    /// Truth that every block is free
    pub fn is_all_free(&self) -> bool {
        self.free_blocks == self.capacity
    }

    /// Truth that every block is occupied
    pub fn is_full(&self) -> bool {
        self.free_blocks == 0
    }

    /// Truth that a given block is free
    pub fn is_free(&self, index: usize) -> bool {
        assert!(index < self.capacity, "Block index is out of bitmap range");
        let (word_idx, mask) = Self::locate(index);
        self.words[word_idx] & mask != 0
    }

    /// Find the lowest-index free block, mark it occupied and return its index
    ///
    /// Returns `None` if every block is occupied.
    pub fn acquire(&mut self) -> Option<usize> {
        for (word_idx, word) in self.words.iter_mut().enumerate() {
            // Skip words where every block is occupied
            if *word == 0 {
                continue;
            }

            // Lowest set bit is the lowest free block of this word
            let bit = word.trailing_zeros() as usize;
            let index = word_idx * BLOCKS_PER_WORD + bit;

            // Padding bits are never set, but they must not leak out even if
            // they were, and no valid free bit can follow them.
            if index >= self.capacity {
                error!("Padding bit {} was found set in a bitmap of {} blocks",
                       index, self.capacity);
                return None;
            }

            // Flag the block as occupied
            *word &= !(1 << bit);
            self.free_blocks -= 1;
            return Some(index);
        }
        None
    }

    /// Mark a block as free again
    ///
    /// Returns whether the block was occupied before. Freeing a free block is
    /// otherwise harmless for the bitmap itself.
    ///
    /// # Panics
    ///
    /// If `index` is outside of the bitmap's capacity, which can only be the
    /// result of an address computation bug.
    pub fn release(&mut self, index: usize) -> bool {
        assert!(index < self.capacity,
                "Released block {} is out of bitmap range (capacity {})",
                index, self.capacity);
        let (word_idx, mask) = Self::locate(index);
        let word = &mut self.words[word_idx];
        let was_occupied = *word & mask == 0;
        *word |= mask;
        if was_occupied {
            self.free_blocks += 1;
        }
        was_occupied
    }

    /// Word index and bit mask of a given block
    fn locate(index: usize) -> (usize, usize) {
        (index / BLOCKS_PER_WORD, 1 << (index % BLOCKS_PER_WORD))
    }
}


/// Small utility to divide two integers, rounding the result up
pub(crate) fn div_round_up(x: usize, y: usize) -> usize {
    // Check interface preconditions in debug builds
    debug_assert!(y != 0, "Attempted to divide by zero");

    // Return rounded division result
    (x / y) + (x % y != 0) as usize
}


#[cfg(test)]
mod tests {
    use super::*;

    // Bitmap capacities around the word boundaries, where padding matters
    const CAPACITIES: &[usize] = &[
        1,
        2,
        BLOCKS_PER_WORD - 1,
        BLOCKS_PER_WORD,
        BLOCKS_PER_WORD + 1,
        3 * BLOCKS_PER_WORD - 5,
        1024,
    ];

    #[test]
    fn new_is_all_free() {
        for &capacity in CAPACITIES {
            let bitmap = BlockBitmap::new(capacity);
            assert_eq!(bitmap.capacity(), capacity);
            assert_eq!(bitmap.free_blocks(), capacity);
            assert!(bitmap.is_all_free());
            assert!(!bitmap.is_full());
            assert!((0..capacity).all(|idx| bitmap.is_free(idx)));
        }
    }

    #[test]
    fn acquire_in_order_until_full() {
        for &capacity in CAPACITIES {
            let mut bitmap = BlockBitmap::new(capacity);
            for expected in 0..capacity {
                assert_eq!(bitmap.acquire(), Some(expected));
            }
            assert!(bitmap.is_full());
            assert_eq!(bitmap.acquire(), None);
            assert_eq!(bitmap.acquire(), None);
        }
    }

    #[test]
    fn lowest_free_block_is_reused() {
        let mut bitmap = BlockBitmap::new(3 * BLOCKS_PER_WORD);
        for _ in 0..(2 * BLOCKS_PER_WORD + 3) {
            bitmap.acquire().unwrap();
        }
        assert!(bitmap.release(BLOCKS_PER_WORD + 7));
        assert!(bitmap.release(2 * BLOCKS_PER_WORD + 1));
        assert_eq!(bitmap.acquire(), Some(BLOCKS_PER_WORD + 7));
        assert_eq!(bitmap.acquire(), Some(2 * BLOCKS_PER_WORD + 1));
        assert_eq!(bitmap.acquire(), Some(2 * BLOCKS_PER_WORD + 3));
    }

    #[test]
    fn release_tracks_free_count() {
        let mut bitmap = BlockBitmap::new(10);
        let a = bitmap.acquire().unwrap();
        let b = bitmap.acquire().unwrap();
        assert_eq!(bitmap.free_blocks(), 8);
        assert!(!bitmap.is_free(a));
        assert!(bitmap.release(a));
        assert!(bitmap.is_free(a));
        assert!(bitmap.release(b));
        assert!(bitmap.is_all_free());
    }

    #[test]
    fn double_release_is_reported() {
        let mut bitmap = BlockBitmap::new(10);
        let idx = bitmap.acquire().unwrap();
        assert!(bitmap.release(idx));
        assert!(!bitmap.release(idx));
        assert_eq!(bitmap.free_blocks(), 10);
    }

    #[test]
    fn padding_is_never_returned() {
        // Even if padding bits got set, the scan must stop at capacity
        let mut bitmap = BlockBitmap::new(BLOCKS_PER_WORD + 1);
        bitmap.words[1] = usize::MAX;
        assert_eq!(bitmap.acquire(), Some(0));
        for _ in 1..BLOCKS_PER_WORD {
            bitmap.acquire().unwrap();
        }
        assert_eq!(bitmap.acquire(), Some(BLOCKS_PER_WORD));
        bitmap.words[1] = !1;
        bitmap.free_blocks = 0;
        assert_eq!(bitmap.acquire(), None);
        assert_eq!(bitmap.acquire(), None);
        assert_eq!(bitmap.words[1], !1);
    }

    #[test]
    #[should_panic]
    fn out_of_range_release() {
        let mut bitmap = BlockBitmap::new(BLOCKS_PER_WORD + 1);
        bitmap.release(BLOCKS_PER_WORD + 1);
    }

    #[test]
    #[should_panic]
    fn empty_bitmap() {
        BlockBitmap::new(0);
    }

    #[test]
    fn rounded_division() {
        assert_eq!(div_round_up(0, 64), 0);
        assert_eq!(div_round_up(1, 64), 1);
        assert_eq!(div_round_up(64, 64), 1);
        assert_eq!(div_round_up(65, 64), 2);
    }
}
