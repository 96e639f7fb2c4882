//! Failures that can be reported by the allocators of this crate

use thiserror::Error;


/// Allocation or deallocation failure
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum AllocError {
    /// The system allocator could not provide memory, either for a request
    /// that is too large to be managed or for a new chunk
    #[error("out of memory while requesting {size} bytes with alignment {align}")]
    OutOfMemory {
        /// Size of the failed system allocation (in bytes)
        size: usize,

        /// Alignment of the failed system allocation (in bytes)
        align: usize,
    },

    /// A pointer was freed that neither belongs to a chunk nor was handed out
    /// by the system allocator fallback
    #[error("pointer {addr:#x} was not allocated by this allocator")]
    InvalidFree {
        /// Address of the offending pointer
        addr: usize,
    },
}
