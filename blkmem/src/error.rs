use thiserror::Error;

use crate::util::UsizePtr;

/// Everything that can go wrong inside the allocator
///
/// Every error returned from a public operation has already been
/// reported to the owning object's [DiagnosticSink](crate::diag::DiagnosticSink)
/// by the time the caller sees it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemError {
    /// The system allocator returned null
    #[error("Insufficient memory for allocation of {size} bytes.")]
    OutOfMemory { size: usize },
    /// Single request above the size limit (only detected with debug assertions)
    #[error("Tried to allocate {size} bytes, exceeding {limit}.")]
    SizeExceeded { size: usize, limit: usize },
    /// `num * typesize` would not fit (only detected with debug assertions)
    #[error("Tried to allocate array of {num} elements of size {typesize}, exceeding {limit}.")]
    ArrayOverflow {
        num: usize,
        typesize: usize,
        limit: usize,
    },
    /// Pointer does not belong to the object it was handed to (also covers
    /// double frees detected by the shadow list)
    #[error("Tried to free unknown pointer <{ptr}>.")]
    UnknownPointer { ptr: UsizePtr },
    /// Non-null free was requested on a null pointer
    #[error("Tried to free null pointer.")]
    NullPointer,
    /// Block memory has no pool for the declared size, or the pool of the
    /// declared size does not own the pointer
    #[error(
        "Tried to free pointer <{ptr}> of unknown size {declared}{}.",
        owning_size_class(.actual)
    )]
    SizeMismatch {
        ptr: UsizePtr,
        declared: usize,
        actual: Option<usize>,
    },
    /// Chunk pool used with an element size other than its own
    #[error(
        "Tried to use chunk block of element size {elem_size} for element of size {requested}."
    )]
    WrongElementSize { requested: usize, elem_size: usize },
    /// Buffer was found but is not handed out
    #[error("Tried to free buffer pointer <{ptr}> already freed.")]
    AlreadyFreed { ptr: UsizePtr },
    /// Reallocating buffers of a clean buffer arena is not supported
    #[error("Tried to reallocate buffer <{ptr}> of a clean buffer memory.")]
    CleanRealloc { ptr: UsizePtr },
    /// Memory still held when the owner was destroyed
    #[error("{bytes} bytes in {count} allocations not freed.")]
    Leaked { bytes: usize, count: usize },
}

fn owning_size_class(actual: &Option<usize>) -> String {
    match actual {
        Some(actual) => format!(" (pointer belongs to size class {})", actual),
        None => String::new(),
    }
}
