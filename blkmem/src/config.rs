//! Tuning knobs
//!
//! Constants are compile-time limits. The structs hold the per-object
//! parameters that are chosen when a pool, block or buffer memory is created.

use std::mem::size_of;

/// Minimum slab size of a chunk, in bytes
pub const CHUNKLENGTH_MIN: usize = 1024;
/// Maximum slab size of a chunk, in bytes
pub const CHUNKLENGTH_MAX: usize = 1048576;
/// Maximum number of slots in a chunk
pub const STORESIZE_MAX: usize = 8192;
/// Minimum number of lazily freed slots before garbage collection is considered
pub const GARBAGE_SIZE: usize = 256;
/// Number of hash buckets of a block memory (prime)
pub const CHKHASH_SIZE: usize = 1013;
/// Slot alignment, which is also the width of a free list link
pub const ALIGNMENT: usize = size_of::<usize>();
const _: () = assert!(ALIGNMENT == size_of::<Option<std::ptr::NonNull<u8>>>());
/// Largest single request accepted when size checks are enabled
pub const MAX_ALLOC_SIZE: usize = (u32::MAX / 2) as usize;
/// Largest element count (times element size) accepted for arrays when size checks are enabled
pub const MAX_ARRAY_BYTES: usize = u32::MAX as usize;
/// Garbage factor that turns garbage collection off
pub const GARBAGE_COLLECTION_DISABLED: f64 = -1.0;

/// Whether the debug-only checks (size limits, shadow list, pointer membership) are compiled in
pub const DEBUG_CHECKS: bool = cfg!(debug_assertions);

/// Parameters of a single chunk pool
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkMemoryConfig {
    /// Number of slots in the first chunk
    pub init_chunk_size: usize,
    /// Collect garbage once the free slots exceed this many times the
    /// average chunk size. Negative disables collection.
    pub garbage_factor: f64,
    pub chunk_length_min: usize,
    pub chunk_length_max: usize,
    pub store_size_max: usize,
    pub garbage_size: usize,
}

impl Default for ChunkMemoryConfig {
    fn default() -> Self {
        Self {
            init_chunk_size: 64,
            garbage_factor: 10.0,
            chunk_length_min: CHUNKLENGTH_MIN,
            chunk_length_max: CHUNKLENGTH_MAX,
            store_size_max: STORESIZE_MAX,
            garbage_size: GARBAGE_SIZE,
        }
    }
}

impl ChunkMemoryConfig {
    pub fn with_init_chunk_size(mut self, init_chunk_size: usize) -> Self {
        self.init_chunk_size = init_chunk_size;
        self
    }

    pub fn with_garbage_factor(mut self, garbage_factor: f64) -> Self {
        self.garbage_factor = garbage_factor;
        self
    }

    pub fn with_chunk_length_min(mut self, chunk_length_min: usize) -> Self {
        self.chunk_length_min = chunk_length_min;
        self
    }

    pub fn with_chunk_length_max(mut self, chunk_length_max: usize) -> Self {
        self.chunk_length_max = chunk_length_max;
        self
    }

    pub fn with_store_size_max(mut self, store_size_max: usize) -> Self {
        self.store_size_max = store_size_max;
        self
    }

    pub fn with_garbage_size(mut self, garbage_size: usize) -> Self {
        self.garbage_size = garbage_size;
        self
    }

    pub fn garbage_collection_enabled(&self) -> bool {
        self.garbage_factor >= 0.0
    }
}

/// Parameters of a block memory, forwarded to every pool it creates
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BlockMemoryConfig {
    pub chunk: ChunkMemoryConfig,
}

impl BlockMemoryConfig {
    pub fn with_chunk(mut self, chunk: ChunkMemoryConfig) -> Self {
        self.chunk = chunk;
        self
    }

    pub fn with_init_chunk_size(mut self, init_chunk_size: usize) -> Self {
        self.chunk.init_chunk_size = init_chunk_size;
        self
    }

    pub fn with_garbage_factor(mut self, garbage_factor: f64) -> Self {
        self.chunk.garbage_factor = garbage_factor;
        self
    }
}

/// Parameters of a buffer memory
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferMemoryConfig {
    pub array_grow_init: usize,
    pub array_grow_fac: f64,
    /// Hand out zeroed buffers
    pub clean: bool,
}

impl Default for BufferMemoryConfig {
    fn default() -> Self {
        Self {
            array_grow_init: 4,
            array_grow_fac: 1.2,
            clean: false,
        }
    }
}

impl BufferMemoryConfig {
    pub fn with_array_grow_init(mut self, array_grow_init: usize) -> Self {
        self.array_grow_init = array_grow_init;
        self
    }

    pub fn with_array_grow_fac(mut self, array_grow_fac: f64) -> Self {
        self.array_grow_fac = array_grow_fac;
        self
    }

    pub fn with_clean(mut self, clean: bool) -> Self {
        self.clean = clean;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ChunkMemoryConfig::default();
        assert_eq!(c.init_chunk_size, 64);
        assert_eq!(c.chunk_length_min, 1024);
        assert_eq!(c.chunk_length_max, 1048576);
        assert_eq!(c.store_size_max, 8192);
        assert_eq!(c.garbage_size, 256);
        assert!(c.garbage_collection_enabled());
        assert!(!c
            .with_garbage_factor(GARBAGE_COLLECTION_DISABLED)
            .garbage_collection_enabled());

        let b = BufferMemoryConfig::default();
        assert_eq!(b.array_grow_init, 4);
        assert_eq!(b.array_grow_fac, 1.2);
        assert!(!b.clean);
    }

    #[test]
    fn block_setters_forward() {
        let b = BlockMemoryConfig::default()
            .with_init_chunk_size(4)
            .with_garbage_factor(2.0);
        assert_eq!(b.chunk.init_chunk_size, 4);
        assert_eq!(b.chunk.garbage_factor, 2.0);
        assert_eq!(b.chunk.store_size_max, STORESIZE_MAX);
    }
}
