//! Chunk memory: a pool of equally sized elements
//!
//! Storage is obtained in *chunks*, each one a single standard allocation
//! holding a [Chunk] header directly followed by its slab of slots. Free
//! slots are threaded into singly linked lists through their own first word,
//! so no extra memory is needed to track them.
//!
//! There are two kinds of free lists:
//!
//! * the pool-wide *lazy* list, onto which every freed element is pushed
//!   without looking up which chunk it belongs to
//! * one *eager* list per chunk, holding free slots known to belong to that
//!   chunk. Chunks with a non-empty eager list are kept on a doubly linked
//!   chain so they can be found and removed in O(1).
//!
//! Garbage collection moves lazily freed slots to the eager list of their
//! chunk (found by binary search over the chunks, which are kept sorted by
//! address) and then releases chunks that have become completely free.

use std::{
    fmt::{self, Debug},
    mem::size_of,
    ptr::{self, NonNull},
};

use tracing::Level;

use crate::{
    config::{ChunkMemoryConfig, ALIGNMENT, DEBUG_CHECKS},
    diag::{Diagnostics, Site},
    error::MemError,
    standard::StandardMemory,
    util::{roundto, UsizePtr},
};


/// Link stored in the first word of every free slot
#[repr(C)]
struct FreeSlot {
    next: Option<NonNull<FreeSlot>>,
}

/// Header of one chunk, immediately followed in memory by its slab
#[repr(C)]
struct Chunk {
    store: NonNull<u8>,
    store_end: NonNull<u8>,
    /// Slots of this chunk that are known to be free
    eager_free: Option<NonNull<FreeSlot>>,
    next_eager: Option<NonNull<Chunk>>,
    prev_eager: Option<NonNull<Chunk>>,
    elem_size: usize,
    store_size: usize,
    eager_free_size: usize,
    /// Index of this chunk in [ChunkMemory::chunks]
    array_pos: usize,
}

const CHUNK_HDR_SZ: usize = size_of::<Chunk>();
// slab must start suitably aligned for a free list link
const _: () = assert!(CHUNK_HDR_SZ % ALIGNMENT == 0);
const _: () = assert!(size_of::<FreeSlot>() == ALIGNMENT);

impl Chunk {
    fn range(&self) -> (usize, usize) {
        (
            self.store.as_ptr() as usize,
            self.store_end.as_ptr() as usize,
        )
    }
}

/// Binary search over sorted, disjoint half-open address ranges
///
/// Returns the index of the range containing `addr`.
pub fn search_ranges<T>(
    items: &[T],
    addr: usize,
    range: impl Fn(&T) -> (usize, usize),
) -> Option<usize> {
    let mut left = 0;
    let mut right = items.len();
    while left < right {
        let middle = left + (right - left) / 2;
        let (start, end) = range(&items[middle]);
        if addr < start {
            right = middle;
        } else if addr >= end {
            left = middle + 1;
        } else {
            return Some(middle);
        }
    }
    None
}

/// Public view of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    pub index: usize,
    pub store: UsizePtr,
    pub store_end: UsizePtr,
    pub store_size: usize,
    pub eager_free_size: usize,
}

/// Counters of a chunk pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkMemoryStats {
    pub elem_size: usize,
    pub n_chunks: usize,
    /// Chunks on the eager chain
    pub n_eager_chunks: usize,
    /// Total slots over all chunks
    pub store_size: usize,
    pub lazy_free_size: usize,
    pub eager_free_size: usize,
    /// Slots currently held by users
    pub n_used: usize,
    pub gc_calls: usize,
    pub gc_frees: usize,
}

impl ChunkMemoryStats {
    pub fn free_size(&self) -> usize {
        self.lazy_free_size + self.eager_free_size
    }
}

/// Pool of elements of a single size
pub struct ChunkMemory {
    /// Freed slots of any chunk, not yet sorted into eager lists
    lazy_free: Option<NonNull<FreeSlot>>,
    /// Sorted by slab address
    chunks: Vec<NonNull<Chunk>>,
    first_eager: Option<NonNull<Chunk>>,
    elem_size: usize,
    store_size: usize,
    lazy_free_size: usize,
    eager_free_size: usize,
    last_chunk_size: usize,
    config: ChunkMemoryConfig,
    gc_calls: usize,
    gc_frees: usize,
    /// Where the pool was created
    site: Site,
    std_mem: StandardMemory,
}
// safety: all chunks and slots are exclusively owned by the pool,
// nothing is tied to the creating thread
unsafe impl Send for ChunkMemory {}

impl Debug for ChunkMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkMemory")
            .field("@addr", &(self as *const _))
            .field("elem_size", &self.elem_size)
            .field("n_chunks", &self.chunks.len())
            .field("store_size", &self.store_size)
            .field("lazy_free_size", &self.lazy_free_size)
            .field("eager_free_size", &self.eager_free_size)
            .field("site", &self.site)
            .finish()
    }
}

impl Drop for ChunkMemory {
    fn drop(&mut self) {
        self.clear_at(self.site);
    }
}

impl ChunkMemory {
    /// Create an empty pool for elements of `size` bytes (rounded up to [ALIGNMENT])
    #[track_caller]
    pub fn new(size: usize, config: ChunkMemoryConfig) -> Self {
        Self::new_at(size, config, StandardMemory::new(), Site::caller())
    }

    #[track_caller]
    pub fn with_diagnostics(size: usize, config: ChunkMemoryConfig, diag: Diagnostics) -> Self {
        Self::new_at(
            size,
            config,
            StandardMemory::with_diagnostics(diag),
            Site::caller(),
        )
    }

    pub(crate) fn new_at(
        size: usize,
        config: ChunkMemoryConfig,
        std_mem: StandardMemory,
        site: Site,
    ) -> Self {
        let elem_size = roundto(size.max(1), ALIGNMENT);
        tracing::event!(Level::DEBUG, elem_size, %site, "chunk::new");
        Self {
            lazy_free: None,
            chunks: Vec::new(),
            first_eager: None,
            elem_size,
            store_size: 0,
            lazy_free_size: 0,
            eager_free_size: 0,
            last_chunk_size: 0,
            config,
            gc_calls: 0,
            gc_frees: 0,
            site,
            std_mem,
        }
    }

    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    pub fn config(&self) -> &ChunkMemoryConfig {
        &self.config
    }

    /// Source location the pool was created from
    pub fn site(&self) -> Site {
        self.site
    }

    pub fn n_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Bytes reserved for slots over all chunks
    pub fn memory_used(&self) -> usize {
        self.elem_size * self.store_size
    }

    pub fn stats(&self) -> ChunkMemoryStats {
        let n_eager_chunks = self
            .chunks
            .iter()
            // safety: chunks are live while they are in the array
            .filter(|c| unsafe { c.as_ref() }.eager_free.is_some())
            .count();
        ChunkMemoryStats {
            elem_size: self.elem_size,
            n_chunks: self.chunks.len(),
            n_eager_chunks,
            store_size: self.store_size,
            lazy_free_size: self.lazy_free_size,
            eager_free_size: self.eager_free_size,
            n_used: self.store_size - self.lazy_free_size - self.eager_free_size,
            gc_calls: self.gc_calls,
            gc_frees: self.gc_frees,
        }
    }

    fn info(&self, index: usize) -> ChunkInfo {
        // safety: chunks are live while they are in the array
        let c = unsafe { self.chunks[index].as_ref() };
        ChunkInfo {
            index,
            store: UsizePtr::from(c.store),
            store_end: UsizePtr::from(c.store_end),
            store_size: c.store_size,
            eager_free_size: c.eager_free_size,
        }
    }

    /// All chunks in address order
    pub fn chunks(&self) -> Vec<ChunkInfo> {
        (0..self.chunks.len()).map(|i| self.info(i)).collect()
    }

    fn find_chunk_index(&self, addr: usize) -> Option<usize> {
        // safety: chunks are live while they are in the array
        search_ranges(&self.chunks, addr, |c| unsafe { c.as_ref() }.range())
    }

    /// Chunk whose slab contains `ptr`, by binary search
    pub fn find_chunk(&self, ptr: *const u8) -> Option<ChunkInfo> {
        self.find_chunk_index(ptr as usize).map(|i| self.info(i))
    }

    /// Whether `ptr` lies inside one of this pool's chunks
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.find_chunk_index(ptr as usize).is_some()
    }

    fn check_elem_size(&self, site: Site, size: usize) -> Result<(), MemError> {
        if DEBUG_CHECKS && roundto(size.max(1), ALIGNMENT) != self.elem_size {
            return Err(self.std_mem.diagnostics().fail(
                site,
                MemError::WrongElementSize {
                    requested: size,
                    elem_size: self.elem_size,
                },
            ));
        }
        Ok(())
    }

    fn checkmem(&self) {
        if cfg!(feature = "checkmem") {
            self.check_consistency();
        }
    }

    /// Size of the next chunk to create, in slots
    fn next_chunk_size(&self) -> usize {
        let cfg = &self.config;
        let size = if self.chunks.is_empty() {
            cfg.init_chunk_size
        } else {
            2 * self.last_chunk_size
        };
        let size = size.max(cfg.chunk_length_min / self.elem_size);
        let size = size.min(cfg.chunk_length_max / self.elem_size);
        let size = size.min(cfg.store_size_max);
        size.max(1)
    }

    /// Insert a chunk into the address-sorted array
    unsafe fn link_chunk(&mut self, chunk: NonNull<Chunk>) {
        let store = (*chunk.as_ptr()).store;
        let pos = self
            .chunks
            .partition_point(|c| unsafe { c.as_ref() }.store < store);
        debug_assert!(
            pos == self.chunks.len()
                || (*chunk.as_ptr()).store_end <= self.chunks[pos].as_ref().store
        );

        self.chunks.insert(pos, chunk);
        for (i, c) in self.chunks.iter().enumerate().skip(pos) {
            (*c.as_ptr()).array_pos = i;
        }
        self.store_size += (*chunk.as_ptr()).store_size;
    }

    unsafe fn unlink_chunk(&mut self, chunk: NonNull<Chunk>) {
        let pos = (*chunk.as_ptr()).array_pos;
        debug_assert_eq!(self.chunks[pos], chunk);
        debug_assert!(
            (*chunk.as_ptr()).next_eager.is_none() && (*chunk.as_ptr()).prev_eager.is_none()
        );

        self.chunks.remove(pos);
        for (i, c) in self.chunks.iter().enumerate().skip(pos) {
            (*c.as_ptr()).array_pos = i;
        }
        self.store_size -= (*chunk.as_ptr()).store_size;
    }

    /// Put a chunk at the head of the eager chain
    unsafe fn link_eager(&mut self, chunk: NonNull<Chunk>) {
        let c = chunk.as_ptr();
        (*c).next_eager = self.first_eager;
        (*c).prev_eager = None;
        if let Some(first) = self.first_eager {
            (*first.as_ptr()).prev_eager = Some(chunk);
        }
        self.first_eager = Some(chunk);
    }

    unsafe fn unlink_eager(&mut self, chunk: NonNull<Chunk>) {
        let c = chunk.as_ptr();
        match (*c).prev_eager {
            Some(prev) => (*prev.as_ptr()).next_eager = (*c).next_eager,
            None => self.first_eager = (*c).next_eager,
        }
        if let Some(next) = (*c).next_eager {
            (*next.as_ptr()).prev_eager = (*c).prev_eager;
        }
        (*c).next_eager = None;
        (*c).prev_eager = None;
    }

    /// Allocate a new chunk and thread all its slots onto the lazy list
    fn create_chunk(&mut self, site: Site) -> Result<(), MemError> {
        let store_size = self.next_chunk_size();
        let bytes = store_size
            .saturating_mul(self.elem_size)
            .saturating_add(CHUNK_HDR_SZ);

        let trace_span = tracing::span!(
            Level::DEBUG,
            "chunk::create_chunk",
            elem_size = self.elem_size,
            store_size
        );
        let _span_enter = trace_span.enter();

        if self.chunks.try_reserve(1).is_err() {
            return Err(self.std_mem.diagnostics().fail(
                site,
                MemError::OutOfMemory {
                    size: (self.chunks.len() + 1) * size_of::<NonNull<Chunk>>(),
                },
            ));
        }
        let raw = self.std_mem.alloc_at(site, bytes, false)?;

        unsafe {
            // safety: raw is a fresh block of CHUNK_HDR_SZ + store_size * elem_size bytes,
            // aligned to at least ALIGNMENT
            let chunk = raw.cast::<Chunk>();
            let store = NonNull::new_unchecked(raw.as_ptr().add(CHUNK_HDR_SZ));
            let store_end = NonNull::new_unchecked(store.as_ptr().add(store_size * self.elem_size));
            chunk.as_ptr().write(Chunk {
                store,
                store_end,
                eager_free: None,
                next_eager: None,
                prev_eager: None,
                elem_size: self.elem_size,
                store_size,
                eager_free_size: 0,
                array_pos: 0,
            });

            // thread back to front so the list runs in address order
            let mut next = self.lazy_free;
            for i in (0..store_size).rev() {
                let slot = store.as_ptr().add(i * self.elem_size) as *mut FreeSlot;
                slot.write(FreeSlot { next });
                next = Some(NonNull::new_unchecked(slot));
            }
            self.lazy_free = next;
            self.lazy_free_size += store_size;
            self.last_chunk_size = store_size;

            self.link_chunk(chunk);
            tracing::event!(
                Level::DEBUG,
                chunk = ?UsizePtr::from(chunk),
                n_chunks = self.chunks.len()
            );
        }

        Ok(())
    }

    /// Release the storage of a chunk that is no longer referenced
    unsafe fn destroy_chunk(&self, site: Site, chunk: NonNull<Chunk>) {
        tracing::event!(
            Level::DEBUG,
            chunk = ?UsizePtr::from(chunk),
            "chunk::destroy_chunk"
        );
        if let Err(e) = self.std_mem.free_at(site, chunk.cast()) {
            tracing::event!(Level::ERROR, ?e, "failed to release chunk");
        }
    }

    /// Remove a chunk whose slots are all on its eager list
    unsafe fn free_chunk(&mut self, site: Site, chunk: NonNull<Chunk>) {
        debug_assert_eq!(
            (*chunk.as_ptr()).eager_free_size,
            (*chunk.as_ptr()).store_size
        );
        self.eager_free_size -= (*chunk.as_ptr()).eager_free_size;
        self.unlink_eager(chunk);
        self.unlink_chunk(chunk);
        self.destroy_chunk(site, chunk);
    }

    /// Take a slot from the eager list of `chunk`
    unsafe fn alloc_chunk_element(&mut self, chunk: NonNull<Chunk>) -> Option<NonNull<u8>> {
        let c = chunk.as_ptr();
        let slot = (*c).eager_free?;
        (*c).eager_free = (*slot.as_ptr()).next;
        (*c).eager_free_size -= 1;
        self.eager_free_size -= 1;

        if (*c).eager_free.is_none() {
            debug_assert_eq!((*c).eager_free_size, 0);
            self.unlink_eager(chunk);
        }
        Some(slot.cast())
    }

    /// Put a slot onto the eager list of `chunk`, linking the chunk into the eager chain if needed
    unsafe fn free_chunk_element(&mut self, chunk: NonNull<Chunk>, ptr: NonNull<u8>) {
        let c = chunk.as_ptr();
        debug_assert!({
            let (start, end) = (*c).range();
            (start..end).contains(&(ptr.as_ptr() as usize))
        });

        if (*c).eager_free.is_none() {
            self.link_eager(chunk);
        }
        let slot = ptr.cast::<FreeSlot>();
        slot.as_ptr().write(FreeSlot {
            next: (*c).eager_free,
        });
        (*c).eager_free = Some(slot);
        (*c).eager_free_size += 1;
        self.eager_free_size += 1;
    }

    /// Get one element of `size` bytes, which must match the pool's element size
    #[track_caller]
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, MemError> {
        let site = Site::caller();
        self.check_elem_size(site, size)?;
        self.alloc_at(site)
    }

    pub(crate) fn alloc_at(&mut self, site: Site) -> Result<NonNull<u8>, MemError> {
        let trace_span = tracing::span!(Level::TRACE, "chunk::alloc", elem_size = self.elem_size);
        let _span_enter = trace_span.enter();

        if self.lazy_free.is_none() {
            debug_assert_eq!(self.lazy_free_size, 0);
            if let Some(chunk) = self.first_eager {
                // safety: chunks on the eager chain are live
                if let Some(ptr) = unsafe { self.alloc_chunk_element(chunk) } {
                    tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(ptr), "eager");
                    self.checkmem();
                    return Ok(ptr);
                }
            }
            self.create_chunk(site)?;
        }

        let Some(slot) = self.lazy_free else {
            return Err(self
                .std_mem
                .diagnostics()
                .fail(site, MemError::OutOfMemory { size: self.elem_size }));
        };
        // safety: slots on the lazy list are free and hold a valid link
        self.lazy_free = unsafe { (*slot.as_ptr()).next };
        self.lazy_free_size -= 1;

        tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(slot), "lazy");
        self.checkmem();
        Ok(slot.cast())
    }

    /// Allocate an element holding a copy of `src`
    #[track_caller]
    pub fn duplicate(&mut self, src: &[u8]) -> Result<NonNull<u8>, MemError> {
        let site = Site::caller();
        self.check_elem_size(site, src.len())?;
        let ptr = self.alloc_at(site)?;
        // safety: fresh slot of elem_size >= src.len() bytes
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), ptr.as_ptr(), src.len()) };
        Ok(ptr)
    }

    /// Return the element `*ptr` to the pool and set it to `None`
    ///
    /// # Safety
    ///
    /// `*ptr` must be `None` or an element allocated from this pool and not freed since.
    #[track_caller]
    pub unsafe fn free(
        &mut self,
        ptr: &mut Option<NonNull<u8>>,
        size: usize,
    ) -> Result<(), MemError> {
        let site = Site::caller();
        let Some(p) = *ptr else {
            return Err(self.std_mem.diagnostics().fail(site, MemError::NullPointer));
        };
        self.check_elem_size(site, size)?;
        self.free_at(site, p)?;
        *ptr = None;
        Ok(())
    }

    /// Like [free](Self::free), but silently accepts `None`
    ///
    /// # Safety
    ///
    /// Same as [free](Self::free).
    #[track_caller]
    pub unsafe fn free_null(
        &mut self,
        ptr: &mut Option<NonNull<u8>>,
        size: usize,
    ) -> Result<(), MemError> {
        let site = Site::caller();
        if let Some(p) = *ptr {
            self.check_elem_size(site, size)?;
            self.free_at(site, p)?;
            *ptr = None;
        }
        Ok(())
    }

    pub(crate) unsafe fn free_at(&mut self, site: Site, ptr: NonNull<u8>) -> Result<(), MemError> {
        let trace_span = tracing::span!(
            Level::TRACE,
            "chunk::free",
            elem_size = self.elem_size,
            ptr = ?UsizePtr::from(ptr)
        );
        let _span_enter = trace_span.enter();

        if DEBUG_CHECKS && !self.owns(ptr.as_ptr()) {
            return Err(self.std_mem.diagnostics().fail(
                site,
                MemError::UnknownPointer {
                    ptr: UsizePtr::from(ptr),
                },
            ));
        }

        let slot = ptr.cast::<FreeSlot>();
        slot.as_ptr().write(FreeSlot {
            next: self.lazy_free,
        });
        self.lazy_free = Some(slot);
        self.lazy_free_size += 1;

        if self.wants_garbage_collection() {
            self.garbage_collect_at(site);
        }

        self.checkmem();
        Ok(())
    }

    fn wants_garbage_collection(&self) -> bool {
        let gf = self.config.garbage_factor;
        gf >= 0.0
            && !self.chunks.is_empty()
            && self.lazy_free_size >= self.config.garbage_size
            && (self.lazy_free_size + self.eager_free_size) as f64
                > gf * self.store_size as f64 / self.chunks.len() as f64
    }

    /// Sort lazily freed elements into their chunks and release completely free chunks
    ///
    /// A pool without any element in use is cleared entirely. Otherwise at
    /// least one chunk is kept.
    #[track_caller]
    pub fn garbage_collect(&mut self) {
        self.garbage_collect_at(Site::caller());
    }

    pub(crate) fn garbage_collect_at(&mut self, site: Site) {
        let trace_span = tracing::span!(
            Level::DEBUG,
            "chunk::garbage_collect",
            elem_size = self.elem_size,
            n_chunks = self.chunks.len()
        );
        let _span_enter = trace_span.enter();

        if self.lazy_free_size + self.eager_free_size == self.store_size {
            self.clear_at(site);
            return;
        }

        self.gc_calls += 1;

        while let Some(slot) = self.lazy_free {
            unsafe {
                // safety: slots on the lazy list are free and hold a valid link
                self.lazy_free = (*slot.as_ptr()).next;
                self.lazy_free_size -= 1;

                match self.find_chunk_index(slot.as_ptr() as usize) {
                    Some(i) => {
                        let c = self.chunks[i];
                        self.free_chunk_element(c, slot.cast());
                    }
                    None => self.std_mem.diagnostics().error(
                        site,
                        format!(
                            "chunk for lazy free element <{}> not found in chunk block of size {}",
                            UsizePtr::from(slot),
                            self.elem_size
                        ),
                    ),
                }
            }
        }
        debug_assert_eq!(self.lazy_free_size, 0);

        let mut chunk = self.first_eager;
        while let Some(c) = chunk {
            if self.chunks.len() <= 1 {
                break;
            }
            unsafe {
                // safety: chunks on the eager chain are live
                chunk = (*c.as_ptr()).next_eager;
                if (*c.as_ptr()).eager_free_size == (*c.as_ptr()).store_size {
                    self.gc_frees += 1;
                    self.free_chunk(site, c);
                }
            }
        }

        tracing::event!(
            Level::DEBUG,
            n_chunks = self.chunks.len(),
            eager_free_size = self.eager_free_size,
            gc_frees = self.gc_frees
        );
        self.checkmem();
    }

    /// Destroy all chunks, keeping the pool usable
    ///
    /// Elements still held by users become dangling.
    #[track_caller]
    pub fn clear(&mut self) {
        self.clear_at(Site::caller());
    }

    pub(crate) fn clear_at(&mut self, site: Site) {
        if !self.chunks.is_empty() {
            tracing::event!(
                Level::DEBUG,
                elem_size = self.elem_size,
                n_chunks = self.chunks.len(),
                "chunk::clear"
            );
        }
        for &chunk in &self.chunks {
            // safety: chunks are live while they are in the array
            unsafe { self.destroy_chunk(site, chunk) };
        }
        // keeps the capacity of the array
        self.chunks.clear();
        self.lazy_free = None;
        self.first_eager = None;
        self.last_chunk_size = 0;
        self.store_size = 0;
        self.lazy_free_size = 0;
        self.eager_free_size = 0;
    }

    /// Verify every structural invariant of the pool, panicking on violation
    pub fn check_consistency(&self) {
        let mut store_size = 0;
        let mut eager_free_size = 0;
        let mut n_eager = 0;
        let mut last_end = 0;

        for (i, &chunk) in self.chunks.iter().enumerate() {
            // safety: chunks are live while they are in the array
            let c = unsafe { chunk.as_ref() };
            let (start, end) = c.range();
            assert_eq!(c.array_pos, i, "array_pos out of sync");
            assert_eq!(c.elem_size, self.elem_size);
            assert_eq!(end - start, c.store_size * c.elem_size);
            assert!(start >= last_end, "chunks not sorted or overlapping");
            last_end = end;

            let mut n_free = 0;
            let mut slot = c.eager_free;
            while let Some(s) = slot {
                let addr = s.as_ptr() as usize;
                assert!(addr >= start && addr < end, "eager slot outside its chunk");
                assert_eq!((addr - start) % c.elem_size, 0);
                n_free += 1;
                // safety: slots on a free list hold a valid link
                slot = unsafe { s.as_ref() }.next;
            }
            assert_eq!(n_free, c.eager_free_size);

            if c.eager_free.is_none() {
                assert!(c.next_eager.is_none() && c.prev_eager.is_none());
                assert_ne!(self.first_eager, Some(chunk));
            } else {
                n_eager += 1;
                if c.prev_eager.is_none() {
                    assert_eq!(self.first_eager, Some(chunk));
                }
            }

            store_size += c.store_size;
            eager_free_size += c.eager_free_size;
        }
        assert_eq!(store_size, self.store_size);
        assert_eq!(eager_free_size, self.eager_free_size);
        assert_eq!(self.eager_free_size == 0, self.first_eager.is_none());

        let mut n_chain = 0;
        let mut prev = None;
        let mut chunk = self.first_eager;
        while let Some(c) = chunk {
            // safety: chunks on the eager chain are live
            let c_ref = unsafe { c.as_ref() };
            assert_eq!(c_ref.prev_eager, prev);
            assert!(c_ref.eager_free.is_some());
            assert_eq!(self.chunks.get(c_ref.array_pos), Some(&c));
            n_chain += 1;
            prev = Some(c);
            chunk = c_ref.next_eager;
        }
        assert_eq!(n_chain, n_eager);

        let mut n_lazy = 0;
        let mut slot = self.lazy_free;
        while let Some(s) = slot {
            assert!(
                self.owns(s.as_ptr() as *const u8),
                "lazy slot outside of every chunk"
            );
            n_lazy += 1;
            // safety: slots on a free list hold a valid link
            slot = unsafe { s.as_ref() }.next;
        }
        assert_eq!(n_lazy, self.lazy_free_size);
        assert!(self.lazy_free_size + self.eager_free_size <= self.store_size);
    }
}
