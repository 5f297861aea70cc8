//! Block memory: chunk pools for arbitrary element sizes
//!
//! Requests are rounded up to [ALIGNMENT] and the rounded size selects a
//! [ChunkMemory] through a fixed-size hash table. Pools are created the
//! first time their size is requested and only removed again by
//! [garbage_collect](BlockMemory::garbage_collect) or
//! [clear](BlockMemory::clear).

use std::{
    fmt::{self, Debug},
    mem::{align_of, size_of},
    ptr::{self, NonNull},
};

use tracing::Level;

use crate::{
    chunk::{ChunkMemory, ChunkMemoryStats},
    config::{BlockMemoryConfig, ALIGNMENT, CHKHASH_SIZE, DEBUG_CHECKS, MAX_ALLOC_SIZE},
    diag::{Diagnostics, Site},
    error::MemError,
    standard::StandardMemory,
    util::{roundto, UsizePtr},
};

#[cfg(test)]
mod tests;

fn align_size(size: usize) -> usize {
    roundto(size.max(1), ALIGNMENT)
}

fn hash_number(aligned: usize) -> usize {
    aligned % CHKHASH_SIZE
}

/// Elements of one size class that were never freed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClassLeak {
    pub elem_size: usize,
    pub count: usize,
    pub bytes: usize,
    /// Where the pool of this size class was first needed
    pub site: Site,
}

impl fmt::Display for SizeClassLeak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes ({} elements of size {}) not freed. First Allocator: {}",
            self.bytes, self.count, self.elem_size, self.site
        )
    }
}

/// Result of [BlockMemory::check_empty]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockLeakReport {
    pub classes: Vec<SizeClassLeak>,
    pub total_bytes: usize,
}

impl BlockLeakReport {
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// Set of chunk pools indexed by element size
pub struct BlockMemory {
    buckets: Box<[Vec<ChunkMemory>]>,
    /// Aligned bytes currently handed out
    mem_used: usize,
    config: BlockMemoryConfig,
    std_mem: StandardMemory,
    site: Site,
}

impl Debug for BlockMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockMemory")
            .field("@addr", &(self as *const _))
            .field("mem_used", &self.mem_used)
            .field("n_pools", &self.n_pools())
            .field("config", &self.config)
            .finish()
    }
}

impl Default for BlockMemory {
    #[track_caller]
    fn default() -> Self {
        Self::new(BlockMemoryConfig::default())
    }
}

impl Drop for BlockMemory {
    fn drop(&mut self) {
        if self.has_used_elements() {
            self.std_mem
                .diagnostics()
                .warning(self.site, "Block memory destroyed with elements not freed.");
            self.check_empty_at(self.site);
        }
        self.clear_at(self.site);
    }
}

impl BlockMemory {
    #[track_caller]
    pub fn new(config: BlockMemoryConfig) -> Self {
        Self::new_at(config, StandardMemory::new(), Site::caller())
    }

    #[track_caller]
    pub fn with_diagnostics(config: BlockMemoryConfig, diag: Diagnostics) -> Self {
        Self::new_at(
            config,
            StandardMemory::with_diagnostics(diag),
            Site::caller(),
        )
    }

    fn new_at(config: BlockMemoryConfig, std_mem: StandardMemory, site: Site) -> Self {
        Self {
            buckets: (0..CHKHASH_SIZE).map(|_| Vec::new()).collect(),
            mem_used: 0,
            config,
            std_mem,
            site,
        }
    }

    pub fn config(&self) -> &BlockMemoryConfig {
        &self.config
    }

    /// Aligned bytes currently held by users
    pub fn memory_used(&self) -> usize {
        self.mem_used
    }

    pub fn n_pools(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    fn pools(&self) -> impl Iterator<Item = &ChunkMemory> {
        self.buckets.iter().flatten()
    }

    fn has_used_elements(&self) -> bool {
        self.pools().any(|p| p.stats().n_used > 0)
    }

    /// Pool serving elements of `size` bytes, if one exists yet
    pub fn chunk_memory(&self, size: usize) -> Option<&ChunkMemory> {
        let aligned = align_size(size);
        self.buckets[hash_number(aligned)]
            .iter()
            .find(|p| p.elem_size() == aligned)
    }

    /// Element size of the pool owning `ptr`, or 0 if no pool does
    ///
    /// This scans every pool.
    pub fn pointer_size(&self, ptr: *const u8) -> usize {
        self.owning_pool(ptr).map_or(0, |p| p.elem_size())
    }

    fn owning_pool(&self, ptr: *const u8) -> Option<&ChunkMemory> {
        self.pools().find(|p| p.owns(ptr))
    }

    fn checkmem(&self) {
        if cfg!(feature = "checkmem") {
            self.check_consistency();
        }
    }

    fn check_size(&self, site: Site, size: usize) -> Result<(), MemError> {
        if DEBUG_CHECKS && size > MAX_ALLOC_SIZE {
            return Err(self.std_mem.diagnostics().fail(
                site,
                MemError::SizeExceeded {
                    size,
                    limit: MAX_ALLOC_SIZE,
                },
            ));
        }
        Ok(())
    }

    /// Allocate one element of `size` bytes
    #[track_caller]
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, MemError> {
        self.alloc_at(Site::caller(), size)
    }

    #[track_caller]
    pub fn alloc_array(&mut self, num: usize, typesize: usize) -> Result<NonNull<u8>, MemError> {
        let site = Site::caller();
        let size = StandardMemory::array_size(self.std_mem.diagnostics(), site, num, typesize)?;
        self.alloc_at(site, size)
    }

    /// Allocate `num * typesize` zeroed bytes
    #[track_caller]
    pub fn alloc_clear_array(
        &mut self,
        num: usize,
        typesize: usize,
    ) -> Result<NonNull<u8>, MemError> {
        let site = Site::caller();
        let size = StandardMemory::array_size(self.std_mem.diagnostics(), site, num, typesize)?;
        let ptr = self.alloc_at(site, size)?;
        // safety: fresh element of at least size bytes
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(ptr)
    }

    fn alloc_at(&mut self, site: Site, size: usize) -> Result<NonNull<u8>, MemError> {
        self.check_size(site, size)?;
        let aligned = align_size(size);

        let trace_span = tracing::span!(Level::TRACE, "block::alloc", size, aligned);
        let _span_enter = trace_span.enter();

        let bucket = &mut self.buckets[hash_number(aligned)];
        let pos = match bucket.iter().position(|p| p.elem_size() == aligned) {
            Some(pos) => pos,
            None => {
                tracing::event!(Level::DEBUG, elem_size = aligned, "new chunk pool");
                bucket.push(ChunkMemory::new_at(
                    aligned,
                    self.config.chunk,
                    self.std_mem.clone(),
                    site,
                ));
                bucket.len() - 1
            }
        };
        let ptr = bucket[pos].alloc_at(site)?;
        self.mem_used += aligned;

        tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(ptr));
        self.checkmem();
        Ok(ptr)
    }

    /// Find the pool `ptr` has to be returned to, reporting a wrong size
    fn locate(
        &self,
        site: Site,
        ptr: NonNull<u8>,
        aligned: usize,
    ) -> Result<(usize, usize), MemError> {
        let hash = hash_number(aligned);
        let pos = self.buckets[hash]
            .iter()
            .position(|p| p.elem_size() == aligned);

        let owned = match pos {
            Some(pos) => !DEBUG_CHECKS || self.buckets[hash][pos].owns(ptr.as_ptr()),
            None => false,
        };
        if let (Some(pos), true) = (pos, owned) {
            return Ok((hash, pos));
        }

        let actual = if DEBUG_CHECKS {
            self.owning_pool(ptr.as_ptr()).map(|p| p.elem_size())
        } else {
            None
        };
        let err = if pos.is_some() && actual.is_none() {
            MemError::UnknownPointer {
                ptr: UsizePtr::from(ptr),
            }
        } else {
            MemError::SizeMismatch {
                ptr: UsizePtr::from(ptr),
                declared: aligned,
                actual,
            }
        };
        Err(self.std_mem.diagnostics().fail(site, err))
    }

    /// Resize an element, or allocate a new one if `ptr` is `None`
    ///
    /// Sizes that round to the same class return `ptr` unchanged. Otherwise
    /// the contents are moved to a new element; if that allocation fails the
    /// old element stays valid.
    ///
    /// # Safety
    ///
    /// `ptr` must be `None` or an element of `old_size` bytes allocated from this block memory.
    #[track_caller]
    pub unsafe fn realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, MemError> {
        self.realloc_at(Site::caller(), ptr, old_size, new_size)
    }

    /// # Safety
    ///
    /// Same as [realloc](Self::realloc) with `old_num * typesize` bytes.
    #[track_caller]
    pub unsafe fn realloc_array(
        &mut self,
        ptr: Option<NonNull<u8>>,
        old_num: usize,
        new_num: usize,
        typesize: usize,
    ) -> Result<NonNull<u8>, MemError> {
        let site = Site::caller();
        let diag = self.std_mem.diagnostics();
        let old_size = StandardMemory::array_size(diag, site, old_num, typesize)?;
        let new_size = StandardMemory::array_size(diag, site, new_num, typesize)?;
        self.realloc_at(site, ptr, old_size, new_size)
    }

    unsafe fn realloc_at(
        &mut self,
        site: Site,
        ptr: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, MemError> {
        let Some(old) = ptr else {
            return self.alloc_at(site, new_size);
        };
        self.check_size(site, new_size)?;

        let old_aligned = align_size(old_size);
        let new_aligned = align_size(new_size);
        if old_aligned == new_aligned {
            return Ok(old);
        }

        let trace_span = tracing::span!(
            Level::TRACE,
            "block::realloc",
            old = ?UsizePtr::from(old),
            old_aligned,
            new_aligned
        );
        let _span_enter = trace_span.enter();

        self.locate(site, old, old_aligned)?;
        let new = self.alloc_at(site, new_size)?;
        ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_aligned.min(new_aligned));
        self.free_at(site, old, old_size)?;
        Ok(new)
    }

    /// Allocate an element holding a copy of `src`
    #[track_caller]
    pub fn duplicate(&mut self, src: &[u8]) -> Result<NonNull<u8>, MemError> {
        let ptr = self.alloc_at(Site::caller(), src.len())?;
        // safety: fresh element of at least src.len() bytes
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), ptr.as_ptr(), src.len()) };
        Ok(ptr)
    }

    #[track_caller]
    pub fn duplicate_array<T: Copy>(&mut self, src: &[T]) -> Result<NonNull<T>, MemError> {
        debug_assert!(align_of::<T>() <= ALIGNMENT);
        let site = Site::caller();
        let diag = self.std_mem.diagnostics();
        let size = StandardMemory::array_size(diag, site, src.len(), size_of::<T>())?;
        let ptr = self.alloc_at(site, size)?.cast::<T>();
        // safety: fresh element of at least size bytes, aligned to ALIGNMENT
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), ptr.as_ptr(), src.len()) };
        Ok(ptr)
    }

    /// Return the element `*ptr` of `size` bytes and set it to `None`
    ///
    /// `None` is accepted silently only together with a size of 0.
    ///
    /// # Safety
    ///
    /// `*ptr` must be `None` or an element allocated from this block memory and not freed since.
    #[track_caller]
    pub unsafe fn free(
        &mut self,
        ptr: &mut Option<NonNull<u8>>,
        size: usize,
    ) -> Result<(), MemError> {
        let site = Site::caller();
        match *ptr {
            Some(p) => {
                self.free_at(site, p, size)?;
                *ptr = None;
            }
            None if size != 0 => {
                return Err(self.std_mem.diagnostics().fail(site, MemError::NullPointer));
            }
            None => {}
        }
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
            self.free_at(site, p, size)?;
            *ptr = None;
        }
        Ok(())
    }

    unsafe fn free_at(
        &mut self,
        site: Site,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Result<(), MemError> {
        let aligned = align_size(size);

        let trace_span = tracing::span!(
            Level::TRACE,
            "block::free",
            ptr = ?UsizePtr::from(ptr),
            aligned
        );
        let _span_enter = trace_span.enter();

        let (hash, pos) = self.locate(site, ptr, aligned)?;
        self.buckets[hash][pos].free_at(site, ptr)?;
        self.mem_used -= aligned;

        self.checkmem();
        Ok(())
    }

    /// Garbage collect every pool and drop pools left without chunks
    #[track_caller]
    pub fn garbage_collect(&mut self) {
        let site = Site::caller();
        let trace_span = tracing::span!(Level::DEBUG, "block::garbage_collect");
        let _span_enter = trace_span.enter();

        for bucket in self.buckets.iter_mut() {
            bucket.retain_mut(|pool| {
                pool.garbage_collect_at(site);
                pool.n_chunks() > 0
            });
        }

        tracing::event!(Level::DEBUG, n_pools = self.n_pools());
        self.checkmem();
    }

    /// Destroy every pool
    ///
    /// Elements still held by users become dangling.
    #[track_caller]
    pub fn clear(&mut self) {
        self.clear_at(Site::caller());
    }

    fn clear_at(&mut self, site: Site) {
        for bucket in self.buckets.iter_mut() {
            for pool in bucket.iter_mut() {
                pool.clear_at(site);
            }
            bucket.clear();
        }
        self.mem_used = 0;
    }

    /// Per size class usage table
    pub fn display(&self, out: &mut impl fmt::Write) -> fmt::Result {
        writeln!(
            out,
            " ElSize #Chunk #Eag  #Elems  #EagFr  #LazFr  #GCl #GFr  Free  MBytes First Allocator"
        )?;

        let mut total = ChunkMemoryStats::default();
        let mut n_blocks = 0;
        let mut n_unused = 0;
        let mut alloced_mem = 0;
        let mut free_mem = 0;

        for pool in self.pools() {
            let s = pool.stats();
            let site = pool.site();
            if s.store_size > 0 {
                n_blocks += 1;
                alloced_mem += s.elem_size * s.store_size;
                free_mem += s.elem_size * s.free_size();
                writeln!(
                    out,
                    "{:>7} {:>6} {:>4} {:>7} {:>7} {:>7} {:>5} {:>4} {:>5.1}% {:>6.1} {}",
                    s.elem_size,
                    s.n_chunks,
                    s.n_eager_chunks,
                    s.store_size,
                    s.eager_free_size,
                    s.lazy_free_size,
                    s.gc_calls,
                    s.gc_frees,
                    100.0 * s.free_size() as f64 / s.store_size as f64,
                    (s.elem_size * s.store_size) as f64 / (1024.0 * 1024.0),
                    site
                )?;
            } else {
                n_unused += 1;
                writeln!(
                    out,
                    "{:>7} <unused>                            {:>5} {:>4}        {}",
                    s.elem_size, s.gc_calls, s.gc_frees, site
                )?;
            }
            total.n_chunks += s.n_chunks;
            total.n_eager_chunks += s.n_eager_chunks;
            total.store_size += s.store_size;
            total.eager_free_size += s.eager_free_size;
            total.lazy_free_size += s.lazy_free_size;
            total.gc_calls += s.gc_calls;
            total.gc_frees += s.gc_frees;
        }

        writeln!(
            out,
            "  Total {:>6} {:>4} {:>7} {:>7} {:>7} {:>5} {:>4} {:>5.1}% {:>6.1}",
            total.n_chunks,
            total.n_eager_chunks,
            total.store_size,
            total.eager_free_size,
            total.lazy_free_size,
            total.gc_calls,
            total.gc_frees,
            if total.store_size > 0 {
                100.0 * total.free_size() as f64 / total.store_size as f64
            } else {
                0.0
            },
            alloced_mem as f64 / (1024.0 * 1024.0)
        )?;
        write!(
            out,
            "{} blocks ({} unused), {} bytes allocated, {} bytes free",
            n_blocks + n_unused,
            n_unused,
            alloced_mem,
            free_mem
        )?;
        if alloced_mem > 0 {
            write!(
                out,
                " ({:.1}%)",
                100.0 * free_mem as f64 / alloced_mem as f64
            )?;
        }
        writeln!(out)
    }

    /// Report every size class that still has elements handed out
    #[track_caller]
    pub fn check_empty(&self) -> BlockLeakReport {
        self.check_empty_at(Site::caller())
    }

    fn check_empty_at(&self, site: Site) -> BlockLeakReport {
        let diag = self.std_mem.diagnostics();
        let mut report = BlockLeakReport::default();

        for pool in self.pools() {
            let s = pool.stats();
            if s.n_used == 0 {
                continue;
            }
            let leak = SizeClassLeak {
                elem_size: s.elem_size,
                count: s.n_used,
                bytes: s.n_used * s.elem_size,
                site: pool.site(),
            };
            diag.leaked(
                site,
                leak.to_string(),
                MemError::Leaked {
                    bytes: leak.bytes,
                    count: leak.count,
                },
            );
            report.total_bytes += leak.bytes;
            report.classes.push(leak);
        }

        if report.total_bytes > 0 {
            diag.info(
                site,
                format!("{} bytes not freed in total.", report.total_bytes),
            );
        }
        report
    }

    /// Verify the invariants of every pool and of the hash table, panicking on violation
    pub fn check_consistency(&self) {
        let mut used = 0;
        for (hash, bucket) in self.buckets.iter().enumerate() {
            for (i, pool) in bucket.iter().enumerate() {
                assert_eq!(hash_number(pool.elem_size()), hash, "pool in wrong bucket");
                assert!(
                    bucket[..i].iter().all(|p| p.elem_size() != pool.elem_size()),
                    "duplicate pool for size {}",
                    pool.elem_size()
                );
                pool.check_consistency();
                let s = pool.stats();
                used += s.n_used * s.elem_size;
            }
        }
        assert_eq!(used, self.mem_used, "mem_used out of sync");
    }
}
