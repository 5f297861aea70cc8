//! Buffer memory: a stack of reusable scratch buffers
//!
//! Buffers are handed out and returned in LIFO order. A returned buffer
//! keeps its storage, so the next request of at most the same size is served
//! without touching the system allocator. Buffers only ever grow; all of
//! their storage is released when the [BufferMemory] is dropped.

use std::{
    fmt::{self, Debug},
    mem::{align_of, size_of},
    ptr::{self, NonNull},
};

use tracing::Level;

use crate::{
    config::{BufferMemoryConfig, DEBUG_CHECKS, MAX_ALLOC_SIZE},
    diag::{Diagnostics, Site},
    error::MemError,
    standard::{StandardMemory, STD_ALIGN},
    util::{calc_grow_size, UsizePtr},
};


#[derive(Debug, Clone, Copy, Default)]
struct BufferSlot {
    /// Backing storage from the standard layer, `None` until first used
    data: Option<NonNull<u8>>,
    /// Capacity of `data` in bytes
    size: usize,
    used: bool,
}

/// Stack of scratch buffers
pub struct BufferMemory {
    slots: Vec<BufferSlot>,
    /// One past the topmost buffer currently handed out
    first_free: usize,
    /// Sum of all slot capacities
    total_mem: usize,
    clean: bool,
    array_grow_init: usize,
    array_grow_fac: f64,
    std_mem: StandardMemory,
    site: Site,
}

// safety: the buffers are owned exclusively by this object
unsafe impl Send for BufferMemory {}

impl Debug for BufferMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferMemory")
            .field("@addr", &(self as *const _))
            .field("n_slots", &self.slots.len())
            .field("first_free", &self.first_free)
            .field("total_mem", &self.total_mem)
            .field("clean", &self.clean)
            .finish()
    }
}

impl Default for BufferMemory {
    #[track_caller]
    fn default() -> Self {
        Self::new(BufferMemoryConfig::default())
    }
}

impl Drop for BufferMemory {
    fn drop(&mut self) {
        let diag = self.std_mem.diagnostics();
        let (count, bytes) = self
            .slots
            .iter()
            .filter(|s| s.used)
            .fold((0, 0), |(count, bytes), s| (count + 1, bytes + s.size));
        if count > 0 {
            diag.leaked(
                self.site,
                "Buffer memory destroyed with buffers still in use.",
                MemError::Leaked { bytes, count },
            );
        }
        for slot in self.slots.iter_mut() {
            if let Some(data) = slot.data.take() {
                // safety: data was allocated by std_mem and never handed to anyone else for freeing
                if let Err(e) = unsafe { self.std_mem.free_at(self.site, data) } {
                    tracing::event!(Level::ERROR, ?e, "failed to release buffer");
                }
            }
        }
    }
}

impl BufferMemory {
    #[track_caller]
    pub fn new(config: BufferMemoryConfig) -> Self {
        Self::new_at(config, StandardMemory::new(), Site::caller())
    }

    #[track_caller]
    pub fn with_diagnostics(config: BufferMemoryConfig, diag: Diagnostics) -> Self {
        Self::new_at(
            config,
            StandardMemory::with_diagnostics(diag),
            Site::caller(),
        )
    }

    fn new_at(config: BufferMemoryConfig, std_mem: StandardMemory, site: Site) -> Self {
        debug_assert!(config.array_grow_init > 0);
        debug_assert!(config.array_grow_fac >= 1.0);
        Self {
            slots: Vec::new(),
            first_free: 0,
            total_mem: 0,
            clean: config.clean,
            array_grow_init: config.array_grow_init,
            array_grow_fac: config.array_grow_fac,
            std_mem,
            site,
        }
    }

    /// Number of buffers currently handed out (counting holes below the top)
    pub fn n_used(&self) -> usize {
        self.first_free
    }

    /// Number of slots, used or not
    pub fn n_slots(&self) -> usize {
        self.slots.len()
    }

    /// Total capacity of all buffers in bytes
    pub fn memory_used(&self) -> usize {
        self.total_mem
    }

    pub fn is_clean(&self) -> bool {
        self.clean
    }

    pub fn set_array_grow_fac(&mut self, array_grow_fac: f64) {
        debug_assert!(array_grow_fac >= 1.0);
        self.array_grow_fac = array_grow_fac;
    }

    pub fn set_array_grow_init(&mut self, array_grow_init: usize) {
        debug_assert!(array_grow_init > 0);
        self.array_grow_init = array_grow_init;
    }

    fn grow_size(&self, num: usize) -> usize {
        calc_grow_size(self.array_grow_init, self.array_grow_fac, num, MAX_ALLOC_SIZE)
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

    /// Hand out the next buffer with room for at least `size` bytes
    #[track_caller]
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, MemError> {
        let site = Site::caller();
        self.check_size(site, size)?;
        self.alloc_at(site, size)
    }

    #[track_caller]
    pub fn alloc_array(&mut self, num: usize, typesize: usize) -> Result<NonNull<u8>, MemError> {
        let site = Site::caller();
        let size = StandardMemory::array_size(self.std_mem.diagnostics(), site, num, typesize)?;
        self.alloc_at(site, size)
    }

    /// Hand out a buffer whose first `num * typesize` bytes are zero
    #[track_caller]
    pub fn alloc_clear_array(
        &mut self,
        num: usize,
        typesize: usize,
    ) -> Result<NonNull<u8>, MemError> {
        let site = Site::caller();
        let size = StandardMemory::array_size(self.std_mem.diagnostics(), site, num, typesize)?;
        let ptr = self.alloc_at(site, size)?;
        // safety: buffer holds at least size bytes
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(ptr)
    }

    fn alloc_at(&mut self, site: Site, size: usize) -> Result<NonNull<u8>, MemError> {
        let size = size.max(1);

        let trace_span = tracing::span!(
            Level::TRACE,
            "buffer::alloc",
            size,
            first_free = self.first_free
        );
        let _span_enter = trace_span.enter();

        if self.first_free == self.slots.len() {
            let new_len = self.grow_size(self.first_free + 1);
            if self
                .slots
                .try_reserve_exact(new_len - self.slots.len())
                .is_err()
            {
                return Err(self.std_mem.diagnostics().fail(
                    site,
                    MemError::OutOfMemory {
                        size: new_len * size_of::<BufferSlot>(),
                    },
                ));
            }
            self.slots.resize_with(new_len, BufferSlot::default);
            tracing::event!(Level::DEBUG, n_slots = new_len, "grew buffer slots");
        }

        let bufnum = self.first_free;
        debug_assert!(!self.slots[bufnum].used);
        if self.slots[bufnum].size < size {
            self.grow_slot(site, bufnum, size)?;
        }

        let slot = &mut self.slots[bufnum];
        slot.used = true;
        self.first_free += 1;
        let ptr = slot.data.ok_or(MemError::OutOfMemory { size })?;

        tracing::event!(
            Level::TRACE,
            bufnum,
            capacity = slot.size,
            ptr = ?UsizePtr::from(ptr)
        );
        if cfg!(feature = "checkmem") && self.clean {
            // safety: data holds size initialized bytes
            let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), slot.size) };
            assert!(bytes.iter().all(|&b| b == 0), "clean buffer not zeroed");
        }
        self.checkmem();
        Ok(ptr)
    }

    /// Enlarge the storage of slot `bufnum` to hold `size` bytes
    ///
    /// On failure the slot is unchanged.
    fn grow_slot(&mut self, site: Site, bufnum: usize, size: usize) -> Result<(), MemError> {
        let new_size = self.grow_size(size);
        let old = self.slots[bufnum];
        debug_assert!(new_size > old.size);

        // safety: data is None or a live block of std_mem
        let data = unsafe { self.std_mem.realloc_at(site, old.data, new_size)? };
        if self.clean {
            // safety: data holds new_size bytes, the first old.size of which are initialized
            unsafe { ptr::write_bytes(data.as_ptr().add(old.size), 0, new_size - old.size) };
        }

        let slot = &mut self.slots[bufnum];
        slot.data = Some(data);
        slot.size = new_size;
        self.total_mem += new_size - old.size;
        tracing::event!(Level::DEBUG, bufnum, new_size, "grew buffer");
        Ok(())
    }

    /// Slot index of the handed out buffer `ptr`, searching from the top of the stack
    fn find_used(&self, site: Site, ptr: NonNull<u8>) -> Result<usize, MemError> {
        let diag = self.std_mem.diagnostics();
        let bufnum = self.slots[..self.first_free]
            .iter()
            .rposition(|s| s.data == Some(ptr))
            .ok_or_else(|| {
                diag.fail(
                    site,
                    MemError::UnknownPointer {
                        ptr: UsizePtr::from(ptr),
                    },
                )
            })?;
        if !self.slots[bufnum].used {
            return Err(diag.fail(
                site,
                MemError::AlreadyFreed {
                    ptr: UsizePtr::from(ptr),
                },
            ));
        }
        Ok(bufnum)
    }

    /// Make the buffer `ptr` hold at least `size` bytes, or hand out a new one if `ptr` is `None`
    ///
    /// The buffer only moves if its capacity is too small. Not supported for
    /// clean buffer memories.
    ///
    /// # Safety
    ///
    /// `ptr` must be `None` or a buffer handed out by this object and not freed since.
    #[track_caller]
    pub unsafe fn realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<NonNull<u8>, MemError> {
        let site = Site::caller();
        self.check_size(site, size)?;
        self.realloc_at(site, ptr, size)
    }

    /// # Safety
    ///
    /// Same as [realloc](Self::realloc).
    #[track_caller]
    pub unsafe fn realloc_array(
        &mut self,
        ptr: Option<NonNull<u8>>,
        num: usize,
        typesize: usize,
    ) -> Result<NonNull<u8>, MemError> {
        let site = Site::caller();
        let size = StandardMemory::array_size(self.std_mem.diagnostics(), site, num, typesize)?;
        self.realloc_at(site, ptr, size)
    }

    unsafe fn realloc_at(
        &mut self,
        site: Site,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<NonNull<u8>, MemError> {
        let Some(old) = ptr else {
            return self.alloc_at(site, size);
        };
        if self.clean {
            return Err(self.std_mem.diagnostics().fail(
                site,
                MemError::CleanRealloc {
                    ptr: UsizePtr::from(old),
                },
            ));
        }

        let trace_span = tracing::span!(
            Level::TRACE,
            "buffer::realloc",
            old = ?UsizePtr::from(old),
            size
        );
        let _span_enter = trace_span.enter();

        let bufnum = self.find_used(site, old)?;
        if size > self.slots[bufnum].size {
            self.grow_slot(site, bufnum, size)?;
        }
        let ptr = self.slots[bufnum]
            .data
            .ok_or(MemError::OutOfMemory { size })?;

        tracing::event!(Level::TRACE, bufnum, ptr = ?UsizePtr::from(ptr));
        self.checkmem();
        Ok(ptr)
    }

    /// Hand out a buffer holding a copy of `src`
    #[track_caller]
    pub fn duplicate(&mut self, src: &[u8]) -> Result<NonNull<u8>, MemError> {
        let site = Site::caller();
        self.check_size(site, src.len())?;
        let ptr = self.alloc_at(site, src.len())?;
        // safety: buffer holds at least src.len() bytes
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), ptr.as_ptr(), src.len()) };
        Ok(ptr)
    }

    #[track_caller]
    pub fn duplicate_array<T: Copy>(&mut self, src: &[T]) -> Result<NonNull<T>, MemError> {
        debug_assert!(align_of::<T>() <= STD_ALIGN);
        let site = Site::caller();
        let diag = self.std_mem.diagnostics();
        let size = StandardMemory::array_size(diag, site, src.len(), size_of::<T>())?;
        let ptr = self.alloc_at(site, size)?.cast::<T>();
        // safety: buffer holds at least size bytes, aligned to STD_ALIGN
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), ptr.as_ptr(), src.len()) };
        Ok(ptr)
    }

    /// Return the buffer `*ptr` and set it to `None`
    ///
    /// Buffers may be returned out of order; the stack top then only moves
    /// down once every buffer above the hole is returned too. In a clean
    /// buffer memory the caller must zero the buffer before returning it.
    ///
    /// # Safety
    ///
    /// `*ptr` must be a buffer handed out by this object.
    #[track_caller]
    pub unsafe fn free(&mut self, ptr: &mut Option<NonNull<u8>>) -> Result<(), MemError> {
        let site = Site::caller();
        match *ptr {
            Some(p) => {
                self.free_at(site, p)?;
                *ptr = None;
                Ok(())
            }
            None => Err(self.std_mem.diagnostics().fail(site, MemError::NullPointer)),
        }
    }

    /// Like [free](Self::free), but silently accepts `None`
    ///
    /// # Safety
    ///
    /// Same as [free](Self::free).
    #[track_caller]
    pub unsafe fn free_null(&mut self, ptr: &mut Option<NonNull<u8>>) -> Result<(), MemError> {
        let site = Site::caller();
        if let Some(p) = *ptr {
            self.free_at(site, p)?;
            *ptr = None;
        }
        Ok(())
    }

    unsafe fn free_at(&mut self, site: Site, ptr: NonNull<u8>) -> Result<(), MemError> {
        let trace_span = tracing::span!(Level::TRACE, "buffer::free", ptr = ?UsizePtr::from(ptr));
        let _span_enter = trace_span.enter();

        let bufnum = self.find_used(site, ptr)?;
        if cfg!(feature = "checkmem") && self.clean {
            let slot = &self.slots[bufnum];
            let bytes = std::slice::from_raw_parts(ptr.as_ptr(), slot.size);
            assert!(bytes.iter().all(|&b| b == 0), "clean buffer returned dirty");
        }
        self.slots[bufnum].used = false;

        while self.first_free > 0 && !self.slots[self.first_free - 1].used {
            self.first_free -= 1;
        }

        tracing::event!(Level::TRACE, bufnum, first_free = self.first_free);
        self.checkmem();
        Ok(())
    }

    /// One line per slot, `*` marking buffers in use
    pub fn display(&self, out: &mut impl fmt::Write) -> fmt::Result {
        let mut total = 0;
        for slot in &self.slots {
            let data = slot.data.map_or(ptr::null_mut(), |p| p.as_ptr());
            writeln!(
                out,
                "[{}] {:>8} bytes at {}",
                if slot.used { '*' } else { ' ' },
                slot.size,
                UsizePtr::from(data)
            )?;
            total += slot.size;
        }
        writeln!(
            out,
            "    {:>8} bytes total in {} buffers",
            total,
            self.slots.len()
        )
    }

    /// Verify the stack invariants, panicking on violation
    pub fn check_consistency(&self) {
        assert!(self.first_free <= self.slots.len());
        if self.first_free > 0 {
            assert!(self.slots[self.first_free - 1].used, "top of stack not in use");
        }
        assert!(
            self.slots[self.first_free..].iter().all(|s| !s.used),
            "buffer in use above the top of stack"
        );
        for slot in &self.slots {
            assert_eq!(slot.data.is_some(), slot.size > 0);
        }
        assert_eq!(
            self.slots.iter().map(|s| s.size).sum::<usize>(),
            self.total_mem,
            "total_mem out of sync"
        );
    }
}
