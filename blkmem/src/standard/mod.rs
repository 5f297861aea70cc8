//! Standard memory layer
//!
//! A thin wrapper around the global allocator. Every block carries a small
//! header in front of the user region remembering the requested size, so
//! blocks can be freed and reallocated without the caller repeating the
//! size. With debug assertions every live block is additionally recorded in
//! a process-wide shadow list used for leak reports.
//!
//! The chunk, block and buffer layers obtain all of their own storage from
//! here.

use std::{
    alloc::{self, Layout},
    fmt,
    mem::{align_of, size_of},
    ptr::{self, NonNull},
};

use tracing::Level;

use crate::{
    config::{DEBUG_CHECKS, MAX_ALLOC_SIZE, MAX_ARRAY_BYTES},
    diag::{Diagnostics, Site},
    error::MemError,
    util::UsizePtr,
};

pub(crate) mod tracker;


/// Bytes in front of every user region, holding the requested size
const HEADER_SZ: usize = 16;
/// Alignment of every user region
pub const STD_ALIGN: usize = 16;
const _: () = assert!(HEADER_SZ >= size_of::<usize>() && HEADER_SZ % STD_ALIGN == 0);

fn layout_for(size: usize) -> Option<Layout> {
    Layout::from_size_align(size.checked_add(HEADER_SZ)?, STD_ALIGN).ok()
}

unsafe fn header_of(ptr: NonNull<u8>) -> *mut u8 {
    ptr.as_ptr().sub(HEADER_SZ)
}

unsafe fn raw_alloc(size: usize, zeroed: bool) -> Option<NonNull<u8>> {
    let layout = layout_for(size)?;
    let base = if zeroed {
        alloc::alloc_zeroed(layout)
    } else {
        alloc::alloc(layout)
    };
    let base = NonNull::new(base)?;
    (base.as_ptr() as *mut usize).write(size);
    Some(NonNull::new_unchecked(base.as_ptr().add(HEADER_SZ)))
}

unsafe fn raw_size(ptr: NonNull<u8>) -> usize {
    (header_of(ptr) as *const usize).read()
}

unsafe fn raw_realloc(ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
    let old_layout = layout_for(raw_size(ptr))?;
    let new_layout = layout_for(size)?;
    let base = alloc::realloc(header_of(ptr), old_layout, new_layout.size());
    let base = NonNull::new(base)?;
    (base.as_ptr() as *mut usize).write(size);
    Some(NonNull::new_unchecked(base.as_ptr().add(HEADER_SZ)))
}

unsafe fn raw_free(ptr: NonNull<u8>) {
    // the layout was valid when the block was created
    if let Some(layout) = layout_for(raw_size(ptr)) {
        alloc::dealloc(header_of(ptr), layout);
    }
}

/// One live entry of the shadow list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeakEntry {
    pub ptr: UsizePtr,
    pub size: usize,
    pub site: Site,
}

/// Snapshot of the shadow list
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeakReport {
    /// Live allocations, oldest first
    pub entries: Vec<LeakEntry>,
    /// Byte counter of the shadow list
    pub total: usize,
}

impl LeakReport {
    pub fn entries_total(&self) -> usize {
        self.entries.iter().map(|e| e.size).sum()
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Allocated memory:")?;
        for e in &self.entries {
            writeln!(f, "{:>12} {:>8} {}", e.ptr.to_string(), e.size, e.site)?;
        }
        writeln!(f, "Total:    {:>8}", self.total)?;
        let used = self.entries_total();
        if used != self.total {
            writeln!(
                f,
                "Used memory in list sums up to {} instead of {}",
                used, self.total
            )?;
        }
        Ok(())
    }
}

/// Handle on the standard memory layer
///
/// Cloning is cheap. All clones report to the same diagnostic sink.
#[derive(Debug, Clone, Default)]
pub struct StandardMemory {
    diag: Diagnostics,
}

impl StandardMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_diagnostics(diag: Diagnostics) -> Self {
        Self { diag }
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diag
    }

    fn check_size(&self, site: Site, size: usize) -> Result<(), MemError> {
        if DEBUG_CHECKS && size > MAX_ALLOC_SIZE {
            return Err(self.diag.fail(
                site,
                MemError::SizeExceeded {
                    size,
                    limit: MAX_ALLOC_SIZE,
                },
            ));
        }
        Ok(())
    }

    /// `num * typesize`, failing if it overflows (or, with size checks, exceeds the array limit)
    pub(crate) fn array_size(
        diag: &Diagnostics,
        site: Site,
        num: usize,
        typesize: usize,
    ) -> Result<usize, MemError> {
        let overflow = if DEBUG_CHECKS {
            typesize != 0 && num > MAX_ARRAY_BYTES / typesize
        } else {
            num.checked_mul(typesize).is_none()
        };
        if overflow {
            return Err(diag.fail(
                site,
                MemError::ArrayOverflow {
                    num,
                    typesize,
                    limit: MAX_ARRAY_BYTES,
                },
            ));
        }
        Ok(num * typesize)
    }

    /// Allocate `size` bytes of uninitialized memory
    ///
    /// A size of 0 is treated as 1, so every call returns a distinct pointer.
    #[track_caller]
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, MemError> {
        self.alloc_at(Site::caller(), size, false)
    }

    #[track_caller]
    pub fn alloc_array(&self, num: usize, typesize: usize) -> Result<NonNull<u8>, MemError> {
        let site = Site::caller();
        let size = Self::array_size(&self.diag, site, num, typesize)?;
        self.alloc_at(site, size, false)
    }

    /// Allocate `num * typesize` zeroed bytes
    #[track_caller]
    pub fn alloc_clear(&self, num: usize, typesize: usize) -> Result<NonNull<u8>, MemError> {
        let site = Site::caller();
        let size = Self::array_size(&self.diag, site, num, typesize)?;
        self.alloc_at(site, size, true)
    }

    pub(crate) fn alloc_at(
        &self,
        site: Site,
        size: usize,
        zeroed: bool,
    ) -> Result<NonNull<u8>, MemError> {
        let trace_span = tracing::span!(Level::TRACE, "standard::alloc", size, zeroed);
        let _span_enter = trace_span.enter();

        self.check_size(site, size)?;
        let size = size.max(1);
        // safety: size is non-zero
        let ptr = unsafe { raw_alloc(size, zeroed) }
            .ok_or_else(|| self.diag.fail(site, MemError::OutOfMemory { size }))?;
        tracker::record(ptr, size, site);

        tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(ptr));
        Ok(ptr)
    }

    /// Resize a block, or allocate a new one if `ptr` is `None`
    ///
    /// On failure the original block is left untouched and still valid.
    ///
    /// # Safety
    ///
    /// `ptr` must be `None` or a live block returned by this layer.
    #[track_caller]
    pub unsafe fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<NonNull<u8>, MemError> {
        self.realloc_at(Site::caller(), ptr, size)
    }

    /// # Safety
    ///
    /// Same as [realloc](Self::realloc).
    #[track_caller]
    pub unsafe fn realloc_array(
        &self,
        ptr: Option<NonNull<u8>>,
        num: usize,
        typesize: usize,
    ) -> Result<NonNull<u8>, MemError> {
        let site = Site::caller();
        let size = Self::array_size(&self.diag, site, num, typesize)?;
        self.realloc_at(site, ptr, size)
    }

    pub(crate) unsafe fn realloc_at(
        &self,
        site: Site,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<NonNull<u8>, MemError> {
        let Some(old) = ptr else {
            return self.alloc_at(site, size, false);
        };

        let trace_span = tracing::span!(
            Level::TRACE,
            "standard::realloc",
            old = ?UsizePtr::from(old),
            size
        );
        let _span_enter = trace_span.enter();

        self.check_size(site, size)?;
        if !tracker::contains(old) {
            return Err(self.diag.fail(
                site,
                MemError::UnknownPointer {
                    ptr: UsizePtr::from(old),
                },
            ));
        }
        let size = size.max(1);
        let new = raw_realloc(old, size)
            .ok_or_else(|| self.diag.fail(site, MemError::OutOfMemory { size }))?;
        tracker::replace(old, new, size, site);

        tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(new));
        Ok(new)
    }

    /// Allocate a copy of `src`
    #[track_caller]
    pub fn duplicate(&self, src: &[u8]) -> Result<NonNull<u8>, MemError> {
        let ptr = self.alloc_at(Site::caller(), src.len(), false)?;
        // safety: fresh block of at least src.len() bytes
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), ptr.as_ptr(), src.len()) };
        Ok(ptr)
    }

    #[track_caller]
    pub fn duplicate_array<T: Copy>(&self, src: &[T]) -> Result<NonNull<T>, MemError> {
        debug_assert!(align_of::<T>() <= STD_ALIGN);
        let site = Site::caller();
        let size = Self::array_size(&self.diag, site, src.len(), size_of::<T>())?;
        let ptr = self.alloc_at(site, size, false)?.cast::<T>();
        // safety: fresh block of at least size bytes, aligned to STD_ALIGN
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), ptr.as_ptr(), src.len()) };
        Ok(ptr)
    }

    /// Free the block `*ptr` points to and set it to `None`
    ///
    /// Freeing `None` is reported as an error.
    ///
    /// # Safety
    ///
    /// `*ptr` must be `None` or a live block returned by this layer.
    #[track_caller]
    pub unsafe fn free(&self, ptr: &mut Option<NonNull<u8>>) -> Result<(), MemError> {
        let site = Site::caller();
        let Some(p) = *ptr else {
            return Err(self.diag.fail(site, MemError::NullPointer));
        };
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
    pub unsafe fn free_null(&self, ptr: &mut Option<NonNull<u8>>) -> Result<(), MemError> {
        let site = Site::caller();
        if let Some(p) = *ptr {
            self.free_at(site, p)?;
            *ptr = None;
        }
        Ok(())
    }

    pub(crate) unsafe fn free_at(&self, site: Site, ptr: NonNull<u8>) -> Result<(), MemError> {
        let trace_span = tracing::span!(Level::TRACE, "standard::free", ptr = ?UsizePtr::from(ptr));
        let _span_enter = trace_span.enter();

        if !tracker::forget(ptr) {
            return Err(self.diag.fail(
                site,
                MemError::UnknownPointer {
                    ptr: UsizePtr::from(ptr),
                },
            ));
        }
        raw_free(ptr);
        Ok(())
    }

    /// Zero `num` bytes at `ptr`
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes of `num` bytes.
    pub unsafe fn clear_bytes(ptr: NonNull<u8>, num: usize) {
        ptr::write_bytes(ptr.as_ptr(), 0, num);
    }

    /// # Safety
    ///
    /// Both regions must be valid for `num` bytes and must not overlap.
    pub unsafe fn copy_bytes(dst: NonNull<u8>, src: NonNull<u8>, num: usize) {
        ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), num);
    }

    /// Copy that tolerates overlapping regions
    ///
    /// # Safety
    ///
    /// Both regions must be valid for `num` bytes.
    pub unsafe fn move_bytes(dst: NonNull<u8>, src: NonNull<u8>, num: usize) {
        ptr::copy(src.as_ptr(), dst.as_ptr(), num);
    }

    /// Size that was requested for the block (after promoting 0 to 1)
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block returned by this layer.
    pub unsafe fn allocation_size(ptr: NonNull<u8>) -> usize {
        raw_size(ptr)
    }

    /// Bytes currently held according to the shadow list (0 without debug assertions)
    pub fn memory_used() -> usize {
        tracker::memory_used()
    }

    pub fn leak_report() -> LeakReport {
        let (entries, total) = tracker::snapshot();
        LeakReport {
            entries: entries
                .into_iter()
                .map(|(ptr, e)| LeakEntry {
                    ptr,
                    size: e.size,
                    site: e.site,
                })
                .collect(),
            total,
        }
    }

    /// Write every live allocation with its allocation site to `out`
    pub fn display_memory(out: &mut impl fmt::Write) -> fmt::Result {
        if !DEBUG_CHECKS {
            return writeln!(
                out,
                "Optimized version of memory shell linked - no memory diagnostics available."
            );
        }
        write!(out, "{}", Self::leak_report())
    }

    /// Warn if any standard allocation is still live
    ///
    /// Returns the report that was warned about.
    #[track_caller]
    pub fn check_empty_memory(&self) -> Option<LeakReport> {
        let site = Site::caller();
        if !DEBUG_CHECKS {
            self.diag.info(
                site,
                "Optimized version of memory shell linked - no memory leakage check available.",
            );
            return None;
        }

        let report = Self::leak_report();
        if report.entries.is_empty() && report.total == 0 {
            return None;
        }
        self.diag.leaked(
            site,
            "Memory list not empty.",
            MemError::Leaked {
                bytes: report.total,
                count: report.entries.len(),
            },
        );
        for line in report.to_string().lines() {
            self.diag.info(site, line);
        }
        Some(report)
    }
}
