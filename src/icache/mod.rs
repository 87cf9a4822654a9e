//! Instruction cache maintenance for freshly written machine code.
//!
//! After writing instructions through a data pointer the processor may still
//! hold stale copies of that memory in its instruction cache. [`invalidate`]
//! asks the platform to discard them so subsequent instruction fetches see the
//! new bytes. Which mechanism is used is decided at build time; on hosts with
//! coherent instruction caches it does nothing.

use crate::{page_ceil, page_floor, Error};
use core::fmt;
use core::ops::Range;

cfg_if::cfg_if! {
    if #[cfg(any(target_arch = "x86", target_arch = "x86_64"))] {
        mod coherent;
        type Backend = coherent::Coherent;
    } else if #[cfg(target_vendor = "apple")] {
        mod apple;
        type Backend = apple::SysIcacheInvalidate;
    } else if #[cfg(all(target_arch = "aarch64", unix))] {
        mod aarch64;
        type Backend = aarch64::DcIcBackend;
    } else if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod clear_cache;
        type Backend = clear_cache::ClearCache;
    } else {
        mod coherent;
        type Backend = coherent::Coherent;
    }
}

/// A platform mechanism for making written code visible to instruction fetch.
trait CacheBackend {
    /// Whether [`CacheBackend::flush`] does any work at all.
    const HAS_FLUSH: bool;

    /// Flush the instruction cache for `[begin, end)`.
    ///
    /// # Safety
    ///
    /// `begin <= end` and every byte in the range must be mapped.
    unsafe fn flush(begin: *const u8, end: *const u8);
}

/// `true` if this build issues real cache maintenance, `false` if
/// [`invalidate`] compiles to a no-op.
pub const HAS_ICACHE_FLUSH: bool = <Backend as CacheBackend>::HAS_FLUSH;

/// A `[begin, end)` byte range holding recently written code.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct MemoryRange {
    begin: usize,
    end: usize,
}

impl MemoryRange {
    /// # Errors
    ///
    /// Returns [`Error::InvertedRange`] if `begin > end`.
    pub fn new(begin: usize, end: usize) -> crate::Result<Self> {
        if begin > end {
            return Err(Error::InvertedRange { begin, end });
        }

        Ok(Self { begin, end })
    }

    /// # Errors
    ///
    /// Returns [`Error::AddressOverflow`] if `ptr + len` does not fit in the address space.
    pub fn from_raw_parts(ptr: *const u8, len: usize) -> crate::Result<Self> {
        let begin = ptr as usize;
        let end = begin
            .checked_add(len)
            .ok_or(Error::AddressOverflow { base: begin, len })?;

        Ok(Self { begin, end })
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        let range = bytes.as_ptr_range();

        Self {
            begin: range.start as usize,
            end: range.end as usize,
        }
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.begin
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn as_range(&self) -> Range<usize> {
        self.begin..self.end
    }

    /// Widen the range outward to `page_size` boundaries.
    ///
    /// An empty range stays empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressOverflow`] if the end cannot be rounded up.
    pub fn page_aligned(&self, page_size: usize) -> crate::Result<Self> {
        if self.is_empty() {
            return Ok(*self);
        }

        let begin = page_floor(self.begin, page_size);
        let end = page_ceil(self.end, page_size).ok_or(Error::AddressOverflow {
            base: self.begin,
            len: self.len(),
        })?;

        Ok(Self { begin, end })
    }
}

impl fmt::Debug for MemoryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}..{:#x}", self.begin, self.end)
    }
}

impl From<MemoryRange> for Range<usize> {
    fn from(value: MemoryRange) -> Self {
        value.as_range()
    }
}

/// Make the code written to `range` visible to subsequent instruction fetches.
///
/// Empty ranges return immediately. Calling this any number of times on the
/// same range is harmless. On hosts without the need for explicit
/// maintenance this is a no-op (see [`HAS_ICACHE_FLUSH`]).
///
/// The caller must not let other threads execute the range until this returns.
///
/// # Safety
///
/// Every byte of `range` must be mapped in the current address space.
pub unsafe fn invalidate(range: MemoryRange) {
    tracing::trace!(?range, flushes = HAS_ICACHE_FLUSH, "invalidate icache");

    if range.is_empty() {
        return;
    }

    // Safety: the range is ordered by construction and mapped per our contract
    unsafe { Backend::flush(range.begin as *const u8, range.end as *const u8) }
}

/// Raw form of [`invalidate`] taking two pointers.
///
/// # Safety
///
/// `begin <= end` and every byte of `[begin, end)` must be mapped.
pub unsafe fn invalidate_raw(begin: *const u8, end: *const u8) {
    debug_assert!(begin <= end, "inverted range {begin:p}..{end:p}");

    // Safety: ensured by caller
    unsafe {
        invalidate(MemoryRange {
            begin: begin as usize,
            end: end as usize,
        });
    }
}

/// Invalidate the instruction cache for every host page touched by
/// `[addr, addr + size)`.
///
/// Used after patching code in place, where the patched bytes may straddle
/// page boundaries.
///
/// # Errors
///
/// Returns [`Error::AddressOverflow`] if the range cannot be expressed in the
/// address space once widened.
///
/// # Safety
///
/// Every page touched by the range must be mapped.
pub unsafe fn invalidate_pages(addr: *const u8, size: usize) -> crate::Result<()> {
    let range = MemoryRange::from_raw_parts(addr, size)?.page_aligned(crate::host_page_size())?;

    tracing::trace!(?range, "invalidate icache pages");

    // Safety: ensured by caller
    unsafe { invalidate(range) };

    Ok(())
}

/// Invalidate the instruction cache for a slice of code we can already see.
pub(crate) fn invalidate_slice(code: &[u8]) {
    // Safety: a live slice is mapped
    unsafe { invalidate(MemoryRange::from_slice(code)) }
}
