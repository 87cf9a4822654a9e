use crate::icache::{invalidate_pages, invalidate_slice, MemoryRange};
use crate::mmap::Mmap;
use crate::{host_page_size, page_ceil, Error};
use core::fmt;

/// A page-aligned region that code is written into and then published for
/// execution.
///
/// Code is written while the region is read/write. [`CodeMemory::publish`]
/// switches the whole mapping to read/execute and invalidates the
/// instruction cache over the written bytes. Published code can still be
/// changed in place with [`CodeMemory::patch`].
pub struct CodeMemory {
    mmap: Mmap,
    len: usize,
    published: bool,
}

impl CodeMemory {
    /// Reserve at least `capacity` bytes, rounded up to whole host pages.
    ///
    /// # Errors
    ///
    /// Returns an error if the rounded size overflows or the mapping fails.
    pub fn new(capacity: usize) -> crate::Result<Self> {
        let size = page_ceil(capacity, host_page_size()).ok_or(Error::AddressOverflow {
            base: 0,
            len: capacity,
        })?;

        Ok(Self {
            mmap: Mmap::new(size)?,
            len: 0,
            published: false,
        })
    }

    /// Copy `bytes` to `offset` in the unpublished region.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyPublished`] after [`CodeMemory::publish`], and
    /// [`Error::OutOfBounds`] if the bytes do not fit.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> crate::Result<()> {
        if self.published {
            return Err(Error::AlreadyPublished);
        }
        let end = self.check_bounds(offset, bytes.len())?;

        // Safety: unpublished memory is read/write and the range is in bounds
        unsafe { self.mmap.slice_mut(offset..end).copy_from_slice(bytes) };
        self.len = self.len.max(end);

        Ok(())
    }

    /// Make the region executable and flush the instruction cache for the
    /// written code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyPublished`] when called twice, or the error of
    /// the failed protection change.
    pub fn publish(&mut self) -> crate::Result<()> {
        if self.published {
            return Err(Error::AlreadyPublished);
        }

        if self.len == 0 {
            tracing::warn!("code memory has no code to publish");
        }

        if !self.mmap.is_empty() {
            // Safety: writes go through `&mut self` and are rejected once published
            unsafe { self.mmap.make_executable(0..self.mmap.len())? };
            invalidate_slice(self.text());
        }
        self.published = true;

        tracing::debug!(code = ?self.range(), "published code memory");

        Ok(())
    }

    /// Overwrite published code at `offset`.
    ///
    /// The covering pages are made writable for the duration of the copy, so
    /// no thread may be executing them while this runs. If the pages cannot be
    /// made executable again the region falls back to the unpublished state,
    /// and [`CodeMemory::publish`] may be retried.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotPublished`] before [`CodeMemory::publish`],
    /// [`Error::OutOfBounds`] if the bytes do not fit, or the error of a
    /// failed protection change.
    pub fn patch(&mut self, offset: usize, bytes: &[u8]) -> crate::Result<()> {
        if !self.published {
            return Err(Error::NotPublished);
        }
        let end = self.check_bounds(offset, bytes.len())?;
        if bytes.is_empty() {
            return Ok(());
        }

        let pages = MemoryRange::new(offset, end)?.page_aligned(host_page_size())?;

        // Safety: the pages are ours and `&mut self` keeps Rust readers away;
        // keeping other threads from executing them is up to the caller
        unsafe {
            self.mmap.make_writable(pages.as_range())?;
            self.mmap.slice_mut(offset..end).copy_from_slice(bytes);
        }
        self.len = self.len.max(end);

        // Safety: see above
        let restored = unsafe {
            self.mmap
                .make_executable(pages.as_range())
                .or_else(|_| self.mmap.make_executable(pages.as_range()))
        };
        if let Err(err) = restored {
            tracing::error!(%err, ?pages, "failed to restore code memory protection");
            self.published = false;
            return Err(err);
        }

        // Safety: the patched pages lie inside our mapping
        unsafe { invalidate_pages(self.mmap.as_ptr().add(offset), bytes.len())? };

        tracing::debug!(offset, len = bytes.len(), "patched code memory");

        Ok(())
    }

    /// The bytes written so far.
    #[inline]
    pub fn text(&self) -> &[u8] {
        // Safety: the whole mapping is readable in either state
        unsafe { self.mmap.slice(0..self.len) }
    }

    /// Address range of the written code.
    pub fn range(&self) -> MemoryRange {
        MemoryRange::from_slice(self.text())
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    /// Number of bytes written so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the underlying mapping.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_published(&self) -> bool {
        self.published
    }

    fn check_bounds(&self, offset: usize, len: usize) -> crate::Result<usize> {
        let capacity = self.mmap.len();
        match offset.checked_add(len) {
            Some(end) if end <= capacity => Ok(end),
            _ => Err(Error::OutOfBounds {
                offset,
                len,
                capacity,
            }),
        }
    }
}

impl fmt::Debug for CodeMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeMemory")
            .field("mmap", &self.mmap)
            .field("len", &self.len)
            .field("published", &self.published)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn capacity_rounds_to_pages() {
        let mem = CodeMemory::new(1).unwrap();
        assert_eq!(mem.capacity(), host_page_size());
        assert!(mem.is_empty());
        assert!(!mem.is_published());

        let mem = CodeMemory::new(0).unwrap();
        assert_eq!(mem.capacity(), 0);
    }

    #[test_log::test]
    fn write_tracks_high_water_mark() {
        let mut mem = CodeMemory::new(64).unwrap();
        mem.write(16, &[1, 2, 3, 4]).unwrap();
        assert_eq!(mem.len(), 20);
        mem.write(0, &[9]).unwrap();
        assert_eq!(mem.len(), 20);
        assert_eq!(&mem.text()[..1], &[9]);
        assert_eq!(&mem.text()[16..], &[1, 2, 3, 4]);
        assert_eq!(mem.range().len(), 20);
        assert_eq!(mem.range().start(), mem.as_ptr() as usize);
    }

    #[test_log::test]
    fn rejects_out_of_bounds() {
        let mut mem = CodeMemory::new(1).unwrap();
        let capacity = mem.capacity();

        assert!(mem.write(capacity - 1, &[0]).is_ok());
        assert!(matches!(
            mem.write(capacity - 1, &[0, 0]),
            Err(Error::OutOfBounds { len: 2, .. })
        ));
        assert!(matches!(
            mem.write(usize::MAX, &[0]),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test_log::test]
    fn publish_lifecycle() {
        let mut mem = CodeMemory::new(32).unwrap();
        assert!(matches!(mem.patch(0, &[0]), Err(Error::NotPublished)));

        mem.write(0, &[0xc3; 8]).unwrap();
        mem.publish().unwrap();
        assert!(mem.is_published());

        assert!(matches!(mem.write(0, &[0]), Err(Error::AlreadyPublished)));
        assert!(matches!(mem.publish(), Err(Error::AlreadyPublished)));

        mem.patch(4, &[0x90, 0x90]).unwrap();
        assert_eq!(mem.text(), &[0xc3, 0xc3, 0xc3, 0xc3, 0x90, 0x90, 0xc3, 0xc3]);
        mem.patch(0, &[]).unwrap();
    }

    #[test_log::test]
    fn publish_empty() {
        let mut mem = CodeMemory::new(0).unwrap();
        mem.publish().unwrap();
        assert!(mem.text().is_empty());
    }

    /// A region at the very top of the address space, which userspace can
    /// never map, so every protection change on it fails.
    fn unmappable() -> CodeMemory {
        let page_size = host_page_size();
        let base = usize::MAX - 2 * page_size + 1;

        CodeMemory {
            // Safety: the result is forgotten, never dropped
            mmap: unsafe { Mmap::from_raw_parts(base as *mut u8, page_size) },
            len: 0,
            published: false,
        }
    }

    #[test_log::test]
    fn failed_publish_stays_unpublished() {
        let mut mem = unmappable();

        assert!(matches!(mem.publish(), Err(Error::Mmap(_))));
        assert!(!mem.is_published());

        // the retry hits the same syscall error instead of `AlreadyPublished`
        assert!(matches!(mem.publish(), Err(Error::Mmap(_))));
        assert!(!mem.is_published());
        assert!(matches!(mem.patch(0, &[0x90]), Err(Error::NotPublished)));

        core::mem::forget(mem);
    }

    #[test_log::test]
    fn failed_patch_keeps_state() {
        let mut mem = unmappable();
        mem.published = true;

        assert!(matches!(mem.patch(0, &[0x90]), Err(Error::Mmap(_))));
        assert!(mem.is_published());
        assert!(mem.is_empty());

        core::mem::forget(mem);
    }

    #[test_log::test]
    fn publish_without_code() {
        let mut mem = CodeMemory::new(64).unwrap();
        mem.publish().unwrap();
        assert!(mem.is_published());
        assert!(mem.text().is_empty());
        assert!(mem.range().is_empty());
    }
}
