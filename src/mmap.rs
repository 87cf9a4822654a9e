use core::ops::Range;
use core::ptr::NonNull;
use core::{ptr, slice};
use rustix::mm::{MapFlags, MprotectFlags, ProtFlags};

/// An owned anonymous mapping, unmapped on drop.
#[derive(Debug)]
pub struct Mmap {
    memory: NonNull<[u8]>,
}

// Safety: the mapping is exclusively owned, mutation requires `&mut self`
unsafe impl Send for Mmap {}

impl Mmap {
    pub fn new_empty() -> Self {
        Self {
            memory: NonNull::from(<&mut [u8]>::default()),
        }
    }

    /// Map `size` bytes of zeroed, read/write memory.
    pub fn new(size: usize) -> crate::Result<Self> {
        debug_assert_eq!(size % crate::host_page_size(), 0);
        if size == 0 {
            return Ok(Self::new_empty());
        }

        // Safety: a fresh anonymous mapping does not alias anything
        let ptr = unsafe {
            rustix::mm::mmap_anonymous(
                ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )?
        };

        let memory = ptr::slice_from_raw_parts_mut(ptr.cast::<u8>(), size);
        let memory = NonNull::new(memory).ok_or(rustix::io::Errno::NOMEM)?;

        tracing::debug!(?ptr, size, "mapped code memory");

        Ok(Self { memory })
    }

    /// Describe `len` bytes at `ptr` as a mapping without mapping anything.
    ///
    /// # Safety
    ///
    /// The result must not be dropped unless `ptr..ptr + len` is a mapping we own.
    #[cfg(test)]
    pub(crate) unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> Self {
        Self {
            memory: NonNull::new(ptr::slice_from_raw_parts_mut(ptr, len))
                .expect("null mapping"),
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.memory.as_ptr().cast_const().cast()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.memory.as_ptr().cast()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// # Safety
    ///
    /// `range` must currently be readable.
    pub unsafe fn slice(&self, range: Range<usize>) -> &[u8] {
        assert!(range.start <= range.end);
        assert!(range.end <= self.len());
        // Safety: in bounds, readability ensured by caller
        unsafe { slice::from_raw_parts(self.as_ptr().add(range.start), range.end - range.start) }
    }

    /// # Safety
    ///
    /// `range` must currently be writable.
    pub unsafe fn slice_mut(&mut self, range: Range<usize>) -> &mut [u8] {
        assert!(range.start <= range.end);
        assert!(range.end <= self.len());
        // Safety: in bounds, writability ensured by caller
        unsafe {
            slice::from_raw_parts_mut(self.as_mut_ptr().add(range.start), range.end - range.start)
        }
    }

    /// Switch `range` to read/execute.
    ///
    /// # Safety
    ///
    /// No live slice into `range` may be written to afterward.
    pub unsafe fn make_executable(&self, range: Range<usize>) -> crate::Result<()> {
        // Safety: ensured by caller
        unsafe { self.protect(range, MprotectFlags::READ | MprotectFlags::EXEC) }
    }

    /// Switch `range` back to read/write.
    ///
    /// # Safety
    ///
    /// No other thread may be executing code in `range`.
    pub unsafe fn make_writable(&self, range: Range<usize>) -> crate::Result<()> {
        // Safety: ensured by caller
        unsafe { self.protect(range, MprotectFlags::READ | MprotectFlags::WRITE) }
    }

    unsafe fn protect(&self, range: Range<usize>, flags: MprotectFlags) -> crate::Result<()> {
        assert!(range.start <= range.end);
        assert!(range.end <= self.len());
        assert_eq!(
            range.start % crate::host_page_size(),
            0,
            "changing of protections isn't page-aligned",
        );

        if range.is_empty() {
            return Ok(());
        }

        // Safety: the range lies within our mapping and is page-aligned
        unsafe {
            let base = self.memory.as_ptr().cast::<u8>().add(range.start).cast();
            rustix::mm::mprotect(base, range.end - range.start, flags)?;
        }

        tracing::trace!(?range, ?flags, "changed code memory protection");

        Ok(())
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        if self.is_empty() {
            return;
        }

        // Safety: we own the mapping and nothing borrows it past this point
        let res = unsafe { rustix::mm::munmap(self.memory.as_ptr().cast(), self.len()) };
        if let Err(err) = res {
            tracing::error!(%err, "failed to unmap code memory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn empty_mapping() {
        let mmap = Mmap::new(0).unwrap();
        assert!(mmap.is_empty());
        assert_eq!(mmap.len(), 0);
    }

    #[test_log::test]
    fn zeroed_and_writable() {
        let page_size = crate::host_page_size();
        let mut mmap = Mmap::new(page_size * 2).unwrap();
        assert_eq!(mmap.len(), page_size * 2);
        assert_eq!(mmap.as_ptr() as usize % page_size, 0);

        // Safety: freshly mapped read/write
        unsafe {
            assert!(mmap.slice(0..mmap.len()).iter().all(|b| *b == 0));
            mmap.slice_mut(page_size - 2..page_size + 2)
                .copy_from_slice(&[1, 2, 3, 4]);
            assert_eq!(mmap.slice(page_size - 2..page_size + 2), &[1, 2, 3, 4]);
        }
    }

    #[test_log::test]
    fn protection_round_trip() {
        let page_size = crate::host_page_size();
        let mut mmap = Mmap::new(page_size).unwrap();

        // Safety: nothing executes or borrows the mapping meanwhile
        unsafe {
            mmap.make_executable(0..page_size).unwrap();
            assert_eq!(mmap.slice(0..4), &[0, 0, 0, 0]);
            mmap.make_writable(0..page_size).unwrap();
            mmap.slice_mut(0..1)[0] = 0xaa;
            assert_eq!(mmap.slice(0..1), &[0xaa]);
        }
    }
}
