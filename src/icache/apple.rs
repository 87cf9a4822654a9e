use super::CacheBackend;
use core::ffi::c_void;

extern "C" {
    /// Provided by libSystem, cleans the data cache and invalidates the
    /// instruction cache for the given range.
    fn sys_icache_invalidate(start: *mut c_void, len: usize);
}

pub(super) struct SysIcacheInvalidate;

impl CacheBackend for SysIcacheInvalidate {
    const HAS_FLUSH: bool = true;

    unsafe fn flush(begin: *const u8, end: *const u8) {
        let len = end as usize - begin as usize;

        // Safety: the range is mapped, ensured by caller
        unsafe { sys_icache_invalidate(begin.cast_mut().cast(), len) }
    }
}
