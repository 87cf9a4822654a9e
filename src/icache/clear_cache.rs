use super::CacheBackend;
use core::ffi::c_char;

extern "C" {
    /// Provided by the toolchain runtime (libgcc or compiler-rt), which knows
    /// the right sequence or syscall for the target.
    fn __clear_cache(start: *mut c_char, end: *mut c_char);
}

pub(super) struct ClearCache;

impl CacheBackend for ClearCache {
    const HAS_FLUSH: bool = true;

    unsafe fn flush(begin: *const u8, end: *const u8) {
        // Safety: the range is mapped, ensured by caller
        unsafe { __clear_cache(begin.cast_mut().cast(), end.cast_mut().cast()) }
    }
}
