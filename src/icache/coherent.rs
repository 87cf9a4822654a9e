use super::CacheBackend;

/// Hosts whose instruction caches snoop data writes, nothing to do.
pub(super) struct Coherent;

impl CacheBackend for Coherent {
    const HAS_FLUSH: bool = false;

    #[inline(always)]
    unsafe fn flush(_begin: *const u8, _end: *const u8) {}
}
