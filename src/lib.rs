//! Native leaf helpers for code generation and dynamic loading.
//!
//! This crate provides two independent, stateless primitives:
//!
//! - [`resolve`] looks up an opaque module handle in a caller-owned
//!   [`AssociationTable`] keyed by an address-sized identifier.
//! - [`invalidate`] makes freshly written machine code in a [`MemoryRange`]
//!   visible to instruction fetch, or does nothing on hosts with coherent
//!   instruction caches.
//!
//! Both are also exported as `extern "C"` entry points (see [`ffi`]) for
//! runtimes that link this crate as a static or dynamic library.
//! [`CodeMemory`] is a small executable mapping that drives
//! [`invalidate`] the same way a JIT would.

mod code_memory;
mod errors;
pub mod ffi;
mod handle_table;
mod icache;
mod mmap;

pub use code_memory::CodeMemory;
pub use errors::Error;
pub type Result<T> = core::result::Result<T, Error>;
pub use handle_table::{resolve, AssociationTable, ModuleHandle, SharedAssociationTable};
pub use icache::{invalidate, invalidate_pages, invalidate_raw, MemoryRange, HAS_ICACHE_FLUSH};

static HOST_PAGE_SIZE: spin::Once<usize> = spin::Once::new();

/// Returns the host page size in bytes.
///
/// Queried once, later calls return the cached value.
pub fn host_page_size() -> usize {
    *HOST_PAGE_SIZE.call_once(|| {
        // Safety: sysconf has no preconditions
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(size).unwrap_or(4096)
    })
}

/// Round `addr` down to the start of its host page.
pub fn page_floor(addr: usize, page_size: usize) -> usize {
    debug_assert!(page_size.is_power_of_two());
    addr & !(page_size - 1)
}

/// Round `bytes` up to a multiple of the host page size, returning `None` on overflow.
pub fn page_ceil(bytes: usize, page_size: usize) -> Option<usize> {
    debug_assert!(page_size.is_power_of_two());
    bytes
        .checked_add(page_size - 1)
        .map(|val| val & !(page_size - 1))
}
