//! `extern "C"` entry points for runtimes linking this crate as a native library.
//!
//! [`get_module_handle`] and [`flush_cache`] never allocate, free or retain
//! anything. The [`AssociationTable`] has no stable layout, so foreign callers
//! treat it as an opaque pointer: Rust callers pass `&table`, everyone else
//! owns one through [`association_table_new`] and [`association_table_free`]
//! and fills it with [`association_table_insert`].

use crate::handle_table::{resolve, AssociationTable, ModuleHandle};
use crate::icache::invalidate_raw;
use core::ffi::c_void;
use core::ptr;

/// Allocate an empty table. Release it with [`association_table_free`].
#[no_mangle]
pub extern "C" fn association_table_new() -> *mut AssociationTable {
    Box::into_raw(Box::default())
}

/// Free a table returned by [`association_table_new`]. Null is ignored.
///
/// # Safety
///
/// `table` must come from [`association_table_new`], not be freed yet, and
/// not be in use by any other thread.
#[no_mangle]
pub unsafe extern "C" fn association_table_free(table: *mut AssociationTable) {
    if !table.is_null() {
        // Safety: ensured by caller
        drop(unsafe { Box::from_raw(table) });
    }
}

/// Associate `handle` with `key`, returning the handle it replaced or null.
///
/// A null `table` or null `handle` inserts nothing and returns null.
///
/// # Safety
///
/// A non-null `table` must come from [`association_table_new`] and not be
/// accessed by any other thread for the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn association_table_insert(
    table: *mut AssociationTable,
    key: usize,
    handle: *mut c_void,
) -> *mut c_void {
    // Safety: ensured by caller
    let (Some(table), Some(handle)) = (unsafe { table.as_mut() }, ModuleHandle::new(handle)) else {
        return ptr::null_mut();
    };

    table
        .insert(key, handle)
        .map_or(ptr::null_mut(), ModuleHandle::as_ptr)
}

/// Remove `key`, returning the handle it was associated with or null.
///
/// # Safety
///
/// Same as [`association_table_insert`].
#[no_mangle]
pub unsafe extern "C" fn association_table_remove(table: *mut AssociationTable, key: usize) -> *mut c_void {
    // Safety: ensured by caller
    let Some(table) = (unsafe { table.as_mut() }) else {
        return ptr::null_mut();
    };

    table.remove(key).map_or(ptr::null_mut(), ModuleHandle::as_ptr)
}

/// Look up `key` in `table`, returning the associated handle or null.
///
/// A null `table` is treated like an empty one.
///
/// # Safety
///
/// A non-null `table` must point to a live [`AssociationTable`] that no other
/// thread mutates for the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn get_module_handle(table: *const AssociationTable, key: usize) -> *mut c_void {
    // Safety: ensured by caller
    let Some(table) = (unsafe { table.as_ref() }) else {
        tracing::trace!(key, "get_module_handle called without a table");
        return ptr::null_mut();
    };

    resolve(table, key).map_or(ptr::null_mut(), |handle| handle.as_ptr())
}

/// Flush the instruction cache for `[begin, end)`.
///
/// Inverted ranges are logged and ignored.
///
/// # Safety
///
/// Every byte of `[begin, end)` must be mapped.
#[no_mangle]
pub unsafe extern "C" fn flush_cache(begin: *mut c_void, end: *mut c_void) {
    if begin > end {
        tracing::warn!(?begin, ?end, "flush_cache called with an inverted range");
        return;
    }

    // Safety: ordered above, mapped per caller contract
    unsafe { invalidate_raw(begin.cast_const().cast(), end.cast_const().cast()) }
}
