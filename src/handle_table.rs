//! Lookup of opaque module handles by address-sized key.
//!
//! The [`AssociationTable`] is owned by whoever loads modules; this module
//! only ever borrows it immutably to answer a lookup. Keys are usually the
//! load address of a module but are not interpreted here.

use core::ffi::c_void;
use core::fmt;
use core::ptr::NonNull;
use hashbrown::HashMap;
use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

/// An opaque, non-null pointer stored in an [`AssociationTable`].
///
/// The pointee is never read or written by this crate, the value is passed
/// through unchanged.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ModuleHandle(NonNull<c_void>);

// Safety: the handle is never dereferenced, it behaves like an integer token.
unsafe impl Send for ModuleHandle {}
// Safety: see above
unsafe impl Sync for ModuleHandle {}

impl ModuleHandle {
    /// Wrap a raw pointer, returning `None` if it is null.
    #[inline]
    pub fn new(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// Wrap a reference to anything as a handle.
    #[inline]
    pub fn from_ref<T>(r: &T) -> Self {
        Self(NonNull::from(r).cast())
    }

    #[inline]
    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ModuleHandle").field(&self.0.as_ptr()).finish()
    }
}

/// Mapping from an address-sized key to an opaque [`ModuleHandle`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AssociationTable {
    entries: HashMap<usize, ModuleHandle>,
}

impl AssociationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
        }
    }

    /// Associates `handle` with `key`, returning the handle previously stored under `key`.
    pub fn insert(&mut self, key: usize, handle: ModuleHandle) -> Option<ModuleHandle> {
        self.entries.insert(key, handle)
    }

    pub fn remove(&mut self, key: usize) -> Option<ModuleHandle> {
        self.entries.remove(&key)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn contains_key(&self, key: usize) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, ModuleHandle)> + '_ {
        self.entries.iter().map(|(k, v)| (*k, *v))
    }

    /// Exact-match lookup of `key`, see [`resolve`].
    #[inline]
    pub fn resolve(&self, key: usize) -> Option<ModuleHandle> {
        resolve(self, key)
    }
}

impl FromIterator<(usize, ModuleHandle)> for AssociationTable {
    fn from_iter<I: IntoIterator<Item = (usize, ModuleHandle)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl Extend<(usize, ModuleHandle)> for AssociationTable {
    fn extend<I: IntoIterator<Item = (usize, ModuleHandle)>>(&mut self, iter: I) {
        self.entries.extend(iter);
    }
}

/// Returns the handle associated with `key` in `table`, or `None` if there is none.
///
/// A miss is a normal outcome and nothing is inserted. The table is only
/// borrowed for the duration of the call, so callers sharing it across
/// threads must keep writers out while looking up (e.g. through
/// [`SharedAssociationTable`] or an immutable snapshot).
#[inline]
pub fn resolve(table: &AssociationTable, key: usize) -> Option<ModuleHandle> {
    let handle = table.entries.get(&key).copied();

    tracing::trace!(key, hit = handle.is_some(), "resolve module handle");

    handle
}

/// An [`AssociationTable`] behind a reader-writer lock, for callers that
/// populate the table while other threads are resolving from it.
#[derive(Debug, Clone, Default)]
pub struct SharedAssociationTable(Arc<RwLock<AssociationTable>>);

impl SharedAssociationTable {
    pub fn new(table: AssociationTable) -> Self {
        Self(Arc::new(RwLock::new(table)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, AssociationTable> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, AssociationTable> {
        self.0.write()
    }

    pub fn resolve(&self, key: usize) -> Option<ModuleHandle> {
        resolve(&self.read(), key)
    }

    pub fn insert(&self, key: usize, handle: ModuleHandle) -> Option<ModuleHandle> {
        self.write().insert(key, handle)
    }

    pub fn remove(&self, key: usize) -> Option<ModuleHandle> {
        self.write().remove(key)
    }

    /// Clone the current contents so lookups can proceed without holding the lock.
    pub fn snapshot(&self) -> AssociationTable {
        self.read().clone()
    }
}
