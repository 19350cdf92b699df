//! A `ChunkStore` is a reference-counted handle to one live mapping of
//! a fixed-size chunk (plus its trailing overlap) of the backing file.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::ffi::c_void;
use std::ptr::NonNull;
use std::slice;
use std::sync::Arc;

use crate::error::Result;
use crate::map;
use crate::mapped_file::MappedFile;
use crate::refcount::RefCount;

/// One mapped region of the file: `[start, start + mapped_size)`.
///
/// Kept alive by the union of the manager's cache reservation and any
/// consumer reservations; the last `release` unmaps the region.  A
/// store is immutable except for its count, so shared references may
/// roam freely across threads.
pub struct ChunkStore {
    mapped_file: Arc<MappedFile>,
    start: u64,
    address: NonNull<c_void>,
    mapped_size: usize,
    safe_capacity: usize,
    refs: RefCount,
}

// The region is shared memory and the count is atomic.
unsafe impl Send for ChunkStore {}
unsafe impl Sync for ChunkStore {}

impl ChunkStore {
    /// Wraps a freshly-mapped region in a count-1 store.  This is the
    /// stock factory for `MappedFile::acquire_byte_store_with`; custom
    /// factories usually delegate here after recording their own
    /// per-chunk state.
    pub fn new(
        mapped_file: Arc<MappedFile>,
        start: u64,
        address: NonNull<c_void>,
        mapped_size: usize,
        safe_capacity: usize,
    ) -> Arc<ChunkStore> {
        Arc::new(ChunkStore {
            mapped_file,
            start,
            address,
            mapped_size,
            safe_capacity,
            refs: RefCount::new(),
        })
    }

    /// Advisory write limit: bytes past this offset belong to the next
    /// chunk's write window and should be written through that chunk.
    #[ensures(ret <= self.mapped_size(), "the write window stays inside the mapping")]
    #[inline]
    pub fn capacity(&self) -> usize {
        self.safe_capacity
    }

    /// Absolute file offset of the first mapped byte.
    #[inline]
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Base virtual address of the mapping.
    #[inline]
    pub fn address(&self) -> NonNull<c_void> {
        self.address
    }

    /// Full mapped length, overlap included.
    #[inline]
    pub fn mapped_size(&self) -> usize {
        self.mapped_size
    }

    /// The manager this store was acquired from.
    #[inline]
    pub fn mapped_file(&self) -> &Arc<MappedFile> {
        &self.mapped_file
    }

    pub fn reserve(&self) -> Result<()> {
        self.refs.reserve()
    }

    pub fn try_reserve(&self) -> bool {
        self.refs.try_reserve()
    }

    pub fn ref_count(&self) -> u64 {
        self.refs.count()
    }

    /// Drops one reservation; the last one unmaps the region.  Any
    /// access through the store after that is a bug, and the manager
    /// never hands the instance out again.
    pub fn release(&self) -> Result<()> {
        if self.refs.release()? {
            map::unmap(self.address, self.mapped_size)?;
        }

        Ok(())
    }

    /// Flushes the mapped pages to the backing file.
    pub fn sync(&self) -> Result<()> {
        map::sync(self.address, self.mapped_size)
    }

    /// Bytes `[offset, offset + len)` of the mapping.
    ///
    /// # Safety
    ///
    /// The caller must hold a reservation for the slice's lifetime and
    /// must not let reads race writes to the same bytes.
    pub(crate) unsafe fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        assert!(
            offset.checked_add(len).map_or(false, |end| end <= self.mapped_size),
            "slice [{}, {}+{}) escapes the mapping of {} bytes",
            offset,
            offset,
            len,
            self.mapped_size
        );

        slice::from_raw_parts((self.address.as_ptr() as *const u8).add(offset), len)
    }

    /// Mutable bytes `[offset, offset + len)` of the mapping.
    ///
    /// # Safety
    ///
    /// Same as `bytes`, and the range must not alias any other live
    /// slice of this store.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn bytes_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        assert!(
            offset.checked_add(len).map_or(false, |end| end <= self.mapped_size),
            "slice [{}, {}+{}) escapes the mapping of {} bytes",
            offset,
            offset,
            len,
            self.mapped_size
        );

        slice::from_raw_parts_mut((self.address.as_ptr() as *mut u8).add(offset), len)
    }
}

impl Drop for ChunkStore {
    fn drop(&mut self) {
        // Dropping the last handle with reservations outstanding means
        // some caller leaked a `release`.  Nothing can reach the region
        // anymore, so reclaim the address space instead of leaking it.
        if self.refs.count() != 0 {
            log::debug!(
                "chunk at offset {} dropped with {} live reservations",
                self.start,
                self.refs.count()
            );

            if let Err(e) = map::unmap(self.address, self.mapped_size) {
                log::debug!("reclaiming leaked chunk at {} failed: {}", self.start, e);
            }
        }
    }
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore")
            .field("start", &self.start)
            .field("mapped_size", &self.mapped_size)
            .field("safe_capacity", &self.safe_capacity)
            .field("refs", &self.refs)
            .finish()
    }
}
