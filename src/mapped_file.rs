//! A `MappedFile` presents a sparse file as an on-demand set of
//! fixed-size read-write mappings, each extended by a trailing overlap
//! window so records straddling a chunk boundary stay contiguous.
//!
//! The manager owns the file handle, grows the file under an advisory
//! whole-file lock shared with peer processes, caches live mappings in
//! a weak table, and hands out reference-counted `ChunkStore` handles.
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
use std::fmt::Write as _;
use std::fs::File;
use std::fs::OpenOptions;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::time::Instant;

use crate::chunk::ChunkStore;
use crate::cursor::Cursor;
use crate::error::Error;
use crate::error::Result;
use crate::map;
use crate::refcount::RefCount;

// The chunk table is indexed with `usize` and mapped lengths are
// `usize` too; the default capacity below assumes both are 64 bits.
static_assertions::const_assert!(std::mem::size_of::<usize>() >= 8);

/// Default logical capacity: a sparse terabyte-scale upper bound that
/// callers bound their positions against.
pub const DEFAULT_CAPACITY: u64 = 1 << 40;

/// Size parameters past this are certainly bugs; rejecting them keeps
/// the page-alignment arithmetic overflow-free.
const MAX_SIZE_PARAMETER: u64 = 1 << 62;

/// Observability hook fired when a chunk is first materialized.
///
/// Implementations must not panic; a panic is caught, logged, and
/// otherwise ignored so it cannot corrupt the manager.
pub trait NewChunkListener: Send + Sync {
    fn on_new_chunk(&self, path: &Path, chunk_index: u64, elapsed_micros: u64);
}

/// Materializations slower than this are worth surfacing.
const SLOW_CHUNK_MICROS: u64 = 1_000;

/// The stock listener: slow chunk materializations log at debug level,
/// the rest at trace.
struct LoggingListener;

impl NewChunkListener for LoggingListener {
    fn on_new_chunk(&self, path: &Path, chunk_index: u64, elapsed_micros: u64) {
        if elapsed_micros >= SLOW_CHUNK_MICROS {
            log::debug!(
                "allocated chunk {} of {} in {} us",
                chunk_index,
                path.display(),
                elapsed_micros
            );
        } else {
            log::trace!(
                "allocated chunk {} of {} in {} us",
                chunk_index,
                path.display(),
                elapsed_micros
            );
        }
    }
}

struct State {
    // Dropped in `perform_release`, `None` afterwards.  Shared with any
    // sibling manager created by `with_sizes`, so the descriptor closes
    // when the last sibling lets go.
    file: Option<Arc<File>>,

    // Sparse table indexed by chunk number.  A dead `Weak` is treated
    // as an empty slot and replaced in place.
    chunks: Vec<Option<Weak<ChunkStore>>>,
}

/// The chunked mapped-file manager.  See the crate docs for the model.
///
/// The manager is itself reference-counted: `release` drops the
/// caller's reservation, and the last one tears down the chunk cache
/// and the file handle.  All operations are thread-safe.
pub struct MappedFile {
    path: PathBuf,
    chunk_size: u64,
    overlap_size: u64,
    capacity: u64,
    // Handle to our own Arc, so stores can carry an owning back-pointer
    // to the manager.  Child-to-parent edges only; the chunk table
    // below holds `Weak`s, so there is no cycle.
    self_ref: Weak<MappedFile>,
    refs: RefCount,
    closed: AtomicBool,
    listener: Mutex<Arc<dyn NewChunkListener>>,
    state: Mutex<State>,
}

impl MappedFile {
    /// Opens `path` read-write, creating it if absent, with the default
    /// logical capacity.  `chunk_size` and `overlap_size` are rounded
    /// up to page multiples.
    pub fn open<P: AsRef<Path>>(
        path: P,
        chunk_size: u64,
        overlap_size: u64,
    ) -> Result<Arc<MappedFile>> {
        Self::open_with_capacity(path, chunk_size, overlap_size, DEFAULT_CAPACITY)
    }

    /// Like `open`, with one page of overlap.
    pub fn open_with_default_overlap<P: AsRef<Path>>(
        path: P,
        chunk_size: u64,
    ) -> Result<Arc<MappedFile>> {
        Self::open(path, chunk_size, map::page_size() as u64)
    }

    #[ensures(ret.is_ok() ->
              ret.as_ref().unwrap().chunk_size() % map::page_size() as u64 == 0,
              "the effective chunk size is a page multiple")]
    #[ensures(ret.is_ok() ->
              ret.as_ref().unwrap().overlap_size() % map::page_size() as u64 == 0,
              "the effective overlap size is a page multiple")]
    pub fn open_with_capacity<P: AsRef<Path>>(
        path: P,
        chunk_size: u64,
        overlap_size: u64,
        capacity: u64,
    ) -> Result<Arc<MappedFile>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())
            .map_err(|e| Error::Io {
                op: "open",
                source: e,
            })?;

        Self::from_handle(
            path.as_ref().to_path_buf(),
            Arc::new(file),
            chunk_size,
            overlap_size,
            capacity,
        )
    }

    fn from_handle(
        path: PathBuf,
        file: Arc<File>,
        chunk_size: u64,
        overlap_size: u64,
        capacity: u64,
    ) -> Result<Arc<MappedFile>> {
        if chunk_size == 0 {
            return Err(Error::InvalidArgument("chunk size must be positive"));
        }

        if chunk_size > MAX_SIZE_PARAMETER || overlap_size > MAX_SIZE_PARAMETER {
            return Err(Error::InvalidArgument("size parameter too large"));
        }

        let chunk_size = map::map_align(chunk_size);
        let overlap_size = map::map_align(overlap_size);

        Ok(Arc::new_cyclic(|self_ref| MappedFile {
            path,
            chunk_size,
            overlap_size,
            capacity,
            self_ref: self_ref.clone(),
            refs: RefCount::new(),
            closed: AtomicBool::new(false),
            listener: Mutex::new(Arc::new(LoggingListener)),
            state: Mutex::new(State {
                file: Some(file),
                chunks: Vec::new(),
            }),
        }))
    }

    fn arc(&self) -> Arc<MappedFile> {
        // Managers only ever live behind the `Arc` built above.
        self.self_ref.upgrade().expect("manager must be alive")
    }

    /// Returns a manager with the requested sizes over the same file.
    ///
    /// Matching sizes (after alignment) return `self`.  Differing sizes
    /// return a *new* manager with an independent chunk table sharing
    /// the same file handle, and release the caller's reservation on
    /// the old one; the two must not have their byte-store handles
    /// mixed, since their mappings have different extents.
    pub fn with_sizes(&self, chunk_size: u64, overlap_size: u64) -> Result<Arc<MappedFile>> {
        if chunk_size == 0 {
            return Err(Error::InvalidArgument("chunk size must be positive"));
        }

        if chunk_size > MAX_SIZE_PARAMETER || overlap_size > MAX_SIZE_PARAMETER {
            return Err(Error::InvalidArgument("size parameter too large"));
        }

        let chunk_size = map::map_align(chunk_size);
        let overlap_size = map::map_align(overlap_size);

        if chunk_size == self.chunk_size && overlap_size == self.overlap_size {
            return Ok(self.arc());
        }

        let built = self.shared_handle().and_then(|file| {
            Self::from_handle(
                self.path.clone(),
                file,
                chunk_size,
                overlap_size,
                self.capacity,
            )
        });

        // The caller trades its reservation on the old manager for the
        // new one, even when construction fails.
        let released = self.release();

        match built {
            Ok(mapped) => released.map(|_| mapped),
            Err(e) => Err(e),
        }
    }

    fn shared_handle(&self) -> Result<Arc<File>> {
        let state = self.state.lock().unwrap();

        match state.file.as_ref() {
            Some(file) => Ok(Arc::clone(file)),
            None => Err(Error::Closed),
        }
    }

    /// The path this manager was opened with.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Effective (page-aligned) chunk size.
    #[inline]
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Effective (page-aligned) overlap size.
    #[inline]
    pub fn overlap_size(&self) -> u64 {
        self.overlap_size
    }

    /// Logical capacity callers bound their positions against; the
    /// manager itself never checks positions against it.
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Current on-disk size of the backing file.
    pub fn actual_size(&self) -> Result<u64> {
        map::file_size(&*self.shared_handle()?)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn ref_count(&self) -> u64 {
        self.refs.count()
    }

    pub fn reserve(&self) -> Result<()> {
        self.refs.reserve()
    }

    /// Drops one reservation on the manager; the last one releases the
    /// cached chunks and the file handle.
    pub fn release(&self) -> Result<()> {
        if self.refs.release()? {
            self.perform_release();
        }

        Ok(())
    }

    fn perform_release(&self) {
        let mut state = self.state.lock().unwrap();

        for slot in state.chunks.iter_mut() {
            let store = match slot.as_ref().and_then(Weak::upgrade) {
                Some(store) => store,
                None => {
                    *slot = None;
                    continue;
                }
            };

            // Drop the cache's reservation.  A consumer still holding
            // the store keeps it mapped and clears the slot on its own
            // release; teardown errors have nowhere to go but the log.
            match store.release() {
                Ok(()) => {
                    if store.ref_count() == 0 {
                        *slot = None;
                    }
                }
                Err(e) => {
                    log::debug!("releasing cached chunk at {} failed: {}", store.start(), e)
                }
            }
        }

        // Close errors are swallowed here as well: the descriptor goes
        // away when the last sibling manager lets go of it.
        state.file = None;
    }

    /// Idempotent shutdown: drains every cached chunk on behalf of any
    /// remaining consumers (their stale handles observe failures on the
    /// next reservation op), then drops the manager's own reservation.
    pub fn close(&self) -> Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        {
            let mut state = self.state.lock().unwrap();

            for slot in state.chunks.iter_mut() {
                if let Some(store) = slot.take().as_ref().and_then(Weak::upgrade) {
                    drain_store(&store);
                }
            }
        }

        self.release()
    }

    /// Returns the byte-store covering `position`, materializing the
    /// chunk and growing the file first when needed.
    ///
    /// A store served from the cache carries one extra reservation
    /// owned by the caller, who must `release()` it exactly once; a
    /// freshly materialized store holds only the cache's reservation
    /// and consumers take their own with `reserve()`.
    pub fn acquire_byte_store(&self, position: i64) -> Result<Arc<ChunkStore>> {
        self.acquire_byte_store_with(position, ChunkStore::new)
    }

    /// Like `acquire_byte_store`, with a caller-supplied store factory
    /// so per-chunk state can be attached on materialization.  The
    /// factory must return a live, count-1 store.
    pub fn acquire_byte_store_with<F>(&self, position: i64, factory: F) -> Result<Arc<ChunkStore>>
    where
        F: FnOnce(Arc<MappedFile>, u64, NonNull<c_void>, usize, usize) -> Arc<ChunkStore>,
    {
        Ok(self.acquire_store(position, factory)?.0)
    }

    /// Cursor positioned at `position` for reading; it may read through
    /// the overlap to the end of the chunk's mapping.
    pub fn acquire_cursor_for_read(&self, position: i64) -> Result<Cursor> {
        let (store, reserved) = self.acquire_store(position, ChunkStore::new)?;

        Cursor::from_acquired(store, reserved, position as u64, false)
    }

    /// Cursor positioned at `position` for writing, limited at the
    /// chunk's safe capacity: running into the limit signals "roll to
    /// the next chunk".
    pub fn acquire_cursor_for_write(&self, position: i64) -> Result<Cursor> {
        let (store, reserved) = self.acquire_store(position, ChunkStore::new)?;

        Cursor::from_acquired(store, reserved, position as u64, true)
    }

    /// Returns the store and whether the caller received its own
    /// reservation (cache hits do, fresh stores do not).
    fn acquire_store<F>(&self, position: i64, factory: F) -> Result<(Arc<ChunkStore>, bool)>
    where
        F: FnOnce(Arc<MappedFile>, u64, NonNull<c_void>, usize, usize) -> Arc<ChunkStore>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        if position < 0 {
            return Err(Error::InvalidArgument("position must be non-negative"));
        }

        let chunk = position as u64 / self.chunk_size;
        let index = chunk as usize;

        let mut state = self.state.lock().unwrap();

        if state.chunks.len() <= index {
            state.chunks.resize(index + 1, None);
        }

        if let Some(store) = state.chunks[index].as_ref().and_then(Weak::upgrade) {
            if store.try_reserve() {
                return Ok((store, true));
            }
        }

        // Cache miss, or a store already drained to zero: materialize
        // the chunk, growing the file first if it is too short.
        let begin = Instant::now();

        let start = chunk
            .checked_mul(self.chunk_size)
            .ok_or(Error::InvalidArgument("position beyond the mappable range"))?;
        let min_size = start
            .checked_add(self.chunk_size)
            .and_then(|n| n.checked_add(self.overlap_size))
            .ok_or(Error::InvalidArgument("position beyond the mappable range"))?;

        let file = match state.file.as_ref() {
            Some(file) => Arc::clone(file),
            None => return Err(Error::Closed),
        };

        if map::file_size(&file)? < min_size {
            // Peer processes race us on growth; only the re-read under
            // the exclusive lock decides who resizes.
            let lock = map::lock_exclusive(&file)?;

            if map::file_size(&file)? < min_size {
                map::resize(&file, min_size).map_err(|e| Error::ResizeFailed {
                    target: min_size,
                    source: Box::new(e),
                })?;
            }

            drop(lock);
        }

        let mapped_size = (self.chunk_size + self.overlap_size) as usize;
        let safe_capacity = (self.chunk_size + self.overlap_size / 2) as usize;
        let address = map::map(&file, start, mapped_size)?;

        let store = factory(self.arc(), start, address, mapped_size, safe_capacity);
        debug_assert_eq!(store.ref_count(), 1, "factories produce count-1 stores");

        // The cache's own reservation keeps the count above zero while
        // the weak entry is published.
        store.reserve()?;
        state.chunks[index] = Some(Arc::downgrade(&store));

        self.fire_listener(chunk, begin.elapsed().as_micros() as u64);

        // Hand the creation reservation back: a fresh store holds
        // exactly the cache's count until a consumer reserves it.
        store.release()?;

        Ok((store, false))
    }

    fn fire_listener(&self, chunk_index: u64, elapsed_micros: u64) {
        let listener = Arc::clone(&*self.listener.lock().unwrap());

        // A panicking listener is a bug in the hook, not a reason to
        // tear down the manager.
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            listener.on_new_chunk(&self.path, chunk_index, elapsed_micros)
        }));

        if outcome.is_err() {
            log::error!(
                "chunk listener panicked for chunk {} of {}",
                chunk_index,
                self.path.display()
            );
        }
    }

    pub fn set_new_chunk_listener(&self, listener: Arc<dyn NewChunkListener>) {
        *self.listener.lock().unwrap() = listener;
    }

    pub fn new_chunk_listener(&self) -> Arc<dyn NewChunkListener> {
        Arc::clone(&*self.listener.lock().unwrap())
    }

    /// Human-readable snapshot: the manager's count, then the count of
    /// every cached chunk (dead or empty slots read 0).
    pub fn reference_counts(&self) -> String {
        let state = self.state.lock().unwrap();
        let mut out = format!("refs: {}; chunks: [", self.refs.count());

        for (i, slot) in state.chunks.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }

            let count = slot
                .as_ref()
                .and_then(Weak::upgrade)
                .map(|store| store.ref_count())
                .unwrap_or(0);
            let _ = write!(out, "{}", count);
        }

        out.push(']');
        out
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("path", &self.path)
            .field("chunk_size", &self.chunk_size)
            .field("overlap_size", &self.overlap_size)
            .field("capacity", &self.capacity)
            .field("refs", &self.refs)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Best-effort shutdown of one store: every outstanding reservation is
/// dropped on its holder's behalf, unmapping the region.
fn drain_store(store: &Arc<ChunkStore>) {
    while store.ref_count() > 0 {
        if let Err(e) = store.release() {
            log::debug!("draining chunk at {} failed: {}", store.start(), e);
            break;
        }
    }
}
