//! Thin wrappers around the OS primitives the manager is built on:
//! page-size math, shared file mappings, file resize, and the advisory
//! whole-file lock.
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
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;

use crate::error::{Error, Result};

fn page_size_or_die() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if ret <= 0 {
        panic!(
            "Unable to find page size: {}",
            std::io::Error::last_os_error()
        );
    }

    ret as usize
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_or_die();
}

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Rounds `n` up to a multiple of the page size.
#[requires(n <= u64::MAX - page_size() as u64, "aligned size must be representable")]
#[ensures(ret % page_size() as u64 == 0, "aligned sizes are page multiples")]
#[ensures(ret >= n, "alignment never shrinks")]
pub fn map_align(n: u64) -> u64 {
    let page = page_size() as u64;

    (n + page - 1) / page * page
}

/// Maps `len` bytes of `file` starting at byte `offset`, read-write and
/// shared: peer processes mapping the same range observe our writes.
#[requires(offset % page_size() as u64 == 0, "mapping offsets are page-aligned")]
#[requires(len > 0, "empty mappings are never requested")]
pub fn map(file: &File, offset: u64, len: usize) -> Result<NonNull<c_void>> {
    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            offset as libc::off_t,
        )
    };

    if base == libc::MAP_FAILED {
        return Err(Error::Io {
            op: "mmap",
            source: std::io::Error::last_os_error(),
        });
    }

    NonNull::new(base).ok_or(Error::Io {
        op: "mmap",
        source: std::io::Error::from_raw_os_error(libc::EINVAL),
    })
}

/// Unmaps `len` bytes starting at `base`.
#[requires(len > 0, "empty mappings are never released")]
pub fn unmap(base: NonNull<c_void>, len: usize) -> Result<()> {
    let ret = unsafe { libc::munmap(base.as_ptr(), len) };

    if ret == 0 {
        Ok(())
    } else {
        Err(Error::Io {
            op: "munmap",
            source: std::io::Error::last_os_error(),
        })
    }
}

/// Flushes `len` mapped bytes starting at `base` to the backing file,
/// blocking until the writeback completes.
#[requires(len > 0, "empty ranges are never synced")]
pub fn sync(base: NonNull<c_void>, len: usize) -> Result<()> {
    let ret = unsafe { libc::msync(base.as_ptr(), len, libc::MS_SYNC) };

    if ret == 0 {
        Ok(())
    } else {
        Err(Error::Io {
            op: "msync",
            source: std::io::Error::last_os_error(),
        })
    }
}

/// Grows or shrinks `file` to exactly `new_len` bytes.
pub fn resize(file: &File, new_len: u64) -> Result<()> {
    file.set_len(new_len).map_err(|e| Error::Io {
        op: "ftruncate",
        source: e,
    })
}

/// Returns the current on-disk size of `file`.
pub fn file_size(file: &File) -> Result<u64> {
    Ok(file
        .metadata()
        .map_err(|e| Error::Io {
            op: "fstat",
            source: e,
        })?
        .len())
}

/// Whole-file advisory exclusive lock, released when the guard drops.
///
/// The lock serializes file growth between peer processes; it is the
/// only advisory lock this crate ever takes on the file.
pub struct FileLockGuard<'a> {
    file: &'a File,
}

/// Blocks until the advisory exclusive lock on `file` is ours.
pub fn lock_exclusive(file: &File) -> Result<FileLockGuard> {
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };

    if ret != 0 {
        return Err(Error::Io {
            op: "flock",
            source: std::io::Error::last_os_error(),
        });
    }

    Ok(FileLockGuard { file })
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        let ret = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };

        if ret != 0 {
            log::debug!(
                "failed to release advisory file lock: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[test]
fn test_page_size() {
    let page = page_size();

    assert_ne!(page, 0);
    assert!(page.is_power_of_two());
}

#[test]
fn test_map_align() {
    let page = page_size() as u64;

    assert_eq!(map_align(0), 0);
    assert_eq!(map_align(1), page);
    assert_eq!(map_align(page), page);
    assert_eq!(map_align(page + 1), 2 * page);
    assert_eq!(map_align(3 * page - 1), 3 * page);
}

// Map a freshly-grown file, write through the mapping, and read the
// bytes back through the file handle.
#[test]
fn smoke_test_map() {
    use std::io::Read;
    use std::io::Seek;
    use std::io::SeekFrom;

    let page = page_size();
    let mut file = tempfile::tempfile().expect("tempfile should build");

    resize(&file, 2 * page as u64).expect("resize should succeed");
    assert_eq!(file_size(&file).expect("size should succeed"), 2 * page as u64);

    let base = map(&file, 0, 2 * page).expect("map should succeed");

    unsafe {
        std::ptr::write_bytes(base.as_ptr() as *mut u8, 42, page);
    }
    sync(base, page).expect("sync should succeed");

    let mut buf = vec![0u8; page];
    file.seek(SeekFrom::Start(0)).expect("seek should succeed");
    file.read_exact(&mut buf).expect("read should succeed");
    assert!(buf.iter().all(|&b| b == 42));

    unmap(base, 2 * page).expect("unmap should succeed");
}

#[test]
fn smoke_test_lock() {
    let file = tempfile::tempfile().expect("tempfile should build");

    // Re-acquiring after a drop must not deadlock: the guard released
    // the lock on its way out.
    let guard = lock_exclusive(&file).expect("lock should succeed");
    drop(guard);

    let guard = lock_exclusive(&file).expect("relock should succeed");
    drop(guard);
}
