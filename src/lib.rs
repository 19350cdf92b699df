//! Quarry presents a sparse file as an on-demand set of fixed-size
//! memory-mapped chunks, each extended by a trailing overlap window so
//! that records straddling a chunk boundary can be read and written
//! contiguously, without stitching.
//!
//! The [`MappedFile`] manager owns the file handle, grows the file
//! under an advisory lock shared with peer processes mapping the same
//! file, caches live mappings, and hands out reference-counted
//! [`ChunkStore`] handles.  [`Cursor`]s are bounded read/write views
//! over one store at an absolute file position.
//!
//! ```no_run
//! use quarry::MappedFile;
//!
//! # fn main() -> quarry::Result<()> {
//! let mapped = MappedFile::open("queue.dat", 64 * 1024, 4 * 1024)?;
//!
//! let mut writer = mapped.acquire_cursor_for_write(0)?;
//! writer.write_bytes(b"hello")?;
//! drop(writer);
//!
//! let mut reader = mapped.acquire_cursor_for_read(0)?;
//! let mut buf = [0u8; 5];
//! reader.read_bytes(&mut buf);
//! # Ok(())
//! # }
//! ```
//!
//! The file itself stays a plain sparse file: no header, no metadata,
//! positions map one-to-one to file offsets, so any tool can read it.
mod chunk;
mod cursor;
mod error;
mod map;
mod mapped_file;
mod refcount;

pub use chunk::ChunkStore;
pub use cursor::Cursor;
pub use error::Error;
pub use error::Result;
pub use map::page_size;
pub use mapped_file::MappedFile;
pub use mapped_file::NewChunkListener;
pub use mapped_file::DEFAULT_CAPACITY;
