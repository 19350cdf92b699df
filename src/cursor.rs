//! Bounded cursor views over a `ChunkStore`: sequential read/write
//! access at an absolute file position, through the chunk's mapping.
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

use std::io;
use std::sync::Arc;

use crate::chunk::ChunkStore;
use crate::error::Error;
use crate::error::Result;

/// A cursor into one chunk's mapping, bounded by an absolute limit.
///
/// Read cursors limit at the end of the mapping, overlap included, so
/// records straddling the chunk boundary read contiguously.  Write
/// cursors limit at the chunk's safe capacity: running into it signals
/// "roll to the next chunk".
///
/// A cursor holds exactly one reservation on its store, released when
/// the cursor drops.
pub struct Cursor {
    store: Arc<ChunkStore>,
    position: u64,
    limit: u64,
}

impl Cursor {
    /// Read view over a caller-provided store, positioned at the
    /// absolute `position`.  Takes its own reservation.
    pub fn bind_for_read(store: &Arc<ChunkStore>, position: u64) -> Result<Cursor> {
        let limit = store.start() + store.mapped_size() as u64;

        Self::bind(store, position, limit)
    }

    /// Write view over a caller-provided store, positioned at the
    /// absolute `position` and limited at the safe capacity.
    pub fn bind_for_write(store: &Arc<ChunkStore>, position: u64) -> Result<Cursor> {
        let limit = store.start() + store.capacity() as u64;

        Self::bind(store, position, limit)
    }

    fn bind(store: &Arc<ChunkStore>, position: u64, limit: u64) -> Result<Cursor> {
        if position < store.start() || position > limit {
            return Err(Error::InvalidArgument("position outside the chunk's window"));
        }

        store.reserve()?;
        Ok(Cursor {
            store: Arc::clone(store),
            position,
            limit,
        })
    }

    /// Adopts the reservation handed out by the manager's acquire path
    /// when there is one, and takes a fresh one otherwise.
    pub(crate) fn from_acquired(
        store: Arc<ChunkStore>,
        reserved: bool,
        position: u64,
        write: bool,
    ) -> Result<Cursor> {
        let limit = if write {
            store.start() + store.capacity() as u64
        } else {
            store.start() + store.mapped_size() as u64
        };

        if position < store.start() || position > limit {
            if reserved {
                let _ = store.release();
            }

            return Err(Error::InvalidArgument("position outside the chunk's window"));
        }

        if !reserved {
            store.reserve()?;
        }

        Ok(Cursor {
            store,
            position,
            limit,
        })
    }

    /// The store this cursor reads and writes through.
    #[inline]
    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    /// Absolute file position of the next byte.
    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Absolute position past which this cursor will not go.
    #[inline]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Bytes left before the limit.
    #[inline]
    pub fn remaining(&self) -> u64 {
        self.limit - self.position
    }

    /// Copies up to `buf.len()` bytes at the cursor, advancing it.
    /// Returns how many bytes were copied, truncated at the limit.
    #[ensures(self.position() <= self.limit(), "the cursor never passes its limit")]
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> usize {
        let len = (buf.len() as u64).min(self.remaining()) as usize;

        if len == 0 {
            return 0;
        }

        let offset = (self.position - self.store.start()) as usize;
        buf[..len].copy_from_slice(unsafe { self.store.bytes(offset, len) });
        self.position += len as u64;

        len
    }

    /// Copies all of `buf` at the cursor, advancing it.  Fails without
    /// writing anything when `buf` does not fit below the limit.
    #[ensures(self.position() <= self.limit(), "the cursor never passes its limit")]
    pub fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        if buf.len() as u64 > self.remaining() {
            return Err(Error::InvalidArgument("write would pass the chunk's limit"));
        }

        if buf.is_empty() {
            return Ok(());
        }

        let offset = (self.position - self.store.start()) as usize;
        unsafe { self.store.bytes_mut(offset, buf.len()) }.copy_from_slice(buf);
        self.position += buf.len() as u64;

        Ok(())
    }
}

impl io::Read for Cursor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_bytes(buf))
    }
}

impl io::Write for Cursor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = (buf.len() as u64).min(self.remaining()) as usize;

        if len == 0 && !buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "chunk write limit reached",
            ));
        }

        self.write_bytes(&buf[..len])
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.store
            .sync()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        // Fails only when the manager already drained the store at
        // shutdown on our behalf.
        if let Err(e) = self.store.release() {
            log::debug!("cursor release at {} failed: {}", self.position, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapped_file::MappedFile;

    const CHUNK: u64 = 64 * 1024;
    const OVERLAP: u64 = 4 * 1024;

    fn open_temp() -> (tempfile::TempDir, Arc<MappedFile>) {
        let dir = tempfile::tempdir().expect("tempdir should build");
        let mapped =
            MappedFile::open(dir.path().join("t.dat"), CHUNK, OVERLAP).expect("open should succeed");

        (dir, mapped)
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_dir, mapped) = open_temp();

        let mut writer = mapped
            .acquire_cursor_for_write(1000)
            .expect("acquire should succeed");
        writer.write_bytes(b"here be dragons").expect("write should succeed");
        drop(writer);

        let mut reader = mapped
            .acquire_cursor_for_read(1000)
            .expect("acquire should succeed");
        let mut buf = [0u8; 15];
        assert_eq!(reader.read_bytes(&mut buf), 15);
        assert_eq!(&buf, b"here be dragons");
    }

    #[test]
    fn cursor_holds_one_reservation() {
        let (_dir, mapped) = open_temp();

        let cursor = mapped
            .acquire_cursor_for_write(0)
            .expect("acquire should succeed");
        let store = Arc::clone(cursor.store());

        // One for the cache, one for the cursor.
        assert_eq!(store.ref_count(), 2);
        drop(cursor);
        assert_eq!(store.ref_count(), 1);
    }

    #[test]
    fn limits_follow_the_cursor_flavor() {
        let (_dir, mapped) = open_temp();

        let reader = mapped
            .acquire_cursor_for_read(10)
            .expect("acquire should succeed");
        let writer = mapped
            .acquire_cursor_for_write(10)
            .expect("acquire should succeed");

        assert_eq!(
            reader.limit(),
            mapped.chunk_size() + mapped.overlap_size()
        );
        assert_eq!(
            writer.limit(),
            mapped.chunk_size() + mapped.overlap_size() / 2
        );
    }

    #[test]
    fn writes_stop_at_the_safe_capacity() {
        let (_dir, mapped) = open_temp();

        let mut writer = mapped
            .acquire_cursor_for_write(0)
            .expect("acquire should succeed");
        let room = writer.remaining() as usize;

        assert!(matches!(
            writer.write_bytes(&vec![0u8; room + 1]),
            Err(Error::InvalidArgument(_))
        ));

        // The failed write moved nothing.
        assert_eq!(writer.position(), 0);
        writer.write_bytes(&vec![7u8; room]).expect("write should succeed");
        assert_eq!(writer.remaining(), 0);
    }

    #[test]
    fn reads_truncate_at_the_mapping_end() {
        let (_dir, mapped) = open_temp();

        let store = mapped.acquire_byte_store(0).expect("acquire should succeed");
        let end = store.start() + store.mapped_size() as u64;
        let mut reader = Cursor::bind_for_read(&store, end - 4).expect("bind should succeed");

        let mut buf = [0u8; 16];
        assert_eq!(reader.read_bytes(&mut buf), 4);
        assert_eq!(reader.remaining(), 0);
        assert_eq!(reader.read_bytes(&mut buf), 0);
    }

    // Records written across the chunk boundary are readable both
    // through the lower chunk's overlap and from the upper chunk.
    #[test]
    fn boundary_straddle_reads_both_ways() {
        let (_dir, mapped) = open_temp();

        let boundary = mapped.chunk_size() as i64;
        let mut writer = mapped
            .acquire_cursor_for_write(boundary - 8)
            .expect("acquire should succeed");

        assert_eq!(writer.store().start(), 0);
        writer.write_bytes(b"0123456789abcdef").expect("write should succeed");
        drop(writer);

        // Through the lower chunk's overlap window.
        let mut lower = mapped
            .acquire_cursor_for_read(boundary - 8)
            .expect("acquire should succeed");
        assert_eq!(lower.store().start(), 0);

        let mut seen = [0u8; 16];
        assert_eq!(lower.read_bytes(&mut seen), 16);
        assert_eq!(&seen, b"0123456789abcdef");

        // From the upper chunk's own window.
        let mut upper = mapped
            .acquire_cursor_for_read(boundary)
            .expect("acquire should succeed");
        assert_eq!(upper.store().start(), mapped.chunk_size());

        let mut tail = [0u8; 8];
        assert_eq!(upper.read_bytes(&mut tail), 8);
        assert_eq!(&tail, b"89abcdef");
    }

    #[test]
    fn bind_variants_take_their_own_reservation() {
        let (_dir, mapped) = open_temp();

        let store = mapped.acquire_byte_store(0).expect("acquire should succeed");
        assert_eq!(store.ref_count(), 1);

        let mut writer =
            Cursor::bind_for_write(&store, 32).expect("bind should succeed");
        assert_eq!(store.ref_count(), 2);

        writer.write_bytes(b"bound").expect("write should succeed");
        drop(writer);
        assert_eq!(store.ref_count(), 1);

        let mut reader = Cursor::bind_for_read(&store, 32).expect("bind should succeed");
        let mut buf = [0u8; 5];
        assert_eq!(reader.read_bytes(&mut buf), 5);
        assert_eq!(&buf, b"bound");
    }

    #[test]
    fn bind_outside_the_window_is_rejected() {
        let (_dir, mapped) = open_temp();

        let store = mapped.acquire_byte_store(0).expect("acquire should succeed");
        let past_end = store.start() + store.mapped_size() as u64 + 1;

        assert!(matches!(
            Cursor::bind_for_read(&store, past_end),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(store.ref_count(), 1);
    }

    #[test]
    fn io_traits_round_trip() {
        use std::io::Read;
        use std::io::Write;

        let (_dir, mapped) = open_temp();

        let mut writer = mapped
            .acquire_cursor_for_write(512)
            .expect("acquire should succeed");
        writer.write_all(b"via std::io").expect("write_all should succeed");
        writer.flush().expect("flush should succeed");
        drop(writer);

        let mut reader = mapped
            .acquire_cursor_for_read(512)
            .expect("acquire should succeed");
        let mut buf = [0u8; 11];
        reader.read_exact(&mut buf).expect("read_exact should succeed");
        assert_eq!(&buf, b"via std::io");
    }

    proptest::proptest! {
        // Anything written inside a chunk's write window reads back
        // identically through a fresh cursor.
        #[test]
        fn random_round_trips(
            offset in 0u64..1024,
            data in proptest::collection::vec(proptest::prelude::any::<u8>(), 1..256),
        ) {
            let (_dir, mapped) = open_temp();

            let mut writer = mapped
                .acquire_cursor_for_write(offset as i64)
                .expect("acquire should succeed");
            writer.write_bytes(&data).expect("write should succeed");
            drop(writer);

            let mut reader = mapped
                .acquire_cursor_for_read(offset as i64)
                .expect("acquire should succeed");
            let mut buf = vec![0u8; data.len()];
            proptest::prop_assert_eq!(reader.read_bytes(&mut buf), data.len());
            proptest::prop_assert_eq!(buf, data);
        }
    }
}
