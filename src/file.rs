// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

/// Minimum file growth (in bytes) of the append path
///
/// Appends that run out of slack extend the file by at least this much,
/// so repeated small appends do not truncate the file once per row.
pub(crate) const STEP_SIZE: u64 = 10_000;

struct FileInner {
    file: File,

    /// Physical file length, tracked to avoid stat calls
    len: u64,

    /// Allocation cursor, mirrored into the header's `_index` field
    cursor: u64,

    /// Byte offset of the header's `_index` field, once the file is built
    index_slot: Option<u64>,

    /// Open transaction depth; writes only flush at depth 0
    tx_depth: u32,
}

impl FileInner {
    fn write_raw(&mut self, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)
    }

    fn extend_raw(&mut self, n: u64) -> std::io::Result<()> {
        self.len += n;
        self.file.set_len(self.len)
    }

    /// Bumps the allocation cursor and mirrors it into the header.
    fn set_cursor(&mut self, cursor: u64) -> std::io::Result<()> {
        self.cursor = cursor;
        if let Some(slot) = self.index_slot {
            self.file.seek(SeekFrom::Start(slot))?;
            self.file.write_all(&cursor.to_le_bytes())?;
        }
        Ok(())
    }

    fn maybe_sync(&mut self) -> std::io::Result<()> {
        if self.tx_depth == 0 {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

/// Owns the backing file and hands out raw positional reads and writes
///
/// All positions are absolute byte offsets. Growth is truncation-based;
/// the appended region beyond the allocation cursor reads as zeroes.
pub(crate) struct FileIo {
    inner: Mutex<FileInner>,
    read_only: bool,
}

impl FileIo {
    pub fn create(path: &Path) -> crate::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            inner: Mutex::new(FileInner {
                file,
                len: 0,
                cursor: 0,
                index_slot: None,
                tx_depth: 0,
            }),
            read_only: false,
        })
    }

    pub fn open(path: &Path, read_only: bool) -> crate::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;

        let len = file.metadata()?.len();

        Ok(Self {
            inner: Mutex::new(FileInner {
                file,
                len,
                cursor: 0,
                index_slot: None,
                tx_depth: 0,
            }),
            read_only,
        })
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, FileInner> {
        self.inner.lock().expect("lock is poisoned")
    }

    pub fn read_at(&self, offset: u64, len: usize) -> crate::Result<Vec<u8>> {
        let mut inner = self.lock();
        let mut buf = vec![0; len];
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> crate::Result<()> {
        if self.read_only {
            return Err(crate::Error::ReadOnly);
        }

        let mut inner = self.lock();
        inner.write_raw(offset, bytes)?;
        inner.maybe_sync()?;
        Ok(())
    }

    /// Extends the file without moving the allocation cursor.
    ///
    /// Only the build path uses this, for the catalogue and header
    /// region that live below `table_start`.
    pub fn extend(&self, n: u64) -> crate::Result<()> {
        if self.read_only {
            return Err(crate::Error::ReadOnly);
        }

        self.lock().extend_raw(n)?;
        Ok(())
    }

    /// Binds the allocation cursor, and the header slot it mirrors into.
    pub fn bind_cursor(&self, cursor: u64, index_slot: Option<u64>) {
        let mut inner = self.lock();
        inner.cursor = cursor;
        inner.index_slot = index_slot;
    }

    pub fn cursor(&self) -> crate::Result<u64> {
        let inner = self.lock();
        if inner.index_slot.is_none() {
            return Err(crate::Error::NotBuilt);
        }
        Ok(inner.cursor)
    }

    pub fn len(&self) -> u64 {
        self.lock().len
    }

    /// Extends the file by exactly `n` bytes and returns the previous
    /// allocation cursor, which now addresses an all-zero block.
    pub fn allocate(&self, n: u64) -> crate::Result<u64> {
        if self.read_only {
            return Err(crate::Error::ReadOnly);
        }

        let mut inner = self.lock();
        if inner.index_slot.is_none() {
            return Err(crate::Error::NotBuilt);
        }

        inner.extend_raw(n)?;
        let offset = inner.cursor;
        inner.set_cursor(offset + n)?;
        inner.maybe_sync()?;
        Ok(offset)
    }

    /// Writes `bytes` at the allocation cursor, growing the file by at
    /// least [`STEP_SIZE`] when it runs out of slack.
    pub fn append(&self, bytes: &[u8]) -> crate::Result<u64> {
        if self.read_only {
            return Err(crate::Error::ReadOnly);
        }

        let mut inner = self.lock();
        if inner.index_slot.is_none() {
            return Err(crate::Error::NotBuilt);
        }

        let n = bytes.len() as u64;
        let slack = inner.len.saturating_sub(inner.cursor);
        if slack < n {
            inner.extend_raw(STEP_SIZE.max(n))?;
        }

        let offset = inner.cursor;
        inner.write_raw(offset, bytes)?;
        inner.set_cursor(offset + n)?;
        inner.maybe_sync()?;
        Ok(offset)
    }

    /// Suppresses per-write flushing until the matching
    /// [`FileIo::end_transaction`].
    pub fn begin_transaction(&self) {
        self.lock().tx_depth += 1;
    }

    /// Leaves the transaction, flushing once at the outermost level.
    pub fn end_transaction(&self) -> crate::Result<()> {
        let mut inner = self.lock();
        inner.tx_depth = inner.tx_depth.saturating_sub(1);
        if inner.tx_depth == 0 && !self.read_only {
            inner.file.sync_data()?;
        }
        Ok(())
    }

    pub fn sync(&self) -> crate::Result<()> {
        if !self.read_only {
            self.lock().file.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn file_allocate_bumps_cursor() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let io = FileIo::create(&dir.path().join("test.db"))?;

        io.extend(16)?;
        io.bind_cursor(8, Some(0));

        assert_eq!(8, io.allocate(4)?);
        assert_eq!(12, io.allocate(4)?);
        assert_eq!(16, io.cursor()?);
        assert_eq!(24, io.len());

        // cursor is mirrored into the bound slot
        let slot = io.read_at(0, 8)?;
        assert_eq!(16, u64::from_le_bytes(slot.try_into().expect("is 8 bytes")));

        Ok(())
    }

    #[test]
    fn file_allocate_requires_binding() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let io = FileIo::create(&dir.path().join("test.db"))?;

        assert!(matches!(io.allocate(4), Err(crate::Error::NotBuilt)));

        Ok(())
    }

    #[test]
    fn file_append_grows_by_step() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let io = FileIo::create(&dir.path().join("test.db"))?;

        io.extend(8)?;
        io.bind_cursor(8, Some(0));

        assert_eq!(8, io.append(b"abc")?);
        assert_eq!(8 + STEP_SIZE, io.len());
        assert_eq!(b"abc".to_vec(), io.read_at(8, 3)?);

        // slack is reused without another extension
        assert_eq!(11, io.append(b"defg")?);
        assert_eq!(8 + STEP_SIZE, io.len());

        Ok(())
    }

    #[test]
    fn file_blocks_read_as_zero() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let io = FileIo::create(&dir.path().join("test.db"))?;

        io.extend(8)?;
        io.bind_cursor(8, Some(0));

        let block = io.allocate(64)?;
        assert_eq!(vec![0; 64], io.read_at(block, 64)?);

        Ok(())
    }

    #[test]
    fn file_read_only_rejects_writes() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("test.db");

        {
            let io = FileIo::create(&path)?;
            io.extend(8)?;
        }

        let io = FileIo::open(&path, true)?;
        assert!(matches!(io.write_at(0, b"x"), Err(crate::Error::ReadOnly)));
        assert!(matches!(io.extend(1), Err(crate::Error::ReadOnly)));

        Ok(())
    }

    #[test]
    fn file_transactions_nest() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let io = FileIo::create(&dir.path().join("test.db"))?;
        io.extend(8)?;

        io.begin_transaction();
        io.begin_transaction();
        io.write_at(0, b"payload!")?;
        io.end_transaction()?;
        io.end_transaction()?;

        // unbalanced end is tolerated
        io.end_transaction()?;

        assert_eq!(b"payload!".to_vec(), io.read_at(0, 8)?);
        Ok(())
    }
}
