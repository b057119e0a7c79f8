// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::database::Core;
use crate::file::STEP_SIZE;
use crate::schema::Schema;
use crate::{Record, RowStatus, Value};
use std::sync::Arc;

pub(crate) struct Inner {
    schema: Schema,
    core: Arc<Core>,
}

/// A typed record region
///
/// Rows of one schema are laid out contiguously in blocks allocated by
/// [`Dataset::new_block`]. Every row starts with a one-byte status
/// prefix: the dataset identifier (live), its negation (deleted), or
/// zero (never written).
///
/// Handles are cheap to clone and reference the same underlying file.
#[derive(Clone)]
pub struct Dataset(Arc<Inner>);

impl Dataset {
    pub(crate) fn new(schema: Schema, core: Arc<Core>) -> Self {
        Self(Arc::new(Inner { schema, core }))
    }

    /// Name of this dataset.
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.schema.name()
    }

    /// Width of one row in bytes, status prefix included.
    #[must_use]
    pub fn row_size(&self) -> u64 {
        self.0.schema.row_size() as u64
    }

    pub(crate) fn identifier(&self) -> i8 {
        self.0.schema.identifier()
    }

    pub(crate) fn schema(&self) -> &Schema {
        &self.0.schema
    }

    fn core(&self) -> &Core {
        &self.0.core
    }

    fn row_offset(&self, block: u64, row: u64) -> u64 {
        block + row * self.row_size()
    }

    /// Allocates a block of `n` rows, returning its byte offset.
    ///
    /// No prefix is written; every slot reads as status
    /// [`RowStatus::Empty`] until its first write.
    pub fn new_block(&self, n: u64) -> crate::Result<u64> {
        self.core().file.allocate(n * self.row_size())
    }

    /// Writes a whole row.
    ///
    /// Missing fields default per type; blob values are appended to the
    /// blob region and stored as handles. The row becomes live.
    pub fn set(&self, block: u64, row: u64, record: &Record) -> crate::Result<()> {
        let core = self.core();
        let buf = self
            .0
            .schema
            .encode_row(record, &mut |payload| core.put_blob(payload))?;
        core.file.write_at(self.row_offset(block, row), &buf)
    }

    /// Reads a whole row.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::KeyNotFound`] if the row is not live.
    pub fn get(&self, block: u64, row: u64) -> crate::Result<Record> {
        let core = self.core();
        let buf = core
            .file
            .read_at(self.row_offset(block, row), self.0.schema.row_size())?;

        if buf[0] as i8 != self.identifier() {
            return Err(crate::Error::KeyNotFound);
        }

        self.0
            .schema
            .decode_row(&buf, &mut |handle| core.get_blob(u64::from(handle)))
    }

    /// Writes a single field without touching the status prefix.
    pub fn set_value(
        &self,
        block: u64,
        row: u64,
        field: &str,
        value: impl Into<Value>,
    ) -> crate::Result<()> {
        let spec = self.0.schema.spec(field)?;
        self.core()
            .write_field(self.row_offset(block, row), spec, &value.into())
    }

    /// Reads a single field without checking the status prefix.
    ///
    /// Blob fields are resolved to their payload; an absent blob
    /// surfaces as [`crate::Error::KeyNotFound`].
    pub fn get_value(&self, block: u64, row: u64, field: &str) -> crate::Result<Value> {
        let spec = self.0.schema.spec(field)?;
        self.core().read_field(self.row_offset(block, row), spec)
    }

    /// Reads the raw fixed-width bytes of a field.
    pub(crate) fn read_field_raw(
        &self,
        block: u64,
        row: u64,
        field: &str,
    ) -> crate::Result<Vec<u8>> {
        let spec = self.0.schema.spec(field)?;
        self.core()
            .file
            .read_at(self.row_offset(block, row) + spec.offset as u64, spec.ty.width())
    }

    /// Tombstones a live row.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::KeyNotFound`] if the row is not live.
    pub fn delete(&self, block: u64, row: u64) -> crate::Result<()> {
        let offset = self.row_offset(block, row);
        let prefix = self.core().file.read_at(offset, 1)?;

        if prefix[0] as i8 != self.identifier() {
            return Err(crate::Error::KeyNotFound);
        }

        self.core()
            .file
            .write_at(offset, &self.identifier().wrapping_neg().to_le_bytes())
    }

    /// Returns `true` iff the row is live.
    pub fn exists(&self, block: u64, row: u64) -> crate::Result<bool> {
        let prefix = self.core().file.read_at(self.row_offset(block, row), 1)?;
        Ok(prefix[0] as i8 == self.identifier())
    }

    /// Classifies the status prefix of a row.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::SchemaMismatch`] if the prefix belongs
    /// to a different schema.
    pub fn status(&self, block: u64, row: u64) -> crate::Result<RowStatus> {
        let prefix = self.core().file.read_at(self.row_offset(block, row), 1)?;
        let got = prefix[0] as i8;
        let id = self.identifier();

        if got == 0 {
            Ok(RowStatus::Empty)
        } else if got == id {
            Ok(RowStatus::Live)
        } else if got == id.wrapping_neg() {
            Ok(RowStatus::Deleted)
        } else {
            Err(crate::Error::SchemaMismatch {
                expected: id,
                got,
            })
        }
    }

    /// Appends a single row at the allocation cursor, outside any
    /// preallocated block, returning its byte offset.
    pub fn append(&self, record: &Record) -> crate::Result<u64> {
        let core = self.core();
        let buf = self
            .0
            .schema
            .encode_row(record, &mut |payload| core.put_blob(payload))?;
        core.file.append(&buf)
    }

    /// Reads `n` consecutive rows in one pass.
    ///
    /// Slots that are not live yield `None`.
    pub fn read_rows(
        &self,
        block: u64,
        start: u64,
        n: usize,
    ) -> crate::Result<Vec<Option<Record>>> {
        let core = self.core();
        let row_size = self.0.schema.row_size();
        let buf = core
            .file
            .read_at(self.row_offset(block, start), n * row_size)?;

        let mut rows = Vec::with_capacity(n);
        for chunk in buf.chunks_exact(row_size) {
            if chunk[0] as i8 == self.identifier() {
                let record = self
                    .0
                    .schema
                    .decode_row(chunk, &mut |handle| core.get_blob(u64::from(handle)))?;
                rows.push(Some(record));
            } else {
                rows.push(None);
            }
        }

        Ok(rows)
    }

    /// Scans the whole appended region for live rows of this dataset.
    ///
    /// The scan walks the file from `table_start` to the allocation
    /// cursor, skipping zero runs, blobs and rows of other datasets.
    /// It is only meaningful for files whose appended region consists
    /// of records and blobs; raw array blocks would derail the walk.
    pub fn scan(&self) -> crate::Result<Scan> {
        let layout = self.core().layout()?;

        Ok(Scan {
            dataset: self.clone(),
            offset: layout.table_start,
            end: self.core().file.cursor()?,
            done: false,
        })
    }
}

/// Iterator over all live rows of one dataset, in file order
///
/// Returned by [`Dataset::scan`].
pub struct Scan {
    dataset: Dataset,
    offset: u64,
    end: u64,
    done: bool,
}

impl Iterator for Scan {
    type Item = crate::Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let dataset = self.dataset.clone();
        let core = dataset.core();
        let target = dataset.identifier();

        loop {
            if self.offset >= self.end {
                self.done = true;
                return None;
            }

            let prefix = fail_iter!(core.file.read_at(self.offset, 1));
            let id = prefix[0] as i8;

            if id == 0 {
                // skip the zero run in one chunked read
                let chunk_len = STEP_SIZE.min(self.end - self.offset) as usize;
                let chunk = fail_iter!(core.file.read_at(self.offset, chunk_len));

                match chunk.iter().position(|&b| b != 0) {
                    Some(pos) => self.offset += pos as u64,
                    None => self.offset += chunk_len as u64,
                }
                continue;
            }

            if id == crate::catalog::HEADER_IDENTIFIER {
                // blob: tag, u32 length, payload
                let head = fail_iter!(core.file.read_at(self.offset + 1, 4));
                #[allow(clippy::expect_used)]
                let len = u32::from_le_bytes(head.try_into().expect("is 4 bytes"));
                self.offset += 5 + u64::from(len);
                continue;
            }

            let live_id = if id < 0 { id.wrapping_neg() } else { id };
            let Some(row_size) = core
                .layout()
                .ok()
                .and_then(|layout| layout.row_sizes.get(&live_id).copied())
            else {
                self.done = true;
                return Some(Err(crate::Error::Decode(
                    crate::coding::DecodeError::InvalidHeader("Scan"),
                )));
            };

            if id == target {
                let buf = fail_iter!(core.file.read_at(self.offset, row_size as usize));
                let record = fail_iter!(dataset
                    .schema()
                    .decode_row(&buf, &mut |handle| core.get_blob(u64::from(handle))));
                self.offset += row_size;
                return Some(Ok(record));
            }

            self.offset += row_size;
        }
    }
}
