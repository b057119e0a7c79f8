// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::database::Core;
use crate::schema::Schema;
use crate::{Dataset, Record, RowStatus, Value};
use std::sync::Arc;

struct Inner {
    schema: Schema,
    entry: Dataset,
    core: Arc<Core>,
}

/// A block whose prefix is a single group-header record, followed by a
/// homogeneous array of entry rows
///
/// The header record carries the group's own identifier and fields;
/// entry rows obey the usual record-region status discipline of the
/// entry dataset. Chained hash tables use groups to stash per-table
/// metadata inline with the table itself.
#[derive(Clone)]
pub struct Group(Arc<Inner>);

impl Group {
    pub(crate) fn new(schema: Schema, entry: Dataset, core: Arc<Core>) -> Self {
        Self(Arc::new(Inner {
            schema,
            entry,
            core,
        }))
    }

    /// Name of this group schema.
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.schema.name()
    }

    /// The dataset whose rows fill the block after the header.
    #[must_use]
    pub fn entry(&self) -> &Dataset {
        &self.0.entry
    }

    pub(crate) fn identifier(&self) -> i8 {
        self.0.schema.identifier()
    }

    /// Width of the group header record in bytes.
    pub(crate) fn header_size(&self) -> u64 {
        self.0.schema.row_size() as u64
    }

    /// Start of the entry rows inside a block.
    fn entry_base(&self, block: u64) -> u64 {
        block + self.header_size()
    }

    /// Allocates a block of `n` entry slots, returning its byte offset.
    ///
    /// The group identifier is written into the first byte, making the
    /// header record live with all fields zeroed.
    pub fn new_block(&self, n: u64) -> crate::Result<u64> {
        let size = self.header_size() + n * self.0.entry.row_size();
        let block = self.0.core.file.allocate(size)?;
        self.0
            .core
            .file
            .write_at(block, &self.identifier().to_le_bytes())?;
        Ok(block)
    }

    /// Reads a group-header field.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::KeyNotFound`] if `block` does not
    /// address a live group header.
    pub fn header_get(&self, block: u64, field: &str) -> crate::Result<Value> {
        let prefix = self.0.core.file.read_at(block, 1)?;
        if prefix[0] as i8 != self.identifier() {
            return Err(crate::Error::KeyNotFound);
        }

        let spec = self.0.schema.spec(field)?;
        self.0.core.read_field(block, spec)
    }

    /// Writes a group-header field.
    pub fn header_set(&self, block: u64, field: &str, value: impl Into<Value>) -> crate::Result<()> {
        let spec = self.0.schema.spec(field)?;
        self.0.core.write_field(block, spec, &value.into())
    }

    /// Writes a whole entry row.
    pub fn set(&self, block: u64, index: u64, record: &Record) -> crate::Result<()> {
        self.0.entry.set(self.entry_base(block), index, record)
    }

    /// Reads a whole entry row; see [`Dataset::get`].
    pub fn get(&self, block: u64, index: u64) -> crate::Result<Record> {
        self.0.entry.get(self.entry_base(block), index)
    }

    /// Writes a single entry field; see [`Dataset::set_value`].
    pub fn set_value(
        &self,
        block: u64,
        index: u64,
        field: &str,
        value: impl Into<Value>,
    ) -> crate::Result<()> {
        self.0
            .entry
            .set_value(self.entry_base(block), index, field, value)
    }

    /// Reads a single entry field; see [`Dataset::get_value`].
    pub fn get_value(&self, block: u64, index: u64, field: &str) -> crate::Result<Value> {
        self.0.entry.get_value(self.entry_base(block), index, field)
    }

    /// Classifies an entry slot; see [`Dataset::status`].
    pub fn status(&self, block: u64, index: u64) -> crate::Result<RowStatus> {
        self.0.entry.status(self.entry_base(block), index)
    }

    /// Returns `true` iff the entry slot is live.
    pub fn exists(&self, block: u64, index: u64) -> crate::Result<bool> {
        self.0.entry.exists(self.entry_base(block), index)
    }

    /// Tombstones a live entry row; see [`Dataset::delete`].
    pub fn delete(&self, block: u64, index: u64) -> crate::Result<()> {
        self.0.entry.delete(self.entry_base(block), index)
    }

    pub(crate) fn read_entry_field_raw(
        &self,
        block: u64,
        index: u64,
        field: &str,
    ) -> crate::Result<Vec<u8>> {
        self.0
            .entry
            .read_field_raw(self.entry_base(block), index, field)
    }
}
