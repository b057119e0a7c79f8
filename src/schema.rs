// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::field::{decode_value, encode_value};
use crate::{FieldType, Record, Value};
use byteorder::{ByteOrder, LE};
use rustc_hash::FxHashMap;

/// Compiled placement of a single field inside a row
#[derive(Copy, Clone, Debug)]
pub(crate) struct FieldSpec {
    /// Byte offset inside the row, prefix included
    pub offset: usize,

    pub ty: FieldType,
}

/// A compiled record schema
///
/// Rows are `1 + Σ field widths` bytes: a one-byte status prefix holding
/// the schema identifier, followed by the fields in declared order.
/// Field lookups go through a precompiled name table instead of walking
/// the declaration on every access.
#[derive(Clone, Debug)]
pub(crate) struct Schema {
    name: String,
    identifier: i8,
    fields: Vec<(String, FieldType)>,
    table: FxHashMap<String, FieldSpec>,
    row_size: usize,
}

impl Schema {
    pub fn new(
        name: impl Into<String>,
        identifier: i8,
        fields: Vec<(String, FieldType)>,
    ) -> crate::Result<Self> {
        let mut table = FxHashMap::default();
        let mut offset = 1;

        for (field, ty) in &fields {
            if table
                .insert(field.clone(), FieldSpec { offset, ty: *ty })
                .is_some()
            {
                return Err(crate::Error::SchemaExists(field.clone()));
            }
            offset += ty.width();
        }

        Ok(Self {
            name: name.into(),
            identifier,
            fields,
            table,
            row_size: offset,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identifier(&self) -> i8 {
        self.identifier
    }

    /// Full row width in bytes, prefix included.
    pub fn row_size(&self) -> usize {
        self.row_size
    }

    pub fn spec(&self, field: &str) -> crate::Result<FieldSpec> {
        self.table
            .get(field)
            .copied()
            .ok_or_else(|| crate::Error::UnknownField(field.into()))
    }

    /// Encodes a full row, prefix included.
    ///
    /// Blob values are passed through `put_blob` and stored as `u32`
    /// handles; missing fields default to zero bytes.
    pub fn encode_row(
        &self,
        record: &Record,
        put_blob: &mut dyn FnMut(&[u8]) -> crate::Result<u32>,
    ) -> crate::Result<Vec<u8>> {
        // unknown fields are a defined error, not a silent miss
        for (field, _) in record.iter() {
            if !self.table.contains_key(field) {
                return Err(crate::Error::UnknownField(field.into()));
            }
        }

        let mut buf = vec![0; self.row_size];
        buf[0] = self.identifier.to_le_bytes()[0];

        for (field, ty) in &self.fields {
            let Some(value) = record.get(field) else {
                continue;
            };

            let spec = self.spec(field)?;
            let slot = &mut buf[spec.offset..spec.offset + ty.width()];

            if *ty == FieldType::Blob {
                let Value::Blob(payload) = value else {
                    return Err(crate::Error::TypeMismatch(field.clone()));
                };
                LE::write_u32(slot, put_blob(payload)?);
            } else {
                encode_value(*ty, value, slot)?;
            }
        }

        Ok(buf)
    }

    /// Decodes a full row buffer (prefix included) into a [`Record`].
    ///
    /// Blob handles are resolved through `get_blob`; handle `0` means
    /// the field is absent and is dropped from the record.
    pub fn decode_row(
        &self,
        buf: &[u8],
        get_blob: &mut dyn FnMut(u32) -> crate::Result<Vec<u8>>,
    ) -> crate::Result<Record> {
        debug_assert_eq!(self.row_size, buf.len());

        let mut record = Record::new();

        for (field, ty) in &self.fields {
            let spec = self.spec(field)?;
            let slot = &buf[spec.offset..spec.offset + ty.width()];

            if *ty == FieldType::Blob {
                let handle = LE::read_u32(slot);
                if handle != 0 {
                    record.insert(field.clone(), Value::Blob(get_blob(handle)?));
                }
            } else {
                record.insert(field.clone(), decode_value(*ty, slot));
            }
        }

        Ok(record)
    }
}
