// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::array::ElementType;
use crate::coding::{decode_string, encode_string, Decode, DecodeError, Encode, EncodeError};
use crate::{CompressionType, FieldType};
use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use std::io::{Read, Write};

pub(crate) const CATALOG_VERSION: u8 = 1;

/// Identifier shared by the header record and the blob tag byte;
/// the two never occupy the same position, so context disambiguates.
pub(crate) const HEADER_IDENTIFIER: i8 = 1;

/// First identifier handed to user-declared schemas (2 is unused).
pub(crate) const FIRST_USER_IDENTIFIER: i8 = 3;

#[derive(Clone, Debug)]
pub(crate) struct DatasetDef {
    pub name: String,
    pub identifier: i8,
    pub fields: Vec<(String, FieldType)>,
}

#[derive(Clone, Debug)]
pub(crate) struct ArrayDef {
    pub name: String,
    pub identifier: i8,
    pub elem: ElementType,
}

#[derive(Clone, Debug)]
pub(crate) struct GroupDef {
    pub name: String,
    pub identifier: i8,
    pub fields: Vec<(String, FieldType)>,

    /// Name of the dataset whose rows fill the block after the header
    pub entry: String,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum StructureKind {
    Layered,
    Chained,
}

/// Serialised configuration of a hash-table structure
///
/// Root handles live in header fields derived from the structure name,
/// so the configuration alone is enough to rebuild a structure around
/// a live file handle on reopen.
#[derive(Clone, Debug)]
pub(crate) struct StructureDef {
    pub kind: StructureKind,
    pub name: String,
    pub dataset: String,
    pub key_field: String,
    pub p_init: u32,
    pub growth_factor: u32,
    pub probe_factor: f64,
    pub bloom_filters: u32,
    pub bloom_seed: u64,
    pub cache_len: u64,
}

/// Everything needed to reconstruct the schemas and structures of a
/// file: written as `[u32 len][catalogue]` at offset 0 on build
#[derive(Clone, Debug, Default)]
pub(crate) struct Catalog {
    pub compression: Option<CompressionType>,

    /// The complete header schema, `_index` first
    pub header_fields: Vec<(String, FieldType)>,

    pub datasets: Vec<DatasetDef>,
    pub arrays: Vec<ArrayDef>,
    pub groups: Vec<GroupDef>,
    pub structures: Vec<StructureDef>,
}

fn encode_fields<W: Write>(
    writer: &mut W,
    fields: &[(String, FieldType)],
) -> Result<(), EncodeError> {
    #[allow(clippy::cast_possible_truncation)]
    writer.write_u16::<LE>(fields.len() as u16)?;
    for (name, ty) in fields {
        encode_string(writer, name)?;
        ty.encode_into(writer)?;
    }
    Ok(())
}

fn decode_fields<R: Read>(reader: &mut R) -> Result<Vec<(String, FieldType)>, DecodeError> {
    let len = reader.read_u16::<LE>()?;
    let mut fields = Vec::with_capacity(usize::from(len));
    for _ in 0..len {
        let name = decode_string(reader)?;
        let ty = FieldType::decode_from(reader)?;
        fields.push((name, ty));
    }
    Ok(fields)
}

impl Encode for Catalog {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u8(CATALOG_VERSION)?;

        self.compression
            .unwrap_or(CompressionType::None)
            .encode_into(writer)?;

        encode_fields(writer, &self.header_fields)?;

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<LE>(self.datasets.len() as u16)?;
        for def in &self.datasets {
            encode_string(writer, &def.name)?;
            writer.write_i8(def.identifier)?;
            encode_fields(writer, &def.fields)?;
        }

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<LE>(self.arrays.len() as u16)?;
        for def in &self.arrays {
            encode_string(writer, &def.name)?;
            writer.write_i8(def.identifier)?;
            def.elem.encode_into(writer)?;
        }

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<LE>(self.groups.len() as u16)?;
        for def in &self.groups {
            encode_string(writer, &def.name)?;
            writer.write_i8(def.identifier)?;
            encode_fields(writer, &def.fields)?;
            encode_string(writer, &def.entry)?;
        }

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<LE>(self.structures.len() as u16)?;
        for def in &self.structures {
            writer.write_u8(match def.kind {
                StructureKind::Layered => 1,
                StructureKind::Chained => 2,
            })?;
            encode_string(writer, &def.name)?;
            encode_string(writer, &def.dataset)?;
            encode_string(writer, &def.key_field)?;
            writer.write_u32::<LE>(def.p_init)?;
            writer.write_u32::<LE>(def.growth_factor)?;
            writer.write_f64::<LE>(def.probe_factor)?;
            writer.write_u32::<LE>(def.bloom_filters)?;
            writer.write_u64::<LE>(def.bloom_seed)?;
            writer.write_u64::<LE>(def.cache_len)?;
        }

        Ok(())
    }
}

impl Decode for Catalog {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let version = reader.read_u8()?;
        if version != CATALOG_VERSION {
            return Err(DecodeError::InvalidHeader("Catalog"));
        }

        let compression = CompressionType::decode_from(reader)?;
        let header_fields = decode_fields(reader)?;

        let len = reader.read_u16::<LE>()?;
        let mut datasets = Vec::with_capacity(usize::from(len));
        for _ in 0..len {
            datasets.push(DatasetDef {
                name: decode_string(reader)?,
                identifier: reader.read_i8()?,
                fields: decode_fields(reader)?,
            });
        }

        let len = reader.read_u16::<LE>()?;
        let mut arrays = Vec::with_capacity(usize::from(len));
        for _ in 0..len {
            arrays.push(ArrayDef {
                name: decode_string(reader)?,
                identifier: reader.read_i8()?,
                elem: ElementType::decode_from(reader)?,
            });
        }

        let len = reader.read_u16::<LE>()?;
        let mut groups = Vec::with_capacity(usize::from(len));
        for _ in 0..len {
            groups.push(GroupDef {
                name: decode_string(reader)?,
                identifier: reader.read_i8()?,
                fields: decode_fields(reader)?,
                entry: decode_string(reader)?,
            });
        }

        let len = reader.read_u16::<LE>()?;
        let mut structures = Vec::with_capacity(usize::from(len));
        for _ in 0..len {
            let kind = match reader.read_u8()? {
                1 => StructureKind::Layered,
                2 => StructureKind::Chained,
                tag => return Err(DecodeError::InvalidTag(("StructureKind", tag))),
            };
            structures.push(StructureDef {
                kind,
                name: decode_string(reader)?,
                dataset: decode_string(reader)?,
                key_field: decode_string(reader)?,
                p_init: reader.read_u32::<LE>()?,
                growth_factor: reader.read_u32::<LE>()?,
                probe_factor: reader.read_f64::<LE>()?,
                bloom_filters: reader.read_u32::<LE>()?,
                bloom_seed: reader.read_u64::<LE>()?,
                cache_len: reader.read_u64::<LE>()?,
            });
        }

        Ok(Self {
            compression: Some(compression),
            header_fields,
            datasets,
            arrays,
            groups,
            structures,
        })
    }
}
