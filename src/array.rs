// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::database::Core;
use byteorder::{ByteOrder, ReadBytesExt, WriteBytesExt, LE};
use std::io::{Read, Write};
use std::sync::Arc;

/// Element type of a typed array
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ElementType {
    /// One byte per element, `0x00` or `0x01`
    Bool,

    /// Signed 8-bit integer
    I8,

    /// Signed 16-bit integer
    I16,

    /// Signed 32-bit integer
    I32,

    /// Signed 64-bit integer
    I64,

    /// Unsigned 8-bit integer
    U8,

    /// Unsigned 16-bit integer
    U16,

    /// Unsigned 32-bit integer
    U32,

    /// Unsigned 64-bit integer
    U64,

    /// Single-precision float
    F32,

    /// Double-precision float
    F64,
}

impl ElementType {
    /// Returns the element width in bytes.
    #[must_use]
    pub const fn width(self) -> usize {
        match self {
            Self::Bool | Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }
}

impl Encode for ElementType {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u8(match self {
            Self::Bool => 0,
            Self::I8 => 1,
            Self::I16 => 2,
            Self::I32 => 3,
            Self::I64 => 4,
            Self::U8 => 5,
            Self::U16 => 6,
            Self::U32 => 7,
            Self::U64 => 8,
            Self::F32 => 9,
            Self::F64 => 10,
        })?;
        Ok(())
    }
}

impl Decode for ElementType {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        match reader.read_u8()? {
            0 => Ok(Self::Bool),
            1 => Ok(Self::I8),
            2 => Ok(Self::I16),
            3 => Ok(Self::I32),
            4 => Ok(Self::I64),
            5 => Ok(Self::U8),
            6 => Ok(Self::U16),
            7 => Ok(Self::U32),
            8 => Ok(Self::U64),
            9 => Ok(Self::F32),
            10 => Ok(Self::F64),
            tag => Err(DecodeError::InvalidTag(("ElementType", tag))),
        }
    }
}

/// A primitive that can live in a typed [`Array`]
pub trait Element: Copy {
    /// Element type tag matching this primitive.
    const TYPE: ElementType;

    #[doc(hidden)]
    fn write_to(self, buf: &mut [u8]);

    #[doc(hidden)]
    fn read_from(buf: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($t:ty => $variant:ident, $write:ident, $read:ident);+ $(;)?) => {
        $(
            impl Element for $t {
                const TYPE: ElementType = ElementType::$variant;

                fn write_to(self, buf: &mut [u8]) {
                    LE::$write(buf, self);
                }

                fn read_from(buf: &[u8]) -> Self {
                    LE::$read(buf)
                }
            }
        )+
    };
}

impl_element!(
    i16 => I16, write_i16, read_i16;
    i32 => I32, write_i32, read_i32;
    i64 => I64, write_i64, read_i64;
    u16 => U16, write_u16, read_u16;
    u32 => U32, write_u32, read_u32;
    u64 => U64, write_u64, read_u64;
    f32 => F32, write_f32, read_f32;
    f64 => F64, write_f64, read_f64;
);

impl Element for u8 {
    const TYPE: ElementType = ElementType::U8;

    fn write_to(self, buf: &mut [u8]) {
        buf[0] = self;
    }

    fn read_from(buf: &[u8]) -> Self {
        buf[0]
    }
}

impl Element for i8 {
    const TYPE: ElementType = ElementType::I8;

    fn write_to(self, buf: &mut [u8]) {
        buf[0] = self.to_le_bytes()[0];
    }

    fn read_from(buf: &[u8]) -> Self {
        buf[0] as Self
    }
}

impl Element for bool {
    const TYPE: ElementType = ElementType::Bool;

    fn write_to(self, buf: &mut [u8]) {
        buf[0] = u8::from(self);
    }

    fn read_from(buf: &[u8]) -> Self {
        buf[0] != 0
    }
}

struct Inner {
    name: String,
    identifier: i8,
    elem: ElementType,
    core: Arc<Core>,
}

/// A typed homogeneous array region
///
/// A block is `1 + n · width` bytes: a one-byte identifier prefix,
/// then `n` elements addressed by `(block_offset, index)`.
#[derive(Clone)]
pub struct Array(Arc<Inner>);

impl Array {
    pub(crate) fn new(name: String, identifier: i8, elem: ElementType, core: Arc<Core>) -> Self {
        Self(Arc::new(Inner {
            name,
            identifier,
            elem,
            core,
        }))
    }

    /// Name of this array schema.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Element type of this array schema.
    #[must_use]
    pub fn element_type(&self) -> ElementType {
        self.0.elem
    }

    fn check<T: Element>(&self) -> crate::Result<()> {
        if T::TYPE == self.0.elem {
            Ok(())
        } else {
            Err(crate::Error::TypeMismatch(self.0.name.clone()))
        }
    }

    fn slot(&self, block: u64, index: u64) -> u64 {
        block + 1 + index * self.0.elem.width() as u64
    }

    /// Allocates a block of `n` elements, returning its byte offset.
    ///
    /// Elements start out zeroed.
    pub fn new_block(&self, n: u64) -> crate::Result<u64> {
        let width = self.0.elem.width() as u64;
        let block = self.0.core.file.allocate(1 + n * width)?;
        self.0
            .core
            .file
            .write_at(block, &self.0.identifier.to_le_bytes())?;
        Ok(block)
    }

    /// Writes one element.
    pub fn set<T: Element>(&self, block: u64, index: u64, value: T) -> crate::Result<()> {
        self.check::<T>()?;
        let mut buf = vec![0; self.0.elem.width()];
        value.write_to(&mut buf);
        self.0.core.file.write_at(self.slot(block, index), &buf)
    }

    /// Reads one element.
    pub fn get<T: Element>(&self, block: u64, index: u64) -> crate::Result<T> {
        self.check::<T>()?;
        let buf = self
            .0
            .core
            .file
            .read_at(self.slot(block, index), self.0.elem.width())?;
        Ok(T::read_from(&buf))
    }

    /// Reads a contiguous range of `n` elements starting at `start`.
    pub fn slice<T: Element>(&self, block: u64, start: u64, n: usize) -> crate::Result<Vec<T>> {
        self.check::<T>()?;
        let width = self.0.elem.width();
        let buf = self
            .0
            .core
            .file
            .read_at(self.slot(block, start), n * width)?;
        Ok(buf.chunks_exact(width).map(T::read_from).collect())
    }
}

#[cfg(test)]
mod tests {
    use crate::{Config, ElementType};
    use test_log::test;

    #[test]
    fn array_element_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = Config::new(dir.path().join("test.db")).create()?;
        let arr = db.create_array("positions", ElementType::U64)?;
        db.build()?;

        let block = arr.new_block(32)?;
        arr.set::<u64>(block, 0, 123)?;
        arr.set::<u64>(block, 31, u64::MAX)?;

        assert_eq!(123, arr.get::<u64>(block, 0)?);
        assert_eq!(0, arr.get::<u64>(block, 1)?);
        assert_eq!(u64::MAX, arr.get::<u64>(block, 31)?);

        let slice = arr.slice::<u64>(block, 0, 32)?;
        assert_eq!(32, slice.len());
        assert_eq!(123, slice[0]);
        assert_eq!(u64::MAX, slice[31]);

        Ok(())
    }

    #[test]
    fn array_bool_specialisation() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = Config::new(dir.path().join("test.db")).create()?;
        let arr = db.create_array("filter", ElementType::Bool)?;
        db.build()?;

        let block = arr.new_block(100)?;
        arr.set::<bool>(block, 3, true)?;

        assert!(arr.get::<bool>(block, 3)?);
        assert!(!arr.get::<bool>(block, 4)?);

        let slice = arr.slice::<bool>(block, 0, 10)?;
        assert_eq!(1, slice.iter().filter(|set| **set).count());

        Ok(())
    }

    #[test]
    fn array_type_check() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = Config::new(dir.path().join("test.db")).create()?;
        let arr = db.create_array("positions", ElementType::U64)?;
        db.build()?;

        let block = arr.new_block(4)?;
        assert!(matches!(
            arr.set::<u32>(block, 0, 1),
            Err(crate::Error::TypeMismatch(_)),
        ));

        Ok(())
    }
}
