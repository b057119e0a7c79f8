// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Compression algorithm applied to blob payloads before they are
/// written to the file
///
/// Rows are never compressed; only blobs go through the codec.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub enum CompressionType {
    /// No compression
    None,

    /// LZ4 compression
    ///
    /// Recommended for use cases with a focus
    /// on speed over compression ratio.
    #[cfg(feature = "lz4")]
    Lz4,
}

impl CompressionType {
    pub(crate) fn compress(self, bytes: &[u8]) -> Vec<u8> {
        match self {
            Self::None => bytes.to_vec(),

            #[cfg(feature = "lz4")]
            Self::Lz4 => lz4_flex::compress_prepend_size(bytes),
        }
    }

    pub(crate) fn decompress(self, bytes: &[u8]) -> crate::Result<Vec<u8>> {
        match self {
            Self::None => Ok(bytes.to_vec()),

            #[cfg(feature = "lz4")]
            Self::Lz4 => lz4_flex::decompress_size_prepended(bytes)
                .map_err(|_| crate::Error::Decompress(self)),
        }
    }
}

impl Encode for CompressionType {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        match self {
            Self::None => writer.write_u8(0)?,

            #[cfg(feature = "lz4")]
            Self::Lz4 => writer.write_u8(1)?,
        }

        Ok(())
    }
}

impl Decode for CompressionType {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let tag = reader.read_u8()?;

        match tag {
            0 => Ok(Self::None),

            #[cfg(feature = "lz4")]
            1 => Ok(Self::Lz4),

            tag => Err(DecodeError::InvalidTag(("CompressionType", tag))),
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::None => "no compression",

                #[cfg(feature = "lz4")]
                Self::Lz4 => "lz4",
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn compression_none_roundtrip() -> crate::Result<()> {
        let payload = b"the quick brown fox".repeat(10);
        let compressed = CompressionType::None.compress(&payload);
        assert_eq!(payload, CompressionType::None.decompress(&compressed)?);
        Ok(())
    }

    #[cfg(feature = "lz4")]
    #[test]
    fn compression_lz4_roundtrip() -> crate::Result<()> {
        let payload = b"the quick brown fox".repeat(10);
        let compressed = CompressionType::Lz4.compress(&payload);
        assert!(compressed.len() < payload.len());
        assert_eq!(payload, CompressionType::Lz4.decompress(&compressed)?);
        Ok(())
    }

    #[test]
    fn compression_serde_roundtrip() -> Result<(), DecodeError> {
        let bytes = CompressionType::None.encode_into_vec();
        assert_eq!(
            CompressionType::None,
            CompressionType::decode_from(&mut &bytes[..])?,
        );
        Ok(())
    }
}
