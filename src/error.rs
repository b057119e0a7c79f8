// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{DecodeError, EncodeError},
    CompressionType,
};

/// Represents errors that can occur in the storage engine
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// Decompression failed
    Decompress(CompressionType),

    /// Key was not found, or a row is not live
    KeyNotFound,

    /// A dataset, array, group, structure or field with that name already exists
    SchemaExists(String),

    /// No schema is registered under that name
    UnknownSchema(String),

    /// The schema has no field with that name
    UnknownField(String),

    /// The value's type does not match the declared field type
    TypeMismatch(String),

    /// The status byte at a row does not belong to the addressed dataset
    SchemaMismatch {
        /// Identifier of the dataset used for the access
        expected: i8,

        /// Identifier actually found in the row prefix
        got: i8,
    },

    /// A structural limit was breached (layer cap, identifier space, ...)
    CapacityExceeded(&'static str),

    /// The database file has not been built yet
    NotBuilt,

    /// The database file has already been built
    AlreadyBuilt,

    /// Write access to a file opened in read-only mode
    ReadOnly,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InterlaceError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Database result
pub type Result<T> = std::result::Result<T, Error>;
