// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An embedded, file-backed store of typed records, blobs and hash
//! tables, optimised for write-once, read-many workloads such as
//! inverted indexes and adjacency lists.
//!
//! A single file holds fixed-width typed rows (*datasets*), raw typed
//! arrays, group blocks and length-prefixed blobs, all addressed by
//! byte offset. On top of the record regions sit two hash table
//! structures:
//!
//! - [`LayerTable`] — an open-addressed map that grows by doubling,
//!   with per-layer bloom filters for cheap negative lookups
//! - [`ChainedTable`] — a per-key multi-map, each key owning a chain
//!   of geometrically growing blocks
//!
//! The engine is single-process and single-writer; transactions only
//! coalesce flushes and carry no atomicity guarantee on crash.
//!
//! # Example usage
//!
//! ```
//! use interlace::{record, Config, FieldType, LayerTableOptions};
//! #
//! # let dir = tempfile::tempdir()?;
//!
//! let mut db = Config::new(dir.path().join("index.db")).create()?;
//!
//! // declare schemas and structures, then build the file
//! let word = db.create_dataset(
//!     "word",
//!     &[("key", FieldType::Str(16)), ("count", FieldType::U64)],
//! )?;
//! let words = db.create_layer_table(
//!     "words",
//!     &word,
//!     LayerTableOptions::new("key").p_init(4).bloom_filters(8),
//! )?;
//! db.build()?;
//!
//! words.insert(&record! { "key" => "tree", "count" => 2_u64 })?;
//!
//! let row = words.lookup("tree")?;
//! assert_eq!(Some(2), row.get_u64("count"));
//! assert!(!words.contains("forest")?);
//! #
//! # Ok::<(), interlace::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

macro_rules! fail_iter {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        }
    };
}

mod array;
mod catalog;

#[doc(hidden)]
pub mod coding;

mod compression;
mod database;
mod dataset;
mod error;
mod field;
mod file;
mod group;

mod hash;
mod record;
mod schema;
mod table;

pub use {
    array::{Array, Element, ElementType},
    compression::CompressionType,
    database::{Config, Database},
    dataset::{Dataset, Scan},
    error::{Error, Result},
    field::{FieldType, RowStatus, Value},
    group::Group,
    record::Record,
    table::{
        ChainFieldIter, ChainIter, ChainedTable, ChainedTableOptions, LayerIter, LayerTable,
        LayerTableOptions,
    },
};

#[doc(hidden)]
pub use coding::{DecodeError, EncodeError};
