// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Hash table structures layered on top of record regions

mod chained;
mod layered;

pub use chained::{ChainFieldIter, ChainIter, ChainedTable, ChainedTableOptions};
pub use layered::{LayerIter, LayerTable, LayerTableOptions};

use crate::{FieldType, Value};
use quick_cache::{sync::DefaultLifecycle, UnitWeighter};
use rustc_hash::FxBuildHasher;

pub(crate) type Cache<K, V> = quick_cache::sync::Cache<K, V, UnitWeighter, FxBuildHasher>;

/// Builds a bounded cache of `len` entries, or `None` when disabled.
pub(crate) fn new_cache<K, V>(len: u64) -> Option<Cache<K, V>>
where
    K: std::hash::Hash + Eq,
    V: Clone,
{
    if len == 0 {
        return None;
    }

    #[allow(clippy::cast_possible_truncation, clippy::default_trait_access)]
    let cache = Cache::with(
        len as usize,
        len,
        UnitWeighter,
        Default::default(),
        DefaultLifecycle::default(),
    );

    Some(cache)
}

/// Capacity of layer `p`: `growth^p`.
pub(crate) fn capacity(growth: u32, p: u32) -> crate::Result<u64> {
    u64::from(growth)
        .checked_pow(p)
        .ok_or(crate::Error::CapacityExceeded("layer capacity overflows u64"))
}

/// Probe window of layer `p`: `round(p·α·b)`, clamped to `[1, capacity]`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn probe_window(p: u32, probe_factor: f64, growth: u32, capacity: u64) -> u64 {
    let window = (f64::from(p) * probe_factor * f64::from(growth)).round() as u64;
    window.clamp(1, capacity)
}

/// Length of the byte-bloom filter attached to a block of `capacity`
/// slots: one byte per slot and hash function.
pub(crate) fn bloom_len(capacity: u64, k: u32) -> crate::Result<u64> {
    capacity
        .checked_mul(u64::from(k))
        .ok_or(crate::Error::CapacityExceeded("bloom filter length overflows u64"))
}

/// Encodes a key into the fixed-width representation of its field,
/// which is both the hash input and the probe comparison operand.
pub(crate) fn key_bytes(ty: FieldType, key: &Value) -> crate::Result<Vec<u8>> {
    let mut buf = vec![0; ty.width()];
    crate::field::encode_value(ty, key, &mut buf)?;
    Ok(buf)
}

pub(crate) fn expect_u64(value: &Value) -> crate::Result<u64> {
    match value {
        Value::U64(v) => Ok(*v),
        other => Err(crate::Error::TypeMismatch(format!("{other:?}"))),
    }
}

pub(crate) fn expect_u8(value: &Value) -> crate::Result<u8> {
    match value {
        Value::U8(v) => Ok(*v),
        other => Err(crate::Error::TypeMismatch(format!("{other:?}"))),
    }
}
