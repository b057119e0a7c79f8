// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::catalog::{StructureDef, StructureKind};
use crate::table::{
    bloom_len, capacity, expect_u64, expect_u8, key_bytes, new_cache, probe_window, Cache,
};
use crate::{hash, Array, FieldType, Group, Record, RowStatus, Value};
use std::sync::Arc;

/// Options for [`ChainedTable`]
///
/// Defaults: `p_init = 0`, `growth_factor = 2`, `probe_factor = 0.25`,
/// `bloom_filters = 10`, `bloom_seed = 12`, no cache.
#[derive(Clone, Debug)]
pub struct ChainedTableOptions {
    key_field: String,
    p_init: u32,
    growth_factor: u32,
    probe_factor: f64,
    bloom_filters: u32,
    bloom_seed: u64,
    cache_len: u64,
}

impl ChainedTableOptions {
    /// Starts options with the given key field.
    #[must_use]
    pub fn new(key_field: &str) -> Self {
        Self {
            key_field: key_field.into(),
            p_init: 0,
            growth_factor: 2,
            probe_factor: 0.25,
            bloom_filters: 10,
            bloom_seed: 12,
            cache_len: 0,
        }
    }

    /// Log-capacity of chain roots.
    #[must_use]
    pub fn p_init(mut self, p: u32) -> Self {
        self.p_init = p;
        self
    }

    /// Capacity multiplier between chain blocks.
    ///
    /// # Panics
    ///
    /// Panics if `growth_factor < 2`.
    #[must_use]
    pub fn growth_factor(mut self, growth_factor: u32) -> Self {
        assert!(growth_factor >= 2, "growth factor must be at least 2");
        self.growth_factor = growth_factor;
        self
    }

    /// Scales the linear probe window, `α ∈ (0, 1]`.
    ///
    /// # Panics
    ///
    /// Panics if `probe_factor` is outside `(0, 1]`.
    #[must_use]
    pub fn probe_factor(mut self, probe_factor: f64) -> Self {
        assert!(
            probe_factor > 0.0 && probe_factor <= 1.0,
            "probe factor must be in (0, 1]",
        );
        self.probe_factor = probe_factor;
        self
    }

    /// Bloom bytes per slot; `0` disables the filters.
    #[must_use]
    pub fn bloom_filters(mut self, n: u32) -> Self {
        self.bloom_filters = n;
        self
    }

    /// Seed of the bloom hash.
    #[must_use]
    pub fn bloom_seed(mut self, seed: u64) -> Self {
        self.bloom_seed = seed;
        self
    }

    /// Enables a bounded block-metadata cache of `len` entries.
    #[must_use]
    pub fn cache_len(mut self, len: u64) -> Self {
        self.cache_len = len;
        self
    }

    pub(crate) fn key_field(&self) -> &str {
        &self.key_field
    }

    pub(crate) fn to_def(&self, name: &str, dataset: &str) -> StructureDef {
        StructureDef {
            kind: StructureKind::Chained,
            name: name.into(),
            dataset: dataset.into(),
            key_field: self.key_field.clone(),
            p_init: self.p_init,
            growth_factor: self.growth_factor,
            probe_factor: self.probe_factor,
            bloom_filters: self.bloom_filters,
            bloom_seed: self.bloom_seed,
            cache_len: self.cache_len,
        }
    }
}

/// Cached copy of a chain block's header
#[derive(Copy, Clone)]
struct TableMeta {
    prev: u64,
    p: u32,
    bloom: u64,
}

struct Inner {
    name: String,
    group: Group,
    bloom: Array,
    key_field: String,
    key_type: FieldType,
    p_init: u32,
    growth: u32,
    probe_factor: f64,
    k: u32,
    bloom_seed: u64,
    cache: Option<Cache<u64, TableMeta>>,
}

/// A chained layered hash table: a per-key multi-map
///
/// Every key group owns a chain of group-blocks, newest first. A block's
/// header carries its layer `_p`, the previous block `_prev_table` and
/// its bloom filter. Insertion spills into a new, strictly larger block
/// when the chain is full, so chains stay `O(log n)` blocks long.
///
/// Chain heads are plain `u64` handles owned by the caller; [`insert`]
/// returns the current head, which replaces the caller's handle when it
/// grew.
///
/// [`insert`]: ChainedTable::insert
#[derive(Clone)]
pub struct ChainedTable(Arc<Inner>);

impl ChainedTable {
    pub(crate) fn new(def: &StructureDef, group: Group, bloom: Array) -> crate::Result<Self> {
        let key_type = group.entry().schema().spec(&def.key_field)?.ty;

        Ok(Self(Arc::new(Inner {
            name: def.name.clone(),
            group,
            bloom,
            key_field: def.key_field.clone(),
            key_type,
            p_init: def.p_init,
            growth: def.growth_factor,
            probe_factor: def.probe_factor,
            k: def.bloom_filters,
            bloom_seed: def.bloom_seed,
            cache: new_cache(def.cache_len),
        })))
    }

    /// Name of this structure.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Chains keep no global roots, so there is nothing to recover.
    pub(crate) fn initialize(&self) -> crate::Result<()> {
        Ok(())
    }

    /// Capacity of a block at layer `p`: `max(1, growth^p - 1)`.
    fn capacity_of(&self, p: u32) -> crate::Result<u64> {
        Ok(capacity(self.0.growth, p)?.saturating_sub(1).max(1))
    }

    fn cache_put(&self, table_id: u64, meta: TableMeta) {
        if let Some(cache) = &self.0.cache {
            cache.insert(table_id, meta);
        }
    }

    /// Reads a block's header, through the metadata cache.
    fn meta(&self, table_id: u64) -> crate::Result<TableMeta> {
        let inner = &self.0;

        if let Some(cache) = &inner.cache {
            if let Some(meta) = cache.get(&table_id) {
                return Ok(meta);
            }
        }

        let prev = expect_u64(&inner.group.header_get(table_id, "_prev_table")?)?;
        let p = u32::from(expect_u8(&inner.group.header_get(table_id, "_p")?)?);
        let bloom = expect_u64(&inner.group.header_get(table_id, "_bloom_filter")?)?;

        let meta = TableMeta { prev, p, bloom };
        self.cache_put(table_id, meta);
        Ok(meta)
    }

    fn create_table(&self, p: u32, prev: u64) -> crate::Result<u64> {
        let inner = &self.0;

        let cap = self.capacity_of(p)?;
        let block = inner.group.new_block(cap)?;

        let p_tag =
            u8::try_from(p).map_err(|_| crate::Error::CapacityExceeded("chain layer tag"))?;
        inner.group.header_set(block, "_p", p_tag)?;
        inner.group.header_set(block, "_prev_table", prev)?;

        let bloom = if inner.k > 0 {
            let filter = inner.bloom.new_block(bloom_len(cap, inner.k)?)?;
            inner.group.header_set(block, "_bloom_filter", filter)?;
            filter
        } else {
            0
        };

        self.cache_put(block, TableMeta { prev, p, bloom });

        log::trace!(
            "New chain block for {:?}: p={p}, capacity={cap}, prev={prev}",
            inner.name,
        );

        Ok(block)
    }

    /// Allocates a fresh chain root and returns its handle.
    pub fn new_table(&self) -> crate::Result<u64> {
        self.create_table(self.0.p_init, 0)
    }

    /// Inserts a record into the chain headed by `table_id`, returning
    /// the current head.
    ///
    /// Inserting a key that is already present in the chain is a no-op.
    /// Callers replace their handle with the returned value whenever it
    /// differs (it only ever grows).
    pub fn insert(&self, table_id: u64, record: &Record) -> crate::Result<u64> {
        let inner = &self.0;

        let key = record
            .get(&inner.key_field)
            .ok_or_else(|| crate::Error::UnknownField(inner.key_field.clone()))?;
        let kb = key_bytes(inner.key_type, key)?;
        let h = hash::hash64(&kb);
        let hb = hash::hash64_seeded(&kb, inner.bloom_seed);

        // dedup pass over the whole chain
        if self.locate(table_id, &kb, h, hb)?.is_some() {
            return Ok(table_id);
        }

        // insert pass: the first reusable slot wins
        let mut tid = table_id;
        while tid != 0 {
            let meta = self.meta(tid)?;
            let cap = self.capacity_of(meta.p)?;

            if let Some(position) = self.probe_insert(tid, meta.p, cap, h)? {
                inner.group.set(tid, position, record)?;
                if inner.k > 0 {
                    self.bloom_set(&meta, cap, hb)?;
                }
                return Ok(table_id);
            }

            tid = meta.prev;
        }

        // every block refused: spill into a strictly larger head
        let head = self.meta(table_id)?;
        let new_head = self.create_table(head.p + 1, table_id)?;
        let meta = self.meta(new_head)?;
        let cap = self.capacity_of(meta.p)?;

        let position = self
            .probe_insert(new_head, meta.p, cap, h)?
            .ok_or(crate::Error::CapacityExceeded(
                "fresh chain block rejected an insert",
            ))?;

        inner.group.set(new_head, position, record)?;
        if inner.k > 0 {
            self.bloom_set(&meta, cap, hb)?;
        }

        Ok(new_head)
    }

    /// Looks up `key` in the chain headed by `table_id`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::KeyNotFound`] if no block holds the key.
    pub fn lookup(&self, table_id: u64, key: impl Into<Value>) -> crate::Result<Record> {
        let inner = &self.0;

        let kb = key_bytes(inner.key_type, &key.into())?;
        let h = hash::hash64(&kb);
        let hb = hash::hash64_seeded(&kb, inner.bloom_seed);

        match self.locate(table_id, &kb, h, hb)? {
            Some((tid, position)) => inner.group.get(tid, position),
            None => Err(crate::Error::KeyNotFound),
        }
    }

    /// Returns `true` iff the chain holds a live record under `key`.
    pub fn contains(&self, table_id: u64, key: impl Into<Value>) -> crate::Result<bool> {
        let inner = &self.0;

        let kb = key_bytes(inner.key_type, &key.into())?;
        let h = hash::hash64(&kb);
        let hb = hash::hash64_seeded(&kb, inner.bloom_seed);

        Ok(self.locate(table_id, &kb, h, hb)?.is_some())
    }

    /// Walks the chain head-first for a live copy of the key.
    fn locate(
        &self,
        head: u64,
        kb: &[u8],
        h: u64,
        hb: u64,
    ) -> crate::Result<Option<(u64, u64)>> {
        let inner = &self.0;

        let mut tid = head;
        while tid != 0 {
            let meta = self.meta(tid)?;
            let cap = self.capacity_of(meta.p)?;

            let skip = inner.k > 0 && !self.bloom_contains(&meta, cap, hb)?;
            if !skip {
                if let Some(position) = self.probe_lookup(tid, meta.p, cap, kb, h)? {
                    return Ok(Some((tid, position)));
                }
            }

            tid = meta.prev;
        }

        Ok(None)
    }

    /// Probes one block for a live copy of the key.
    fn probe_lookup(
        &self,
        table_id: u64,
        p: u32,
        cap: u64,
        kb: &[u8],
        h: u64,
    ) -> crate::Result<Option<u64>> {
        let inner = &self.0;

        let window = probe_window(p, inner.probe_factor, inner.growth, cap);
        let bucket = h % cap;

        for i in 0..window {
            let position = (bucket + i) % cap;

            match inner.group.status(table_id, position)? {
                RowStatus::Live => {
                    if inner
                        .group
                        .read_entry_field_raw(table_id, position, &inner.key_field)?
                        == kb
                    {
                        return Ok(Some(position));
                    }
                }
                RowStatus::Deleted => {}

                // an untouched slot terminates this block's scan
                RowStatus::Empty => return Ok(None),
            }
        }

        Ok(None)
    }

    /// Probes one block for a slot with status `<= 0`.
    fn probe_insert(
        &self,
        table_id: u64,
        p: u32,
        cap: u64,
        h: u64,
    ) -> crate::Result<Option<u64>> {
        let inner = &self.0;

        let window = probe_window(p, inner.probe_factor, inner.growth, cap);
        let bucket = h % cap;

        for i in 0..window {
            let position = (bucket + i) % cap;

            match inner.group.status(table_id, position)? {
                RowStatus::Live => {}
                RowStatus::Empty | RowStatus::Deleted => return Ok(Some(position)),
            }
        }

        Ok(None)
    }

    fn bloom_set(&self, meta: &TableMeta, cap: u64, hb: u64) -> crate::Result<()> {
        let m = bloom_len(cap, self.0.k)?;
        self.0.bloom.set::<bool>(meta.bloom, hb % m, true)
    }

    fn bloom_contains(&self, meta: &TableMeta, cap: u64, hb: u64) -> crate::Result<bool> {
        let m = bloom_len(cap, self.0.k)?;
        self.0.bloom.get::<bool>(meta.bloom, hb % m)
    }

    /// Collects `(block, capacity)` pairs of the chain, head first.
    fn blocks(&self, head: u64) -> crate::Result<Vec<(u64, u64)>> {
        let mut blocks = Vec::new();

        let mut tid = head;
        while tid != 0 {
            let meta = self.meta(tid)?;
            blocks.push((tid, self.capacity_of(meta.p)?));
            tid = meta.prev;
        }

        Ok(blocks)
    }

    /// Iterates over every live record of the chain, newest block first.
    pub fn iter(&self, table_id: u64) -> crate::Result<ChainIter> {
        Ok(ChainIter {
            group: self.0.group.clone(),
            blocks: self.blocks(table_id)?,
            block: 0,
            position: 0,
        })
    }

    /// Iterates over one field of every live record of the chain.
    pub fn iter_field(&self, table_id: u64, field: &str) -> crate::Result<ChainFieldIter> {
        // unknown fields fail fast, not per-item
        self.0.group.entry().schema().spec(field)?;

        Ok(ChainFieldIter {
            group: self.0.group.clone(),
            field: field.into(),
            blocks: self.blocks(table_id)?,
            block: 0,
            position: 0,
        })
    }

    #[doc(hidden)]
    pub fn chain(&self, table_id: u64) -> crate::Result<Vec<(u64, u32)>> {
        let mut chain = Vec::new();

        let mut tid = table_id;
        while tid != 0 {
            let meta = self.meta(tid)?;
            chain.push((tid, meta.p));
            tid = meta.prev;
        }

        Ok(chain)
    }
}

fn next_live(
    group: &Group,
    blocks: &[(u64, u64)],
    block: &mut usize,
    position: &mut u64,
) -> Option<crate::Result<(u64, u64)>> {
    loop {
        let (table_id, cap) = *blocks.get(*block)?;

        if *position >= cap {
            *block += 1;
            *position = 0;
            continue;
        }

        let current = *position;
        *position += 1;

        match group.status(table_id, current) {
            Ok(RowStatus::Live) => return Some(Ok((table_id, current))),
            Ok(_) => {}
            Err(e) => return Some(Err(e)),
        }
    }
}

/// Iterator over the live records of one chain
///
/// Returned by [`ChainedTable::iter`].
pub struct ChainIter {
    group: Group,
    blocks: Vec<(u64, u64)>,
    block: usize,
    position: u64,
}

impl Iterator for ChainIter {
    type Item = crate::Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        match next_live(&self.group, &self.blocks, &mut self.block, &mut self.position)? {
            Ok((table_id, position)) => Some(self.group.get(table_id, position)),
            Err(e) => Some(Err(e)),
        }
    }
}

/// Iterator over one field of the live records of one chain
///
/// Returned by [`ChainedTable::iter_field`].
pub struct ChainFieldIter {
    group: Group,
    field: String,
    blocks: Vec<(u64, u64)>,
    block: usize,
    position: u64,
}

impl Iterator for ChainFieldIter {
    type Item = crate::Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        match next_live(&self.group, &self.blocks, &mut self.block, &mut self.position)? {
            Ok((table_id, position)) => {
                Some(self.group.get_value(table_id, position, &self.field))
            }
            Err(e) => Some(Err(e)),
        }
    }
}
