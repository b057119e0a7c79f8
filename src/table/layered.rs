// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::catalog::{StructureDef, StructureKind};
use crate::database::Core;
use crate::table::{
    bloom_len, capacity, expect_u64, key_bytes, new_cache, probe_window, Cache,
};
use crate::{hash, Array, Dataset, FieldType, Record, RowStatus, Value};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Hard cap on the number of layers of a single table
const MAX_LAYERS: usize = 32;

/// Options for [`LayerTable`]
///
/// Defaults: `p_init = 10`, `growth_factor = 2`, `probe_factor = 0.5`,
/// `bloom_filters = 10`, `bloom_seed = 12`, no cache.
#[derive(Clone, Debug)]
pub struct LayerTableOptions {
    key_field: String,
    p_init: u32,
    growth_factor: u32,
    probe_factor: f64,
    bloom_filters: u32,
    bloom_seed: u64,
    cache_len: u64,
}

impl LayerTableOptions {
    /// Starts options with the given key field.
    #[must_use]
    pub fn new(key_field: &str) -> Self {
        Self {
            key_field: key_field.into(),
            p_init: 10,
            growth_factor: 2,
            probe_factor: 0.5,
            bloom_filters: 10,
            bloom_seed: 12,
            cache_len: 0,
        }
    }

    /// Log-capacity of the first layer (capacity `growth_factor ^ p`).
    #[must_use]
    pub fn p_init(mut self, p: u32) -> Self {
        self.p_init = p;
        self
    }

    /// Capacity multiplier between layers.
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

    /// Enables a bounded key-to-position cache of `len` entries.
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
            kind: StructureKind::Layered,
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

struct State {
    tables_block: u64,
    blooms_block: u64,

    /// Block offsets per layer; `0` marks a layer not yet created
    tables: [u64; MAX_LAYERS],

    /// Bloom array offsets per layer
    blooms: [u64; MAX_LAYERS],

    p_last: u32,
}

struct Inner {
    name: String,
    dataset: Dataset,

    /// u64 arrays holding the per-layer block offsets
    slots: Array,

    /// Byte-bloom arrays, one per layer
    bloom: Array,

    key_field: String,
    key_type: FieldType,
    p_init: u32,
    growth: u32,
    probe_factor: f64,
    k: u32,
    bloom_seed: u64,
    core: Arc<Core>,
    state: RwLock<State>,

    /// Key-hash to `(p, position)`; entries are verified against the
    /// stored key on every hit, so hash collisions only evict
    cache: Option<Cache<u64, (u32, u64)>>,
}

/// A layered hash table: an open-addressed map that grows by doubling
///
/// Keys live in up to 32 *layers* of geometrically increasing capacity.
/// Lookups walk the layers newest-first with short linear probes;
/// per-layer byte-bloom filters skip layers that cannot hold the key.
/// At most one live copy of a key exists across all layers.
///
/// Handles are cheap to clone.
#[derive(Clone)]
pub struct LayerTable(Arc<Inner>);

impl LayerTable {
    pub(crate) fn new(
        def: &StructureDef,
        dataset: Dataset,
        slots: Array,
        bloom: Array,
        core: Arc<Core>,
    ) -> crate::Result<Self> {
        let key_type = dataset.schema().spec(&def.key_field)?.ty;

        Ok(Self(Arc::new(Inner {
            name: def.name.clone(),
            dataset,
            slots,
            bloom,
            key_field: def.key_field.clone(),
            key_type,
            p_init: def.p_init,
            growth: def.growth_factor,
            probe_factor: def.probe_factor,
            k: def.bloom_filters,
            bloom_seed: def.bloom_seed,
            core,
            state: RwLock::new(State {
                tables_block: 0,
                blooms_block: 0,
                tables: [0; MAX_LAYERS],
                blooms: [0; MAX_LAYERS],
                p_last: def.p_init,
            }),
            cache: new_cache(def.cache_len),
        })))
    }

    /// Name of this structure.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Creates or recovers the layer state from the header.
    pub(crate) fn initialize(&self) -> crate::Result<()> {
        let inner = &self.0;
        let mut state = self.write_state();

        let tables_field = format!("{}_tables_block", inner.name);
        let blooms_field = format!("{}_blooms_block", inner.name);

        let tables_block = expect_u64(&inner.core.header_get(&tables_field)?)?;

        if tables_block == 0 {
            let tables_block = inner.slots.new_block(MAX_LAYERS as u64)?;
            inner
                .core
                .header_set(&tables_field, &Value::U64(tables_block))?;

            let cap = capacity(inner.growth, inner.p_init)?;
            let layer = inner.dataset.new_block(cap)?;
            inner.slots.set::<u64>(tables_block, 0, layer)?;

            state.tables_block = tables_block;
            state.tables[0] = layer;
            state.p_last = inner.p_init;

            if inner.k > 0 {
                let blooms_block = inner.slots.new_block(MAX_LAYERS as u64)?;
                inner
                    .core
                    .header_set(&blooms_field, &Value::U64(blooms_block))?;

                let filter = inner.bloom.new_block(bloom_len(cap, inner.k)?)?;
                inner.slots.set::<u64>(blooms_block, 0, filter)?;

                state.blooms_block = blooms_block;
                state.blooms[0] = filter;
            }

            log::debug!(
                "Initialized layer table {:?}: p_init={}, capacity={cap}",
                inner.name,
                inner.p_init,
            );
        } else {
            state.tables_block = tables_block;

            let tables = inner.slots.slice::<u64>(tables_block, 0, MAX_LAYERS)?;
            let top = tables.iter().rposition(|&block| block != 0).unwrap_or(0);
            state.tables.copy_from_slice(&tables);

            #[allow(clippy::cast_possible_truncation)]
            {
                state.p_last = inner.p_init + top as u32;
            }

            if inner.k > 0 {
                let blooms_block = expect_u64(&inner.core.header_get(&blooms_field)?)?;
                let blooms = inner.slots.slice::<u64>(blooms_block, 0, MAX_LAYERS)?;
                state.blooms_block = blooms_block;
                state.blooms.copy_from_slice(&blooms);
            }

            log::debug!(
                "Recovered layer table {:?}: p_last={}",
                inner.name,
                state.p_last,
            );
        }

        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn read_state(&self) -> RwLockReadGuard<'_, State> {
        self.0.state.read().expect("lock is poisoned")
    }

    #[allow(clippy::expect_used)]
    fn write_state(&self) -> RwLockWriteGuard<'_, State> {
        self.0.state.write().expect("lock is poisoned")
    }

    fn layer_index(&self, p: u32) -> usize {
        (p - self.0.p_init) as usize
    }

    fn cache_put(&self, h: u64, p: u32, position: u64) {
        if let Some(cache) = &self.0.cache {
            cache.insert(h, (p, position));
        }
    }

    /// Inserts a record, overwriting any live copy of its key.
    ///
    /// Grows a new layer when all existing probe windows are full.
    ///
    /// # Errors
    ///
    /// Surfaces [`crate::Error::CapacityExceeded`] past 32 layers, and
    /// [`crate::Error::UnknownField`] if the record misses its key.
    pub fn insert(&self, record: &Record) -> crate::Result<()> {
        let inner = &self.0;

        let key = record
            .get(&inner.key_field)
            .ok_or_else(|| crate::Error::UnknownField(inner.key_field.clone()))?;
        let kb = key_bytes(inner.key_type, key)?;
        let h = hash::hash64(&kb);

        let mut state = self.write_state();

        // at most one live copy of a key: overwrite in place when found
        if let Some((p, position)) = self.locate(&state, &kb, h)? {
            let table = state.tables[self.layer_index(p)];
            inner.dataset.set(table, position, record)?;
            if inner.k > 0 {
                self.bloom_insert(&state, p, &kb)?;
            }
            self.cache_put(h, p, position);
            return Ok(());
        }

        loop {
            for p in (inner.p_init..=state.p_last).rev() {
                let Some(position) = self.probe_insert(&state, p, &kb, h)? else {
                    continue;
                };

                let table = state.tables[self.layer_index(p)];
                inner.dataset.set(table, position, record)?;
                if inner.k > 0 {
                    self.bloom_insert(&state, p, &kb)?;
                }
                self.cache_put(h, p, position);
                return Ok(());
            }

            // a fresh layer always accepts (its window is non-empty)
            self.grow(&mut state)?;
        }
    }

    /// Looks up the record stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::KeyNotFound`] if the key is absent.
    pub fn lookup(&self, key: impl Into<Value>) -> crate::Result<Record> {
        let inner = &self.0;
        let kb = key_bytes(inner.key_type, &key.into())?;
        let h = hash::hash64(&kb);

        let state = self.read_state();
        match self.locate(&state, &kb, h)? {
            Some((p, position)) => {
                let table = state.tables[self.layer_index(p)];
                inner.dataset.get(table, position)
            }
            None => Err(crate::Error::KeyNotFound),
        }
    }

    /// Returns `true` iff a live record exists under `key`.
    pub fn contains(&self, key: impl Into<Value>) -> crate::Result<bool> {
        let inner = &self.0;
        let kb = key_bytes(inner.key_type, &key.into())?;
        let h = hash::hash64(&kb);

        let state = self.read_state();
        Ok(self.locate(&state, &kb, h)?.is_some())
    }

    /// Tombstones the record stored under `key`.
    ///
    /// Bloom filters stay conservative; only the row is tombstoned.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::KeyNotFound`] if the key is absent.
    pub fn delete(&self, key: impl Into<Value>) -> crate::Result<()> {
        let inner = &self.0;
        let kb = key_bytes(inner.key_type, &key.into())?;
        let h = hash::hash64(&kb);

        let state = self.write_state();
        match self.locate(&state, &kb, h)? {
            Some((p, position)) => {
                let table = state.tables[self.layer_index(p)];
                inner.dataset.delete(table, position)?;
                if let Some(cache) = &inner.cache {
                    cache.remove(&h);
                }
                Ok(())
            }
            None => Err(crate::Error::KeyNotFound),
        }
    }

    /// Finds the `(p, position)` of a live copy of the key, if any.
    fn locate(&self, state: &State, kb: &[u8], h: u64) -> crate::Result<Option<(u32, u64)>> {
        let inner = &self.0;

        if let Some(cache) = &inner.cache {
            if let Some((p, position)) = cache.get(&h) {
                let table = state.tables[self.layer_index(p)];
                if table != 0
                    && inner.dataset.status(table, position)? == RowStatus::Live
                    && inner.dataset.read_field_raw(table, position, &inner.key_field)? == kb
                {
                    return Ok(Some((p, position)));
                }
                cache.remove(&h);
            }
        }

        let hb = (inner.k > 0).then(|| hash::hash64_seeded(kb, inner.bloom_seed));

        for p in (inner.p_init..=state.p_last).rev() {
            if let Some(hb) = hb {
                if !self.bloom_contains(state, p, hb)? {
                    continue;
                }
            }

            if let Some(position) = self.probe_lookup(state, p, kb, h)? {
                self.cache_put(h, p, position);
                return Ok(Some((p, position)));
            }
        }

        Ok(None)
    }

    /// Probes one layer for a live copy of the key.
    fn probe_lookup(
        &self,
        state: &State,
        p: u32,
        kb: &[u8],
        h: u64,
    ) -> crate::Result<Option<u64>> {
        let inner = &self.0;

        let cap = capacity(inner.growth, p)?;
        let window = probe_window(p, inner.probe_factor, inner.growth, cap);
        let table = state.tables[self.layer_index(p)];
        let bucket = h % cap;

        for i in 0..window {
            let position = (bucket + i) % cap;

            match inner.dataset.status(table, position)? {
                RowStatus::Live => {
                    if inner.dataset.read_field_raw(table, position, &inner.key_field)? == kb {
                        return Ok(Some(position));
                    }
                }
                RowStatus::Deleted => {}

                // an untouched slot terminates the probe sequence
                RowStatus::Empty => return Ok(None),
            }
        }

        Ok(None)
    }

    /// Probes one layer for a slot that accepts the key.
    fn probe_insert(
        &self,
        state: &State,
        p: u32,
        kb: &[u8],
        h: u64,
    ) -> crate::Result<Option<u64>> {
        let inner = &self.0;

        let cap = capacity(inner.growth, p)?;
        let window = probe_window(p, inner.probe_factor, inner.growth, cap);
        let table = state.tables[self.layer_index(p)];
        let bucket = h % cap;

        for i in 0..window {
            let position = (bucket + i) % cap;

            match inner.dataset.status(table, position)? {
                RowStatus::Live => {
                    if inner.dataset.read_field_raw(table, position, &inner.key_field)? == kb {
                        return Ok(Some(position));
                    }
                }
                RowStatus::Deleted => {}
                RowStatus::Empty => return Ok(Some(position)),
            }
        }

        Ok(None)
    }

    /// Allocates the next layer.
    fn grow(&self, state: &mut State) -> crate::Result<()> {
        let inner = &self.0;

        let p_new = state.p_last + 1;
        let index = self.layer_index(p_new);

        if index >= MAX_LAYERS {
            return Err(crate::Error::CapacityExceeded(
                "layered hash table exceeds 32 layers",
            ));
        }

        let cap = capacity(inner.growth, p_new)?;
        let block = inner.dataset.new_block(cap)?;
        inner
            .slots
            .set::<u64>(state.tables_block, index as u64, block)?;
        state.tables[index] = block;

        if inner.k > 0 {
            let filter = inner.bloom.new_block(bloom_len(cap, inner.k)?)?;
            inner
                .slots
                .set::<u64>(state.blooms_block, index as u64, filter)?;
            state.blooms[index] = filter;
        }

        state.p_last = p_new;

        log::debug!("Growing layer table {:?} to p={p_new} (capacity {cap})", inner.name);

        Ok(())
    }

    fn bloom_insert(&self, state: &State, p: u32, kb: &[u8]) -> crate::Result<()> {
        let inner = &self.0;
        let hb = hash::hash64_seeded(kb, inner.bloom_seed);
        let m = bloom_len(capacity(inner.growth, p)?, inner.k)?;
        let filter = state.blooms[self.layer_index(p)];
        inner.bloom.set::<bool>(filter, hb % m, true)
    }

    fn bloom_contains(&self, state: &State, p: u32, hb: u64) -> crate::Result<bool> {
        let inner = &self.0;
        let m = bloom_len(capacity(inner.growth, p)?, inner.k)?;
        let filter = state.blooms[self.layer_index(p)];
        inner.bloom.get::<bool>(filter, hb % m)
    }

    /// Iterates over every live record, oldest layer first.
    pub fn iter(&self) -> crate::Result<LayerIter> {
        let inner = &self.0;
        let state = self.read_state();

        let mut layers = Vec::new();
        for p in inner.p_init..=state.p_last {
            layers.push((
                state.tables[self.layer_index(p)],
                capacity(inner.growth, p)?,
            ));
        }

        Ok(LayerIter {
            dataset: inner.dataset.clone(),
            layers,
            layer: 0,
            position: 0,
        })
    }

    /// The log-capacity of the newest layer.
    #[must_use]
    pub fn last_layer(&self) -> u32 {
        self.read_state().p_last
    }

    #[doc(hidden)]
    #[must_use]
    pub fn layer_blocks(&self) -> Vec<u64> {
        self.read_state().tables.to_vec()
    }
}

/// Iterator over the live records of a [`LayerTable`]
pub struct LayerIter {
    dataset: Dataset,
    layers: Vec<(u64, u64)>,
    layer: usize,
    position: u64,
}

impl Iterator for LayerIter {
    type Item = crate::Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (block, cap) = *self.layers.get(self.layer)?;

            if self.position >= cap {
                self.layer += 1;
                self.position = 0;
                continue;
            }

            let position = self.position;
            self.position += 1;

            if fail_iter!(self.dataset.status(block, position)) == RowStatus::Live {
                return Some(self.dataset.get(block, position));
            }
        }
    }
}
