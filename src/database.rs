// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::array::ElementType;
use crate::catalog::{
    ArrayDef, Catalog, DatasetDef, GroupDef, StructureDef, StructureKind, FIRST_USER_IDENTIFIER,
    HEADER_IDENTIFIER,
};
use crate::coding::{Decode, Encode};
use crate::field::{decode_value, encode_value};
use crate::file::FileIo;
use crate::schema::{FieldSpec, Schema};
use crate::table::{ChainedTable, ChainedTableOptions, LayerTable, LayerTableOptions};
use crate::{Array, CompressionType, Dataset, FieldType, Group, Value};
use byteorder::{ByteOrder, LE};
use rustc_hash::FxHashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

/// Computed file layout, fixed once the file is built or reopened
pub(crate) struct Layout {
    pub header_offset: u64,
    pub table_start: u64,
    pub header: Schema,

    /// Row width per identifier, for skipping foreign rows during scans
    pub row_sizes: FxHashMap<i8, u64>,
}

/// Shared engine state behind every handle
pub(crate) struct Core {
    pub(crate) file: FileIo,
    pub(crate) compression: CompressionType,
    layout: OnceLock<Layout>,
}

impl Core {
    pub(crate) fn layout(&self) -> crate::Result<&Layout> {
        self.layout.get().ok_or(crate::Error::NotBuilt)
    }

    fn set_layout(&self, layout: Layout) -> crate::Result<()> {
        self.layout
            .set(layout)
            .map_err(|_| crate::Error::AlreadyBuilt)
    }

    /// Appends `[0x01][u32 len][payload]` and returns the tag's offset.
    pub(crate) fn append_blob(&self, payload: &[u8]) -> crate::Result<u64> {
        let body = self.compression.compress(payload);

        let mut buf = Vec::with_capacity(5 + body.len());
        buf.push(1);
        #[allow(clippy::cast_possible_truncation)]
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&body);

        self.file.append(&buf)
    }

    /// Like [`Core::append_blob`], but checked into the inline `u32`
    /// handle representation.
    pub(crate) fn put_blob(&self, payload: &[u8]) -> crate::Result<u32> {
        let offset = self.append_blob(payload)?;
        u32::try_from(offset)
            .map_err(|_| crate::Error::CapacityExceeded("blob handle beyond 4 GiB"))
    }

    /// Reads back the blob whose tag byte sits at `offset`.
    pub(crate) fn get_blob(&self, offset: u64) -> crate::Result<Vec<u8>> {
        let head = self.file.read_at(offset, 5)?;

        if head[0] != 1 {
            return Err(crate::Error::Decode(crate::coding::DecodeError::InvalidTag(
                ("Blob", head[0]),
            )));
        }

        let len = LE::read_u32(&head[1..]);
        let body = self.file.read_at(offset + 5, len as usize)?;
        self.compression.decompress(&body)
    }

    /// Reads one field at `base + spec.offset`, resolving blob handles.
    pub(crate) fn read_field(&self, base: u64, spec: FieldSpec) -> crate::Result<Value> {
        let buf = self.file.read_at(base + spec.offset as u64, spec.ty.width())?;

        if spec.ty == FieldType::Blob {
            let handle = LE::read_u32(&buf);
            if handle == 0 {
                return Err(crate::Error::KeyNotFound);
            }
            return Ok(Value::Blob(self.get_blob(u64::from(handle))?));
        }

        Ok(decode_value(spec.ty, &buf))
    }

    /// Writes one field at `base + spec.offset`; blob payloads are
    /// appended first and stored as handles.
    pub(crate) fn write_field(
        &self,
        base: u64,
        spec: FieldSpec,
        value: &Value,
    ) -> crate::Result<()> {
        let mut buf = vec![0; spec.ty.width()];

        if spec.ty == FieldType::Blob {
            let Value::Blob(payload) = value else {
                return Err(crate::Error::TypeMismatch(format!("{value:?}")));
            };
            LE::write_u32(&mut buf, self.put_blob(payload)?);
        } else {
            encode_value(spec.ty, value, &mut buf)?;
        }

        self.file.write_at(base + spec.offset as u64, &buf)
    }

    pub(crate) fn header_get(&self, field: &str) -> crate::Result<Value> {
        let layout = self.layout()?;
        let spec = layout.header.spec(field)?;
        self.read_field(layout.header_offset, spec)
    }

    pub(crate) fn header_set(&self, field: &str, value: &Value) -> crate::Result<()> {
        let layout = self.layout()?;
        let spec = layout.header.spec(field)?;
        self.write_field(layout.header_offset, spec, value)
    }
}

pub(crate) enum Structure {
    Layered(LayerTable),
    Chained(ChainedTable),
}

/// Database configuration, builder-style
///
/// # Examples
///
/// ```
/// # use interlace::{Config, FieldType};
/// # let dir = tempfile::tempdir()?;
/// let mut db = Config::new(dir.path().join("test.db")).create()?;
/// db.create_dataset("node", &[("key", FieldType::Str(16))])?;
/// db.build()?;
/// # Ok::<(), interlace::Error>(())
/// ```
pub struct Config {
    path: PathBuf,
    compression: CompressionType,
}

impl Config {
    /// Starts a configuration for the database file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            compression: CompressionType::None,
        }
    }

    /// Sets the compression applied to blob payloads.
    ///
    /// The choice is recorded in the catalogue, so reopening uses the
    /// codec the file was written with.
    #[must_use]
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Creates a fresh database file, truncating any existing one.
    ///
    /// Declare schemas and structures, then call [`Database::build`].
    pub fn create(self) -> crate::Result<Database> {
        let file = FileIo::create(&self.path)?;

        let core = Arc::new(Core {
            file,
            compression: self.compression,
            layout: OnceLock::new(),
        });

        Ok(Database {
            core,
            catalog: Catalog {
                compression: Some(self.compression),
                ..Catalog::default()
            },
            datasets: FxHashMap::default(),
            arrays: FxHashMap::default(),
            groups: FxHashMap::default(),
            structures: FxHashMap::default(),
            custom_header: Vec::new(),
            header_declared: false,
            next_identifier: FIRST_USER_IDENTIFIER,
            built: false,
        })
    }

    /// Opens an existing database file for reading and writing.
    pub fn open(self) -> crate::Result<Database> {
        Database::open_impl(&self.path, false)
    }

    /// Opens an existing database file read-only.
    ///
    /// Any write surfaces [`crate::Error::ReadOnly`].
    pub fn open_readonly(self) -> crate::Result<Database> {
        Database::open_impl(&self.path, true)
    }
}

/// An embedded, single-file store of typed records, blobs and hash
/// table structures
///
/// See the crate-level docs for the full lifecycle.
pub struct Database {
    core: Arc<Core>,
    catalog: Catalog,
    datasets: FxHashMap<String, Dataset>,
    arrays: FxHashMap<String, Array>,
    groups: FxHashMap<String, Group>,
    structures: FxHashMap<String, Structure>,
    custom_header: Vec<(String, FieldType)>,
    header_declared: bool,
    next_identifier: i8,
    built: bool,
}

impl Database {
    fn check_unbuilt(&self) -> crate::Result<()> {
        if self.built {
            Err(crate::Error::AlreadyBuilt)
        } else {
            Ok(())
        }
    }

    fn check_name_free(&self, name: &str) -> crate::Result<()> {
        if self.datasets.contains_key(name)
            || self.arrays.contains_key(name)
            || self.groups.contains_key(name)
            || self.structures.contains_key(name)
        {
            Err(crate::Error::SchemaExists(name.into()))
        } else {
            Ok(())
        }
    }

    fn take_identifier(&mut self) -> crate::Result<i8> {
        let identifier = self.next_identifier;
        self.next_identifier = self
            .next_identifier
            .checked_add(1)
            .ok_or(crate::Error::CapacityExceeded("schema identifier space"))?;
        Ok(identifier)
    }

    /// Declares a record schema.
    ///
    /// Identifiers are assigned in creation order, starting at 3.
    pub fn create_dataset(
        &mut self,
        name: &str,
        fields: &[(&str, FieldType)],
    ) -> crate::Result<Dataset> {
        self.check_unbuilt()?;
        self.check_name_free(name)?;

        let fields: Vec<(String, FieldType)> = fields
            .iter()
            .map(|(field, ty)| ((*field).to_owned(), *ty))
            .collect();

        let identifier = self.take_identifier()?;
        let schema = Schema::new(name, identifier, fields.clone())?;
        let dataset = Dataset::new(schema, self.core.clone());

        self.catalog.datasets.push(DatasetDef {
            name: name.into(),
            identifier,
            fields,
        });
        self.datasets.insert(name.into(), dataset.clone());

        Ok(dataset)
    }

    /// Declares a typed array schema.
    pub fn create_array(&mut self, name: &str, elem: ElementType) -> crate::Result<Array> {
        self.check_unbuilt()?;
        self.check_name_free(name)?;

        let identifier = self.take_identifier()?;
        let array = Array::new(name.into(), identifier, elem, self.core.clone());

        self.catalog.arrays.push(ArrayDef {
            name: name.into(),
            identifier,
            elem,
        });
        self.arrays.insert(name.into(), array.clone());

        Ok(array)
    }

    /// Declares a group schema: a header record of the given fields,
    /// followed by rows of `entry`.
    pub fn create_group(
        &mut self,
        name: &str,
        entry: &Dataset,
        fields: &[(&str, FieldType)],
    ) -> crate::Result<Group> {
        self.check_unbuilt()?;
        self.check_name_free(name)?;

        let fields: Vec<(String, FieldType)> = fields
            .iter()
            .map(|(field, ty)| ((*field).to_owned(), *ty))
            .collect();

        let identifier = self.take_identifier()?;
        let schema = Schema::new(name, identifier, fields.clone())?;
        let group = Group::new(schema, entry.clone(), self.core.clone());

        self.catalog.groups.push(GroupDef {
            name: name.into(),
            identifier,
            fields,
            entry: entry.name().into(),
        });
        self.groups.insert(name.into(), group.clone());

        Ok(group)
    }

    /// Declares user fields of the header record.
    ///
    /// The header always carries the reserved `_index` allocation
    /// cursor; structures reserve further fields for their roots.
    pub fn create_header(&mut self, fields: &[(&str, FieldType)]) -> crate::Result<()> {
        self.check_unbuilt()?;

        if self.header_declared {
            return Err(crate::Error::SchemaExists("header".into()));
        }

        self.custom_header = fields
            .iter()
            .map(|(field, ty)| ((*field).to_owned(), *ty))
            .collect();
        self.header_declared = true;

        Ok(())
    }

    /// Declares a layered hash table over `dataset`.
    pub fn create_layer_table(
        &mut self,
        name: &str,
        dataset: &Dataset,
        options: LayerTableOptions,
    ) -> crate::Result<LayerTable> {
        self.check_unbuilt()?;
        self.check_name_free(name)?;

        // the key must be a fixed-width field
        let key_spec = dataset.schema().spec(options.key_field())?;
        if key_spec.ty == FieldType::Blob {
            return Err(crate::Error::TypeMismatch(options.key_field().into()));
        }

        let slots = self.create_array(&format!("{name}_tables"), ElementType::U64)?;
        let bloom = self.create_array(&format!("{name}_bloom"), ElementType::Bool)?;

        let def = options.to_def(name, dataset.name());
        let table = LayerTable::new(&def, dataset.clone(), slots, bloom, self.core.clone())?;

        self.catalog.structures.push(def);
        self.structures
            .insert(name.into(), Structure::Layered(table.clone()));

        Ok(table)
    }

    /// Declares a chained layered hash table (a per-key multi-map)
    /// over `dataset`.
    pub fn create_chained_table(
        &mut self,
        name: &str,
        dataset: &Dataset,
        options: ChainedTableOptions,
    ) -> crate::Result<ChainedTable> {
        self.check_unbuilt()?;
        self.check_name_free(name)?;

        let key_spec = dataset.schema().spec(options.key_field())?;
        if key_spec.ty == FieldType::Blob {
            return Err(crate::Error::TypeMismatch(options.key_field().into()));
        }

        let group = self.create_group(
            &format!("{name}_chain"),
            dataset,
            &[
                ("_prev_table", FieldType::U64),
                ("_p", FieldType::U8),
                ("_bloom_filter", FieldType::U64),
            ],
        )?;
        let bloom = self.create_array(&format!("{name}_bloom"), ElementType::Bool)?;

        let def = options.to_def(name, dataset.name());
        let table = ChainedTable::new(&def, group, bloom)?;

        self.catalog.structures.push(def);
        self.structures
            .insert(name.into(), Structure::Chained(table.clone()));

        Ok(table)
    }

    /// Serialises the catalogue, writes the header record and opens the
    /// file for data operations.
    ///
    /// Must be called exactly once on a freshly created database;
    /// reopened files are ready immediately.
    pub fn build(&mut self) -> crate::Result<()> {
        self.check_unbuilt()?;

        self.core.file.begin_transaction();
        let result = self.build_inner();
        self.core.file.end_transaction()?;
        result
    }

    fn build_inner(&mut self) -> crate::Result<()> {
        // compose the header schema: `_index`, structure roots, user fields
        let mut fields: Vec<(String, FieldType)> = vec![("_index".into(), FieldType::U64)];

        for def in &self.catalog.structures {
            match def.kind {
                StructureKind::Layered => {
                    fields.push((format!("{}_tables_block", def.name), FieldType::U64));
                    fields.push((format!("{}_blooms_block", def.name), FieldType::U64));
                }
                StructureKind::Chained => {}
            }
        }

        fields.extend(self.custom_header.iter().cloned());
        self.catalog.header_fields = fields.clone();

        // a duplicate header field fails Schema::new
        let header = Schema::new("header", HEADER_IDENTIFIER, fields)?;

        let bytes = self.catalog.encode_into_vec();
        #[allow(clippy::cast_possible_truncation)]
        let catalog_len = bytes.len() as u32;

        let mut prefix = Vec::with_capacity(4 + bytes.len());
        prefix.extend_from_slice(&catalog_len.to_le_bytes());
        prefix.extend_from_slice(&bytes);

        self.core.file.extend(prefix.len() as u64)?;
        self.core.file.write_at(0, &prefix)?;

        let header_offset = prefix.len() as u64;
        let header_size = header.row_size() as u64;

        self.core.file.extend(header_size)?;
        let mut row = vec![0; header.row_size()];
        row[0] = HEADER_IDENTIFIER.to_le_bytes()[0];
        self.core.file.write_at(header_offset, &row)?;

        let table_start = header_offset + header_size;

        let mut row_sizes = FxHashMap::default();
        for dataset in self.datasets.values() {
            row_sizes.insert(dataset.identifier(), dataset.row_size());
        }
        for group in self.groups.values() {
            row_sizes.insert(group.identifier(), group.header_size());
        }

        self.core.set_layout(Layout {
            header_offset,
            table_start,
            header,
            row_sizes,
        })?;

        // `_index` is the first header field, one byte past the prefix
        let index_slot = header_offset + 1;
        self.core.file.bind_cursor(table_start, Some(index_slot));
        self.core.file.write_at(index_slot, &table_start.to_le_bytes())?;

        self.built = true;

        let names: Vec<String> = self
            .catalog
            .structures
            .iter()
            .map(|def| def.name.clone())
            .collect();

        for name in names {
            match self.structures.get(&name) {
                Some(Structure::Layered(table)) => table.initialize()?,
                Some(Structure::Chained(table)) => table.initialize()?,
                None => return Err(crate::Error::UnknownSchema(name)),
            }
        }

        log::debug!(
            "Built database: catalogue={catalog_len}B, table_start={table_start}",
        );

        Ok(())
    }

    fn open_impl(path: &std::path::Path, read_only: bool) -> crate::Result<Self> {
        let file = FileIo::open(path, read_only)?;

        let head = file.read_at(0, 4)?;
        #[allow(clippy::expect_used)]
        let catalog_len = u32::from_le_bytes(head.try_into().expect("is 4 bytes"));

        let bytes = file.read_at(4, catalog_len as usize)?;
        let catalog = Catalog::decode_from(&mut &bytes[..]).map_err(crate::Error::Decode)?;

        let compression = catalog.compression.unwrap_or(CompressionType::None);

        let core = Arc::new(Core {
            file,
            compression,
            layout: OnceLock::new(),
        });

        let header = Schema::new("header", HEADER_IDENTIFIER, catalog.header_fields.clone())?;
        let header_offset = 4 + u64::from(catalog_len);
        let table_start = header_offset + header.row_size() as u64;

        let mut next_identifier = FIRST_USER_IDENTIFIER;
        let mut row_sizes = FxHashMap::default();

        let mut datasets = FxHashMap::default();
        for def in &catalog.datasets {
            let schema = Schema::new(&def.name, def.identifier, def.fields.clone())?;
            row_sizes.insert(def.identifier, schema.row_size() as u64);
            next_identifier = next_identifier.max(def.identifier.saturating_add(1));
            datasets.insert(
                def.name.clone(),
                Dataset::new(schema, core.clone()),
            );
        }

        let mut arrays = FxHashMap::default();
        for def in &catalog.arrays {
            next_identifier = next_identifier.max(def.identifier.saturating_add(1));
            arrays.insert(
                def.name.clone(),
                Array::new(def.name.clone(), def.identifier, def.elem, core.clone()),
            );
        }

        let mut groups = FxHashMap::default();
        for def in &catalog.groups {
            let entry = datasets
                .get(&def.entry)
                .cloned()
                .ok_or_else(|| crate::Error::UnknownSchema(def.entry.clone()))?;
            let schema = Schema::new(&def.name, def.identifier, def.fields.clone())?;
            row_sizes.insert(def.identifier, schema.row_size() as u64);
            next_identifier = next_identifier.max(def.identifier.saturating_add(1));
            groups.insert(def.name.clone(), Group::new(schema, entry, core.clone()));
        }

        core.set_layout(Layout {
            header_offset,
            table_start,
            header,
            row_sizes,
        })?;

        // recover the allocation cursor from the header
        let index_slot = header_offset + 1;
        let cursor_bytes = core.file.read_at(index_slot, 8)?;
        #[allow(clippy::expect_used)]
        let cursor = u64::from_le_bytes(cursor_bytes.try_into().expect("is 8 bytes"));
        core.file.bind_cursor(cursor, Some(index_slot));

        let mut structures = FxHashMap::default();
        for def in &catalog.structures {
            let dataset = datasets
                .get(&def.dataset)
                .cloned()
                .ok_or_else(|| crate::Error::UnknownSchema(def.dataset.clone()))?;

            match def.kind {
                StructureKind::Layered => {
                    let slots = arrays
                        .get(&format!("{}_tables", def.name))
                        .cloned()
                        .ok_or_else(|| crate::Error::UnknownSchema(def.name.clone()))?;
                    let bloom = arrays
                        .get(&format!("{}_bloom", def.name))
                        .cloned()
                        .ok_or_else(|| crate::Error::UnknownSchema(def.name.clone()))?;

                    let table = LayerTable::new(def, dataset, slots, bloom, core.clone())?;
                    table.initialize()?;
                    structures.insert(def.name.clone(), Structure::Layered(table));
                }
                StructureKind::Chained => {
                    let group = groups
                        .get(&format!("{}_chain", def.name))
                        .cloned()
                        .ok_or_else(|| crate::Error::UnknownSchema(def.name.clone()))?;
                    let bloom = arrays
                        .get(&format!("{}_bloom", def.name))
                        .cloned()
                        .ok_or_else(|| crate::Error::UnknownSchema(def.name.clone()))?;

                    let table = ChainedTable::new(def, group, bloom)?;
                    table.initialize()?;
                    structures.insert(def.name.clone(), Structure::Chained(table));
                }
            }
        }

        log::debug!("Opened database: cursor={cursor}, read_only={read_only}");

        Ok(Self {
            core,
            catalog,
            datasets,
            arrays,
            groups,
            structures,
            custom_header: Vec::new(),
            header_declared: true,
            next_identifier,
            built: true,
        })
    }

    /// Returns the dataset registered under `name`.
    pub fn dataset(&self, name: &str) -> crate::Result<Dataset> {
        self.datasets
            .get(name)
            .cloned()
            .ok_or_else(|| crate::Error::UnknownSchema(name.into()))
    }

    /// Returns the array registered under `name`.
    pub fn array(&self, name: &str) -> crate::Result<Array> {
        self.arrays
            .get(name)
            .cloned()
            .ok_or_else(|| crate::Error::UnknownSchema(name.into()))
    }

    /// Returns the group registered under `name`.
    pub fn group(&self, name: &str) -> crate::Result<Group> {
        self.groups
            .get(name)
            .cloned()
            .ok_or_else(|| crate::Error::UnknownSchema(name.into()))
    }

    /// Returns the layered hash table registered under `name`.
    pub fn layer_table(&self, name: &str) -> crate::Result<LayerTable> {
        match self.structures.get(name) {
            Some(Structure::Layered(table)) => Ok(table.clone()),
            _ => Err(crate::Error::UnknownSchema(name.into())),
        }
    }

    /// Returns the chained hash table registered under `name`.
    pub fn chained_table(&self, name: &str) -> crate::Result<ChainedTable> {
        match self.structures.get(name) {
            Some(Structure::Chained(table)) => Ok(table.clone()),
            _ => Err(crate::Error::UnknownSchema(name.into())),
        }
    }

    /// Reads a header field.
    pub fn header_get(&self, field: &str) -> crate::Result<Value> {
        self.core.header_get(field)
    }

    /// Writes a header field.
    ///
    /// The reserved `_index` field is engine-managed and cannot be
    /// written through this method.
    pub fn header_set(&self, field: &str, value: impl Into<Value>) -> crate::Result<()> {
        if field == "_index" {
            return Err(crate::Error::UnknownField("_index".into()));
        }
        self.core.header_set(field, &value.into())
    }

    /// Appends an opaque blob, returning its handle.
    pub fn append_blob(&self, payload: &[u8]) -> crate::Result<u64> {
        self.core.layout()?;
        self.core.append_blob(payload)
    }

    /// Reads back a blob by handle.
    pub fn get_blob(&self, handle: u64) -> crate::Result<Vec<u8>> {
        self.core.get_blob(handle)
    }

    /// Suppresses per-write flushing until the matching
    /// [`Database::end_transaction`].
    ///
    /// Transactions coalesce flushes; they carry no atomicity
    /// guarantee on crash.
    pub fn begin_transaction(&self) {
        self.core.file.begin_transaction();
    }

    /// Ends the innermost transaction, flushing once at the outermost
    /// level.
    pub fn end_transaction(&self) -> crate::Result<()> {
        self.core.file.end_transaction()
    }

    /// Flushes and closes the database.
    pub fn close(self) -> crate::Result<()> {
        self.core.file.sync()
    }
}
