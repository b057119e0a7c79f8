use interlace::{
    record, ChainedTableOptions, Config, FieldType, LayerTableOptions, Value,
};
use std::collections::{BTreeMap, BTreeSet};
use test_log::test;

fn tokens(doc: &str) -> BTreeSet<&str> {
    doc.split_whitespace().collect()
}

#[test]
fn reopen_inverted_index() -> interlace::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("index.db");

    let docs = [
        "the quick brown fox",
        "jumped over the lazy dog",
        "the dog sleeps and the fox hunts",
    ];

    // token -> set of documents containing it
    let mut expected: BTreeMap<String, BTreeSet<u32>> = BTreeMap::new();
    for (i, doc) in docs.iter().enumerate() {
        for token in tokens(doc) {
            expected
                .entry(token.to_owned())
                .or_default()
                .insert(i as u32);
        }
    }

    {
        let mut db = Config::new(&path).create()?;

        let word = db.create_dataset(
            "word",
            &[("key", FieldType::Str(16)), ("table", FieldType::U64)],
        )?;
        let words = db.create_layer_table(
            "words",
            &word,
            LayerTableOptions::new("key")
                .p_init(2)
                .probe_factor(0.25)
                .bloom_filters(25)
                .cache_len(1_000),
        )?;

        let entry = db.create_dataset("entry", &[("index", FieldType::U32)])?;
        let entries = db.create_chained_table(
            "entries",
            &entry,
            ChainedTableOptions::new("index")
                .p_init(0)
                .probe_factor(0.25)
                .bloom_filters(25),
        )?;

        db.build()?;

        for (i, doc) in docs.iter().enumerate() {
            db.begin_transaction();
            for token in tokens(doc) {
                let posting = record! { "index" => i as u32 };

                if words.contains(token)? {
                    let row = words.lookup(token)?;
                    let table = row.get_u64("table").unwrap_or_default();
                    let new_table = entries.insert(table, &posting)?;
                    if new_table != table {
                        words.insert(&record! { "key" => token, "table" => new_table })?;
                    }
                } else {
                    let table = entries.insert(entries.new_table()?, &posting)?;
                    words.insert(&record! { "key" => token, "table" => table })?;
                }
            }
            db.end_transaction()?;
        }

        db.close()?;
    }

    // reopen read-only and recover everything
    let db = Config::new(&path).open_readonly()?;
    let words = db.layer_table("words")?;
    let entries = db.chained_table("entries")?;

    let mut recovered: BTreeMap<String, BTreeSet<u32>> = BTreeMap::new();
    for row in words.iter()? {
        let row = row?;
        let token = row.get_str("key").unwrap_or_default().to_owned();
        let table = row.get_u64("table").unwrap_or_default();

        let postings: BTreeSet<u32> = entries
            .iter_field(table, "index")?
            .map(|value| {
                value.map(|v| match v {
                    Value::U32(i) => i,
                    other => panic!("unexpected posting {other:?}"),
                })
            })
            .collect::<interlace::Result<_>>()?;

        recovered.insert(token, postings);
    }

    assert_eq!(expected, recovered);

    // point lookups keep working after reopen
    let row = words.lookup("dog")?;
    let table = row.get_u64("table").unwrap_or_default();
    assert!(entries.contains(table, 1_u32)?);
    assert!(entries.contains(table, 2_u32)?);
    assert!(!entries.contains(table, 0_u32)?);

    // writes are rejected in read-only mode
    assert!(matches!(
        words.insert(&record! { "key" => "new", "table" => 0_u64 }),
        Err(interlace::Error::ReadOnly),
    ));

    Ok(())
}

#[test]
fn reopen_recovers_layer_state() -> interlace::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("test.db");

    let (p_last, blocks, cursor) = {
        let mut db = Config::new(&path).create()?;
        let word = db.create_dataset(
            "word",
            &[("key", FieldType::Str(8)), ("value", FieldType::U64)],
        )?;
        let words = db.create_layer_table(
            "words",
            &word,
            LayerTableOptions::new("key").p_init(2).bloom_filters(25),
        )?;
        db.build()?;

        db.begin_transaction();
        for i in 0..50_u64 {
            words.insert(&record! { "key" => format!("k{i}"), "value" => i })?;
        }
        db.end_transaction()?;

        let cursor = match db.header_get("_index")? {
            Value::U64(n) => n,
            other => panic!("unexpected _index {other:?}"),
        };

        let state = (words.last_layer(), words.layer_blocks(), cursor);
        db.close()?;
        state
    };

    let db = Config::new(&path).open()?;
    let words = db.layer_table("words")?;

    assert_eq!(p_last, words.last_layer());
    assert_eq!(blocks, words.layer_blocks());
    assert_eq!(Value::U64(cursor), db.header_get("_index")?);

    for i in 0..50_u64 {
        assert_eq!(Some(i), words.lookup(format!("k{i}"))?.get_u64("value"));
    }

    // the file stays writable after reopen
    words.insert(&record! { "key" => "fresh", "value" => 99_u64 })?;
    assert_eq!(Some(99), words.lookup("fresh")?.get_u64("value"));

    for i in 0..50_u64 {
        assert_eq!(Some(i), words.lookup(format!("k{i}"))?.get_u64("value"));
    }

    Ok(())
}

#[test]
fn reopen_recovers_blobs_and_header() -> interlace::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("test.db");

    let handle = {
        let mut db = Config::new(&path).create()?;
        let doc = db.create_dataset(
            "doc",
            &[("id", FieldType::U32), ("body", FieldType::Blob)],
        )?;
        db.create_header(&[("n_docs", FieldType::U64)])?;
        db.build()?;

        let block = doc.new_block(4)?;
        doc.set(block, 0, &record! { "id" => 7_u32, "body" => b"stored body".to_vec() })?;

        db.header_set("n_docs", 1_u64)?;
        let handle = db.append_blob(b"loose blob")?;
        db.close()?;
        (block, handle)
    };

    let (block, handle) = handle;

    let db = Config::new(&path).open_readonly()?;
    let doc = db.dataset("doc")?;

    assert_eq!(Value::U64(1), db.header_get("n_docs")?);
    assert_eq!(b"loose blob".to_vec(), db.get_blob(handle)?);

    let row = doc.get(block, 0)?;
    assert_eq!(Some(7), row.get_u32("id"));
    assert_eq!(Some(&b"stored body"[..]), row.get_blob("body"));

    Ok(())
}

#[cfg(feature = "lz4")]
#[test]
fn reopen_compressed_blobs() -> interlace::Result<()> {
    use interlace::CompressionType;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("test.db");

    let handle = {
        let mut db = Config::new(&path)
            .compression(CompressionType::Lz4)
            .create()?;
        db.create_dataset("doc", &[("id", FieldType::U32)])?;
        db.build()?;

        let handle = db.append_blob(&b"compress me ".repeat(100))?;
        db.close()?;
        handle
    };

    // the codec is recorded in the catalogue, not re-declared
    let db = Config::new(&path).open_readonly()?;
    assert_eq!(b"compress me ".repeat(100), db.get_blob(handle)?);

    Ok(())
}
