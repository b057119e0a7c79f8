use interlace::{record, ChainedTable, ChainedTableOptions, Config, Database, FieldType, Value};
use std::collections::BTreeSet;
use test_log::test;

fn fanout_table(
    path: &std::path::Path,
    options: ChainedTableOptions,
) -> interlace::Result<(Database, ChainedTable)> {
    let mut db = Config::new(path).create()?;
    let entry = db.create_dataset("entry", &[("node", FieldType::Str(16))])?;
    let entries = db.create_chained_table("entries", &entry, options)?;
    db.build()?;
    Ok((db, entries))
}

#[test]
fn chained_fanout_thousand_entries() -> interlace::Result<()> {
    let dir = tempfile::tempdir()?;
    let (db, entries) = fanout_table(
        &dir.path().join("test.db"),
        ChainedTableOptions::new("node")
            .p_init(0)
            .probe_factor(0.25)
            .bloom_filters(25)
            .bloom_seed(12),
    )?;

    db.begin_transaction();
    let mut table = entries.new_table()?;
    for i in 0..1_000_u64 {
        table = entries.insert(table, &record! { "node" => format!("u_{i}") })?;
    }
    db.end_transaction()?;

    assert_eq!(
        Some("u_500"),
        entries.lookup(table, "u_500")?.get_str("node"),
    );
    assert!(entries.contains(table, "u_0")?);
    assert!(!entries.contains(table, "u_1000")?);
    assert!(matches!(
        entries.lookup(table, "v_0"),
        Err(interlace::Error::KeyNotFound),
    ));

    let nodes: BTreeSet<String> = entries
        .iter_field(table, "node")?
        .map(|value| {
            value.map(|v| match v {
                Value::Str(s) => s,
                other => panic!("unexpected value {other:?}"),
            })
        })
        .collect::<interlace::Result<_>>()?;

    assert_eq!(1_000, nodes.len());
    assert!(nodes.contains("u_0"));
    assert!(nodes.contains("u_999"));

    Ok(())
}

#[test]
fn chained_insert_is_idempotent() -> interlace::Result<()> {
    let dir = tempfile::tempdir()?;
    let (db, entries) = fanout_table(
        &dir.path().join("test.db"),
        ChainedTableOptions::new("node").bloom_filters(25),
    )?;

    db.begin_transaction();
    let mut table = entries.new_table()?;
    for i in 0..200_u64 {
        table = entries.insert(table, &record! { "node" => format!("u_{i}") })?;
    }

    // a second round of the same keys neither grows nor duplicates
    let head = table;
    for i in 0..200_u64 {
        table = entries.insert(table, &record! { "node" => format!("u_{i}") })?;
        assert_eq!(head, table);
    }
    db.end_transaction()?;

    let count = entries.iter(table)?.count();
    assert_eq!(200, count);

    Ok(())
}

#[test]
fn chained_layers_strictly_decrease() -> interlace::Result<()> {
    let dir = tempfile::tempdir()?;
    let (db, entries) = fanout_table(
        &dir.path().join("test.db"),
        ChainedTableOptions::new("node").bloom_filters(25),
    )?;

    db.begin_transaction();
    let mut table = entries.new_table()?;
    for i in 0..500_u64 {
        table = entries.insert(table, &record! { "node" => format!("u_{i}") })?;
    }
    db.end_transaction()?;

    let chain = entries.chain(table)?;
    assert!(chain.len() > 1);

    // `_p` strictly decreases walking head to tail, ending at the root
    for pair in chain.windows(2) {
        assert!(pair[0].1 > pair[1].1, "chain is not monotonic: {chain:?}");
    }

    Ok(())
}

#[test]
fn chained_without_bloom_filters() -> interlace::Result<()> {
    let dir = tempfile::tempdir()?;
    let (db, entries) = fanout_table(
        &dir.path().join("test.db"),
        ChainedTableOptions::new("node").bloom_filters(0),
    )?;

    db.begin_transaction();
    let mut table = entries.new_table()?;
    for i in 0..100_u64 {
        table = entries.insert(table, &record! { "node" => format!("u_{i}") })?;
    }
    db.end_transaction()?;

    for i in 0..100_u64 {
        assert!(entries.contains(table, format!("u_{i}"))?);
    }
    assert_eq!(100, entries.iter(table)?.count());

    Ok(())
}

#[test]
fn chained_independent_chains() -> interlace::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut db = Config::new(dir.path().join("test.db")).create()?;
    let entry = db.create_dataset("entry", &[("index", FieldType::U32)])?;
    let entries = db.create_chained_table(
        "entries",
        &entry,
        ChainedTableOptions::new("index").p_init(2).bloom_filters(10),
    )?;
    db.build()?;

    db.begin_transaction();
    let mut evens = entries.new_table()?;
    let mut odds = entries.new_table()?;
    for i in 0..50_u32 {
        evens = entries.insert(evens, &record! { "index" => i * 2 })?;
        odds = entries.insert(odds, &record! { "index" => i * 2 + 1 })?;
    }
    db.end_transaction()?;

    assert!(entries.contains(evens, 42_u32)?);
    assert!(!entries.contains(evens, 43_u32)?);
    assert!(entries.contains(odds, 43_u32)?);

    let odd_sum: u32 = entries
        .iter_field(odds, "index")?
        .map(|value| {
            value.map(|v| match v {
                Value::U32(n) => n,
                other => panic!("unexpected value {other:?}"),
            })
        })
        .sum::<interlace::Result<u32>>()?;
    assert_eq!((0..100).filter(|n| n % 2 == 1).sum::<u32>(), odd_sum);

    Ok(())
}

#[test]
fn chained_with_metadata_cache() -> interlace::Result<()> {
    let dir = tempfile::tempdir()?;
    let (db, entries) = fanout_table(
        &dir.path().join("test.db"),
        ChainedTableOptions::new("node")
            .bloom_filters(25)
            .cache_len(256),
    )?;

    db.begin_transaction();
    let mut table = entries.new_table()?;
    for i in 0..300_u64 {
        table = entries.insert(table, &record! { "node" => format!("u_{i}") })?;
    }
    db.end_transaction()?;

    for i in (0..300_u64).rev() {
        assert!(entries.contains(table, format!("u_{i}"))?);
    }

    Ok(())
}
