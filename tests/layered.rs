use interlace::{record, Config, Database, FieldType, LayerTable, LayerTableOptions};
use std::collections::BTreeSet;
use test_log::test;

fn small_table(
    path: &std::path::Path,
    options: LayerTableOptions,
) -> interlace::Result<(Database, LayerTable)> {
    let mut db = Config::new(path).create()?;
    let word = db.create_dataset(
        "word",
        &[("key", FieldType::Str(8)), ("value", FieldType::U64)],
    )?;
    let words = db.create_layer_table("words", &word, options)?;
    db.build()?;
    Ok((db, words))
}

#[test]
fn layered_single_layer() -> interlace::Result<()> {
    let dir = tempfile::tempdir()?;
    let (_db, words) = small_table(
        &dir.path().join("test.db"),
        LayerTableOptions::new("key")
            .p_init(2)
            .probe_factor(1.0)
            .bloom_filters(0),
    )?;

    for (i, key) in ["a", "b", "c"].into_iter().enumerate() {
        words.insert(&record! { "key" => key, "value" => i as u64 })?;
    }

    for (i, key) in ["a", "b", "c"].into_iter().enumerate() {
        assert!(words.contains(key)?);
        assert_eq!(Some(i as u64), words.lookup(key)?.get_u64("value"));
    }

    assert!(!words.contains("d")?);
    assert!(matches!(
        words.lookup("d"),
        Err(interlace::Error::KeyNotFound),
    ));

    Ok(())
}

#[test]
fn layered_growth() -> interlace::Result<()> {
    let dir = tempfile::tempdir()?;
    let (db, words) = small_table(
        &dir.path().join("test.db"),
        LayerTableOptions::new("key")
            .p_init(2)
            .probe_factor(1.0)
            .bloom_filters(0),
    )?;

    let first_layer = words.layer_blocks()[0];
    assert_ne!(0, first_layer);

    db.begin_transaction();
    for i in 0..11_u64 {
        words.insert(&record! { "key" => format!("k{i}"), "value" => i })?;
    }
    db.end_transaction()?;

    // 11 keys cannot fit the initial capacity of 4
    assert!(words.last_layer() >= 3);

    // the first layer stays in place while new ones stack on top
    assert_eq!(first_layer, words.layer_blocks()[0]);

    for i in 0..11_u64 {
        assert_eq!(Some(i), words.lookup(format!("k{i}"))?.get_u64("value"));
    }
    assert!(!words.contains("k11")?);

    Ok(())
}

#[test]
fn layered_overwrite_keeps_one_copy() -> interlace::Result<()> {
    let dir = tempfile::tempdir()?;
    let (db, words) = small_table(
        &dir.path().join("test.db"),
        LayerTableOptions::new("key").p_init(2).bloom_filters(4),
    )?;

    db.begin_transaction();
    for i in 0..40_u64 {
        words.insert(&record! { "key" => "x", "value" => i })?;
        words.insert(&record! { "key" => format!("k{i}"), "value" => i })?;
    }
    db.end_transaction()?;

    assert_eq!(Some(39), words.lookup("x")?.get_u64("value"));

    let copies = words
        .iter()?
        .filter(|row| {
            row.as_ref()
                .is_ok_and(|r| r.get_str("key") == Some("x"))
        })
        .count();
    assert_eq!(1, copies);

    Ok(())
}

#[test]
fn layered_delete_then_reinsert() -> interlace::Result<()> {
    let dir = tempfile::tempdir()?;
    let (_db, words) = small_table(
        &dir.path().join("test.db"),
        LayerTableOptions::new("key").p_init(2).bloom_filters(0),
    )?;

    words.insert(&record! { "key" => "x", "value" => 1_u64 })?;
    words.delete("x")?;

    assert!(!words.contains("x")?);
    assert!(matches!(
        words.lookup("x"),
        Err(interlace::Error::KeyNotFound),
    ));
    assert!(matches!(
        words.delete("x"),
        Err(interlace::Error::KeyNotFound),
    ));

    words.insert(&record! { "key" => "x", "value" => 2_u64 })?;
    assert_eq!(Some(2), words.lookup("x")?.get_u64("value"));

    Ok(())
}

#[test]
fn layered_bloom_never_masks_hits() -> interlace::Result<()> {
    let dir = tempfile::tempdir()?;
    let (db, words) = small_table(
        &dir.path().join("test.db"),
        LayerTableOptions::new("key")
            .p_init(2)
            .probe_factor(0.5)
            .bloom_filters(25)
            .bloom_seed(12),
    )?;

    db.begin_transaction();
    for i in 0..100_u64 {
        words.insert(&record! { "key" => format!("in_{i}"), "value" => i })?;
    }
    db.end_transaction()?;

    for i in 0..100_u64 {
        assert!(words.contains(format!("in_{i}"))?, "lost key in_{i}");
        assert_eq!(Some(i), words.lookup(format!("in_{i}"))?.get_u64("value"));
    }

    // bloom false positives may trigger probes, never false hits
    for i in 0..100_u64 {
        assert!(!words.contains(format!("out_{i}"))?);
    }

    Ok(())
}

#[test]
fn layered_with_cache() -> interlace::Result<()> {
    let dir = tempfile::tempdir()?;
    let (db, words) = small_table(
        &dir.path().join("test.db"),
        LayerTableOptions::new("key")
            .p_init(3)
            .bloom_filters(8)
            .cache_len(64),
    )?;

    db.begin_transaction();
    for i in 0..50_u64 {
        words.insert(&record! { "key" => format!("k{i}"), "value" => i })?;
    }
    db.end_transaction()?;

    // repeated lookups go through the cache
    for _ in 0..2 {
        for i in 0..50_u64 {
            assert_eq!(Some(i), words.lookup(format!("k{i}"))?.get_u64("value"));
        }
    }

    for i in 0..10_u64 {
        words.delete(format!("k{i}"))?;
    }

    for i in 0..10_u64 {
        assert!(!words.contains(format!("k{i}"))?);
    }
    for i in 10..50_u64 {
        assert_eq!(Some(i), words.lookup(format!("k{i}"))?.get_u64("value"));
    }

    Ok(())
}

#[test]
fn layered_iterates_every_live_record() -> interlace::Result<()> {
    let dir = tempfile::tempdir()?;
    let (db, words) = small_table(
        &dir.path().join("test.db"),
        LayerTableOptions::new("key").p_init(2).bloom_filters(8),
    )?;

    db.begin_transaction();
    for i in 0..64_u64 {
        words.insert(&record! { "key" => format!("k{i}"), "value" => i })?;
    }
    for i in 0..8_u64 {
        words.delete(format!("k{i}"))?;
    }
    db.end_transaction()?;

    let keys: BTreeSet<String> = words
        .iter()?
        .map(|row| row.map(|r| r.get_str("key").unwrap_or_default().to_owned()))
        .collect::<interlace::Result<_>>()?;

    let expected: BTreeSet<String> = (8..64).map(|i| format!("k{i}")).collect();
    assert_eq!(expected, keys);

    Ok(())
}

#[test]
fn layered_integer_keys() -> interlace::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut db = Config::new(dir.path().join("test.db")).create()?;
    let node = db.create_dataset(
        "node",
        &[("id", FieldType::U64), ("label", FieldType::Str(12))],
    )?;
    let nodes = db.create_layer_table(
        "nodes",
        &node,
        LayerTableOptions::new("id").p_init(4).bloom_filters(8),
    )?;
    db.build()?;

    db.begin_transaction();
    for i in 0..200_u64 {
        nodes.insert(&record! { "id" => i, "label" => format!("node-{i}") })?;
    }
    db.end_transaction()?;

    assert_eq!(
        Some("node-123"),
        nodes.lookup(123_u64)?.get_str("label"),
    );
    assert!(!nodes.contains(4_096_u64)?);

    Ok(())
}

#[test]
fn layered_random_churn() -> interlace::Result<()> {
    use rand::seq::SliceRandom;

    let dir = tempfile::tempdir()?;
    let (db, words) = small_table(
        &dir.path().join("test.db"),
        LayerTableOptions::new("key")
            .p_init(3)
            .bloom_filters(16)
            .cache_len(32),
    )?;

    let mut keys: Vec<String> = (0..128).map(|_| nanoid::nanoid!(8)).collect();
    keys.sort();
    keys.dedup();

    db.begin_transaction();
    for (i, key) in keys.iter().enumerate() {
        words.insert(&record! { "key" => key.as_str(), "value" => i as u64 })?;
    }
    db.end_transaction()?;

    let mut shuffled = keys.clone();
    shuffled.shuffle(&mut rand::rng());

    for key in &shuffled {
        assert!(words.contains(key.as_str())?);
    }

    Ok(())
}
