use std::collections::{BTreeMap, HashMap};

use embedvar_checkpoint::{
    record_name, restore_full, restore_partitioned, BundleReader, FileBundleWriter, RecordKind,
    SnapshotExporter, SAVED_PARTITION_NUM,
};
use embedvar_hash_table::{
    partition_for, EmbeddingConfig, EmbeddingKey, EmbeddingStore, MemoryTieredStore, StoreOptions, UninitializedStore,
};
use embedvar_tensor::{DType, Element, HostTensor};

fn new_store<K: EmbeddingKey, V: Element>(default: Vec<V>) -> EmbeddingStore<K, V> {
    UninitializedStore::primary(EmbeddingConfig::new("var"), StoreOptions::default())
        .unwrap()
        .initialize(&HostTensor::vector(default))
        .unwrap()
}

/// Maps each key to its (values, version).
fn contents<K: EmbeddingKey + Ord, V: Element>(store: &EmbeddingStore<K, V>) -> BTreeMap<K, (Vec<V>, i64)> {
    let snapshot = store.snapshot().unwrap();
    snapshot
        .keys
        .iter()
        .enumerate()
        .map(|(row, key)| {
            let values = snapshot.part(row).unwrap().read().to_vec();
            (key.clone(), (values, snapshot.versions[row]))
        })
        .collect()
}

#[test]
fn five_keys_dump_to_four_records() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("ckpt/model");
    let store = new_store::<i64, f32>(vec![0.0; 8]);
    for key in 0..5i64 {
        let values: Vec<f32> = (0..8).map(|i| (key * 10 + i) as f32).collect();
        store.lookup_or_create(&key, Some(key)).unwrap().copy_from(&values);
    }

    let mut writer = FileBundleWriter::create(&base).unwrap();
    SnapshotExporter::new().dump(&store, "var/part_0", &mut writer).unwrap();
    writer.finish().unwrap();

    let reader = BundleReader::open(&base).unwrap();
    let expected_shapes = [
        ("keys", RecordKind::Keys(i64::KIND), vec![5]),
        ("partition_offset", RecordKind::Tensor(DType::I32), vec![SAVED_PARTITION_NUM + 1]),
        ("values", RecordKind::Tensor(DType::F32), vec![5, 8]),
        ("versions", RecordKind::Tensor(DType::I64), vec![5]),
    ];
    for (suffix, kind, shape) in expected_shapes {
        let (found_kind, found_shape) = reader.lookup_dtype_and_shape(&record_name("var/part_0", suffix)).unwrap();
        assert_eq!(found_kind, kind, "{suffix}");
        assert_eq!(found_shape, &shape[..], "{suffix}");
    }

    let keys: Vec<i64> = reader.read_keys("var/part_0-keys").unwrap();
    let values: Vec<f32> = reader.read_elements("var/part_0-values").unwrap();
    let versions: Vec<i64> = reader.read_elements("var/part_0-versions").unwrap();
    let mut sorted = keys.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![0, 1, 2, 3, 4]);
    for (row, key) in keys.iter().enumerate() {
        assert_eq!(values[row * 8], (key * 10) as f32);
        assert_eq!(values[row * 8 + 7], (key * 10 + 7) as f32);
        assert_eq!(versions[row], *key);
    }
}

#[test]
fn empty_store_dumps_consistent_records() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("empty");
    let store = new_store::<i64, f64>(vec![1.0; 4]);

    let mut writer = FileBundleWriter::create(&base).unwrap();
    let summary = SnapshotExporter::new().dump(&store, "var/part_0", &mut writer).unwrap();
    assert_eq!(summary.keys, 0);
    writer.finish().unwrap();

    let reader = BundleReader::open(&base).unwrap();
    assert_eq!(reader.record_names().count(), 4);
    assert_eq!(reader.verify().unwrap(), 4);
    let offsets: Vec<i32> = reader.read_elements("var/part_0-partition_offset").unwrap();
    assert_eq!(offsets, vec![0; SAVED_PARTITION_NUM + 1]);

    let restored = reader.read_embedding::<i64, f64>("var/part_0").unwrap();
    assert!(restored.is_empty());
    assert_eq!(restored.buffer().value_len(), 4);

    let target = new_store::<i64, f64>(vec![1.0; 4]);
    assert_eq!(restore_full(&reader, "var/part_0", &target).unwrap().total(), 0);
    assert_eq!(target.size().unwrap(), 0);
}

#[test]
fn full_restore_reproduces_every_triple() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("full");
    let source = new_store::<String, f32>(vec![0.0; 3]);
    for i in 0..200 {
        let key = format!("user:{i}");
        source.lookup_or_create(&key, Some(i)).unwrap().copy_from(&[i as f32, -(i as f32), 0.5]);
    }

    let mut writer = FileBundleWriter::create(&base).unwrap();
    SnapshotExporter::new().with_chunk_bytes(128).dump(&source, "users", &mut writer).unwrap();
    writer.finish().unwrap();

    let target = new_store::<String, f32>(vec![0.0; 3]);
    let reader = BundleReader::open(&base).unwrap();
    let summary = restore_full(&reader, "users", &target).unwrap();
    assert_eq!(summary.imported, 200);
    assert_eq!(contents(&source), contents(&target));
}

#[test]
fn restore_keeps_existing_keys() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("dup");
    let source = new_store::<i64, f32>(vec![0.0; 2]);
    for key in 0..4 {
        source.lookup_or_create(&key, Some(1)).unwrap().copy_from(&[1.0, 1.0]);
    }
    let mut writer = FileBundleWriter::create(&base).unwrap();
    SnapshotExporter::new().dump(&source, "v", &mut writer).unwrap();
    writer.finish().unwrap();

    let target = new_store::<i64, f32>(vec![0.0; 2]);
    target.lookup_or_create(&2, Some(50)).unwrap().copy_from(&[2.0, 2.0]);

    let reader = BundleReader::open(&base).unwrap();
    let summary = restore_full(&reader, "v", &target).unwrap();
    assert_eq!((summary.imported, summary.skipped_existing), (3, 1));
    let kept = target.find(&2).unwrap().unwrap();
    assert_eq!(kept.to_vec(), vec![2.0, 2.0]);
    assert_eq!(kept.version(), Some(50));
}

#[test]
fn round_trip_is_independent_of_partition_counts() {
    const BUCKETS: u64 = 16;
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("sharded");

    // Dump from three shards.
    let sources: Vec<_> = (0..3).map(|_| new_store::<i64, f32>(vec![0.0; 4])).collect();
    let mut expected = BTreeMap::new();
    for key in -50i64..250 {
        let shard = partition_for(&key, BUCKETS, 3) as usize;
        let values = vec![key as f32; 4];
        sources[shard].lookup_or_create(&key, Some(key + 1000)).unwrap().copy_from(&values);
        expected.insert(key, (values, key + 1000));
    }
    let mut writer = FileBundleWriter::create(&base).unwrap();
    let refs: Vec<&EmbeddingStore<i64, f32>> = sources.iter().collect();
    let summaries = SnapshotExporter::new().dump_partitions(&refs, "emb", &mut writer).unwrap();
    assert_eq!(summaries.iter().map(|s| s.keys).sum::<usize>(), 300);
    writer.finish().unwrap();

    // Restore into five shards.
    let reader = BundleReader::open(&base).unwrap();
    assert_eq!(reader.partition_prefixes("emb").len(), 3);
    let mut merged = BTreeMap::new();
    let mut owners: HashMap<i64, u64> = HashMap::new();
    for partition in 0..5u64 {
        let target = new_store::<i64, f32>(vec![0.0; 4]);
        let summary = restore_partitioned(&reader, "emb", &target, BUCKETS, partition, 5).unwrap();
        assert_eq!(summary.total(), 300);
        for (key, row) in contents(&target) {
            assert_eq!(partition_for(&key, BUCKETS, 5), partition);
            assert!(owners.insert(key, partition).is_none(), "key {key} restored twice");
            merged.insert(key, row);
        }
    }
    assert_eq!(merged, expected);
}

#[test]
fn partitioned_restore_reads_unsharded_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("flat");
    let source = new_store::<i64, f32>(vec![0.0; 1]);
    for key in 0..10 {
        source.lookup_or_create(&key, Some(key)).unwrap();
    }
    let mut writer = FileBundleWriter::create(&base).unwrap();
    SnapshotExporter::new().dump(&source, "flat", &mut writer).unwrap();
    writer.finish().unwrap();

    let reader = BundleReader::open(&base).unwrap();
    let target = new_store::<i64, f32>(vec![0.0; 1]);
    let summary = restore_partitioned(&reader, "flat", &target, 10, 1, 2).unwrap();
    assert_eq!((summary.imported, summary.skipped_partition), (5, 5));
    assert!(restore_partitioned(&reader, "absent", &target, 10, 0, 1).is_err());
}

#[test]
fn tiered_store_round_trips_through_a_bundle() {
    let tiered = || {
        UninitializedStore::<i64, f32>::primary(EmbeddingConfig::new("var"), StoreOptions::default().with_tiered_storage(None))
            .unwrap()
            .with_tiered_store(Box::new(MemoryTieredStore::new()))
            .initialize(&HostTensor::vector(vec![0.0f32; 3]))
            .unwrap()
    };
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("model");
    let source = tiered();
    for key in [4i64, 17, -2] {
        source.hybrid_insert(&key, &[key as f32; 3]).unwrap();
    }

    let mut writer = FileBundleWriter::create(&base).unwrap();
    let summary = SnapshotExporter::new().dump(&source, "var/part_0", &mut writer).unwrap();
    assert_eq!(summary.keys, 3);
    writer.finish().unwrap();

    let target = tiered();
    let reader = BundleReader::open(&base).unwrap();
    assert_eq!(restore_full(&reader, "var/part_0", &target).unwrap().imported, 3);
    assert_eq!(target.hybrid_size().unwrap(), 3);
    let mut out = [0.0f32; 3];
    for key in [4i64, 17, -2] {
        target.hybrid_lookup_or_create(&key, &mut out, None).unwrap();
        assert_eq!(out, [key as f32; 3]);
    }
}
