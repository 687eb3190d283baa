use embedvar_hash_table::{
    EmbeddingConfig, EmbeddingStore, HashTableError, MemoryTieredStore, RedbTieredStore, RestoreBuffer,
    StoreOptions, TieredStore, UninitializedStore, UNVERSIONED,
};
use embedvar_tensor::HostTensor;

#[test]
fn tiered_store_falls_back_to_default_then_serves_inserted_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("user_emb.redb");
    let store = UninitializedStore::<i64, f64>::primary(
        EmbeddingConfig::new("user_emb"),
        StoreOptions::default().with_tiered_storage(Some(path.clone())),
    )
    .unwrap()
    .initialize(&HostTensor::vector(vec![-1.0f64; 3]))
    .unwrap();
    assert!(store.use_tiered_store());
    assert!(path.exists());

    let mut out = [0.0f64; 3];
    store.hybrid_lookup_or_create(&77, &mut out, None).unwrap();
    assert_eq!(out, [-1.0; 3]);

    store.hybrid_insert(&77, &[1.0, 2.0, 3.0]).unwrap();
    store.hybrid_lookup_or_create(&77, &mut out, None).unwrap();
    assert_eq!(out, [1.0, 2.0, 3.0]);

    // A miss with a caller default uses that default.
    store.hybrid_lookup_or_create(&78, &mut out, Some(&[4.0; 3])).unwrap();
    assert_eq!(out, [4.0; 3]);

    assert_eq!(store.hybrid_size().unwrap(), 1);
    assert_eq!(store.size().unwrap(), 0);
    assert!(store.hybrid_insert(&79, &[1.0]).is_err());
}

#[test]
fn tiered_store_values_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tier.redb");
    let options = StoreOptions::default().with_tiered_storage(Some(path.clone()));
    {
        let store = UninitializedStore::<String, f32>::primary(EmbeddingConfig::new("e"), options.clone())
            .unwrap()
            .initialize(&HostTensor::vector(vec![0.0f32; 2]))
            .unwrap();
        store.hybrid_insert(&"a".to_string(), &[1.0, 2.0]).unwrap();
    }
    let backend = RedbTieredStore::open(&path).unwrap();
    assert_eq!(backend.size().unwrap(), 1);

    let store = UninitializedStore::<String, f32>::primary(EmbeddingConfig::new("e"), options)
        .unwrap()
        .with_tiered_store(Box::new(backend))
        .initialize(&HostTensor::vector(vec![0.0f32; 2]))
        .unwrap();
    let mut out = [0.0f32; 2];
    store.hybrid_lookup_or_create(&"a".to_string(), &mut out, None).unwrap();
    assert_eq!(out, [1.0, 2.0]);
}

#[test]
fn corrupt_tier_value_degrades_to_default() {
    let backend = embedvar_hash_table::MemoryTieredStore::new();
    let mut key = Vec::new();
    embedvar_hash_table::EmbeddingKey::encode(&5i64, &mut key);
    backend.insert(&key, &[1, 2, 3]).unwrap();

    let store = UninitializedStore::<i64, f32>::primary(
        EmbeddingConfig::new("e"),
        StoreOptions::default().with_tiered_storage(None),
    )
    .unwrap()
    .with_tiered_store(Box::new(backend))
    .initialize(&HostTensor::vector(vec![3.0f32; 2]))
    .unwrap();

    let mut out = [0.0f32; 2];
    store.hybrid_lookup_or_create(&5, &mut out, None).unwrap();
    assert_eq!(out, [3.0; 2]);
}

fn memory_tiered(name: &str, default: Vec<f32>) -> EmbeddingStore<i64, f32> {
    UninitializedStore::<i64, f32>::primary(
        EmbeddingConfig::new(name),
        StoreOptions::default().with_tiered_storage(None),
    )
    .unwrap()
    .with_tiered_store(Box::new(MemoryTieredStore::new()))
    .initialize(&HostTensor::vector(default))
    .unwrap()
}

#[test]
fn imported_rows_are_served_from_the_tier() {
    let store = memory_tiered("restored", vec![0.0; 2]);

    let summary = store.import(&[1, 2], &[5.0, 6.0, 7.0, 8.0], &[3, 4]).unwrap();
    assert_eq!(summary.imported, 2);
    assert_eq!(store.hybrid_size().unwrap(), 2);
    assert_eq!(store.size().unwrap(), 0);

    let mut out = [0.0f32; 2];
    store.hybrid_lookup_or_create(&1, &mut out, None).unwrap();
    assert_eq!(out, [5.0, 6.0]);
    store.hybrid_lookup_or_create(&2, &mut out, None).unwrap();
    assert_eq!(out, [7.0, 8.0]);

    // First writer wins against rows already in the tier.
    let again = store.import(&[1, 9], &[0.5, 0.5, 9.0, 9.0], &[0, 0]).unwrap();
    assert_eq!((again.imported, again.skipped_existing), (1, 1));
    store.hybrid_lookup_or_create(&1, &mut out, None).unwrap();
    assert_eq!(out, [5.0, 6.0]);
}

#[test]
fn partitioned_import_writes_only_its_partition_to_the_tier() {
    let store = memory_tiered("sharded", vec![0.0; 1]);
    let buffer = RestoreBuffer::new(vec![0i64, 1, 2, 3], vec![10.0f32, 11.0, 12.0, 13.0], vec![1; 4], 1).unwrap();

    let summary = store.partitioned_import(&buffer, 4, 4, 1, 2).unwrap();
    assert_eq!((summary.imported, summary.skipped_partition), (2, 2));
    assert_eq!(store.hybrid_size().unwrap(), 2);

    let mut out = [0.0f32; 1];
    store.hybrid_lookup_or_create(&3, &mut out, None).unwrap();
    assert_eq!(out, [13.0]);
    store.hybrid_lookup_or_create(&2, &mut out, None).unwrap();
    assert_eq!(out, [0.0]);
}

#[test]
fn snapshot_of_tiered_store_lists_tier_contents() {
    let store = memory_tiered("listed", vec![0.0; 2]);
    store.import(&[1], &[5.0, 6.0], &[3]).unwrap();
    store.hybrid_insert(&2, &[7.0, 8.0]).unwrap();

    let snapshot = store.snapshot().unwrap();
    let mut rows: Vec<(i64, Vec<f32>, i64)> = (0..snapshot.len())
        .map(|row| {
            let values = snapshot.part(row).unwrap().to_vec();
            (snapshot.keys[row], values, snapshot.versions[row])
        })
        .collect();
    rows.sort_by_key(|(key, _, _)| *key);
    assert_eq!(
        rows,
        vec![(1, vec![5.0, 6.0], UNVERSIONED), (2, vec![7.0, 8.0], UNVERSIONED)]
    );
}

#[test]
fn tiered_store_rejects_in_memory_lookups() {
    let store = memory_tiered("exclusive", vec![1.0; 2]);
    assert!(matches!(
        store.lookup_or_create(&1, Some(1)),
        Err(HashTableError::InvalidArgument(_))
    ));
    assert!(matches!(
        store.lookup_value_ptr(&1),
        Err(HashTableError::InvalidArgument(_))
    ));
    assert_eq!(store.size().unwrap(), 0);
    assert_eq!(store.hybrid_size().unwrap(), 0);
}
