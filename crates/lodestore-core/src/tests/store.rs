use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;

use lodestore_storage::BlobStore;
use lodestore_types::block_hash::{BlockHash, ChunkHash};
use lodestore_types::error::{Result, StoreError};

use crate::block::StoredBlock;
use crate::stats::StatField;
use crate::store::{AccessType, RemoteBlockStore, RemoteStoreOptions};
use crate::store_index::{StoreIndex, STORE_INDEX_KEY};
use crate::testutil::MemoryBlobStore;

fn options(access_type: AccessType) -> RemoteStoreOptions {
    RemoteStoreOptions {
        optional_store_index_path: None,
        worker_count: 2,
        access_type,
        max_prefetch_memory: 64 * 1024 * 1024,
    }
}

fn open_store(backend: &Arc<MemoryBlobStore>, access_type: AccessType) -> RemoteBlockStore {
    let blob_store: Arc<dyn BlobStore> = backend.clone();
    RemoteBlockStore::new(blob_store, options(access_type)).unwrap()
}

/// Block whose chunk hashes are derived from its block hash.
fn test_block(hash: u64, chunk_count: u64, payload_len: usize) -> StoredBlock {
    let chunks = (0..chunk_count).map(|i| ChunkHash(hash * 100 + i)).collect();
    StoredBlock::new(BlockHash(hash), chunks, vec![hash as u8; payload_len])
}

fn put_sync(store: &RemoteBlockStore, block: StoredBlock) -> Result<()> {
    let (tx, rx) = bounded(1);
    store.put_stored_block(
        block,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    rx.recv().unwrap()
}

fn get_sync(store: &RemoteBlockStore, hash: BlockHash) -> Result<StoredBlock> {
    let (tx, rx) = bounded(1);
    store.get_stored_block(
        hash,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    rx.recv().unwrap()
}

fn flush_sync(store: &RemoteBlockStore) -> Result<()> {
    let (tx, rx) = bounded(1);
    store.flush(Box::new(move |result| {
        let _ = tx.send(result);
    }));
    rx.recv().unwrap()
}

fn preflight_sync(store: &RemoteBlockStore, hashes: Vec<BlockHash>) -> Result<Vec<BlockHash>> {
    let (tx, rx) = bounded(1);
    store.preflight_get(
        hashes,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    rx.recv().unwrap()
}

fn existing_sync(
    store: &RemoteBlockStore,
    chunks: Vec<ChunkHash>,
    min_usage: u32,
) -> Result<StoreIndex> {
    let (tx, rx) = bounded(1);
    store.get_existing_content(
        chunks,
        min_usage,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    rx.recv().unwrap()
}

fn persisted_index(backend: &Arc<MemoryBlobStore>) -> StoreIndex {
    let client = backend.new_client().unwrap();
    let data = client.new_object(STORE_INDEX_KEY).unwrap().read().unwrap();
    StoreIndex::decode(&data).unwrap()
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn put_then_get_roundtrip() {
    let backend = Arc::new(MemoryBlobStore::new());
    let store = open_store(&backend, AccessType::ReadWrite);

    let block = test_block(0x11, 3, 4096);
    put_sync(&store, block.clone()).unwrap();

    let fetched = get_sync(&store, BlockHash(0x11)).unwrap();
    assert_eq!(fetched, block);

    let stats = store.get_stats();
    assert_eq!(stats.get(StatField::PutStoredBlockCount), 1);
    assert_eq!(stats.get(StatField::PutStoredBlockChunkCount), 3);
    assert_eq!(stats.get(StatField::GetStoredBlockCount), 1);
    assert_eq!(stats.get(StatField::GetStoredBlockChunkCount), 3);
    assert_eq!(stats.get(StatField::GetStoredBlockFailCount), 0);

    store.close().unwrap();
}

#[test]
fn put_twice_writes_backend_once() {
    let backend = Arc::new(MemoryBlobStore::new());
    let store = open_store(&backend, AccessType::ReadWrite);

    let block = test_block(0x22, 2, 512);
    put_sync(&store, block.clone()).unwrap();
    put_sync(&store, block.clone()).unwrap();

    let stats = store.get_stats();
    assert_eq!(stats.get(StatField::PutStoredBlockCount), 2);
    // The second put saw the object and skipped the write.
    assert_eq!(
        stats.get(StatField::PutStoredBlockByteCount),
        block.encode().unwrap().len() as u64
    );
    store.close().unwrap();
}

#[test]
fn readonly_put_is_denied_without_backend_write() {
    let backend = Arc::new(MemoryBlobStore::new());
    let store = open_store(&backend, AccessType::ReadOnly);

    let err = put_sync(&store, test_block(0x33, 1, 64)).unwrap_err();
    assert!(matches!(err, StoreError::PermissionDenied(_)));
    store.close().unwrap();

    let client = backend.new_client().unwrap();
    assert!(client.list().unwrap().is_empty());
}

#[test]
fn get_missing_block_is_not_found() {
    let backend = Arc::new(MemoryBlobStore::new());
    let store = open_store(&backend, AccessType::ReadWrite);

    let err = get_sync(&store, BlockHash(0x44)).unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(store.get_stats().get(StatField::GetStoredBlockFailCount), 1);
    store.close().unwrap();
}

#[test]
fn corrupted_block_fails_with_bad_data() {
    let backend = Arc::new(MemoryBlobStore::new());
    let store = open_store(&backend, AccessType::ReadWrite);

    let block = test_block(0x55, 2, 256);
    put_sync(&store, block).unwrap();

    // Overwrite the object with a block whose internal hash differs.
    let impostor = test_block(0x56, 2, 256);
    backend.inject(
        &BlockHash(0x55).storage_key("chunks"),
        impostor.encode().unwrap(),
    );

    let err = get_sync(&store, BlockHash(0x55)).unwrap_err();
    assert!(matches!(err, StoreError::BadData(_)));
    assert_eq!(store.get_stats().get(StatField::GetStoredBlockFailCount), 1);
    store.close().unwrap();
}

#[test]
fn flush_persists_every_prior_put() {
    let backend = Arc::new(MemoryBlobStore::new());
    let store = open_store(&backend, AccessType::ReadWrite);

    for hash in [1u64, 2, 3, 4, 5] {
        put_sync(&store, test_block(hash, 2, 128)).unwrap();
    }
    flush_sync(&store).unwrap();

    let index = persisted_index(&backend);
    assert_eq!(index.len(), 5);
    for hash in [1u64, 2, 3, 4, 5] {
        assert!(index.contains_block(BlockHash(hash)));
    }
    store.close().unwrap();
}

#[test]
fn close_persists_outstanding_block_indexes() {
    let backend = Arc::new(MemoryBlobStore::new());
    let store = open_store(&backend, AccessType::ReadWrite);

    put_sync(&store, test_block(0x66, 1, 64)).unwrap();
    store.close().unwrap();

    let index = persisted_index(&backend);
    assert!(index.contains_block(BlockHash(0x66)));
}

#[test]
fn existing_content_reflects_submitted_blocks() {
    let backend = Arc::new(MemoryBlobStore::new());
    let store = open_store(&backend, AccessType::ReadWrite);

    let block = test_block(0x77, 3, 128);
    let chunks = block.index.chunk_hashes.clone();
    put_sync(&store, block).unwrap();

    let subset = existing_sync(&store, chunks, 0).unwrap();
    assert!(subset.contains_block(BlockHash(0x77)));
    store.close().unwrap();
}

#[test]
fn concurrent_writers_converge_via_cas() {
    let backend = Arc::new(MemoryBlobStore::new());
    let store_a = open_store(&backend, AccessType::ReadWrite);
    let store_b = open_store(&backend, AccessType::ReadWrite);

    put_sync(&store_a, test_block(0xa1, 2, 64)).unwrap();
    put_sync(&store_a, test_block(0xa2, 2, 64)).unwrap();
    put_sync(&store_b, test_block(0xb1, 2, 64)).unwrap();
    put_sync(&store_b, test_block(0xb2, 2, 64)).unwrap();

    flush_sync(&store_a).unwrap();
    flush_sync(&store_b).unwrap();
    store_a.close().unwrap();
    store_b.close().unwrap();

    let index = persisted_index(&backend);
    let mut hashes = index.block_hashes();
    hashes.sort();
    assert_eq!(
        hashes,
        vec![
            BlockHash(0xa1),
            BlockHash(0xa2),
            BlockHash(0xb1),
            BlockHash(0xb2)
        ]
    );
}

#[test]
fn preflight_warms_cache_for_later_get() {
    let backend = Arc::new(MemoryBlobStore::new());
    let writer = open_store(&backend, AccessType::ReadWrite);
    put_sync(&writer, test_block(0x88, 2, 1024)).unwrap();
    flush_sync(&writer).unwrap();
    writer.close().unwrap();

    let reader = open_store(&backend, AccessType::ReadOnly);
    let announced = preflight_sync(&reader, vec![BlockHash(0x88)]).unwrap();
    assert_eq!(announced, vec![BlockHash(0x88)]);

    // The warm-ahead read happens on a worker; wait for it to land.
    let key = BlockHash(0x88).storage_key("chunks");
    assert!(wait_until(Duration::from_secs(5), || {
        backend.reads_of(&key) == 1
    }));

    let reads_before_get = backend.reads_of(&key);
    let block = get_sync(&reader, BlockHash(0x88)).unwrap();
    assert_eq!(block.block_hash(), BlockHash(0x88));
    // The get was served from the cache, not the backend.
    assert_eq!(backend.reads_of(&key), reads_before_get);
    reader.close().unwrap();
}

#[test]
fn init_access_persists_index_without_rebuilding() {
    let backend = Arc::new(MemoryBlobStore::new());
    // Seed a stray block object; Init must not scan it.
    let stray = test_block(0x99, 1, 64);
    backend.inject(
        &BlockHash(0x99).storage_key("chunks"),
        stray.encode().unwrap(),
    );

    let store = open_store(&backend, AccessType::Init);
    // First query triggers the bootstrap with an empty index.
    let subset = existing_sync(&store, vec![ChunkHash(0x9900)], 0).unwrap();
    assert!(subset.is_empty());
    flush_sync(&store).unwrap();
    store.close().unwrap();

    let index = persisted_index(&backend);
    assert!(index.is_empty());
}

#[test]
fn missing_index_rebuilds_from_block_listing() {
    let backend = Arc::new(MemoryBlobStore::new());
    let writer = open_store(&backend, AccessType::ReadWrite);
    let mut all_chunks = Vec::new();
    for hash in 1u64..=10 {
        let block = test_block(hash, 3, 128);
        all_chunks.extend(block.index.chunk_hashes.clone());
        put_sync(&writer, block).unwrap();
    }
    flush_sync(&writer).unwrap();
    writer.close().unwrap();

    // Lose the persisted index; a writable open must rebuild it.
    backend.remove(STORE_INDEX_KEY);

    let store = open_store(&backend, AccessType::ReadWrite);
    let subset = existing_sync(&store, all_chunks, 0).unwrap();
    assert_eq!(subset.len(), 10);
    store.close().unwrap();

    // The rebuild also re-persisted the index.
    assert_eq!(persisted_index(&backend).len(), 10);
}

#[test]
fn rebuild_drops_blocks_stored_under_wrong_key() {
    let backend = Arc::new(MemoryBlobStore::new());
    let honest = test_block(0x0a, 2, 128);
    backend.inject(
        &BlockHash(0x0a).storage_key("chunks"),
        honest.encode().unwrap(),
    );
    // Content says 0x0b, key says 0x0c.
    let liar = test_block(0x0b, 2, 128);
    backend.inject(
        &BlockHash(0x0c).storage_key("chunks"),
        liar.encode().unwrap(),
    );

    let store = open_store(&backend, AccessType::ReadWrite);
    let subset = existing_sync(
        &store,
        vec![ChunkHash(0x0a * 100), ChunkHash(0x0b * 100)],
        0,
    )
    .unwrap();
    assert!(subset.contains_block(BlockHash(0x0a)));
    assert!(!subset.contains_block(BlockHash(0x0b)));
    assert!(!subset.contains_block(BlockHash(0x0c)));
    store.close().unwrap();
}

#[test]
fn readonly_missing_index_acts_as_empty_store() {
    let backend = Arc::new(MemoryBlobStore::new());
    let store = open_store(&backend, AccessType::ReadOnly);
    let subset = existing_sync(&store, vec![ChunkHash(1)], 0).unwrap();
    assert!(subset.is_empty());
    store.close().unwrap();

    // ReadOnly never persisted anything.
    let client = backend.new_client().unwrap();
    assert!(client.list().unwrap().is_empty());
}

#[test]
fn readonly_prefers_local_index_file() {
    let backend = Arc::new(MemoryBlobStore::new());
    // Remote index knows nothing; local file knows one block.
    let local = StoreIndex::from_blocks(vec![test_block(0xcc, 2, 64).index]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.lsi");
    std::fs::write(&path, local.encode().unwrap()).unwrap();

    let blob_store: Arc<dyn BlobStore> = backend.clone();
    let store = RemoteBlockStore::new(
        blob_store,
        RemoteStoreOptions {
            optional_store_index_path: Some(path.to_string_lossy().to_string()),
            worker_count: 2,
            access_type: AccessType::ReadOnly,
            max_prefetch_memory: 64 * 1024 * 1024,
        },
    )
    .unwrap();

    let subset = existing_sync(&store, vec![ChunkHash(0xcc * 100)], 0).unwrap();
    assert!(subset.contains_block(BlockHash(0xcc)));
    store.close().unwrap();
}

#[test]
fn flush_on_idle_store_is_clean() {
    let backend = Arc::new(MemoryBlobStore::new());
    let store = open_store(&backend, AccessType::ReadWrite);
    flush_sync(&store).unwrap();
    flush_sync(&store).unwrap();
    store.close().unwrap();
}

#[test]
fn zero_workers_is_rejected() {
    let backend = Arc::new(MemoryBlobStore::new());
    let blob_store: Arc<dyn BlobStore> = backend;
    let err = RemoteBlockStore::new(
        blob_store,
        RemoteStoreOptions {
            worker_count: 0,
            ..RemoteStoreOptions::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, StoreError::InvalidArgument(_)));
}
