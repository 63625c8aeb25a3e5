use std::sync::Arc;

use crossbeam_channel::{select, Receiver, Sender, TryRecvError};

use lodestore_storage::retry::{read_blob_with_retry, write_blob_with_retry, RETRY_DELAYS};
use lodestore_storage::{BlobClient, BlobStore};
use lodestore_types::block_hash::BlockHash;
use lodestore_types::error::{Result, StoreError};

use crate::block::StoredBlock;
use crate::cache::PrefetchCache;
use crate::stats::{StatCounters, StatField};

use super::{
    AccessType, BlockIndexMessage, FlushReply, GetBlockMessage, PrefetchBlockMessage,
    PutBlockMessage, BLOCKS_PREFIX,
};

/// One I/O worker: owns a backend client and drains the put/get/prefetch
/// channels until the put channel closes.
#[allow(clippy::too_many_arguments)]
pub(super) fn run_worker(
    blob_store: Arc<dyn BlobStore>,
    stats: Arc<StatCounters>,
    cache: Arc<PrefetchCache>,
    put_rx: Receiver<PutBlockMessage>,
    get_rx: Receiver<GetBlockMessage>,
    prefetch_rx: Receiver<PrefetchBlockMessage>,
    block_index_tx: Sender<BlockIndexMessage>,
    flush_rx: Receiver<()>,
    flush_reply_tx: Sender<FlushReply>,
    access_type: AccessType,
) -> Result<()> {
    let client = match blob_store.new_client() {
        Ok(client) => client,
        Err(e) => {
            // Keep servicing the channels with errors so callers never hang;
            // the failure itself surfaces when the store is closed.
            return run_error_state(e, &put_rx, &get_rx, &flush_rx, &flush_reply_tx);
        }
    };

    loop {
        // Demand traffic first: puts, then gets.
        match put_rx.try_recv() {
            Ok(msg) => {
                handle_put(client.as_ref(), &stats, &block_index_tx, access_type, msg);
                continue;
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => break,
        }
        if let Ok(msg) = get_rx.try_recv() {
            handle_get(client.as_ref(), &stats, &cache, msg);
            continue;
        }

        // Block for the next message. The prefetch arm is only offered while
        // the cache has memory budget left, throttling warm-ahead without
        // blocking demand traffic.
        if cache.below_memory_budget() {
            select! {
                recv(flush_rx) -> msg => {
                    if msg.is_ok() {
                        cache.flush(&prefetch_rx);
                        let _ = flush_reply_tx.send(Ok(()));
                    }
                }
                recv(put_rx) -> msg => match msg {
                    Ok(msg) => handle_put(client.as_ref(), &stats, &block_index_tx, access_type, msg),
                    Err(_) => break,
                },
                recv(get_rx) -> msg => {
                    if let Ok(msg) = msg {
                        handle_get(client.as_ref(), &stats, &cache, msg);
                    }
                }
                recv(prefetch_rx) -> msg => {
                    if let Ok(msg) = msg {
                        handle_prefetch(client.as_ref(), &stats, &cache, msg);
                    }
                }
            }
        } else {
            select! {
                recv(flush_rx) -> msg => {
                    if msg.is_ok() {
                        cache.flush(&prefetch_rx);
                        let _ = flush_reply_tx.send(Ok(()));
                    }
                }
                recv(put_rx) -> msg => match msg {
                    Ok(msg) => handle_put(client.as_ref(), &stats, &block_index_tx, access_type, msg),
                    Err(_) => break,
                },
                recv(get_rx) -> msg => {
                    if let Ok(msg) = msg {
                        handle_get(client.as_ref(), &stats, &cache, msg);
                    }
                }
            }
        }
    }

    cache.flush(&prefetch_rx);
    Ok(())
}

/// Degraded loop for a worker whose client could not be constructed: every
/// request completes with the construction error until the put channel
/// closes, then the error is returned to the supervisor.
fn run_error_state(
    err: StoreError,
    put_rx: &Receiver<PutBlockMessage>,
    get_rx: &Receiver<GetBlockMessage>,
    flush_rx: &Receiver<()>,
    flush_reply_tx: &Sender<FlushReply>,
) -> Result<()> {
    loop {
        select! {
            recv(flush_rx) -> msg => {
                if msg.is_ok() {
                    let _ = flush_reply_tx.send(Err(err.clone()));
                }
            }
            recv(put_rx) -> msg => match msg {
                Ok(msg) => (msg.on_complete)(Err(err.clone())),
                Err(_) => return Err(err),
            },
            recv(get_rx) -> msg => {
                if let Ok(msg) = msg {
                    (msg.on_complete)(Err(err.clone()));
                }
            }
        }
    }
}

fn handle_put(
    client: &dyn BlobClient,
    stats: &StatCounters,
    block_index_tx: &Sender<BlockIndexMessage>,
    access_type: AccessType,
    msg: PutBlockMessage,
) {
    if !access_type.is_writable() {
        (msg.on_complete)(Err(StoreError::PermissionDenied(
            "put on a read-only block store".into(),
        )));
        return;
    }
    let result = put_stored_block(client, stats, block_index_tx, &msg.block);
    (msg.on_complete)(result);
}

fn put_stored_block(
    client: &dyn BlobClient,
    stats: &StatCounters,
    block_index_tx: &Sender<BlockIndexMessage>,
    block: &StoredBlock,
) -> Result<()> {
    stats.add(StatField::PutStoredBlockCount, 1);

    let key = block.block_hash().storage_key(BLOCKS_PREFIX);
    let mut object = client.new_object(&key)?;
    if !object.exists()? {
        let encoded = block.encode()?;
        match write_blob_with_retry(object.as_mut(), &key, &client.label(), &encoded) {
            Ok(retries) => {
                stats.add(StatField::PutStoredBlockRetryCount, retries);
                stats.add(StatField::PutStoredBlockByteCount, encoded.len() as u64);
                stats.add(
                    StatField::PutStoredBlockChunkCount,
                    u64::from(block.index.chunk_count()),
                );
            }
            Err(e) => {
                stats.add(StatField::PutStoredBlockRetryCount, RETRY_DELAYS.len() as u64);
                stats.add(StatField::PutStoredBlockFailCount, 1);
                return Err(e);
            }
        }
    }

    block_index_tx
        .send(BlockIndexMessage {
            block_index: block.index.clone(),
        })
        .map_err(|_| StoreError::Io("index maintainer is gone".into()))?;
    Ok(())
}

fn handle_get(
    client: &dyn BlobClient,
    stats: &StatCounters,
    cache: &PrefetchCache,
    msg: GetBlockMessage,
) {
    let block_hash = msg.block_hash;
    cache.fetch(block_hash, msg.on_complete, || {
        fetch_stored_block(client, stats, block_hash)
    });
}

fn handle_prefetch(
    client: &dyn BlobClient,
    stats: &StatCounters,
    cache: &PrefetchCache,
    msg: PrefetchBlockMessage,
) {
    let block_hash = msg.block_hash;
    cache.prefetch(block_hash, || fetch_stored_block(client, stats, block_hash));
}

/// Read and validate one block from the backend, with statistics.
pub(super) fn fetch_stored_block(
    client: &dyn BlobClient,
    stats: &StatCounters,
    block_hash: BlockHash,
) -> Result<StoredBlock> {
    stats.add(StatField::GetStoredBlockCount, 1);

    let key = block_hash.storage_key(BLOCKS_PREFIX);
    let (data, retries) = match read_blob_with_retry(client, &key) {
        Ok(read) => read,
        Err(e) => {
            if !e.is_not_found() {
                stats.add(StatField::GetStoredBlockRetryCount, RETRY_DELAYS.len() as u64);
            }
            stats.add(StatField::GetStoredBlockFailCount, 1);
            return Err(e);
        }
    };
    stats.add(StatField::GetStoredBlockRetryCount, retries);

    let block = match StoredBlock::decode(&data) {
        Ok(block) => block,
        Err(e) => {
            stats.add(StatField::GetStoredBlockFailCount, 1);
            return Err(e);
        }
    };
    if block.block_hash() != block_hash {
        stats.add(StatField::GetStoredBlockFailCount, 1);
        return Err(StoreError::BadData(format!(
            "block '{key}' content identifies as {}, not {block_hash}",
            block.block_hash()
        )));
    }

    stats.add(StatField::GetStoredBlockByteCount, data.len() as u64);
    stats.add(
        StatField::GetStoredBlockChunkCount,
        u64::from(block.index.chunk_count()),
    );
    Ok(block)
}
