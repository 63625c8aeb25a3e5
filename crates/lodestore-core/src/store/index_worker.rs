use std::sync::Arc;

use crossbeam_channel::{select, Receiver, Sender, TryRecvError};
use tracing::{debug, info, warn};

use lodestore_storage::retry::read_blob_with_retry;
use lodestore_storage::{read_from_uri, BlobClient, BlobStore};
use lodestore_types::block_hash::BLOCK_EXTENSION;
use lodestore_types::error::{Result, StoreError};

use crate::block::{BlockIndex, StoredBlock};
use crate::store_index::{StoreIndex, STORE_INDEX_KEY};

use super::{
    AccessType, BlockIndexMessage, ExistingContentMessage, FlushReply, PrefetchBlockMessage,
    PreflightGetMessage, BLOCKS_PREFIX,
};

/// Single actor owning the authoritative in-memory store index.
///
/// The index is loaded lazily on the first preflight or existing-content
/// query; block-index submissions batch up in `added` and are merged on
/// flush (or on the next query), then persisted via optimistic CAS.
pub(super) struct IndexWorker {
    pub blob_store: Arc<dyn BlobStore>,
    pub optional_store_index_path: Option<String>,
    pub access_type: AccessType,
    pub worker_count: usize,
    pub prefetch_tx: Sender<PrefetchBlockMessage>,
    pub preflight_rx: Receiver<PreflightGetMessage>,
    pub block_index_rx: Receiver<BlockIndexMessage>,
    pub existing_rx: Receiver<ExistingContentMessage>,
    pub flush_rx: Receiver<()>,
    pub flush_reply_tx: Sender<FlushReply>,
}

impl IndexWorker {
    pub(super) fn run(self) -> Result<()> {
        let client = match self.blob_store.new_client() {
            Ok(client) => client,
            Err(e) => {
                self.reply_error_state(&e);
                return Err(e);
            }
        };

        let mut store_index: Option<StoreIndex> = None;
        let mut added: Vec<BlockIndex> = Vec::new();
        let mut save_pending = false;

        let mut run = true;
        while run {
            // Drain immediately available work before blocking.
            if let Ok(msg) = self.preflight_rx.try_recv() {
                match self.handle_preflight(client.as_ref(), &mut store_index, &mut added, &mut save_pending, msg) {
                    Ok(()) => continue,
                    Err(e) => {
                        self.reply_error_state(&e);
                        return Err(e);
                    }
                }
            }
            match self.block_index_rx.try_recv() {
                Ok(msg) => {
                    added.push(msg.block_index);
                    continue;
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => break,
            }
            if let Ok(msg) = self.existing_rx.try_recv() {
                match self.handle_existing(client.as_ref(), &mut store_index, &mut added, &mut save_pending, msg) {
                    Ok(()) => continue,
                    Err(e) => {
                        self.reply_error_state(&e);
                        return Err(e);
                    }
                }
            }

            select! {
                recv(self.flush_rx) -> msg => {
                    if msg.is_ok() {
                        self.handle_flush(client.as_ref(), &mut store_index, &mut added, &mut save_pending);
                    }
                }
                recv(self.preflight_rx) -> msg => {
                    if let Ok(msg) = msg {
                        if let Err(e) = self.handle_preflight(client.as_ref(), &mut store_index, &mut added, &mut save_pending, msg) {
                            self.reply_error_state(&e);
                            return Err(e);
                        }
                    }
                }
                recv(self.block_index_rx) -> msg => match msg {
                    Ok(msg) => added.push(msg.block_index),
                    Err(_) => run = false,
                },
                recv(self.existing_rx) -> msg => {
                    if let Ok(msg) = msg {
                        if let Err(e) = self.handle_existing(client.as_ref(), &mut store_index, &mut added, &mut save_pending, msg) {
                            self.reply_error_state(&e);
                            return Err(e);
                        }
                    }
                }
            }
        }

        // Block-index channel closed: final merge + persist for writable stores.
        if self.access_type.is_writable() {
            if !added.is_empty() {
                let base = store_index.take().unwrap_or_default();
                store_index = Some(StoreIndex::merge(&StoreIndex::from_blocks(added), &base));
                save_pending = true;
            }
            if save_pending {
                if let Some(index) = &store_index {
                    update_remote_index(client.as_ref(), index)?;
                }
            }
        }
        Ok(())
    }

    /// Degraded loop after a fatal error: callers receive the error, flush
    /// never hangs, and the loop ends when the block-index channel closes.
    fn reply_error_state(&self, err: &StoreError) {
        loop {
            select! {
                recv(self.flush_rx) -> msg => {
                    if msg.is_ok() {
                        let _ = self.flush_reply_tx.send(Ok(()));
                    }
                }
                recv(self.preflight_rx) -> msg => {
                    if let Ok(msg) = msg {
                        (msg.on_complete)(Err(err.clone()));
                    }
                }
                recv(self.block_index_rx) -> msg => {
                    if msg.is_err() {
                        return;
                    }
                }
                recv(self.existing_rx) -> msg => {
                    if let Ok(msg) = msg {
                        (msg.on_complete)(Err(err.clone()));
                    }
                }
            }
        }
    }

    fn handle_preflight(
        &self,
        client: &dyn BlobClient,
        store_index: &mut Option<StoreIndex>,
        added: &mut Vec<BlockIndex>,
        save_pending: &mut bool,
        msg: PreflightGetMessage,
    ) -> Result<()> {
        if let Err(e) = self.ensure_index(client, store_index, added, save_pending) {
            (msg.on_complete)(Err(e.clone()));
            return Err(e);
        }
        for block_hash in &msg.block_hashes {
            let _ = self.prefetch_tx.send(PrefetchBlockMessage {
                block_hash: *block_hash,
            });
        }
        (msg.on_complete)(Ok(msg.block_hashes));
        Ok(())
    }

    fn handle_existing(
        &self,
        client: &dyn BlobClient,
        store_index: &mut Option<StoreIndex>,
        added: &mut Vec<BlockIndex>,
        save_pending: &mut bool,
        msg: ExistingContentMessage,
    ) -> Result<()> {
        if let Err(e) = self.ensure_index(client, store_index, added, save_pending) {
            (msg.on_complete)(Err(e.clone()));
            return Err(e);
        }
        let subset = store_index
            .as_ref()
            .map(|index| index.existing_subset(&msg.chunk_hashes, msg.min_block_usage_percent))
            .unwrap_or_default();
        (msg.on_complete)(Ok(subset));
        Ok(())
    }

    fn handle_flush(
        &self,
        client: &dyn BlobClient,
        store_index: &mut Option<StoreIndex>,
        added: &mut Vec<BlockIndex>,
        save_pending: &mut bool,
    ) {
        if self.access_type.is_writable() && !added.is_empty() {
            let base = store_index.take().unwrap_or_default();
            *store_index = Some(StoreIndex::merge(
                &StoreIndex::from_blocks(added.drain(..)),
                &base,
            ));
            *save_pending = true;
        }
        if *save_pending && self.access_type.is_writable() {
            if let Some(index) = &*store_index {
                match update_remote_index(client, index) {
                    Ok(merged) => {
                        *store_index = Some(merged);
                        *save_pending = false;
                    }
                    Err(e) => {
                        let _ = self.flush_reply_tx.send(Err(e));
                        return;
                    }
                }
            }
        }
        let _ = self.flush_reply_tx.send(Ok(()));
    }

    /// Load the store index if it has not been loaded yet, then fold any
    /// batched block-index submissions into it.
    fn ensure_index(
        &self,
        client: &dyn BlobClient,
        store_index: &mut Option<StoreIndex>,
        added: &mut Vec<BlockIndex>,
        save_pending: &mut bool,
    ) -> Result<()> {
        if store_index.is_none() {
            *store_index = Some(self.bootstrap_index(client, save_pending)?);
        }
        if !added.is_empty() {
            let base = store_index.take().unwrap_or_default();
            *store_index = Some(StoreIndex::merge(
                &StoreIndex::from_blocks(added.drain(..)),
                &base,
            ));
            *save_pending = true;
        }
        Ok(())
    }

    /// First-touch index load: empty for Init, an optional local file or the
    /// persisted remote object otherwise, and for writable stores a rebuild
    /// from the block listing when nothing persisted exists.
    fn bootstrap_index(&self, client: &dyn BlobClient, save_pending: &mut bool) -> Result<StoreIndex> {
        if self.access_type == AccessType::Init {
            *save_pending = true;
            return Ok(StoreIndex::new());
        }

        if self.access_type == AccessType::ReadOnly {
            if let Some(path) = &self.optional_store_index_path {
                match read_from_uri(path).and_then(|data| StoreIndex::decode(&data)) {
                    Ok(index) => return Ok(index),
                    Err(e) => warn!("failed loading local store index from '{path}': {e}"),
                }
            }
        }

        match read_store_index(client) {
            Ok(Some(index)) => return Ok(index),
            Ok(None) => {}
            Err(e) => warn!("failed reading persisted store index: {e}"),
        }

        if self.access_type == AccessType::ReadOnly {
            // A missing index is indistinguishable from an empty store for a
            // reader that must not write.
            return Ok(StoreIndex::new());
        }

        let rebuilt = self.rebuild_from_blocks(client)?;
        info!(
            blocks = rebuilt.len(),
            "rebuilt store index from block listing in {}",
            client.label()
        );
        match update_remote_index(client, &rebuilt) {
            Ok(merged) => Ok(merged),
            Err(e) => {
                warn!("failed to persist rebuilt store index: {e}");
                *save_pending = true;
                Ok(rebuilt)
            }
        }
    }

    /// Scan every non-empty block object, decode its index, and assemble a
    /// store index. Reads run in batches of `worker_count` parallel clients.
    /// Blocks whose key does not match their content's derived path are
    /// dropped.
    fn rebuild_from_blocks(&self, client: &dyn BlobClient) -> Result<StoreIndex> {
        let block_keys: Vec<String> = client
            .list()?
            .into_iter()
            .filter(|blob| blob.size > 0 && blob.name.ends_with(BLOCK_EXTENSION))
            .map(|blob| blob.name)
            .collect();

        let batch_size = self.worker_count.min(block_keys.len().max(1));
        let mut clients: Vec<Box<dyn BlobClient>> = Vec::with_capacity(batch_size);
        for _ in 0..batch_size {
            clients.push(self.blob_store.new_client()?);
        }

        let mut index = StoreIndex::new();
        let mut scanned = 0usize;
        for batch in block_keys.chunks(batch_size) {
            let batch_indexes = std::thread::scope(|scope| {
                let handles: Vec<_> = batch
                    .iter()
                    .zip(clients.iter_mut())
                    .map(|(key, client)| {
                        scope.spawn(move || read_block_index(client.as_ref(), key))
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| handle.join().unwrap_or(None))
                    .collect::<Vec<_>>()
            });
            let found: Vec<BlockIndex> = batch_indexes.into_iter().flatten().collect();
            index = StoreIndex::merge(&StoreIndex::from_blocks(found), &index);
            scanned += batch.len();
            debug!("scanned {scanned}/{} blocks in {}", block_keys.len(), client.label());
        }
        Ok(index)
    }
}

/// Read one block object and return its index, or `None` when the object is
/// unreadable, undecodable, or stored under a key that does not match its
/// content.
fn read_block_index(client: &dyn BlobClient, key: &str) -> Option<BlockIndex> {
    let (data, _) = read_blob_with_retry(client, key).ok()?;
    let block_index = StoredBlock::decode_index(&data).ok()?;
    let expected = block_index.block_hash.storage_key(BLOCKS_PREFIX);
    if expected == key {
        Some(block_index)
    } else {
        warn!("block '{key}' does not match its content hash (expected '{expected}'), skipping");
        None
    }
}

/// Read the persisted store index. `Ok(None)` when no index object exists.
fn read_store_index(client: &dyn BlobClient) -> Result<Option<StoreIndex>> {
    match read_blob_with_retry(client, STORE_INDEX_KEY) {
        Ok((data, _)) => Ok(Some(StoreIndex::decode(&data)?)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Persist `new_index` by optimistic compare-and-swap on the index object.
///
/// Each round locks the object's version, merges with whatever is currently
/// persisted, and writes; a version conflict re-runs the round. Returns the
/// merged index that ended up persisted so the caller can adopt it.
pub(super) fn update_remote_index(
    client: &dyn BlobClient,
    new_index: &StoreIndex,
) -> Result<StoreIndex> {
    let mut object = client.new_object(STORE_INDEX_KEY)?;
    loop {
        let existed = object.lock_write_version()?;
        if existed {
            let data = object.read()?;
            let remote = StoreIndex::decode(&data)?;
            let merged = StoreIndex::merge(new_index, &remote);
            if object.write(&merged.encode()?)? {
                return Ok(merged);
            }
        } else if object.write(&new_index.encode()?)? {
            return Ok(new_index.clone());
        }
        debug!("store index '{STORE_INDEX_KEY}' changed concurrently, retrying update");
    }
}
