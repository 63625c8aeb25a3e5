mod index_worker;
mod worker;

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};

use lodestore_storage::BlobStore;
use lodestore_types::block_hash::{BlockHash, ChunkHash};
use lodestore_types::error::{Result, StoreError};

use crate::block::{BlockIndex, StoredBlock};
use crate::cache::{GetCompletion, PrefetchCache};
use crate::stats::{BlockStoreStats, StatCounters};
use crate::store_index::StoreIndex;

/// Default cap on bytes held by completed-but-unclaimed prefetches.
pub const DEFAULT_MAX_PREFETCH_MEMORY: i64 = 512 * 1024 * 1024;

/// Directory prefix under which block objects live.
pub(crate) const BLOCKS_PREFIX: &str = "chunks";

/// How the store may be accessed and how its index is bootstrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    /// Start from an empty index, persist on first flush, never rebuild.
    Init,
    /// Load or rebuild the index as needed; accept puts; persist on flush.
    ReadWrite,
    /// Load the index or fall back to empty; reject puts; never persist.
    ReadOnly,
}

impl AccessType {
    pub(crate) fn is_writable(self) -> bool {
        !matches!(self, AccessType::ReadOnly)
    }
}

pub type PutCompletion = Box<dyn FnOnce(Result<()>) + Send>;
pub type PreflightCompletion = Box<dyn FnOnce(Result<Vec<BlockHash>>) + Send>;
pub type ExistingContentCompletion = Box<dyn FnOnce(Result<StoreIndex>) + Send>;
pub type FlushCompletion = Box<dyn FnOnce(Result<()>) + Send>;

pub(crate) struct PutBlockMessage {
    pub block: StoredBlock,
    pub on_complete: PutCompletion,
}

pub(crate) struct GetBlockMessage {
    pub block_hash: BlockHash,
    pub on_complete: GetCompletion,
}

pub(crate) struct PrefetchBlockMessage {
    pub block_hash: BlockHash,
}

pub(crate) struct PreflightGetMessage {
    pub block_hashes: Vec<BlockHash>,
    pub on_complete: PreflightCompletion,
}

pub(crate) struct BlockIndexMessage {
    pub block_index: BlockIndex,
}

pub(crate) struct ExistingContentMessage {
    pub chunk_hashes: Vec<ChunkHash>,
    pub min_block_usage_percent: u32,
    pub on_complete: ExistingContentCompletion,
}

pub(crate) type FlushReply = Result<()>;

/// Construction parameters for [`RemoteBlockStore`].
#[derive(Debug, Clone)]
pub struct RemoteStoreOptions {
    /// ReadOnly hint: URI of a pre-computed local store index file.
    pub optional_store_index_path: Option<String>,
    /// Number of I/O workers, each with its own backend client.
    pub worker_count: usize,
    pub access_type: AccessType,
    /// Cap on bytes held by completed-but-unclaimed prefetches.
    pub max_prefetch_memory: i64,
}

impl Default for RemoteStoreOptions {
    fn default() -> Self {
        Self {
            optional_store_index_path: None,
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            access_type: AccessType::ReadWrite,
            max_prefetch_memory: DEFAULT_MAX_PREFETCH_MEMORY,
        }
    }
}

/// Content-addressed remote block store.
///
/// Every operation is a thin, non-blocking-in-spirit send onto a bounded
/// channel; results arrive through completion callbacks on worker threads.
/// `flush` is a two-phase barrier (workers, then the index maintainer) and
/// `close` drains in order, surfacing the first worker error.
#[derive(Debug)]
pub struct RemoteBlockStore {
    worker_count: usize,
    label: String,
    put_tx: Sender<PutBlockMessage>,
    get_tx: Sender<GetBlockMessage>,
    // Held so the prefetch channel outlives the maintainer's sends and the
    // workers' receives for the store's whole lifetime.
    _prefetch_tx: Sender<PrefetchBlockMessage>,
    preflight_tx: Sender<PreflightGetMessage>,
    existing_tx: Sender<ExistingContentMessage>,
    block_index_tx: Sender<BlockIndexMessage>,
    worker_flush_tx: Sender<()>,
    worker_flush_reply_rx: Receiver<FlushReply>,
    index_flush_tx: Sender<()>,
    index_flush_reply_rx: Receiver<FlushReply>,
    worker_handles: Vec<JoinHandle<Result<()>>>,
    index_handle: JoinHandle<Result<()>>,
    stats: Arc<StatCounters>,
}

impl RemoteBlockStore {
    pub fn new(blob_store: Arc<dyn BlobStore>, options: RemoteStoreOptions) -> Result<Self> {
        if options.worker_count == 0 {
            return Err(StoreError::InvalidArgument(
                "worker_count must be positive".into(),
            ));
        }
        // Fail construction early on an unreachable or misconfigured backend.
        let label = blob_store.new_client()?.label();

        let worker_count = options.worker_count;
        let (put_tx, put_rx) = bounded::<PutBlockMessage>(worker_count * 8);
        let (get_tx, get_rx) = bounded::<GetBlockMessage>(worker_count * 2048);
        let (prefetch_tx, prefetch_rx) = bounded::<PrefetchBlockMessage>(worker_count * 2048);
        let (preflight_tx, preflight_rx) = bounded::<PreflightGetMessage>(16);
        let (block_index_tx, block_index_rx) = bounded::<BlockIndexMessage>(worker_count * 2048);
        let (existing_tx, existing_rx) = bounded::<ExistingContentMessage>(16);
        let (worker_flush_tx, worker_flush_rx) = bounded::<()>(worker_count);
        let (worker_flush_reply_tx, worker_flush_reply_rx) = bounded::<FlushReply>(worker_count);
        let (index_flush_tx, index_flush_rx) = bounded::<()>(1);
        let (index_flush_reply_tx, index_flush_reply_rx) = bounded::<FlushReply>(1);

        let stats = Arc::new(StatCounters::new());
        let cache = Arc::new(PrefetchCache::new(options.max_prefetch_memory));

        let index_handle = {
            let maintainer = index_worker::IndexWorker {
                blob_store: Arc::clone(&blob_store),
                optional_store_index_path: options.optional_store_index_path.clone(),
                access_type: options.access_type,
                worker_count,
                prefetch_tx: prefetch_tx.clone(),
                preflight_rx,
                block_index_rx,
                existing_rx,
                flush_rx: index_flush_rx,
                flush_reply_tx: index_flush_reply_tx,
            };
            std::thread::spawn(move || maintainer.run())
        };

        let mut worker_handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let blob_store = Arc::clone(&blob_store);
            let stats = Arc::clone(&stats);
            let cache = Arc::clone(&cache);
            let put_rx = put_rx.clone();
            let get_rx = get_rx.clone();
            let prefetch_rx = prefetch_rx.clone();
            let block_index_tx = block_index_tx.clone();
            let flush_rx = worker_flush_rx.clone();
            let flush_reply_tx = worker_flush_reply_tx.clone();
            let access_type = options.access_type;
            worker_handles.push(std::thread::spawn(move || {
                worker::run_worker(
                    blob_store,
                    stats,
                    cache,
                    put_rx,
                    get_rx,
                    prefetch_rx,
                    block_index_tx,
                    flush_rx,
                    flush_reply_tx,
                    access_type,
                )
            }));
        }

        Ok(Self {
            worker_count,
            label,
            put_tx,
            get_tx,
            _prefetch_tx: prefetch_tx,
            preflight_tx,
            existing_tx,
            block_index_tx,
            worker_flush_tx,
            worker_flush_reply_rx,
            index_flush_tx,
            index_flush_reply_rx,
            worker_handles,
            index_handle,
            stats,
        })
    }

    /// Human-readable store location.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Store a block. The completion fires once the block is durable in the
    /// backend and its index entry has been handed to the maintainer.
    pub fn put_stored_block(&self, block: StoredBlock, on_complete: PutCompletion) {
        if let Err(send_err) = self.put_tx.send(PutBlockMessage { block, on_complete }) {
            (send_err.into_inner().on_complete)(Err(shutdown_error()));
        }
    }

    /// Fetch a block by hash.
    pub fn get_stored_block(&self, block_hash: BlockHash, on_complete: GetCompletion) {
        if let Err(send_err) = self.get_tx.send(GetBlockMessage {
            block_hash,
            on_complete,
        }) {
            (send_err.into_inner().on_complete)(Err(shutdown_error()));
        }
    }

    /// Announce blocks that will soon be fetched, triggering warm-ahead.
    pub fn preflight_get(&self, block_hashes: Vec<BlockHash>, on_complete: PreflightCompletion) {
        if let Err(send_err) = self.preflight_tx.send(PreflightGetMessage {
            block_hashes,
            on_complete,
        }) {
            (send_err.into_inner().on_complete)(Err(shutdown_error()));
        }
    }

    /// Query which blocks already cover `chunk_hashes`.
    pub fn get_existing_content(
        &self,
        chunk_hashes: Vec<ChunkHash>,
        min_block_usage_percent: u32,
        on_complete: ExistingContentCompletion,
    ) {
        if let Err(send_err) = self.existing_tx.send(ExistingContentMessage {
            chunk_hashes,
            min_block_usage_percent,
            on_complete,
        }) {
            (send_err.into_inner().on_complete)(Err(shutdown_error()));
        }
    }

    /// Snapshot of the per-operation counters.
    pub fn get_stats(&self) -> BlockStoreStats {
        self.stats.snapshot()
    }

    /// Two-phase barrier: flush every worker, then the index maintainer.
    ///
    /// The completion fires once every preceding put's index entry has been
    /// merged and the store index persisted; it carries the first error
    /// reported by any phase.
    pub fn flush(&self, on_complete: FlushCompletion) {
        let worker_count = self.worker_count;
        let worker_flush_tx = self.worker_flush_tx.clone();
        let worker_flush_reply_rx = self.worker_flush_reply_rx.clone();
        let index_flush_tx = self.index_flush_tx.clone();
        let index_flush_reply_rx = self.index_flush_reply_rx.clone();

        std::thread::spawn(move || {
            let mut first_err: Option<StoreError> = None;
            let mut record = |reply: FlushReply| {
                if let Err(e) = reply {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            };

            for _ in 0..worker_count {
                if worker_flush_tx.send(()).is_err() {
                    record(Err(shutdown_error()));
                }
            }
            for _ in 0..worker_count {
                record(worker_flush_reply_rx.recv().unwrap_or_else(|_| Err(shutdown_error())));
            }
            if index_flush_tx.send(()).is_err() {
                record(Err(shutdown_error()));
            }
            record(index_flush_reply_rx.recv().unwrap_or_else(|_| Err(shutdown_error())));

            on_complete(match first_err {
                Some(e) => Err(e),
                None => Ok(()),
            });
        });
    }

    /// Shut down: stop accepting puts, drain the workers, then the
    /// maintainer (which persists any outstanding index changes). Returns
    /// the first error any actor reported.
    pub fn close(self) -> Result<()> {
        // Every channel endpoint is bound to a local so it stays alive until
        // this function returns; only the two shutdown signals are dropped
        // early, in order.
        let RemoteBlockStore {
            worker_count: _,
            label: _,
            put_tx,
            get_tx: _get_tx,
            _prefetch_tx,
            preflight_tx: _preflight_tx,
            existing_tx: _existing_tx,
            block_index_tx,
            worker_flush_tx: _worker_flush_tx,
            worker_flush_reply_rx: _worker_flush_reply_rx,
            index_flush_tx: _index_flush_tx,
            index_flush_reply_rx: _index_flush_reply_rx,
            worker_handles,
            index_handle,
            stats: _,
        } = self;

        let mut first_err: Option<StoreError> = None;
        let mut record = |joined: std::thread::Result<Result<()>>| {
            let outcome = match joined {
                Ok(r) => r,
                Err(_) => Err(StoreError::Io("store worker thread panicked".into())),
            };
            if let Err(e) = outcome {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        };

        // Closing the put channel is the worker shutdown signal.
        drop(put_tx);
        for handle in worker_handles {
            record(handle.join());
        }

        // With the workers gone, dropping our sender closes the block-index
        // channel and lets the maintainer run its final merge + persist.
        drop(block_index_tx);
        record(index_handle.join());

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn shutdown_error() -> StoreError {
    StoreError::Io("block store is shut down".into())
}
