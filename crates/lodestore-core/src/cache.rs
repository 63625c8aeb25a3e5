use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use tracing::info;

use lodestore_types::block_hash::BlockHash;
use lodestore_types::error::Result;

use crate::block::StoredBlock;

/// Completion callback for a block fetch.
pub type GetCompletion = Box<dyn FnOnce(Result<StoredBlock>) + Send>;

/// One cache slot, keyed by block hash.
enum PrefetchSlot {
    /// A fetch for this hash is running; callbacks queue behind it.
    InFlight { waiters: Vec<GetCompletion> },
    /// Fetch completed ahead of demand; the block waits for a consumer and
    /// its size is counted against the memory budget.
    Stored(StoredBlock),
    /// Tombstone: the block was delivered. A background fetch still running
    /// for this hash must not re-cache its result.
    Claimed,
}

/// Deduplicates fetches by block hash and holds blocks fetched ahead of
/// demand against a memory budget.
///
/// The mutex is only ever held for map surgery, never across backend I/O:
/// `fetch` and `prefetch` install an in-flight slot, release the lock, run
/// the read, then reacquire the lock to resolve the slot.
pub struct PrefetchCache {
    slots: Mutex<HashMap<BlockHash, PrefetchSlot>>,
    prefetch_memory: AtomicI64,
    max_prefetch_memory: i64,
}

impl PrefetchCache {
    pub fn new(max_prefetch_memory: i64) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            prefetch_memory: AtomicI64::new(0),
            max_prefetch_memory,
        }
    }

    /// Bytes currently held in completed-but-unclaimed slots.
    pub fn memory_used(&self) -> i64 {
        self.prefetch_memory.load(Ordering::Relaxed)
    }

    /// Whether warm-ahead traffic may still be admitted.
    pub fn below_memory_budget(&self) -> bool {
        self.memory_used() < self.max_prefetch_memory
    }

    /// Demand-fetch `block_hash`, delivering to `on_complete`.
    ///
    /// A block already fetched ahead of demand is handed over immediately.
    /// If a fetch for the hash is in flight, the callback queues behind it.
    /// Otherwise this call owns the fetch: it runs `read` and delivers the
    /// outcome to every waiter that queued meanwhile, each with its own
    /// independently owned block, and finally to `on_complete`.
    pub fn fetch(
        &self,
        block_hash: BlockHash,
        on_complete: GetCompletion,
        read: impl FnOnce() -> Result<StoredBlock>,
    ) {
        {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            match slots.get_mut(&block_hash) {
                Some(slot @ PrefetchSlot::Stored(_)) => {
                    let PrefetchSlot::Stored(block) = std::mem::replace(slot, PrefetchSlot::Claimed)
                    else {
                        unreachable!();
                    };
                    self.prefetch_memory
                        .fetch_sub(i64::from(block.block_size()), Ordering::Relaxed);
                    drop(slots);
                    on_complete(Ok(block));
                    return;
                }
                Some(PrefetchSlot::InFlight { waiters }) => {
                    waiters.push(on_complete);
                    return;
                }
                // No live slot (or an already-claimed tombstone): this call
                // becomes the fetcher.
                Some(PrefetchSlot::Claimed) | None => {
                    slots.insert(block_hash, PrefetchSlot::InFlight { waiters: Vec::new() });
                }
            }
        }

        let result = read();

        let mut waiters = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            match slots.get_mut(&block_hash) {
                Some(slot @ PrefetchSlot::InFlight { .. }) => {
                    let PrefetchSlot::InFlight { waiters } =
                        std::mem::replace(slot, PrefetchSlot::Claimed)
                    else {
                        unreachable!();
                    };
                    waiters
                }
                // The slot was reaped while we were reading; nothing queued
                // behind us. The caller still receives the outcome.
                _ => Vec::new(),
            }
        };
        waiters.push(on_complete);
        deliver(waiters, result);
    }

    /// Warm the cache for `block_hash` ahead of demand.
    ///
    /// Returns immediately if any slot for the hash exists. On read failure
    /// the in-flight slot is left behind and reaped by [`Self::flush`].
    pub fn prefetch(&self, block_hash: BlockHash, read: impl FnOnce() -> Result<StoredBlock>) {
        {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            if slots.contains_key(&block_hash) {
                return;
            }
            slots.insert(block_hash, PrefetchSlot::InFlight { waiters: Vec::new() });
        }

        let block = match read() {
            Ok(block) => block,
            Err(_) => return,
        };

        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        match slots.get_mut(&block_hash) {
            Some(slot @ PrefetchSlot::InFlight { .. }) => {
                let PrefetchSlot::InFlight { waiters } =
                    std::mem::replace(slot, PrefetchSlot::Claimed)
                else {
                    unreachable!();
                };
                if waiters.is_empty() {
                    self.prefetch_memory
                        .fetch_add(i64::from(block.block_size()), Ordering::Relaxed);
                    slots.insert(block_hash, PrefetchSlot::Stored(block));
                    return;
                }
                drop(slots);
                deliver(waiters, Ok(block));
            }
            // Claimed or reaped while the read was running: the block was
            // already delivered elsewhere, drop this copy.
            _ => {}
        }
    }

    /// Drain queued warm-ahead requests and reap every slot nobody waits on.
    ///
    /// Slots with waiters are kept; their in-flight fetchers will complete
    /// them.
    pub fn flush<T>(&self, prefetch_queue: &crossbeam_channel::Receiver<T>) {
        while prefetch_queue.try_recv().is_ok() {}

        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.retain(|hash, slot| match slot {
            PrefetchSlot::InFlight { waiters } if !waiters.is_empty() => {
                info!("keeping cache slot for block {hash}: fetch still awaited");
                true
            }
            PrefetchSlot::Stored(block) => {
                self.prefetch_memory
                    .fetch_sub(i64::from(block.block_size()), Ordering::Relaxed);
                false
            }
            _ => false,
        });
    }
}

/// Deliver one fetch outcome to a list of completions, each receiving an
/// independently owned block; the last in the list takes the fetched block
/// itself.
fn deliver(mut completions: Vec<GetCompletion>, result: Result<StoredBlock>) {
    match result {
        Err(e) => {
            for completion in completions {
                completion(Err(e.clone()));
            }
        }
        Ok(block) => {
            let last = completions.pop();
            for completion in completions {
                completion(Ok(block.clone()));
            }
            if let Some(last) = last {
                last(Ok(block));
            }
        }
    }
}
