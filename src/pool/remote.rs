use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::source::{fetch_with_retries, BlockSource, RetryPolicy};
use super::{check_range, fetch_block_len, BlockPool};
use crate::address::{BlockAddress, BlockAddressMap};
use crate::container::Container;
use crate::error::{Error, NetworkError, Result};

#[derive(Debug, Clone)]
pub struct RemotePoolConfig {
    /// Fetch blocks kept in memory, prefetched or recently read.
    pub cache_blocks: usize,
    /// Concurrent background fetches; zero disables prefetching.
    pub prefetch_workers: usize,
    pub retry: RetryPolicy,
}

impl Default for RemotePoolConfig {
    fn default() -> Self {
        Self {
            cache_blocks: 32,
            prefetch_workers: 4,
            retry: RetryPolicy::default(),
        }
    }
}

enum Slot {
    Pending,
    Ready { data: Arc<Vec<u8>>, consumed: bool },
    Failed(NetworkError),
}

#[derive(Default)]
struct Cache {
    slots: HashMap<BlockAddress, Slot>,
    /// Consumed blocks, least recently read first. Only these are evicted.
    lru: VecDeque<BlockAddress>,
    /// Every block a reader has received; the prefetcher skips these.
    served: HashSet<BlockAddress>,
}

impl Cache {
    fn touch(&mut self, address: &BlockAddress) {
        if !self.served.contains(address) {
            self.served.insert(address.clone());
        }
        if let Some(pos) = self.lru.iter().position(|a| a == address) {
            self.lru.remove(pos);
        }
        self.lru.push_back(address.clone());
    }

    fn evict(&mut self, capacity: usize) {
        while self.slots.len() > capacity {
            let Some(oldest) = self.lru.pop_front() else {
                break;
            };
            self.slots.remove(&oldest);
        }
    }

    /// Slots a reader has not picked up yet.
    fn outstanding(&self) -> usize {
        self.slots
            .values()
            .filter(|s| !matches!(s, Slot::Ready { consumed: true, .. }))
            .count()
    }
}

struct Inner {
    container: Container,
    fetch_block_size: u64,
    addresses: Arc<BlockAddressMap>,
    upstream: Arc<dyn BlockSource>,
    config: RemotePoolConfig,
    cache: Mutex<Cache>,
    changed: Condvar,
    fetches: AtomicU64,
    cancel: CancellationToken,
}

/// Serves old-build bytes from an address-keyed block store, one fetch block
/// at a time.
pub struct RemotePool {
    inner: Arc<Inner>,
    /// Stops the prefetcher when the pool goes away.
    shutdown: CancellationToken,
}

impl RemotePool {
    pub fn new(
        container: Container,
        fetch_block_size: u64,
        addresses: Arc<BlockAddressMap>,
        upstream: Arc<dyn BlockSource>,
        config: RemotePoolConfig,
        cancel: CancellationToken,
    ) -> Self {
        let shutdown = cancel.child_token();
        Self {
            inner: Arc::new(Inner {
                container,
                fetch_block_size: fetch_block_size.max(1),
                addresses,
                upstream,
                config,
                cache: Mutex::new(Cache::default()),
                changed: Condvar::new(),
                fetches: AtomicU64::new(0),
                cancel: shutdown.clone(),
            }),
            shutdown,
        }
    }

    /// Number of calls made to the upstream source so far, retries included.
    pub fn fetch_count(&self) -> u64 {
        self.inner.fetches.load(Ordering::SeqCst)
    }

    /// Fetch the given blocks in the background, in order, ahead of the reader.
    /// Failures are kept and reported by the read that needs the block.
    pub fn start_prefetch(&self, schedule: Vec<(usize, u64)>) -> Result<()> {
        let workers = self.inner.config.prefetch_workers;
        if workers == 0 || schedule.is_empty() {
            return Ok(());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("netpatch-fetch-{i}"))
            .build()
            .map_err(|e| Error::io("Failed to start fetch workers", std::io::Error::other(e)))?;

        let inner = Arc::clone(&self.inner);
        std::thread::Builder::new()
            .name("netpatch-prefetch".into())
            .spawn(move || inner.run_prefetch(pool, schedule))
            .map_err(|e| Error::io("Failed to start prefetcher", e))?;
        Ok(())
    }
}

impl Drop for RemotePool {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.inner.changed.notify_all();
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Cache>) -> MutexGuard<'a, Cache> {
        // Timed so cancellation is noticed even without a notification.
        match self.changed.wait_timeout(guard, Duration::from_millis(50)) {
            Ok((guard, _)) => guard,
            Err(e) => e.into_inner().0,
        }
    }

    fn fetch(
        &self,
        file_index: usize,
        block_index: u64,
        address: &BlockAddress,
    ) -> std::result::Result<Vec<u8>, NetworkError> {
        let expected = fetch_block_len(
            self.container.files[file_index].size,
            self.fetch_block_size,
            block_index,
        );
        let counted = CountingSource {
            upstream: self.upstream.as_ref(),
            fetches: &self.fetches,
        };
        let data = fetch_with_retries(&counted, address, &self.config.retry, &self.cancel)?;
        if data.len() as u64 != expected {
            return Err(NetworkError::ShortBody {
                address: address.to_string(),
                expected,
                actual: data.len() as u64,
            });
        }
        debug!(%address, file_index, block_index, "fetched block");
        Ok(data)
    }

    /// The bytes of one fetch block, from cache, from an in-flight prefetch,
    /// or fetched now.
    fn block(&self, file_index: usize, block_index: u64) -> Result<Arc<Vec<u8>>> {
        let address = self
            .addresses
            .get(file_index, block_index)
            .ok_or(Error::Consistency {
                file_index,
                block_index,
            })?;

        let mut cache = self.lock();
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match cache.slots.get_mut(address) {
                Some(Slot::Ready { data, consumed }) => {
                    let data = Arc::clone(data);
                    *consumed = true;
                    cache.touch(address);
                    cache.evict(self.config.cache_blocks);
                    drop(cache);
                    self.changed.notify_all();
                    trace!(%address, "cache hit");
                    return Ok(data);
                }
                Some(Slot::Pending) => cache = self.wait(cache),
                Some(Slot::Failed(err)) => {
                    let err = err.clone();
                    cache.slots.remove(address);
                    drop(cache);
                    self.changed.notify_all();
                    return Err(err.into());
                }
                None => break,
            }
        }
        cache.slots.insert(address.clone(), Slot::Pending);
        drop(cache);

        let result = self.fetch(file_index, block_index, address);

        let mut cache = self.lock();
        let out = match result {
            Ok(data) => {
                let data = Arc::new(data);
                cache.slots.insert(
                    address.clone(),
                    Slot::Ready {
                        data: Arc::clone(&data),
                        consumed: true,
                    },
                );
                cache.touch(address);
                cache.evict(self.config.cache_blocks);
                Ok(data)
            }
            Err(e) => {
                cache.slots.remove(address);
                Err(e.into())
            }
        };
        drop(cache);
        self.changed.notify_all();
        out
    }

    fn run_prefetch(self: Arc<Self>, workers: rayon::ThreadPool, schedule: Vec<(usize, u64)>) {
        let capacity = self.config.cache_blocks.max(1);
        debug!(blocks = schedule.len(), "prefetch started");

        for (file_index, block_index) in schedule {
            // Blocks without an address fail in the reader, where the error belongs.
            let Some(address) = self.addresses.get(file_index, block_index).cloned() else {
                continue;
            };

            let mut cache = self.lock();
            loop {
                if self.cancel.is_cancelled() {
                    return;
                }
                if cache.slots.contains_key(&address) || cache.served.contains(&address) {
                    break;
                }
                if cache.outstanding() < capacity {
                    cache.slots.insert(address.clone(), Slot::Pending);
                    cache.evict(capacity);
                    let inner = Arc::clone(&self);
                    let address = address.clone();
                    workers.spawn(move || inner.prefetch_one(file_index, block_index, address));
                    break;
                }
                cache = self.wait(cache);
            }
        }
        debug!("prefetch schedule dispatched");
    }

    fn prefetch_one(&self, file_index: usize, block_index: u64, address: BlockAddress) {
        let slot = if self.cancel.is_cancelled() {
            Slot::Failed(NetworkError::Cancelled)
        } else {
            match self.fetch(file_index, block_index, &address) {
                Ok(data) => Slot::Ready {
                    data: Arc::new(data),
                    consumed: false,
                },
                Err(e) => Slot::Failed(e),
            }
        };

        let mut cache = self.lock();
        if let Some(existing) = cache.slots.get_mut(&address) {
            if matches!(existing, Slot::Pending) {
                *existing = slot;
            }
        }
        drop(cache);
        self.changed.notify_all();
    }
}

struct CountingSource<'a> {
    upstream: &'a dyn BlockSource,
    fetches: &'a AtomicU64,
}

impl BlockSource for CountingSource<'_> {
    fn fetch(&self, address: &BlockAddress) -> std::result::Result<Vec<u8>, NetworkError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.upstream.fetch(address)
    }
}

impl BlockPool for RemotePool {
    fn container(&self) -> &Container {
        &self.inner.container
    }

    fn read(&self, file_index: usize, offset: u64, len: u64) -> Result<Vec<u8>> {
        check_range(&self.inner.container, file_index, offset, len)?;

        let size = self.inner.fetch_block_size;
        let end = offset + len;
        let mut out = Vec::with_capacity(len as usize);
        let mut pos = offset;

        while pos < end {
            let block_index = pos / size;
            let block_start = block_index * size;
            let block = self.inner.block(file_index, block_index)?;

            let from = (pos - block_start) as usize;
            let to = ((end - block_start) as usize).min(block.len());
            if from >= to {
                // The block is shorter than its position implies.
                return Err(Error::Range {
                    file_index,
                    offset,
                    len,
                    size: block_start + block.len() as u64,
                });
            }
            out.extend_from_slice(&block[from..to]);
            pos = block_start + to as u64;
        }

        Ok(out)
    }
}
