//! Read-only log backed by peers.
//!
//! Blocks are fetched on demand through a [`BlockSource`], verified against a
//! signed head, then written through to local storage. Concurrent reads of the
//! same missing block share one fetch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tidal_types::{CoreKey, Digest, DiscoveryKey};
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::event::{CoreEvent, EventBus, EventStream};
use crate::head::{BlockResponse, SignedHead};
use crate::storage::BlockStorage;
use crate::traits::{BlockSource, Log};

/// Default time a single block fetch may take.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

struct RemoteInner {
    key: CoreKey,
    discovery_key: DiscoveryKey,
    storage: Arc<dyn BlockStorage>,
    source: Arc<dyn BlockSource>,
    head: RwLock<Option<SignedHead>>,
    length_tx: watch::Sender<u64>,
    /// In-flight fetches, one cell per missing index.
    inflight: Mutex<HashMap<u64, Arc<OnceCell<Bytes>>>>,
    fetch_timeout: Duration,
    events: EventBus,
    closed: AtomicBool,
}

/// A log this process cannot write, replicated from peers.
#[derive(Clone)]
pub struct RemoteLog {
    inner: Arc<RemoteInner>,
}

impl RemoteLog {
    pub fn new(
        key: CoreKey,
        storage: Arc<dyn BlockStorage>,
        source: Arc<dyn BlockSource>,
        fetch_timeout: Duration,
    ) -> Self {
        let (length_tx, _) = watch::channel(0);
        debug!(core = %key.short_id(), cached = storage.contiguous_len(), "remote log opened");
        Self {
            inner: Arc::new(RemoteInner {
                discovery_key: key.discovery_key(),
                key,
                storage,
                source,
                head: RwLock::new(None),
                length_tx,
                inflight: Mutex::new(HashMap::new()),
                fetch_timeout,
                events: EventBus::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Number of blocks held in local storage.
    pub fn cached_len(&self) -> u64 {
        self.inner.storage.contiguous_len()
    }
}

impl RemoteInner {
    fn length(&self) -> u64 {
        self.head
            .read()
            .expect("head lock poisoned")
            .as_ref()
            .map_or(0, |h| h.length)
    }

    fn accept_head(&self, head: SignedHead) -> CoreResult<bool> {
        head.verify(&self.key)?;
        let mut current = self.head.write().expect("head lock poisoned");
        if let Some(existing) = current.as_ref() {
            if head.length < existing.length {
                return Ok(false);
            }
            if head.length == existing.length {
                if head.tree_hash() != existing.tree_hash() {
                    warn!(core = %self.key.short_id(), length = head.length, "conflicting heads at same length");
                    return Err(CoreError::Verification(format!(
                        "conflicting head at length {}",
                        head.length
                    )));
                }
                return Ok(false);
            }
        }
        let length = head.length;
        *current = Some(head);
        drop(current);

        self.length_tx.send_replace(length);
        self.events.emit(CoreEvent::Head { length });
        debug!(core = %self.key.short_id(), length, "accepted head");
        Ok(true)
    }

    async fn fetch(&self, index: u64) -> CoreResult<Bytes> {
        let response = self.source.fetch(&self.discovery_key, index).await?;
        self.check_response(&response, index)?;
        let data = response.data;

        self.storage.write(index, std::slice::from_ref(&data))?;
        self.accept_head(response.head)?;
        self.events.emit(CoreEvent::Download {
            index,
            bytes: data.len() as u64,
        });
        debug!(core = %self.key.short_id(), index, bytes = data.len(), "downloaded");
        Ok(data)
    }

    fn check_response(&self, response: &BlockResponse, index: u64) -> CoreResult<()> {
        response.verify(&self.key, index)?;
        let current = self.head.read().expect("head lock poisoned");
        if let Some(existing) = current.as_ref() {
            if existing.length == response.head.length
                && existing.tree_hash() != response.head.tree_hash()
            {
                return Err(CoreError::Verification(format!(
                    "block {index} proven against a conflicting head"
                )));
            }
        }
        Ok(())
    }

    /// Drop the in-flight cell for `index` once it holds the block or no
    /// other caller is still waiting on it.
    fn release(&self, index: u64, cell: &Arc<OnceCell<Bytes>>) {
        let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
        let ours = inflight.get(&index).is_some_and(|c| Arc::ptr_eq(c, cell));
        // One reference in the map, one held by this caller.
        if ours && (cell.initialized() || Arc::strong_count(cell) <= 2) {
            inflight.remove(&index);
        }
    }

    async fn get(&self, index: u64) -> CoreResult<Bytes> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::Closed);
        }
        let length = self.length();
        if index >= length {
            return Err(CoreError::OutOfRange { index, length });
        }
        if let Some(block) = self.storage.read(index)? {
            return Ok(block);
        }

        let cell = {
            let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
            inflight.entry(index).or_default().clone()
        };

        let result = tokio::time::timeout(self.fetch_timeout, cell.get_or_try_init(|| self.fetch(index))).await;
        self.release(index, &cell);
        match result {
            Ok(Ok(block)) => Ok(block.clone()),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(core = %self.key.short_id(), index, "block fetch timed out");
                Err(CoreError::FetchTimeout { index })
            }
        }
    }
}

#[async_trait]
impl Log for RemoteLog {
    fn key(&self) -> &CoreKey {
        &self.inner.key
    }

    fn discovery_key(&self) -> DiscoveryKey {
        self.inner.discovery_key
    }

    fn length(&self) -> u64 {
        self.inner.length()
    }

    fn byte_length(&self) -> u64 {
        self.inner
            .head
            .read()
            .expect("head lock poisoned")
            .as_ref()
            .map_or(0, |h| h.byte_length)
    }

    fn tree_hash(&self) -> Digest {
        self.inner
            .head
            .read()
            .expect("head lock poisoned")
            .as_ref()
            .map_or_else(|| tidal_crypto::tree_hash_of(&[]), SignedHead::tree_hash)
    }

    fn writable(&self) -> bool {
        false
    }

    async fn append_batch(&self, _blocks: Vec<Bytes>) -> CoreResult<u64> {
        Err(CoreError::Unauthorized)
    }

    async fn get(&self, index: u64) -> CoreResult<Bytes> {
        self.inner.get(index).await
    }

    fn download(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let length = inner.length();
            let mut fetched = 0u64;
            for index in 0..length {
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                if inner.storage.contains(index) {
                    continue;
                }
                match inner.get(index).await {
                    Ok(_) => fetched += 1,
                    Err(e) => debug!(core = %inner.key.short_id(), index, error = %e, "background download skipped block"),
                }
            }
            debug!(core = %inner.key.short_id(), fetched, length, "background download finished");
        });
    }

    fn signed_head(&self) -> Option<SignedHead> {
        self.inner.head.read().expect("head lock poisoned").clone()
    }

    fn update_head(&self, head: SignedHead) -> CoreResult<bool> {
        self.inner.accept_head(head)
    }

    async fn wait_for_length(&self, length: u64, timeout: Duration) -> CoreResult<u64> {
        let mut rx = self.inner.length_tx.subscribe();
        let result = match tokio::time::timeout(timeout, rx.wait_for(|l| *l >= length)).await {
            Ok(Ok(current)) => Ok(*current),
            Ok(Err(_)) => Err(CoreError::Closed),
            Err(_) => Err(CoreError::LengthTimeout { length }),
        };
        result
    }

    fn serve(&self, index: u64) -> CoreResult<BlockResponse> {
        Err(CoreError::NotAvailable { index })
    }

    fn subscribe(&self) -> EventStream {
        self.inner.events.subscribe()
    }

    async fn close(&self) -> CoreResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.storage.flush()?;
        self.inner.events.emit(CoreEvent::Closed);
        info!(core = %self.inner.key.short_id(), "remote log closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}
