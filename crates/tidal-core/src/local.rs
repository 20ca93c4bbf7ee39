//! Fully materialized, writable log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tidal_crypto::{MerkleTree, SigningKey};
use tidal_types::{CoreKey, Digest, DiscoveryKey};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};
use crate::event::{CoreEvent, EventBus, EventStream};
use crate::head::{BlockResponse, SignedHead};
use crate::storage::BlockStorage;
use crate::traits::Log;

#[derive(Debug)]
struct LocalState {
    byte_length: u64,
    tree: MerkleTree,
    tree_hash: Digest,
    head: SignedHead,
}

/// A log whose blocks all live in local storage and whose secret key is held
/// by this process.
pub struct LocalLog {
    key: CoreKey,
    discovery_key: DiscoveryKey,
    signer: SigningKey,
    storage: Arc<dyn BlockStorage>,
    state: RwLock<LocalState>,
    /// Serializes appends. Held across the storage write.
    write_lock: Mutex<()>,
    events: EventBus,
    closed: AtomicBool,
}

impl LocalLog {
    /// Open a log over `storage`, rebuilding the Merkle tree from the stored
    /// contiguous prefix.
    pub fn open(signer: SigningKey, storage: Arc<dyn BlockStorage>) -> CoreResult<Self> {
        let key = signer.verifying_key().to_core_key();
        let discovery_key = key.discovery_key();

        let length = storage.contiguous_len();
        let mut tree = MerkleTree::new();
        let mut byte_length = 0u64;
        for index in 0..length {
            let block = storage
                .read(index)?
                .ok_or_else(|| CoreError::Storage(format!("block {index} vanished during open")))?;
            tree.append(&block);
            byte_length += block.len() as u64;
        }

        let head = SignedHead::sign(&signer, &discovery_key, byte_length, tree.roots());
        let tree_hash = tree.tree_hash();
        info!(core = %key.short_id(), length, byte_length, "local log opened");

        Ok(Self {
            key,
            discovery_key,
            signer,
            storage,
            state: RwLock::new(LocalState {
                byte_length,
                tree,
                tree_hash,
                head,
            }),
            write_lock: Mutex::new(()),
            events: EventBus::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> CoreResult<()> {
        if self.is_closed() {
            return Err(CoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Log for LocalLog {
    fn key(&self) -> &CoreKey {
        &self.key
    }

    fn discovery_key(&self) -> DiscoveryKey {
        self.discovery_key
    }

    fn length(&self) -> u64 {
        self.state.read().expect("log state poisoned").tree.len()
    }

    fn byte_length(&self) -> u64 {
        self.state.read().expect("log state poisoned").byte_length
    }

    fn tree_hash(&self) -> Digest {
        self.state.read().expect("log state poisoned").tree_hash
    }

    fn writable(&self) -> bool {
        true
    }

    async fn append_batch(&self, blocks: Vec<Bytes>) -> CoreResult<u64> {
        let _guard = self.write_lock.lock().await;
        self.check_open()?;

        let first = self.length();
        if blocks.is_empty() {
            return Ok(first);
        }

        self.storage.write(first, &blocks)?;

        let (length, byte_length) = {
            let mut state = self.state.write().expect("log state poisoned");
            for block in &blocks {
                state.tree.append(block);
                state.byte_length += block.len() as u64;
            }
            state.tree_hash = state.tree.tree_hash();
            state.head = SignedHead::sign(
                &self.signer,
                &self.discovery_key,
                state.byte_length,
                state.tree.roots(),
            );
            (state.tree.len(), state.byte_length)
        };

        debug!(core = %self.key.short_id(), first, count = blocks.len(), length, "appended");
        self.events.emit(CoreEvent::Append {
            length,
            byte_length,
        });
        Ok(first)
    }

    async fn get(&self, index: u64) -> CoreResult<Bytes> {
        let length = self.length();
        if index >= length {
            return Err(CoreError::OutOfRange { index, length });
        }
        self.storage
            .read(index)?
            .ok_or_else(|| CoreError::Storage(format!("block {index} missing from local storage")))
    }

    fn download(&self) {}

    fn signed_head(&self) -> Option<SignedHead> {
        Some(self.state.read().expect("log state poisoned").head.clone())
    }

    fn update_head(&self, _head: SignedHead) -> CoreResult<bool> {
        Ok(false)
    }

    async fn wait_for_length(&self, length: u64, _timeout: Duration) -> CoreResult<u64> {
        let current = self.length();
        if current >= length {
            Ok(current)
        } else {
            Err(CoreError::LengthTimeout { length })
        }
    }

    fn serve(&self, index: u64) -> CoreResult<BlockResponse> {
        self.check_open()?;
        let (proof, head) = {
            let state = self.state.read().expect("log state poisoned");
            let length = state.tree.len();
            let proof = state
                .tree
                .proof(index)
                .ok_or(CoreError::OutOfRange { index, length })?;
            (proof, state.head.clone())
        };
        let data = self
            .storage
            .read(index)?
            .ok_or(CoreError::NotAvailable { index })?;

        self.events.emit(CoreEvent::Upload {
            index,
            bytes: data.len() as u64,
        });
        Ok(BlockResponse {
            index,
            data,
            proof,
            head,
        })
    }

    fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    async fn close(&self) -> CoreResult<()> {
        let _guard = self.write_lock.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.storage.flush()?;
        self.events.emit(CoreEvent::Closed);
        info!(core = %self.key.short_id(), "local log closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileStorage, MemoryStorage, SyncMode};
    use proptest::prelude::*;

    fn memory_log() -> LocalLog {
        LocalLog::open(SigningKey::generate(), Arc::new(MemoryStorage::new())).unwrap()
    }

    #[tokio::test]
    async fn append_then_get() {
        let log = memory_log();
        assert_eq!(log.append(Bytes::from_static(b"hello")).await.unwrap(), 0);
        assert_eq!(log.append(Bytes::from_static(b"world!")).await.unwrap(), 1);
        assert_eq!(log.length(), 2);
        assert_eq!(log.byte_length(), 11);
        assert_eq!(log.get(1).await.unwrap(), Bytes::from_static(b"world!"));
    }

    #[tokio::test]
    async fn get_beyond_length_is_out_of_range() {
        let log = memory_log();
        log.append(Bytes::from_static(b"a")).await.unwrap();
        assert!(matches!(
            log.get(1).await,
            Err(CoreError::OutOfRange { index: 1, length: 1 })
        ));
    }

    #[tokio::test]
    async fn batch_returns_first_index_and_emits_once() {
        let log = memory_log();
        log.append(Bytes::from_static(b"0")).await.unwrap();
        let mut events = log.subscribe();
        let first = log
            .append_batch(vec![Bytes::from_static(b"1"), Bytes::from_static(b"2")])
            .await
            .unwrap();
        assert_eq!(first, 1);
        assert_eq!(
            events.try_recv().unwrap(),
            CoreEvent::Append {
                length: 3,
                byte_length: 3
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn tree_hash_is_independent_of_key() {
        let a = memory_log();
        let b = memory_log();
        for block in [b"x".as_slice(), b"y", b"z"] {
            a.append(Bytes::copy_from_slice(block)).await.unwrap();
            b.append(Bytes::copy_from_slice(block)).await.unwrap();
        }
        assert_ne!(a.key(), b.key());
        assert_eq!(a.tree_hash(), b.tree_hash());
    }

    #[tokio::test]
    async fn serve_produces_verifiable_response_and_upload_event() {
        let log = memory_log();
        for block in [b"a".as_slice(), b"bb", b"ccc"] {
            log.append(Bytes::copy_from_slice(block)).await.unwrap();
        }
        let mut events = log.subscribe();
        let response = log.serve(2).unwrap();
        response.verify(log.key(), 2).unwrap();
        assert_eq!(events.try_recv().unwrap(), CoreEvent::Upload { index: 2, bytes: 3 });
        assert!(matches!(log.serve(3), Err(CoreError::OutOfRange { .. })));
    }

    #[tokio::test]
    async fn append_after_close_fails() {
        let log = memory_log();
        log.close().await.unwrap();
        assert!(log.is_closed());
        assert!(matches!(
            log.append(Bytes::from_static(b"late")).await,
            Err(CoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn reopen_from_file_restores_length_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.blocks");
        let hash = {
            let storage = Arc::new(FileStorage::open(&path, SyncMode::default()).unwrap());
            let log = LocalLog::open(SigningKey::from_bytes([7u8; 32]), storage).unwrap();
            log.append_batch(vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")])
                .await
                .unwrap();
            log.close().await.unwrap();
            log.tree_hash()
        };

        let storage = Arc::new(FileStorage::open(&path, SyncMode::default()).unwrap());
        let log = LocalLog::open(SigningKey::from_bytes([7u8; 32]), storage).unwrap();
        assert_eq!(log.length(), 2);
        assert_eq!(log.byte_length(), 6);
        assert_eq!(log.tree_hash(), hash);
    }

    proptest! {
        #[test]
        fn tree_hash_depends_only_on_block_sequence(
            blocks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..16), 1..12)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let a = memory_log();
                let b = memory_log();
                a.append_batch(blocks.iter().cloned().map(Bytes::from).collect()).await.unwrap();
                for block in &blocks {
                    b.append(Bytes::from(block.clone())).await.unwrap();
                }
                assert_eq!(a.tree_hash(), b.tree_hash());
                assert_eq!(a.length(), blocks.len() as u64);
            });
        }
    }
}
