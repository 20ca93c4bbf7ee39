//! Versioned key-value drive over a metadata core and a blob store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tidal_core::{Core, CoreStore};
use tidal_types::{BlobRef, CoreKey, Digest, DiscoveryKey};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::batch::DriveBatch;
use crate::blobs::BlobStore;
use crate::error::{DriveError, DriveResult};
use crate::index::{Entries, SharedIndex};
use crate::node::{content_hash, normalize_key, Entry, EntryValue, Header, Node, DRIVE_VERSION};

/// Name of a writable drive's metadata core within its store namespace.
pub const METADATA_NAME: &str = "db";
/// Name of a writable drive's blob core within its store namespace.
pub const BLOBS_NAME: &str = "blobs";

/// A key-value tree whose history is an append-only metadata log.
///
/// Cloning a `Drive` yields another handle to the same logs and index. A
/// checkout ([`Drive::checkout`]) shares both but sees only a prefix of the
/// metadata log and never writes.
#[derive(Clone)]
pub struct Drive {
    metadata: Core,
    blobs: BlobStore,
    index: SharedIndex,
    writer: Arc<Mutex<()>>,
    checkout: Option<u64>,
}

impl Drive {
    /// Open (or create) the writable drive of a store namespace.
    ///
    /// A drive seeded from another drive's cores still carries a header naming
    /// that drive's blob core; opening it appends a header naming its own.
    pub async fn open_writable(store: &CoreStore) -> DriveResult<Self> {
        let (metadata, blobs) = Self::writable_cores(store)?;
        if metadata.length() == 0 {
            let header = Node::Header(Header {
                version: DRIVE_VERSION,
                blobs_key: *blobs.key(),
            });
            metadata.append(header.encode()?).await?;
            info!(drive = %metadata.key().short_id(), "created drive");
        }
        let drive = Self::from_cores(metadata, BlobStore::new(blobs)).await?;
        drive.anchor().await?;
        Ok(drive)
    }

    async fn anchor(&self) -> DriveResult<()> {
        let own = *self.blobs.core().key();
        let _guard = self.writer.lock().await;
        self.refresh().await?;
        let named = self.header_blobs_key();
        if named == Some(own) {
            return Ok(());
        }
        let header = Node::Header(Header {
            version: DRIVE_VERSION,
            blobs_key: own,
        });
        self.metadata.append(header.encode()?).await?;
        self.refresh().await?;
        info!(
            drive = %self.key().short_id(),
            from = ?named.map(|k| k.short_id()),
            blobs = %own.short_id(),
            "re-anchored drive on its own blob core"
        );
        Ok(())
    }

    /// The metadata and blob cores a writable drive in `store` uses. Opening
    /// them does not write anything, so they can be seeded before the drive
    /// is created.
    pub fn writable_cores(store: &CoreStore) -> DriveResult<(Core, Core)> {
        Ok((
            store.open_writable(METADATA_NAME)?,
            store.open_writable(BLOBS_NAME)?,
        ))
    }

    /// Open a drive replicated from peers. Waits up to `timeout` for its
    /// header to arrive.
    pub async fn open_remote(store: &CoreStore, key: CoreKey, timeout: Duration) -> DriveResult<Self> {
        let metadata = store.open_remote(key)?;
        metadata.wait_for_length(1, timeout).await?;
        let index = SharedIndex::default();
        let length = index.catch_up(&metadata).await?;
        let blobs_key = index
            .read()
            .header(length)
            .map(|h| h.blobs_key)
            .ok_or_else(|| DriveError::CorruptNode {
                index: 0,
                reason: "missing header".into(),
            })?;
        let blobs = store.open_remote(blobs_key)?;
        let blob_end = index.read().blob_end();
        if blob_end > 0 {
            blobs.wait_for_length(blob_end, timeout).await?;
        }
        debug!(drive = %key.short_id(), blobs = %blobs_key.short_id(), length, blob_end, "opened remote drive");
        Ok(Self {
            metadata,
            blobs: BlobStore::new(blobs).with_head_timeout(timeout),
            index,
            writer: Arc::new(Mutex::new(())),
            checkout: None,
        })
    }

    /// Build a drive from already-open cores. The metadata core must already
    /// hold a header.
    pub async fn from_cores(metadata: Core, blobs: BlobStore) -> DriveResult<Self> {
        let drive = Self {
            metadata,
            blobs,
            index: SharedIndex::default(),
            writer: Arc::new(Mutex::new(())),
            checkout: None,
        };
        drive.refresh().await?;
        Ok(drive)
    }

    pub fn key(&self) -> &CoreKey {
        self.metadata.key()
    }

    /// Swarm topic of this drive.
    pub fn discovery_key(&self) -> DiscoveryKey {
        self.metadata.discovery_key()
    }

    pub fn metadata(&self) -> &Core {
        &self.metadata
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Number of metadata blocks visible to this handle.
    pub fn length(&self) -> u64 {
        self.checkout.unwrap_or_else(|| self.metadata.length())
    }

    /// Whether this handle is a read-only checkout.
    pub fn is_checkout(&self) -> bool {
        self.checkout.is_some()
    }

    pub fn writable(&self) -> bool {
        self.checkout.is_none() && self.metadata.writable() && self.blobs.core().writable()
    }

    /// Index any metadata blocks appended since the last call.
    pub async fn refresh(&self) -> DriveResult<u64> {
        self.index.catch_up(&self.metadata).await
    }

    /// Read-only view pinned at `length`.
    pub async fn checkout(&self, length: u64) -> DriveResult<Drive> {
        let available = self.metadata.length();
        if length > available {
            return Err(DriveError::InvalidLength { length, available });
        }
        self.refresh().await?;
        Ok(Self {
            checkout: Some(length),
            ..self.clone()
        })
    }

    pub(crate) fn header_blobs_key(&self) -> Option<CoreKey> {
        self.index.read().header(self.length()).map(|h| h.blobs_key)
    }

    async fn visible_length(&self) -> DriveResult<u64> {
        if self.index.read().indexed() < self.length() {
            self.refresh().await?;
        }
        Ok(self.length())
    }

    /// Latest live entry for `key`, if any.
    pub async fn entry(&self, key: &str) -> DriveResult<Option<Entry>> {
        let length = self.visible_length().await?;
        Ok(self.index.read().entry(&normalize_key(key), length))
    }

    /// Bytes stored under `key`.
    pub async fn get(&self, key: &str) -> DriveResult<Bytes> {
        let key = normalize_key(key);
        let entry = self
            .entry(&key)
            .await?
            .ok_or_else(|| DriveError::NotFound(key.clone()))?;
        self.read_value(&key, &entry.value).await
    }

    /// Resolve a value to its bytes, verifying blob content against its
    /// digest.
    pub async fn read_value(&self, key: &str, value: &EntryValue) -> DriveResult<Bytes> {
        match value {
            EntryValue::Inline(data) => Ok(data.clone()),
            EntryValue::Blob { blob, hash } => {
                let data = self.blobs.get(blob).await?;
                if content_hash(&data) != *hash {
                    return Err(DriveError::HashMismatch {
                        key: key.to_string(),
                    });
                }
                Ok(data)
            }
        }
    }

    /// Lazy iterator over live entries in ascending key order.
    pub async fn entries(&self) -> DriveResult<Entries> {
        let length = self.visible_length().await?;
        Ok(Entries::new(self.index.clone(), length))
    }

    /// Start a batch. Holds the drive's write lock until flushed or dropped.
    pub async fn batch(&self) -> DriveResult<DriveBatch> {
        if !self.writable() {
            return Err(DriveError::ReadOnly);
        }
        let guard = Arc::clone(&self.writer).lock_owned().await;
        self.refresh().await?;
        Ok(DriveBatch::new(self.clone(), guard))
    }

    pub async fn put(&self, key: &str, data: impl Into<Bytes>) -> DriveResult<u64> {
        let mut batch = self.batch().await?;
        batch.put(key, data).await?;
        batch.flush().await
    }

    /// Point `key` at bytes already stored in this drive's blob core.
    pub async fn put_ref(&self, key: &str, blob: BlobRef, hash: Digest) -> DriveResult<u64> {
        let mut batch = self.batch().await?;
        batch.put_ref(key, blob, hash);
        batch.flush().await
    }

    pub async fn del(&self, key: &str) -> DriveResult<u64> {
        let mut batch = self.batch().await?;
        batch.del(key);
        batch.flush().await
    }

    /// Current value of a setting. A stored value that is not valid JSON is
    /// an error, distinct from the setting being absent.
    pub async fn get_setting(&self, name: &str) -> DriveResult<Option<Value>> {
        let length = self.visible_length().await?;
        let index = self.index.read();
        match index.setting(name, length) {
            None => Ok(None),
            Some(raw) => serde_json::from_str(raw)
                .map(Some)
                .map_err(|e| DriveError::InvalidSetting {
                    name: name.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    /// Every live setting.
    pub async fn settings(&self) -> DriveResult<BTreeMap<String, Value>> {
        let length = self.visible_length().await?;
        let names = self.index.read().setting_names(length);
        let mut out = BTreeMap::new();
        for name in names {
            if let Some(value) = self.get_setting(&name).await? {
                out.insert(name, value);
            }
        }
        Ok(out)
    }

    pub async fn set_setting(&self, name: &str, value: &Value) -> DriveResult<u64> {
        let mut batch = self.batch().await?;
        batch.set_setting(name, value)?;
        batch.flush().await
    }

    pub async fn del_setting(&self, name: &str) -> DriveResult<u64> {
        let mut batch = self.batch().await?;
        batch.del_setting(name);
        batch.flush().await
    }

    /// Close both cores.
    pub async fn close(&self) -> DriveResult<()> {
        self.metadata.close().await?;
        self.blobs.core().close().await?;
        info!(drive = %self.key().short_id(), "drive closed");
        Ok(())
    }
}

impl std::fmt::Debug for Drive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drive")
            .field("key", &self.key().short_id())
            .field("length", &self.length())
            .field("checkout", &self.checkout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BLOB_SPILL_BLOCKS, INLINE_THRESHOLD};
    use crate::blobs::BLOB_BLOCK_SIZE;
    use proptest::prelude::*;
    use serde_json::json;

    async fn drive() -> Drive {
        Drive::open_writable(&CoreStore::memory().namespace("test"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn put_get_overwrite_delete() {
        let drive = drive().await;
        drive.put("/a", &b"one"[..]).await.unwrap();
        drive.put("a", &b"two"[..]).await.unwrap();
        assert_eq!(drive.get("/a").await.unwrap(), Bytes::from_static(b"two"));

        drive.del("/a").await.unwrap();
        assert!(matches!(drive.get("/a").await, Err(DriveError::NotFound(k)) if k == "/a"));
        assert!(matches!(drive.get("/never").await, Err(DriveError::NotFound(_))));
    }

    #[tokio::test]
    async fn large_values_go_to_blob_store() {
        let drive = drive().await;
        let big = vec![7u8; INLINE_THRESHOLD + 1];
        drive.put("/big", big.clone()).await.unwrap();
        drive.put("/small", vec![1u8; INLINE_THRESHOLD - 1]).await.unwrap();

        let entry = drive.entry("/big").await.unwrap().unwrap();
        assert!(matches!(entry.value, EntryValue::Blob { .. }));
        assert!(matches!(
            drive.entry("/small").await.unwrap().unwrap().value,
            EntryValue::Inline(_)
        ));
        assert_eq!(drive.get("/big").await.unwrap().as_ref(), big.as_slice());
        assert_eq!(drive.blobs().core().length(), 1);
    }

    #[tokio::test]
    async fn checkout_sees_prefix_only() {
        let drive = drive().await;
        drive.put("/a", &b"1"[..]).await.unwrap();
        let after_a = drive.length();
        drive.put("/a", &b"2"[..]).await.unwrap();
        drive.put("/b", &b"3"[..]).await.unwrap();

        let old = drive.checkout(after_a).await.unwrap();
        assert!(old.is_checkout());
        assert_eq!(old.get("/a").await.unwrap(), Bytes::from_static(b"1"));
        assert!(matches!(old.get("/b").await, Err(DriveError::NotFound(_))));
        assert!(matches!(old.put("/c", &b"x"[..]).await, Err(DriveError::ReadOnly)));
        assert_eq!(drive.get("/a").await.unwrap(), Bytes::from_static(b"2"));
    }

    #[tokio::test]
    async fn checkout_beyond_length_is_invalid() {
        let drive = drive().await;
        let too_far = drive.length() + 1;
        assert!(matches!(
            drive.checkout(too_far).await,
            Err(DriveError::InvalidLength { .. })
        ));
    }

    #[tokio::test]
    async fn delete_then_readd_is_visible() {
        let drive = drive().await;
        drive.put("/k", &b"v1"[..]).await.unwrap();
        drive.del("/k").await.unwrap();
        let deleted_at = drive.length();
        drive.put("/k", &b"v2"[..]).await.unwrap();
        assert!(drive.checkout(deleted_at).await.unwrap().get("/k").await.is_err());
        assert_eq!(drive.get("/k").await.unwrap(), Bytes::from_static(b"v2"));
    }

    #[tokio::test]
    async fn entries_are_sorted_and_restartable() {
        let drive = drive().await;
        for key in ["/c", "/a", "/b"] {
            drive.put(key, key.as_bytes().to_vec()).await.unwrap();
        }
        let mut entries = drive.entries().await.unwrap();
        let first: Vec<_> = entries.by_ref().map(|e| e.key).collect();
        entries.rewind();
        let second: Vec<_> = entries.map(|e| e.key).collect();
        assert_eq!(first, vec!["/a", "/b", "/c"]);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn batch_commits_atomically() {
        let drive = drive().await;
        let before = drive.length();
        let mut batch = drive.batch().await.unwrap();
        batch.put("/x", &b"1"[..]).await.unwrap();
        batch.put("/y", vec![0u8; INLINE_THRESHOLD * 20]).await.unwrap();
        batch.del("/z");
        assert_eq!(batch.len(), 3);
        assert_eq!(drive.length(), before);
        let length = batch.flush().await.unwrap();
        assert_eq!(length, before + 3);
        assert_eq!(drive.get("/y").await.unwrap().len(), INLINE_THRESHOLD * 20);
    }

    #[tokio::test]
    async fn dropped_batch_writes_nothing() {
        let drive = drive().await;
        let before = drive.length();
        {
            let mut batch = drive.batch().await.unwrap();
            batch.put("/x", vec![1u8; INLINE_THRESHOLD * 2]).await.unwrap();
        }
        assert_eq!(drive.length(), before);
        assert_eq!(drive.blobs().core().length(), 0);
        assert!(drive.entry("/x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn large_batches_spill_blob_blocks_before_commit() {
        let drive = drive().await;
        let before = drive.length();
        let limit = (BLOB_SPILL_BLOCKS * BLOB_BLOCK_SIZE) as u64;
        let file = BLOB_BLOCK_SIZE * 16;

        let mut batch = drive.batch().await.unwrap();
        for i in 0..8u8 {
            batch.put(&format!("/file{i}"), vec![i; file]).await.unwrap();
            assert!(batch.buffered_blob_bytes() < limit);
        }
        assert_eq!(batch.staged_blob_bytes(), 8 * file as u64);
        // Blob blocks are written, but nothing is visible before the commit.
        assert_eq!(drive.blobs().core().length(), 128);
        assert_eq!(drive.length(), before);
        assert!(drive.entry("/file0").await.unwrap().is_none());

        batch.flush().await.unwrap();
        assert_eq!(drive.length(), before + 8);
        for i in 0..8u8 {
            assert_eq!(drive.get(&format!("/file{i}")).await.unwrap(), vec![i; file]);
        }
    }

    #[tokio::test]
    async fn opening_seeded_cores_reanchors_header() {
        let prod_store = CoreStore::memory().namespace("prod");
        let prod = Drive::open_writable(&prod_store).await.unwrap();
        prod.put("/app.bin", vec![5u8; INLINE_THRESHOLD * 2]).await.unwrap();

        let release_store = CoreStore::memory().namespace("release");
        let (metadata, blobs) = Drive::writable_cores(&release_store).unwrap();
        for index in 0..prod.metadata().length() {
            metadata.append(prod.metadata().get(index).await.unwrap()).await.unwrap();
        }
        for index in 0..prod.blobs().core().length() {
            blobs.append(prod.blobs().core().get(index).await.unwrap()).await.unwrap();
        }

        let release = Drive::open_writable(&release_store).await.unwrap();
        assert_eq!(release.length(), prod.length() + 1);
        assert_eq!(release.header_blobs_key(), Some(*blobs.key()));
        assert_eq!(release.get("/app.bin").await.unwrap(), prod.get("/app.bin").await.unwrap());

        let again = Drive::open_writable(&release_store).await.unwrap();
        assert_eq!(again.length(), release.length());
    }

    #[tokio::test]
    async fn settings_roundtrip_and_stay_out_of_entries() {
        let drive = drive().await;
        drive.set_setting("channel", &json!("stable")).await.unwrap();
        drive
            .set_setting("metadata", &json!({"title": "app"}))
            .await
            .unwrap();
        assert_eq!(drive.get_setting("channel").await.unwrap(), Some(json!("stable")));
        assert_eq!(drive.settings().await.unwrap().len(), 2);
        assert_eq!(drive.entries().await.unwrap().count(), 0);

        drive.del_setting("channel").await.unwrap();
        assert_eq!(drive.get_setting("channel").await.unwrap(), None);
    }

    #[tokio::test]
    async fn reopen_restores_contents() {
        let store = CoreStore::memory().namespace("release");
        let drive = Drive::open_writable(&store).await.unwrap();
        drive.put("/a", &b"kept"[..]).await.unwrap();
        let length = drive.length();

        let again = Drive::open_writable(&store).await.unwrap();
        assert_eq!(again.length(), length);
        assert_eq!(again.get("/a").await.unwrap(), Bytes::from_static(b"kept"));
    }

    proptest! {
        #[test]
        fn checkout_equals_replay(
            ops in proptest::collection::vec((0u8..4, proptest::option::of(0u8..8)), 1..24),
            cut in 0usize..24,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let drive = drive().await;
                for (key, value) in &ops {
                    let key = format!("/k{key}");
                    match value {
                        Some(v) => drive.put(&key, vec![*v]).await.unwrap(),
                        None => drive.del(&key).await.unwrap(),
                    };
                }

                // Block 0 is the header; op i lives at block i + 1.
                let cut = cut.min(ops.len());
                let view = drive.checkout(cut as u64 + 1).await.unwrap();
                let mut expected: BTreeMap<String, Option<u8>> = BTreeMap::new();
                for (key, value) in &ops[..cut] {
                    expected.insert(format!("/k{key}"), *value);
                }
                for key in 0u8..4 {
                    let key = format!("/k{key}");
                    let got = view.get(&key).await.ok().map(|b| b[0]);
                    assert_eq!(got, expected.get(&key).copied().flatten());
                }
            });
        }
    }
}
