//! Block-for-block seeding of a destination from a known-good source.

use tidal_core::{Core, CoreError};
use tidal_drive::Drive;
use tracing::{debug, info};

use crate::error::{MirrorError, MirrorResult};

/// Blocks fetched before each destination append.
const HYDRATE_CHUNK: u64 = 64;

/// Copy blocks of `src` into `dst` until their lengths match. Returns the
/// number of blocks copied.
///
/// `dst` must be a prefix of `src`; afterwards both have the same length and
/// tree hash.
pub async fn hydrate(src: &Core, dst: &Core) -> MirrorResult<u64> {
    if !dst.writable() {
        return Err(CoreError::Unauthorized.into());
    }
    let target = src.length();
    let start = dst.length();
    if start > target {
        return Err(MirrorError::HydrationMismatch(format!(
            "destination has {start} blocks, source only {target}"
        )));
    }

    while dst.length() < target {
        let from = dst.length();
        let to = (from + HYDRATE_CHUNK).min(target);
        let mut blocks = Vec::with_capacity((to - from) as usize);
        for index in from..to {
            blocks.push(src.get(index).await?);
        }
        dst.append_batch(blocks).await?;
        debug!(from, to, target, "hydrated chunk");
    }

    if dst.length() == src.length() && dst.tree_hash() != src.tree_hash() {
        return Err(MirrorError::HydrationMismatch(format!(
            "tree hash {} differs from source {}",
            dst.tree_hash().short_hex(),
            src.tree_hash().short_hex()
        )));
    }
    Ok(target - start)
}

/// Seed a drive's cores from `src`: metadata first, then blobs.
///
/// Returns the number of (metadata, blob) blocks copied. Open the destination
/// drive over `dst_metadata` and `dst_blobs` afterwards.
pub async fn hydrate_drive(src: &Drive, dst_metadata: &Core, dst_blobs: &Core) -> MirrorResult<(u64, u64)> {
    let metadata = hydrate(src.metadata(), dst_metadata).await?;
    let blobs = hydrate(src.blobs().core(), dst_blobs).await?;
    info!(
        source = %src.key().short_id(),
        metadata_blocks = metadata,
        blob_blocks = blobs,
        "hydrated drive"
    );
    Ok((metadata, blobs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tidal_core::CoreStore;
    use tidal_drive::{BlobStore, INLINE_THRESHOLD};

    #[tokio::test]
    async fn hydrate_matches_length_and_tree_hash() {
        let store = CoreStore::memory();
        let src = store.open_writable("prod").unwrap();
        for i in 0..150u32 {
            src.append(Bytes::from(i.to_le_bytes().to_vec())).await.unwrap();
        }
        let dst = store.open_writable("release").unwrap();
        assert_eq!(hydrate(&src, &dst).await.unwrap(), 150);
        assert_eq!(dst.length(), src.length());
        assert_eq!(dst.tree_hash(), src.tree_hash());
        assert_eq!(hydrate(&src, &dst).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn diverged_destination_is_detected() {
        let store = CoreStore::memory();
        let src = store.open_writable("prod").unwrap();
        src.append_batch(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")])
            .await
            .unwrap();
        let dst = store.open_writable("release").unwrap();
        dst.append(Bytes::from_static(b"not a")).await.unwrap();
        assert!(matches!(
            hydrate(&src, &dst).await,
            Err(MirrorError::HydrationMismatch(_))
        ));
    }

    #[tokio::test]
    async fn hydrated_drive_reads_like_source() {
        let prod_store = CoreStore::memory().namespace("prod");
        let prod = Drive::open_writable(&prod_store).await.unwrap();
        prod.put("/package.json", &br#"{"version":"1.0.0"}"#[..]).await.unwrap();
        prod.put("/app.bin", vec![3u8; INLINE_THRESHOLD * 2]).await.unwrap();

        let release_store = CoreStore::memory().namespace("release");
        let (metadata, blobs) = Drive::writable_cores(&release_store).unwrap();
        let copied = hydrate_drive(&prod, &metadata, &blobs).await.unwrap();
        assert_eq!(copied, (prod.metadata().length(), prod.blobs().core().length()));
        assert_eq!(metadata.tree_hash(), prod.metadata().tree_hash());
        assert_eq!(blobs.tree_hash(), prod.blobs().core().tree_hash());

        let release = Drive::from_cores(metadata, BlobStore::new(blobs)).await.unwrap();
        assert_eq!(release.length(), prod.length());
        assert_eq!(
            release.get("/app.bin").await.unwrap(),
            prod.get("/app.bin").await.unwrap()
        );

        // The first write re-anchors the header on the release blob core.
        let before = release.length();
        release.put("/new", &b"x"[..]).await.unwrap();
        assert_eq!(release.length(), before + 2);
        assert_eq!(release.get("/app.bin").await.unwrap().len(), INLINE_THRESHOLD * 2);
    }

    #[tokio::test]
    async fn read_only_destination_is_unauthorized() {
        let store = CoreStore::memory();
        let src = store.open_writable("prod").unwrap();
        let dst = store.open_remote(tidal_types::CoreKey::ephemeral()).unwrap();
        assert!(matches!(
            hydrate(&src, &dst).await,
            Err(MirrorError::Core(CoreError::Unauthorized))
        ));
    }
}
