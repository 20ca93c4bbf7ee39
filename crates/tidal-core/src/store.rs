//! The core store: one place that opens, caches and replicates every log of a
//! process.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tidal_crypto::SigningKey;
use tidal_types::{CoreKey, DiscoveryKey};
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::local::LocalLog;
use crate::remote::{RemoteLog, DEFAULT_FETCH_TIMEOUT};
use crate::replication::{PeerLink, PeerRouter};
use crate::storage::{BlockStorage, FileStorage, MemoryStorage, SyncMode};
use crate::traits::{BlockSource, Core};

const PRIMARY_KEY_FILE: &str = "primary-key";
const CORES_DIR: &str = "cores";

/// Where a store keeps its blocks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageMode {
    Memory,
    Directory(PathBuf),
}

/// Store-wide tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Upper bound on one remote block fetch.
    #[serde(with = "duration_secs")]
    pub fetch_timeout: Duration,
    /// `fsync` after every append.
    pub sync_every_write: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            sync_every_write: false,
        }
    }
}

impl StoreConfig {
    fn sync_mode(&self) -> SyncMode {
        if self.sync_every_write {
            SyncMode::EveryWrite
        } else {
            SyncMode::OsDefault
        }
    }
}

struct Shared {
    mode: StorageMode,
    seed: [u8; 32],
    config: StoreConfig,
    cores: RwLock<HashMap<DiscoveryKey, Core>>,
    router: Arc<PeerRouter>,
}

/// Opens logs by name or key and shares one peer router among all of them.
///
/// Namespaced handles ([`CoreStore::namespace`]) share the same cores and
/// router; only the names used to derive writable keys differ.
#[derive(Clone)]
pub struct CoreStore {
    shared: Arc<Shared>,
    namespace: String,
}

impl CoreStore {
    /// Open a store, creating its primary key on first use.
    pub fn open(mode: StorageMode, config: StoreConfig) -> CoreResult<Self> {
        let seed = match &mode {
            StorageMode::Memory => rand::random::<[u8; 32]>(),
            StorageMode::Directory(dir) => load_or_create_seed(dir)?,
        };
        info!(mode = ?mode, "core store opened");
        Ok(Self::with_seed(mode, seed, config))
    }

    /// In-memory store with default settings.
    pub fn memory() -> Self {
        Self::with_seed(
            StorageMode::Memory,
            rand::random::<[u8; 32]>(),
            StoreConfig::default(),
        )
    }

    fn with_seed(mode: StorageMode, seed: [u8; 32], config: StoreConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                mode,
                seed,
                config,
                cores: RwLock::new(HashMap::new()),
                router: Arc::new(PeerRouter::new()),
            }),
            namespace: String::new(),
        }
    }

    /// A handle whose writable cores are derived under `name`.
    pub fn namespace(&self, name: &str) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            namespace: self.qualify(name),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    /// Deterministic key pair for `name` in this namespace.
    pub fn create_key_pair(&self, name: &str) -> SigningKey {
        SigningKey::derive(&self.shared.seed, &self.qualify(name))
    }

    /// Open (or create) the writable log `name` in this namespace.
    pub fn open_writable(&self, name: &str) -> CoreResult<Core> {
        let signer = self.create_key_pair(name);
        let key = signer.verifying_key().to_core_key();
        if let Some(core) = self.find(&key.discovery_key()) {
            return Ok(core);
        }
        let storage = self.storage_for(&key)?;
        let core: Core = Arc::new(LocalLog::open(signer, storage)?);
        debug!(name = %self.qualify(name), core = %key.short_id(), "writable core opened");
        Ok(self.register(core))
    }

    /// Open the log with `key`, replicated from peers unless it is already
    /// open in this store.
    pub fn open_remote(&self, key: CoreKey) -> CoreResult<Core> {
        if let Some(core) = self.find(&key.discovery_key()) {
            return Ok(core);
        }
        let storage = self.storage_for(&key)?;
        let source: Arc<dyn BlockSource> = self.shared.router.clone();
        let core: Core = Arc::new(RemoteLog::new(
            key,
            storage,
            source,
            self.shared.config.fetch_timeout,
        ));
        Ok(self.register(core))
    }

    /// Look up an open log by discovery key.
    pub fn find(&self, discovery_key: &DiscoveryKey) -> Option<Core> {
        self.shared
            .cores
            .read()
            .expect("store lock poisoned")
            .get(discovery_key)
            .cloned()
    }

    /// Every open log.
    pub fn cores(&self) -> Vec<Core> {
        self.shared
            .cores
            .read()
            .expect("store lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Attach a peer connection. All logs of the store replicate over it.
    pub fn replicate(&self, link: Arc<dyn PeerLink>) {
        for core in self.cores() {
            link.announce(&core.discovery_key());
        }
        self.shared.router.add_link(link);
    }

    pub fn router(&self) -> &Arc<PeerRouter> {
        &self.shared.router
    }

    /// Close every open log.
    pub async fn close(&self) -> CoreResult<()> {
        let cores = self.cores();
        let mut first_err = None;
        for core in cores {
            if let Err(e) = core.close().await {
                warn!(core = %core.key().short_id(), error = %e, "failed to close core");
                first_err.get_or_insert(e);
            }
        }
        info!("core store closed");
        first_err.map_or(Ok(()), Err)
    }

    fn register(&self, core: Core) -> Core {
        let discovery_key = core.discovery_key();
        let core = {
            let mut cores = self.shared.cores.write().expect("store lock poisoned");
            cores.entry(discovery_key).or_insert(core).clone()
        };
        self.shared.router.announce(&discovery_key);
        core
    }

    fn qualify(&self, name: &str) -> String {
        if self.namespace.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.namespace, name)
        }
    }

    fn storage_for(&self, key: &CoreKey) -> CoreResult<Arc<dyn BlockStorage>> {
        Ok(match &self.shared.mode {
            StorageMode::Memory => Arc::new(MemoryStorage::new()),
            StorageMode::Directory(dir) => {
                let path = dir.join(CORES_DIR).join(format!("{}.blocks", key.to_hex()));
                Arc::new(FileStorage::open(&path, self.shared.config.sync_mode())?)
            }
        })
    }
}

impl std::fmt::Debug for CoreStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreStore")
            .field("mode", &self.shared.mode)
            .field("namespace", &self.namespace)
            .field("cores", &self.cores().len())
            .finish()
    }
}

fn load_or_create_seed(dir: &Path) -> CoreResult<[u8; 32]> {
    fs::create_dir_all(dir)?;
    let path = dir.join(PRIMARY_KEY_FILE);
    if path.exists() {
        let bytes = fs::read(&path)?;
        return bytes.as_slice().try_into().map_err(|_| {
            CoreError::Storage(format!(
                "{} holds {} bytes, expected 32",
                path.display(),
                bytes.len()
            ))
        });
    }
    let seed = rand::random::<[u8; 32]>();
    fs::write(&path, seed)?;
    info!(path = %path.display(), "created primary key");
    Ok(seed)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
