//! Topic joins over TCP, one connection per peer node.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tidal_core::CoreStore;
use tidal_types::{CoreKey, DiscoveryKey};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SwarmConfig;
use crate::connection::{handshake, Connection};
use crate::discovery::{Discovery, StaticDiscovery};
use crate::error::{SwarmError, SwarmResult};

/// Name under which the swarm's node key is derived from the store.
const NODE_KEY_NAME: &str = "swarm";

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Roles taken for one topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JoinOptions {
    /// Seek out peers for the topic.
    pub client: bool,
    /// Accept peers looking for the topic.
    pub server: bool,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            client: true,
            server: true,
        }
    }
}

impl JoinOptions {
    pub fn client_only() -> Self {
        Self {
            client: true,
            server: false,
        }
    }

    fn merge(self, other: Self) -> Self {
        Self {
            client: self.client || other.client,
            server: self.server || other.server,
        }
    }
}

struct Listener {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

struct SwarmInner {
    store: CoreStore,
    config: SwarmConfig,
    node: CoreKey,
    discovery: Arc<dyn Discovery>,
    topics: Mutex<HashMap<DiscoveryKey, JoinOptions>>,
    connections: Mutex<HashMap<CoreKey, Arc<Connection>>>,
    listener: Mutex<Option<Listener>>,
    destroyed: AtomicBool,
}

/// Replicates every core of a store with the peers found for its topics.
///
/// Connections are per peer node, not per topic: once connected, all cores
/// either side has open replicate over the same stream.
#[derive(Clone)]
pub struct Swarm {
    inner: Arc<SwarmInner>,
}

impl Swarm {
    /// Swarm over `store` using the static peer list from `config`.
    pub fn new(store: CoreStore, config: SwarmConfig) -> Self {
        let discovery = Arc::new(StaticDiscovery::new(config.peers.clone()));
        Self::with_discovery(store, config, discovery)
    }

    pub fn with_discovery(store: CoreStore, config: SwarmConfig, discovery: Arc<dyn Discovery>) -> Self {
        let node = store
            .create_key_pair(NODE_KEY_NAME)
            .verifying_key()
            .to_core_key();
        Self {
            inner: Arc::new(SwarmInner {
                store,
                config,
                node,
                discovery,
                topics: Mutex::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                listener: Mutex::new(None),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// This node's identity on the wire.
    pub fn node(&self) -> &CoreKey {
        &self.inner.node
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.inner.config
    }

    /// Address the server role listens on, once a server topic is joined.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .listener
            .lock()
            .expect("swarm lock poisoned")
            .as_ref()
            .map(|l| l.addr)
    }

    pub fn connection_count(&self) -> usize {
        self.inner
            .connections
            .lock()
            .expect("swarm lock poisoned")
            .len()
    }

    /// Roles currently held for `topic`.
    pub fn joined(&self, topic: &DiscoveryKey) -> Option<JoinOptions> {
        self.inner
            .topics
            .lock()
            .expect("swarm lock poisoned")
            .get(topic)
            .copied()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Join `topic`. A server role starts the listener; a client role dials
    /// every peer discovery returns and waits for those handshakes to finish.
    /// Peers that cannot be reached are logged and skipped.
    pub async fn join(&self, topic: DiscoveryKey, options: JoinOptions) -> SwarmResult<()> {
        self.check_alive()?;
        {
            let mut topics = self.inner.topics.lock().expect("swarm lock poisoned");
            let roles = topics
                .get(&topic)
                .map_or(options, |held| held.merge(options));
            topics.insert(topic, roles);
        }

        if options.server {
            self.listen().await?;
        }
        if options.client {
            for addr in self.inner.discovery.lookup(&topic).await? {
                if let Err(e) = self.connect(addr).await {
                    warn!(%addr, topic = %topic.short_id(), error = %e, "peer unreachable");
                }
            }
        }
        info!(
            topic = %topic.short_id(),
            client = options.client,
            server = options.server,
            connections = self.connection_count(),
            "joined topic"
        );
        Ok(())
    }

    /// Dial `addr` unless a live connection to it already exists.
    pub async fn connect(&self, addr: SocketAddr) -> SwarmResult<()> {
        self.check_alive()?;
        if self.connected_to(addr) {
            debug!(%addr, "already connected");
            return Ok(());
        }
        let stream = tokio::time::timeout(
            self.inner.config.handshake_timeout(),
            TcpStream::connect(addr),
        )
        .await
        .map_err(|_| SwarmError::HandshakeTimeout {
            addr: addr.to_string(),
        })??;
        self.attach(stream, addr, true).await
    }

    /// Stop listening, close every connection and forget all topics. Cores
    /// stay open.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(listener) = self.inner.listener.lock().expect("swarm lock poisoned").take() {
            listener.task.abort();
        }
        let connections: Vec<Arc<Connection>> = self
            .inner
            .connections
            .lock()
            .expect("swarm lock poisoned")
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in &connections {
            conn.close().await;
        }
        self.inner.topics.lock().expect("swarm lock poisoned").clear();
        info!(connections = connections.len(), "swarm destroyed");
    }

    fn check_alive(&self) -> SwarmResult<()> {
        if self.is_destroyed() {
            Err(SwarmError::Destroyed)
        } else {
            Ok(())
        }
    }

    fn connected_to(&self, addr: SocketAddr) -> bool {
        self.inner
            .connections
            .lock()
            .expect("swarm lock poisoned")
            .values()
            .any(|conn| conn.addr() == addr && !conn.is_closed())
    }

    async fn listen(&self) -> SwarmResult<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }
        let listener = TcpListener::bind(self.inner.config.listen_addr).await?;
        let addr = listener.local_addr()?;

        let mut slot = self.inner.listener.lock().expect("swarm lock poisoned");
        if let Some(existing) = slot.as_ref() {
            return Ok(existing.addr);
        }
        let swarm = self.clone();
        let task = tokio::spawn(async move { swarm.accept_loop(listener).await });
        *slot = Some(Listener { addr, task });
        info!(%addr, node = %self.inner.node.short_id(), "swarm listening");
        Ok(addr)
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let swarm = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = swarm.attach(stream, addr, false).await {
                            warn!(%addr, error = %e, "inbound connection failed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    /// Handshake, keep at most one connection per node, and hand the result
    /// to the store for replication.
    async fn attach(&self, mut stream: TcpStream, addr: SocketAddr, dialed: bool) -> SwarmResult<()> {
        stream.set_nodelay(true)?;
        let node = self.inner.node;
        let remote = tokio::time::timeout(
            self.inner.config.handshake_timeout(),
            handshake(&mut stream, node),
        )
        .await
        .map_err(|_| SwarmError::HandshakeTimeout {
            addr: addr.to_string(),
        })??;
        if remote == node {
            debug!(%addr, "dropping connection to self");
            return Ok(());
        }
        let initiator = if dialed { node } else { remote };

        let (conn, reader, replaced) = {
            let mut connections = self.inner.connections.lock().expect("swarm lock poisoned");
            if self.is_destroyed() {
                return Err(SwarmError::Destroyed);
            }
            // Both sides keep the connection dialed by the smaller node key.
            if let Some(existing) = connections.get(&remote) {
                if !existing.is_closed() && initiator >= *existing.initiator() {
                    debug!(peer = %remote.short_id(), %addr, "duplicate connection dropped");
                    return Ok(());
                }
            }
            let (conn, reader) =
                Connection::start(stream, remote, initiator, addr, self.inner.store.clone());
            let replaced = connections.insert(remote, Arc::clone(&conn));
            (conn, reader, replaced)
        };

        if let Some(old) = replaced {
            debug!(peer = %remote.short_id(), link = old.id(), "replacing connection");
            old.close().await;
        }
        self.inner.store.replicate(conn.clone());

        let swarm = self.clone();
        tokio::spawn(async move {
            match reader.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(peer = %remote.short_id(), error = %e, "connection failed"),
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!(peer = %remote.short_id(), error = %e, "connection task panicked"),
            }
            swarm.forget(&conn);
        });
        Ok(())
    }

    fn forget(&self, conn: &Arc<Connection>) {
        let mut connections = self.inner.connections.lock().expect("swarm lock poisoned");
        if connections
            .get(conn.remote())
            .is_some_and(|current| current.id() == conn.id())
        {
            connections.remove(conn.remote());
        }
    }
}

impl std::fmt::Debug for Swarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swarm")
            .field("node", &self.inner.node)
            .field("connections", &self.connection_count())
            .field("listening", &self.local_addr())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
