//! One live connection to a peer node, shared by every core of the store.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tidal_core::{
    link_closed, BlockResponse, Core, CoreError, CoreEvent, CoreResult, CoreStore, EventStream,
    PeerLink,
};
use tidal_types::{CoreKey, DiscoveryKey};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::codec::WireCodec;
use crate::error::{SwarmError, SwarmResult};
use crate::message::{WireMessage, PROTOCOL_VERSION};

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// How long a closing connection may spend flushing queued frames.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

type Outbound = mpsc::UnboundedSender<WireMessage>;
type Pending = Mutex<HashMap<u64, oneshot::Sender<CoreResult<BlockResponse>>>>;

/// Exchange `Hello` frames and return the remote node's key.
pub async fn handshake<S>(stream: &mut S, node: CoreKey) -> SwarmResult<CoreKey>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    WireCodec::write(
        stream,
        &WireMessage::Hello {
            version: PROTOCOL_VERSION,
            node,
        },
    )
    .await?;
    match WireCodec::read(stream).await? {
        Some(WireMessage::Hello { version, node }) => {
            if version != PROTOCOL_VERSION {
                return Err(SwarmError::VersionMismatch {
                    local: PROTOCOL_VERSION,
                    remote: version,
                });
            }
            Ok(node)
        }
        Some(other) => Err(SwarmError::Protocol(format!(
            "expected Hello, got {}",
            other.type_name()
        ))),
        None => Err(SwarmError::Protocol("closed during handshake".into())),
    }
}

/// A peer connection carrying every core both stores have open.
///
/// Each message names its core by discovery key. Block requests are matched
/// to replies by id; appends on writable local cores are pushed to the peer
/// as fresh signed heads.
pub struct Connection {
    id: u64,
    remote: CoreKey,
    initiator: CoreKey,
    addr: SocketAddr,
    store: CoreStore,
    outbound: Mutex<Option<Outbound>>,
    remote_has: RwLock<HashSet<DiscoveryKey>>,
    announced: Mutex<HashSet<DiscoveryKey>>,
    pending: Pending,
    next_request: AtomicU64,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
    reader: Mutex<Option<AbortHandle>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    runtime: Handle,
    closed: AtomicBool,
}

impl Connection {
    /// Start the reader and writer tasks over an already handshaken stream.
    ///
    /// The returned handle resolves when the peer goes away or the
    /// connection is closed. Must be called from within a tokio runtime.
    pub fn start<S>(
        stream: S,
        remote: CoreKey,
        initiator: CoreKey,
        addr: SocketAddr,
        store: CoreStore,
    ) -> (Arc<Self>, JoinHandle<SwarmResult<()>>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        let runtime = Handle::current();
        let conn = Arc::new(Self {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            initiator,
            addr,
            store,
            outbound: Mutex::new(Some(tx)),
            remote_has: RwLock::new(HashSet::new()),
            announced: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(0),
            forwarders: Mutex::new(Vec::new()),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            runtime: runtime.clone(),
            closed: AtomicBool::new(false),
        });

        let writer = runtime.spawn(write_loop(write_half, rx));
        *conn.writer.lock().expect("connection lock poisoned") = Some(writer);

        let reader = {
            let conn = Arc::clone(&conn);
            runtime.spawn(async move {
                let result = conn.read_loop(read_half).await;
                conn.shutdown();
                result
            })
        };
        *conn.reader.lock().expect("connection lock poisoned") = Some(reader.abort_handle());

        info!(peer = %remote.short_id(), %addr, link = conn.id, "peer connected");
        (conn, reader)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Node key of the peer.
    pub fn remote(&self) -> &CoreKey {
        &self.remote
    }

    /// Node key of the side that dialed.
    pub fn initiator(&self) -> &CoreKey {
        &self.initiator
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop reading, flush queued frames and release the stream.
    pub async fn close(&self) {
        if let Some(reader) = self.reader.lock().expect("connection lock poisoned").take() {
            reader.abort();
        }
        self.shutdown();
        let writer = self.writer.lock().expect("connection lock poisoned").take();
        if let Some(writer) = writer {
            if tokio::time::timeout(DRAIN_TIMEOUT, writer).await.is_err() {
                debug!(link = self.id, "writer did not drain in time");
            }
        }
    }

    /// Tear down state. Idempotent; the writer finishes on its own once the
    /// outbound queue is released.
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.outbound.lock().expect("connection lock poisoned").take();
        self.pending.lock().expect("connection lock poisoned").clear();
        for task in self.forwarders.lock().expect("connection lock poisoned").drain(..) {
            task.abort();
        }
        self.store.router().remove_link(self.id);
        info!(peer = %self.remote.short_id(), link = self.id, "peer disconnected");
    }

    fn send(&self, msg: WireMessage) -> CoreResult<()> {
        let outbound = self.outbound.lock().expect("connection lock poisoned");
        match outbound.as_ref() {
            Some(tx) => tx.send(msg).map_err(|_| link_closed()),
            None => Err(link_closed()),
        }
    }

    async fn read_loop<R>(&self, mut reader: R) -> SwarmResult<()>
    where
        R: AsyncRead + Unpin,
    {
        while let Some(msg) = WireCodec::read(&mut reader).await? {
            self.handle(msg)?;
        }
        Ok(())
    }

    fn handle(&self, msg: WireMessage) -> SwarmResult<()> {
        match msg {
            WireMessage::Hello { .. } => {
                return Err(SwarmError::Protocol("unexpected Hello after handshake".into()))
            }
            WireMessage::Open { discovery_key } => {
                debug!(link = self.id, topic = %discovery_key.short_id(), "peer opened core");
                if let Some(core) = self.store.find(&discovery_key) {
                    self.send_head(&core)?;
                }
            }
            WireMessage::Have {
                discovery_key,
                head,
            } => {
                self.remote_has
                    .write()
                    .expect("connection lock poisoned")
                    .insert(discovery_key);
                if let Some(core) = self.store.find(&discovery_key) {
                    let length = head.length;
                    match core.update_head(head) {
                        Ok(true) => {
                            debug!(link = self.id, topic = %discovery_key.short_id(), length, "peer advanced head")
                        }
                        Ok(false) => {}
                        Err(e) => {
                            warn!(link = self.id, topic = %discovery_key.short_id(), error = %e, "rejected peer head")
                        }
                    }
                }
            }
            WireMessage::Request {
                id,
                discovery_key,
                index,
            } => {
                let reply = match self.store.find(&discovery_key) {
                    Some(core) => match core.serve(index) {
                        Ok(response) => WireMessage::Data { id, response },
                        Err(e) => WireMessage::NoData {
                            id,
                            reason: e.to_string(),
                        },
                    },
                    None => WireMessage::NoData {
                        id,
                        reason: CoreError::UnknownCore(discovery_key).to_string(),
                    },
                };
                self.send(reply)?;
            }
            WireMessage::Data { id, response } => self.complete(id, Ok(response)),
            WireMessage::NoData { id, reason } => self.complete(id, Err(CoreError::Peer(reason))),
            WireMessage::Close { discovery_key } => {
                self.remote_has
                    .write()
                    .expect("connection lock poisoned")
                    .remove(&discovery_key);
            }
        }
        Ok(())
    }

    fn complete(&self, id: u64, result: CoreResult<BlockResponse>) {
        let waiter = self.pending.lock().expect("connection lock poisoned").remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(link = self.id, id, "reply for unknown request"),
        }
    }

    /// Send the current head of `core` if this replica can serve it.
    fn send_head(&self, core: &Core) -> CoreResult<()> {
        if !core.writable() {
            return Ok(());
        }
        match core.signed_head() {
            Some(head) => self.send(WireMessage::Have {
                discovery_key: core.discovery_key(),
                head,
            }),
            None => Ok(()),
        }
    }

    fn forward_appends(&self, core: Core) {
        let Some(outbound) = self.outbound.lock().expect("connection lock poisoned").clone() else {
            return;
        };
        let events = core.subscribe();
        if self.send_head(&core).is_err() {
            return;
        }
        let task = self.runtime.spawn(push_heads(core, events, outbound));
        self.forwarders
            .lock()
            .expect("connection lock poisoned")
            .push(task);
    }
}

#[async_trait]
impl PeerLink for Connection {
    fn peer_id(&self) -> u64 {
        self.id
    }

    fn has(&self, discovery_key: &DiscoveryKey) -> bool {
        self.remote_has
            .read()
            .expect("connection lock poisoned")
            .contains(discovery_key)
    }

    fn announce(&self, discovery_key: &DiscoveryKey) {
        if self.is_closed()
            || !self
                .announced
                .lock()
                .expect("connection lock poisoned")
                .insert(*discovery_key)
        {
            return;
        }
        if self
            .send(WireMessage::Open {
                discovery_key: *discovery_key,
            })
            .is_err()
        {
            return;
        }
        if let Some(core) = self.store.find(discovery_key) {
            if core.writable() {
                self.forward_appends(core);
            }
        }
    }

    async fn request(&self, discovery_key: &DiscoveryKey, index: u64) -> CoreResult<BlockResponse> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("connection lock poisoned")
            .insert(id, tx);
        let _pending = PendingGuard {
            pending: &self.pending,
            id,
        };
        self.send(WireMessage::Request {
            id,
            discovery_key: *discovery_key,
            index,
        })?;
        rx.await.map_err(|_| link_closed())?
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Drops the pending slot of a request that was cancelled or answered.
struct PendingGuard<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<WireMessage>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        if let Err(e) = WireCodec::write(&mut writer, &msg).await {
            warn!(error = %e, message = msg.type_name(), "write failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Push a fresh head to the peer after every append on `core`.
async fn push_heads(core: Core, mut events: EventStream, outbound: Outbound) {
    let discovery_key = core.discovery_key();
    loop {
        match events.recv().await {
            Ok(CoreEvent::Append { .. }) | Err(RecvError::Lagged(_)) => {
                let Some(head) = core.signed_head() else {
                    continue;
                };
                if outbound
                    .send(WireMessage::Have {
                        discovery_key,
                        head,
                    })
                    .is_err()
                {
                    return;
                }
            }
            Ok(CoreEvent::Closed) | Err(RecvError::Closed) => {
                let _ = outbound.send(WireMessage::Close { discovery_key });
                return;
            }
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn addr() -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    /// Two stores joined by an in-memory stream.
    async fn linked(a: &CoreStore, b: &CoreStore) -> (Arc<Connection>, Arc<Connection>) {
        let (mut left, mut right) = tokio::io::duplex(1 << 20);
        let node_a = CoreKey::ephemeral();
        let node_b = CoreKey::ephemeral();
        let (seen_b, seen_a) = tokio::join!(
            handshake(&mut left, node_a),
            handshake(&mut right, node_b)
        );
        assert_eq!(seen_b.unwrap(), node_b);
        assert_eq!(seen_a.unwrap(), node_a);
        let (ca, _) = Connection::start(left, node_b, node_a, addr(), a.clone());
        let (cb, _) = Connection::start(right, node_a, node_a, addr(), b.clone());
        a.replicate(ca.clone());
        b.replicate(cb.clone());
        (ca, cb)
    }

    #[tokio::test]
    async fn remote_core_reads_through_connection() {
        let writer_store = CoreStore::memory();
        let reader_store = CoreStore::memory();
        let local = writer_store.open_writable("log").unwrap();
        local
            .append_batch(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")])
            .await
            .unwrap();

        let (_ca, _cb) = linked(&writer_store, &reader_store).await;
        let remote = reader_store.open_remote(*local.key()).unwrap();
        remote
            .wait_for_length(2, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(remote.get(1).await.unwrap(), Bytes::from_static(b"b"));
        assert_eq!(remote.tree_hash(), local.tree_hash());

        let mut uploads = local.subscribe();
        local.append(Bytes::from_static(b"c")).await.unwrap();
        remote
            .wait_for_length(3, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(remote.get(2).await.unwrap(), Bytes::from_static(b"c"));
        let mut saw_upload = false;
        while let Ok(event) = uploads.try_recv() {
            saw_upload |= matches!(event, CoreEvent::Upload { index: 2, .. });
        }
        assert!(saw_upload);
    }

    #[tokio::test]
    async fn unknown_core_request_is_answered_with_no_data() {
        let a = CoreStore::memory();
        let b = CoreStore::memory();
        let (_ca, cb) = linked(&a, &b).await;
        let dk = CoreKey::ephemeral().discovery_key();
        let err = cb.request(&dk, 0).await.unwrap_err();
        assert!(matches!(err, CoreError::Peer(_)));
    }

    #[tokio::test]
    async fn close_fails_requests_and_unregisters() {
        let a = CoreStore::memory();
        let b = CoreStore::memory();
        let (ca, cb) = linked(&a, &b).await;
        assert_eq!(b.router().link_count(), 1);
        cb.close().await;
        assert!(cb.is_closed());
        assert_eq!(b.router().link_count(), 0);
        let dk = CoreKey::ephemeral().discovery_key();
        assert!(matches!(cb.request(&dk, 0).await, Err(CoreError::Peer(_))));

        // The other side sees end of stream and shuts down too.
        for _ in 0..100 {
            if ca.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ca.is_closed());
        assert_eq!(a.router().link_count(), 0);
    }

    #[tokio::test]
    async fn handshake_rejects_other_versions() {
        let (mut left, mut right) = tokio::io::duplex(1024);
        let peer = tokio::spawn(async move {
            WireCodec::write(
                &mut right,
                &WireMessage::Hello {
                    version: PROTOCOL_VERSION + 1,
                    node: CoreKey::ephemeral(),
                },
            )
            .await
            .unwrap();
            let _ = WireCodec::read(&mut right).await;
        });
        assert!(matches!(
            handshake(&mut left, CoreKey::ephemeral()).await,
            Err(SwarmError::VersionMismatch { .. })
        ));
        peer.await.unwrap();
    }
}
