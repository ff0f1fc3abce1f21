use async_trait::async_trait;
use bitcoin::{
    consensus::{deserialize, serialize},
    hashes::Hash,
    p2p::{
        address::Address, message_blockdata::Inventory, message_network::VersionMessage,
        ServiceFlags,
    },
    BlockHash,
};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};

use super::{block::HEADER_SIZE, codec::MessageCodec, errors::P2pError, BlockSource};
use crate::{config::P2pConfig, utils::sha256d};

type BlockResult = Result<Vec<u8>, P2pError>;

/// Connection state published to block fetchers.
#[derive(Clone)]
enum SessionState {
    Connecting,
    Ready(mpsc::UnboundedSender<Vec<u8>>),
    Stopped,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<BlockResult>,
}

/// Aborts the session's writer task when the session ends or is dropped.
struct WriterTask(JoinHandle<()>);

impl Drop for WriterTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Removes a fetcher's waiter when the fetch completes, times out or is cancelled.
struct WaiterGuard<'a> {
    peer: &'a P2pPeer,
    hash: BlockHash,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.peer.pending.lock();
        if let Some(waiters) = pending.get_mut(&self.hash) {
            waiters.retain(|waiter| waiter.id != self.id);
            if waiters.is_empty() {
                pending.remove(&self.hash);
            }
        }
    }
}

/// Process-wide connection to one P2P node, used to download full blocks.
///
/// [`P2pPeer::run`] keeps a session alive forever, reconnecting after a fixed delay.
/// Block fetches wait for a ready session, ask for the block with `getdata` and are
/// resolved by the matching `block` message. Fetches for the same hash share a single
/// request and delivery. When a session drops, every in-flight fetch fails with
/// [`P2pError::Disconnected`]; retrying is left to the caller.
pub struct P2pPeer {
    config: P2pConfig,
    codec: MessageCodec,
    session: watch::Sender<SessionState>,
    pending: parking_lot::Mutex<HashMap<BlockHash, Vec<Waiter>>>,
    next_waiter: AtomicU64,
}

impl P2pPeer {
    /// # Errors
    ///
    /// Returns an error string if the configured network magic is not four hex bytes.
    pub fn new(config: P2pConfig) -> Result<Self, String> {
        let codec = MessageCodec::new(config.magic_bytes()?, config.max_message_bytes);
        let initial = if config.enabled { SessionState::Connecting } else { SessionState::Stopped };
        let (session, _) = watch::channel(initial);

        Ok(Self {
            config,
            codec,
            session,
            pending: parking_lot::Mutex::new(HashMap::new()),
            next_waiter: AtomicU64::new(0),
        })
    }

    /// Returns `true` while a handshaken session is available.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(*self.session.borrow(), SessionState::Ready(_))
    }

    /// Number of block hashes with at least one waiting fetch.
    #[must_use]
    pub fn pending_blocks(&self) -> usize {
        self.pending.lock().len()
    }

    /// Connection supervisor. Runs until `shutdown_rx` fires.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        if !self.config.enabled {
            info!(peer = %self.config.name, "P2P peer disabled");
            return;
        }

        let address = format!("{}:{}", self.config.host, self.config.port);

        loop {
            let outcome = tokio::select! {
                outcome = self.connect_and_serve(&address) => outcome,
                _ = shutdown_rx.recv() => break,
            };

            self.end_session(&P2pError::Disconnected);
            match outcome {
                Err(P2pError::Disconnected) => {
                    info!(peer = %self.config.name, address = %address, "P2P disconnected");
                }
                Err(e) => {
                    warn!(
                        peer = %self.config.name,
                        address = %address,
                        error = %e,
                        "P2P session failed"
                    );
                }
                Ok(()) => {}
            }

            info!(
                peer = %self.config.name,
                delay_ms = self.config.reconnect_delay_ms,
                "P2P reconnecting"
            );
            tokio::select! {
                () = tokio::time::sleep(self.config.reconnect_delay()) => {}
                _ = shutdown_rx.recv() => break,
            }
        }

        self.session.send_replace(SessionState::Stopped);
        self.fail_all(&P2pError::Shutdown);
        info!(peer = %self.config.name, "P2P peer stopped");
    }

    /// Fetches the serialized block with the given hash.
    ///
    /// # Errors
    ///
    /// - [`P2pError::NotConnected`] when the peer is disabled
    /// - [`P2pError::NotFound`] when the node answers `notfound`
    /// - [`P2pError::Disconnected`] when the session drops before delivery
    /// - [`P2pError::Timeout`] when nothing arrives within the block timeout
    /// - [`P2pError::Shutdown`] once the supervisor has stopped
    pub async fn get_block(&self, hash: &BlockHash) -> BlockResult {
        if !self.config.enabled {
            return Err(P2pError::NotConnected);
        }

        match tokio::time::timeout(self.config.block_timeout(), self.fetch(hash)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(peer = %self.config.name, hash = %hash, "timed out waiting for block");
                Err(P2pError::Timeout(hash.to_string()))
            }
        }
    }

    async fn fetch(&self, hash: &BlockHash) -> BlockResult {
        let mut session_rx = self.session.subscribe();
        let sender = {
            let state = session_rx
                .wait_for(|state| !matches!(state, SessionState::Connecting))
                .await
                .map_err(|_| P2pError::Shutdown)?;
            match &*state {
                SessionState::Ready(sender) => sender.clone(),
                _ => return Err(P2pError::Shutdown),
            }
        };

        let (tx, rx) = oneshot::channel();
        let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let first = {
            let mut pending = self.pending.lock();
            let waiters = pending.entry(*hash).or_default();
            waiters.push(Waiter { id, tx });
            waiters.len() == 1
        };
        let _guard = WaiterGuard { peer: self, hash: *hash, id };

        if first {
            let payload = serialize(&vec![Inventory::Block(*hash)]);
            sender
                .send(self.codec.encode("getdata", &payload))
                .map_err(|_| P2pError::Disconnected)?;
            debug!(peer = %self.config.name, hash = %hash, "requested block");
        } else {
            debug!(peer = %self.config.name, hash = %hash, "joined pending block request");
        }

        rx.await.map_err(|_| P2pError::Disconnected)?
    }

    async fn connect_and_serve(&self, address: &str) -> Result<(), P2pError> {
        let stream =
            tokio::time::timeout(self.config.handshake_timeout(), TcpStream::connect(address))
                .await
                .map_err(|_| P2pError::Handshake(format!("connecting to {address} timed out")))??;
        let peer_addr = stream.peer_addr()?;
        let _ = stream.set_nodelay(true);

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        tokio::time::timeout(
            self.config.handshake_timeout(),
            self.handshake(&mut reader, &mut write_half, peer_addr),
        )
        .await
        .map_err(|_| P2pError::Handshake("timed out waiting for version/verack".into()))??;

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let _writer = WriterTask(tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = write_half.write_all(&frame).await {
                    warn!(error = %e, "P2P write failed");
                    break;
                }
            }
        }));

        self.session.send_replace(SessionState::Ready(tx.clone()));
        info!(peer = %self.config.name, address = %peer_addr, "P2P connected");

        self.read_loop(&mut reader, &tx).await
    }

    async fn handshake<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        peer_addr: SocketAddr,
    ) -> Result<(), P2pError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.codec.encode("version", &self.version_payload(peer_addr))).await?;

        let mut got_version = false;
        let mut got_verack = false;
        while !(got_version && got_verack) {
            let message = self.codec.read_message(reader).await?;
            match message.command.as_str() {
                "version" => {
                    if let Ok(version) = deserialize::<VersionMessage>(&message.payload) {
                        debug!(
                            peer = %self.config.name,
                            version = version.version,
                            user_agent = %version.user_agent,
                            "received node version"
                        );
                    }
                    got_version = true;
                    writer.write_all(&self.codec.encode("verack", &[])).await?;
                }
                "verack" => got_verack = true,
                "ping" => writer.write_all(&self.codec.encode("pong", &message.payload)).await?,
                other => trace!(command = other, "ignoring message during handshake"),
            }
        }

        Ok(())
    }

    fn version_payload(&self, peer_addr: SocketAddr) -> Vec<u8> {
        let unspecified = SocketAddr::from(([0, 0, 0, 0], 0));
        let mut message = VersionMessage::new(
            ServiceFlags::NONE,
            chrono::Utc::now().timestamp(),
            Address::new(&peer_addr, ServiceFlags::NONE),
            Address::new(&unspecified, ServiceFlags::NONE),
            rand::random::<u64>(),
            self.config.user_agent.clone(),
            0,
        );
        message.version = self.config.protocol_version;
        message.relay = false;
        serialize(&message)
    }

    async fn read_loop<R>(
        &self,
        reader: &mut R,
        outbound: &mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<(), P2pError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let message = self.codec.read_message(reader).await?;
            match message.command.as_str() {
                "ping" => {
                    outbound
                        .send(self.codec.encode("pong", &message.payload))
                        .map_err(|_| P2pError::Disconnected)?;
                }
                "block" => self.deliver_block(message.payload),
                "notfound" => self.reject_not_found(&message.payload),
                other => trace!(command = other, "ignoring P2P message"),
            }
        }
    }

    fn deliver_block(&self, payload: Vec<u8>) {
        if payload.len() < HEADER_SIZE {
            warn!(
                peer = %self.config.name,
                size = payload.len(),
                "block message shorter than a header"
            );
            return;
        }

        let hash = BlockHash::from_byte_array(sha256d(&payload[..HEADER_SIZE]));
        let Some(mut waiters) = self.pending.lock().remove(&hash) else {
            debug!(peer = %self.config.name, hash = %hash, "unsolicited block");
            return;
        };

        debug!(
            peer = %self.config.name,
            hash = %hash,
            size = payload.len(),
            waiters = waiters.len(),
            "block received"
        );

        if let Some(last) = waiters.pop() {
            for waiter in waiters {
                let _ = waiter.tx.send(Ok(payload.clone()));
            }
            let _ = last.tx.send(Ok(payload));
        }
    }

    fn reject_not_found(&self, payload: &[u8]) {
        let inventory = match deserialize::<Vec<Inventory>>(payload) {
            Ok(inventory) => inventory,
            Err(e) => {
                warn!(peer = %self.config.name, error = %e, "malformed notfound message");
                return;
            }
        };

        for item in inventory {
            let hash = match item {
                Inventory::Block(hash) |
                Inventory::WitnessBlock(hash) |
                Inventory::CompactBlock(hash) => hash,
                _ => continue,
            };

            let waiters = self.pending.lock().remove(&hash);
            for waiter in waiters.into_iter().flatten() {
                let _ = waiter.tx.send(Err(P2pError::NotFound(hash.to_string())));
            }
        }
    }

    fn end_session(&self, error: &P2pError) {
        self.session.send_replace(SessionState::Connecting);
        self.fail_all(error);
    }

    fn fail_all(&self, error: &P2pError) {
        let pending = std::mem::take(&mut *self.pending.lock());
        for waiter in pending.into_values().flatten() {
            let _ = waiter.tx.send(Err(error.clone()));
        }
    }
}

#[async_trait]
impl BlockSource for P2pPeer {
    async fn fetch_block(&self, hash: &BlockHash) -> BlockResult {
        self.get_block(hash).await
    }
}
