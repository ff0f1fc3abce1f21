//! Mock Electrum server.
//!
//! Speaks Electrum JSON-RPC over WebSocket text frames or newline-delimited TCP and
//! answers a small fixed set of methods:
//!
//! - `server.version`: `["MockElectrum 1.0", "1.4"]`
//! - `server.ping`: `null`
//! - `blockchain.header.get`: `{height, hex}` for registered blocks, by height or hash
//! - `blockchain.headers.subscribe`: a notification followed by the result
//! - `mock.error`: an error object
//! - `mock.hang`: never answered
//! - anything else: `{method, params}` echoed back

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::broadcast,
    task::JoinHandle,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};

use super::test_helpers::TestBlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    WebSocket,
    Tcp,
}

#[derive(Default)]
struct MockState {
    connections: AtomicUsize,
    active: AtomicUsize,
    methods: Mutex<Vec<String>>,
    blocks: Mutex<Vec<TestBlock>>,
}

/// Decrements the active connection count when a connection task ends.
struct ActiveConnection(Arc<MockState>);

impl ActiveConnection {
    fn open(state: &Arc<MockState>) -> Self {
        state.connections.fetch_add(1, Ordering::SeqCst);
        state.active.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(state))
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockState {
    /// Frames to send back for one request frame, in order.
    fn replies(&self, text: &str) -> Vec<String> {
        let Ok(request) = serde_json::from_str::<Value>(text) else {
            return Vec::new();
        };
        let id = request["id"].clone();
        let method = request["method"].as_str().unwrap_or_default().to_string();
        let params = request["params"].as_array().cloned().unwrap_or_default();
        self.methods.lock().push(method.clone());

        let mut frames = Vec::new();
        let outcome = match method.as_str() {
            "server.version" => Ok(json!(["MockElectrum 1.0", "1.4"])),
            "server.ping" => Ok(Value::Null),
            "blockchain.header.get" => self.header(params.first()),
            "blockchain.headers.subscribe" => {
                frames.push(
                    json!({
                        "jsonrpc": "2.0",
                        "method": "blockchain.headers.subscribe",
                        "params": [{"height": 1, "hex": "00"}],
                    })
                    .to_string(),
                );
                Ok(json!({"height": 1, "hex": "00"}))
            }
            "mock.error" => Err(json!({"code": 2, "message": "daemon error (code -5)"})),
            "mock.hang" => return frames,
            _ => Ok(json!({"method": method, "params": params})),
        };

        let response = match outcome {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err(error) => json!({"jsonrpc": "2.0", "id": id, "error": error}),
        };
        frames.push(response.to_string());
        frames
    }

    fn header(&self, selector: Option<&Value>) -> Result<Value, Value> {
        let blocks = self.blocks.lock();
        let found = match selector {
            Some(Value::Number(height)) => {
                blocks.iter().find(|block| Some(block.height) == height.as_u64())
            }
            Some(Value::String(hash)) => blocks.iter().find(|block| block.hash_hex() == *hash),
            _ => None,
        };

        found
            .map(|block| json!({"height": block.height, "hex": block.header_hex()}))
            .ok_or_else(|| json!({"code": 1, "message": "header not found"}))
    }
}

/// A mock Electrum server listening on a random local port.
pub struct MockElectrumServer {
    addr: SocketAddr,
    transport: Transport,
    state: Arc<MockState>,
    kick_tx: broadcast::Sender<()>,
    server_handle: JoinHandle<()>,
}

impl MockElectrumServer {
    /// Starts a WebSocket server.
    ///
    /// # Errors
    ///
    /// Returns an error if no local port can be bound.
    pub async fn websocket() -> Result<Self, std::io::Error> {
        Self::start(Transport::WebSocket).await
    }

    /// Starts a line-delimited TCP server.
    ///
    /// # Errors
    ///
    /// Returns an error if no local port can be bound.
    pub async fn tcp() -> Result<Self, std::io::Error> {
        Self::start(Transport::Tcp).await
    }

    async fn start(transport: Transport) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(MockState::default());
        let (kick_tx, _) = broadcast::channel(4);

        let server_handle = {
            let state = Arc::clone(&state);
            let kick_tx = kick_tx.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let guard = ActiveConnection::open(&state);
                    let state = Arc::clone(&state);
                    let kick_rx = kick_tx.subscribe();
                    tokio::spawn(async move {
                        match transport {
                            Transport::WebSocket => serve_websocket(stream, &state, kick_rx).await,
                            Transport::Tcp => serve_tcp(stream, &state, kick_rx).await,
                        }
                        drop(guard);
                    });
                }
            })
        };

        Ok(Self { addr, transport, state, kick_tx, server_handle })
    }

    #[must_use]
    pub fn url(&self) -> String {
        match self.transport {
            Transport::WebSocket => format!("ws://{}", self.addr),
            Transport::Tcp => format!("tcp://{}", self.addr),
        }
    }

    /// Makes `block`'s header available to `blockchain.header.get`.
    pub fn add_block(&self, block: &TestBlock) {
        self.state.blocks.lock().push(block.clone());
    }

    /// Connections accepted since start.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Connections currently open.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Methods received across all connections, in arrival order.
    #[must_use]
    pub fn received_methods(&self) -> Vec<String> {
        self.state.methods.lock().clone()
    }

    /// Number of times `method` was received.
    #[must_use]
    pub fn count(&self, method: &str) -> usize {
        self.state.methods.lock().iter().filter(|m| *m == method).count()
    }

    /// Drops every open connection without a close handshake.
    pub fn kick_clients(&self) {
        let _ = self.kick_tx.send(());
    }
}

impl Drop for MockElectrumServer {
    fn drop(&mut self) {
        self.kick_clients();
        self.server_handle.abort();
    }
}

async fn serve_websocket(
    stream: TcpStream,
    state: &MockState,
    mut kick_rx: broadcast::Receiver<()>,
) {
    let Ok(ws_stream) = accept_async(stream).await else { return };
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    for reply in state.replies(&text) {
                        if write.send(Message::Text(reply.into())).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
            _ = kick_rx.recv() => return,
        }
    }
}

async fn serve_tcp(stream: TcpStream, state: &MockState, mut kick_rx: broadcast::Receiver<()>) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    for reply in state.replies(&line) {
                        let frame = format!("{reply}\n");
                        if write.write_all(frame.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(None) | Err(_) => return,
            },
            _ = kick_rx.recv() => return,
        }
    }
}
