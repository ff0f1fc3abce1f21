use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde_json::{json, Value};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{oneshot, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use super::{
    client::{UpstreamClient, UpstreamConnector},
    errors::UpstreamError,
};
use crate::config::UpstreamConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingSender = oneshot::Sender<Result<Value, UpstreamError>>;

/// Upper bound on how long a graceful close may take before the socket is dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens [`ElectrumClient`] connections using the shared upstream settings.
pub struct ElectrumConnector {
    config: UpstreamConfig,
}

impl ElectrumConnector {
    #[must_use]
    pub fn new(config: UpstreamConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl UpstreamConnector for ElectrumConnector {
    async fn connect(&self, url: &Url) -> Result<Arc<dyn UpstreamClient>, UpstreamError> {
        let client = tokio::time::timeout(
            self.config.connect_timeout(),
            ElectrumClient::connect(url, &self.config),
        )
        .await
        .map_err(|_| UpstreamError::ConnectTimeout)??;

        Ok(Arc::new(client))
    }
}

/// Write half of an Electrum connection.
enum Writer {
    WebSocket(SplitSink<WsStream, Message>),
    Tcp(OwnedWriteHalf),
}

impl Writer {
    async fn send_text(&mut self, text: String) -> Result<(), String> {
        match self {
            Self::WebSocket(sink) => {
                sink.send(Message::Text(text.into())).await.map_err(|e| e.to_string())
            }
            Self::Tcp(stream) => {
                let mut line = text.into_bytes();
                line.push(b'\n');
                stream.write_all(&line).await.map_err(|e| e.to_string())
            }
        }
    }

    async fn close(&mut self) {
        match self {
            Self::WebSocket(sink) => {
                let _ = sink.close().await;
            }
            Self::Tcp(stream) => {
                let _ = stream.shutdown().await;
            }
        }
    }
}

/// Read half of an Electrum connection, yielding one JSON document per item.
enum Reader {
    WebSocket(SplitStream<WsStream>),
    Tcp(Lines<BufReader<OwnedReadHalf>>),
}

impl Reader {
    /// Returns `None` once the peer has closed the connection.
    async fn next_text(&mut self) -> Option<Result<String, String>> {
        match self {
            Self::WebSocket(stream) => loop {
                match stream.next().await? {
                    Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                    Ok(Message::Binary(bytes)) => {
                        return Some(String::from_utf8(bytes.to_vec()).map_err(|e| e.to_string()))
                    }
                    Ok(Message::Close(_)) => return None,
                    Ok(_) => {}
                    Err(e) => return Some(Err(e.to_string())),
                }
            },
            Self::Tcp(lines) => loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => return Some(Ok(line)),
                    Ok(None) => return None,
                    Err(e) => return Some(Err(e.to_string())),
                }
            },
        }
    }
}

/// State shared between the client handle and its reader task.
struct ClientInner {
    server: String,
    pending: DashMap<u64, PendingSender>,
    connected: AtomicBool,
}

impl ClientInner {
    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Array(items)) => items.into_iter().for_each(|item| self.dispatch_one(item)),
            Ok(item) => self.dispatch_one(item),
            Err(e) => {
                warn!(server = %self.server, error = %e, "failed to parse upstream message");
            }
        }
    }

    fn dispatch_one(&self, message: Value) {
        let Some(id) = message.get("id").and_then(Value::as_u64) else {
            match message.get("method").and_then(Value::as_str) {
                Some(method) => debug!(server = %self.server, method, "ignoring notification"),
                None => warn!(server = %self.server, "upstream message without id"),
            }
            return;
        };

        let Some((_, sender)) = self.pending.remove(&id) else {
            debug!(server = %self.server, id, "response for unknown or expired request");
            return;
        };

        let _ = sender.send(parse_outcome(message));
    }

    /// Marks the connection dead and fails every pending call.
    fn close(&self) {
        self.connected.store(false, Ordering::Release);
        // Dropping the senders wakes the waiters with `Closed`.
        self.pending.clear();
    }
}

/// Splits a response into its result or its error object.
fn parse_outcome(mut message: Value) -> Result<Value, UpstreamError> {
    if let Some(error) = message.get("error").filter(|error| !error.is_null()) {
        return Err(rpc_error(error));
    }

    match message.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(UpstreamError::InvalidResponse("response has neither result nor error".into())),
    }
}

fn rpc_error(error: &Value) -> UpstreamError {
    match error {
        Value::Object(map) => UpstreamError::Rpc {
            code: map.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: map
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| error.to_string(), str::to_string),
        },
        Value::String(message) => UpstreamError::Rpc { code: 0, message: message.clone() },
        other => UpstreamError::Rpc { code: 0, message: other.to_string() },
    }
}

/// Removes a pending call when the waiting future finishes or is dropped.
struct PendingCall<'a> {
    inner: &'a ClientInner,
    id: u64,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.inner.pending.remove(&self.id);
    }
}

/// Electrum protocol client over WebSocket (`ws`, `wss`) or line-delimited TCP (`tcp`).
///
/// A background reader task routes responses to callers by request id. Calls are
/// bounded by the configured request timeout; a call whose caller goes away is
/// removed from the pending map.
pub struct ElectrumClient {
    inner: Arc<ClientInner>,
    writer: Mutex<Writer>,
    next_id: AtomicU64,
    request_timeout: Duration,
    reader_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ElectrumClient {
    /// Connects to `url` and negotiates the protocol version.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::UnsupportedScheme`] for schemes other than `ws`, `wss` and
    /// `tcp`, [`UpstreamError::InvalidServer`] when the URL lacks a host or port, and
    /// [`UpstreamError::ConnectionFailed`] when the socket or the version handshake fails.
    pub async fn connect(url: &Url, config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        info!(server = %url, "connecting to upstream");

        let (reader, writer) = match url.scheme() {
            "ws" | "wss" => open_websocket(url).await?,
            "tcp" => open_tcp(url).await?,
            other => return Err(UpstreamError::UnsupportedScheme(other.to_string())),
        };

        let inner = Arc::new(ClientInner {
            server: url.to_string(),
            pending: DashMap::new(),
            connected: AtomicBool::new(true),
        });
        let reader_task = tokio::spawn(read_loop(Arc::clone(&inner), reader));

        let client = Self {
            inner,
            writer: Mutex::new(writer),
            next_id: AtomicU64::new(0),
            request_timeout: config.request_timeout(),
            reader_task: parking_lot::Mutex::new(Some(reader_task)),
        };

        if let Err(e) = client.negotiate_version(config).await {
            client.disconnect().await;
            return Err(e);
        }

        Ok(client)
    }

    async fn negotiate_version(&self, config: &UpstreamConfig) -> Result<(), UpstreamError> {
        let version = self
            .request(
                "server.version",
                vec![json!(config.client_name), json!(config.protocol_version)],
            )
            .await
            .map_err(|e| {
                UpstreamError::ConnectionFailed(format!("version negotiation failed: {e}"))
            })?;

        info!(server = %self.inner.server, version = %version, "upstream version negotiated");
        Ok(())
    }

    /// Returns the number of calls awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }
}

#[async_trait]
impl UpstreamClient for ElectrumClient {
    async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, UpstreamError> {
        if !self.is_connected() {
            return Err(UpstreamError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);
        let _call = PendingCall { inner: &self.inner, id };

        // The reader may have shut down between the check above and the insert.
        if !self.is_connected() {
            return Err(UpstreamError::Closed);
        }

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        })
        .to_string();

        debug!(server = %self.inner.server, id, method, "sending upstream request");

        if let Err(e) = self.writer.lock().await.send_text(payload).await {
            warn!(server = %self.inner.server, error = %e, "upstream write failed");
            self.inner.close();
            return Err(UpstreamError::Closed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(UpstreamError::Closed),
            Err(_) => Err(UpstreamError::Timeout),
        }
    }

    async fn disconnect(&self) {
        self.inner.close();

        let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
            self.writer.lock().await.close().await;
        })
        .await;

        let reader_task = self.reader_task.lock().take();
        if let Some(handle) = reader_task {
            handle.abort();
        }

        debug!(server = %self.inner.server, "upstream disconnected");
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }
}

impl Drop for ElectrumClient {
    fn drop(&mut self) {
        if let Some(handle) = self.reader_task.get_mut().take() {
            handle.abort();
        }
    }
}

async fn read_loop(inner: Arc<ClientInner>, mut reader: Reader) {
    loop {
        match reader.next_text().await {
            Some(Ok(text)) => inner.dispatch(&text),
            Some(Err(e)) => {
                warn!(server = %inner.server, error = %e, "upstream read error");
                break;
            }
            None => {
                info!(server = %inner.server, "upstream closed the connection");
                break;
            }
        }
    }

    inner.close();
}

/// Establishes a WebSocket connection to the upstream server.
///
/// Provides specific error messages for common handshake failures.
async fn open_websocket(url: &Url) -> Result<(Reader, Writer), UpstreamError> {
    match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((ws_stream, response)) => {
            debug!(server = %url, status = response.status().as_u16(), "websocket connected");
            let (write, read) = ws_stream.split();
            Ok((Reader::WebSocket(read), Writer::WebSocket(write)))
        }
        Err(e) => {
            let error_msg = e.to_string();
            warn!(server = %url, error = %e, "websocket connection failed");

            if error_msg.contains("HTTP error: 200 OK") {
                Err(UpstreamError::ConnectionFailed(format!(
                    "server {url} returned 200 OK but does not speak WebSocket"
                )))
            } else if error_msg.contains("HTTP error: 403") {
                Err(UpstreamError::ConnectionFailed(format!(
                    "WebSocket access forbidden for {url} (403 Forbidden)"
                )))
            } else {
                Err(UpstreamError::ConnectionFailed(format!("WebSocket connection failed: {e}")))
            }
        }
    }
}

async fn open_tcp(url: &Url) -> Result<(Reader, Writer), UpstreamError> {
    let host = url.host_str().ok_or_else(|| UpstreamError::InvalidServer {
        url: url.to_string(),
        reason: "missing host".to_string(),
    })?;
    let port = url.port().ok_or_else(|| UpstreamError::InvalidServer {
        url: url.to_string(),
        reason: "missing port".to_string(),
    })?;

    let stream = TcpStream::connect((host, port)).await.map_err(|e| {
        warn!(server = %url, error = %e, "tcp connection failed");
        UpstreamError::ConnectionFailed(format!("TCP connection to {host}:{port} failed: {e}"))
    })?;
    let _ = stream.set_nodelay(true);

    let (read, write) = stream.into_split();
    Ok((Reader::Tcp(BufReader::new(read).lines()), Writer::Tcp(write)))
}
