use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, Result};
use crate::transport::tls::TlsSessionCache;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use speech_protocol::ProtocolError;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

const FRAME_CHANNEL_CAPACITY: usize = 100;
const ERROR_CHANNEL_CAPACITY: usize = 10;
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// The first thing that fired while waiting on a connection
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Frame(Vec<u8>),
    Error(ConnectionError),
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct ConnectTiming {
    started: Instant,
    completed: Instant,
    connected_at: SystemTime,
}

struct Inbox {
    frames: mpsc::Receiver<Vec<u8>>,
    errors: mpsc::Receiver<ConnectionError>,
}

/// One WebSocket connection to the gateway.
///
/// A single background reader owns the read half and forwards every text or
/// binary frame, in wire order, into a bounded channel. When that channel is
/// full the reader waits (until the connection closes) instead of dropping,
/// so a slow consumer throttles the socket read. Writes go through one
/// exclusive lock so frames from concurrent callers never interleave.
///
/// `close` is single-shot; after it the connection cannot be reused.
pub struct Connection {
    config: ConnectionConfig,
    /// `config.url` without the query string, for logs and errors
    endpoint: String,
    tls: TlsSessionCache,
    writer: Arc<Mutex<Option<WsSink>>>,
    connected: Arc<AtomicBool>,
    frames_tx: mpsc::Sender<Vec<u8>>,
    errors_tx: mpsc::Sender<ConnectionError>,
    inbox: Mutex<Inbox>,
    closed: CancellationToken,
    close_started: AtomicBool,
    timing: OnceLock<ConnectTiming>,
}

impl Connection {
    /// New, not yet connected, using the process-wide TLS session cache
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_tls_cache(config, TlsSessionCache::shared())
    }

    pub fn with_tls_cache(config: ConnectionConfig, tls: TlsSessionCache) -> Self {
        let (frames_tx, frames) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (errors_tx, errors) = mpsc::channel(ERROR_CHANNEL_CAPACITY);

        let endpoint = redact(&config.url);
        Self {
            config,
            endpoint,
            tls,
            writer: Arc::new(Mutex::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
            frames_tx,
            errors_tx,
            inbox: Mutex::new(Inbox { frames, errors }),
            closed: CancellationToken::new(),
            close_started: AtomicBool::new(false),
            timing: OnceLock::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// The URL without its query string (which may carry an API key)
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closed.is_cancelled()
    }

    /// Set once the remote closed cleanly or `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn closed_signal(&self) -> &CancellationToken {
        &self.closed
    }

    /// Handshake duration of the successful connect, zero before that
    pub fn connect_duration(&self) -> Duration {
        self.timing
            .get()
            .map(|t| t.completed.duration_since(t.started))
            .unwrap_or_default()
    }

    /// Wall-clock time the handshake completed
    pub fn connected_at(&self) -> Option<SystemTime> {
        self.timing.get().map(|t| t.connected_at)
    }

    /// Perform the WebSocket handshake and start the background tasks
    pub async fn connect(&self) -> std::result::Result<(), ConnectionError> {
        let mut writer = self.writer.lock().await;
        if self.close_started.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        if writer.is_some() {
            return Ok(());
        }

        let request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::InvalidUrl(e.to_string()))?;
        let connector = if self.config.url.starts_with("wss://") {
            Some(Connector::Rustls(self.tls.client_config()?))
        } else {
            None
        };

        log::debug!("🔌 Connecting to {}", self.endpoint);
        let started = Instant::now();
        let handshake =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector);
        let (stream, _response) =
            match with_deadline(self.config.connect_timeout, handshake).await {
                Some(result) => result.map_err(|e| handshake_error(&self.endpoint, e))?,
                None => {
                    return Err(ConnectionError::ConnectTimeout(
                        self.config.connect_timeout,
                    ))
                }
            };

        let timing = ConnectTiming {
            started,
            completed: Instant::now(),
            connected_at: SystemTime::now(),
        };
        let _ = self.timing.set(timing);

        let (sink, source) = stream.split();
        *writer = Some(sink);
        self.connected.store(true, Ordering::SeqCst);

        tokio::spawn(read_loop(
            source,
            self.frames_tx.clone(),
            self.errors_tx.clone(),
            self.closed.clone(),
            self.connected.clone(),
            self.config.read_timeout,
        ));

        if !self.config.ping_interval.is_zero() {
            tokio::spawn(heartbeat_loop(
                self.writer.clone(),
                self.closed.clone(),
                self.connected.clone(),
                self.config.ping_interval,
                self.config.write_timeout,
            ));
        }

        log::info!(
            "✅ Connected to {} in {:?}",
            self.endpoint,
            self.connect_duration()
        );
        Ok(())
    }

    /// Connect, retrying with exponential backoff.
    ///
    /// Up to `max_reconnects` retries follow the first attempt; the delay
    /// before retry `k` is `reconnect_backoff * 2^(k-1)`. Failures that a
    /// retry cannot fix (bad URL, TLS setup, cancellation) return at once.
    pub async fn connect_with_retry(
        &self,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), ConnectionError> {
        let attempts = self.config.max_reconnects.saturating_add(1);
        let mut last_error = ConnectionError::NotConnected;

        for attempt in 0..attempts {
            let delay = self.config.backoff_for(attempt);
            if !delay.is_zero() {
                log::info!(
                    "🔄 Retrying {} in {:?} (attempt {}/{})",
                    self.endpoint,
                    delay,
                    attempt + 1,
                    attempts
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
                result = self.connect() => result,
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    log::warn!(
                        "⚠️ Connect attempt {}/{} to {} failed: {}",
                        attempt + 1,
                        attempts,
                        self.endpoint,
                        e
                    );
                    last_error = e;
                }
            }
        }

        log::error!(
            "❌ Giving up on {} after {} attempts",
            self.endpoint,
            attempts
        );
        Err(ConnectionError::RetriesExhausted {
            url: self.endpoint.clone(),
            attempts,
            last: Box::new(last_error),
        })
    }

    /// Serialize `value` and send it as a text frame
    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let json =
            serde_json::to_string(value).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        self.send_frame(WsMessage::Text(json)).await?;
        Ok(())
    }

    pub async fn send_text(&self, text: &str) -> std::result::Result<(), ConnectionError> {
        self.send_frame(WsMessage::Text(text.to_string())).await
    }

    pub async fn send_bytes(&self, data: &[u8]) -> std::result::Result<(), ConnectionError> {
        self.send_frame(WsMessage::Binary(data.to_vec())).await
    }

    async fn send_frame(&self, frame: WsMessage) -> std::result::Result<(), ConnectionError> {
        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(if self.close_started.load(Ordering::SeqCst) {
                ConnectionError::Closed
            } else {
                ConnectionError::NotConnected
            });
        };
        write_frame(sink, frame, self.config.write_timeout).await
    }

    /// Wait for the next inbound frame, reader error, or close.
    ///
    /// A zero `deadline` waits indefinitely.
    pub async fn receive(
        &self,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> std::result::Result<Vec<u8>, ConnectionError> {
        let next = async {
            match self.next_inbound().await {
                Inbound::Frame(frame) => Ok(frame),
                Inbound::Error(e) => Err(e),
                Inbound::Closed => Err(ConnectionError::Closed),
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(ConnectionError::Cancelled),
            result = with_deadline(deadline, next) => {
                result.unwrap_or(Err(ConnectionError::ReadTimeout(deadline)))
            }
        }
    }

    /// `receive` and decode the frame as JSON
    pub async fn receive_json<T: DeserializeOwned>(
        &self,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let frame = self.receive(deadline, cancel).await?;
        let value =
            serde_json::from_slice(&frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Ok(value)
    }

    /// Next frame, reader error, or close signal, whichever comes first.
    ///
    /// Frames already queued are delivered before a pending error or close.
    pub async fn next_inbound(&self) -> Inbound {
        let mut inbox = self.inbox.lock().await;
        let Inbox { frames, errors } = &mut *inbox;

        tokio::select! {
            biased;
            Some(frame) = frames.recv() => Inbound::Frame(frame),
            Some(err) = errors.recv() => Inbound::Error(err),
            _ = self.closed.cancelled() => Inbound::Closed,
        }
    }

    /// Wait up to `grace` for the close signal; true if it fired
    pub async fn wait_closed(&self, grace: Duration) -> bool {
        tokio::time::timeout(grace, self.closed.cancelled())
            .await
            .is_ok()
    }

    /// Signal close, send a best-effort close frame and release the socket.
    ///
    /// Safe to call any number of times from any task; only the first call
    /// does anything.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if self.close_started.swap(true, Ordering::SeqCst) {
            return;
        }

        self.closed.cancel();
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut sink) = writer.take() {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            };
            match tokio::time::timeout(
                CLOSE_FRAME_TIMEOUT,
                sink.send(WsMessage::Close(Some(frame))),
            )
            .await
            {
                Ok(Ok(())) => log::debug!("Close frame sent to {}", self.endpoint),
                Ok(Err(e)) => log::debug!("Close frame not sent to {}: {}", self.endpoint, e),
                Err(_) => log::debug!("Close frame to {} timed out", self.endpoint),
            }
            log::info!("🔌 Disconnected from {}", self.endpoint);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Run `fut` under a deadline; a zero deadline disables it
async fn with_deadline<F: Future>(deadline: Duration, fut: F) -> Option<F::Output> {
    if deadline.is_zero() {
        Some(fut.await)
    } else {
        tokio::time::timeout(deadline, fut).await.ok()
    }
}

async fn write_frame(
    sink: &mut WsSink,
    frame: WsMessage,
    write_timeout: Duration,
) -> std::result::Result<(), ConnectionError> {
    match with_deadline(write_timeout, sink.send(frame)).await {
        Some(result) => result.map_err(transport_error),
        None => Err(ConnectionError::WriteTimeout(write_timeout)),
    }
}

async fn read_loop(
    mut source: WsSource,
    frames: mpsc::Sender<Vec<u8>>,
    errors: mpsc::Sender<ConnectionError>,
    closed: CancellationToken,
    connected: Arc<AtomicBool>,
    read_timeout: Duration,
) {
    loop {
        let next = tokio::select! {
            _ = closed.cancelled() => break,
            next = with_deadline(read_timeout, source.next()) => next,
        };

        let payload = match next {
            Some(Some(Ok(WsMessage::Text(text)))) => text.into_bytes(),
            Some(Some(Ok(WsMessage::Binary(data)))) => data,
            Some(Some(Ok(WsMessage::Close(frame)))) => {
                match frame {
                    Some(frame) if !is_clean_close(frame.code) => {
                        let err = ConnectionError::ClosedAbnormally {
                            code: frame.code.into(),
                            reason: frame.reason.to_string(),
                        };
                        log::error!("❌ {}", err);
                        let _ = errors.try_send(err);
                    }
                    _ => {
                        log::debug!("Remote closed the connection");
                        closed.cancel();
                    }
                }
                break;
            }
            // Ping/pong are answered by tungstenite itself
            Some(Some(Ok(_))) => continue,
            Some(Some(Err(
                tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
            )))
            | Some(None) => {
                log::debug!("Connection stream ended");
                closed.cancel();
                break;
            }
            Some(Some(Err(e))) => {
                log::error!("❌ WebSocket read failed: {}", e);
                let _ = errors.try_send(transport_error(e));
                break;
            }
            None => {
                log::warn!("⚠️ No frame received within {:?}", read_timeout);
                let _ = errors.try_send(ConnectionError::ReadTimeout(read_timeout));
                break;
            }
        };

        log::trace!("📨 Inbound frame ({} bytes)", payload.len());
        tokio::select! {
            _ = closed.cancelled() => break,
            sent = frames.send(payload) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
}

async fn heartbeat_loop(
    writer: Arc<Mutex<Option<WsSink>>>,
    closed: CancellationToken,
    connected: Arc<AtomicBool>,
    interval: Duration,
    write_timeout: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !connected.load(Ordering::SeqCst) {
            break;
        }

        let mut writer = writer.lock().await;
        if let Some(sink) = writer.as_mut() {
            if let Err(e) = write_frame(sink, WsMessage::Ping(Vec::new()), write_timeout).await {
                log::warn!("⚠️ Heartbeat ping failed: {}", e);
            }
        }
    }
}

fn redact(url: &str) -> String {
    url.split('?').next().unwrap_or(url).to_string()
}

fn is_clean_close(code: CloseCode) -> bool {
    matches!(code, CloseCode::Normal | CloseCode::Away)
}

fn transport_error(err: tungstenite::Error) -> ConnectionError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            ConnectionError::Closed
        }
        other => ConnectionError::Transport(other.to_string()),
    }
}

fn handshake_error(url: &str, err: tungstenite::Error) -> ConnectionError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            let message = response
                .body()
                .as_deref()
                .map(|body| String::from_utf8_lossy(body).trim().to_string())
                .filter(|body| !body.is_empty())
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("").to_string());
            ConnectionError::Handshake {
                url: url.to_string(),
                status: status.as_u16(),
                message,
            }
        }
        tungstenite::Error::Url(e) => ConnectionError::InvalidUrl(e.to_string()),
        tungstenite::Error::Tls(e) => ConnectionError::Tls(e.to_string()),
        other => transport_error(other),
    }
}
