//! Scripted in-process speech gateway for integration tests.
//!
//! Every accepted WebSocket connection is handed to the test's handler as a
//! [`Peer`]. Frames the client sends are recorded so tests can assert on
//! exactly what went over the wire.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use speech_protocol::{Message, MessageType};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Raw 16-bit mono PCM of `samples` samples
pub fn pcm(samples: usize) -> Vec<u8> {
    (0..samples)
        .flat_map(|i| ((i % 256) as i16 * 64).to_le_bytes())
        .collect()
}

pub struct MockGateway {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Message>>>,
    paths: Arc<Mutex<Vec<String>>>,
    accepted: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockGateway {
    pub async fn start<F, Fut>(handler: F) -> Self
    where
        F: Fn(Peer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::start_dropping(0, handler).await
    }

    /// Like [`start`](Self::start), but the first `drop_first` TCP
    /// connections are closed before the WebSocket handshake
    pub async fn start_dropping<F, Fut>(drop_first: usize, handler: F) -> Self
    where
        F: Fn(Peer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let paths = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(handler);

        let task = tokio::spawn({
            let received = received.clone();
            let paths = paths.clone();
            let accepted = accepted.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let n = accepted.fetch_add(1, Ordering::SeqCst);
                    if n < drop_first {
                        log::debug!("Mock gateway dropping connection #{}", n + 1);
                        drop(stream);
                        continue;
                    }

                    let handler = handler.clone();
                    let received = received.clone();
                    let paths = paths.clone();
                    tokio::spawn(async move {
                        if let Some(peer) = Peer::accept(stream, received, paths).await {
                            handler(peer).await;
                        }
                    });
                }
            }
        });

        Self {
            addr,
            received,
            paths,
            accepted,
            task,
        }
    }

    /// `ws://127.0.0.1:<port>`
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Every frame received from clients, in arrival order
    pub fn received(&self) -> Vec<Message> {
        self.received.lock().unwrap().clone()
    }

    pub fn count(&self, kind: MessageType) -> usize {
        self.received()
            .iter()
            .filter(|m| m.message_type() == kind)
            .count()
    }

    /// Request paths (with query) of every completed handshake
    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().unwrap().clone()
    }

    /// TCP connections accepted, including dropped ones
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The gateway's end of one client connection
pub struct Peer {
    ws: WebSocketStream<TcpStream>,
    received: Arc<Mutex<Vec<Message>>>,
}

impl Peer {
    async fn accept(
        stream: TcpStream,
        received: Arc<Mutex<Vec<Message>>>,
        paths: Arc<Mutex<Vec<String>>>,
    ) -> Option<Self> {
        let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            paths.lock().unwrap().push(req.uri().to_string());
            Ok::<_, ErrorResponse>(resp)
        })
        .await
        .ok()?;
        Some(Self { ws, received })
    }

    pub async fn send(&mut self, message: Message) {
        let text = message.to_json().unwrap();
        let _ = self.ws.send(WsMessage::Text(text)).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        let _ = self.ws.send(WsMessage::Text(text.to_string())).await;
    }

    /// Next client frame, or `None` once the client is gone
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            let payload = match self.ws.next().await? {
                Ok(WsMessage::Text(text)) => text.into_bytes(),
                Ok(WsMessage::Binary(data)) => data,
                Ok(WsMessage::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            };
            let message = Message::from_bytes(&payload).unwrap();
            self.received.lock().unwrap().push(message.clone());
            return Some(message);
        }
    }

    /// Receive until a frame of type `kind` arrives
    pub async fn recv_until(&mut self, kind: MessageType) -> Option<Message> {
        loop {
            let message = self.recv().await?;
            if message.message_type() == kind {
                return Some(message);
            }
        }
    }

    /// Send `session.ready` and wait for the client's `session.config`
    pub async fn handshake(&mut self, session_id: &str) -> Option<Message> {
        self.send(Message::session_ready(session_id)).await;
        self.recv_until(MessageType::SessionConfig).await
    }

    /// Keep answering nothing until `session.end`, then close cleanly
    pub async fn serve_until_end(&mut self) {
        if self.recv_until(MessageType::SessionEnd).await.is_some() {
            self.close().await;
        }
    }

    /// Read until the client goes away
    pub async fn drain(&mut self) {
        while self.recv().await.is_some() {}
    }

    pub async fn close(&mut self) {
        let _ = self
            .ws
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }))
            .await;
        // Let the client's close reply arrive
        let _ = tokio::time::timeout(Duration::from_millis(500), self.drain()).await;
    }

    pub async fn close_with(&mut self, code: CloseCode, reason: &str) {
        let _ = self
            .ws
            .close(Some(CloseFrame {
                code,
                reason: reason.to_string().into(),
            }))
            .await;
    }
}
