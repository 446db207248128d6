use crate::error::{Result, ServerError, SessionError};
use crate::stt::events::{RecognitionEvent, RecognitionEvents};
use crate::transport::{Connection, Inbound};
use speech_protocol::{Message, MessageType, ProtocolError, SessionParams};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use strum::Display;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const EVENT_CHANNEL_CAPACITY: usize = 100;
pub(crate) const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RecognitionState {
    AwaitingReady,
    Ready,
    Active,
    Closed,
}

struct Inner {
    conn: Connection,
    params: SessionParams,
    ready_timeout: Duration,
    id: OnceLock<String>,
    state: Mutex<RecognitionState>,
    events_tx: Mutex<Option<mpsc::Sender<RecognitionEvent>>>,
    events_rx: Mutex<Option<mpsc::Receiver<RecognitionEvent>>>,
    loop_cancel: CancellationToken,
    close_started: AtomicBool,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, RecognitionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session_id(&self) -> &str {
        self.id.get().map(String::as_str).unwrap_or("-")
    }

    fn take_sender(&self) -> Option<mpsc::Sender<RecognitionEvent>> {
        self.events_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// One streaming recognition exchange over a dedicated connection.
///
/// Lifecycle: `AwaitingReady -> Ready -> Active -> Closed`. Audio goes in
/// through [`send`](Self::send) / [`commit`](Self::commit) while results come
/// out of [`events`](Self::events), independently of each other.
pub struct RecognitionSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RecognitionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecognitionSession").finish_non_exhaustive()
    }
}

impl RecognitionSession {
    /// Wrap a connected [`Connection`]. The ready handshake waits up to the
    /// connection's connect timeout.
    pub fn new(conn: Connection, params: SessionParams) -> Self {
        let ready_timeout = conn.config().connect_timeout;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                conn,
                params,
                ready_timeout,
                id: OnceLock::new(),
                state: Mutex::new(RecognitionState::AwaitingReady),
                events_tx: Mutex::new(Some(events_tx)),
                events_rx: Mutex::new(Some(events_rx)),
                loop_cancel: CancellationToken::new(),
                close_started: AtomicBool::new(false),
            }),
        }
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.ready_timeout = timeout;
        }
        self
    }

    /// Wait for `session.ready`, send `session.config` and start the message loop.
    ///
    /// Cancelling `cancel` later also stops the message loop, but does not
    /// end the session on the gateway; call [`close`](Self::close) for that.
    ///
    /// Fails with a protocol error if the first frame is anything but
    /// `session.ready` (or a server error if it is an `error` frame); the
    /// session then never becomes active.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        match *self.inner.state() {
            RecognitionState::AwaitingReady => {}
            RecognitionState::Closed => return Err(SessionError::Closed.into()),
            _ => return Ok(()),
        }

        let frame = self
            .inner
            .conn
            .receive(self.inner.ready_timeout, cancel)
            .await?;

        let session_id = match Message::from_bytes(&frame)? {
            Message::SessionReady { session_id } => session_id,
            Message::Error { code, message } => {
                return Err(ServerError::new(code, message).into());
            }
            other => {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: MessageType::SessionReady,
                    got: other.message_type(),
                }
                .into());
            }
        };

        let _ = self.inner.id.set(session_id);
        *self.inner.state() = RecognitionState::Ready;
        log::info!(
            "✅ Recognition session ready: id={}, provider={}",
            self.id(),
            self.provider()
        );

        let Some(events) = self.inner.take_sender() else {
            return Err(SessionError::Closed.into());
        };
        let _ = events.try_send(RecognitionEvent::Ready {
            session_id: self.id().to_string(),
        });

        self.inner
            .conn
            .send_json(&Message::session_config(self.inner.params.clone()))
            .await?;

        {
            let mut state = self.inner.state();
            if *state == RecognitionState::Closed {
                return Err(SessionError::Closed.into());
            }
            *state = RecognitionState::Active;
        }

        tokio::spawn(message_loop(self.inner.clone(), events, cancel.clone()));
        Ok(())
    }

    /// Take the event stream; `None` if it was already taken
    pub fn events(&self) -> Option<RecognitionEvents> {
        self.inner
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(RecognitionEvents::new)
    }

    /// Send one chunk of audio as `audio.append`
    pub async fn send(&self, audio: &[u8]) -> Result<()> {
        match *self.inner.state() {
            RecognitionState::Closed => return Err(SessionError::Closed.into()),
            RecognitionState::AwaitingReady => return Err(SessionError::NotReady.into()),
            _ => {}
        }

        self.inner
            .conn
            .send_json(&Message::audio_append_bytes(audio))
            .await
    }

    /// Raw 16-bit PCM; same as [`send`](Self::send)
    pub async fn send_pcm(&self, pcm: &[u8]) -> Result<()> {
        self.send(pcm).await
    }

    /// Mark the end of audio input for the current utterance
    pub async fn commit(&self) -> Result<()> {
        if *self.inner.state() == RecognitionState::Closed {
            return Err(SessionError::Closed.into());
        }

        log::debug!("📝 Committing input for session {}", self.inner.session_id());
        self.inner.conn.send_json(&Message::input_commit()).await
    }

    /// End the session: `session.end`, wait up to 2s for the gateway to close
    /// the socket, then force it closed. Only the first call does anything.
    pub async fn close(&self) {
        if self.inner.close_started.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.inner.state() = RecognitionState::Closed;

        let conn = &self.inner.conn;
        if conn.is_connected() {
            if let Err(e) = conn.send_json(&Message::session_end()).await {
                log::debug!("session.end not sent: {}", e);
            } else if !conn.wait_closed(CLOSE_GRACE).await {
                log::warn!(
                    "⚠️ Gateway did not close session {} within {:?}, forcing close",
                    self.inner.session_id(),
                    CLOSE_GRACE
                );
            }
        }

        self.inner.loop_cancel.cancel();
        drop(self.inner.take_sender());
        conn.close().await;

        log::info!("🛑 Recognition session closed: id={}", self.inner.session_id());
    }

    /// Server-assigned id, empty before the handshake
    pub fn id(&self) -> &str {
        self.inner.id.get().map(String::as_str).unwrap_or("")
    }

    pub fn provider(&self) -> &str {
        self.inner.params.provider.as_deref().unwrap_or("")
    }

    pub fn state(&self) -> RecognitionState {
        *self.inner.state()
    }

    pub fn is_ready(&self) -> bool {
        matches!(
            self.state(),
            RecognitionState::Ready | RecognitionState::Active
        )
    }

    pub fn is_closed(&self) -> bool {
        self.state() == RecognitionState::Closed
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.conn
    }
}

impl Drop for RecognitionSession {
    fn drop(&mut self) {
        self.inner.loop_cancel.cancel();
    }
}

async fn message_loop(
    inner: Arc<Inner>,
    events: mpsc::Sender<RecognitionEvent>,
    cancel: CancellationToken,
) {
    loop {
        let inbound = tokio::select! {
            _ = inner.loop_cancel.cancelled() => break,
            _ = cancel.cancelled() => break,
            inbound = inner.conn.next_inbound() => inbound,
        };

        match inbound {
            Inbound::Frame(frame) => {
                if handle_frame(&inner, &events, &frame).is_break() {
                    break;
                }
            }
            Inbound::Error(e) => {
                log::error!(
                    "❌ Recognition session {} lost its connection: {}",
                    inner.session_id(),
                    e
                );
                emit(&inner, &events, RecognitionEvent::Error(e.into()));
                break;
            }
            Inbound::Closed => {
                log::debug!("Connection closed under session {}", inner.session_id());
                break;
            }
        }
    }

    *inner.state() = RecognitionState::Closed;
    emit(&inner, &events, RecognitionEvent::Closed);
}

fn handle_frame(
    inner: &Inner,
    events: &mpsc::Sender<RecognitionEvent>,
    frame: &[u8],
) -> ControlFlow<()> {
    let message = match Message::from_bytes(frame) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("⚠️ Ignoring inbound frame: {}", e);
            return ControlFlow::Continue(());
        }
    };

    match message {
        Message::TranscriptPartial { text } => {
            log::trace!("Partial: '{}'", truncate(&text));
            emit(inner, events, RecognitionEvent::Partial { text });
        }
        Message::TranscriptFinal {
            text,
            start_time,
            end_time,
        } => {
            log::debug!(
                "🗣️ Final [{}ms-{}ms]: '{}'",
                start_time,
                end_time,
                truncate(&text)
            );
            emit(
                inner,
                events,
                RecognitionEvent::Final {
                    text,
                    start: millis(start_time),
                    end: millis(end_time),
                },
            );
        }
        Message::InputDone => emit(inner, events, RecognitionEvent::InputDone),
        Message::Processing => emit(inner, events, RecognitionEvent::Processing),
        Message::Error { code, message } => {
            let err = ServerError::new(code, message);
            log::error!("❌ Session {} reported {}", inner.session_id(), err);
            emit(inner, events, RecognitionEvent::Error(err.into()));
            return ControlFlow::Break(());
        }
        other => {
            log::debug!(
                "Ignoring {} on recognition session {}",
                other.message_type(),
                inner.session_id()
            );
        }
    }

    ControlFlow::Continue(())
}

/// Non-blocking push; drops the event if the consumer is behind
fn emit(inner: &Inner, events: &mpsc::Sender<RecognitionEvent>, event: RecognitionEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = events.try_send(event) {
        log::warn!(
            "⚠️ Event queue full on session {}, dropping {} event",
            inner.session_id(),
            event.kind()
        );
    }
}

fn millis(value: i64) -> Duration {
    Duration::from_millis(value.max(0) as u64)
}

pub(crate) fn truncate(text: &str) -> String {
    const MAX_CHARS: usize = 50;
    if text.chars().count() <= MAX_CHARS {
        text.to_string()
    } else {
        let head: String = text.chars().take(MAX_CHARS).collect();
        format!("{}...", head)
    }
}
