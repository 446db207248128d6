use crate::error::{ConnectionError, Result, ServerError, SessionError, SpeechError};
use crate::stt::session::CLOSE_GRACE;
use crate::transport::{Connection, Inbound};
use crate::tts::stream::{self, AudioStream, StreamFeed};
use speech_protocol::{decode_audio, Message, MessageType, ProtocolError, SessionParams};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant, SystemTime};
use strum::Display;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SynthesisState {
    AwaitingReady,
    Idle,
    Synthesizing,
    Closed,
}

#[derive(Debug)]
struct RoundState {
    state: SynthesisState,
    current: Option<StreamFeed>,
    round_count: u64,
    seq: u64,
    commit_sent_at: Option<Instant>,
    first_chunk_at: Option<Instant>,
}

impl RoundState {
    /// Detach the in-flight round, returning to `Idle` unless the session closed
    fn finish(&mut self) -> Option<StreamFeed> {
        if self.state == SynthesisState::Synthesizing {
            self.state = SynthesisState::Idle;
        }
        self.current.take()
    }
}

pub(crate) struct SessionInner {
    conn: Connection,
    params: SessionParams,
    ready_timeout: Duration,
    id: OnceLock<String>,
    round: Mutex<RoundState>,
    loop_cancel: CancellationToken,
    close_started: AtomicBool,
}

impl SessionInner {
    fn round(&self) -> MutexGuard<'_, RoundState> {
        self.round.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session_id(&self) -> &str {
        self.id.get().map(String::as_str).unwrap_or("-")
    }

    pub(crate) fn connect_duration(&self) -> Duration {
        self.conn.connect_duration()
    }

    pub(crate) fn connected_at(&self) -> Option<SystemTime> {
        self.conn.connected_at()
    }

    pub(crate) fn commit_sent_at(&self) -> Option<Instant> {
        self.round().commit_sent_at
    }

    pub(crate) fn first_chunk_received_at(&self) -> Option<Instant> {
        self.round().first_chunk_at
    }

    pub(crate) fn ttfb(&self) -> Duration {
        let round = self.round();
        match (round.commit_sent_at, round.first_chunk_at) {
            (Some(commit), Some(first)) => first.saturating_duration_since(commit),
            _ => Duration::ZERO,
        }
    }

    /// End the in-flight round with an error, if there is one
    fn fail_round(&self, err: SpeechError) {
        let feed = self.round().finish();
        if let Some(feed) = feed {
            feed.push_error(err);
        }
    }
}

/// A reusable text-to-speech session over one connection.
///
/// Lifecycle: `AwaitingReady -> Idle <-> Synthesizing -> Closed`. Each call
/// to [`synthesize_stream`](Self::synthesize_stream) runs one round and only
/// one round may be in flight at a time.
pub struct SynthesisSession {
    inner: Arc<SessionInner>,
}

impl SynthesisSession {
    pub fn new(conn: Connection, params: SessionParams) -> Self {
        let ready_timeout = conn.config().connect_timeout;

        Self {
            inner: Arc::new(SessionInner {
                conn,
                params,
                ready_timeout,
                id: OnceLock::new(),
                round: Mutex::new(RoundState {
                    state: SynthesisState::AwaitingReady,
                    current: None,
                    round_count: 0,
                    seq: 0,
                    commit_sent_at: None,
                    first_chunk_at: None,
                }),
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

    /// Wait for `session.ready`, send `session.config` and start the message loop
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        match self.state() {
            SynthesisState::AwaitingReady => {}
            SynthesisState::Closed => return Err(SessionError::Closed.into()),
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

        self.inner
            .conn
            .send_json(&Message::session_config(self.inner.params.clone()))
            .await?;

        {
            let mut round = self.inner.round();
            if round.state == SynthesisState::Closed {
                return Err(SessionError::Closed.into());
            }
            round.state = SynthesisState::Idle;
        }

        log::info!(
            "✅ Synthesis session ready: id={}, voice={}",
            self.id(),
            self.inner.params.voice_id.as_deref().unwrap_or("default")
        );

        tokio::spawn(message_loop(self.inner.clone(), cancel.clone()));
        Ok(())
    }

    /// Start a round: send `text.append` + `input.commit` and return the
    /// round's audio immediately.
    ///
    /// Fails without sending anything if the session is closed, not ready,
    /// or another round is still in flight.
    pub async fn synthesize_stream(&self, text: &str) -> Result<AudioStream> {
        let (stream, round_no) = {
            let mut round = self.inner.round();
            match round.state {
                SynthesisState::Idle => {}
                SynthesisState::Closed => return Err(SessionError::Closed.into()),
                SynthesisState::AwaitingReady => return Err(SessionError::NotReady.into()),
                SynthesisState::Synthesizing => return Err(SessionError::RoundInFlight.into()),
            }

            let (feed, stream) = stream::channel(self.inner.clone());
            round.current = Some(feed);
            round.round_count += 1;
            round.state = SynthesisState::Synthesizing;
            round.commit_sent_at = None;
            round.first_chunk_at = None;
            (stream, round.round_count)
        };

        log::info!(
            "🔊 Round {} on session {}: {} chars",
            round_no,
            self.inner.session_id(),
            text.chars().count()
        );

        let sent = async {
            self.inner
                .conn
                .send_json(&Message::text_append(text))
                .await?;
            self.inner.round().commit_sent_at = Some(Instant::now());
            self.inner.conn.send_json(&Message::input_commit()).await
        }
        .await;

        if let Err(e) = sent {
            log::error!("❌ Round {} failed to start: {}", round_no, e);
            drop(self.inner.round().finish());
            return Err(e);
        }
        Ok(stream)
    }

    /// Append text without committing.
    ///
    /// Manual control is timing-only: no round is attached, so any audio the
    /// gateway produces for it is discarded. Use
    /// [`synthesize_stream`](Self::synthesize_stream) to receive audio.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.ensure_open()?;
        self.inner.conn.send_json(&Message::text_append(text)).await
    }

    /// Commit buffered text, recording the commit time for TTFB. Audio for a
    /// manual commit is discarded, see [`send_text`](Self::send_text)
    pub async fn commit(&self) -> Result<()> {
        self.ensure_open()?;
        self.inner.round().commit_sent_at = Some(Instant::now());
        self.inner.conn.send_json(&Message::input_commit()).await
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            SynthesisState::Closed => Err(SessionError::Closed.into()),
            SynthesisState::AwaitingReady => Err(SessionError::NotReady.into()),
            _ => Ok(()),
        }
    }

    /// End the session: `session.end`, wait up to 2s for the gateway to
    /// close the socket, then force it closed. A round still in flight is
    /// completed so its reader does not wait forever.
    pub async fn close(&self) {
        if self.inner.close_started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.round().state = SynthesisState::Closed;

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
        conn.close().await;

        let (feed, rounds) = {
            let mut round = self.inner.round();
            (round.current.take(), round.round_count)
        };
        if let Some(feed) = feed {
            feed.push_done();
        }

        log::info!(
            "🛑 Synthesis session closed: id={}, rounds={}",
            self.inner.session_id(),
            rounds
        );
    }

    pub fn id(&self) -> &str {
        self.inner.id.get().map(String::as_str).unwrap_or("")
    }

    pub fn state(&self) -> SynthesisState {
        self.inner.round().state
    }

    pub fn round_count(&self) -> u64 {
        self.inner.round().round_count
    }

    pub fn is_synthesizing(&self) -> bool {
        self.state() == SynthesisState::Synthesizing
    }

    pub fn is_ready(&self) -> bool {
        matches!(
            self.state(),
            SynthesisState::Idle | SynthesisState::Synthesizing
        )
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SynthesisState::Closed
    }

    pub fn connect_duration(&self) -> Duration {
        self.inner.connect_duration()
    }

    pub fn connected_at(&self) -> Option<SystemTime> {
        self.inner.connected_at()
    }

    /// When the last `input.commit` went out
    pub fn commit_sent_at(&self) -> Option<Instant> {
        self.inner.commit_sent_at()
    }

    /// When the first `audio.delta` of the current round was demultiplexed
    pub fn first_chunk_received_at(&self) -> Option<Instant> {
        self.inner.first_chunk_received_at()
    }

    /// First chunk minus commit; zero until both are known
    pub fn ttfb(&self) -> Duration {
        self.inner.ttfb()
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.conn
    }
}

impl Drop for SynthesisSession {
    fn drop(&mut self) {
        self.inner.loop_cancel.cancel();
    }
}

async fn message_loop(inner: Arc<SessionInner>, cancel: CancellationToken) {
    loop {
        let inbound = tokio::select! {
            _ = inner.loop_cancel.cancelled() => break,
            _ = cancel.cancelled() => break,
            inbound = inner.conn.next_inbound() => inbound,
        };

        match inbound {
            Inbound::Frame(frame) => handle_frame(&inner, &frame).await,
            Inbound::Error(e) => {
                log::error!(
                    "❌ Synthesis session {} lost its connection: {}",
                    inner.session_id(),
                    e
                );
                inner.round().state = SynthesisState::Closed;
                inner.fail_round(e.into());
                break;
            }
            Inbound::Closed => {
                log::debug!("Connection closed under session {}", inner.session_id());
                inner.round().state = SynthesisState::Closed;
                if inner.close_started.load(Ordering::SeqCst) {
                    // Our own session.end: the round ends without audio
                    if let Some(feed) = inner.round().finish() {
                        feed.push_done();
                    }
                } else {
                    inner.fail_round(ConnectionError::Closed.into());
                }
                break;
            }
        }
    }
}

async fn handle_frame(inner: &SessionInner, frame: &[u8]) {
    let message = match Message::from_bytes(frame) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("⚠️ Ignoring inbound frame: {}", e);
            return;
        }
    };

    let kind = message.message_type();
    match message {
        Message::AudioDelta { audio } => {
            let (feed, seq) = {
                let mut round = inner.round();
                if round.first_chunk_at.is_none() {
                    round.first_chunk_at = Some(Instant::now());
                }
                round.seq += 1;
                (round.current.clone(), round.seq)
            };

            let bytes = match decode_audio(&audio) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("⚠️ Dropping audio.delta #{}: {}", seq, e);
                    return;
                }
            };

            match feed {
                Some(feed) => {
                    log::trace!("Audio chunk #{} ({} bytes)", seq, bytes.len());
                    let conn_closed = inner.conn.closed_signal();
                    if !feed.push_data(bytes, seq, &inner.loop_cancel, conn_closed).await {
                        log::debug!("Reader gone, dropped audio chunk #{}", seq);
                    }
                }
                None => log::debug!("audio.delta #{} with no round in flight", seq),
            }
        }
        Message::AudioDone => {
            let feed = inner.round().finish();
            if let Some(feed) = feed {
                log::info!("✅ Round complete on session {}", inner.session_id());
                feed.push_done();
            }
        }
        Message::Error { code, message } => {
            let err = ServerError::new(code, message);
            log::error!("❌ Session {} reported {}", inner.session_id(), err);
            inner.fail_round(err.into());
        }
        Message::SessionConfigDone | Message::Processing | Message::InputDone => {
            log::trace!("{} on session {}", kind, inner.session_id());
        }
        _ => {
            log::debug!(
                "Ignoring {} on synthesis session {}",
                kind,
                inner.session_id()
            );
        }
    }
}
