use crate::error::{Result, SpeechError};
use crate::tts::session::{SessionInner, SynthesisSession};
use std::future::poll_fn;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant, SystemTime};
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const CHUNK_CHANNEL_CAPACITY: usize = 100;
const READ_ALL_BUFFER: usize = 8192;

/// What the message loop hands to a round's stream
#[derive(Debug, Clone, PartialEq)]
pub enum AudioChunk {
    Data { bytes: Vec<u8>, seq: u64 },
    Done,
    Error(SpeechError),
}

#[derive(Debug, Default)]
struct StreamShared {
    total_size: AtomicU64,
    error: Mutex<Option<SpeechError>>,
    closed: CancellationToken,
}

/// Producer half of an [`AudioStream`], held by the session while its
/// round is in flight
#[derive(Debug, Clone)]
pub(crate) struct StreamFeed {
    tx: mpsc::Sender<AudioChunk>,
    shared: Arc<StreamShared>,
}

impl StreamFeed {
    /// Push audio, waiting while the stream's buffer is full.
    ///
    /// Gives up (returning false) once the stream is closed or `halt` fires.
    pub(crate) async fn push_data(
        &self,
        bytes: Vec<u8>,
        seq: u64,
        halt: &CancellationToken,
        conn_closed: &CancellationToken,
    ) -> bool {
        tokio::select! {
            biased;
            sent = self.tx.send(AudioChunk::Data { bytes, seq }) => sent.is_ok(),
            _ = self.shared.closed.cancelled() => false,
            _ = halt.cancelled() => false,
            _ = conn_closed.cancelled() => false,
        }
    }

    /// Completion sentinel; never blocks, and ends the stream
    pub(crate) fn push_done(self) {
        let _ = self.tx.try_send(AudioChunk::Done);
    }

    /// Error sentinel; never blocks, and ends the stream.
    ///
    /// The error is also kept on the stream so a reader that misses the
    /// sentinel (full buffer) still sees it once the buffer drains.
    pub(crate) fn push_error(self, err: SpeechError) {
        *self
            .shared
            .error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(err.clone());
        let _ = self.tx.try_send(AudioChunk::Error(err));
    }
}

/// Audio of one synthesis round as a pull-based byte stream.
///
/// Chunks are delivered with back-pressure: when the internal buffer is full
/// the session's message loop waits for the reader instead of dropping
/// audio. A slow reader therefore slows the whole connection down.
///
/// `read` returns `Ok(0)` at the end of the round. If the round failed, the
/// error is returned once and end-of-stream follows.
pub struct AudioStream {
    rx: mpsc::Receiver<AudioChunk>,
    buffer: Vec<u8>,
    pos: usize,
    finished: bool,
    error_reported: bool,
    shared: Arc<StreamShared>,
    session: Arc<SessionInner>,
    owner: Option<SynthesisSession>,
}

pub(crate) fn channel(session: Arc<SessionInner>) -> (StreamFeed, AudioStream) {
    let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
    let shared = Arc::new(StreamShared::default());

    let feed = StreamFeed {
        tx,
        shared: shared.clone(),
    };
    let stream = AudioStream {
        rx,
        buffer: Vec::new(),
        pos: 0,
        finished: false,
        error_reported: false,
        shared,
        session,
        owner: None,
    };
    (feed, stream)
}

impl AudioStream {
    /// Make closing this stream also close `session`
    pub(crate) fn set_owner(&mut self, session: SynthesisSession) {
        self.owner = Some(session);
    }

    fn poll_read_into(&mut self, cx: &mut Context<'_>, dst: &mut [u8]) -> Poll<Result<usize>> {
        loop {
            if self.pos < self.buffer.len() {
                let n = dst.len().min(self.buffer.len() - self.pos);
                dst[..n].copy_from_slice(&self.buffer[self.pos..self.pos + n]);
                self.pos += n;
                if self.pos == self.buffer.len() {
                    self.buffer.clear();
                    self.pos = 0;
                }
                return Poll::Ready(Ok(n));
            }
            if self.finished || dst.is_empty() {
                return Poll::Ready(Ok(0));
            }

            match ready!(self.rx.poll_recv(cx)) {
                Some(AudioChunk::Data { bytes, .. }) => {
                    self.shared
                        .total_size
                        .fetch_add(bytes.len() as u64, Ordering::SeqCst);
                    self.buffer = bytes;
                    self.pos = 0;
                }
                Some(AudioChunk::Done) => {
                    self.finished = true;
                }
                Some(AudioChunk::Error(err)) => {
                    self.finished = true;
                    self.error_reported = true;
                    return Poll::Ready(Err(err));
                }
                None => {
                    self.finished = true;
                    if let Some(err) = self.unreported_error() {
                        return Poll::Ready(Err(err));
                    }
                }
            }
        }
    }

    fn unreported_error(&mut self) -> Option<SpeechError> {
        if self.error_reported {
            return None;
        }
        self.error_reported = true;
        self.error()
    }

    /// Read into `buf`; `Ok(0)` means the round is over
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        poll_fn(|cx| self.poll_read_into(cx, buf)).await
    }

    /// Next chunk as it arrived from the gateway, or `None` at end of round
    pub async fn next_chunk(&mut self) -> Option<Result<Vec<u8>>> {
        if self.pos < self.buffer.len() {
            let rest = self.buffer.split_off(self.pos);
            self.buffer.clear();
            self.pos = 0;
            return Some(Ok(rest));
        }

        let mut buf = vec![0u8; READ_ALL_BUFFER];
        match self.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                if self.pos < self.buffer.len() {
                    buf.extend_from_slice(&self.buffer[self.pos..]);
                    self.buffer.clear();
                    self.pos = 0;
                }
                Some(Ok(buf))
            }
            Err(e) => Some(Err(e)),
        }
    }

    /// Read the rest of the round into memory
    pub async fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut audio = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            audio.extend_from_slice(&chunk?);
        }
        Ok(audio)
    }

    /// Write the rest of the round to `path`, returning the bytes written
    pub async fn save_to_file(&mut self, path: impl AsRef<Path>) -> Result<u64> {
        let mut file = tokio::fs::File::create(path.as_ref()).await?;
        let mut written = 0u64;
        while let Some(chunk) = self.next_chunk().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    /// Stop reading. Wakes the producer, and closes the owning session if
    /// this stream was created as a single-use stream.
    pub async fn close(&mut self) {
        if !self.shared.closed.is_cancelled() {
            self.shared.closed.cancel();
            self.finished = true;
            self.buffer.clear();
            self.pos = 0;
            self.rx.close();
        }
        if let Some(owner) = self.owner.take() {
            owner.close().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Bytes received from the gateway so far
    pub fn total_size(&self) -> u64 {
        self.shared.total_size.load(Ordering::SeqCst)
    }

    /// The error that ended this round, if any
    pub fn error(&self) -> Option<SpeechError> {
        self.shared
            .error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn connect_duration(&self) -> Duration {
        self.session.connect_duration()
    }

    pub fn connected_at(&self) -> Option<SystemTime> {
        self.session.connected_at()
    }

    pub fn commit_sent_at(&self) -> Option<Instant> {
        self.session.commit_sent_at()
    }

    pub fn first_chunk_received_at(&self) -> Option<Instant> {
        self.session.first_chunk_received_at()
    }

    pub fn ttfb(&self) -> Duration {
        self.session.ttfb()
    }
}

impl AsyncRead for AudioStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let dst = buf.initialize_unfilled();
        match ready!(this.poll_read_into(cx, dst)) {
            Ok(n) => {
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e))),
        }
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        self.shared.closed.cancel();
    }
}

impl std::fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioStream")
            .field("total_size", &self.total_size())
            .field("finished", &self.finished)
            .field("closed", &self.is_closed())
            .finish()
    }
}
