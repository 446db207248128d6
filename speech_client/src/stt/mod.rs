//! Speech-to-text: one-shot streaming recognition sessions and a client that
//! wraps them into whole-file / whole-buffer calls.

pub mod events;
pub mod session;

pub use events::{RecognitionEvent, RecognitionEvents};
pub use session::{RecognitionSession, RecognitionState};

use crate::config::{RecognitionConfig, StreamOptions};
use crate::error::{Result, SessionError, SpeechError};
use crate::transport::{Connection, TlsSessionCache};
use session::truncate;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const WAV_HEADER_LEN: usize = 44;

/// One final transcript segment
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub text: String,
    pub start: Duration,
    pub end: Duration,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecognitionResult {
    /// All final segments joined together
    pub text: String,
    pub segments: Vec<Segment>,
    /// Wall-clock time of the whole call
    pub duration: Duration,
}

/// Factory for recognition sessions against one gateway
pub struct RecognitionClient {
    config: RecognitionConfig,
    tls: TlsSessionCache,
}

impl RecognitionClient {
    pub fn new(mut config: RecognitionConfig) -> Result<Self> {
        config.validate()?;
        log::info!(
            "🎤 Recognition client: gateway={}, provider={}, language={}",
            config.gateway_url,
            config.provider,
            config.language
        );

        Ok(Self {
            config,
            tls: TlsSessionCache::shared(),
        })
    }

    /// Use `tls` instead of the process-wide session cache
    pub fn with_tls_cache(mut self, tls: TlsSessionCache) -> Self {
        self.tls = tls;
        self
    }

    pub fn config(&self) -> &RecognitionConfig {
        &self.config
    }

    /// Connect and start a session; the caller drives audio and events
    pub async fn recognize_stream(
        &self,
        options: &StreamOptions,
        cancel: &CancellationToken,
    ) -> Result<RecognitionSession> {
        let url = self.config.stream_url()?;
        let conn = Connection::with_tls_cache(self.config.connection_config(&url), self.tls.clone());
        conn.connect_with_retry(cancel).await?;

        let session = RecognitionSession::new(conn, self.config.session_params(options));
        if let Err(e) = session.start(cancel).await {
            log::error!("❌ Recognition session failed to start: {}", e);
            session.connection().close().await;
            return Err(e);
        }
        Ok(session)
    }

    /// Recognize a raw PCM file; a `.wav` file has its 44-byte header skipped
    pub async fn recognize_file(
        &self,
        path: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> Result<RecognitionResult> {
        let path = path.as_ref();
        let mut audio = tokio::fs::read(path)
            .await
            .map_err(|e| SpeechError::Io(format!("audio file {}: {}", path.display(), e)))?;

        let is_wav = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"));
        if is_wav {
            audio.drain(..WAV_HEADER_LEN.min(audio.len()));
        }

        log::info!(
            "📁 Recognizing {} ({} bytes of audio)",
            path.display(),
            audio.len()
        );
        self.recognize_audio(audio, cancel).await
    }

    /// Recognize a buffer of raw PCM
    pub async fn recognize_bytes(
        &self,
        audio: &[u8],
        cancel: &CancellationToken,
    ) -> Result<RecognitionResult> {
        self.recognize_audio(audio.to_vec(), cancel).await
    }

    /// Stream `audio` in 100ms chunks, commit, and collect final transcripts.
    ///
    /// Completes on `input.done`, on session close, or once no event has
    /// arrived for `idle_timeout` after the commit went out.
    async fn recognize_audio(
        &self,
        audio: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<RecognitionResult> {
        let started = Instant::now();
        let session = Arc::new(self.recognize_stream(&StreamOptions::default(), cancel).await?);
        let Some(mut events) = session.events() else {
            session.close().await;
            return Err(SessionError::Closed.into());
        };

        let chunk_size = (self.config.sample_rate as usize * 2 / 10).max(1);
        let sender_session = session.clone();
        let mut sender = tokio::spawn(async move {
            for chunk in audio.chunks(chunk_size) {
                sender_session.send(chunk).await?;
            }
            sender_session.commit().await
        });

        let idle_timeout = self.config.idle_timeout;
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        let mut committed = false;
        let mut sending = true;
        let mut result = RecognitionResult::default();
        let mut failure: Option<SpeechError> = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    failure = Some(SpeechError::Cancelled);
                    break;
                }
                joined = &mut sender, if sending => {
                    sending = false;
                    match joined {
                        Ok(Ok(())) => {
                            committed = true;
                            idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
                        }
                        Ok(Err(e)) => {
                            failure = Some(e);
                            break;
                        }
                        Err(e) => {
                            failure = Some(SpeechError::Io(format!("audio sender failed: {}", e)));
                            break;
                        }
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if committed {
                        idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
                    }
                    match event {
                        RecognitionEvent::Final { text, start, end } => {
                            result.segments.push(Segment { text, start, end });
                        }
                        RecognitionEvent::Error(e) => failure = Some(e),
                        RecognitionEvent::InputDone | RecognitionEvent::Closed => break,
                        _ => {}
                    }
                }
                _ = &mut idle, if committed => {
                    log::info!(
                        "⏱️ No event for {:?} after commit, treating recognition as complete",
                        idle_timeout
                    );
                    break;
                }
            }
        }

        if sending {
            sender.abort();
        }
        session.close().await;

        if let Some(e) = failure {
            return Err(e);
        }

        result.text = result
            .segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<String>();
        result.duration = started.elapsed();
        log::info!(
            "✅ Recognition complete in {:?}: '{}'",
            result.duration,
            truncate(&result.text)
        );
        Ok(result)
    }
}
