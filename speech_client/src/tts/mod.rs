//! Text-to-speech: reusable synthesis sessions whose rounds are exposed as
//! pull-based audio streams.

pub mod session;
pub mod stream;

pub use session::{SynthesisSession, SynthesisState};
pub use stream::{AudioChunk, AudioStream};

use crate::config::{SynthesisConfig, SynthesisOptions};
use crate::error::Result;
use crate::transport::{Connection, TlsSessionCache};
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Factory for synthesis sessions against one gateway
pub struct SynthesisClient {
    config: SynthesisConfig,
    tls: TlsSessionCache,
}

impl SynthesisClient {
    pub fn new(mut config: SynthesisConfig) -> Result<Self> {
        config.validate()?;
        log::info!(
            "🗣️ Synthesis client: gateway={}, provider={}, voice={}",
            config.gateway_url,
            config.provider,
            config.voice_id.as_deref().unwrap_or("default")
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

    pub fn config(&self) -> &SynthesisConfig {
        &self.config
    }

    /// Connect and start a session that can run any number of rounds
    pub async fn create_session(
        &self,
        options: &SynthesisOptions,
        cancel: &CancellationToken,
    ) -> Result<SynthesisSession> {
        let url = self.config.stream_url(self.config.voice_for(options))?;
        let conn = Connection::with_tls_cache(self.config.connection_config(&url), self.tls.clone());
        conn.connect_with_retry(cancel).await?;

        let session = SynthesisSession::new(conn, self.config.session_params(options));
        if let Err(e) = session.start(cancel).await {
            log::error!("❌ Synthesis session failed to start: {}", e);
            session.connection().close().await;
            return Err(e);
        }
        Ok(session)
    }

    /// Synthesize `text` on a fresh session; closing the stream closes it
    pub async fn synthesize_stream(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<AudioStream> {
        self.synthesize_stream_with_options(text, &SynthesisOptions::default(), cancel)
            .await
    }

    pub async fn synthesize_stream_with_options(
        &self,
        text: &str,
        options: &SynthesisOptions,
        cancel: &CancellationToken,
    ) -> Result<AudioStream> {
        let session = self.create_session(options, cancel).await?;
        match session.synthesize_stream(text).await {
            Ok(mut stream) => {
                stream.set_owner(session);
                Ok(stream)
            }
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    /// Synthesize `text` and collect all of its audio
    pub async fn synthesize_to_bytes(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let mut stream = self.synthesize_stream(text, cancel).await?;
        let audio = stream.read_all().await;
        stream.close().await;

        let audio = audio?;
        log::info!(
            "✅ Synthesized {} bytes (ttfb {:?})",
            audio.len(),
            stream.ttfb()
        );
        Ok(audio)
    }

    /// Synthesize `text` straight into `path`, returning the bytes written
    pub async fn synthesize_to_file(
        &self,
        text: &str,
        path: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let path = path.as_ref();
        let mut stream = self.synthesize_stream(text, cancel).await?;
        let written = stream.save_to_file(path).await;
        stream.close().await;

        let written = written?;
        log::info!("📁 Saved {} bytes of audio to {}", written, path.display());
        Ok(written)
    }
}
