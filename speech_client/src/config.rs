use crate::error::ConfigError;
use secrecy::{ExposeSecret, SecretString};
use speech_protocol::SessionParams;
use std::env;
use std::time::Duration;
use url::Url;

pub const DEFAULT_GATEWAY_URL: &str = "ws://localhost:8080";
pub const DEFAULT_PROVIDER: &str = "tengen";
pub const DEFAULT_LANGUAGE: &str = "zh-CN";
pub const DEFAULT_AUDIO_FORMAT: &str = "pcm";
pub const DEFAULT_STT_SAMPLE_RATE: u32 = 16000;
pub const DEFAULT_TTS_SAMPLE_RATE: u32 = 8000;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RECONNECTS: u32 = 3;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

const ENV_GATEWAY_URL: &str = "SPEECH_GATEWAY_URL";
const ENV_PROVIDER: &str = "SPEECH_PROVIDER";
const ENV_API_KEY: &str = "SPEECH_API_KEY";
const ENV_LANGUAGE: &str = "SPEECH_LANGUAGE";
const ENV_VOICE_ID: &str = "SPEECH_VOICE_ID";

/// Settings for a single gateway connection.
///
/// A zero duration disables the corresponding deadline (or the heartbeat,
/// for `ping_interval`).
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub ping_interval: Duration,
    pub reconnect_backoff: Duration,
    /// Retries after the first attempt
    pub max_reconnects: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            max_reconnects: DEFAULT_MAX_RECONNECTS,
        }
    }
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Delay before attempt `attempt` (zero-based); the first attempt is immediate
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.reconnect_backoff.saturating_mul(factor)
    }
}

/// Recognition (speech-to-text) client settings
#[derive(Debug, Clone)]
pub struct RecognitionConfig {
    pub gateway_url: String,
    pub provider: String,
    pub api_key: Option<SecretString>,
    pub language: String,
    pub sample_rate: u32,
    pub audio_format: String,
    pub vad: Option<bool>,
    /// Silence after commit that the simplified operations treat as completion
    pub idle_timeout: Duration,

    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub ping_interval: Duration,
    pub reconnect_backoff: Duration,
    pub max_reconnects: u32,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            provider: DEFAULT_PROVIDER.to_string(),
            api_key: None,
            language: DEFAULT_LANGUAGE.to_string(),
            sample_rate: DEFAULT_STT_SAMPLE_RATE,
            audio_format: DEFAULT_AUDIO_FORMAT.to_string(),
            vad: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            max_reconnects: DEFAULT_MAX_RECONNECTS,
        }
    }
}

impl RecognitionConfig {
    pub fn new(gateway_url: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            provider: provider.into(),
            ..Default::default()
        }
    }

    /// Load configuration from `SPEECH_*` environment variables (and `.env`)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = Self::new(required_env(ENV_GATEWAY_URL)?, DEFAULT_PROVIDER);
        if let Some(provider) = optional_env(ENV_PROVIDER) {
            config.provider = provider;
        }
        if let Some(language) = optional_env(ENV_LANGUAGE) {
            config.language = language;
        }
        config.api_key = optional_env(ENV_API_KEY).map(SecretString::from);

        config.validate()?;
        Ok(config)
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(api_key.into()));
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_audio_format(mut self, audio_format: impl Into<String>) -> Self {
        self.audio_format = audio_format.into();
        self
    }

    pub fn with_vad(mut self, enabled: bool) -> Self {
        self.vad = Some(enabled);
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_reconnect(mut self, backoff: Duration, max_reconnects: u32) -> Self {
        self.reconnect_backoff = backoff;
        self.max_reconnects = max_reconnects;
        self
    }

    /// Check required fields and fill empty optional ones with defaults
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        validate_gateway(&self.gateway_url)?;
        if self.provider.trim().is_empty() {
            return Err(ConfigError::Missing("provider"));
        }
        if self.language.is_empty() {
            self.language = DEFAULT_LANGUAGE.to_string();
        }
        if self.sample_rate == 0 {
            self.sample_rate = DEFAULT_STT_SAMPLE_RATE;
        }
        if self.audio_format.is_empty() {
            self.audio_format = DEFAULT_AUDIO_FORMAT.to_string();
        }
        if self.idle_timeout.is_zero() {
            self.idle_timeout = DEFAULT_IDLE_TIMEOUT;
        }
        Ok(())
    }

    /// `{gateway}/ws/stt?provider=..[&api_key=..]`
    pub fn stream_url(&self) -> Result<Url, ConfigError> {
        let mut url = endpoint(&self.gateway_url, "ws/stt")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("provider", &self.provider);
            if let Some(key) = &self.api_key {
                query.append_pair("api_key", key.expose_secret());
            }
        }
        Ok(url)
    }

    pub fn connection_config(&self, url: &Url) -> ConnectionConfig {
        ConnectionConfig {
            url: url.to_string(),
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            ping_interval: self.ping_interval,
            reconnect_backoff: self.reconnect_backoff,
            max_reconnects: self.max_reconnects,
        }
    }

    /// `session.config` parameters with per-stream overrides applied
    pub fn session_params(&self, options: &StreamOptions) -> SessionParams {
        SessionParams {
            provider: Some(self.provider.clone()),
            language: Some(
                options
                    .language
                    .clone()
                    .unwrap_or_else(|| self.language.clone()),
            ),
            sample_rate: Some(options.sample_rate.unwrap_or(self.sample_rate)),
            audio_format: Some(
                options
                    .audio_format
                    .clone()
                    .unwrap_or_else(|| self.audio_format.clone()),
            ),
            vad: options.vad.or(self.vad),
            ..Default::default()
        }
    }
}

/// Synthesis (text-to-speech) client settings
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    pub gateway_url: String,
    pub provider: String,
    pub api_key: Option<SecretString>,
    pub voice_id: Option<String>,
    pub language: Option<String>,
    pub speed: f64,
    pub pitch: f64,
    pub volume: f64,
    pub sample_rate: u32,
    pub audio_format: String,

    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub ping_interval: Duration,
    pub reconnect_backoff: Duration,
    pub max_reconnects: u32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            provider: DEFAULT_PROVIDER.to_string(),
            api_key: None,
            voice_id: None,
            language: None,
            speed: 1.0,
            pitch: 1.0,
            volume: 1.0,
            sample_rate: DEFAULT_TTS_SAMPLE_RATE,
            audio_format: DEFAULT_AUDIO_FORMAT.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            max_reconnects: DEFAULT_MAX_RECONNECTS,
        }
    }
}

impl SynthesisConfig {
    pub fn new(gateway_url: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            provider: provider.into(),
            ..Default::default()
        }
    }

    /// Load configuration from `SPEECH_*` environment variables (and `.env`)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = Self::new(required_env(ENV_GATEWAY_URL)?, DEFAULT_PROVIDER);
        if let Some(provider) = optional_env(ENV_PROVIDER) {
            config.provider = provider;
        }
        config.language = optional_env(ENV_LANGUAGE);
        config.voice_id = optional_env(ENV_VOICE_ID);
        config.api_key = optional_env(ENV_API_KEY).map(SecretString::from);

        config.validate()?;
        Ok(config)
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(api_key.into()));
        self
    }

    pub fn with_voice(mut self, voice_id: impl Into<String>) -> Self {
        self.voice_id = Some(voice_id.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_prosody(mut self, speed: f64, pitch: f64, volume: f64) -> Self {
        self.speed = speed;
        self.pitch = pitch;
        self.volume = volume;
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_audio_format(mut self, audio_format: impl Into<String>) -> Self {
        self.audio_format = audio_format.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_reconnect(mut self, backoff: Duration, max_reconnects: u32) -> Self {
        self.reconnect_backoff = backoff;
        self.max_reconnects = max_reconnects;
        self
    }

    /// Check required fields and reset out-of-range values to defaults
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        validate_gateway(&self.gateway_url)?;
        if self.provider.trim().is_empty() {
            return Err(ConfigError::Missing("provider"));
        }
        if self.speed <= 0.0 {
            self.speed = 1.0;
        }
        if self.pitch <= 0.0 {
            self.pitch = 1.0;
        }
        if self.volume <= 0.0 {
            self.volume = 1.0;
        }
        if self.sample_rate == 0 {
            self.sample_rate = DEFAULT_TTS_SAMPLE_RATE;
        }
        if self.audio_format.is_empty() {
            self.audio_format = DEFAULT_AUDIO_FORMAT.to_string();
        }
        Ok(())
    }

    /// `{gateway}/ws/tts?provider=..[&voice_id=..][&api_key=..]`
    ///
    /// The voice travels in the URL so the gateway can pre-warm it before
    /// `session.config` arrives.
    pub fn stream_url(&self, voice_id: Option<&str>) -> Result<Url, ConfigError> {
        let mut url = endpoint(&self.gateway_url, "ws/tts")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("provider", &self.provider);
            if let Some(voice) = voice_id.filter(|v| !v.is_empty()) {
                query.append_pair("voice_id", voice);
            }
            if let Some(key) = &self.api_key {
                query.append_pair("api_key", key.expose_secret());
            }
        }
        Ok(url)
    }

    pub fn connection_config(&self, url: &Url) -> ConnectionConfig {
        ConnectionConfig {
            url: url.to_string(),
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            ping_interval: self.ping_interval,
            reconnect_backoff: self.reconnect_backoff,
            max_reconnects: self.max_reconnects,
        }
    }

    /// Resolve the voice for a session: the override wins over the default
    pub fn voice_for<'a>(&'a self, options: &'a SynthesisOptions) -> Option<&'a str> {
        options
            .voice_id
            .as_deref()
            .or(self.voice_id.as_deref())
    }

    /// `session.config` parameters with per-session overrides applied
    pub fn session_params(&self, options: &SynthesisOptions) -> SessionParams {
        SessionParams {
            provider: Some(self.provider.clone()),
            voice_id: self.voice_for(options).map(str::to_string),
            language: options.language.clone().or_else(|| self.language.clone()),
            speed: Some(options.speed.filter(|s| *s > 0.0).unwrap_or(self.speed)),
            pitch: Some(options.pitch.filter(|p| *p > 0.0).unwrap_or(self.pitch)),
            volume: Some(options.volume.filter(|v| *v > 0.0).unwrap_or(self.volume)),
            sample_rate: Some(options.sample_rate.unwrap_or(self.sample_rate)),
            audio_format: Some(
                options
                    .audio_format
                    .clone()
                    .unwrap_or_else(|| self.audio_format.clone()),
            ),
            ..Default::default()
        }
    }
}

/// Per-stream overrides for a recognition session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOptions {
    pub language: Option<String>,
    pub sample_rate: Option<u32>,
    pub audio_format: Option<String>,
    pub vad: Option<bool>,
}

/// Per-session overrides for a synthesis session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SynthesisOptions {
    pub voice_id: Option<String>,
    pub language: Option<String>,
    pub speed: Option<f64>,
    pub pitch: Option<f64>,
    pub volume: Option<f64>,
    pub sample_rate: Option<u32>,
    pub audio_format: Option<String>,
}

fn validate_gateway(gateway_url: &str) -> Result<(), ConfigError> {
    if gateway_url.trim().is_empty() {
        return Err(ConfigError::Missing("gateway_url"));
    }
    let url = Url::parse(gateway_url).map_err(|e| ConfigError::Invalid {
        field: "gateway_url",
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(ConfigError::Invalid {
            field: "gateway_url",
            reason: format!("unsupported scheme '{}', expected ws or wss", other),
        }),
    }
}

fn endpoint(gateway_url: &str, path: &str) -> Result<Url, ConfigError> {
    let base = gateway_url.trim_end_matches('/');
    Url::parse(&format!("{}/{}", base, path)).map_err(|e| ConfigError::Invalid {
        field: "gateway_url",
        reason: e.to_string(),
    })
}

fn required_env(name: &str) -> Result<String, ConfigError> {
    optional_env(name).ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

fn optional_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}
