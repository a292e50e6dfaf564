use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub app: AppSettings,
    pub jwt: JwtSettings,
    pub recognizer: RecognizerSettings,
    pub live: LiveSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppSettings {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JwtSettings {
    pub secret: String,
    pub issuer: String,
}

/// Upstream streaming speech-recognition service.
#[derive(Debug, Deserialize, Clone)]
pub struct RecognizerSettings {
    /// WebSocket endpoint, e.g. wss://recognizer.example.com/v1/listen
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub language: String,
    /// Canonical PCM sample rate fed to the recognizer (Hz).
    pub sample_rate: u32,
    /// End-of-speech sensitivity forwarded to the recognizer (ms of silence).
    pub endpointing_ms: u32,
}

/// Knobs for the live room lifecycle and transcript relay.
#[derive(Debug, Deserialize, Clone)]
pub struct LiveSettings {
    /// Inactivity window after which a room is garbage-collected (ms).
    pub room_ttl_ms: u64,
    /// Interval between GC sweeps over the room registry (ms).
    pub sweep_interval_ms: u64,
    /// Interval between heartbeat pings on every socket (ms).
    pub heartbeat_interval_ms: u64,
    /// Consecutive unanswered pings before a socket is reaped.
    pub heartbeat_max_missed: u32,
    /// Minimum gap between two turns from the same speaker (ms).
    pub min_turn_gap_ms: u64,
    /// Cap on canonical frames buffered while the recognizer session opens.
    pub pending_audio_max_frames: usize,
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::default()
                    .separator("__")
                    .prefix("CONSULTA"),
            )
            .set_default("app.host", "0.0.0.0")?
            .set_default("app.port", 3000)?
            .set_default("app.cors_origins", Vec::<String>::new())?
            .set_default("jwt.secret", "change-me-in-production")?
            .set_default("jwt.issuer", "consulta")?
            .set_default("recognizer.url", "wss://api.deepgram.com/v1/listen")?
            .set_default("recognizer.api_key", None::<String>)?
            .set_default("recognizer.model", "nova-2")?
            .set_default("recognizer.language", "es")?
            .set_default("recognizer.sample_rate", 16000)?
            .set_default("recognizer.endpointing_ms", 1500)?
            .set_default("live.room_ttl_ms", 20 * 60 * 1000)?
            .set_default("live.sweep_interval_ms", 60 * 1000)?
            .set_default("live.heartbeat_interval_ms", 15 * 1000)?
            .set_default("live.heartbeat_max_missed", 3)?
            .set_default("live.min_turn_gap_ms", 150)?
            .set_default("live.pending_audio_max_frames", 512)?
            .build()?;

        config.try_deserialize()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::load().expect("Failed to load default settings")
    }
}
