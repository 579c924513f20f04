//! # Configuration Management
//!
//! Loads the assistant configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `GEMINI_API_KEY` (special case, like deployment platforms' HOST/PORT)
//! 2. Environment variables (APP_BACKEND__MODEL, APP_SESSION__LANGUAGE_CODE, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Session settings are read once when a session is opened; changing them
//! requires a new session.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Language used when nothing else is configured.
pub const DEFAULT_LANGUAGE_CODE: &str = "hi-IN";

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub session: SessionSettings,
    pub audio: AudioSettings,
    pub io: IoSettings,
}

/// Where the live backend lives and which model to talk to.
///
/// ## Fields:
/// - `endpoint`: WebSocket URL of the bidirectional streaming service (without the key)
/// - `model`: model name, sent as `models/<model>` in the setup frame
/// - `api_key`: appended as the `key` query parameter; usually set via `GEMINI_API_KEY`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: String,
}

/// Per-session conversation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Prebuilt voice used for synthesized speech
    pub voice: String,
    /// BCP-47 code of the spoken language (e.g. "hi-IN", "en-IN")
    pub language_code: String,
    /// Replaces the built-in persona prompt when set
    pub system_instruction: Option<String>,
}

/// Audio graph settings.
///
/// ## Tuning guidelines:
/// - Smaller `capture_chunk_size`: lower latency, more messages on the wire
/// - Larger `capture_chunk_size`: fewer messages, more delay before the backend hears speech
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub capture_chunk_size: usize,
    pub input_gain: f32,
    pub output_gain: f32,
}

/// File-backed I/O used by the command-line runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoSettings {
    /// WAV file streamed as the microphone
    pub input_wav: Option<String>,
    /// WAV file the synthesized playback is rendered into
    pub output_wav: Option<String>,
    /// Feed the input file at real-time speed instead of as fast as possible
    pub realtime_pacing: bool,
    /// JSON array of mandi records the market tools answer from
    pub market_data: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig {
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                model: "gemini-live-2.5-flash-preview".to_string(),
                api_key: String::new(),
            },
            session: SessionSettings {
                voice: "Orus".to_string(),
                language_code: DEFAULT_LANGUAGE_CODE.to_string(),
                system_instruction: None,
            },
            audio: AudioSettings {
                input_sample_rate: 16000,  // what the backend expects from the microphone
                output_sample_rate: 24000, // what the backend synthesizes
                capture_chunk_size: 256,
                input_gain: 1.0,
                output_gain: 1.0,
            },
            io: IoSettings {
                input_wav: None,
                output_wav: None,
                realtime_pacing: true,
                market_data: None,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from all sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SESSION__LANGUAGE_CODE=ta-IN`: answer in Tamil
    /// - `APP_AUDIO__CAPTURE_CHUNK_SIZE=4096`: send bigger chunks
    /// - `APP_IO__INPUT_WAV=question.wav`: stream a file as the microphone
    /// - `APP_IO__MARKET_DATA=mandi.json`: answer price questions from a file
    /// - `GEMINI_API_KEY=...`: backend key
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(key) = env::var("GEMINI_API_KEY") {
            settings = settings.set_override("backend.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Endpoint, model and language code are not empty
    /// - Sample rates and chunk size are greater than 0
    /// - Gains are finite and not negative
    pub fn validate(&self) -> Result<()> {
        if self.backend.endpoint.trim().is_empty() {
            return Err(anyhow::anyhow!("Backend endpoint cannot be empty"));
        }

        if self.backend.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Backend model cannot be empty"));
        }

        if self.session.language_code.trim().is_empty() {
            return Err(anyhow::anyhow!("Language code cannot be empty"));
        }

        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.capture_chunk_size == 0 {
            return Err(anyhow::anyhow!("Capture chunk size must be greater than 0"));
        }

        for (name, gain) in [("input", self.audio.input_gain), ("output", self.audio.output_gain)] {
            if !gain.is_finite() || gain < 0.0 {
                return Err(anyhow::anyhow!("{} gain must be a finite, non-negative number", name));
            }
        }

        Ok(())
    }

    /// Full WebSocket URL including the API key.
    pub fn backend_url(&self) -> String {
        if self.backend.api_key.is_empty() {
            self.backend.endpoint.clone()
        } else {
            format!("{}?key={}", self.backend.endpoint, self.backend.api_key)
        }
    }
}
