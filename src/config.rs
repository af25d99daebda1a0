use crate::codec::{INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use secrecy::{ExposeSecret, SecretBox};
use std::env;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-12-2025";
pub const DEFAULT_VOICE: &str = "Kore";
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Samples per capture window (256ms at 16kHz)
pub const DEFAULT_CAPTURE_WINDOW: usize = 4096;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },
}

/// Credentials for the hosted speech model
#[derive(Debug)]
pub struct ApiConfig {
    api_key: SecretBox<String>,
}

impl ApiConfig {
    /// Load the API key from `GEMINI_API_KEY`, falling back to `API_KEY`
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();

        let key = env::var("GEMINI_API_KEY")
            .or_else(|_| env::var("API_KEY"))
            .map_err(|_| ConfigError::MissingEnvVar("GEMINI_API_KEY".to_string()))?;
        Self::from_key(key)
    }

    pub fn from_key(key: String) -> Result<Self, ConfigError> {
        if key.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "GEMINI_API_KEY".to_string(),
                reason: "API key cannot be empty".to_string(),
            });
        }
        Ok(Self {
            api_key: SecretBox::new(Box::new(key)),
        })
    }

    /// Get the API key (use only when opening a connection)
    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }
}

/// What the capture pipeline does with microphone audio while the model is
/// audibly speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum UpstreamGate {
    /// Keep streaming raw audio, only the volume meter reads zero
    #[default]
    MeterOnly,
    /// Send silence of the same length instead of the microphone signal
    Mute,
}

/// Immutable parameters of one live session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionParams {
    pub model: String,
    pub system_prompt: String,
    pub voice: String,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            system_prompt: String::new(),
            voice: DEFAULT_VOICE.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub params: SessionParams,
    pub endpoint: String,
    pub connect_timeout: Duration,
    /// Input device name (None = default device)
    pub input_device: Option<String>,
    /// Input channel to capture from (0-based index)
    pub input_channel: u16,
    /// Output device name (None = default device)
    pub output_device: Option<String>,
    pub capture_window: usize,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub upstream_gate: UpstreamGate,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            params: SessionParams::default(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            connect_timeout: Duration::from_secs(10),
            input_device: None,
            input_channel: 0,
            output_device: None,
            capture_window: DEFAULT_CAPTURE_WINDOW,
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            upstream_gate: UpstreamGate::MeterOnly,
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by `LIVE_MODEL`, `LIVE_VOICE` and `LIVE_ENDPOINT`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(model) = env::var("LIVE_MODEL") {
            config.params.model = model;
        }
        if let Ok(voice) = env::var("LIVE_VOICE") {
            config.params.voice = voice;
        }
        if let Ok(endpoint) = env::var("LIVE_ENDPOINT") {
            config.endpoint = endpoint;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture_window == 0 {
            return Err(ConfigError::InvalidValue {
                name: "capture_window".to_string(),
                reason: "must be at least one sample".to_string(),
            });
        }
        for (name, rate) in [
            ("input_sample_rate", self.input_sample_rate),
            ("output_sample_rate", self.output_sample_rate),
        ] {
            if rate == 0 {
                return Err(ConfigError::InvalidValue {
                    name: name.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.params.model.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "model".to_string(),
                reason: "cannot be empty".to_string(),
            });
        }
        if !self.endpoint.starts_with("ws://") && !self.endpoint.starts_with("wss://") {
            return Err(ConfigError::InvalidValue {
                name: "endpoint".to_string(),
                reason: format!("'{}' is not a websocket URL", self.endpoint),
            });
        }
        Ok(())
    }
}

/// Load configuration with helpful error messages for development
pub fn load_config() -> Result<(ApiConfig, SessionConfig), ConfigError> {
    match ApiConfig::load().and_then(|api| Ok((api, SessionConfig::from_env()?))) {
        Ok(config) => {
            log::info!("Successfully loaded session configuration");
            Ok(config)
        }
        Err(ConfigError::MissingEnvVar(var)) => {
            log::error!("Missing required environment variable: {}", var);
            log::error!("Create a .env file in the project root with:");
            log::error!("{}=your_api_key_here", var);
            Err(ConfigError::MissingEnvVar(var))
        }
        Err(e) => {
            log::error!("Configuration error: {}", e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.params.model, DEFAULT_MODEL);
        assert_eq!(config.params.voice, "Kore");
        assert_eq!(config.capture_window, 4096);
        assert_eq!(config.input_sample_rate, 16_000);
        assert_eq!(config.output_sample_rate, 24_000);
        assert_eq!(config.upstream_gate, UpstreamGate::MeterOnly);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = SessionConfig::default();
        config.capture_window = 0;
        assert!(config.validate().is_err());

        let mut config = SessionConfig::default();
        config.endpoint = "https://example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_sample_rates_rejected() {
        let mut config = SessionConfig::default();
        config.output_sample_rate = 0;
        match config.validate() {
            Err(ConfigError::InvalidValue { name, .. }) => assert_eq!(name, "output_sample_rate"),
            other => panic!("unexpected result: {:?}", other),
        }

        let mut config = SessionConfig::default();
        config.input_sample_rate = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(ApiConfig::from_key("   ".to_string()).is_err());
        let api = ApiConfig::from_key("abc123".to_string()).unwrap();
        assert_eq!(api.api_key(), "abc123");
    }
}
