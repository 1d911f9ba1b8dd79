use crate::llm::{LlmConfig, LlmProvider};
use crate::stt::RecognitionConfig;
use crate::tts::{PlaybackParams, TtsConfig};
use secrecy::{ExposeSecret, SecretBox};
use std::env;
use thiserror::Error;

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid API key format for {service}: {reason}")]
    InvalidKeyFormat { service: String, reason: String },
    #[error("Invalid setting {name}: {reason}")]
    InvalidSetting { name: String, reason: String },
}

/// Credentials and endpoints for the hosted engines
#[derive(Debug)]
pub struct ApiConfig {
    pub fireworks_key: SecretBox<String>,
    pub elevenlabs_key: SecretBox<String>,
    pub groq_key: Option<SecretBox<String>>,
    pub ollama_base_url: String,
}

impl ApiConfig {
    /// Load API configuration from environment variables. The Groq key is
    /// only required when Groq is the selected provider.
    pub fn load(provider: LlmProvider) -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();

        let fireworks_key = Self::load_api_key("FIREWORKS_API_KEY", "Fireworks AI")?;
        let elevenlabs_key = Self::load_api_key("ELEVENLABS_API_KEY", "ElevenLabs")?;
        let groq_key = match provider {
            LlmProvider::Groq => Some(Self::load_api_key("GROQ_API_KEY", "Groq")?),
            LlmProvider::Ollama => None,
        };
        let ollama_base_url =
            env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| DEFAULT_OLLAMA_URL.to_string());

        Ok(Self {
            fireworks_key,
            elevenlabs_key,
            groq_key,
            ollama_base_url,
        })
    }

    /// Load and validate a single API key from environment
    fn load_api_key(env_var: &str, service_name: &str) -> Result<SecretBox<String>, ConfigError> {
        let key = env::var(env_var).map_err(|_| ConfigError::MissingEnvVar(env_var.to_string()))?;

        if key.trim().is_empty() {
            return Err(ConfigError::InvalidKeyFormat {
                service: service_name.to_string(),
                reason: "API key cannot be empty".to_string(),
            });
        }

        Self::validate_key_format(&key, service_name)?;

        Ok(SecretBox::new(Box::new(key)))
    }

    /// Validate API key format for each service
    fn validate_key_format(key: &str, service: &str) -> Result<(), ConfigError> {
        match service {
            "Fireworks AI" => {
                if !key.starts_with("fw_") {
                    return Err(ConfigError::InvalidKeyFormat {
                        service: service.to_string(),
                        reason: "Fireworks AI keys should start with 'fw_'".to_string(),
                    });
                }
            }
            "Groq" => {
                if !key.starts_with("gsk_") {
                    return Err(ConfigError::InvalidKeyFormat {
                        service: service.to_string(),
                        reason: "Groq keys should start with 'gsk_'".to_string(),
                    });
                }
            }
            "ElevenLabs" => {
                if key.len() < 10 {
                    return Err(ConfigError::InvalidKeyFormat {
                        service: service.to_string(),
                        reason: "ElevenLabs keys should be at least 10 characters".to_string(),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Get Fireworks API key (use only when making API calls)
    pub fn fireworks_key(&self) -> &str {
        self.fireworks_key.expose_secret()
    }

    /// Get ElevenLabs API key (use only when making API calls)
    pub fn elevenlabs_key(&self) -> &str {
        self.elevenlabs_key.expose_secret()
    }

    /// Get Groq API key, if one was loaded
    pub fn groq_key(&self) -> Option<&str> {
        self.groq_key.as_ref().map(|key| key.expose_secret().as_str())
    }
}

/// Load configuration with helpful error messages for development
pub fn load_config(provider: LlmProvider) -> Result<ApiConfig, ConfigError> {
    match ApiConfig::load(provider) {
        Ok(config) => {
            log::info!("Successfully loaded API configuration (provider: {})", provider);
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

/// Everything one conversation needs besides credentials
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Completed turns kept as context for the agent
    pub max_history_turns: usize,
    /// Canonical audio chunks buffered between the adapter and the recognizer
    pub audio_queue_capacity: usize,
    /// Final transcripts that end the session
    pub exit_words: Vec<String>,
    pub recognition: RecognitionConfig,
    pub playback: PlaybackParams,
    pub tts: TtsConfig,
    pub llm: LlmConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_history_turns: 3,
            audio_queue_capacity: 64,
            exit_words: ["exit", "quit", "goodbye", "stop"]
                .iter()
                .map(|w| w.to_string())
                .collect(),
            recognition: RecognitionConfig::default(),
            playback: PlaybackParams::default(),
            tts: TtsConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_history_turns == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "max_history_turns".to_string(),
                reason: "must keep at least one turn".to_string(),
            });
        }
        if self.audio_queue_capacity == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "audio_queue_capacity".to_string(),
                reason: "queue needs room for at least one chunk".to_string(),
            });
        }
        let fraction = self.recognition.sensitivity.early_transcription_fraction;
        if !(0.0..=1.0).contains(&fraction) {
            return Err(ConfigError::InvalidSetting {
                name: "early_transcription_fraction".to_string(),
                reason: format!("{} is outside 0.0..=1.0", fraction),
            });
        }
        if !(0.7..=1.2).contains(&self.tts.speed) {
            return Err(ConfigError::InvalidSetting {
                name: "speed".to_string(),
                reason: format!("{} is outside 0.7..=1.2", self.tts.speed),
            });
        }
        Ok(())
    }

    /// Whether a final transcript asks to end the conversation
    pub fn is_exit_phrase(&self, text: &str) -> bool {
        let normalized = text
            .trim()
            .trim_end_matches(|c: char| c.is_ascii_punctuation())
            .to_lowercase();
        self.exit_words.iter().any(|w| *w == normalized)
    }
}
