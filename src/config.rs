//! # Configuration Management
//!
//! Loads worker configuration from several sources:
//! - Built-in defaults (the `Default` impl below)
//! - A TOML file (`transcriber.toml` in the working directory, or `--config`)
//! - Environment variables with the `TRANSCRIBER` prefix
//! - Command-line flags (applied by `main` after loading)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Command-line flags (`--host`, `--port`, `--mode`)
//! 2. `TRANSCRIBER_LOG_LEVEL` / `TRANSCRIBER_LOG_PATH`
//! 3. Environment variables (`TRANSCRIBER__SERVER__PORT=9000`, ...)
//! 4. Configuration file
//! 5. Default values
//!
//! The nested separator is a double underscore because several keys
//! (`compute_type`, `batch_size`, ...) contain single underscores.

use crate::engine::EngineKind;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Log levels understood by `logging.level`.
pub const LOG_LEVELS: &[&str] = &["silent", "error", "info", "debug"];

/// Main worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub worker: WorkerConfig,
    pub defaults: RequestDefaults,
    pub logging: LoggingConfig,
    pub engines: EnginesConfig,
}

/// HTTP listener settings.
///
/// The worker is meant for loopback use; there is no TLS or authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest request body accepted by `/warmup` and `/transcribe`
    pub max_body_bytes: usize,
}

/// Which transport surface the process serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// JSON over HTTP (`/health`, `/status`, `/warmup`, `/transcribe`)
    Http,
    /// Newline-delimited JSON on stdin/stdout
    Stdio,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub mode: TransportMode,
}

/// Values used when a request leaves a field out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDefaults {
    pub engine: String,
    pub model: String,
    pub compute_type: String,
    pub device: String,
    pub batch_size: usize,
    /// Suffix of the staged audio file; engines sniff the container from it
    pub extension: String,
}

/// Log output settings.
///
/// `RUST_LOG`, when set, takes precedence over `level`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// One of `silent`, `error`, `info`, `debug`
    pub level: String,
    /// Optional file that receives a copy of every log line
    pub path: Option<String>,
}

/// Executables used by the subprocess-backed engines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnginesConfig {
    /// openai-whisper command line
    pub whisper_program: String,
    /// faster-whisper command line (whisper-ctranslate2)
    pub faster_program: String,
    /// Used to decode arbitrary containers into 16 kHz PCM
    pub ffmpeg_program: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8765,
                max_body_bytes: 256 * 1024 * 1024,
            },
            worker: WorkerConfig {
                mode: TransportMode::Http,
            },
            defaults: RequestDefaults {
                engine: EngineKind::Aligned.as_str().to_string(),
                model: "small".to_string(),
                compute_type: "int8".to_string(),
                device: "default".to_string(),
                batch_size: 4,
                extension: ".webm".to_string(),
            },
            logging: LoggingConfig {
                level: "error".to_string(),
                path: None,
            },
            engines: EnginesConfig {
                whisper_program: "whisper".to_string(),
                faster_program: "whisper-ctranslate2".to_string(),
                ffmpeg_program: "ffmpeg".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, an optional file and the environment.
    ///
    /// ## Parameters:
    /// - **file**: explicit config file; when `None`, `transcriber.toml` is
    ///   read if it exists
    pub fn load(file: Option<&str>) -> Result<Self> {
        let file_source = match file {
            Some(path) => config::File::with_name(path).required(true),
            None => config::File::with_name("transcriber").required(false),
        };

        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(file_source)
            .add_source(
                config::Environment::with_prefix("TRANSCRIBER")
                    .prefix_separator("__")
                    .separator("__"),
            );

        // Short names kept for parity with existing launch scripts
        if let Ok(level) = env::var("TRANSCRIBER_LOG_LEVEL") {
            settings = settings.set_override("logging.level", level.to_lowercase())?;
        }

        if let Ok(path) = env::var("TRANSCRIBER_LOG_PATH") {
            settings = settings.set_override("logging.path", path)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Check that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.max_body_bytes == 0 {
            return Err(anyhow::anyhow!("Server max_body_bytes must be greater than 0"));
        }

        if self.defaults.batch_size == 0 {
            return Err(anyhow::anyhow!("Default batch size must be greater than 0"));
        }

        self.defaults
            .engine
            .parse::<EngineKind>()
            .map_err(|e| anyhow::anyhow!("Invalid default engine: {}", e))?;

        if !self.defaults.extension.starts_with('.') {
            return Err(anyhow::anyhow!(
                "Default extension must start with '.', got '{}'",
                self.defaults.extension
            ));
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(anyhow::anyhow!(
                "Unknown log level '{}' (expected one of {})",
                self.logging.level,
                LOG_LEVELS.join(", ")
            ));
        }

        Ok(())
    }

    /// Tracing filter directive for the configured level.
    pub fn log_filter(&self) -> String {
        let level = match self.logging.level.as_str() {
            "silent" => "off",
            "debug" => "debug",
            "info" => "info",
            _ => "error",
        };
        format!("transcribe_worker={level},actix_web={level},actix_server={level}")
    }
}
