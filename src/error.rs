//! # Error Handling
//!
//! Every failure that can reach a caller is expressed as an [`AppError`].
//! Runtime code below the adapters works with `anyhow::Result` and is
//! converted at the adapter or pipeline boundary, so transports only ever
//! see one of these variants.
//!
//! ## Taxonomy:
//! - **EngineUnavailable**: the engine runtime is not installed
//! - **InvalidInput**: the request payload is unusable (missing/bad audio)
//! - **ModelLoad**: loading failed for any other reason
//! - **Transcription**: the inference call failed
//! - **BadRequest / NotFound**: protocol-level problems (bad body, bad path)
//!
//! ## Wire format:
//! HTTP responses and stdio replies both carry the `Display` string of the
//! error, e.g. `{"error": "model load failed: ..."}`.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors surfaced to transport callers.
#[derive(Debug)]
pub enum AppError {
    /// Engine runtime missing; carries the engine name and an install hint
    EngineUnavailable {
        engine: &'static str,
        hint: &'static str,
    },

    /// Malformed transcription payload (missing audio, bad encoding, unknown engine)
    InvalidInput(String),

    /// Model load raised for a reason other than a missing runtime
    ModelLoad(String),

    /// Inference or audio staging failed after the model was obtained
    Transcription(String),

    /// Request body could not be used (empty, not JSON)
    BadRequest(String),

    /// Unknown route
    NotFound,

    /// Configuration file or environment variable problems
    Config(String),

    /// Anything that is not the caller's fault and fits nowhere else
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::EngineUnavailable { engine, hint } => write!(
                f,
                "model load failed: {} not installed. Install with: {}",
                engine, hint
            ),
            AppError::InvalidInput(msg) => write!(f, "transcribe failed: {}", msg),
            AppError::ModelLoad(msg) => write!(f, "model load failed: {}", msg),
            AppError::Transcription(msg) => write!(f, "transcribe failed: {}", msg),
            AppError::BadRequest(msg) => write!(f, "{}", msg),
            AppError::NotFound => write!(f, "not found"),
            AppError::Config(msg) => write!(f, "configuration error: {}", msg),
            AppError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Converts errors into `{"error": "..."}` bodies.
///
/// ## HTTP Status Code Mapping:
/// - BadRequest → 400
/// - NotFound → 404
/// - everything else → 500 (load and transcription failures included, so
///   callers only need to look at the body)
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

/// JSON decoding failures are always the client's fault.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("invalid json: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_prefixes() {
        let err = AppError::ModelLoad("bad model name".to_string());
        assert_eq!(err.to_string(), "model load failed: bad model name");

        let err = AppError::InvalidInput("missing audio_base64".to_string());
        assert_eq!(err.to_string(), "transcribe failed: missing audio_base64");

        let err = AppError::EngineUnavailable {
            engine: "faster-whisper",
            hint: "pip install -U whisper-ctranslate2",
        };
        assert!(err.to_string().contains("faster-whisper not installed"));
        assert!(err.to_string().contains("pip install -U whisper-ctranslate2"));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::BadRequest("empty body".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Transcription("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AppError::InvalidInput("missing audio_base64".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_json_error_is_bad_request() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let err: AppError = parse_err.into();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert!(err.to_string().starts_with("invalid json:"));
    }
}
