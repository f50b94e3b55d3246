//! # Transcription Pipeline
//!
//! The one component both transports talk to. It validates payloads,
//! fills in defaults, resolves the model through the cache and runs the
//! engine inside the cache's exclusive section.
//!
//! ## Transcribe steps:
//! 1. Decode `audio_base64` (fails fast, before any cache access)
//! 2. Build the [`ModelConfig`] (engine, model, resolved device, compute, language)
//! 3. Enter the exclusive section and get or load the model
//! 4. Stage the audio in a temp file
//! 5. Run the engine and normalize its output
//! 6. Retry once without the language hint if nothing was recognized
//! 7. Record the timing and return

use crate::audio;
use crate::cache::ModelCache;
use crate::config::RequestDefaults;
use crate::engine::{
    AudioInput, EngineKind, EngineSet, LoadedModel, ModelConfig, TranscribeOptions,
    TranscriptionResult,
};
use crate::error::AppError;
use crate::status::{ProcessStatus, StatusStore};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Body of a transcription request. Every field except the audio has a
/// configured default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TranscribePayload {
    pub audio_base64: Option<String>,
    pub engine: Option<String>,
    pub model: Option<String>,
    pub language: Option<String>,
    pub compute_type: Option<String>,
    #[serde(deserialize_with = "lenient_batch_size")]
    pub batch_size: Option<usize>,
    pub initial_prompt: Option<String>,
    pub device: Option<String>,
    pub extension: Option<String>,
}

/// Accepts `4` or `"4"`. Zero, an empty string and `null` mean the default.
fn lenient_batch_size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<usize>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Count {
        Number(usize),
        Text(String),
    }

    let size = match Option::<Count>::deserialize(deserializer)? {
        None => return Ok(None),
        Some(Count::Number(size)) => size,
        Some(Count::Text(text)) if text.trim().is_empty() => return Ok(None),
        Some(Count::Text(text)) => text
            .trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("batch_size is not a count: {:?}", text)))?,
    };
    Ok((size > 0).then_some(size))
}

/// Body of a warmup request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WarmupPayload {
    pub engine: Option<String>,
    pub model: Option<String>,
    pub language: Option<String>,
    pub compute_type: Option<String>,
    pub device: Option<String>,
}

pub struct TranscriptionService {
    cache: ModelCache,
    defaults: RequestDefaults,
}

impl TranscriptionService {
    pub fn new(engines: EngineSet, defaults: RequestDefaults) -> Self {
        Self {
            cache: ModelCache::new(engines, Arc::new(StatusStore::new())),
            defaults,
        }
    }

    pub fn status(&self) -> ProcessStatus {
        self.cache.status().snapshot()
    }

    /// Load a model ahead of the first transcription.
    pub fn warmup(&self, payload: WarmupPayload) -> Result<(), AppError> {
        let config = self.model_config(
            payload.engine,
            payload.model,
            payload.device,
            payload.compute_type,
            payload.language,
        )?;
        self.cache.get_or_load(&config)?;
        Ok(())
    }

    pub fn transcribe(&self, payload: TranscribePayload) -> Result<TranscriptionResult, AppError> {
        let encoded = payload
            .audio_base64
            .as_deref()
            .filter(|audio| !audio.is_empty())
            .ok_or_else(|| AppError::InvalidInput("missing audio_base64".to_string()))?;
        let bytes = audio::decode_base64(encoded)
            .map_err(|e| AppError::InvalidInput(format!("invalid base64: {}", e)))?;

        let config = self.model_config(
            payload.engine,
            payload.model,
            payload.device,
            payload.compute_type,
            payload.language.clone(),
        )?;
        let options = TranscribeOptions::new(
            payload.language,
            payload.initial_prompt,
            payload.batch_size.unwrap_or(self.defaults.batch_size),
        );
        let extension = payload
            .extension
            .unwrap_or_else(|| self.defaults.extension.clone());

        let mut section = self.cache.lock();
        let model = section.get_or_load(&config)?;

        info!(
            "transcribe start engine={} model={} device={} lang={:?} compute={} bytes={}",
            config.engine,
            config.model_name,
            config.device,
            options.language,
            config.compute_type,
            bytes.len()
        );
        let started = Instant::now();

        match run_model(model.as_ref(), &bytes, &extension, &options) {
            Ok(result) => {
                let elapsed = started.elapsed();
                section.status().record_transcribe(elapsed);
                info!(
                    "transcribe done ms={} segments={} text_len={}",
                    elapsed.as_millis(),
                    result.segment_count,
                    result.text.len()
                );
                Ok(result)
            }
            Err(e) => {
                error!("transcribe error: {}", e);
                section.status().record_error(e.to_string());
                Err(e)
            }
        }
    }

    fn model_config(
        &self,
        engine: Option<String>,
        model: Option<String>,
        device: Option<String>,
        compute_type: Option<String>,
        language: Option<String>,
    ) -> Result<ModelConfig, AppError> {
        let engine: EngineKind = engine
            .as_deref()
            .unwrap_or(&self.defaults.engine)
            .parse()
            .map_err(AppError::InvalidInput)?;

        Ok(ModelConfig::new(
            engine,
            model.unwrap_or_else(|| self.defaults.model.clone()),
            device.as_deref().unwrap_or(&self.defaults.device),
            compute_type.unwrap_or_else(|| self.defaults.compute_type.clone()),
            language,
        ))
    }
}

/// Steps 4 to 6; runs with the exclusive section held.
fn run_model(
    model: &dyn LoadedModel,
    bytes: &[u8],
    extension: &str,
    options: &TranscribeOptions,
) -> Result<TranscriptionResult, AppError> {
    let staged = audio::stage_audio(bytes, extension)
        .map_err(|e| AppError::Transcription(format!("staging audio: {}", e)))?;
    let input = AudioInput::new(staged.path());

    let mut transcript = model.transcribe(&input, options)?.normalize();

    if transcript.text.is_empty() && options.language.is_some() && model.engine() != EngineKind::Faster {
        debug!("No text with language {:?}, retrying without it", options.language);
        match model.transcribe(&input, &options.without_language()) {
            Ok(retry) => transcript = retry.normalize(),
            Err(e) => debug!("Retry without language failed: {}", e),
        }
    }

    Ok(transcript.into_result())
}
