//! Adapter for the aligned engine (whisperx).
//!
//! Differences from the other two engines:
//! - language is bound when the model is loaded, which is why it is part
//!   of the cache key
//! - transcribe consumes a decoded 16 kHz mono buffer, not a path
//! - the prompt parameter name varies between runtime versions, so the
//!   accepted names are probed once at load time

use super::generic::GenericOutput;
use super::{
    load_failure, transcribe_failure, AudioInput, EngineAdapter, EngineKind, LoadedModel,
    ModelConfig, TranscribeOptions, Transcript,
};
use crate::error::AppError;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Keyword arguments of the aligned transcribe call. At most one of the two
/// prompt fields is ever set.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedParams {
    pub batch_size: usize,
    pub language: Option<String>,
    pub initial_prompt: Option<String>,
    pub prompt: Option<String>,
}

pub trait AlignedRuntime: Send + Sync {
    fn load_model(
        &self,
        name: &str,
        device: &str,
        compute_type: &str,
        language: Option<&str>,
    ) -> anyhow::Result<Box<dyn AlignedModel>>;

    /// Decode a media file into 16 kHz mono samples.
    fn load_audio(&self, path: &Path) -> anyhow::Result<Vec<f32>>;
}

pub trait AlignedModel: Send + Sync {
    /// Names of the keyword parameters `transcribe` accepts.
    fn transcribe_parameters(&self) -> &'static [&'static str];

    fn transcribe(&self, audio: &[f32], params: &AlignedParams) -> anyhow::Result<GenericOutput>;
}

/// How a prompt reaches the model, decided once per load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptRoute {
    InitialPrompt,
    Prompt,
    Unsupported,
}

impl PromptRoute {
    pub fn probe(parameters: &[&str]) -> Self {
        if parameters.contains(&"initial_prompt") {
            PromptRoute::InitialPrompt
        } else if parameters.contains(&"prompt") {
            PromptRoute::Prompt
        } else {
            PromptRoute::Unsupported
        }
    }
}

pub struct AlignedAdapter {
    runtime: Arc<dyn AlignedRuntime>,
}

impl AlignedAdapter {
    pub fn new(runtime: Arc<dyn AlignedRuntime>) -> Self {
        Self { runtime }
    }
}

impl EngineAdapter for AlignedAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::Aligned
    }

    fn load(&self, config: &ModelConfig) -> Result<Arc<dyn LoadedModel>, AppError> {
        let model = self
            .runtime
            .load_model(
                &config.model_name,
                &config.device,
                &config.compute_type,
                config.language.as_deref(),
            )
            .map_err(|e| load_failure(self.kind(), e))?;

        let prompt_route = PromptRoute::probe(model.transcribe_parameters());
        info!("whisperx prompt route: {:?}", prompt_route);

        Ok(Arc::new(AlignedLoaded {
            runtime: self.runtime.clone(),
            model,
            prompt_route,
        }))
    }
}

struct AlignedLoaded {
    runtime: Arc<dyn AlignedRuntime>,
    model: Box<dyn AlignedModel>,
    prompt_route: PromptRoute,
}

impl AlignedLoaded {
    fn params(&self, options: &TranscribeOptions) -> AlignedParams {
        let mut params = AlignedParams {
            batch_size: options.batch_size,
            language: options.language.clone(),
            initial_prompt: None,
            prompt: None,
        };
        match self.prompt_route {
            PromptRoute::InitialPrompt => params.initial_prompt = options.initial_prompt.clone(),
            PromptRoute::Prompt => params.prompt = options.initial_prompt.clone(),
            PromptRoute::Unsupported => {
                if options.initial_prompt.is_some() {
                    debug!("whisperx build takes no prompt, dropping it");
                }
            }
        }
        params
    }
}

impl LoadedModel for AlignedLoaded {
    fn engine(&self) -> EngineKind {
        EngineKind::Aligned
    }

    fn transcribe(&self, audio: &AudioInput, options: &TranscribeOptions) -> Result<Transcript, AppError> {
        let samples = audio
            .samples_with(|path| self.runtime.load_audio(path))
            .map_err(transcribe_failure)?;

        let params = self.params(options);
        debug!(
            "whisperx transcribe: {} samples, batch_size={}, language={:?}",
            samples.len(),
            params.batch_size,
            params.language
        );

        let output = self
            .model
            .transcribe(samples, &params)
            .map_err(transcribe_failure)?;
        Ok(output.into_transcript())
    }
}

/// Stand-in used when the crate is built without the in-process engine.
#[cfg(not(feature = "candle"))]
pub struct MissingRuntime;

#[cfg(not(feature = "candle"))]
impl AlignedRuntime for MissingRuntime {
    fn load_model(
        &self,
        _name: &str,
        _device: &str,
        _compute_type: &str,
        _language: Option<&str>,
    ) -> anyhow::Result<Box<dyn AlignedModel>> {
        Err(super::EngineNotInstalled("whisperx".to_string()).into())
    }

    fn load_audio(&self, _path: &Path) -> anyhow::Result<Vec<f32>> {
        Err(super::EngineNotInstalled("whisperx".to_string()).into())
    }
}
