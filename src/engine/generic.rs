//! Adapter for the generic engine (openai-whisper).
//!
//! Load takes `(model_name, device)`; transcribe takes a file path plus
//! `language`, `initial_prompt` and `fp16`, and returns a dict whose `text`
//! and `segments` keys may both be missing.

use super::{
    load_failure, transcribe_failure, AudioInput, EngineAdapter, EngineKind, LoadedModel,
    ModelConfig, Segment, TranscribeOptions, Transcript,
};
use crate::error::AppError;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Keyword arguments of the generic transcribe call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenericArgs {
    pub language: Option<String>,
    pub initial_prompt: Option<String>,
    pub fp16: bool,
}

/// Result dict of the generic and aligned engines.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GenericOutput {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub segments: Option<Vec<Segment>>,
}

impl GenericOutput {
    pub fn into_transcript(self) -> Transcript {
        Transcript {
            text: self.text.unwrap_or_default(),
            segments: self.segments.unwrap_or_default(),
        }
    }
}

pub trait GenericRuntime: Send + Sync {
    fn load_model(&self, name: &str, device: &str) -> anyhow::Result<Box<dyn GenericModel>>;
}

pub trait GenericModel: Send + Sync {
    fn transcribe(&self, path: &Path, args: &GenericArgs) -> anyhow::Result<GenericOutput>;
}

pub struct GenericAdapter {
    runtime: Arc<dyn GenericRuntime>,
}

impl GenericAdapter {
    pub fn new(runtime: Arc<dyn GenericRuntime>) -> Self {
        Self { runtime }
    }
}

impl EngineAdapter for GenericAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::Generic
    }

    fn load(&self, config: &ModelConfig) -> Result<Arc<dyn LoadedModel>, AppError> {
        let model = self
            .runtime
            .load_model(&config.model_name, &config.device)
            .map_err(|e| load_failure(self.kind(), e))?;

        Ok(Arc::new(GenericLoaded {
            model,
            // Half precision on anything but the CPU
            fp16: config.device != crate::device::CPU,
        }))
    }
}

struct GenericLoaded {
    model: Box<dyn GenericModel>,
    fp16: bool,
}

impl LoadedModel for GenericLoaded {
    fn engine(&self) -> EngineKind {
        EngineKind::Generic
    }

    fn transcribe(&self, audio: &AudioInput, options: &TranscribeOptions) -> Result<Transcript, AppError> {
        let args = GenericArgs {
            language: options.language.clone(),
            initial_prompt: options.initial_prompt.clone(),
            fp16: self.fp16,
        };
        debug!("whisper transcribe: {:?}", args);

        let output = self
            .model
            .transcribe(audio.path(), &args)
            .map_err(transcribe_failure)?;
        Ok(output.into_transcript())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubGeneric;

    fn config(device: &str) -> ModelConfig {
        ModelConfig::new(EngineKind::Generic, "base", device, "int8", Some("en".into()))
    }

    #[test]
    fn test_fp16_off_only_on_cpu() {
        let runtime = Arc::new(StubGeneric::replying(GenericOutput {
            text: Some("hi".into()),
            segments: None,
        }));
        let adapter = GenericAdapter::new(runtime.clone());

        let model = adapter.load(&config("cuda")).unwrap();
        let options = TranscribeOptions::new(Some("en".into()), Some("names".into()), 4);
        model.transcribe(&AudioInput::new("/tmp/a.wav"), &options).unwrap();

        let model = adapter.load(&config("cpu")).unwrap();
        model.transcribe(&AudioInput::new("/tmp/a.wav"), &options).unwrap();

        let calls = runtime.calls();
        assert!(calls[0].fp16);
        assert!(!calls[1].fp16);
        assert_eq!(calls[0].language.as_deref(), Some("en"));
        assert_eq!(calls[0].initial_prompt.as_deref(), Some("names"));
    }

    #[test]
    fn test_missing_keys_become_empty() {
        let output: GenericOutput = serde_json::from_str("{}").unwrap();
        let transcript = output.into_transcript();
        assert_eq!(transcript.text, "");
        assert!(transcript.segments.is_empty());
    }

    #[test]
    fn test_unset_options_are_not_passed() {
        let runtime = Arc::new(StubGeneric::replying(GenericOutput::default()));
        let adapter = GenericAdapter::new(runtime.clone());
        let model = adapter.load(&config("cpu")).unwrap();

        let options = TranscribeOptions::new(None, None, 4);
        let transcript = model.transcribe(&AudioInput::new("/tmp/a.wav"), &options).unwrap();
        assert_eq!(transcript, Transcript::default());

        let calls = runtime.calls();
        assert_eq!(calls[0].language, None);
        assert_eq!(calls[0].initial_prompt, None);
    }

    #[test]
    fn test_missing_runtime_is_unavailable() {
        let adapter = GenericAdapter::new(Arc::new(StubGeneric::not_installed()));
        let err = adapter.load(&config("cpu")).err().unwrap();
        assert!(matches!(err, AppError::EngineUnavailable { engine: "whisper", .. }));
        assert!(err.to_string().contains("pip install -U openai-whisper"));
    }
}
