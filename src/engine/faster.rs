//! Adapter for the faster engine (faster-whisper).
//!
//! Load takes `(model_name, device, compute_type)`. Transcribe returns a
//! lazy segment stream; the adapter drains it fully and builds the text by
//! joining the trimmed segment texts. No language retry applies to this
//! engine.

use super::{
    join_segment_texts, load_failure, transcribe_failure, AudioInput, EngineAdapter, EngineKind,
    LoadedModel, ModelConfig, Segment, TranscribeOptions, Transcript,
};
use crate::error::AppError;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct FasterArgs {
    pub language: Option<String>,
    pub initial_prompt: Option<String>,
}

/// Segments are produced on demand; an item error aborts the transcription.
pub type SegmentIter<'a> = Box<dyn Iterator<Item = anyhow::Result<Segment>> + 'a>;

pub trait FasterRuntime: Send + Sync {
    fn whisper_model(
        &self,
        name: &str,
        device: &str,
        compute_type: &str,
    ) -> anyhow::Result<Box<dyn FasterModel>>;
}

pub trait FasterModel: Send + Sync {
    fn transcribe<'a>(&'a self, path: &Path, args: &FasterArgs) -> anyhow::Result<SegmentIter<'a>>;
}

pub struct FasterAdapter {
    runtime: Arc<dyn FasterRuntime>,
}

impl FasterAdapter {
    pub fn new(runtime: Arc<dyn FasterRuntime>) -> Self {
        Self { runtime }
    }
}

impl EngineAdapter for FasterAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::Faster
    }

    fn load(&self, config: &ModelConfig) -> Result<Arc<dyn LoadedModel>, AppError> {
        let model = self
            .runtime
            .whisper_model(&config.model_name, &config.device, &config.compute_type)
            .map_err(|e| load_failure(self.kind(), e))?;
        Ok(Arc::new(FasterLoaded { model }))
    }
}

struct FasterLoaded {
    model: Box<dyn FasterModel>,
}

impl LoadedModel for FasterLoaded {
    fn engine(&self) -> EngineKind {
        EngineKind::Faster
    }

    fn transcribe(&self, audio: &AudioInput, options: &TranscribeOptions) -> Result<Transcript, AppError> {
        let args = FasterArgs {
            language: options.language.clone(),
            initial_prompt: options.initial_prompt.clone(),
        };
        debug!("faster-whisper transcribe: {:?}", args);

        let segments = self
            .model
            .transcribe(audio.path(), &args)
            .and_then(|stream| stream.collect::<anyhow::Result<Vec<_>>>())
            .map_err(transcribe_failure)?;

        Ok(Transcript {
            text: join_segment_texts(&segments),
            segments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{segment, StubFaster};

    fn config() -> ModelConfig {
        ModelConfig::new(EngineKind::Faster, "small", "cpu", "int8", None)
    }

    #[test]
    fn test_stream_is_materialized_and_joined() {
        let runtime = Arc::new(StubFaster::streaming(vec![
            segment(0.0, 1.2, " Hello "),
            segment(1.2, 2.0, "world. "),
        ]));
        let model = FasterAdapter::new(runtime.clone()).load(&config()).unwrap();

        let options = TranscribeOptions::new(Some("en".into()), Some("context".into()), 4);
        let transcript = model.transcribe(&AudioInput::new("/tmp/a.webm"), &options).unwrap();

        assert_eq!(transcript.text, "Hello world.");
        assert_eq!(transcript.segments.len(), 2);
        assert_eq!(runtime.compute_types(), vec!["int8".to_string()]);
        assert_eq!(runtime.calls()[0].initial_prompt.as_deref(), Some("context"));
    }

    #[test]
    fn test_empty_stream_is_empty_text() {
        let runtime = Arc::new(StubFaster::streaming(Vec::new()));
        let model = FasterAdapter::new(runtime).load(&config()).unwrap();
        let transcript = model
            .transcribe(&AudioInput::new("/tmp/a.webm"), &TranscribeOptions::new(None, None, 4))
            .unwrap();
        assert_eq!(transcript, Transcript::default());
    }

    #[test]
    fn test_stream_error_fails_transcription() {
        let runtime = Arc::new(StubFaster::failing_mid_stream(segment(0.0, 1.0, "partial")));
        let model = FasterAdapter::new(runtime).load(&config()).unwrap();
        let err = model
            .transcribe(&AudioInput::new("/tmp/a.webm"), &TranscribeOptions::new(None, None, 4))
            .err()
            .unwrap();
        assert!(matches!(err, AppError::Transcription(_)));
    }

    #[test]
    fn test_missing_runtime_is_unavailable() {
        let err = FasterAdapter::new(Arc::new(StubFaster::not_installed()))
            .load(&config())
            .err()
            .unwrap();
        assert!(err.to_string().contains("pip install -U whisper-ctranslate2"));
    }
}
