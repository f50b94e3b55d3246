//! # Engine Adapters
//!
//! Uniform invocation interface over three speech-to-text engines. Each
//! engine has its own load signature, its own transcribe signature and its
//! own result shape; the adapters hide that behind [`EngineAdapter`] and
//! [`LoadedModel`].
//!
//! ## Engines:
//! - **whisper** ([`generic`]): file path in, `{text, segments}` dict out
//! - **faster-whisper** ([`faster`]): file path in, lazy segment stream out
//! - **whisperx** ([`aligned`]): pre-decoded audio buffer in, dict out;
//!   language is bound at load time and the prompt parameter name is probed
//!
//! The engines themselves are reached through small runtime traits
//! (`GenericRuntime`, `FasterRuntime`, `AlignedRuntime`). Production
//! runtimes live in [`cli`] (subprocess engines) and [`candle_whisper`]
//! (in-process engine); tests plug in stubs.

pub mod aligned;
#[cfg(feature = "candle")]
pub mod candle_whisper;
pub mod cli;
pub mod faster;
pub mod generic;

use crate::config::EnginesConfig;
use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::cell::OnceCell;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use aligned::{AlignedAdapter, AlignedRuntime};
pub use faster::{FasterAdapter, FasterRuntime};
pub use generic::{GenericAdapter, GenericRuntime};

/// Which engine a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    /// openai-whisper
    Generic,
    /// faster-whisper
    Faster,
    /// whisperx
    Aligned,
}

impl EngineKind {
    /// Wire name used in requests and cache keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Generic => "whisper",
            EngineKind::Faster => "faster-whisper",
            EngineKind::Aligned => "whisperx",
        }
    }

    /// Actionable hint attached to EngineUnavailable errors.
    pub fn install_hint(&self) -> &'static str {
        match self {
            EngineKind::Generic => "pip install -U openai-whisper",
            EngineKind::Faster => "pip install -U whisper-ctranslate2",
            EngineKind::Aligned => "cargo build --release --features candle",
        }
    }
}

impl std::str::FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "whisper" => Ok(EngineKind::Generic),
            "faster-whisper" => Ok(EngineKind::Faster),
            "whisperx" => Ok(EngineKind::Aligned),
            other => Err(format!("unknown engine: {}", other)),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything that determines which model instance serves a request.
///
/// `device` is always the resolved device, and an empty language is stored
/// as `None`, so two configs built from equivalent requests compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelConfig {
    pub engine: EngineKind,
    pub model_name: String,
    pub device: String,
    pub compute_type: String,
    pub language: Option<String>,
}

impl ModelConfig {
    /// Build a config, resolving the requested device.
    pub fn new(
        engine: EngineKind,
        model_name: impl Into<String>,
        requested_device: &str,
        compute_type: impl Into<String>,
        language: Option<String>,
    ) -> Self {
        Self {
            engine,
            model_name: model_name.into(),
            device: crate::device::resolve_device(requested_device),
            compute_type: compute_type.into(),
            language: non_empty(language),
        }
    }

    /// Cache identity; language takes part because some engines bind it at load.
    pub fn cache_key(&self) -> CacheKey {
        CacheKey(format!(
            "{}|{}|{}|{}|{}",
            self.engine,
            self.model_name,
            self.device,
            self.compute_type,
            self.language.as_deref().unwrap_or("")
        ))
    }
}

/// `engine|model|device|compute_type|language` in that fixed order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One timed chunk of transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    #[serde(default)]
    pub text: String,
}

/// Raw engine output before normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub segments: Vec<Segment>,
}

impl Transcript {
    /// Fill in missing top-level text from the segments.
    pub fn normalize(mut self) -> Self {
        if self.text.is_empty() && !self.segments.is_empty() {
            self.text = join_segment_texts(&self.segments);
        }
        self
    }

    pub fn into_result(self) -> TranscriptionResult {
        TranscriptionResult {
            segment_count: self.segments.len(),
            text: self.text,
            segments: self.segments,
        }
    }
}

/// Response schema shared by both transports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionResult {
    pub text: String,
    pub segments: Vec<Segment>,
    #[serde(rename = "segments_len")]
    pub segment_count: usize,
}

/// Per-call options. Unset values are `None` and never reach an engine as
/// empty strings.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscribeOptions {
    pub language: Option<String>,
    pub initial_prompt: Option<String>,
    pub batch_size: usize,
}

impl TranscribeOptions {
    pub fn new(language: Option<String>, initial_prompt: Option<String>, batch_size: usize) -> Self {
        Self {
            language: non_empty(language),
            initial_prompt: non_empty(initial_prompt),
            batch_size,
        }
    }

    /// Same options with the language hint dropped (fallback retry).
    pub fn without_language(&self) -> Self {
        Self {
            language: None,
            ..self.clone()
        }
    }
}

/// Staged audio for one pipeline invocation.
///
/// Engines that want a decoded buffer decode it through
/// [`AudioInput::samples_with`]; the buffer is kept so a retry does not
/// decode the file a second time.
pub struct AudioInput {
    path: PathBuf,
    samples: OnceCell<Vec<f32>>,
}

impl AudioInput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            samples: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn samples_with<F>(&self, decode: F) -> anyhow::Result<&[f32]>
    where
        F: FnOnce(&Path) -> anyhow::Result<Vec<f32>>,
    {
        if let Some(samples) = self.samples.get() {
            return Ok(samples);
        }
        let decoded = decode(&self.path)?;
        Ok(self.samples.get_or_init(|| decoded))
    }
}

/// Marker error returned by runtimes whose engine is not installed.
///
/// Adapters look for it with `downcast_ref` to tell EngineUnavailable apart
/// from other load failures.
#[derive(Debug)]
pub struct EngineNotInstalled(pub String);

impl fmt::Display for EngineNotInstalled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} not found", self.0)
    }
}

impl std::error::Error for EngineNotInstalled {}

/// Loading side of an engine.
pub trait EngineAdapter: Send + Sync {
    fn kind(&self) -> EngineKind;

    fn load(&self, config: &ModelConfig) -> Result<Arc<dyn LoadedModel>, AppError>;
}

/// A model held by the cache. Implementations are shared by reference and
/// only ever called from inside the cache's exclusive section.
pub trait LoadedModel: Send + Sync {
    fn engine(&self) -> EngineKind;

    /// Run inference. May return an empty transcript; that is not an error.
    fn transcribe(&self, audio: &AudioInput, options: &TranscribeOptions) -> Result<Transcript, AppError>;
}

/// The three adapters, one per [`EngineKind`].
#[derive(Clone)]
pub struct EngineSet {
    generic: Arc<GenericAdapter>,
    faster: Arc<FasterAdapter>,
    aligned: Arc<AlignedAdapter>,
}

impl EngineSet {
    pub fn new(
        generic: Arc<dyn GenericRuntime>,
        faster: Arc<dyn FasterRuntime>,
        aligned: Arc<dyn AlignedRuntime>,
    ) -> Self {
        Self {
            generic: Arc::new(GenericAdapter::new(generic)),
            faster: Arc::new(FasterAdapter::new(faster)),
            aligned: Arc::new(AlignedAdapter::new(aligned)),
        }
    }

    /// Production runtimes: CLI subprocesses plus the in-process engine.
    pub fn from_config(config: &EnginesConfig) -> Self {
        Self::new(
            Arc::new(cli::WhisperCli::new(&config.whisper_program)),
            Arc::new(cli::CTranslate2Cli::new(&config.faster_program)),
            aligned_runtime(config),
        )
    }

    pub fn adapter(&self, kind: EngineKind) -> &dyn EngineAdapter {
        match kind {
            EngineKind::Generic => self.generic.as_ref(),
            EngineKind::Faster => self.faster.as_ref(),
            EngineKind::Aligned => self.aligned.as_ref(),
        }
    }
}

#[cfg(feature = "candle")]
fn aligned_runtime(config: &EnginesConfig) -> Arc<dyn AlignedRuntime> {
    Arc::new(candle_whisper::CandleWhisperRuntime::new(&config.ffmpeg_program))
}

#[cfg(not(feature = "candle"))]
fn aligned_runtime(_config: &EnginesConfig) -> Arc<dyn AlignedRuntime> {
    Arc::new(aligned::MissingRuntime)
}

/// Map a runtime load error onto the public taxonomy.
pub(crate) fn load_failure(kind: EngineKind, err: anyhow::Error) -> AppError {
    if err.downcast_ref::<EngineNotInstalled>().is_some() {
        AppError::EngineUnavailable {
            engine: kind.as_str(),
            hint: kind.install_hint(),
        }
    } else {
        AppError::ModelLoad(format!("{:#}", err))
    }
}

pub(crate) fn transcribe_failure(err: anyhow::Error) -> AppError {
    AppError::Transcription(format!("{:#}", err))
}

/// Trimmed segment texts joined by single spaces, trimmed again.
pub fn join_segment_texts(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|s| s.text.trim())
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
