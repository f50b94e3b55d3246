//! # In-process Whisper (aligned engine)
//!
//! Runs Whisper with Candle-rs, downloading weights from HuggingFace on
//! first use. This is the runtime behind the `whisperx` engine: language is
//! bound at load time, audio arrives as a decoded 16 kHz buffer and 30 s
//! windows are encoded `batch_size` at a time.
//!
//! ## Model Loading Process:
//! 1. Resolve the HuggingFace repo (`small` → `openai/whisper-small`)
//! 2. Download `config.json`, `tokenizer.json`, `model.safetensors` (cached)
//! 3. Compute the Slaney mel filter bank for the model's mel bin count
//! 4. Memory-map the weights onto the requested device
//!
//! ## Decoding:
//! Greedy, one segment per window, no timestamps. When no language is
//! bound or requested it is detected per window from the language-token
//! logits.

use super::aligned::{AlignedModel, AlignedParams, AlignedRuntime};
use super::generic::GenericOutput;
use super::Segment;
use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

/// Language codes in Whisper token order.
const LANGUAGES: [&str; 99] = [
    "en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt", "tr", "pl", "ca", "nl", "ar", "sv",
    "it", "id", "hi", "fi", "vi", "he", "uk", "el", "ms", "cs", "ro", "da", "hu", "ta", "no",
    "th", "ur", "hr", "bg", "lt", "la", "mi", "ml", "cy", "sk", "te", "fa", "lv", "bn", "sr",
    "az", "sl", "kn", "et", "mk", "br", "eu", "is", "hy", "ne", "mn", "bs", "kk", "sq", "sw",
    "gl", "mr", "pa", "si", "km", "sn", "yo", "so", "af", "oc", "ka", "be", "tg", "sd", "gu",
    "am", "yi", "lo", "uz", "fo", "ht", "ps", "tk", "nn", "mt", "sa", "lb", "my", "bo", "tl",
    "mg", "as", "tt", "haw", "ln", "ha", "ba", "jw", "su",
];

const START_OF_PREV: &str = "<|startofprev|>";

/// Loads Whisper checkpoints with Candle.
pub struct CandleWhisperRuntime {
    ffmpeg_program: String,
}

impl CandleWhisperRuntime {
    pub fn new(ffmpeg_program: &str) -> Self {
        Self {
            ffmpeg_program: ffmpeg_program.to_string(),
        }
    }
}

impl AlignedRuntime for CandleWhisperRuntime {
    fn load_model(
        &self,
        name: &str,
        device: &str,
        compute_type: &str,
        language: Option<&str>,
    ) -> Result<Box<dyn AlignedModel>> {
        let device = select_device(device)?;
        let dtype = select_dtype(&device, compute_type);
        let model = CandleWhisper::load(name, device, dtype, language)?;
        Ok(Box::new(model))
    }

    fn load_audio(&self, path: &Path) -> Result<Vec<f32>> {
        crate::audio::load_audio(&self.ffmpeg_program, path)
    }
}

/// Map a resolved device string onto a Candle device.
fn select_device(name: &str) -> Result<Device> {
    match name {
        "cpu" => Ok(Device::Cpu),
        "mps" | "metal" => Ok(Device::new_metal(0)?),
        cuda if cuda == "cuda" || cuda.starts_with("cuda:") => {
            if !candle_core::utils::cuda_is_available() {
                warn!("Built without CUDA support, loading on cpu instead of {}", cuda);
                return Ok(Device::Cpu);
            }
            let ordinal = match cuda.strip_prefix("cuda:") {
                Some(n) => n
                    .parse::<usize>()
                    .with_context(|| format!("invalid cuda ordinal in '{}'", cuda))?,
                None => 0,
            };
            Ok(Device::new_cuda(ordinal)?)
        }
        other => Err(anyhow!("unsupported device: {}", other)),
    }
}

/// Half precision only makes sense on an accelerator; int8 is not a Candle
/// dtype and runs at full precision.
fn select_dtype(device: &Device, compute_type: &str) -> DType {
    if device.is_cpu() {
        return m::DTYPE;
    }
    match compute_type {
        "float16" | "int8_float16" => DType::F16,
        "bfloat16" | "int8_bfloat16" => DType::BF16,
        _ => m::DTYPE,
    }
}

fn repo_name(model_name: &str) -> String {
    if model_name.contains('/') {
        model_name.to_string()
    } else {
        format!("openai/whisper-{}", model_name)
    }
}

/// Fetch the three checkpoint files through the local HuggingFace cache.
fn fetch_checkpoint(repo: &str) -> Result<(PathBuf, PathBuf, PathBuf)> {
    use hf_hub::api::sync::ApiBuilder;

    let mut builder = ApiBuilder::new().with_progress(false);
    if let Ok(token) = std::env::var("HF_TOKEN") {
        debug!("Using HF token (length: {})", token.len());
        builder = builder.with_token(Some(token));
    }
    if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
        debug!("Using cache dir: {}", cache_dir);
        builder = builder.with_cache_dir(cache_dir.into());
    }
    let api = builder.build().context("HuggingFace client")?;
    let repo_handle = api.model(repo.to_string());

    let config = repo_handle
        .get("config.json")
        .with_context(|| format!("Failed to download config.json from {}", repo))?;
    let tokenizer = repo_handle
        .get("tokenizer.json")
        .with_context(|| format!("Failed to download tokenizer.json from {}", repo))?;
    let weights = repo_handle
        .get("model.safetensors")
        .with_context(|| format!("Failed to download model.safetensors from {}", repo))?;
    Ok((config, tokenizer, weights))
}

/// Special token ids resolved from the tokenizer.
struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    no_timestamps: u32,
    start_of_prev: Option<u32>,
    /// `(code, token)` for every language the tokenizer knows
    languages: Vec<(&'static str, u32)>,
}

impl SpecialTokens {
    fn resolve(tokenizer: &Tokenizer) -> Result<Self> {
        let id = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| anyhow!("token {} missing from tokenizer", token))
        };
        let languages = LANGUAGES
            .iter()
            .filter_map(|code| tokenizer.token_to_id(&format!("<|{}|>", code)).map(|t| (*code, t)))
            .collect();

        Ok(Self {
            sot: id(m::SOT_TOKEN)?,
            eot: id(m::EOT_TOKEN)?,
            transcribe: id(m::TRANSCRIBE_TOKEN)?,
            no_timestamps: id(m::NO_TIMESTAMPS_TOKEN)?,
            start_of_prev: tokenizer.token_to_id(START_OF_PREV),
            languages,
        })
    }

    fn language(&self, code: &str) -> Option<u32> {
        self.languages.iter().find(|(c, _)| *c == code).map(|(_, t)| *t)
    }
}

/// A loaded checkpoint.
///
/// Candle's forward passes take `&mut self` (they own the attention
/// caches), so the network sits behind a mutex. Callers already serialize
/// inference; the lock is never contended.
struct CandleWhisper {
    model: Mutex<m::model::Whisper>,
    config: Config,
    tokenizer: Tokenizer,
    tokens: SpecialTokens,
    mel_filters: Vec<f32>,
    suppress_mask: Vec<f32>,
    device: Device,
    dtype: DType,
    language: Option<String>,
}

impl CandleWhisper {
    fn load(name: &str, device: Device, dtype: DType, language: Option<&str>) -> Result<Self> {
        let repo = repo_name(name);
        info!("Loading Whisper checkpoint {} ({:?})...", repo, dtype);
        let start_time = std::time::Instant::now();

        let (config_file, tokenizer_file, weights_file) = fetch_checkpoint(&repo)?;

        let config: Config = serde_json::from_reader(std::fs::File::open(config_file)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        let tokens = SpecialTokens::resolve(&tokenizer)?;

        if let Some(code) = language {
            if tokens.language(code).is_none() {
                return Err(anyhow!("language '{}' not supported by {}", code, repo));
            }
        }

        let mel_filters = mel_filter_bank(config.num_mel_bins, m::N_FFT, m::SAMPLE_RATE);
        let suppress_mask = suppress_mask(&config, &tokens);

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_file], dtype, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        info!(
            "Whisper checkpoint {} loaded in {:.2}s",
            repo,
            start_time.elapsed().as_secs_f64()
        );

        Ok(Self {
            model: Mutex::new(model),
            config,
            tokenizer,
            tokens,
            mel_filters,
            suppress_mask,
            device,
            dtype,
            language: language.map(str::to_string),
        })
    }

    /// Log-mel input for one window, shape `(1, n_mels, N_FRAMES)`.
    fn window_mel(&self, window: &[f32]) -> Result<Tensor> {
        let mut padded = vec![0.0f32; m::N_SAMPLES];
        padded[..window.len()].copy_from_slice(window);

        let mel = m::audio::pcm_to_mel(&self.config, &padded, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, frames), &self.device)?;
        Ok(mel.narrow(2, 0, m::N_FRAMES)?.to_dtype(self.dtype)?)
    }

    fn prompt_tokens(&self, prompt: Option<&str>) -> Result<Vec<u32>> {
        let (Some(prompt), Some(start_of_prev)) = (prompt, self.tokens.start_of_prev) else {
            return Ok(Vec::new());
        };
        let encoding = self
            .tokenizer
            .encode(format!(" {}", prompt.trim()), false)
            .map_err(|e| anyhow!("Tokenizer encode error: {}", e))?;

        // Keep the tail; the prompt may use at most half the text context
        let max_len = self.config.max_target_positions / 2 - 1;
        let ids = encoding.get_ids();
        let tail = &ids[ids.len().saturating_sub(max_len)..];

        let mut tokens = Vec::with_capacity(tail.len() + 1);
        tokens.push(start_of_prev);
        tokens.extend_from_slice(tail);
        Ok(tokens)
    }

    fn detect_language(&self, model: &mut m::model::Whisper, features: &Tensor) -> Result<u32> {
        let sot = Tensor::new(&[[self.tokens.sot]], &self.device)?;
        let ys = model.decoder.forward(&sot, features, true)?;
        let logits = model.decoder.final_linear(&ys.i((..1, 0..1))?)?.i(0)?.i(0)?;
        let logits = logits.to_dtype(DType::F32)?.to_vec1::<f32>()?;

        self.tokens
            .languages
            .iter()
            .map(|(_, token)| *token)
            .max_by(|a, b| logits[*a as usize].total_cmp(&logits[*b as usize]))
            .ok_or_else(|| anyhow!("tokenizer has no language tokens"))
    }

    /// Greedy decode of one encoded window.
    fn decode(
        &self,
        model: &mut m::model::Whisper,
        features: &Tensor,
        language: Option<u32>,
        prompt: &[u32],
    ) -> Result<String> {
        let language = match language {
            Some(token) => token,
            None => self.detect_language(model, features)?,
        };

        let mut tokens = prompt.to_vec();
        tokens.extend_from_slice(&[
            self.tokens.sot,
            language,
            self.tokens.transcribe,
            self.tokens.no_timestamps,
        ]);

        let mask = Tensor::new(self.suppress_mask.as_slice(), &self.device)?;
        let sample_len = self.config.max_target_positions / 2;
        let mut output = Vec::new();

        for step in 0..sample_len {
            if tokens.len() >= self.config.max_target_positions {
                break;
            }
            let input = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = model.decoder.forward(&input, features, step == 0)?;

            let (_, seq_len, _) = ys.dims3()?;
            let logits = model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?
                .to_dtype(DType::F32)?;
            let logits = logits.broadcast_add(&mask)?;
            let next = logits.argmax(D::Minus1)?.to_scalar::<u32>()?;

            if next == self.tokens.eot {
                break;
            }
            if is_repetitive(&output, next) {
                debug!("Stopping decode on repetition after {} tokens", output.len());
                break;
            }
            tokens.push(next);
            output.push(next);
        }

        let text = self
            .tokenizer
            .decode(&output, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;
        Ok(text.trim().to_string())
    }
}

impl AlignedModel for CandleWhisper {
    fn transcribe_parameters(&self) -> &'static [&'static str] {
        &["batch_size", "language", "initial_prompt"]
    }

    fn transcribe(&self, audio: &[f32], params: &AlignedParams) -> Result<GenericOutput> {
        let start_time = std::time::Instant::now();

        let language = match params.language.as_deref().or(self.language.as_deref()) {
            Some(code) => Some(
                self.tokens
                    .language(code)
                    .ok_or_else(|| anyhow!("unsupported language: {}", code))?,
            ),
            None => None,
        };
        let prompt = self.prompt_tokens(
            params
                .initial_prompt
                .as_deref()
                .or(params.prompt.as_deref()),
        )?;

        let windows = split_windows(audio.len(), m::N_SAMPLES);
        let batch_size = params.batch_size.max(1);
        let mut model = self.model.lock().unwrap_or_else(PoisonError::into_inner);
        let mut segments = Vec::new();

        for batch in windows.chunks(batch_size) {
            let mels = batch
                .iter()
                .map(|range| self.window_mel(&audio[range.clone()]))
                .collect::<Result<Vec<_>>>()?;
            let features = model.encoder.forward(&Tensor::cat(&mels, 0)?, true)?;

            for (offset, range) in batch.iter().enumerate() {
                let window_features = features.narrow(0, offset, 1)?;
                let text = self.decode(&mut model, &window_features, language, &prompt)?;
                if text.is_empty() {
                    continue;
                }
                segments.push(Segment {
                    start: range.start as f64 / m::SAMPLE_RATE as f64,
                    end: range.end as f64 / m::SAMPLE_RATE as f64,
                    text,
                });
            }
        }

        debug!(
            "Transcribed {:.2}s of audio in {} window(s) in {:.2}s",
            audio.len() as f64 / m::SAMPLE_RATE as f64,
            windows.len(),
            start_time.elapsed().as_secs_f64()
        );

        Ok(GenericOutput {
            text: None,
            segments: Some(segments),
        })
    }
}

/// Consecutive sample ranges of at most `window` samples covering `len`.
fn split_windows(len: usize, window: usize) -> Vec<std::ops::Range<usize>> {
    (0..len)
        .step_by(window)
        .map(|start| start..(start + window).min(len))
        .collect()
}

/// Whether appending `new_token` would continue a degenerate loop.
fn is_repetitive(tokens: &[u32], new_token: u32) -> bool {
    if tokens.len() < 6 {
        return false;
    }

    if tokens[tokens.len() - 3..] == [new_token, new_token, new_token] {
        return true;
    }

    let last_3 = &tokens[tokens.len() - 3..];
    let prev_3 = &tokens[tokens.len() - 6..tokens.len() - 3];
    last_3 == prev_3
}

/// Additive logit mask: `-inf` for tokens greedy decoding must never emit.
///
/// Everything after `<|endoftext|>` is a control or timestamp token.
fn suppress_mask(config: &Config, tokens: &SpecialTokens) -> Vec<f32> {
    (0..config.vocab_size as u32)
        .map(|token| {
            if token > tokens.eot || config.suppress_tokens.contains(&token) {
                f32::NEG_INFINITY
            } else {
                0.0
            }
        })
        .collect()
}

fn hz_to_mel(hz: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let logstep = 6.4f64.ln() / 27.0;
    if hz >= MIN_LOG_HZ {
        min_log_mel + (hz / MIN_LOG_HZ).ln() / logstep
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let logstep = 6.4f64.ln() / 27.0;
    if mel >= min_log_mel {
        MIN_LOG_HZ * (logstep * (mel - min_log_mel)).exp()
    } else {
        mel * F_SP
    }
}

/// Slaney-normalized triangular filters, row-major `(n_mels, n_fft / 2 + 1)`.
fn mel_filter_bank(n_mels: usize, n_fft: usize, sample_rate: usize) -> Vec<f32> {
    let n_bins = n_fft / 2 + 1;
    let fft_freqs: Vec<f64> = (0..n_bins)
        .map(|k| k as f64 * sample_rate as f64 / n_fft as f64)
        .collect();

    let max_mel = hz_to_mel(sample_rate as f64 / 2.0);
    let hz_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(max_mel * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0.0f32; n_mels * n_bins];
    for i in 0..n_mels {
        let (lower, center, upper) = (hz_points[i], hz_points[i + 1], hz_points[i + 2]);
        let enorm = 2.0 / (upper - lower);
        for (k, freq) in fft_freqs.iter().enumerate() {
            let rising = (freq - lower) / (center - lower);
            let falling = (upper - freq) / (upper - center);
            let weight = rising.min(falling).max(0.0);
            filters[i * n_bins + k] = (weight * enorm) as f32;
        }
    }
    filters
}
