//! # Audio Staging and Decoding
//!
//! Requests carry audio as base64 text. Before inference the bytes are
//! written to a uniquely named temporary file whose suffix tells the
//! engines which container to expect; the file is removed when the
//! returned handle is dropped, on every exit path.
//!
//! Engines that want raw samples get 16 kHz mono `f32` PCM from
//! [`load_audio`]: ffmpeg when it is installed, otherwise a built-in WAV
//! reader that only understands RIFF files.

use anyhow::{anyhow, Context, Result};
use base64::Engine as _;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use tempfile::NamedTempFile;
use tracing::debug;

/// Sample rate every engine expects.
pub const SAMPLE_RATE: u32 = 16000;

/// Decode standard (padded) base64.
pub fn decode_base64(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(encoded.trim())
}

/// Write `bytes` to a fresh temporary file ending in `extension`.
///
/// ## Parameters:
/// - **bytes**: raw container bytes (webm, wav, ...)
/// - **extension**: file suffix, with or without the leading dot
///
/// ## Returns:
/// The open temp file; dropping it deletes the file.
pub fn stage_audio(bytes: &[u8], extension: &str) -> std::io::Result<NamedTempFile> {
    let suffix = if extension.is_empty() || extension.starts_with('.') {
        extension.to_string()
    } else {
        format!(".{}", extension)
    };

    let mut file = tempfile::Builder::new()
        .prefix("transcribe-")
        .suffix(&suffix)
        .tempfile()?;
    file.write_all(bytes)?;
    file.flush()?;

    debug!("Staged {} bytes at {}", bytes.len(), file.path().display());
    Ok(file)
}

/// Decode any media file into 16 kHz mono samples in `[-1.0, 1.0]`.
pub fn load_audio(ffmpeg_program: &str, path: &Path) -> Result<Vec<f32>> {
    match decode_with_ffmpeg(ffmpeg_program, path) {
        Err(e) if is_not_found(&e) => {
            debug!("{} not available, reading {} as WAV", ffmpeg_program, path.display());
            read_wav(path)
        }
        other => other,
    }
}

fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .is_some_and(|e| e.kind() == std::io::ErrorKind::NotFound)
}

fn decode_with_ffmpeg(program: &str, path: &Path) -> Result<Vec<f32>> {
    let rate = SAMPLE_RATE.to_string();
    let output = Command::new(program)
        .args(["-nostdin", "-threads", "0", "-i"])
        .arg(path)
        .args(["-f", "s16le", "-ac", "1", "-acodec", "pcm_s16le", "-ar", rate.as_str(), "-"])
        .stdin(Stdio::null())
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "Failed to load audio: {}",
            stderr.lines().last().unwrap_or("ffmpeg failed").trim()
        ));
    }
    Ok(pcm16_to_f32(&output.stdout))
}

/// Little-endian signed 16-bit PCM to floats. A trailing odd byte is ignored.
pub fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / 32768.0);
    }
    samples
}

fn read_wav(path: &Path) -> Result<Vec<f32>> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let (header, data) = wav::read(&mut file)
        .with_context(|| format!("{} is not a WAV file and ffmpeg is not installed", path.display()))?;

    let interleaved: Vec<f32> = match data {
        wav::BitDepth::Eight(samples) => samples
            .into_iter()
            .map(|s| (s as f32 - 128.0) / 128.0)
            .collect(),
        wav::BitDepth::Sixteen(samples) => samples.into_iter().map(|s| s as f32 / 32768.0).collect(),
        wav::BitDepth::TwentyFour(samples) => samples
            .into_iter()
            .map(|s| s as f32 / 8_388_608.0)
            .collect(),
        wav::BitDepth::ThirtyTwoFloat(samples) => samples,
        wav::BitDepth::Empty => Vec::new(),
    };

    let mono = downmix(&interleaved, header.channel_count as usize);
    Ok(resample_linear(&mono, header.sampling_rate, SAMPLE_RATE))
}

/// Average interleaved channels into one.
fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Linear interpolation resampler; good enough for speech at 16 kHz.
fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 {
        return samples.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = (samples.len() as f64 / ratio).floor() as usize;
    (0..out_len)
        .map(|i| {
            let position = i as f64 * ratio;
            let index = position as usize;
            let fraction = (position - index as f64) as f32;
            let current = samples[index];
            let next = samples.get(index + 1).copied().unwrap_or(current);
            current + (next - current) * fraction
        })
        .collect()
}
