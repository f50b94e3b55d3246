//! Subprocess-backed runtimes for the generic and faster engines.
//!
//! `whisper` (openai-whisper) writes a JSON result file; `whisper-ctranslate2`
//! (faster-whisper) prints one line per decoded segment while it runs, which
//! is read back as a lazy [`SegmentStream`]. A missing executable surfaces
//! as [`EngineNotInstalled`] at load time.
//!
//! Loading checks the model name and then runs the CLI once on a second of
//! silence. That makes the CLI fetch and load the checkpoint, so an unknown
//! model, a bad device or a missing download fails the load instead of
//! the first transcription, and warmup pays the download up front.

use super::faster::{FasterArgs, FasterModel, FasterRuntime, SegmentIter};
use super::generic::{GenericArgs, GenericModel, GenericOutput, GenericRuntime};
use super::{EngineNotInstalled, Segment};
use crate::audio::SAMPLE_RATE;
use crate::device::CPU;
use anyhow::{anyhow, bail, Context, Result};
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use tempfile::TempDir;
use tracing::{debug, warn};

fn locate(program: &str) -> Result<PathBuf> {
    which::which(program).map_err(|e| {
        debug!("{} not found: {}", program, e);
        anyhow::Error::new(EngineNotInstalled(program.to_string()))
    })
}

/// Checkpoint names openai-whisper downloads by itself.
const WHISPER_MODELS: &[&str] = &[
    "tiny.en", "tiny", "base.en", "base", "small.en", "small", "medium.en", "medium",
    "large-v1", "large-v2", "large-v3", "large", "large-v3-turbo", "turbo",
];

/// Converted checkpoints faster-whisper resolves on the Hugging Face Hub.
const FASTER_MODELS: &[&str] = &[
    "tiny.en", "tiny", "base.en", "base", "small.en", "small", "medium.en", "medium",
    "large-v1", "large-v2", "large-v3", "large", "large-v3-turbo", "turbo",
    "distil-small.en", "distil-medium.en", "distil-large-v2", "distil-large-v3",
];

/// A known name, a local checkpoint path, or (when `repo_ids`) an
/// `owner/name` Hub repository.
fn check_model_name(name: &str, known: &[&str], repo_ids: bool) -> Result<()> {
    if known.contains(&name) || Path::new(name).exists() || (repo_ids && name.contains('/')) {
        Ok(())
    } else {
        Err(anyhow!("unknown model '{}' (expected one of {})", name, known.join(", ")))
    }
}

/// Write one second of 16 kHz mono silence into `dir`.
fn silent_clip(dir: &Path) -> Result<PathBuf> {
    let path = dir.join("warmup.wav");
    let mut file = std::fs::File::create(&path).with_context(|| format!("creating {}", path.display()))?;
    let header = wav::Header::new(wav::WAV_FORMAT_PCM, 1, SAMPLE_RATE, 16);
    let samples = vec![0i16; SAMPLE_RATE as usize];
    wav::write(header, &wav::BitDepth::Sixteen(samples), &mut file)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Split `cuda:1` into the device name and index flags the CLIs expect.
fn device_args(device: &str) -> Vec<String> {
    match device.split_once(':') {
        Some((name, index)) => vec![
            "--device".into(),
            name.into(),
            "--device_index".into(),
            index.into(),
        ],
        None => vec!["--device".into(), device.into()],
    }
}

fn language_and_prompt(language: &Option<String>, initial_prompt: &Option<String>) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(language) = language {
        args.extend(["--language".to_string(), language.clone()]);
    }
    if let Some(prompt) = initial_prompt {
        args.extend(["--initial_prompt".to_string(), prompt.clone()]);
    }
    args
}

/// openai-whisper command line.
pub struct WhisperCli {
    program: String,
}

impl WhisperCli {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }
}

impl GenericRuntime for WhisperCli {
    fn load_model(&self, name: &str, device: &str) -> Result<Box<dyn GenericModel>> {
        let program = locate(&self.program)?;
        check_model_name(name, WHISPER_MODELS, false)?;
        debug!("Using {} for model {} on {}", program.display(), name, device);

        let model = WhisperCliModel {
            program,
            model: name.to_string(),
            device: device.to_string(),
        };

        let scratch = tempfile::tempdir().context("creating warmup dir")?;
        let args = GenericArgs {
            language: Some("en".to_string()),
            initial_prompt: None,
            fp16: device != CPU,
        };
        model
            .transcribe(&silent_clip(scratch.path())?, &args)
            .with_context(|| format!("loading whisper model {}", name))?;

        Ok(Box::new(model))
    }
}

struct WhisperCliModel {
    program: PathBuf,
    model: String,
    device: String,
}

impl GenericModel for WhisperCliModel {
    fn transcribe(&self, path: &Path, args: &GenericArgs) -> Result<GenericOutput> {
        let output_dir = tempfile::tempdir().context("creating whisper output dir")?;

        let mut command = Command::new(&self.program);
        command
            .arg(path)
            .args(["--model", self.model.as_str(), "--device", self.device.as_str()])
            .args(["--output_format", "json", "--verbose", "False"])
            .args(["--fp16", if args.fp16 { "True" } else { "False" }])
            .arg("--output_dir")
            .arg(output_dir.path())
            .args(language_and_prompt(&args.language, &args.initial_prompt))
            .stdin(Stdio::null());

        let output = command
            .output()
            .with_context(|| format!("running {}", self.program.display()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "whisper exited with {}: {}",
                output.status,
                stderr.lines().last().unwrap_or("").trim()
            ));
        }

        let stem = path
            .file_stem()
            .ok_or_else(|| anyhow!("audio path has no file name"))?;
        let result_file = output_dir.path().join(stem).with_extension("json");
        let json = std::fs::read_to_string(&result_file)
            .with_context(|| format!("reading {}", result_file.display()))?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// faster-whisper command line (`whisper-ctranslate2`).
pub struct CTranslate2Cli {
    program: String,
}

impl CTranslate2Cli {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }
}

impl FasterRuntime for CTranslate2Cli {
    fn whisper_model(&self, name: &str, device: &str, compute_type: &str) -> Result<Box<dyn FasterModel>> {
        let program = locate(&self.program)?;
        check_model_name(name, FASTER_MODELS, true)?;
        debug!(
            "Using {} for model {} on {} ({})",
            program.display(),
            name,
            device,
            compute_type
        );

        let model = CTranslate2Model {
            program,
            model: name.to_string(),
            device: device.to_string(),
            compute_type: compute_type.to_string(),
        };
        model
            .run_silence()
            .with_context(|| format!("loading faster-whisper model {}", name))?;

        Ok(Box::new(model))
    }
}

struct CTranslate2Model {
    program: PathBuf,
    model: String,
    device: String,
    compute_type: String,
}

impl CTranslate2Model {
    fn command(&self, path: &Path, output_dir: &Path, args: &FasterArgs) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg(path)
            .args(["--model", self.model.as_str()])
            .args(device_args(&self.device))
            .args(["--compute_type", self.compute_type.as_str()])
            .args(["--output_format", "txt", "--verbose", "True"])
            .arg("--output_dir")
            .arg(output_dir)
            .args(language_and_prompt(&args.language, &args.initial_prompt));
        command
    }

    /// Decode the silent clip to the end and check a transcript was written.
    fn run_silence(&self) -> Result<()> {
        let scratch = tempfile::tempdir().context("creating warmup dir")?;
        let clip = silent_clip(scratch.path())?;
        let args = FasterArgs {
            language: Some("en".to_string()),
            initial_prompt: None,
        };

        for segment in SegmentStream::spawn(self.command(&clip, scratch.path(), &args))? {
            segment?;
        }

        let transcript = clip.with_extension("txt");
        if !transcript.exists() {
            bail!("{} wrote no transcript", self.program.display());
        }
        Ok(())
    }
}

impl FasterModel for CTranslate2Model {
    fn transcribe<'a>(&'a self, path: &Path, args: &FasterArgs) -> Result<SegmentIter<'a>> {
        let output_dir = tempfile::tempdir().context("creating faster-whisper output dir")?;
        let command = self.command(path, output_dir.path(), args);
        let stream = SegmentStream::spawn(command)?.keep(output_dir);
        Ok(Box::new(stream))
    }
}

/// Segments parsed from a running transcriber's stdout.
///
/// Lines that are not segment lines are skipped. Once stdout closes the
/// child is reaped and a non-zero exit is yielded as a final error.
pub struct SegmentStream {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    done: bool,
    _output_dir: Option<TempDir>,
}

impl SegmentStream {
    pub fn spawn(mut command: Command) -> Result<Self> {
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("spawning transcriber")?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("transcriber stdout not captured"))?;

        Ok(Self {
            child,
            lines: BufReader::new(stdout).lines(),
            done: false,
            _output_dir: None,
        })
    }

    /// Hold a directory the child writes into until the stream is dropped.
    fn keep(mut self, dir: TempDir) -> Self {
        self._output_dir = Some(dir);
        self
    }

    fn finish(&mut self) -> Option<Result<Segment>> {
        self.done = true;
        match self.child.wait() {
            Ok(status) if status.success() => None,
            Ok(status) => Some(Err(anyhow!("transcriber exited with {}", status))),
            Err(e) => Some(Err(anyhow::Error::new(e).context("waiting for transcriber"))),
        }
    }
}

impl Iterator for SegmentStream {
    type Item = Result<Segment>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.lines.next() {
                Some(Ok(line)) => {
                    if let Some(segment) = parse_segment_line(&line) {
                        return Some(Ok(segment));
                    }
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(anyhow::Error::new(e).context("reading transcriber output")));
                }
                None => return self.finish(),
            }
        }
    }
}

impl Drop for SegmentStream {
    fn drop(&mut self) {
        // Still running when the consumer stopped early
        if let Ok(None) = self.child.try_wait() {
            if let Err(e) = self.child.kill() {
                warn!("Failed to stop transcriber: {}", e);
            }
            let _ = self.child.wait();
        }
    }
}

/// `[00:01.000 --> 00:03.480]  text`, hours optional.
fn parse_segment_line(line: &str) -> Option<Segment> {
    let rest = line.trim_start().strip_prefix('[')?;
    let (range, text) = rest.split_once(']')?;
    let (start, end) = range.split_once("-->")?;
    Some(Segment {
        start: parse_timestamp(start.trim())?,
        end: parse_timestamp(end.trim())?,
        text: text.trim().to_string(),
    })
}

fn parse_timestamp(value: &str) -> Option<f64> {
    let mut seconds = 0.0;
    for part in value.split(':') {
        seconds = seconds * 60.0 + part.parse::<f64>().ok()?;
    }
    Some(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A stand-in CLI that writes both result formats into `--output_dir`
    /// and prints one segment line.
    #[cfg(unix)]
    const FAKE_CLI: &str = r#"#!/bin/sh
audio="$1"
shift
out=""
while [ $# -gt 0 ]; do
    if [ "$1" = "--output_dir" ]; then out="$2"; fi
    shift
done
name=$(basename "$audio")
name="${name%.*}"
printf '{"text":" hello ","segments":[]}' > "$out/$name.json"
printf 'hello\n' > "$out/$name.txt"
echo '[00:00.000 --> 00:01.000]  hello'
"#;

    #[cfg(unix)]
    fn fake_cli(dir: &Path) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-whisper");
        std::fs::write(&path, FAKE_CLI).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    /// Exec can race a concurrent fork that still holds the script's write
    /// handle ("Text file busy"); give it a few tries.
    #[cfg(unix)]
    fn retry_busy<T>(mut attempt: impl FnMut() -> Result<T>) -> Result<T> {
        for _ in 0..5 {
            match attempt() {
                Err(e) if format!("{:#}", e).contains("busy") => {
                    std::thread::sleep(std::time::Duration::from_millis(50))
                }
                other => return other,
            }
        }
        attempt()
    }

    #[test]
    fn test_parse_segment_line() {
        let segment = parse_segment_line("[00:01.000 --> 00:03.480]  Hello there.").unwrap();
        assert_eq!(segment.start, 1.0);
        assert_eq!(segment.end, 3.48);
        assert_eq!(segment.text, "Hello there.");

        let segment = parse_segment_line("[01:00:00.500 --> 01:00:02.000] late").unwrap();
        assert_eq!(segment.start, 3600.5);
    }

    #[test]
    fn test_non_segment_lines_are_skipped() {
        assert!(parse_segment_line("Detected language 'English' with probability 0.98").is_none());
        assert!(parse_segment_line("[bad --> 00:01.000] x").is_none());
        assert!(parse_segment_line("").is_none());
    }

    #[test]
    fn test_device_args() {
        assert_eq!(device_args("cuda"), vec!["--device", "cuda"]);
        assert_eq!(
            device_args("cuda:1"),
            vec!["--device", "cuda", "--device_index", "1"]
        );
    }

    #[test]
    fn test_missing_program_is_not_installed() {
        let err = WhisperCli::new("definitely-not-a-whisper-binary")
            .load_model("base", "cpu")
            .err()
            .unwrap();
        assert!(err.downcast_ref::<EngineNotInstalled>().is_some());

        let err = CTranslate2Cli::new("definitely-not-a-ct2-binary")
            .whisper_model("base", "cpu", "int8")
            .err()
            .unwrap();
        assert!(err.downcast_ref::<EngineNotInstalled>().is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_segment_stream_reads_child_output() {
        let mut command = Command::new("sh");
        command.args([
            "-c",
            "echo 'Detected language: en'; echo '[00:00.000 --> 00:01.500]  Hello'; echo '[00:01.500 --> 00:02.000] world'",
        ]);
        let segments: Vec<Segment> = SegmentStream::spawn(command)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].text, "world");
    }

    #[cfg(unix)]
    #[test]
    fn test_segment_stream_reports_exit_status() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo '[00:00.000 --> 00:01.000] partial'; exit 3"]);
        let results: Vec<Result<Segment>> = SegmentStream::spawn(command).unwrap().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[test]
    fn test_model_name_check() {
        assert!(check_model_name("small.en", WHISPER_MODELS, false).is_ok());
        assert!(check_model_name("Systran/faster-whisper-small", FASTER_MODELS, true).is_ok());
        assert!(check_model_name("Systran/faster-whisper-small", WHISPER_MODELS, false).is_err());

        let err = check_model_name("no-such-model-xyz", WHISPER_MODELS, false).unwrap_err();
        assert!(err.to_string().starts_with("unknown model 'no-such-model-xyz'"));

        let dir = tempfile::tempdir().unwrap();
        let checkpoint = dir.path().join("custom.pt");
        std::fs::write(&checkpoint, b"weights").unwrap();
        assert!(check_model_name(checkpoint.to_str().unwrap(), WHISPER_MODELS, false).is_ok());
    }

    #[test]
    fn test_silent_clip_is_one_second_of_pcm() {
        let dir = tempfile::tempdir().unwrap();
        let clip = silent_clip(dir.path()).unwrap();
        let (header, data) = wav::read(&mut std::fs::File::open(&clip).unwrap()).unwrap();
        assert_eq!(header.sampling_rate, SAMPLE_RATE);
        assert_eq!(header.channel_count, 1);
        match data {
            wav::BitDepth::Sixteen(samples) => assert_eq!(samples.len(), SAMPLE_RATE as usize),
            _ => panic!("expected 16-bit samples"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_unknown_model_fails_to_load() {
        let err = WhisperCli::new("true").load_model("no-such-model-xyz", "cpu").err().unwrap();
        assert!(err.downcast_ref::<EngineNotInstalled>().is_none());
        assert!(format!("{:#}", err).contains("unknown model"));

        let err = CTranslate2Cli::new("true")
            .whisper_model("no-such-model-xyz", "cpu", "int8")
            .err()
            .unwrap();
        assert!(format!("{:#}", err).contains("unknown model"));
    }

    #[cfg(unix)]
    #[test]
    fn test_load_fails_when_cli_produces_nothing() {
        // `true` accepts any arguments and writes no result
        let err = WhisperCli::new("true").load_model("base", "cpu").err().unwrap();
        assert!(format!("{:#}", err).starts_with("loading whisper model base"));

        let err = CTranslate2Cli::new("true")
            .whisper_model("base", "cpu", "int8")
            .err()
            .unwrap();
        assert!(format!("{:#}", err).contains("wrote no transcript"));
    }

    #[cfg(unix)]
    #[test]
    fn test_load_runs_cli_then_transcribes() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_cli(dir.path());
        let audio = dir.path().join("clip.webm");
        std::fs::write(&audio, b"audio").unwrap();

        let whisper = WhisperCli::new(&program);
        let model = retry_busy(|| whisper.load_model("base", "cpu")).unwrap();
        let args = GenericArgs {
            language: None,
            initial_prompt: None,
            fp16: false,
        };
        let output = model.transcribe(&audio, &args).unwrap();
        assert_eq!(output.text.as_deref(), Some(" hello "));

        let faster = CTranslate2Cli::new(&program);
        let model = retry_busy(|| faster.whisper_model("small", "cuda:1", "float16")).unwrap();
        let args = FasterArgs {
            language: None,
            initial_prompt: None,
        };
        let segments: Vec<Segment> = model
            .transcribe(&audio, &args)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "hello");
    }
}
