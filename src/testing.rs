//! Scripted engine runtimes for unit tests.
//!
//! Each stub counts loads, records the arguments of every transcribe call
//! and answers with a caller-supplied responder.

use crate::engine::aligned::{AlignedModel, AlignedParams, AlignedRuntime};
use crate::engine::faster::{FasterArgs, FasterModel, FasterRuntime, SegmentIter};
use crate::engine::generic::{GenericArgs, GenericModel, GenericOutput, GenericRuntime};
use crate::engine::{EngineNotInstalled, EngineSet, Segment};
use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn segment(start: f64, end: f64, text: &str) -> Segment {
    Segment {
        start,
        end,
        text: text.to_string(),
    }
}

pub fn output(text: &str, segments: Vec<Segment>) -> GenericOutput {
    GenericOutput {
        text: Some(text.to_string()),
        segments: Some(segments),
    }
}

type Responder<A, R> = Box<dyn Fn(&A) -> Result<R> + Send + Sync>;

struct Recorder<A> {
    loads: AtomicUsize,
    calls: Mutex<Vec<A>>,
    paths: Mutex<Vec<PathBuf>>,
    load_error: Mutex<Option<String>>,
    load_delay: Mutex<Duration>,
    installed: bool,
}

impl<A: Clone> Recorder<A> {
    fn new(installed: bool) -> Self {
        Self {
            loads: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            paths: Mutex::new(Vec::new()),
            load_error: Mutex::new(None),
            load_delay: Mutex::new(Duration::ZERO),
            installed,
        }
    }

    fn load(&self, program: &str) -> Result<()> {
        if !self.installed {
            return Err(EngineNotInstalled(program.to_string()).into());
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(*self.load_delay.lock().unwrap());
        match self.load_error.lock().unwrap().clone() {
            Some(message) => Err(anyhow!(message)),
            None => Ok(()),
        }
    }

    fn record(&self, args: &A) {
        self.calls.lock().unwrap().push(args.clone());
    }

    fn calls(&self) -> Vec<A> {
        self.calls.lock().unwrap().clone()
    }

    fn record_path(&self, path: &Path) {
        self.paths.lock().unwrap().push(path.to_path_buf());
    }

    fn paths(&self) -> Vec<PathBuf> {
        self.paths.lock().unwrap().clone()
    }
}

// Generic engine

struct GenericShared {
    recorder: Recorder<GenericArgs>,
    responder: Responder<GenericArgs, GenericOutput>,
}

pub struct StubGeneric {
    shared: Arc<GenericShared>,
}

impl StubGeneric {
    pub fn with<F>(responder: F) -> Self
    where
        F: Fn(&GenericArgs) -> Result<GenericOutput> + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(GenericShared {
                recorder: Recorder::new(true),
                responder: Box::new(responder),
            }),
        }
    }

    pub fn replying(reply: GenericOutput) -> Self {
        Self::with(move |_| Ok(reply.clone()))
    }

    pub fn not_installed() -> Self {
        Self {
            shared: Arc::new(GenericShared {
                recorder: Recorder::new(false),
                responder: Box::new(|_| Ok(GenericOutput::default())),
            }),
        }
    }

    pub fn calls(&self) -> Vec<GenericArgs> {
        self.shared.recorder.calls()
    }

    pub fn load_count(&self) -> usize {
        self.shared.recorder.loads.load(Ordering::SeqCst)
    }

    /// Audio files handed to the engine, in call order.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.shared.recorder.paths()
    }
}

struct StubGenericModel(Arc<GenericShared>);

impl GenericRuntime for StubGeneric {
    fn load_model(&self, _name: &str, _device: &str) -> Result<Box<dyn GenericModel>> {
        self.shared.recorder.load("whisper")?;
        Ok(Box::new(StubGenericModel(self.shared.clone())))
    }
}

impl GenericModel for StubGenericModel {
    fn transcribe(&self, path: &Path, args: &GenericArgs) -> Result<GenericOutput> {
        self.0.recorder.record(args);
        self.0.recorder.record_path(path);
        (self.0.responder)(args)
    }
}

// Faster engine

struct FasterShared {
    recorder: Recorder<FasterArgs>,
    compute_types: Mutex<Vec<String>>,
    segments: Vec<Segment>,
    fail_after: bool,
}

pub struct StubFaster {
    shared: Arc<FasterShared>,
}

impl StubFaster {
    fn build(installed: bool, segments: Vec<Segment>, fail_after: bool) -> Self {
        Self {
            shared: Arc::new(FasterShared {
                recorder: Recorder::new(installed),
                compute_types: Mutex::new(Vec::new()),
                segments,
                fail_after,
            }),
        }
    }

    pub fn streaming(segments: Vec<Segment>) -> Self {
        Self::build(true, segments, false)
    }

    /// Yields `first`, then an error.
    pub fn failing_mid_stream(first: Segment) -> Self {
        Self::build(true, vec![first], true)
    }

    pub fn not_installed() -> Self {
        Self::build(false, Vec::new(), false)
    }

    pub fn calls(&self) -> Vec<FasterArgs> {
        self.shared.recorder.calls()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.shared.recorder.paths()
    }

    pub fn compute_types(&self) -> Vec<String> {
        self.shared.compute_types.lock().unwrap().clone()
    }
}

struct StubFasterModel(Arc<FasterShared>);

impl FasterRuntime for StubFaster {
    fn whisper_model(&self, _name: &str, _device: &str, compute_type: &str) -> Result<Box<dyn FasterModel>> {
        self.shared.recorder.load("whisper-ctranslate2")?;
        self.shared
            .compute_types
            .lock()
            .unwrap()
            .push(compute_type.to_string());
        Ok(Box::new(StubFasterModel(self.shared.clone())))
    }
}

impl FasterModel for StubFasterModel {
    fn transcribe<'a>(&'a self, path: &Path, args: &FasterArgs) -> Result<SegmentIter<'a>> {
        self.0.recorder.record(args);
        self.0.recorder.record_path(path);
        let items = self.0.segments.iter().cloned().map(Ok);
        let tail = self
            .0
            .fail_after
            .then(|| Err(anyhow!("decoder crashed")))
            .into_iter();
        Ok(Box::new(items.chain(tail)))
    }
}

// Aligned engine

struct AlignedShared {
    recorder: Recorder<AlignedParams>,
    parameters: &'static [&'static str],
    load_languages: Mutex<Vec<Option<String>>>,
    audio_loads: AtomicUsize,
    responder: Responder<AlignedParams, GenericOutput>,
}

pub struct StubAligned {
    shared: Arc<AlignedShared>,
}

impl StubAligned {
    pub fn with<F>(parameters: &'static [&'static str], responder: F) -> Self
    where
        F: Fn(&AlignedParams) -> Result<GenericOutput> + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(AlignedShared {
                recorder: Recorder::new(true),
                parameters,
                load_languages: Mutex::new(Vec::new()),
                audio_loads: AtomicUsize::new(0),
                responder: Box::new(responder),
            }),
        }
    }

    pub fn with_parameters(parameters: &'static [&'static str]) -> Self {
        Self::with(parameters, |_| Ok(output("ok", Vec::new())))
    }

    pub fn fail_loads(&self, message: &str) {
        *self.shared.recorder.load_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn slow_loads(&self, delay: Duration) {
        *self.shared.recorder.load_delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<AlignedParams> {
        self.shared.recorder.calls()
    }

    pub fn load_count(&self) -> usize {
        self.shared.recorder.loads.load(Ordering::SeqCst)
    }

    pub fn load_languages(&self) -> Vec<Option<String>> {
        self.shared.load_languages.lock().unwrap().clone()
    }

    pub fn audio_loads(&self) -> usize {
        self.shared.audio_loads.load(Ordering::SeqCst)
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.shared.recorder.paths()
    }
}

struct StubAlignedModel(Arc<AlignedShared>);

impl AlignedRuntime for StubAligned {
    fn load_model(
        &self,
        _name: &str,
        _device: &str,
        _compute_type: &str,
        language: Option<&str>,
    ) -> Result<Box<dyn AlignedModel>> {
        self.shared.recorder.load("whisperx")?;
        self.shared
            .load_languages
            .lock()
            .unwrap()
            .push(language.map(str::to_string));
        Ok(Box::new(StubAlignedModel(self.shared.clone())))
    }

    fn load_audio(&self, path: &Path) -> Result<Vec<f32>> {
        self.shared.audio_loads.fetch_add(1, Ordering::SeqCst);
        self.shared.recorder.record_path(path);
        Ok(vec![0.0; 16000])
    }
}

impl AlignedModel for StubAlignedModel {
    fn transcribe_parameters(&self) -> &'static [&'static str] {
        self.0.parameters
    }

    fn transcribe(&self, _audio: &[f32], params: &AlignedParams) -> Result<GenericOutput> {
        self.0.recorder.record(params);
        (self.0.responder)(params)
    }
}

/// One stub per engine, shared with the [`EngineSet`] built from them.
pub struct Stubs {
    pub generic: Arc<StubGeneric>,
    pub faster: Arc<StubFaster>,
    pub aligned: Arc<StubAligned>,
}

impl Stubs {
    pub fn new() -> Self {
        Self::with_aligned(StubAligned::with_parameters(&[
            "batch_size",
            "language",
            "initial_prompt",
        ]))
    }

    pub fn with_aligned(aligned: StubAligned) -> Self {
        Self {
            generic: Arc::new(StubGeneric::replying(output("generic", Vec::new()))),
            faster: Arc::new(StubFaster::streaming(vec![segment(0.0, 1.0, "faster")])),
            aligned: Arc::new(aligned),
        }
    }

    pub fn with_generic(generic: StubGeneric) -> Self {
        Self {
            generic: Arc::new(generic),
            ..Self::new()
        }
    }

    pub fn engines(&self) -> EngineSet {
        EngineSet::new(self.generic.clone(), self.faster.clone(), self.aligned.clone())
    }

    pub fn engines_without_faster(&self) -> EngineSet {
        EngineSet::new(
            self.generic.clone(),
            Arc::new(StubFaster::not_installed()),
            self.aligned.clone(),
        )
    }
}
