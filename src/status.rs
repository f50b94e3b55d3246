//! # Status Store
//!
//! Process-lifetime telemetry: which models are cached, what failed last,
//! how long the last load and transcription took, and what is loading
//! right now. Writers are the model cache and the pipeline; the one reader
//! is [`StatusStore::snapshot`], which backs `/status` and the stdio
//! `status` message.
//!
//! The store has its own `RwLock`, separate from the exclusive section, so
//! status can be read while a load or inference is in progress.

use crate::engine::CacheKey;
use serde::Serialize;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct StatusFields {
    cached_models: Vec<CacheKey>,
    last_error: Option<String>,
    last_load_model: Option<CacheKey>,
    last_load_ms: Option<u64>,
    last_transcribe_ms: Option<u64>,
    loading: Option<(CacheKey, Instant)>,
}

/// Snapshot returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessStatus {
    pub ok: bool,
    pub cached_models: Vec<CacheKey>,
    pub last_error: Option<String>,
    pub last_load_model: Option<CacheKey>,
    pub last_load_ms: Option<u64>,
    pub last_transcribe_ms: Option<u64>,
    pub loading_model: Option<CacheKey>,
    pub loading_elapsed_ms: Option<u64>,
}

#[derive(Debug, Default)]
pub struct StatusStore {
    fields: RwLock<StatusFields>,
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn write<F: FnOnce(&mut StatusFields)>(&self, update: F) {
        let mut fields = self.fields.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut fields);
    }

    pub(crate) fn begin_load(&self, key: &CacheKey) {
        self.write(|f| f.loading = Some((key.clone(), Instant::now())));
    }

    pub(crate) fn finish_load(&self, key: &CacheKey, elapsed: Duration) {
        self.write(|f| {
            if !f.cached_models.contains(key) {
                f.cached_models.push(key.clone());
            }
            f.last_load_model = Some(key.clone());
            f.last_load_ms = Some(millis(elapsed));
            f.loading = None;
        });
    }

    pub(crate) fn fail_load(&self, message: String) {
        self.write(|f| {
            f.last_error = Some(message);
            f.loading = None;
        });
    }

    pub(crate) fn record_transcribe(&self, elapsed: Duration) {
        self.write(|f| f.last_transcribe_ms = Some(millis(elapsed)));
    }

    pub(crate) fn record_error(&self, message: String) {
        self.write(|f| f.last_error = Some(message));
    }

    /// Consistent copy of every field, taken under one read guard.
    pub fn snapshot(&self) -> ProcessStatus {
        let fields = self.fields.read().unwrap_or_else(PoisonError::into_inner);
        let (loading_model, loading_elapsed_ms) = match &fields.loading {
            Some((key, started)) => (Some(key.clone()), Some(millis(started.elapsed()))),
            None => (None, None),
        };

        ProcessStatus {
            ok: true,
            cached_models: fields.cached_models.clone(),
            last_error: fields.last_error.clone(),
            last_load_model: fields.last_load_model.clone(),
            last_load_ms: fields.last_load_ms,
            last_transcribe_ms: fields.last_transcribe_ms,
            loading_model,
            loading_elapsed_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineKind, ModelConfig};

    fn key(model: &str) -> CacheKey {
        ModelConfig::new(EngineKind::Generic, model, "cpu", "int8", None).cache_key()
    }

    #[test]
    fn test_initial_snapshot_is_empty() {
        let status = StatusStore::new().snapshot();
        assert!(status.ok);
        assert!(status.cached_models.is_empty());
        assert_eq!(status.last_error, None);
        assert_eq!(status.loading_model, None);
        assert_eq!(status.loading_elapsed_ms, None);
    }

    #[test]
    fn test_load_lifecycle() {
        let store = StatusStore::new();
        store.begin_load(&key("base"));

        let loading = store.snapshot();
        assert_eq!(loading.loading_model, Some(key("base")));
        assert!(loading.loading_elapsed_ms.is_some());

        store.finish_load(&key("base"), Duration::from_millis(1500));
        let loaded = store.snapshot();
        assert_eq!(loaded.loading_model, None);
        assert_eq!(loaded.loading_elapsed_ms, None);
        assert_eq!(loaded.last_load_ms, Some(1500));
        assert_eq!(loaded.cached_models, vec![key("base")]);
    }

    #[test]
    fn test_failed_load_clears_loading() {
        let store = StatusStore::new();
        store.begin_load(&key("huge"));
        store.fail_load("model load failed: out of memory".to_string());

        let status = store.snapshot();
        assert_eq!(status.loading_model, None);
        assert!(status.cached_models.is_empty());
        assert_eq!(status.last_error.as_deref(), Some("model load failed: out of memory"));
    }

    #[test]
    fn test_wire_shape() {
        let store = StatusStore::new();
        store.record_transcribe(Duration::from_millis(42));
        let value = serde_json::to_value(store.snapshot()).unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(value["last_transcribe_ms"], 42);
        assert!(value["loading_model"].is_null());
        assert!(value["cached_models"].is_array());
    }
}
