//! # Model Cache
//!
//! Owns every loaded model, keyed by [`CacheKey`], for the life of the
//! process. There is no eviction.
//!
//! All load and inference work happens inside one exclusive section: a
//! caller takes [`ModelCache::lock`], gets or loads its model, runs it and
//! only then releases the guard. Two requests for the same cold model
//! therefore trigger exactly one load, and at most one engine call runs
//! at any time.

use crate::engine::{CacheKey, EngineSet, LoadedModel, ModelConfig};
use crate::error::AppError;
use crate::status::StatusStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{error, info};

pub struct ModelCache {
    models: Mutex<HashMap<CacheKey, Arc<dyn LoadedModel>>>,
    status: Arc<StatusStore>,
    engines: EngineSet,
}

/// Held for the duration of one load-and-use sequence.
pub struct CacheSection<'a> {
    models: MutexGuard<'a, HashMap<CacheKey, Arc<dyn LoadedModel>>>,
    status: &'a StatusStore,
    engines: &'a EngineSet,
}

impl ModelCache {
    pub fn new(engines: EngineSet, status: Arc<StatusStore>) -> Self {
        Self {
            models: Mutex::new(HashMap::new()),
            status,
            engines,
        }
    }

    /// Enter the exclusive section, blocking until it is free.
    pub fn lock(&self) -> CacheSection<'_> {
        CacheSection {
            // A panic inside an engine leaves the map itself consistent
            models: self.models.lock().unwrap_or_else(PoisonError::into_inner),
            status: &self.status,
            engines: &self.engines,
        }
    }

    /// Load without using the model afterwards (warmup).
    pub fn get_or_load(&self, config: &ModelConfig) -> Result<Arc<dyn LoadedModel>, AppError> {
        self.lock().get_or_load(config)
    }

    pub fn status(&self) -> &StatusStore {
        &self.status
    }
}

impl CacheSection<'_> {
    /// Return the cached model for `config`, loading it on a miss.
    ///
    /// A failed load records `last_error`, inserts nothing and returns the
    /// error; the next request for the same key tries again.
    pub fn get_or_load(&mut self, config: &ModelConfig) -> Result<Arc<dyn LoadedModel>, AppError> {
        let key = config.cache_key();
        if let Some(model) = self.models.get(&key) {
            return Ok(model.clone());
        }

        info!("Loading model {}", key);
        self.status.begin_load(&key);
        let started = Instant::now();

        match self.engines.adapter(config.engine).load(config) {
            Ok(model) => {
                let elapsed = started.elapsed();
                info!("Loaded model {} in {}ms", key, elapsed.as_millis());
                self.models.insert(key.clone(), model.clone());
                self.status.finish_load(&key, elapsed);
                Ok(model)
            }
            Err(e) => {
                error!("Failed to load model {}: {}", key, e);
                self.status.fail_load(e.to_string());
                Err(e)
            }
        }
    }

    pub fn status(&self) -> &StatusStore {
        self.status
    }
}
