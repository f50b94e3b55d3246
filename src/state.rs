//! # Application State
//!
//! Shared by every HTTP worker thread. The transcription service does its
//! own locking, so the state is just two handles and is cheap to clone.

use crate::pipeline::TranscriptionService;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Model cache, engines and status behind one facade
    pub service: Arc<TranscriptionService>,

    /// When the server started (never changes)
    pub start_time: Instant,
}

impl AppState {
    pub fn new(service: Arc<TranscriptionService>) -> Self {
        Self {
            service,
            start_time: Instant::now(),
        }
    }

    /// Seconds since the server started.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
