pub mod transcription;

pub use transcription::*;

use crate::health;
use actix_web::web;

/// Every route the worker serves, with request bodies capped at
/// `max_body_bytes`. Shared by `main` and the handler tests.
pub fn configure(max_body_bytes: usize) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg| routes(cfg, max_body_bytes)
}

fn routes(cfg: &mut web::ServiceConfig, max_body_bytes: usize) {
    cfg.app_data(web::PayloadConfig::new(max_body_bytes))
        .route("/health", web::get().to(health::health_check))
        .route("/status", web::get().to(health::status))
        .route("/warmup", web::post().to(warmup))
        .route("/transcribe", web::post().to(transcribe))
        .default_service(web::to(not_found));
}
