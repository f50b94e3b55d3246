//! Liveness and status endpoints.

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /health`: the process is up and serving.
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "ok": true }))
}

/// `GET /status`: cache contents, timings and the last error.
///
/// Reads the status store only, so it answers while a model is loading.
pub async fn status(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.service.status())
}
