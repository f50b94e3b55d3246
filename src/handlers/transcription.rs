//! JSON handlers for `/warmup` and `/transcribe`.
//!
//! The body is read as raw bytes so that an empty body, malformed JSON and
//! a field of the wrong type each get their own 400 message. The pipeline blocks for as long as a model
//! load or an inference takes, so it runs on the blocking thread pool.

use crate::error::{AppError, AppResult};
use crate::pipeline::TranscriptionService;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::de::DeserializeOwned;
use serde_json::error::Category;
use serde_json::json;
use std::sync::Arc;

fn parse_body<T: DeserializeOwned>(body: &web::Bytes) -> AppResult<T> {
    if body.is_empty() {
        return Err(AppError::BadRequest("empty body".to_string()));
    }
    serde_json::from_slice(body).map_err(|e| match e.classify() {
        Category::Data => AppError::BadRequest(format!("invalid field: {}", e)),
        _ => e.into(),
    })
}

async fn run_blocking<T, F>(state: &web::Data<AppState>, job: F) -> AppResult<T>
where
    F: FnOnce(&TranscriptionService) -> AppResult<T> + Send + 'static,
    T: Send + 'static,
{
    let service: Arc<TranscriptionService> = state.service.clone();
    web::block(move || job(&service))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
}

pub async fn warmup(state: web::Data<AppState>, body: web::Bytes) -> AppResult<HttpResponse> {
    let payload = parse_body(&body)?;
    run_blocking(&state, move |service| service.warmup(payload)).await?;
    Ok(HttpResponse::Ok().json(json!({ "ok": true })))
}

pub async fn transcribe(state: web::Data<AppState>, body: web::Bytes) -> AppResult<HttpResponse> {
    let payload = parse_body(&body)?;
    let result = run_blocking(&state, move |service| service.transcribe(payload)).await?;
    Ok(HttpResponse::Ok().json(result))
}

pub async fn not_found() -> AppResult<HttpResponse> {
    Err(AppError::NotFound)
}
