//! # Stdio Transport
//!
//! Newline-delimited JSON over stdin/stdout, for hosts that spawn the
//! worker as a child process.
//!
//! ## Protocol:
//! - On startup the worker writes `{"type":"ready"}`
//! - Requests are `{"id": <any>, "type": "status"|"warmup"|"transcribe", "payload": {...}}`
//! - Replies are `{"id", "ok": true, "result"}` or `{"id", "ok": false, "error"}`
//! - Lines that are not JSON (or not UTF-8), or carry no `id`, are logged
//!   and dropped
//! - A request that panics still gets an `ok: false` reply
//!
//! Requests are handled concurrently on the blocking pool (the pipeline
//! still serializes engine work), so replies can arrive out of order; the
//! echoed `id` is how callers match them. Only the writer task touches
//! stdout, which keeps every reply on its own line.

use crate::pipeline::{TranscribePayload, TranscriptionService, WarmupPayload};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

#[derive(Debug, Deserialize)]
struct Inbound {
    #[serde(default)]
    id: Option<Value>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    payload: Value,
}

/// Serve requests from `reader` until it closes, writing replies to `writer`.
///
/// Waits for every in-flight request to be answered before returning the
/// writer.
pub async fn serve<R, W>(service: Arc<TranscriptionService>, reader: R, writer: W) -> io::Result<W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = rx.recv().await {
            if let Err(e) = write_line(&mut writer, &message).await {
                error!("Failed to write reply: {}", e);
            }
        }
        writer
    });

    info!("stdio mode ready");
    send(&tx, json!({ "type": "ready" }));

    let mut reader = reader;
    let mut line = Vec::new();
    let mut in_flight = JoinSet::new();

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            continue;
        }

        let message: Inbound = match serde_json::from_slice(trimmed) {
            Ok(message) => message,
            Err(e) => {
                error!("invalid json: {}", e);
                continue;
            }
        };
        let id = match message.id {
            Some(id) if !id.is_null() => id,
            _ => {
                error!("missing id in message");
                continue;
            }
        };

        debug!("Received {:?} message {}", message.kind, id);
        let service = service.clone();
        let tx = tx.clone();
        in_flight.spawn_blocking(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                dispatch(&service, message.kind.as_deref(), message.payload)
            }))
            .unwrap_or_else(|cause| {
                let cause = panic_message(cause.as_ref());
                error!("Request {} panicked: {}", id, cause);
                Err(format!("internal error: {}", cause))
            });
            let reply = match outcome {
                Ok(result) => json!({ "id": id, "ok": true, "result": result }),
                Err(error) => json!({ "id": id, "ok": false, "error": error }),
            };
            send(&tx, reply);
        });
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            error!("Request task failed: {}", e);
        }
    }

    drop(tx);
    writer_task.await.map_err(io::Error::other)
}

fn panic_message(cause: &(dyn Any + Send)) -> String {
    if let Some(message) = cause.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = cause.downcast_ref::<String>() {
        message.clone()
    } else {
        "request handler panicked".to_string()
    }
}

fn send(tx: &mpsc::UnboundedSender<Value>, message: Value) {
    if tx.send(message).is_err() {
        error!("Reply dropped, writer has stopped");
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, message: &Value) -> io::Result<()> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Run one request; the error string is what the caller sees.
fn dispatch(service: &TranscriptionService, kind: Option<&str>, payload: Value) -> Result<Value, String> {
    match kind {
        Some("status") => serde_json::to_value(service.status()).map_err(|e| e.to_string()),
        Some("warmup") => {
            let payload: WarmupPayload = parse_payload(payload)?;
            service.warmup(payload).map_err(|e| e.to_string())?;
            Ok(json!({ "ok": true }))
        }
        Some("transcribe") => {
            let payload: TranscribePayload = parse_payload(payload)?;
            let result = service.transcribe(payload).map_err(|e| e.to_string())?;
            serde_json::to_value(result).map_err(|e| e.to_string())
        }
        other => Err(format!("unknown message type: {}", other.unwrap_or("null"))),
    }
}

/// A missing or null payload means "all defaults".
fn parse_payload<T: DeserializeOwned + Default>(payload: Value) -> Result<T, String> {
    if payload.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(payload).map_err(|e| format!("invalid payload: {}", e))
}
