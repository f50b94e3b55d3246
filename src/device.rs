//! # Device Resolution
//!
//! Maps the device string of a request to the concrete device an engine is
//! loaded on. Only `""`/`"default"` probes hardware; every other value is a
//! pure string mapping, so resolution is idempotent and needs no lock.

use std::process::{Command, Stdio};
use std::sync::OnceLock;
use tracing::{debug, info};

/// Identifier handed to engines when an accelerator is used.
pub const ACCELERATOR: &str = "cuda";

/// Identifier handed to engines for CPU inference.
pub const CPU: &str = "cpu";

/// Cached probe result to avoid repeated detection
static ACCELERATOR_AVAILABLE: OnceLock<bool> = OnceLock::new();

/// Resolve a requested device to a concrete one.
///
/// - `""` / `"default"`: accelerator if one is present, else CPU
/// - `"gpu"` / `"cuda"`: accelerator, without probing
/// - `"cpu"`: CPU
/// - anything else (`"cuda:1"`, `"mps"`, ...) is passed through unchanged
pub fn resolve_device(requested: &str) -> String {
    match requested {
        "" | "default" => {
            if accelerator_available() {
                ACCELERATOR.to_string()
            } else {
                CPU.to_string()
            }
        }
        "gpu" | "cuda" => ACCELERATOR.to_string(),
        "cpu" => CPU.to_string(),
        other => other.to_string(),
    }
}

/// Whether an accelerator is usable (cached after the first probe).
pub fn accelerator_available() -> bool {
    *ACCELERATOR_AVAILABLE.get_or_init(|| {
        let available = probe_candle_cuda() || probe_nvidia_smi();
        if available {
            info!("Accelerator detected, default device is {}", ACCELERATOR);
        } else {
            info!("No accelerator detected, default device is {}", CPU);
        }
        available
    })
}

/// Try to open CUDA device 0 through candle.
#[cfg(feature = "candle")]
fn probe_candle_cuda() -> bool {
    match candle_core::Device::new_cuda(0) {
        Ok(_) => {
            debug!("CUDA device 0 available to candle");
            true
        }
        Err(e) => {
            debug!("CUDA not available to candle: {}", e);
            false
        }
    }
}

#[cfg(not(feature = "candle"))]
fn probe_candle_cuda() -> bool {
    false
}

/// Subprocess engines bring their own CUDA runtime; a working driver is
/// what matters for them. Any failure (missing binary included) means "no".
fn probe_nvidia_smi() -> bool {
    let Ok(path) = which::which("nvidia-smi") else {
        debug!("nvidia-smi not found on PATH");
        return false;
    };

    match Command::new(path)
        .arg("-L")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) => status.success(),
        Err(e) => {
            debug!("nvidia-smi probe failed: {}", e);
            false
        }
    }
}
