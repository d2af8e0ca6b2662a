//! # Stage: Mode Routing
//!
//! ## Responsibility
//! Decide which work queue an admitted job goes to, given the mode the caller
//! requested and whether the GPU backend currently reports itself alive.
//!
//! ## Guarantees
//! - Pure: no I/O, no clock, no shared state
//! - Forced `gpu` on an unavailable backend is rejected, never queued
//! - `api` is always routable
//!
//! ## NOT Responsible For
//! - Probing availability (see: `availability`)
//! - Falling back after a job was queued (see: `worker`)

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{BackendKind, Mode};

/// Reason a job could not be routed at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouteRejection {
    /// `gpu` was forced while the GPU backend is known to be down.
    #[error("GPU mode requested but not available. Use /auto or /api instead.")]
    GpuUnavailable,
}

impl RouteRejection {
    /// Machine-readable code surfaced to HTTP clients.
    pub fn code(&self) -> &'static str {
        match self {
            RouteRejection::GpuUnavailable => "GPU_UNAVAILABLE",
        }
    }
}

/// Choose the target queue for a job.
///
/// | requested | gpu_available | outcome              |
/// |-----------|---------------|----------------------|
/// | `gpu`     | `true`        | `gpu`                |
/// | `gpu`     | `false`       | [`RouteRejection`]   |
/// | `api`     | any           | `api`                |
/// | `auto`    | `true`        | `gpu`                |
/// | `auto`    | `false`       | `api`                |
///
/// # Panics
/// This function never panics.
pub fn route(mode_requested: Mode, gpu_available: bool) -> Result<BackendKind, RouteRejection> {
    match (mode_requested, gpu_available) {
        (Mode::Gpu, true) | (Mode::Auto, true) => Ok(BackendKind::Gpu),
        (Mode::Gpu, false) => Err(RouteRejection::GpuUnavailable),
        (Mode::Api, _) | (Mode::Auto, false) => Ok(BackendKind::Api),
    }
}
