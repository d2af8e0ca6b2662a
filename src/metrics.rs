//! Prometheus metrics for job admission and execution.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The helper functions
//! (`inc_submitted`, `inc_finished`, …) are no-ops if `init_metrics` was never
//! called, so admission and workers are always safe to run and observability
//! simply degrades.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `dispatch_jobs_submitted_total` | Counter | `mode` |
//! | `dispatch_jobs_deduplicated_total` | Counter | |
//! | `dispatch_jobs_rejected_total` | Counter | `reason` |
//! | `dispatch_jobs_finished_total` | Counter | `backend`, `status` |
//! | `dispatch_fallbacks_total` | Counter | |
//! | `dispatch_inference_duration_seconds` | Histogram | `backend` |
//! | `dispatch_queue_depth` | Gauge | `queue` |

use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    core::Collector, CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, IntGaugeVec,
    Opts, Registry, TextEncoder,
};

use crate::DispatchError;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All dispatch metrics, stored in a single [`OnceLock`] and initialised
/// together.
pub struct Metrics {
    /// Registry that owns all metric descriptors.
    pub registry: Registry,
    /// Jobs admitted, by requested mode.
    pub jobs_submitted: CounterVec,
    /// Submissions answered from an existing idempotency key.
    pub jobs_deduplicated: IntCounter,
    /// Submissions rejected at admission, by reason code.
    pub jobs_rejected: CounterVec,
    /// Terminal writes, by backend and status.
    pub jobs_finished: CounterVec,
    /// GPU→API fallback republishes.
    pub fallbacks: IntCounter,
    /// Backend invocation latency.
    pub inference_duration: HistogramVec,
    /// Ready messages per queue, sampled on scrape.
    pub queue_depth: IntGaugeVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn register<C>(registry: &Registry, collector: C) -> Result<C, DispatchError>
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| DispatchError::Other(format!("metrics registration failed: {e}")))?;
    Ok(collector)
}

fn build_metrics() -> Result<Metrics, DispatchError> {
    let init_err = |e: prometheus::Error| DispatchError::Other(format!("metrics init failed: {e}"));
    let registry = Registry::new();

    let jobs_submitted = register(
        &registry,
        CounterVec::new(
            Opts::new("dispatch_jobs_submitted_total", "Jobs admitted"),
            &["mode"],
        )
        .map_err(init_err)?,
    )?;
    let jobs_deduplicated = register(
        &registry,
        IntCounter::new(
            "dispatch_jobs_deduplicated_total",
            "Submissions answered from an existing idempotency key",
        )
        .map_err(init_err)?,
    )?;
    let jobs_rejected = register(
        &registry,
        CounterVec::new(
            Opts::new("dispatch_jobs_rejected_total", "Submissions rejected at admission"),
            &["reason"],
        )
        .map_err(init_err)?,
    )?;
    let jobs_finished = register(
        &registry,
        CounterVec::new(
            Opts::new("dispatch_jobs_finished_total", "Terminal job writes"),
            &["backend", "status"],
        )
        .map_err(init_err)?,
    )?;
    let fallbacks = register(
        &registry,
        IntCounter::new("dispatch_fallbacks_total", "GPU to API fallback republishes")
            .map_err(init_err)?,
    )?;
    let inference_duration = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                "dispatch_inference_duration_seconds",
                "Backend invocation latency",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
            &["backend"],
        )
        .map_err(init_err)?,
    )?;
    let queue_depth = register(
        &registry,
        IntGaugeVec::new(
            Opts::new("dispatch_queue_depth", "Ready messages per queue"),
            &["queue"],
        )
        .map_err(init_err)?,
    )?;

    Ok(Metrics {
        registry,
        jobs_submitted,
        jobs_deduplicated,
        jobs_rejected,
        jobs_finished,
        fallbacks,
        inference_duration,
        queue_depth,
    })
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`DispatchError::Other`] if metric construction or registration
/// fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), DispatchError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    // A racing initialiser builds identical descriptors; first one wins.
    let _ = METRICS.set(build_metrics()?);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count an admitted job.
pub fn inc_submitted(mode: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.jobs_submitted.get_metric_with_label_values(&[mode]) {
            c.inc();
        }
    }
}

/// Count a deduplicated submission.
pub fn inc_deduplicated() {
    if let Some(m) = metrics() {
        m.jobs_deduplicated.inc();
    }
}

/// Count a submission rejected at admission.
pub fn inc_rejected(reason: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.jobs_rejected.get_metric_with_label_values(&[reason]) {
            c.inc();
        }
    }
}

/// Count a terminal write.
///
/// # Panics
///
/// This function never panics.
pub fn inc_finished(backend: &str, status: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.jobs_finished.get_metric_with_label_values(&[backend, status]) {
            c.inc();
        }
    }
}

/// Count a GPU→API fallback.
pub fn inc_fallback() {
    if let Some(m) = metrics() {
        m.fallbacks.inc();
    }
}

/// Record one backend invocation's latency.
pub fn record_inference_latency(backend: &str, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.inference_duration.get_metric_with_label_values(&[backend]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Set the sampled depth of a queue.
pub fn set_queue_depth(queue: &str, depth: usize) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.queue_depth.get_metric_with_label_values(&[queue]) {
            g.set(i64::try_from(depth).unwrap_or(i64::MAX));
        }
    }
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    let families = m.registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
