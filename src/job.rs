//! # Stage: Job Model
//!
//! ## Responsibility
//! Define the job record, the queue message, the validated chat request and
//! the status state machine shared by admission, workers and the store.
//!
//! ## Guarantees
//! - Status only moves forward: `pending → processing → completed | failed`
//! - `result` and `error` are mutually exclusive and only set in terminal states
//! - `mode_used` is written at most once
//! - Validation happens once, at the edge; everything past [`SubmitRequest::validate`]
//!   works with a [`ChatRequest`] whose fields are in range
//!
//! ## NOT Responsible For
//! - Persistence (see: `store`)
//! - Choosing a backend (see: `router`)

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::router::RouteRejection;
use crate::DispatchError;

/// Inclusive bounds for `max_tokens`.
pub const MAX_TOKENS_RANGE: std::ops::RangeInclusive<u32> = 1..=2048;
/// `max_tokens` used when the caller omits it.
pub const DEFAULT_MAX_TOKENS: u32 = 512;
/// Inclusive bounds for `temperature`.
pub const TEMPERATURE_RANGE: std::ops::RangeInclusive<f32> = 0.0..=1.0;
/// `temperature` used when the caller omits it.
pub const DEFAULT_TEMPERATURE: f32 = 0.6;
/// Longest accepted caller-supplied idempotency key.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 256;

// ── Identifiers and enums ────────────────────────────────────────────────

/// Opaque job identifier, a random v4 UUID assigned at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh random job id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Execution mode requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Let the router pick: GPU when available, API otherwise.
    #[default]
    Auto,
    /// Force the local GPU backend.
    Gpu,
    /// Force the remote API backend.
    Api,
}

impl Mode {
    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Auto => "auto",
            Mode::Gpu => "gpu",
            Mode::Api => "api",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Mode::Auto),
            "gpu" => Ok(Mode::Gpu),
            "api" => Ok(Mode::Api),
            other => Err(DispatchError::Validation(format!(
                "unknown mode '{other}', expected auto, gpu or api"
            ))),
        }
    }
}

/// Concrete execution backend. Also names the work queue feeding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Local accelerator-resident model.
    Gpu,
    /// Remote inference API.
    Api,
}

impl BackendKind {
    /// Lowercase wire name, also used as a metrics label.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Gpu => "gpu",
            BackendKind::Api => "api",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gpu" => Ok(BackendKind::Gpu),
            "api" => Ok(BackendKind::Api),
            other => Err(DispatchError::Validation(format!(
                "unknown backend '{other}', expected gpu or api"
            ))),
        }
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Admitted and queued, not yet picked up.
    Pending,
    /// A worker owns the job and is invoking a backend.
    Processing,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
}

impl JobStatus {
    /// `true` for `completed` and `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether a record in `self` may be written with status `next`.
    ///
    /// Self-transitions of the non-terminal states are allowed: a pending job
    /// is re-stamped when it falls back to the API queue, and a processing job
    /// is re-stamped when a redelivered message is picked up again.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Pending)
                | (Pending, Processing)
                | (Pending, Failed)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }

    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status change the record refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// The transition would move status backwards or out of a terminal state.
    #[error("job {job_id}: illegal transition {from} -> {to}")]
    Illegal {
        /// Job whose record rejected the change.
        job_id: JobId,
        /// Status before the attempted change.
        from: JobStatus,
        /// Status that was requested.
        to: JobStatus,
    },

    /// `mode_used` was already recorded with a different backend.
    #[error("job {job_id}: mode_used already set to {existing}, refusing {requested}")]
    ModeAlreadySet {
        /// Job whose record rejected the change.
        job_id: JobId,
        /// Backend already recorded.
        existing: BackendKind,
        /// Backend that was requested.
        requested: BackendKind,
    },

    /// The single GPU→API fallback hop was already taken.
    #[error("job {0}: fallback already attempted")]
    FallbackExhausted(JobId),
}

// ── Requests ─────────────────────────────────────────────────────────────

/// Raw chat submission as it arrives over HTTP.
///
/// Every tunable is optional here; [`SubmitRequest::validate`] applies the
/// defaults and bounds and produces a [`ChatRequest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// User prompt.
    pub message: String,
    /// Generation length cap, 1..=2048.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Sampling temperature, 0.0..=1.0.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Enable the backend's reasoning mode.
    #[serde(default)]
    pub use_reasoning: Option<bool>,
    /// Caller-chosen deduplication token.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl SubmitRequest {
    /// Convenience constructor for a bare prompt with all defaults.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    /// Attach an idempotency key.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Apply defaults and enforce field bounds.
    ///
    /// # Returns
    /// - `Ok((request, key))` with the typed request and the caller's key, if any
    /// - `Err(DispatchError::Validation)` naming the first offending field
    ///
    /// # Panics
    /// This function never panics.
    pub fn validate(self) -> Result<(ChatRequest, Option<String>), DispatchError> {
        if self.message.trim().is_empty() {
            return Err(DispatchError::Validation(
                "message must not be empty".to_string(),
            ));
        }

        let max_tokens = self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        if !MAX_TOKENS_RANGE.contains(&max_tokens) {
            return Err(DispatchError::Validation(format!(
                "max_tokens must be between {} and {}, got {max_tokens}",
                MAX_TOKENS_RANGE.start(),
                MAX_TOKENS_RANGE.end()
            )));
        }

        let temperature = self.temperature.unwrap_or(DEFAULT_TEMPERATURE);
        if !TEMPERATURE_RANGE.contains(&temperature) {
            return Err(DispatchError::Validation(format!(
                "temperature must be between {} and {}, got {temperature}",
                TEMPERATURE_RANGE.start(),
                TEMPERATURE_RANGE.end()
            )));
        }

        if let Some(key) = &self.idempotency_key {
            if key.trim().is_empty() {
                return Err(DispatchError::Validation(
                    "idempotency_key must not be empty when supplied".to_string(),
                ));
            }
            if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
                return Err(DispatchError::Validation(format!(
                    "idempotency_key must be at most {MAX_IDEMPOTENCY_KEY_LEN} bytes"
                )));
            }
        }

        Ok((
            ChatRequest {
                message: self.message,
                max_tokens,
                temperature,
                use_reasoning: self.use_reasoning.unwrap_or(false),
            },
            self.idempotency_key,
        ))
    }
}

/// Validated chat request carried on the queue and handed to backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// User prompt, non-empty.
    pub message: String,
    /// Generation length cap.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Enable the backend's reasoning mode.
    pub use_reasoning: bool,
}

impl ChatRequest {
    /// Build a request with default tunables. Does not validate.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            use_reasoning: false,
        }
    }
}

// ── Record and message ───────────────────────────────────────────────────

/// Output of a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    /// Generated text.
    pub response: String,
    /// Backend that produced it.
    pub mode: BackendKind,
    /// Wall-clock backend latency, rounded to two decimals.
    pub latency_ms: f64,
}

impl JobResult {
    /// Build a result, rounding `latency_ms` to two decimals.
    pub fn new(response: impl Into<String>, mode: BackendKind, latency_ms: f64) -> Self {
        Self {
            response: response.into(),
            mode,
            latency_ms: (latency_ms * 100.0).round() / 100.0,
        }
    }
}

/// Durable state of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Immutable id.
    pub job_id: JobId,
    /// Key under which the job was admitted.
    pub idempotency_key: String,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Admission time.
    pub created_at: DateTime<Utc>,
    /// Time of the latest write.
    pub updated_at: DateTime<Utc>,
    /// Mode the caller asked for.
    pub mode_requested: Mode,
    /// Backend that executed the job, once known.
    #[serde(default)]
    pub mode_used: Option<BackendKind>,
    /// Whether the GPU→API hop has been taken.
    #[serde(default)]
    pub fallback_attempted: bool,
    /// Present only when `completed`.
    #[serde(default)]
    pub result: Option<JobResult>,
    /// Present only when `failed`.
    #[serde(default)]
    pub error: Option<String>,
    /// Set when admission refused to route the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<RouteRejection>,
}

impl JobRecord {
    /// Fresh `pending` record.
    pub fn new(job_id: JobId, idempotency_key: impl Into<String>, mode_requested: Mode) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            idempotency_key: idempotency_key.into(),
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            mode_requested,
            mode_used: None,
            fallback_attempted: false,
            result: None,
            error: None,
            rejection: None,
        }
    }

    fn advance(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::Illegal {
                job_id: self.job_id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    fn set_mode_used(&mut self, backend: BackendKind) -> Result<(), TransitionError> {
        match self.mode_used {
            Some(existing) if existing != backend => Err(TransitionError::ModeAlreadySet {
                job_id: self.job_id,
                existing,
                requested: backend,
            }),
            _ => {
                self.mode_used = Some(backend);
                Ok(())
            }
        }
    }

    /// A worker has taken the job.
    pub fn mark_processing(&mut self) -> Result<(), TransitionError> {
        self.advance(JobStatus::Processing)
    }

    /// Record a successful backend result.
    pub fn complete(&mut self, result: JobResult) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(JobStatus::Completed) {
            return Err(TransitionError::Illegal {
                job_id: self.job_id,
                from: self.status,
                to: JobStatus::Completed,
            });
        }
        self.set_mode_used(result.mode)?;
        self.advance(JobStatus::Completed)?;
        self.result = Some(result);
        self.error = None;
        Ok(())
    }

    /// Record a terminal failure. `backend` is the backend that was invoked,
    /// or `None` when the job never reached one.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        backend: Option<BackendKind>,
    ) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(JobStatus::Failed) {
            return Err(TransitionError::Illegal {
                job_id: self.job_id,
                from: self.status,
                to: JobStatus::Failed,
            });
        }
        if let Some(backend) = backend {
            self.set_mode_used(backend)?;
        }
        self.advance(JobStatus::Failed)?;
        self.error = Some(error.into());
        self.result = None;
        Ok(())
    }

    /// Fail a job admission could not route.
    pub fn reject(&mut self, rejection: RouteRejection) -> Result<(), TransitionError> {
        self.fail(rejection.to_string(), None)?;
        self.rejection = Some(rejection);
        Ok(())
    }

    /// Take the single GPU→API hop. Status is re-stamped, never regressed.
    pub fn record_fallback(&mut self) -> Result<(), TransitionError> {
        if self.fallback_attempted {
            return Err(TransitionError::FallbackExhausted(self.job_id));
        }
        let current = self.status;
        self.advance(current)?;
        self.fallback_attempted = true;
        Ok(())
    }
}

/// Payload published on a work queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    /// Job this message drives.
    pub job_id: JobId,
    /// Validated chat request.
    pub request: ChatRequest,
    /// Mode the caller asked for.
    pub mode_requested: Mode,
    /// `true` only on the single fallback republish.
    #[serde(default)]
    pub fallback_attempted: bool,
}

impl JobMessage {
    /// First-publish message for an admitted job.
    pub fn new(job_id: JobId, request: ChatRequest, mode_requested: Mode) -> Self {
        Self {
            job_id,
            request,
            mode_requested,
            fallback_attempted: false,
        }
    }

    /// Whether a GPU worker may still reroute this message to the API queue.
    pub fn can_fall_back(&self) -> bool {
        self.mode_requested == Mode::Auto && !self.fallback_attempted
    }

    /// Copy for the fallback republish, with the flag set.
    pub fn into_fallback(self) -> Self {
        Self {
            fallback_attempted: true,
            ..self
        }
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a wire payload.
    pub fn decode(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> JobRecord {
        JobRecord::new(JobId::new(), "key-1", Mode::Auto)
    }

    #[test]
    fn test_reject_fails_and_keeps_reason() {
        let mut r = JobRecord::new(JobId::new(), "key-1", Mode::Gpu);
        r.reject(RouteRejection::GpuUnavailable).expect("test: reject");
        assert_eq!(r.status, JobStatus::Failed);
        assert_eq!(r.rejection, Some(RouteRejection::GpuUnavailable));
        assert!(r.mode_used.is_none());

        let json = serde_json::to_value(&r).expect("test: encode");
        assert_eq!(json["rejection"], "GPU_UNAVAILABLE");
        let back: JobRecord = serde_json::from_value(json).expect("test: decode");
        assert_eq!(back, r);
    }

    // ── Validation ──────────────────────────────────────────────────

    #[test]
    fn test_validate_applies_defaults() {
        let (req, key) = SubmitRequest::new("hello").validate().expect("test: valid");
        assert_eq!(req.max_tokens, DEFAULT_MAX_TOKENS);
        assert!((req.temperature - DEFAULT_TEMPERATURE).abs() < f32::EPSILON);
        assert!(!req.use_reasoning);
        assert!(key.is_none());
    }

    #[test]
    fn test_validate_whitespace_message_rejected() {
        let err = SubmitRequest::new("   \n").validate().unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }

    #[test]
    fn test_validate_max_tokens_zero_rejected() {
        let mut req = SubmitRequest::new("hi");
        req.max_tokens = Some(0);
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_validate_max_tokens_upper_bound_accepted() {
        let mut req = SubmitRequest::new("hi");
        req.max_tokens = Some(2048);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_validate_max_tokens_above_bound_rejected() {
        let mut req = SubmitRequest::new("hi");
        req.max_tokens = Some(2049);
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_validate_temperature_out_of_range_rejected() {
        let mut req = SubmitRequest::new("hi");
        req.temperature = Some(1.5);
        assert!(req.validate().is_err());
        let mut req = SubmitRequest::new("hi");
        req.temperature = Some(-0.1);
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_validate_temperature_nan_rejected() {
        let mut req = SubmitRequest::new("hi");
        req.temperature = Some(f32::NAN);
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_validate_empty_idempotency_key_rejected() {
        let req = SubmitRequest::new("hi").with_idempotency_key("");
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_validate_long_idempotency_key_rejected() {
        let req = SubmitRequest::new("hi").with_idempotency_key("k".repeat(257));
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_validate_keeps_supplied_key() {
        let (_, key) = SubmitRequest::new("hi")
            .with_idempotency_key("abc")
            .validate()
            .expect("test: valid");
        assert_eq!(key.as_deref(), Some("abc"));
    }

    // ── Enums ───────────────────────────────────────────────────────

    #[test]
    fn test_mode_from_str_case_insensitive() {
        assert_eq!("GPU".parse::<Mode>().expect("test: mode"), Mode::Gpu);
        assert!("cpu".parse::<Mode>().is_err());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&JobStatus::Processing).expect("test: serialize");
        assert_eq!(json, "\"processing\"");
    }

    #[test]
    fn test_terminal_states_admit_no_transition() {
        for terminal in [JobStatus::Completed, JobStatus::Failed] {
            for next in [
                JobStatus::Pending,
                JobStatus::Processing,
                JobStatus::Completed,
                JobStatus::Failed,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_processing_cannot_regress_to_pending() {
        assert!(!JobStatus::Processing.can_transition_to(JobStatus::Pending));
    }

    #[test]
    fn test_pending_cannot_complete_directly() {
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
    }

    // ── Record transitions ──────────────────────────────────────────

    #[test]
    fn test_record_happy_path() {
        let mut rec = record();
        rec.mark_processing().expect("test: processing");
        rec.complete(JobResult::new("hi", BackendKind::Gpu, 12.345))
            .expect("test: complete");
        assert_eq!(rec.status, JobStatus::Completed);
        assert_eq!(rec.mode_used, Some(BackendKind::Gpu));
        assert!(rec.error.is_none());
        assert_eq!(rec.result.as_ref().map(|r| r.latency_ms), Some(12.35));
    }

    #[test]
    fn test_record_complete_twice_rejected() {
        let mut rec = record();
        rec.mark_processing().expect("test: processing");
        rec.complete(JobResult::new("a", BackendKind::Api, 1.0))
            .expect("test: complete");
        let err = rec
            .complete(JobResult::new("b", BackendKind::Api, 1.0))
            .unwrap_err();
        assert!(matches!(err, TransitionError::Illegal { .. }));
        assert_eq!(rec.result.as_ref().map(|r| r.response.as_str()), Some("a"));
    }

    #[test]
    fn test_record_fail_from_pending_without_backend() {
        let mut rec = record();
        rec.fail("gpu unavailable", None).expect("test: fail");
        assert_eq!(rec.status, JobStatus::Failed);
        assert!(rec.mode_used.is_none());
        assert!(rec.result.is_none());
    }

    #[test]
    fn test_record_mode_used_set_once() {
        let mut rec = record();
        rec.mode_used = Some(BackendKind::Gpu);
        rec.mark_processing().expect("test: processing");
        let err = rec
            .complete(JobResult::new("x", BackendKind::Api, 1.0))
            .unwrap_err();
        assert!(matches!(err, TransitionError::ModeAlreadySet { .. }));
        assert_eq!(rec.status, JobStatus::Processing);
    }

    #[test]
    fn test_record_fallback_only_once() {
        let mut rec = record();
        rec.record_fallback().expect("test: first fallback");
        assert!(rec.fallback_attempted);
        assert_eq!(rec.status, JobStatus::Pending);
        assert!(matches!(
            rec.record_fallback(),
            Err(TransitionError::FallbackExhausted(_))
        ));
    }

    #[test]
    fn test_record_fallback_after_terminal_rejected() {
        let mut rec = record();
        rec.fail("boom", None).expect("test: fail");
        assert!(rec.record_fallback().is_err());
    }

    // ── Message ─────────────────────────────────────────────────────

    #[test]
    fn test_message_fallback_rules() {
        let msg = JobMessage::new(JobId::new(), ChatRequest::new("hi"), Mode::Auto);
        assert!(msg.can_fall_back());
        let fallback = msg.into_fallback();
        assert!(fallback.fallback_attempted);
        assert!(!fallback.can_fall_back());

        let forced = JobMessage::new(JobId::new(), ChatRequest::new("hi"), Mode::Gpu);
        assert!(!forced.can_fall_back());
    }

    #[test]
    fn test_message_decode_missing_flag_defaults_false() {
        let id = JobId::new();
        let payload = format!(
            r#"{{"job_id":"{id}","request":{{"message":"m","max_tokens":5,"temperature":0.1,"use_reasoning":false}},"mode_requested":"auto"}}"#
        );
        let msg = JobMessage::decode(&payload).expect("test: decode");
        assert_eq!(msg.job_id, id);
        assert!(!msg.fallback_attempted);
    }
}
