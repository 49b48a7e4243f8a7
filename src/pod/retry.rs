//! Idempotent-retry support for the pod exec engine.
//!
//! `RetryContext` is a 0-indexed attempt counter with exponential backoff
//! and jitter capped at `max_delay`. `kube`'s websocket transport doesn't
//! expose a rich exception hierarchy, so `ExecTransportError` is a small
//! classification enum the exec engine maps its `kube::Error` faults onto
//! before calling `is_retryable_error`.

use std::time::Duration;

use rand::Rng;
use uuid::Uuid;

pub const MAX_RETRIES: u32 = 3;
pub const BASE_DELAY: Duration = Duration::from_secs(1);
pub const MAX_DELAY: Duration = Duration::from_secs(10);

/// Tracks retry attempts with exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    attempt: u32,
}

impl Default for RetryContext {
    fn default() -> Self {
        RetryContext {
            max_retries: MAX_RETRIES,
            base_delay: BASE_DELAY,
            max_delay: MAX_DELAY,
            attempt: 0,
        }
    }
}

impl RetryContext {
    pub fn should_retry(&self) -> bool {
        self.attempt < self.max_retries
    }

    pub fn increment(&mut self) {
        self.attempt += 1;
    }

    /// `base_delay * 2^(attempt-1) + U(0, delay)`, capped at `max_delay`.
    pub fn delay(&self) -> Duration {
        if self.attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = self.attempt - 1;
        let base = self.base_delay.as_secs_f64() * 2f64.powi(exponent as i32);
        let jitter = rand::rng().random_range(0.0..=base.max(0.0));
        let total = (base + jitter).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(total.max(0.0))
    }
}

/// Classification of a websocket/transport fault surfaced by the exec
/// engine, mapped onto `kube`'s error types at the call site.
#[derive(Debug, Clone)]
pub enum ExecTransportError {
    ConnectionClosed,
    SslEof,
    BadStatus { status_code: u16, message: String },
    Other(String),
}

/// Determines whether `error` is a transient connection error safe to
/// retry.
pub fn is_retryable_error(error: Option<&ExecTransportError>) -> bool {
    match error {
        None => false,
        Some(ExecTransportError::ConnectionClosed) => true,
        Some(ExecTransportError::SslEof) => true,
        Some(ExecTransportError::BadStatus { status_code, message }) => {
            let lower = message.to_lowercase();
            if lower.contains("pod does not exist") || lower.contains("container not found") {
                return false;
            }
            *status_code >= 500
        }
        Some(ExecTransportError::Other(_)) => false,
    }
}

/// Generates a fresh execution id for an exec attempt.
pub fn generate_execution_id() -> String {
    Uuid::new_v4().to_string()
}

/// The in-pod marker/status file paths for an execution id.
pub fn marker_paths(execution_id: &str) -> (String, String) {
    (
        format!("/tmp/.k8s_exec_{execution_id}.marker"),
        format!("/tmp/.k8s_exec_{execution_id}.status"),
    )
}

/// State of a command execution as inferred from marker/status file probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    NotStarted,
    Started,
    Completed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification_rules() {
        assert!(is_retryable_error(Some(&ExecTransportError::ConnectionClosed)));
        assert!(is_retryable_error(Some(&ExecTransportError::SslEof)));
        assert!(is_retryable_error(Some(&ExecTransportError::BadStatus {
            status_code: 503,
            message: "internal error".into()
        })));
        assert!(!is_retryable_error(Some(&ExecTransportError::BadStatus {
            status_code: 503,
            message: "pod does not exist".into()
        })));
        assert!(!is_retryable_error(Some(&ExecTransportError::BadStatus {
            status_code: 503,
            message: "container not found".into()
        })));
        assert!(!is_retryable_error(Some(&ExecTransportError::BadStatus {
            status_code: 404,
            message: "not found".into()
        })));
        assert!(!is_retryable_error(Some(&ExecTransportError::Other("boom".into()))));
        assert!(!is_retryable_error(None));
    }

    #[test]
    fn retry_context_respects_max_retries() {
        let mut ctx = RetryContext::default();
        let mut attempts = 0;
        while ctx.should_retry() {
            ctx.increment();
            attempts += 1;
        }
        assert_eq!(attempts, MAX_RETRIES);
    }

    #[test]
    fn delay_grows_and_is_capped() {
        let mut ctx = RetryContext::default();
        ctx.increment();
        let first = ctx.delay();
        assert!(first.as_secs_f64() <= ctx.base_delay.as_secs_f64() * 2.0);
        for _ in 0..10 {
            ctx.increment();
        }
        assert!(ctx.delay() <= ctx.max_delay);
    }

    #[test]
    fn marker_paths_use_execution_id() {
        let (marker, status) = marker_paths("abc123");
        assert_eq!(marker, "/tmp/.k8s_exec_abc123.marker");
        assert_eq!(status, "/tmp/.k8s_exec_abc123.status");
    }
}
