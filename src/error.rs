//! Error taxonomy shared by every component.
//!
//! All fallible core operations return [`OrchestratorError`], which carries a
//! coarse [`ErrorKind`] alongside a stable `code`, a human message, and an
//! actionable hint. Surface adapters map `ErrorKind`/`code` to their own
//! wire-level shape (HTTP status, agent-tool error code); this crate commits
//! to both the kind and the code, since several tool-surface error codes
//! (`FILE_NOT_FOUND` vs `JOB_NOT_FOUND`, `UNSUPPORTED_FORMAT` vs
//! `FILE_TOO_LARGE`) collapse onto the same coarse kind.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse error category, used by both surfaces to pick a response shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or otherwise rejected input; no job was created.
    Validation,
    /// Referenced job, batch, or result does not exist.
    NotFound,
    /// Backpressure: batch too large, no free capacity accepted by policy.
    Capacity,
    /// Failure inside the processing pipeline (engine failure, timeout).
    Processing,
    /// The operation did not complete because it was cancelled.
    Cancelled,
    /// An internal invariant was violated; never expected in normal operation.
    Server,
}

impl ErrorKind {
    /// Advisory HTTP status an HTTP surface adapter might use. Never enforced
    /// here — HTTP framing is out of scope for this crate.
    pub fn http_equivalent(self) -> u16 {
        match self {
            ErrorKind::Validation => 422,
            ErrorKind::NotFound => 404,
            ErrorKind::Capacity => 413,
            ErrorKind::Processing => 500,
            ErrorKind::Cancelled => 409,
            ErrorKind::Server => 500,
        }
    }

    /// Short hint telling the caller what to do about the error.
    pub fn user_action(self) -> &'static str {
        match self {
            ErrorKind::Validation => "verify the request parameters and retry",
            ErrorKind::NotFound => "verify the job or batch id",
            ErrorKind::Capacity => "split the request into smaller batches or retry later",
            ErrorKind::Processing => "inspect the job's error detail; retry may or may not help",
            ErrorKind::Cancelled => "the operation was cancelled; resubmit if still needed",
            ErrorKind::Server => "an internal error occurred; retry later",
        }
    }

    /// Generic code used when a constructor doesn't pick a more specific one.
    fn default_code(self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Capacity => "CAPACITY_ERROR",
            ErrorKind::Processing => "PROCESSING_ERROR",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Server => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Capacity => "capacity",
            ErrorKind::Processing => "processing",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Server => "server",
        };
        f.write_str(s)
    }
}

/// A structured error with a kind, a stable code, a message, and a
/// serializable form suitable for persisting on a failed [`crate::job::Job`].
///
/// `code` defaults to a generic per-kind value (`kind.default_code()`) for
/// constructors that don't need to distinguish further; the named
/// constructors below (`file_not_found`, `unsupported_format`, ...) set the
/// specific agent-tool error code a validation failure maps to.
#[derive(Debug, thiserror::Error, Clone, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct OrchestratorError {
    pub kind: ErrorKind,
    #[serde(default = "default_code_fallback")]
    pub code: String,
    pub message: String,
}

fn default_code_fallback() -> String {
    "INTERNAL_ERROR".to_string()
}

impl OrchestratorError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::coded(kind, kind.default_code(), message)
    }

    pub fn coded(kind: ErrorKind, code: &'static str, message: impl Into<String>) -> Self {
        OrchestratorError {
            kind,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn capacity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Capacity, message)
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Processing, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Server, message)
    }

    /// The referenced audio file does not exist or isn't accessible.
    pub fn file_not_found(message: impl Into<String>) -> Self {
        Self::coded(ErrorKind::NotFound, "FILE_NOT_FOUND", message)
    }

    /// The audio file exists but fails content/format validation.
    pub fn invalid_file(message: impl Into<String>) -> Self {
        Self::coded(ErrorKind::Validation, "INVALID_FILE", message)
    }

    /// The file extension isn't one of the accepted audio formats.
    pub fn unsupported_format(message: impl Into<String>) -> Self {
        Self::coded(ErrorKind::Validation, "UNSUPPORTED_FORMAT", message)
    }

    /// The file exceeds the configured `max_file_size`.
    pub fn file_too_large(message: impl Into<String>) -> Self {
        Self::coded(ErrorKind::Validation, "FILE_TOO_LARGE", message)
    }

    /// A request parameter is missing or malformed.
    pub fn invalid_parameters(message: impl Into<String>) -> Self {
        Self::coded(ErrorKind::Validation, "INVALID_PARAMETERS", message)
    }

    /// The referenced job id has no matching record.
    pub fn job_not_found(message: impl Into<String>) -> Self {
        Self::coded(ErrorKind::NotFound, "JOB_NOT_FOUND", message)
    }

    /// The job completed but its artifact is missing from storage.
    pub fn result_not_found(message: impl Into<String>) -> Self {
        Self::coded(ErrorKind::NotFound, "RESULT_NOT_FOUND", message)
    }

    /// The batch exceeds the maximum file count.
    pub fn batch_too_large(message: impl Into<String>) -> Self {
        Self::coded(ErrorKind::Capacity, "BATCH_TOO_LARGE", message)
    }

    /// Every file in a batch submission failed validation.
    pub fn no_valid_files(message: impl Into<String>) -> Self {
        Self::coded(ErrorKind::Validation, "NO_VALID_FILES", message)
    }

    pub fn user_action(&self) -> &'static str {
        self.kind.user_action()
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
