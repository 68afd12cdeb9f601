//! Typed errors for the acquisition, persistence and webhook pipeline.
//!
//! Every failure reaches the caller as one of these variants so callers can
//! tell "retry later" apart from "fix your input" and "security rejection".

use std::net::IpAddr;

use ipnet::IpNet;
use thiserror::Error;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad input shape. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Portal login failed. Fatal and never retried.
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error(transparent)]
    Ssrf(#[from] SsrfViolation),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// No pending call log matches the callback.
    #[error("stale callback: no pending call matches this correlation token")]
    StaleCallback,

    /// Callback failed secret verification. Deliberately carries no detail.
    #[error("callback rejected")]
    Rejected,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl PipelineError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// True when the same call may succeed later without changing its input.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Acquisition(err) => matches!(err.last_error, PageError::Transport(_)),
            Self::Storage(rusqlite::Error::SqliteFailure(code, _)) => matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Outbound request failure after the retry budget was spent.
#[derive(Debug, Clone, Error)]
#[error("request failed after {attempts} attempt(s): {cause}")]
pub struct TransportError {
    pub cause: TransportCause,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportCause {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("HTTP {status}")]
    Status { status: u16 },

    #[error("request error: {0}")]
    Request(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportCause {
    /// Timeouts, connection problems, 5xx and 429 are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Connect(_) | Self::Request(_) => true,
            Self::Status { status } => *status >= 500 || *status == 429,
            Self::InvalidRequest(_) => false,
        }
    }
}

/// Acquisition gave up. Candidates produced before this point stay valid.
#[derive(Debug, Error)]
#[error("acquisition stopped after {pages_completed} page(s): {last_error}")]
pub struct AcquisitionError {
    pub pages_completed: u32,
    pub last_error: PageError,
}

#[derive(Debug, Error)]
pub enum PageError {
    #[error("page fetch failed: {0}")]
    Transport(#[from] TransportError),

    #[error("page {page} could not be parsed: {reason}")]
    Parse { page: u32, reason: String },
}

/// A webhook destination was refused before any request was issued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("blocked webhook destination: {reason}")]
pub struct SsrfViolation {
    pub reason: SsrfReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SsrfReason {
    #[error("malformed URL: {0}")]
    Malformed(String),

    #[error("scheme `{0}` is not allowed")]
    DisallowedScheme(String),

    #[error("URL has no host")]
    NoHost,

    #[error("DNS resolution failed for {0}")]
    DnsResolution(String),

    #[error("{host} resolves to {ip}, inside blocked range {range}")]
    BlockedAddress { host: String, ip: IpAddr, range: IpNet },
}

impl From<SsrfReason> for SsrfViolation {
    fn from(reason: SsrfReason) -> Self {
        Self { reason }
    }
}

/// A call script references a placeholder with no value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("template placeholder `{{{missing_key}}}` has no value")]
pub struct TemplateError {
    pub missing_key: String,
}
