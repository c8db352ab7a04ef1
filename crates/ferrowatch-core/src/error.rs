use thiserror::Error;

use crate::throttling::ThrottleError;

/// Validation and contract errors exposed by `ferrowatch-core`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("timestamp must be RFC3339 UTC (suffix Z): '{value}'")]
    TimestampNotUtc { value: String },

    #[error("invalid subject key '{value}', expected user:<id>, faction:<id> or item:<id>")]
    InvalidSubjectKey { value: String },
    #[error("invalid field kind '{value}'")]
    InvalidFieldKind { value: String },
    #[error("invalid alert class '{value}', expected price_alert or chain_timeout")]
    InvalidAlertClass { value: String },
    #[error("invalid policy kind '{value}'")]
    InvalidPolicyKind { value: String },

    #[error("rate limiter capacity must be greater than zero")]
    ZeroCapacity,
    #[error("rate limiter window must be greater than zero")]
    ZeroWindow,
    #[error("request must include at least one selection")]
    EmptySelections,
}

/// Errors surfaced by the synchronization substrate.
///
/// Every variant is caught at the subject or cycle boundary; none is fatal to
/// the process.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Upstream reported that the call budget is exhausted.
    #[error("partner API rate limited: {message}")]
    RateLimited { message: String },

    /// Any other upstream failure (4xx/5xx, partner error codes, transport).
    #[error("partner API error{}: {message}", .code.map(|code| format!(" {code}")).unwrap_or_default())]
    Upstream {
        code: Option<u32>,
        message: String,
        credential_rejected: bool,
    },

    #[error("outbound call timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// Raw payload could not be mapped to cached fields.
    #[error("transform failed: {0}")]
    Transform(String),

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("alert delivery failed: {0}")]
    Delivery(String),

    #[error(transparent)]
    Backpressure(#[from] ThrottleError),

    #[error("job registry error: {0}")]
    Registry(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl SyncError {
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
        }
    }

    pub fn upstream(code: Option<u32>, message: impl Into<String>) -> Self {
        Self::Upstream {
            code,
            message: message.into(),
            credential_rejected: false,
        }
    }

    pub fn credential_rejected(code: u32, message: impl Into<String>) -> Self {
        Self::Upstream {
            code: Some(code),
            message: message.into(),
            credential_rejected: true,
        }
    }

    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub const fn is_credential_rejected(&self) -> bool {
        matches!(
            self,
            Self::Upstream {
                credential_rejected: true,
                ..
            }
        )
    }

    pub const fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "sync.rate_limited",
            Self::Upstream { .. } => "sync.upstream",
            Self::Timeout { .. } => "sync.timeout",
            Self::Transform(_) => "sync.transform",
            Self::Persistence(_) => "sync.persistence",
            Self::Delivery(_) => "sync.delivery",
            Self::Backpressure(_) => "sync.backpressure",
            Self::Registry(_) => "sync.registry",
            Self::Validation(_) => "sync.validation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_display_includes_code_when_present() {
        let error = SyncError::upstream(Some(7), "incorrect ID-entity relation");
        assert_eq!(
            error.to_string(),
            "partner API error 7: incorrect ID-entity relation"
        );

        let error = SyncError::upstream(None, "HTTP 502");
        assert_eq!(error.to_string(), "partner API error: HTTP 502");
    }

    #[test]
    fn classification_helpers() {
        assert!(SyncError::rate_limited("too many requests").is_rate_limited());
        assert!(!SyncError::Timeout { timeout_ms: 10 }.is_rate_limited());
        assert!(SyncError::credential_rejected(2, "incorrect key").is_credential_rejected());
        assert_eq!(
            SyncError::Backpressure(ThrottleError::QueueFull { max_queue: 4 }).code(),
            "sync.backpressure"
        );
    }
}
