//! Error classification types for the status synchronization engine
//!
//! Every failure raised by the remote status store is turned into a
//! [`ClassifiedError`] carrying a kind, a severity, a user-facing message and a
//! retryable flag. The retry controller and the update queue only ever look at
//! these fields to decide between retrying, re-enqueueing and rolling back.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of a classified failure, in classification priority order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connectivity problems between the client and the status store.
    Network,
    /// The request or operation exceeded its deadline.
    Timeout,
    /// Credentials were missing, expired or rejected.
    Authentication,
    /// The status store throttled the caller.
    RateLimit,
    /// An upstream dependency of the status store failed.
    Service,
    /// The caller supplied an invalid entity or status.
    Content,
    /// Anything the classifier could not recognize.
    Unknown,
}

impl ErrorKind {
    /// All kinds, in the order the classifier checks them.
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::Network,
        ErrorKind::Timeout,
        ErrorKind::Authentication,
        ErrorKind::RateLimit,
        ErrorKind::Service,
        ErrorKind::Content,
        ErrorKind::Unknown,
    ];

    /// Whether failures of this kind are worth retrying at all.
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Authentication | ErrorKind::Content)
    }

    /// Default severity for failures of this kind.
    pub fn severity(self) -> ErrorSeverity {
        match self {
            ErrorKind::Content => ErrorSeverity::Low,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::RateLimit | ErrorKind::Unknown => {
                ErrorSeverity::Medium
            }
            ErrorKind::Service => ErrorSeverity::High,
            ErrorKind::Authentication => ErrorSeverity::Critical,
        }
    }

    /// Message suitable for showing to the end user.
    pub fn user_message(self) -> &'static str {
        match self {
            ErrorKind::Network => {
                "Unable to reach the server. Your change will be saved when the connection recovers."
            }
            ErrorKind::Timeout => "The server took too long to respond. Retrying your change.",
            ErrorKind::Authentication => "Your session has expired. Please sign in again.",
            ErrorKind::RateLimit => "Too many changes at once. Your change will be retried shortly.",
            ErrorKind::Service => "The service is temporarily unavailable. Please try again later.",
            ErrorKind::Content => "This change could not be applied to the concern.",
            ErrorKind::Unknown => "Something went wrong while saving your change.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Authentication => "authentication",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Service => "service",
            ErrorKind::Content => "content",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// How bad a failure is from the user's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    /// Cosmetic or caller-side problems.
    Low,
    /// Degraded but recoverable.
    Medium,
    /// The feature is unavailable for now.
    High,
    /// User action is required before anything can succeed.
    Critical,
}

/// A raw failure reported by the remote status store.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RemoteFailure {
    /// Free-form failure message from the transport or the store.
    pub message: String,
    /// HTTP status code, when the failure came from an HTTP response.
    pub status_code: Option<u16>,
}

impl RemoteFailure {
    /// Creates a failure from a message alone.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: None,
        }
    }

    /// Creates a failure that carries an HTTP status code.
    pub fn with_status(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: Some(status_code),
        }
    }

    /// Text inspected by pattern-based classifiers.
    pub fn inspection_text(&self) -> String {
        match self.status_code {
            Some(code) => format!("HTTP {code}: {}", self.message),
            None => self.message.clone(),
        }
    }
}

/// A classified failure with kind, severity, messages and retryability.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    /// The kind of the failure.
    pub kind: ErrorKind,
    /// Severity derived from the kind.
    pub severity: ErrorSeverity,
    /// Technical message, usually the raw failure text.
    pub message: String,
    /// Message suitable for the end user.
    pub user_message: String,
    /// Whether retrying may help.
    pub retryable: bool,
    /// When the failure was classified.
    pub timestamp: DateTime<Utc>,
    /// Additional context as key-value pairs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl ClassifiedError {
    /// Creates a classified error with the defaults of `kind`.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            message: message.into(),
            user_message: kind.user_message().to_string(),
            retryable: kind.is_retryable(),
            timestamp: Utc::now(),
            context: BTreeMap::new(),
        }
    }

    /// Adds a context key-value pair to the error.
    pub fn add_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Overrides the severity.
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Returns true if the failure will never go away by retrying.
    pub fn is_permanent(&self) -> bool {
        !self.retryable
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

impl std::error::Error for ClassifiedError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::Network.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::RateLimit.is_retryable());
        assert!(ErrorKind::Service.is_retryable());
        assert!(ErrorKind::Unknown.is_retryable());
        assert!(!ErrorKind::Authentication.is_retryable());
        assert!(!ErrorKind::Content.is_retryable());
    }

    #[test]
    fn test_severity_mapping() {
        assert_eq!(ErrorKind::Content.severity(), ErrorSeverity::Low);
        assert_eq!(ErrorKind::Network.severity(), ErrorSeverity::Medium);
        assert_eq!(ErrorKind::Service.severity(), ErrorSeverity::High);
        assert_eq!(ErrorKind::Authentication.severity(), ErrorSeverity::Critical);
        assert!(ErrorSeverity::Critical > ErrorSeverity::Low);
    }

    #[test]
    fn test_classified_error_new_uses_kind_defaults() {
        let error = ClassifiedError::new(ErrorKind::Authentication, "token expired");

        assert_eq!(error.kind, ErrorKind::Authentication);
        assert_eq!(error.severity, ErrorSeverity::Critical);
        assert_eq!(error.message, "token expired");
        assert!(error.user_message.contains("sign in"));
        assert!(!error.retryable);
        assert!(error.is_permanent());
        assert!(error.context.is_empty());
    }

    #[test]
    fn test_classified_error_add_context() {
        let error = ClassifiedError::new(ErrorKind::Service, "upstream failed")
            .add_context("status_code", "502")
            .add_context("entity_id", "c1");

        assert_eq!(error.context.len(), 2);
        assert_eq!(error.context.get("status_code"), Some(&"502".to_string()));
    }

    #[test]
    fn test_classified_error_display() {
        let error = ClassifiedError::new(ErrorKind::RateLimit, "slow down");
        assert_eq!(error.to_string(), "rate_limit error: slow down");
    }

    #[test]
    fn test_classified_error_serializes_snake_case() {
        let error = ClassifiedError::new(ErrorKind::RateLimit, "429");
        let json = serde_json::to_value(&error).unwrap();

        assert_eq!(json["kind"], "rate_limit");
        assert_eq!(json["severity"], "medium");
        assert_eq!(json["retryable"], true);
        assert!(json.get("context").is_none());
    }

    #[test]
    fn test_remote_failure_inspection_text() {
        assert_eq!(RemoteFailure::new("boom").inspection_text(), "boom");
        assert_eq!(
            RemoteFailure::with_status(503, "unavailable").inspection_text(),
            "HTTP 503: unavailable"
        );
        assert_eq!(RemoteFailure::new("boom").to_string(), "boom");
    }
}
