//! Pattern-based classifier for remote status store failures
//!
//! The classifier inspects the failure text (prefixed with the HTTP status code
//! when one is known) against an ordered list of regex patterns. Patterns are
//! grouped by [`ErrorKind`] in priority order, so the first matching pattern
//! decides the kind. Anything unmatched is classified as [`ErrorKind::Unknown`].

use regex::Regex;

use super::{ClassifiedError, ErrorKind, RemoteFailure};

/// Turns raw remote failures into [`ClassifiedError`]s.
///
/// Implementations must be total: every input yields a classification.
pub trait Classify: Send + Sync {
    /// Classifies a failure reported by the remote status store.
    fn classify(&self, failure: &RemoteFailure) -> ClassifiedError;
}

/// A pattern for matching failure text.
#[derive(Debug)]
pub struct ErrorPattern {
    regex: Regex,
    kind: ErrorKind,
    description: String,
}

impl ErrorPattern {
    /// Creates a new error pattern.
    ///
    /// # Panics
    /// Panics if the regex pattern is invalid. Use [`ErrorPattern::try_new`] for
    /// patterns that are not known at compile time.
    pub fn new(pattern: &str, kind: ErrorKind, description: impl Into<String>) -> Self {
        Self::try_new(pattern, kind, description).expect("Invalid regex pattern")
    }

    /// Creates a new error pattern, reporting an invalid regex as an error.
    pub fn try_new(
        pattern: &str,
        kind: ErrorKind,
        description: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
            kind,
            description: description.into(),
        })
    }

    /// Returns the regex pattern.
    pub fn regex(&self) -> &Regex {
        &self.regex
    }

    /// Returns the kind assigned on match.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Finds the first match in the text and returns the matched string.
    pub fn find<'a>(&self, text: &'a str) -> Option<&'a str> {
        self.regex.find(text).map(|m| m.as_str())
    }
}

/// Default [`Classify`] implementation backed by ordered regex patterns.
#[derive(Debug)]
pub struct ErrorClassifier {
    patterns: Vec<ErrorPattern>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier {
    /// Creates a classifier with the built-in patterns.
    pub fn new() -> Self {
        Self {
            patterns: Self::default_patterns(),
        }
    }

    /// Creates a classifier with custom patterns only.
    pub fn with_patterns(patterns: Vec<ErrorPattern>) -> Self {
        Self { patterns }
    }

    fn default_patterns() -> Vec<ErrorPattern> {
        vec![
            // Network
            ErrorPattern::new(
                r"(?i)network\s*(error|failure|request\s*failed)",
                ErrorKind::Network,
                "Network error",
            ),
            ErrorPattern::new(r"(?i)failed\s*to\s*fetch", ErrorKind::Network, "Fetch failed"),
            ErrorPattern::new(
                r"(?i)connection\s*(refused|reset|closed|aborted|lost)",
                ErrorKind::Network,
                "Connection error",
            ),
            ErrorPattern::new(
                r"(?i)\b(econnrefused|econnreset|enotfound|ehostunreach|enetunreach)\b",
                ErrorKind::Network,
                "Socket error",
            ),
            ErrorPattern::new(r"(?i)\boffline\b", ErrorKind::Network, "Client offline"),
            // Timeout
            ErrorPattern::new(r"(?i)time[sd]?[\s\-]?out", ErrorKind::Timeout, "Timed out"),
            ErrorPattern::new(
                r"(?i)deadline\s*(exceeded|expired)",
                ErrorKind::Timeout,
                "Deadline exceeded",
            ),
            ErrorPattern::new(r"\b(408|504)\b", ErrorKind::Timeout, "HTTP timeout status"),
            // Authentication
            ErrorPattern::new(
                r"(?i)\bunauthori[sz]ed\b",
                ErrorKind::Authentication,
                "Unauthorized",
            ),
            ErrorPattern::new(
                r"(?i)auth(entication)?\s*(failed|error|required)",
                ErrorKind::Authentication,
                "Authentication failed",
            ),
            ErrorPattern::new(
                r"(?i)invalid\s*(api\s*)?(token|key|credentials)",
                ErrorKind::Authentication,
                "Invalid credentials",
            ),
            ErrorPattern::new(
                r"(?i)(session|token|jwt)\s*(has\s*)?expired",
                ErrorKind::Authentication,
                "Expired session",
            ),
            ErrorPattern::new(
                r"(?i)forbidden|permission\s*denied",
                ErrorKind::Authentication,
                "Access denied",
            ),
            ErrorPattern::new(
                r"\b40[13]\b",
                ErrorKind::Authentication,
                "HTTP 401/403",
            ),
            // Rate limit
            ErrorPattern::new(r"\b429\b", ErrorKind::RateLimit, "HTTP 429"),
            ErrorPattern::new(r"(?i)rate[\s\-_]?limit", ErrorKind::RateLimit, "Rate limited"),
            ErrorPattern::new(
                r"(?i)too\s+many\s+requests",
                ErrorKind::RateLimit,
                "Too many requests",
            ),
            ErrorPattern::new(
                r"(?i)quota\s*(exceeded|exhausted)|throttl",
                ErrorKind::RateLimit,
                "Quota exhausted",
            ),
            // Upstream service
            ErrorPattern::new(
                r"(?i)service\s*unavailable|bad\s*gateway|internal\s*server\s*error",
                ErrorKind::Service,
                "Service unavailable",
            ),
            ErrorPattern::new(
                r"(?i)upstream|database\s*(error|unavailable)",
                ErrorKind::Service,
                "Upstream failure",
            ),
            ErrorPattern::new(r"\b5[0-9]{2}\b", ErrorKind::Service, "HTTP 5xx"),
            // Caller-supplied content
            ErrorPattern::new(
                r"(?i)invalid\s*(status|input|request|payload|entity)",
                ErrorKind::Content,
                "Invalid input",
            ),
            ErrorPattern::new(
                r"(?i)validation\s*(failed|error)|bad\s*request|not\s*found",
                ErrorKind::Content,
                "Rejected input",
            ),
            ErrorPattern::new(r"\b(400|404|409|422)\b", ErrorKind::Content, "HTTP 4xx"),
        ]
    }

    /// Adds a custom pattern; it is checked after the existing ones.
    pub fn add_pattern(&mut self, pattern: ErrorPattern) {
        self.patterns.push(pattern);
    }

    /// Returns the number of patterns configured.
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Returns all configured patterns.
    pub fn patterns(&self) -> &[ErrorPattern] {
        &self.patterns
    }

    /// Classifies free-form failure text.
    pub fn classify_text(&self, text: &str) -> ClassifiedError {
        for kind in ErrorKind::ALL {
            let hit = self
                .patterns
                .iter()
                .filter(|pattern| pattern.kind == kind)
                .find_map(|pattern| pattern.find(text).map(|matched| (pattern, matched)));

            if let Some((pattern, matched)) = hit {
                return ClassifiedError::new(kind, text)
                    .add_context("pattern", pattern.description.clone())
                    .add_context("matched", matched);
            }
        }
        ClassifiedError::new(ErrorKind::Unknown, text)
    }
}

impl Classify for ErrorClassifier {
    fn classify(&self, failure: &RemoteFailure) -> ClassifiedError {
        let mut error = self.classify_text(&failure.inspection_text());
        error.message = failure.message.clone();
        match failure.status_code {
            Some(code) => error.add_context("status_code", code.to_string()),
            None => error,
        }
    }
}
