//! Error taxonomy shared by the router, reliability fabric, DLQ, and wire
//! responses. The string forms are both the wire and the DB representation
//! (`dead_letter_queue.failure_category` check constraint).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed envelope or unknown routing target. Not retried.
    ValidationError,
    /// Denied by static policy. Not retried; always audited.
    PolicyViolation,
    /// Per-target or request deadline fired. Retriable.
    Timeout,
    /// Target 5xx or connection error. Retriable.
    DownstreamFailure,
    /// Fast-rejected by an open circuit. Retriable after cooldown.
    CircuitOpen,
    /// Buffer at hard limit for the request's tier. Not retried by the core.
    Overload,
    /// Retry budget exhausted. Terminal; the request moves to the DLQ.
    RetryExhausted,
    /// Catch-all; recorded with whatever classification we could extract.
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::ValidationError => "validation_error",
            ErrorCategory::PolicyViolation => "policy_violation",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::DownstreamFailure => "downstream_failure",
            ErrorCategory::CircuitOpen => "circuit_open",
            ErrorCategory::Overload => "overload",
            ErrorCategory::RetryExhausted => "retry_exhausted",
            ErrorCategory::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "validation_error" => Some(ErrorCategory::ValidationError),
            "policy_violation" => Some(ErrorCategory::PolicyViolation),
            "timeout" => Some(ErrorCategory::Timeout),
            "downstream_failure" => Some(ErrorCategory::DownstreamFailure),
            "circuit_open" => Some(ErrorCategory::CircuitOpen),
            "overload" => Some(ErrorCategory::Overload),
            "retry_exhausted" => Some(ErrorCategory::RetryExhausted),
            "unknown" => Some(ErrorCategory::Unknown),
            _ => None,
        }
    }

    /// Whether the reliability fabric may schedule another attempt.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Timeout | ErrorCategory::DownstreamFailure | ErrorCategory::CircuitOpen
        )
    }

    /// Terminal categories go straight to the DLQ without a retry loop.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ErrorCategory::ValidationError
                | ErrorCategory::PolicyViolation
                | ErrorCategory::RetryExhausted
        )
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_forms_round_trip() {
        for cat in [
            ErrorCategory::ValidationError,
            ErrorCategory::PolicyViolation,
            ErrorCategory::Timeout,
            ErrorCategory::DownstreamFailure,
            ErrorCategory::CircuitOpen,
            ErrorCategory::Overload,
            ErrorCategory::RetryExhausted,
            ErrorCategory::Unknown,
        ] {
            assert_eq!(ErrorCategory::parse(cat.as_str()), Some(cat));
        }
        assert_eq!(ErrorCategory::parse("nope"), None);
    }

    #[test]
    fn retriability_follows_the_taxonomy() {
        assert!(ErrorCategory::Timeout.is_retriable());
        assert!(ErrorCategory::DownstreamFailure.is_retriable());
        assert!(ErrorCategory::CircuitOpen.is_retriable());
        assert!(!ErrorCategory::ValidationError.is_retriable());
        assert!(!ErrorCategory::PolicyViolation.is_retriable());
        assert!(!ErrorCategory::Overload.is_retriable());
        assert!(ErrorCategory::RetryExhausted.is_terminal());
    }
}
