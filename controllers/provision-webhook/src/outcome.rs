//! Reconciliation outcomes
//!
//! Every event ends in exactly one `ReconciliationOutcome`. Rejections are
//! final for the sender; failures are worth redelivering.

use serde::Serialize;
use std::fmt;

/// Why an event was acknowledged without acting on it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    UnsupportedEventType,
    NonServerResource,
}

/// Why an understood event cannot be applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    InvalidSignature,
    MalformedPayload,
    NotFound,
    InvalidTransition,
    InvalidImage,
}

/// Why an event could not be applied this time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Retries exhausted against concurrent writers
    Conflict,
    /// Overall deadline expired
    Timeout,
    /// Unexpected error from the backing store
    Store,
}

/// Terminal result of handling one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconciliationOutcome {
    Applied,
    NoOpAlreadyApplied,
    Ignored(IgnoreReason),
    Rejected(RejectReason),
    Failed(FailureReason),
}

/// Coarse classification reported in response bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Rejected,
    Failed,
}

impl ReconciliationOutcome {
    /// HTTP status code the transport answers with
    pub fn http_status(self) -> u16 {
        match self {
            Self::Applied | Self::NoOpAlreadyApplied | Self::Ignored(_) => 200,
            Self::Rejected(RejectReason::InvalidSignature) => 401,
            Self::Rejected(RejectReason::MalformedPayload) => 400,
            Self::Rejected(RejectReason::NotFound) => 404,
            Self::Rejected(RejectReason::InvalidTransition) => 409,
            Self::Rejected(RejectReason::InvalidImage) => 422,
            Self::Failed(FailureReason::Conflict) => 503,
            Self::Failed(FailureReason::Timeout) => 504,
            Self::Failed(FailureReason::Store) => 502,
        }
    }

    pub fn status(self) -> ResponseStatus {
        match self {
            Self::Applied | Self::NoOpAlreadyApplied | Self::Ignored(_) => ResponseStatus::Success,
            Self::Rejected(_) => ResponseStatus::Rejected,
            Self::Failed(_) => ResponseStatus::Failed,
        }
    }

    /// Stable label used in responses and metrics
    pub fn label(self) -> &'static str {
        match self {
            Self::Applied => "Applied",
            Self::NoOpAlreadyApplied => "NoOpAlreadyApplied",
            Self::Ignored(IgnoreReason::UnsupportedEventType) => "Ignored(UnsupportedEventType)",
            Self::Ignored(IgnoreReason::NonServerResource) => "Ignored(NonServerResource)",
            Self::Rejected(RejectReason::InvalidSignature) => "Rejected(InvalidSignature)",
            Self::Rejected(RejectReason::MalformedPayload) => "Rejected(MalformedPayload)",
            Self::Rejected(RejectReason::NotFound) => "Rejected(NotFound)",
            Self::Rejected(RejectReason::InvalidTransition) => "Rejected(InvalidTransition)",
            Self::Rejected(RejectReason::InvalidImage) => "Rejected(InvalidImage)",
            Self::Failed(FailureReason::Conflict) => "Failed(Conflict)",
            Self::Failed(FailureReason::Timeout) => "Failed(Timeout)",
            Self::Failed(FailureReason::Store) => "Failed(Store)",
        }
    }

    /// Whether the sender should redeliver the event later
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl fmt::Display for ReconciliationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_mapping() {
        use ReconciliationOutcome::*;

        assert_eq!(Applied.http_status(), 200);
        assert_eq!(NoOpAlreadyApplied.http_status(), 200);
        assert_eq!(Ignored(IgnoreReason::UnsupportedEventType).http_status(), 200);
        assert_eq!(Rejected(RejectReason::InvalidSignature).http_status(), 401);
        assert_eq!(Rejected(RejectReason::MalformedPayload).http_status(), 400);
        assert_eq!(Rejected(RejectReason::NotFound).http_status(), 404);
        assert_eq!(Rejected(RejectReason::InvalidTransition).http_status(), 409);
        assert_eq!(Rejected(RejectReason::InvalidImage).http_status(), 422);
        assert_eq!(Failed(FailureReason::Conflict).http_status(), 503);
        assert_eq!(Failed(FailureReason::Timeout).http_status(), 504);
        assert_eq!(Failed(FailureReason::Store).http_status(), 502);
    }

    #[test]
    fn test_only_failures_are_retryable() {
        assert!(ReconciliationOutcome::Failed(FailureReason::Timeout).is_retryable());
        assert!(!ReconciliationOutcome::Rejected(RejectReason::NotFound).is_retryable());
        assert!(!ReconciliationOutcome::Ignored(IgnoreReason::NonServerResource).is_retryable());
        assert_eq!(
            ReconciliationOutcome::Rejected(RejectReason::InvalidImage).status(),
            ResponseStatus::Rejected
        );
    }
}
