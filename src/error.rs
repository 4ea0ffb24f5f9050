//! Closed error set for the execution substrate.
//!
//! Every failure the core can surface is one of these kinds. The API layer
//! maps them onto the stable error-code strings of the response envelope;
//! the engine uses the transience classification to drive step retries.

use std::time::Duration;
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, ExecutionError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    // Input
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("workflow graph invalid: {0}")]
    WorkflowGraphInvalid(String),
    #[error("parameter unbound: {0}")]
    ParameterUnbound(String),

    // Auth / quota
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("organization limit exceeded: {0}")]
    OrganizationLimitExceeded(String),

    // Resource
    #[error("session acquisition timed out after {0:?}")]
    SessionAcquisitionTimeout(Duration),
    #[error("session was replaced, restart the step")]
    SessionReplaced,
    #[error("page unresponsive: {0}")]
    PageUnresponsive(String),
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("element not stable: {0}")]
    ElementNotStable(String),
    #[error("option not found: {0}")]
    OptionNotFound(String),

    // Lifecycle
    #[error("canceled")]
    Canceled,
    #[error("timed out")]
    Timeout,
    #[error("maximum step count reached")]
    MaxStepsReached,

    // External
    #[error("oracle error: {0}")]
    Oracle(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("blob store error: {0}")]
    BlobStore(String),
    #[error("webhook delivery failed: {0}")]
    WebhookDeliveryFailed(String),
    #[error("http request failed: {0}")]
    HttpRequest(String),

    // Internal
    #[error("internal error: {0}")]
    Internal(String),
    #[error("bug: {0}")]
    Bug(String),
}

impl ExecutionError {
    /// Stable identifier used in API envelopes and webhook payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::WorkflowGraphInvalid(_) => "WORKFLOW_GRAPH_INVALID",
            Self::ParameterUnbound(_) => "PARAMETER_UNBOUND",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::OrganizationLimitExceeded(_) => "ORGANIZATION_LIMIT_EXCEEDED",
            Self::SessionAcquisitionTimeout(_) => "SESSION_ACQUISITION_TIMEOUT",
            Self::SessionReplaced => "SESSION_REPLACED",
            Self::PageUnresponsive(_) => "PAGE_UNRESPONSIVE",
            Self::ElementNotFound(_) => "ELEMENT_NOT_FOUND",
            Self::ElementNotStable(_) => "ELEMENT_NOT_STABLE",
            Self::OptionNotFound(_) => "OPTION_NOT_FOUND",
            Self::Canceled => "CANCELED",
            Self::Timeout => "TIMEOUT",
            Self::MaxStepsReached => "MAX_STEPS_REACHED",
            Self::Oracle(_) => "ORACLE_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::BlobStore(_) => "BLOB_STORE_ERROR",
            Self::WebhookDeliveryFailed(_) => "WEBHOOK_DELIVERY_FAILED",
            Self::HttpRequest(_) => "HTTP_REQUEST_ERROR",
            Self::Internal(_) => "INTERNAL",
            Self::Bug(_) => "BUG",
        }
    }

    /// Whether a step-level retry is worth attempting.
    ///
    /// `Canceled` and `Timeout` short-circuit retries; terminal lifecycle
    /// kinds are not recoverable by re-running the same step.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::PageUnresponsive(_)
                | Self::ElementNotFound(_)
                | Self::ElementNotStable(_)
                | Self::OptionNotFound(_)
                | Self::Oracle(_)
                | Self::HttpRequest(_)
        )
    }

    /// Errors that abort the surrounding loop immediately, bypassing retry.
    pub fn short_circuits(&self) -> bool {
        matches!(self, Self::Canceled | Self::Timeout | Self::MaxStepsReached)
    }

    /// Redacted failure record for terminal entities. The message keeps the
    /// kind-level description only; internals never leak into stored state.
    pub fn failure_reason(&self) -> FailureReason {
        FailureReason {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }

    /// Rebuild an error from a stored failure record, so nested failures
    /// (a task inside a workflow block) keep their kind when they surface.
    pub fn from_failure_reason(reason: &FailureReason) -> Self {
        let msg = reason.message.clone();
        match reason.code.as_str() {
            "VALIDATION_ERROR" => Self::Validation(msg),
            "WORKFLOW_GRAPH_INVALID" => Self::WorkflowGraphInvalid(msg),
            "PARAMETER_UNBOUND" => Self::ParameterUnbound(msg),
            "UNAUTHORIZED" => Self::Unauthorized,
            "FORBIDDEN" => Self::Forbidden,
            "ORGANIZATION_LIMIT_EXCEEDED" => Self::OrganizationLimitExceeded(msg),
            "SESSION_ACQUISITION_TIMEOUT" => Self::SessionAcquisitionTimeout(Duration::ZERO),
            "SESSION_REPLACED" => Self::SessionReplaced,
            "PAGE_UNRESPONSIVE" => Self::PageUnresponsive(msg),
            "ELEMENT_NOT_FOUND" => Self::ElementNotFound(msg),
            "ELEMENT_NOT_STABLE" => Self::ElementNotStable(msg),
            "OPTION_NOT_FOUND" => Self::OptionNotFound(msg),
            "CANCELED" => Self::Canceled,
            "TIMEOUT" => Self::Timeout,
            "MAX_STEPS_REACHED" => Self::MaxStepsReached,
            "ORACLE_ERROR" => Self::Oracle(msg),
            "STORAGE_ERROR" => Self::Storage(msg),
            "BLOB_STORE_ERROR" => Self::BlobStore(msg),
            "WEBHOOK_DELIVERY_FAILED" => Self::WebhookDeliveryFailed(msg),
            "HTTP_REQUEST_ERROR" => Self::HttpRequest(msg),
            "BUG" => Self::Bug(msg),
            _ => Self::Internal(msg),
        }
    }
}

/// Error code and short message carried by terminal tasks, runs and blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ExecutionError::Canceled.code(), "CANCELED");
        assert_eq!(
            ExecutionError::RateLimited { retry_after_secs: 3 }.code(),
            "RATE_LIMITED"
        );
        assert_eq!(
            ExecutionError::ElementNotFound("e1".into()).code(),
            "ELEMENT_NOT_FOUND"
        );
    }

    #[test]
    fn transience_classification() {
        assert!(ExecutionError::PageUnresponsive("stuck".into()).is_transient());
        assert!(ExecutionError::ElementNotFound("gone".into()).is_transient());
        assert!(!ExecutionError::Canceled.is_transient());
        assert!(ExecutionError::Canceled.short_circuits());
        assert!(!ExecutionError::Storage("down".into()).is_transient());
    }
}
