//! Error taxonomy shared by delivery tiers and the push subscription lifecycle.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("notification permission not granted: {0}")]
    PermissionDenied(String),

    #[error("channel unsupported: {0}")]
    ChannelUnsupported(String),

    #[error("failed to render notification: {0}")]
    RenderFailure(String),

    #[error("push subscription failed: {0}")]
    SubscriptionFailure(String),

    #[error("invalid background message: {0}")]
    Protocol(String),

    #[error("local state error: {0}")]
    Storage(String),
}

impl NotifyError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::ChannelUnsupported(_) => "CHANNEL_UNSUPPORTED",
            Self::RenderFailure(_) => "RENDER_FAILURE",
            Self::SubscriptionFailure(_) => "SUBSCRIPTION_FAILURE",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }
}

pub type NotifyResult<T> = Result<T, NotifyError>;

/// Result value handed back to the UI by subscription lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl OperationResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            code: None,
            token: None,
        }
    }

    pub fn ok_with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Self::ok()
        }
    }

    pub fn failed(err: &NotifyError) -> Self {
        Self {
            success: false,
            error: Some(err.to_string()),
            code: Some(err.code()),
            token: None,
        }
    }
}

impl From<NotifyResult<()>> for OperationResult {
    fn from(result: NotifyResult<()>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(err) => Self::failed(&err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_result_carries_code_and_message() {
        let result = OperationResult::failed(&NotifyError::PermissionDenied("denied".into()));
        assert!(!result.success);
        assert_eq!(result.code, Some("PERMISSION_DENIED"));
        assert_eq!(
            result.error.as_deref(),
            Some("notification permission not granted: denied")
        );
    }

    #[test]
    fn test_ok_result_serializes_without_empty_fields() {
        let value = serde_json::to_value(OperationResult::ok()).expect("should serialize");
        assert_eq!(value, serde_json::json!({"success": true}));
    }
}
