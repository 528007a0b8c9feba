use std::{borrow::Cow, fmt::Display};

use crate::{
    model::{ErrorData, ProgressToken, RequestId},
    transport::{DynTransportError, SharedTransportError},
};

impl Display for ErrorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code.0)?;
        if let Some(data) = &self.data {
            write!(f, ", data: {data}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorData {}

/// Unified error type for everything the session can fail with.
///
/// Kinds that belong to a specific operation (`McpError`, `Transport`,
/// `NotConnected`, `Cancelled`, `InvalidResult`) are returned to that
/// caller; the remaining kinds have no owner and are broadcast through the
/// session's `on_error` observer.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The peer answered with a JSON-RPC error, or the engine terminated
    /// the request with a wire-level error (timeout, connection closed).
    #[error("Mcp error: {0}")]
    McpError(ErrorData),

    #[error("Transport error {error}, when {context}")]
    Transport {
        error: SharedTransportError,
        context: Cow<'static, str>,
    },

    #[error("Transport not connected")]
    NotConnected,

    #[error("Task cancelled for reason {}", reason.as_deref().unwrap_or("<unknown>"))]
    Cancelled { reason: Option<String> },

    /// The response arrived but its `result` did not match the caller's
    /// expected shape.
    #[error("Invalid response result: {0}")]
    InvalidResult(#[source] serde_json::Error),

    #[error("Received a response for an unknown request id: {0}")]
    UnknownRequestId(RequestId),

    #[error("Received a progress notification for an unknown token: {0}")]
    UnknownProgressToken(ProgressToken),

    #[error("Uncaught error in {method} notification handler: {error}")]
    NotificationHandler { method: String, error: ErrorData },
}

impl ServiceError {
    pub(crate) fn transport(
        error: DynTransportError,
        context: impl Into<Cow<'static, str>>,
    ) -> Self {
        ServiceError::Transport {
            error: error.into(),
            context: context.into(),
        }
    }
}

impl From<ErrorData> for ServiceError {
    fn from(error: ErrorData) -> Self {
        ServiceError::McpError(error)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_error_data_display() {
        let error = ErrorData::request_timeout("Request timed out", None);
        assert_eq!(format!("{}", error), "Request timed out (code -32001)");

        let error = ErrorData::request_timeout(
            "Request timed out",
            Some(json!({"timeout": 50})),
        );
        assert_eq!(
            format!("{}", error),
            "Request timed out (code -32001), data: {\"timeout\":50}"
        );
    }

    #[test]
    fn test_cancelled_display() {
        let error = ServiceError::Cancelled {
            reason: Some("user closed the tab".into()),
        };
        assert_eq!(
            format!("{}", error),
            "Task cancelled for reason user closed the tab"
        );
        let error = ServiceError::Cancelled { reason: None };
        assert_eq!(format!("{}", error), "Task cancelled for reason <unknown>");
    }

    #[test]
    fn test_service_error_is_std_error() {
        let error = ServiceError::NotConnected;
        let _: &dyn std::error::Error = &error;
    }
}
