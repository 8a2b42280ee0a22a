// crates/ncp-server/src/error.rs
// Standardized error types for NCP

use thiserror::Error;

/// Main error type for the NCP library.
///
/// Every variant carries a stable `kind` tag surfaced at the MCP tool
/// boundary so callers can branch without parsing messages.
#[derive(Error, Debug)]
pub enum NcpError {
    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("server '{server}' is unhealthy: {reason}")]
    Unhealthy { server: String, reason: String },

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("invocation failed: {0}")]
    InvocationFailed(String),

    #[error("protocol error from '{server}': {message}")]
    Protocol { server: String, message: String },

    #[error("cache entry corrupt: {0}")]
    CacheCorrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Result using NcpError
pub type Result<T> = std::result::Result<T, NcpError>;

impl NcpError {
    /// Stable kind tag for the MCP boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            NcpError::ProfileNotFound(_) => "ProfileNotFound",
            NcpError::Duplicate(_) => "Duplicate",
            NcpError::NotFound(_) => "NotFound",
            NcpError::ValidationFailed(_) => "ValidationFailed",
            NcpError::Unhealthy { .. } => "Unhealthy",
            NcpError::Timeout(_) => "Timeout",
            NcpError::InvocationFailed(_) => "InvocationFailed",
            NcpError::Protocol { .. } => "ProtocolError",
            NcpError::CacheCorrupt(_) => "CacheCorrupt",
            NcpError::Io(_) | NcpError::Json(_) | NcpError::Internal(_) => "Internal",
        }
    }

    /// Whether `run` may retry after this error. Only transport-layer
    /// failures and timeouts qualify; tool-reported errors never do.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NcpError::Timeout(_) | NcpError::InvocationFailed(_))
    }

    /// Convert to user-facing string for MCP tool boundaries.
    pub fn to_user_string(&self) -> String {
        format!("[{}] {}", self.kind(), self)
    }
}

impl From<String> for NcpError {
    fn from(s: String) -> Self {
        NcpError::Internal(s)
    }
}

impl From<tokio::task::JoinError> for NcpError {
    fn from(err: tokio::task::JoinError) -> Self {
        NcpError::Internal(err.to_string())
    }
}

impl From<NcpError> for String {
    fn from(err: NcpError) -> Self {
        err.to_user_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_are_stable() {
        assert_eq!(NcpError::ProfileNotFound("x".into()).kind(), "ProfileNotFound");
        assert_eq!(NcpError::Timeout(500).kind(), "Timeout");
        assert_eq!(
            NcpError::Protocol {
                server: "s".into(),
                message: "bad frame".into()
            }
            .kind(),
            "ProtocolError"
        );
        assert_eq!(NcpError::Internal("bug".into()).kind(), "Internal");
    }

    #[test]
    fn test_retry_policy() {
        assert!(NcpError::Timeout(100).is_retryable());
        assert!(NcpError::InvocationFailed("pipe closed".into()).is_retryable());
        assert!(!NcpError::ValidationFailed("missing arg".into()).is_retryable());
        assert!(
            !NcpError::Unhealthy {
                server: "s".into(),
                reason: "down".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_user_string_carries_kind() {
        let msg = NcpError::NotFound("github".into()).to_user_string();
        assert!(msg.starts_with("[NotFound]"));
        assert!(msg.contains("github"));
    }
}
