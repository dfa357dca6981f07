//! Error types for proxied driver operations.

use thiserror::Error;

/// All errors that can occur while forwarding an operation.
///
/// Every variant except [`Codec`](ProxyError::Codec) carries the name of the
/// operation that failed. Codec failures met while dispatching surface as
/// `Usage` (request) or `Protocol` (response) so operations always name
/// themselves.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The caller used the proxy in a way it does not support. Raised locally,
    /// the request never leaves the process.
    #[error("usage error in `{operation}`: {message}")]
    Usage {
        /// Operation that was called.
        operation: String,
        /// What went wrong and how to call it instead.
        message: String,
    },

    /// The transport could not reach the endpoint.
    #[error("connectivity error in `{operation}`: {reason}")]
    Connectivity {
        /// Operation that was called.
        operation: String,
        /// Transport-reported reason.
        reason: String,
    },

    /// A change stream fetch did not complete within its deadline.
    #[error("`{operation}` timed out")]
    Timeout {
        /// Operation that was called.
        operation: String,
    },

    /// The remote API understood the request and rejected it.
    #[error("operation `{operation}` failed: {reason}")]
    Operation {
        /// Operation that was called.
        operation: String,
        /// Remote-reported reason.
        reason: String,
    },

    /// The response could not be decoded or had an unexpected shape.
    #[error("protocol error in `{operation}`: {reason}")]
    Protocol {
        /// Operation that was called.
        operation: String,
        /// Why the response was not understood.
        reason: String,
    },

    /// A value could not be converted to or from its wire form, outside of
    /// any operation.
    #[error("codec error: {0}")]
    Codec(String),
}

impl ProxyError {
    /// Create a usage error.
    pub fn usage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        ProxyError::Usage {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a connectivity error.
    pub fn connectivity(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        ProxyError::Connectivity {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>) -> Self {
        ProxyError::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a remote operation error.
    pub fn operation(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        ProxyError::Operation {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a protocol error.
    pub fn protocol(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        ProxyError::Protocol {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a codec error.
    pub fn codec(msg: impl Into<String>) -> Self {
        ProxyError::Codec(msg.into())
    }

    /// Check if this is a usage error.
    pub fn is_usage_error(&self) -> bool {
        matches!(self, ProxyError::Usage { .. })
    }

    /// Check if this is a connectivity error.
    pub fn is_connectivity_error(&self) -> bool {
        matches!(self, ProxyError::Connectivity { .. })
    }

    /// Check if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProxyError::Timeout { .. })
    }

    /// Check if the remote side rejected the operation.
    pub fn is_operation_error(&self) -> bool {
        matches!(self, ProxyError::Operation { .. })
    }

    /// Check if this is a protocol error.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, ProxyError::Protocol { .. })
    }

    /// Name of the operation that failed, if known.
    pub fn operation_name(&self) -> Option<&str> {
        match self {
            ProxyError::Usage { operation, .. }
            | ProxyError::Connectivity { operation, .. }
            | ProxyError::Timeout { operation }
            | ProxyError::Operation { operation, .. }
            | ProxyError::Protocol { operation, .. } => Some(operation),
            ProxyError::Codec(_) => None,
        }
    }

    /// Get the error message.
    pub fn message(&self) -> String {
        self.to_string()
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::Codec(err.to_string())
    }
}

impl From<bson::ser::Error> for ProxyError {
    fn from(err: bson::ser::Error) -> Self {
        ProxyError::Codec(err.to_string())
    }
}

impl From<bson::de::Error> for ProxyError {
    fn from(err: bson::de::Error) -> Self {
        ProxyError::Codec(err.to_string())
    }
}

/// Result type alias for proxied operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Error kind enumeration for pattern matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Local misuse.
    Usage,
    /// Endpoint unreachable.
    Connectivity,
    /// Fetch deadline passed.
    Timeout,
    /// Remote rejection.
    Operation,
    /// Response not understood.
    Protocol,
    /// Value conversion failure.
    Codec,
}

impl ProxyError {
    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::Usage { .. } => ErrorKind::Usage,
            ProxyError::Connectivity { .. } => ErrorKind::Connectivity,
            ProxyError::Timeout { .. } => ErrorKind::Timeout,
            ProxyError::Operation { .. } => ErrorKind::Operation,
            ProxyError::Protocol { .. } => ErrorKind::Protocol,
            ProxyError::Codec(_) => ErrorKind::Codec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProxyError::connectivity("list_databases", "connection refused");
        assert_eq!(
            err.to_string(),
            "connectivity error in `list_databases`: connection refused"
        );
    }

    #[test]
    fn test_usage_error_names_operation() {
        let err = ProxyError::usage("start_session", "sessions are not supported");
        assert!(err.is_usage_error());
        assert_eq!(err.operation_name(), Some("start_session"));
        assert!(err.to_string().contains("sessions are not supported"));
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(ProxyError::usage("op", "x").kind(), ErrorKind::Usage);
        assert_eq!(
            ProxyError::connectivity("op", "x").kind(),
            ErrorKind::Connectivity
        );
        assert_eq!(ProxyError::timeout("op").kind(), ErrorKind::Timeout);
        assert_eq!(ProxyError::operation("op", "x").kind(), ErrorKind::Operation);
        assert_eq!(ProxyError::protocol("op", "x").kind(), ErrorKind::Protocol);
        assert_eq!(ProxyError::codec("x").kind(), ErrorKind::Codec);
    }

    #[test]
    fn test_operation_and_protocol_are_distinct() {
        let rejected = ProxyError::operation("find", "unauthorized");
        let garbled = ProxyError::protocol("find", "missing `kind`");
        assert!(rejected.is_operation_error());
        assert!(!rejected.is_protocol_error());
        assert!(garbled.is_protocol_error());
        assert!(!garbled.is_operation_error());
    }

    #[test]
    fn test_is_timeout() {
        assert!(ProxyError::timeout("try_next").is_timeout());
        assert!(!ProxyError::connectivity("try_next", "reset").is_timeout());
    }

    #[test]
    fn test_message_matches_display() {
        let err = ProxyError::protocol("find", "missing `kind`");
        assert_eq!(err.message(), "protocol error in `find`: missing `kind`");
    }

    #[test]
    fn test_codec_error_has_no_operation() {
        assert!(ProxyError::codec("bad value").operation_name().is_none());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: ProxyError = json_err.into();
        assert!(matches!(err, ProxyError::Codec(_)));
    }
}
