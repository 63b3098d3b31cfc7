//! Error types for path-selection policy
//!
//! This module contains all error types used across the workspace: selector
//! state misuse, call substrate failures, method-level (protocol) failures,
//! script failures and configuration errors, plus the `PolicyError` type that
//! unifies them.

use serde::{Deserialize, Serialize};

use crate::types::RemoteAddr;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Selector state misuse
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("Remote {remote} is closed: {operation} is not allowed")]
    RemoteClosed {
        remote: RemoteAddr,
        operation: &'static str,
    },
}

/// Category of a method-level failure reported by the serving side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MethodErrorKind {
    /// No handler registered under the method name
    UnknownMethod,
    /// A field required by the method was absent
    MissingField,
    /// A telemetry event referenced a tracing id that was never registered
    UnknownTracingId,
    /// The method was invoked in a state that does not allow it
    Misuse,
    /// The policy behind the method failed (script error, not implemented)
    Policy,
    /// Anything else on the serving side
    Internal,
}

/// Method-level failure, distinguishable from connection failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct MethodError {
    pub kind: MethodErrorKind,
    pub message: String,
}

impl MethodError {
    pub fn new(kind: MethodErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A required field was absent from the request
    pub fn missing_field(method: &str, field: &str) -> Self {
        Self::new(
            MethodErrorKind::MissingField,
            format!("{method}: missing required field `{field}`"),
        )
    }

    pub fn unknown_method(method: &str) -> Self {
        Self::new(
            MethodErrorKind::UnknownMethod,
            format!("no method registered as `{method}`"),
        )
    }

    pub fn is_malformed(&self) -> bool {
        self.kind == MethodErrorKind::MissingField
    }
}

/// Call substrate failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("Failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("Failed to encode {what}: {reason}")]
    Encode { what: &'static str, reason: String },
    #[error("Failed to decode {what}: {reason}")]
    Decode { what: &'static str, reason: String },
    #[error("Remote method {method} failed: {error}")]
    Method { method: String, error: MethodError },
}

impl CallError {
    /// Whether the failure concerns the connection rather than one method
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            CallError::Connect { .. } | CallError::ConnectionLost { .. } | CallError::FrameTooLarge { .. }
        )
    }

    /// The method error reported by the remote side, if any
    pub fn method_error(&self) -> Option<&MethodError> {
        match self {
            CallError::Method { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Scripting host failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    #[error("Failed to load script {name}: {reason}")]
    Load { name: String, reason: String },
    #[error("function {entry} not implemented in script")]
    NotImplemented { entry: String },
    #[error("Script entry {entry} failed: {reason}")]
    Runtime { entry: String, reason: String },
}

/// Configuration failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration {path}: {reason}")]
    Io { path: String, reason: String },
    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
    #[error("Invalid configuration: {reason}")]
    Invalid { reason: String },
}

// ----------------------------------------------------------------------------
// Unified Error Type
// ----------------------------------------------------------------------------

/// Error type shared by every selector and tracer variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("Selector error: {0}")]
    Selector(#[from] SelectorError),

    #[error("Call error: {0}")]
    Call(#[from] CallError),

    #[error("Malformed call: {0}")]
    Method(#[from] MethodError),

    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl PolicyError {
    /// Create a closed-remote misuse error
    pub fn remote_closed(remote: &RemoteAddr, operation: &'static str) -> Self {
        PolicyError::Selector(SelectorError::RemoteClosed {
            remote: remote.clone(),
            operation,
        })
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        PolicyError::Config(ConfigError::Invalid {
            reason: reason.into(),
        })
    }

    /// Create a connection-lost error
    pub fn connection_lost<T: Into<String>>(reason: T) -> Self {
        PolicyError::Call(CallError::ConnectionLost {
            reason: reason.into(),
        })
    }

    /// Whether this reports use of a closed remote
    pub fn is_misuse(&self) -> bool {
        match self {
            PolicyError::Selector(SelectorError::RemoteClosed { .. }) => true,
            PolicyError::Method(e) => e.kind == MethodErrorKind::Misuse,
            PolicyError::Call(e) => e
                .method_error()
                .map(|m| m.kind == MethodErrorKind::Misuse)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Whether this reports a call with a required field absent
    pub fn is_malformed(&self) -> bool {
        match self {
            PolicyError::Method(e) => e.is_malformed(),
            PolicyError::Call(e) => e.method_error().map(MethodError::is_malformed).unwrap_or(false),
            _ => false,
        }
    }

    /// Whether this reports a script entry point that is not defined
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, PolicyError::Script(ScriptError::NotImplemented { .. }))
    }

    /// Map onto the method error reported back to a remote caller
    pub fn to_method_error(&self) -> MethodError {
        match self {
            PolicyError::Method(e) => e.clone(),
            PolicyError::Selector(e) => MethodError::new(MethodErrorKind::Misuse, e.to_string()),
            PolicyError::Script(e) => MethodError::new(MethodErrorKind::Policy, e.to_string()),
            PolicyError::Call(CallError::Method { error, .. }) => error.clone(),
            other => MethodError::new(MethodErrorKind::Internal, other.to_string()),
        }
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, PolicyError>;
pub type PolicyResult<T> = Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_failures_are_distinguishable() {
        let lost = CallError::ConnectionLost {
            reason: "broken pipe".into(),
        };
        let method = CallError::Method {
            method: "Selector.Path".into(),
            error: MethodError::missing_field("Selector.Path", "remote"),
        };
        assert!(lost.is_connection_failure());
        assert!(!method.is_connection_failure());
        assert!(PolicyError::from(method).is_malformed());
    }

    #[test]
    fn test_misuse_maps_to_misuse_method_error() {
        let err = PolicyError::remote_closed(&RemoteAddr::from("r"), "path");
        assert!(err.is_misuse());
        assert_eq!(err.to_method_error().kind, MethodErrorKind::Misuse);

        let remote = PolicyError::Call(CallError::Method {
            method: "Selector.Path".into(),
            error: err.to_method_error(),
        });
        assert!(remote.is_misuse());
    }

    #[test]
    fn test_script_errors_map_to_policy() {
        let err = PolicyError::Script(ScriptError::NotImplemented {
            entry: "refresh".into(),
        });
        assert!(err.is_not_implemented());
        assert_eq!(err.to_method_error().kind, MethodErrorKind::Policy);
        assert_eq!(
            ScriptError::NotImplemented { entry: "refresh".into() }.to_string(),
            "function refresh not implemented in script"
        );
    }
}
