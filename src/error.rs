//! Error types for toolflow

use thiserror::Error;

/// Result type alias using toolflow Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while assembling, registering or running flows
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input, missing required input, bad modifier, ill-formed flow
    #[error("Configuration error: {0}")]
    Config(String),

    /// No authorizer, no login callback, or auto-login disabled
    #[error("Authentication error: {message} (scopes: {})", .scopes.join(", "))]
    Auth {
        message: String,
        scopes: Vec<String>,
    },

    /// A function or flow has never been registered and auto-registration is off
    #[error("Registration needed: {0}")]
    RegistrationNeeded(String),

    /// A stored checksum no longer matches the local object
    #[error("Obsolete registration: {0}")]
    Obsolete(String),

    /// The engine rejected a token as insufficient for dependent scopes
    #[error("Dependent scope change required: {message}")]
    ScopeChange {
        message: String,
        scopes: Vec<String>,
    },

    /// The remote object does not exist (HTTP 404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Any other failure reported by a remote service
    #[error("Engine error{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Engine {
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },

    /// Storage read/write failures
    #[error("Storage error: {0}")]
    Storage(String),

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn auth(message: impl Into<String>, scopes: impl IntoIterator<Item = String>) -> Self {
        Error::Auth {
            message: message.into(),
            scopes: scopes.into_iter().collect(),
        }
    }

    /// Whether a run attempt may be retried after logging in again
    pub fn is_scope_change(&self) -> bool {
        matches!(self, Error::ScopeChange { .. })
    }

    /// Whether the remote object has disappeared
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_lists_scopes() {
        let err = Error::auth("no authorizer", vec!["scope-a".to_string(), "scope-b".to_string()]);
        assert_eq!(
            err.to_string(),
            "Authentication error: no authorizer (scopes: scope-a, scope-b)"
        );
    }

    #[test]
    fn test_engine_error_display() {
        let with_status = Error::Engine {
            status: Some(500),
            code: None,
            message: "boom".into(),
        };
        assert_eq!(with_status.to_string(), "Engine error (HTTP 500): boom");

        let without = Error::Engine {
            status: None,
            code: Some("X".into()),
            message: "boom".into(),
        };
        assert_eq!(without.to_string(), "Engine error: boom");
    }

    #[test]
    fn test_classification_helpers() {
        assert!(Error::NotFound("flow".into()).is_not_found());
        assert!(Error::ScopeChange {
            message: "m".into(),
            scopes: vec![]
        }
        .is_scope_change());
        assert!(!Error::Config("x".into()).is_scope_change());
    }
}
