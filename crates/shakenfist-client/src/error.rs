//! Control-plane error classification
//!
//! Every client operation returns `ClientError`. Callers use the
//! classification helpers instead of matching on status codes directly.

use thiserror::Error;

/// Errors returned by the Shaken Fist REST client
#[derive(Debug, Error)]
pub enum ClientError {
    /// The API answered with a non-success status
    #[error("{method} {path} failed with status {status}: {message}")]
    Api {
        method: String,
        path: String,
        status: u16,
        message: String,
    },

    /// The request never produced a response (connect, TLS, timeout, decode)
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// Request body could not be serialized
    #[error("Failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ClientError {
    /// HTTP status of an API error, if the server answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            ClientError::Http(e) => e.status().map(|s| s.as_u16()),
            ClientError::Encode(_) => None,
        }
    }

    /// Check if this is a "not found" error (safe to skip in cleanup)
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Check if the credentials were rejected
    pub fn is_unauthorized(&self) -> bool {
        matches!(self.status(), Some(401) | Some(403))
    }

    /// Get a user-friendly suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self.status() {
            Some(401) => Some("Check SHAKENFIST_NAMESPACE and SHAKENFIST_KEY"),
            Some(403) => Some("The key in use is not allowed to manage other namespaces; use a system key"),
            Some(507) => Some("The cluster is out of capacity; lower --count or add --delay"),
            _ => match self {
                ClientError::Http(e) if e.is_connect() => Some("Check SHAKENFIST_API_URL is reachable"),
                _ => None,
            },
        }
    }
}

/// Result alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(status: u16) -> ClientError {
        ClientError::Api {
            method: "DELETE".to_string(),
            path: "instances/abc".to_string(),
            status,
            message: "instance not found".to_string(),
        }
    }

    #[test]
    fn test_not_found_classification() {
        assert!(api_error(404).is_not_found());
        assert!(!api_error(500).is_not_found());
        assert!(!api_error(404).is_unauthorized());
    }

    #[test]
    fn test_unauthorized_classification() {
        assert!(api_error(401).is_unauthorized());
        assert!(api_error(403).is_unauthorized());
        assert_eq!(
            api_error(401).suggestion(),
            Some("Check SHAKENFIST_NAMESPACE and SHAKENFIST_KEY")
        );
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            api_error(404).to_string(),
            "DELETE instances/abc failed with status 404: instance not found"
        );
    }

    #[test]
    fn test_encode_error_has_no_status() {
        let err: ClientError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.status(), None);
        assert!(err.suggestion().is_none());
    }
}
