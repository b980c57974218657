//! Error types shared by devplane controllers
//!
//! Errors carry the resource they concern so a failed call can be traced back
//! to a concrete object in the cluster without re-deriving names.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for cluster-facing devplane operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A specific resource operation failed
    #[error("{operation} {kind} {namespace}/{name} failed: {message}")]
    Resource {
        /// Operation that failed (get, create, patch, delete)
        operation: &'static str,
        /// Resource kind (Pod, Service, VirtualService, ...)
        kind: String,
        /// Resource name
        name: String,
        /// Resource namespace
        namespace: String,
        /// Description of what failed
        message: String,
        /// HTTP status code returned by the API server, if any
        code: Option<u16>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "create_client", "snapshot")
        context: String,
    },
}

impl Error {
    /// Wrap a kube error that happened while operating on a specific resource
    pub fn resource(
        operation: &'static str,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        source: kube::Error,
    ) -> Self {
        let code = match &source {
            kube::Error::Api(ae) => Some(ae.code),
            _ => None,
        };
        Self::Resource {
            operation,
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.into(),
            message: source.to_string(),
            code,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// 4xx responses from the API server need a change on our side; transport
    /// failures and 5xx responses may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Resource { code, .. } => !matches!(code, Some(c) if (400..500).contains(c)),
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// HTTP status code of the underlying API error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => Some(ae.code),
            Error::Resource { code, .. } => *code,
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
