//! Directory error types

use thiserror::Error;

/// Errors from the directory reconciler and its collaborators
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Could not reach or bind to the directory server
    #[error("cannot connect to directory {url}: {message}")]
    Connect {
        /// Server URL
        url: String,
        /// Description of what failed
        message: String,
    },

    /// The server rejected an operation
    #[error("{operation} {dn} failed with result code {code}: {message}")]
    Operation {
        /// Operation that failed (add, bind)
        operation: &'static str,
        /// Target DN
        dn: String,
        /// LDAP result code
        code: u32,
        /// Server diagnostic text
        message: String,
    },

    /// The seed file could not be read or parsed
    #[error("invalid seed {source_name}: {message}")]
    Seed {
        /// File path, or "defaults"
        source_name: String,
        /// Description of what failed
        message: String,
    },

    /// Cluster access failed
    #[error(transparent)]
    Cluster(#[from] devplane_common::Error),
}

impl DirectoryError {
    /// Create a seed error
    pub fn seed(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Seed {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Whether a later attempt may succeed without intervention
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connect { .. } => true,
            // busy, unavailable, unwilling to perform
            Self::Operation { code, .. } => matches!(code, 51..=53),
            Self::Seed { .. } => false,
            Self::Cluster(e) => e.is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_busy_is_retryable_but_schema_violation_is_not() {
        let busy = DirectoryError::Operation {
            operation: "add",
            dn: "ou=people,dc=example,dc=org".into(),
            code: 51,
            message: "busy".into(),
        };
        assert!(busy.is_retryable());

        let violation = DirectoryError::Operation {
            operation: "add",
            dn: "uid=x,ou=people,dc=example,dc=org".into(),
            code: 65,
            message: "object class violation".into(),
        };
        assert!(!violation.is_retryable());
        assert!(!DirectoryError::seed("seed.yaml", "bad").is_retryable());
    }
}
