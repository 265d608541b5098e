// tee-signer: Error types

use thiserror::Error;

/// Signer result type
pub type SignerResult<T> = Result<T, SignerError>;

/// Service-level error taxonomy
///
/// Every error a signing client can observe maps onto one of these kinds.
/// Messages never include the master seed, private key material, or the set
/// of known key versions.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("rate limit exceeded: {0}")]
    ResourceExhausted(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SignerError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        SignerError::InvalidArgument(msg.into())
    }

    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        SignerError::ResourceExhausted(msg.into())
    }

    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        SignerError::Unauthenticated(msg.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        SignerError::PermissionDenied(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        SignerError::Config(msg.into())
    }

    pub fn internal_error(msg: impl Into<String>) -> Self {
        SignerError::Internal(msg.into())
    }

    /// Stable wire code for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            SignerError::InvalidArgument(_) => "invalid-argument",
            SignerError::ResourceExhausted(_) => "resource-exhausted",
            SignerError::Unauthenticated(_) => "unauthenticated",
            SignerError::PermissionDenied(_) => "permission-denied",
            SignerError::Config(_) => "internal",
            SignerError::Internal(_) => "internal",
        }
    }
}

/// Check if an error is caused by the client (non-retryable as sent)
pub fn is_client_error(err: &SignerError) -> bool {
    matches!(
        err,
        SignerError::InvalidArgument(_)
            | SignerError::Unauthenticated(_)
            | SignerError::PermissionDenied(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes_are_stable() {
        assert_eq!(SignerError::invalid_argument("x").code(), "invalid-argument");
        assert_eq!(SignerError::resource_exhausted("x").code(), "resource-exhausted");
        assert_eq!(SignerError::internal_error("x").code(), "internal");
        assert_eq!(SignerError::config_error("x").code(), "internal");
    }

    #[test]
    fn test_client_error_predicate() {
        assert!(is_client_error(&SignerError::invalid_argument("bad hex")));
        assert!(!is_client_error(&SignerError::internal_error("boom")));
        assert!(!is_client_error(&SignerError::resource_exhausted("slow down")));
    }
}
