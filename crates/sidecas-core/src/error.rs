//! Error types for the cache proxy

use miette::Diagnostic;
use thiserror::Error;

/// Error type shared by the proxy request path and background pipelines
///
/// The variants mirror the RPC status vocabulary the proxy speaks at its
/// boundary; `Grpc` wraps a status received from the remote so the
/// original code survives fall-through.
#[derive(Error, Debug, Diagnostic)]
pub enum ProxyError {
    /// Malformed digest, resource name, or empty required selector
    #[error("invalid argument: {message}")]
    #[diagnostic(code(sidecas::invalid_argument))]
    InvalidArgument {
        /// What was malformed
        message: String,
    },

    /// Blob absent locally under skip-remote, or remote reports absence
    #[error("not found: {resource}")]
    #[diagnostic(code(sidecas::not_found))]
    NotFound {
        /// The resource that was not found
        resource: String,
    },

    /// Remote unreachable or deadline exceeded on fall-through
    #[error("remote unavailable: {message}")]
    #[diagnostic(
        code(sidecas::unavailable),
        help("The remote cache may be down; the caller layer retries these")
    )]
    Unavailable {
        /// Transport-level detail
        message: String,
    },

    /// Write attempted without the cache-write capability
    #[error("permission denied: {message}")]
    #[diagnostic(code(sidecas::permission_denied))]
    PermissionDenied {
        /// Which capability was missing
        message: String,
    },

    /// Feature-flagged path is disabled
    #[error("unimplemented: {feature}")]
    #[diagnostic(code(sidecas::unimplemented))]
    Unimplemented {
        /// The disabled feature
        feature: String,
    },

    /// Invariant violation, e.g. stored bytes hashing differently than
    /// their digest
    #[error("internal error: {message}")]
    #[diagnostic(code(sidecas::internal))]
    Internal {
        /// Description of the violated invariant
        message: String,
    },

    /// An outbound RPC failed with a remote-supplied status
    #[error("{operation} failed")]
    #[diagnostic(code(sidecas::grpc))]
    Grpc {
        /// The RPC that failed
        operation: String,
        /// The status returned by the remote
        #[source]
        source: tonic::Status,
    },

    /// Local blob store failure
    #[error("store error: {message}")]
    #[diagnostic(code(sidecas::store))]
    Store {
        /// Store-level detail
        message: String,
    },

    /// Configuration or wiring error
    #[error("configuration error: {message}")]
    #[diagnostic(code(sidecas::config))]
    Config {
        /// What was misconfigured
        message: String,
    },
}

impl ProxyError {
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn unimplemented(feature: impl Into<String>) -> Self {
        Self::Unimplemented {
            feature: feature.into(),
        }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn grpc(operation: impl Into<String>, source: tonic::Status) -> Self {
        Self::Grpc {
            operation: operation.into(),
            source,
        }
    }

    #[must_use]
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// The RPC status code this error maps to at the proxy boundary
    #[must_use]
    pub fn code(&self) -> tonic::Code {
        match self {
            ProxyError::InvalidArgument { .. } => tonic::Code::InvalidArgument,
            ProxyError::NotFound { .. } => tonic::Code::NotFound,
            ProxyError::Unavailable { .. } => tonic::Code::Unavailable,
            ProxyError::PermissionDenied { .. } => tonic::Code::PermissionDenied,
            ProxyError::Unimplemented { .. } => tonic::Code::Unimplemented,
            ProxyError::Internal { .. } | ProxyError::Store { .. } | ProxyError::Config { .. } => {
                tonic::Code::Internal
            }
            // Preserve whatever the remote said.
            ProxyError::Grpc { source, .. } => source.code(),
        }
    }

    /// Whether the error is a deadline expiry (flush batches re-queue on
    /// these, and only these)
    #[must_use]
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, ProxyError::Grpc { source, .. } if source.code() == tonic::Code::DeadlineExceeded)
    }
}

impl From<ProxyError> for tonic::Status {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::Grpc { source, .. } => source,
            other => tonic::Status::new(other.code(), other.to_string()),
        }
    }
}

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;
