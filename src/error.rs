//! Error types for the control plane.
//!
//! One crate-wide [`Error`] covers every failure mode so reliability policies
//! can inspect errors uniformly: the retry executor asks whether an error is
//! retryable, the circuit breaker records any error outcome, and the facade
//! surfaces logical errors to the caller unchanged.

use std::sync::Arc;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the control plane.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A resource configuration failed validation at construction.
    #[error("invalid resource configuration: {0}")]
    ConfigValidation(String),

    /// The provider credential is missing; set `TETRA_API_KEY`.
    #[error("TETRA_API_KEY environment variable is required but not set")]
    CredentialMissing,

    /// The provider could not be reached or answered with a transient
    /// failure. Carries the HTTP status when one was observed.
    #[error("provider unavailable{}: {message}", status.map(|s| format!(" ({s})")).unwrap_or_default())]
    ProviderUnavailable {
        message: String,
        status: Option<u16>,
    },

    /// The provider rejected the request with a terminal client error.
    #[error("provider rejected request ({status}): {message}")]
    ProviderRejected { status: u16, message: String },

    /// The circuit breaker for an endpoint is open; no call was made.
    #[error("circuit breaker open for {endpoint} ({failure_count} consecutive failures)")]
    CircuitOpen {
        endpoint: String,
        failure_count: u32,
    },

    /// All retry attempts were consumed without a success.
    #[error("retry exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// Every replica of an endpoint is currently gated by an open breaker.
    #[error("all {total} replicas are unhealthy (circuit open)")]
    AllReplicasUnhealthy { total: usize },

    /// An operation required a deployed resource that is not in the registry.
    #[error("resource {name} is not deployed")]
    NotDeployed { name: String },

    /// A coalesced deployment failed; all awaiters share the leader's error.
    #[error("{0}")]
    Coalesced(Arc<Error>),

    /// JSON (de)serialization failure.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem failure from the persistence layer.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// HTTP status associated with this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ProviderUnavailable { status, .. } => *status,
            Self::ProviderRejected { status, .. } => Some(*status),
            Self::Coalesced(inner) => inner.status_code(),
            _ => None,
        }
    }

    /// Check if this error came from an open circuit breaker.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error is retry exhaustion.
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    /// Check if this error represents a transient provider failure.
    pub fn is_provider_unavailable(&self) -> bool {
        match self {
            Self::ProviderUnavailable { .. } => true,
            Self::Coalesced(inner) => inner.is_provider_unavailable(),
            _ => false,
        }
    }

    /// Check if this error is a terminal provider rejection.
    pub fn is_provider_rejected(&self) -> bool {
        matches!(self, Self::ProviderRejected { .. })
    }

    /// The final cause of a [`Error::RetryExhausted`], if present.
    pub fn last_cause(&self) -> Option<&Error> {
        match self {
            Self::RetryExhausted { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Process exit code for CLI front-ends: 2 for configuration and
    /// credential problems the user must fix, 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigValidation(_) | Self::CredentialMissing => 2,
            Self::Coalesced(inner) => inner.exit_code(),
            _ => 1,
        }
    }

    /// Clone-able handle to this error for fan-out to coalesced awaiters.
    pub(crate) fn into_shared(self) -> Arc<Error> {
        match self {
            Self::Coalesced(inner) => inner,
            other => Arc::new(other),
        }
    }
}

impl From<Arc<Error>> for Error {
    fn from(shared: Arc<Error>) -> Self {
        Self::Coalesced(shared)
    }
}
