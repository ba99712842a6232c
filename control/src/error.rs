use common::{ConfigError, CredentialError};
use std::time::Duration;
use thiserror::Error;

/// tunnelgate control plane errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("provider transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("provider API returned {status}: {message}")]
    Provider { status: u16, message: String },

    #[error("invalid provider URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid parametersRef: {0}")]
    InvalidParameters(String),

    #[error("credential secret does not contain a {0} key")]
    MissingField(&'static str),

    #[error("invalid token")]
    InvalidToken,

    #[error("failed token validation: expected 200 OK, got {status}: {message}")]
    ValidationFailed { status: u16, message: String },

    #[error("expected at most 1 tunnel named {name}, found {count}; delete the duplicates manually")]
    AmbiguousExternalState { name: String, count: usize },

    #[error("tunnel {tunnel_id} had no persisted credentials and was deleted; it will be recreated")]
    OrphanedTunnel { tunnel_id: String },

    #[error("invalid tunnel config: {0}")]
    Config(#[from] ConfigError),

    #[error("tunnel credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("{kind} {name} not found")]
    MissingObject { kind: &'static str, name: String },
}

impl Error {
    /// Whether a later reconcile can succeed without anyone changing inputs.
    /// Every failure is still requeued; this only picks the log level.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            Error::MissingField(_)
                | Error::InvalidParameters(_)
                | Error::InvalidToken
                | Error::AmbiguousExternalState { .. }
                | Error::Url(_)
        )
    }

    /// Failures caused by what the operator configured, reported as a
    /// rejected GatewayClass rather than a reconcile error
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::InvalidParameters(_)
                | Error::MissingField(_)
                | Error::InvalidToken
                | Error::ValidationFailed { .. }
                | Error::MissingObject { kind: "Secret", .. }
        )
    }

    /// Optimistic-concurrency loss on a write; the next pass re-reads and retries
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kubernetes(kube::Error::Api(resp)) if resp.code == 409)
    }

    /// Short label for the reconcile result metric
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::Kubernetes(_) if self.is_conflict() => "conflict",
            Error::Kubernetes(_) | Error::Timeout { .. } | Error::Transport(_) => "transport_error",
            Error::Provider { .. } => "provider_error",
            Error::InvalidParameters(_)
            | Error::MissingField(_)
            | Error::InvalidToken
            | Error::ValidationFailed { .. } => "validation_failed",
            Error::AmbiguousExternalState { .. } => "ambiguous_external_state",
            Error::OrphanedTunnel { .. } => "orphaned_tunnel",
            Error::Config(_) | Error::Url(_) => "invalid_config",
            Error::Credential(_) => "internal_error",
            Error::MissingObject { .. } => "missing_object",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
