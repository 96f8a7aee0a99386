use std::time::Duration;

use attestation::ValidationError;
use cloud_metadata::LookupError;
use join_structs::structs::ServerMessage;
use thiserror::Error;

/// Why a join attempt did not end in admission.
///
/// Detailed for the operator's logs only: the candidate sees one of two
/// opaque messages, see [`JoinError::response`].
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("attestation rejected: {0}")]
    Validation(#[from] ValidationError),

    #[error("identity lookup failed: {0}")]
    Lookup(#[from] LookupError),

    #[error("identity mismatch: {0}")]
    IdentityMismatch(String),

    #[error("issuing join material failed: {0:#}")]
    Issuance(anyhow::Error),

    #[error("attempt deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("internal error: {0:#}")]
    Internal(anyhow::Error),
}

impl JoinError {
    /// Failures of the service or its dependencies rather than of the candidate.
    pub fn is_service_fault(&self) -> bool {
        match self {
            JoinError::Issuance(_) | JoinError::Internal(_) | JoinError::DeadlineExceeded(_) => {
                true
            }
            JoinError::Lookup(err) => err.is_transient(),
            JoinError::MalformedRequest(_)
            | JoinError::Validation(_)
            | JoinError::IdentityMismatch(_) => false,
        }
    }

    /// Short label of the failure, for logs.
    pub fn cause(&self) -> &'static str {
        match self {
            JoinError::MalformedRequest(_) => "malformed-request",
            JoinError::Validation(err) => err.check(),
            JoinError::Lookup(LookupError::Transient { .. }) => "lookup-transient",
            JoinError::Lookup(LookupError::NotFound(_)) => "lookup-not-found",
            JoinError::Lookup(LookupError::Ambiguous { .. }) => "lookup-ambiguous",
            JoinError::Lookup(_) => "lookup",
            JoinError::IdentityMismatch(_) => "identity-mismatch",
            JoinError::Issuance(_) => "issuance",
            JoinError::DeadlineExceeded(_) => "deadline",
            JoinError::Internal(_) => "internal",
        }
    }

    /// What the candidate is told. Never carries the cause.
    pub fn response(&self) -> ServerMessage {
        if self.is_service_fault() {
            ServerMessage::unavailable()
        } else {
            ServerMessage::rejected()
        }
    }
}
