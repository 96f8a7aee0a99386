use thiserror::Error;

use crate::{measurements::Digest, variant::AttestationVariant};

/// Why a document was refused. Terminal for the attempt it belongs to.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("malformed attestation document: {0}")]
    MalformedDocument(String),

    #[error("document nonce does not match the nonce issued for this attempt")]
    ExpiredOrWrongNonce,

    #[error("document user data does not match the expected binding")]
    UserDataMismatch,

    #[error("measurement {index} mismatch: expected {expected}, got {actual}")]
    MeasurementMismatch {
        index: u32,
        expected: Digest,
        actual: String,
    },

    #[error("attestation variant {0} is not supported")]
    UnsupportedVariant(String),

    #[error("document declares variant {declared} but was checked as {expected}")]
    VariantMismatch {
        declared: AttestationVariant,
        expected: AttestationVariant,
    },

    #[error("attestation key {0} is not trusted by the measurement policy")]
    UntrustedKey(String),

    #[error("evidence signature does not verify")]
    BadSignature,

    #[error("no measurement policy loaded for {0}")]
    MissingPolicy(AttestationVariant),
}

impl ValidationError {
    /// Short label of the failed check, for logs.
    pub fn check(&self) -> &'static str {
        match self {
            ValidationError::MalformedDocument(_) => "malformed-document",
            ValidationError::ExpiredOrWrongNonce => "nonce",
            ValidationError::UserDataMismatch => "user-data",
            ValidationError::MeasurementMismatch { .. } => "measurements",
            ValidationError::UnsupportedVariant(_) => "unsupported-variant",
            ValidationError::VariantMismatch { .. } => "variant",
            ValidationError::UntrustedKey(_) => "untrusted-key",
            ValidationError::BadSignature => "signature",
            ValidationError::MissingPolicy(_) => "policy",
        }
    }
}

#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error("reading measurements failed")]
    Measurements(#[source] anyhow::Error),

    #[error("signing the quote failed: {0}")]
    Signing(String),

    #[error("encoding the attestation document failed")]
    Encoding(#[source] anyhow::Error),
}
