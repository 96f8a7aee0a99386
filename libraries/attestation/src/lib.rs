//! Attestation documents for the cluster join protocol.
//!
//! A candidate node uses an [`Issuer`] to bind caller supplied user data and a
//! freshness nonce to its measurements. The join service checks the resulting
//! [`AttestationDocument`] with the [`Validator`] registered for the declared
//! [`AttestationVariant`].

pub mod cbor;
pub mod document;
pub mod error;
pub mod issuer;
pub mod measurements;
pub mod nonce;
pub mod policy;
pub mod quote;
pub mod registry;
pub mod validator;
pub mod variant;

pub use document::AttestationDocument;
pub use error::{IssuanceError, ValidationError};
pub use issuer::Issuer;
pub use nonce::Nonce;
pub use validator::{Validator, VerifiedClaims};
pub use variant::AttestationVariant;
