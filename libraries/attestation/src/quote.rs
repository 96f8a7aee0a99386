//! Signed statements over a node's measurements.
//!
//! The attestation key stands in for the hardware rooted key of the variant:
//! only the node's trusted execution environment holds the secret half, the
//! measurement policy pins the public half.

use std::{fmt, fs, path::Path, str::FromStr};

use dryoc::{
    sign::{PublicKey, SecretKey, SignedMessage, SigningKeyPair},
    types::{Bytes as _, StackByteArray},
};
use fn_error_context::context;
use serde::{Deserialize, Serialize};
use serde_with::{IfIsHumanReadable, base64::Base64, serde_as};

use crate::{
    cbor,
    error::{IssuanceError, ValidationError},
    measurements::{Digest, Measurements},
    variant::AttestationVariant,
};

const PUBLIC_KEY_LEN: usize = 32;
const SECRET_KEY_LEN: usize = 64;
const SIGNATURE_LEN: usize = 64;

/// What the attestation key signs.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct QuoteStatement {
    pub variant: AttestationVariant,
    pub measurements: Measurements,
    /// `SHA-256(nonce || user data)`, see [`crate::document::report_data`]
    pub report_data: Digest,
}

#[serde_as]
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct AttestationPublicKey(
    #[serde_as(as = "IfIsHumanReadable<serde_with::hex::Hex>")] [u8; PUBLIC_KEY_LEN],
);

impl fmt::Debug for AttestationPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Display for AttestationPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FromStr for AttestationPublicKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())?;
        let bytes: [u8; PUBLIC_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("attestation public key must be {PUBLIC_KEY_LEN} bytes"))?;
        Ok(AttestationPublicKey(bytes))
    }
}

#[serde_as]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub attestation_key: AttestationPublicKey,
    /// CBOR encoded [`QuoteStatement`]
    #[serde_as(as = "IfIsHumanReadable<Base64>")]
    pub statement: Vec<u8>,
    #[serde_as(as = "IfIsHumanReadable<Base64>")]
    pub signature: Vec<u8>,
}

impl Quote {
    /// Checks the signature against the embedded key and decodes the statement.
    ///
    /// Whether the key itself is trusted is the policy's business.
    pub fn verify(&self) -> Result<QuoteStatement, ValidationError> {
        let signature: [u8; SIGNATURE_LEN] = self.signature.as_slice().try_into().map_err(|_| {
            ValidationError::MalformedDocument(format!(
                "signature must be {SIGNATURE_LEN} bytes, got {}",
                self.signature.len()
            ))
        })?;
        let public_key = PublicKey::from(self.attestation_key.0);
        let signed = SignedMessage::from_parts(StackByteArray::from(signature), self.statement.clone());
        signed
            .verify(&public_key)
            .map_err(|_| ValidationError::BadSignature)?;

        cbor::from_slice_exact(&self.statement)
            .map_err(|err| ValidationError::MalformedDocument(format!("quote statement: {err}")))
    }
}

pub struct AttestationKeyPair {
    inner: SigningKeyPair<PublicKey, SecretKey>,
}

impl AttestationKeyPair {
    pub fn generate() -> Self {
        AttestationKeyPair {
            inner: SigningKeyPair::gen_with_defaults(),
        }
    }

    /// Loads a key from a file holding the hex encoded 64 byte secret key.
    #[context("loading attestation key from {}", path.as_ref().display())]
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let bytes = hex::decode(fs::read_to_string(path.as_ref())?.trim())?;
        let secret: [u8; SECRET_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("secret key must be {SECRET_KEY_LEN} bytes"))?;
        Ok(AttestationKeyPair {
            inner: SigningKeyPair::from_secret_key(SecretKey::from(secret)),
        })
    }

    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.inner.secret_key.as_slice())
    }

    pub fn public_key(&self) -> AttestationPublicKey {
        let mut bytes = [0u8; PUBLIC_KEY_LEN];
        bytes.copy_from_slice(self.inner.public_key.as_slice());
        AttestationPublicKey(bytes)
    }

    pub fn sign(&self, statement: &QuoteStatement) -> Result<Quote, IssuanceError> {
        let encoded =
            cbor::to_vec(statement).map_err(|err| IssuanceError::Encoding(err.into()))?;
        let signed = self
            .inner
            .sign_with_defaults(&encoded[..])
            .map_err(|err| IssuanceError::Signing(format!("{err:?}")))?;
        let (signature, statement) = signed.into_parts();
        Ok(Quote {
            attestation_key: self.public_key(),
            statement,
            signature: signature.as_slice().to_vec(),
        })
    }
}
