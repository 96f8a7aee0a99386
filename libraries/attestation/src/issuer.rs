use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use async_trait::async_trait;
use log::debug;

use crate::{
    document::{AttestationDocument, report_data},
    error::IssuanceError,
    measurements::{Digest, Measurements},
    quote::{AttestationKeyPair, QuoteStatement},
    variant::AttestationVariant,
};

/// Produces attestation documents on the candidate node.
#[async_trait]
pub trait Issuer: Send + Sync {
    fn variant(&self) -> AttestationVariant;

    /// Binds `user_data` and `nonce` to this node's measurements.
    async fn issue(&self, user_data: &[u8], nonce: &[u8]) -> Result<Vec<u8>, IssuanceError>;
}

/// Where an issuer reads the node's current measurements from.
pub trait MeasurementSource: Send + Sync {
    fn read(&self) -> anyhow::Result<Measurements>;
}

/// SHA-256 PCR bank exposed by the kernel under `/sys/class/tpm/tpm0/pcr-sha256`.
pub struct SysfsPcrSource {
    bank: PathBuf,
    indices: Vec<u32>,
}

impl SysfsPcrSource {
    pub const DEFAULT_BANK: &'static str = "/sys/class/tpm/tpm0/pcr-sha256";

    pub fn new(bank: impl Into<PathBuf>, indices: Vec<u32>) -> Self {
        SysfsPcrSource {
            bank: bank.into(),
            indices,
        }
    }

    pub fn with_default_bank() -> Self {
        Self::new(Self::DEFAULT_BANK, (0..24).collect())
    }
}

impl MeasurementSource for SysfsPcrSource {
    fn read(&self) -> anyhow::Result<Measurements> {
        let measurements = self
            .indices
            .iter()
            .map(|index| -> anyhow::Result<(u32, Digest)> {
                let path = self.bank.join(index.to_string());
                let value = fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                Ok((*index, Digest::from_hex(&value)?))
            })
            .collect::<anyhow::Result<Measurements>>()?;
        measurements.ensure_sanitized()?;
        Ok(measurements)
    }
}

/// Fixed measurements, for development VMs without a TPM.
pub struct StaticMeasurements(pub Measurements);

impl StaticMeasurements {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("reading measurements from {}", path.display()))?;
        Ok(StaticMeasurements(serde_json::from_str(&json)?))
    }
}

impl MeasurementSource for StaticMeasurements {
    fn read(&self) -> anyhow::Result<Measurements> {
        Ok(self.0.clone())
    }
}

/// Signs the node's measurements with the key held by its trusted environment.
pub struct QuoteIssuer {
    variant: AttestationVariant,
    key: AttestationKeyPair,
    source: Box<dyn MeasurementSource>,
}

impl QuoteIssuer {
    pub fn new(
        variant: AttestationVariant,
        key: AttestationKeyPair,
        source: Box<dyn MeasurementSource>,
    ) -> Self {
        QuoteIssuer {
            variant,
            key,
            source,
        }
    }
}

#[async_trait]
impl Issuer for QuoteIssuer {
    fn variant(&self) -> AttestationVariant {
        self.variant
    }

    async fn issue(&self, user_data: &[u8], nonce: &[u8]) -> Result<Vec<u8>, IssuanceError> {
        let measurements = self.source.read().map_err(IssuanceError::Measurements)?;
        debug!(
            "Issuing {} document over {} measurements",
            self.variant,
            measurements.0.len()
        );
        let statement = QuoteStatement {
            variant: self.variant,
            measurements,
            report_data: Digest(report_data(nonce, user_data).to_vec()),
        };
        let document = AttestationDocument {
            variant: self.variant,
            nonce: nonce.to_vec(),
            user_data: user_data.to_vec(),
            quote: self.key.sign(&statement)?,
        };
        document.to_bytes().map_err(IssuanceError::Encoding)
    }
}

/// Issuer for tests and for the unattested-node scenario.
///
/// Its documents are well formed and carry the right nonce and user data, but
/// the quote is signed by a throwaway key with no measurements behind it.
pub struct StubIssuer {
    variant: AttestationVariant,
}

impl StubIssuer {
    pub fn new(variant: AttestationVariant) -> Self {
        StubIssuer { variant }
    }
}

#[async_trait]
impl Issuer for StubIssuer {
    fn variant(&self) -> AttestationVariant {
        self.variant
    }

    async fn issue(&self, user_data: &[u8], nonce: &[u8]) -> Result<Vec<u8>, IssuanceError> {
        let statement = QuoteStatement {
            variant: self.variant,
            measurements: Measurements::default(),
            report_data: Digest(report_data(nonce, user_data).to_vec()),
        };
        let document = AttestationDocument {
            variant: self.variant,
            nonce: nonce.to_vec(),
            user_data: user_data.to_vec(),
            quote: AttestationKeyPair::generate().sign(&statement)?,
        };
        document.to_bytes().map_err(IssuanceError::Encoding)
    }
}
