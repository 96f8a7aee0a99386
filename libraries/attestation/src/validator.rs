use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use crate::{
    document::{AttestationDocument, report_data},
    error::ValidationError,
    measurements::Measurements,
    nonce::Nonce,
    policy::PolicyStore,
    quote::AttestationPublicKey,
    variant::AttestationVariant,
};

/// What a successfully validated document proves.
#[derive(Debug, Clone)]
pub struct VerifiedClaims {
    pub variant: AttestationVariant,
    pub measurements: Measurements,
    pub attestation_key: AttestationPublicKey,
    pub policy_version: u64,
    /// Mismatches of warn-only measurements
    pub warnings: Vec<String>,
}

/// Checks documents on the join service side.
///
/// Implementations only report: they never release anything.
#[async_trait]
pub trait Validator: Send + Sync {
    fn variant(&self) -> AttestationVariant;

    /// Validates `document` against the current policy. The nonce is consumed.
    async fn validate(
        &self,
        document: &[u8],
        expected_user_data: &[u8],
        expected_nonce: Nonce,
    ) -> Result<VerifiedClaims, ValidationError>;
}

pub struct QuoteValidator {
    variant: AttestationVariant,
    policies: Arc<PolicyStore>,
}

impl QuoteValidator {
    pub fn new(variant: AttestationVariant, policies: Arc<PolicyStore>) -> Self {
        QuoteValidator { variant, policies }
    }
}

#[async_trait]
impl Validator for QuoteValidator {
    fn variant(&self) -> AttestationVariant {
        self.variant
    }

    async fn validate(
        &self,
        document: &[u8],
        expected_user_data: &[u8],
        expected_nonce: Nonce,
    ) -> Result<VerifiedClaims, ValidationError> {
        let document = AttestationDocument::from_bytes(document)?;
        if document.variant != self.variant {
            return Err(ValidationError::VariantMismatch {
                declared: document.variant,
                expected: self.variant,
            });
        }

        let policies = self.policies.snapshot();
        let policy = policies
            .get(self.variant)
            .ok_or(ValidationError::MissingPolicy(self.variant))?;

        let statement = document.quote.verify()?;
        if !policy.trusts(&document.quote.attestation_key) {
            return Err(ValidationError::UntrustedKey(
                document.quote.attestation_key.to_string(),
            ));
        }
        if statement.variant != self.variant {
            return Err(ValidationError::VariantMismatch {
                declared: statement.variant,
                expected: self.variant,
            });
        }

        if document.nonce != expected_nonce.as_bytes() {
            return Err(ValidationError::ExpiredOrWrongNonce);
        }
        if document.user_data != expected_user_data {
            return Err(ValidationError::UserDataMismatch);
        }
        if statement.report_data.0 != report_data(expected_nonce.as_bytes(), expected_user_data) {
            return Err(ValidationError::MalformedDocument(
                "report data does not bind the nonce and user data".to_string(),
            ));
        }

        statement
            .measurements
            .ensure_sanitized()
            .map_err(|err| ValidationError::MalformedDocument(err.to_string()))?;
        let warnings = policy.check(&statement.measurements)?;
        debug!(
            "{} document matches policy version {} ({} warnings)",
            self.variant,
            policy.version,
            warnings.len()
        );

        Ok(VerifiedClaims {
            variant: self.variant,
            measurements: statement.measurements,
            attestation_key: document.quote.attestation_key,
            policy_version: policy.version,
            warnings,
        })
    }
}

/// Validator of variants that carry no hardware evidence.
pub struct RejectingValidator {
    variant: AttestationVariant,
}

impl RejectingValidator {
    pub fn new(variant: AttestationVariant) -> Self {
        RejectingValidator { variant }
    }
}

#[async_trait]
impl Validator for RejectingValidator {
    fn variant(&self) -> AttestationVariant {
        self.variant
    }

    async fn validate(
        &self,
        _document: &[u8],
        _expected_user_data: &[u8],
        _expected_nonce: Nonce,
    ) -> Result<VerifiedClaims, ValidationError> {
        Err(ValidationError::UnsupportedVariant(format!(
            "{} is not a production variant",
            self.variant
        )))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::{
        issuer::{Issuer, QuoteIssuer, StaticMeasurements, StubIssuer},
        measurements::Digest,
        policy::{ExpectedMeasurement, MeasurementOption, MeasurementPolicy, PolicySet},
        quote::AttestationKeyPair,
    };

    pub(crate) fn golden() -> Measurements {
        [(4, Digest(vec![0x44; 32])), (8, Digest(vec![0x88; 32]))]
            .into_iter()
            .collect()
    }

    pub(crate) fn store_trusting(key: AttestationPublicKey) -> anyhow::Result<Arc<PolicyStore>> {
        let policy = MeasurementPolicy {
            version: 7,
            variant: AttestationVariant::QemuVtpm,
            measurements: golden()
                .0
                .into_iter()
                .map(|(index, expected)| {
                    (
                        index,
                        ExpectedMeasurement {
                            expected,
                            validation: MeasurementOption::Enforce,
                        },
                    )
                })
                .collect(),
            trusted_attestation_keys: BTreeSet::from([key]),
        };
        Ok(Arc::new(PolicyStore::new(PolicySet::new(vec![policy])?)))
    }

    fn issuer(key: AttestationKeyPair, measurements: Measurements) -> QuoteIssuer {
        QuoteIssuer::new(
            AttestationVariant::QemuVtpm,
            key,
            Box::new(StaticMeasurements(measurements)),
        )
    }

    #[tokio::test]
    async fn genuine_document_validates() -> anyhow::Result<()> {
        let key = AttestationKeyPair::generate();
        let validator = QuoteValidator::new(
            AttestationVariant::QemuVtpm,
            store_trusting(key.public_key())?,
        );
        let nonce = Nonce::generate()?;
        let document = issuer(key, golden()).issue(b"csr-hash", nonce.as_bytes()).await?;

        let claims = validator.validate(&document, b"csr-hash", nonce).await?;
        assert_eq!(claims.policy_version, 7);
        assert_eq!(claims.measurements, golden());
        assert!(claims.warnings.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn foreign_nonce_is_rejected() -> anyhow::Result<()> {
        let key = AttestationKeyPair::generate();
        let validator = QuoteValidator::new(
            AttestationVariant::QemuVtpm,
            store_trusting(key.public_key())?,
        );
        let n1 = Nonce::generate()?;
        let n2 = Nonce::generate()?;
        let document = issuer(key, golden()).issue(b"csr-hash", n2.as_bytes()).await?;

        let result = validator.validate(&document, b"csr-hash", n1).await;
        assert!(matches!(result, Err(ValidationError::ExpiredOrWrongNonce)));
        Ok(())
    }

    #[tokio::test]
    async fn other_user_data_is_rejected() -> anyhow::Result<()> {
        let key = AttestationKeyPair::generate();
        let validator = QuoteValidator::new(
            AttestationVariant::QemuVtpm,
            store_trusting(key.public_key())?,
        );
        let nonce = Nonce::generate()?;
        let document = issuer(key, golden()).issue(b"attacker-csr", nonce.as_bytes()).await?;

        let result = validator.validate(&document, b"csr-hash", nonce).await;
        assert!(matches!(result, Err(ValidationError::UserDataMismatch)));
        Ok(())
    }

    #[tokio::test]
    async fn clear_fields_cannot_be_rewritten() -> anyhow::Result<()> {
        let key = AttestationKeyPair::generate();
        let validator = QuoteValidator::new(
            AttestationVariant::QemuVtpm,
            store_trusting(key.public_key())?,
        );
        let nonce = Nonce::generate()?;
        let stale = issuer(key, golden()).issue(b"csr-hash", &[0; 32]).await?;

        let mut document = AttestationDocument::from_bytes(&stale)?;
        document.nonce = nonce.as_bytes().to_vec();
        let result = validator
            .validate(&document.to_bytes()?, b"csr-hash", nonce)
            .await;
        assert!(matches!(result, Err(ValidationError::MalformedDocument(_))));
        Ok(())
    }

    #[tokio::test]
    async fn unexpected_measurements_are_rejected() -> anyhow::Result<()> {
        let key = AttestationKeyPair::generate();
        let validator = QuoteValidator::new(
            AttestationVariant::QemuVtpm,
            store_trusting(key.public_key())?,
        );
        let mut measurements = golden();
        measurements.insert(8, Digest(vec![0x89; 32]));
        let nonce = Nonce::generate()?;
        let document = issuer(key, measurements).issue(b"csr-hash", nonce.as_bytes()).await?;

        let result = validator.validate(&document, b"csr-hash", nonce).await;
        assert!(matches!(
            result,
            Err(ValidationError::MeasurementMismatch { index: 8, .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn stub_document_is_rejected() -> anyhow::Result<()> {
        let key = AttestationKeyPair::generate();
        let validator = QuoteValidator::new(
            AttestationVariant::QemuVtpm,
            store_trusting(key.public_key())?,
        );
        let nonce = Nonce::generate()?;
        let document = StubIssuer::new(AttestationVariant::QemuVtpm)
            .issue(b"csr-hash", nonce.as_bytes())
            .await?;

        let result = validator.validate(&document, b"csr-hash", nonce).await;
        assert!(matches!(result, Err(ValidationError::UntrustedKey(_))));
        Ok(())
    }

    #[tokio::test]
    async fn document_of_another_variant_is_rejected() -> anyhow::Result<()> {
        let key = AttestationKeyPair::generate();
        let validator = QuoteValidator::new(
            AttestationVariant::QemuVtpm,
            store_trusting(key.public_key())?,
        );
        let nonce = Nonce::generate()?;
        let document = QuoteIssuer::new(
            AttestationVariant::GcpSevEs,
            key,
            Box::new(StaticMeasurements(golden())),
        )
        .issue(b"csr-hash", nonce.as_bytes())
        .await?;

        let result = validator.validate(&document, b"csr-hash", nonce).await;
        assert!(matches!(
            result,
            Err(ValidationError::VariantMismatch { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn dummy_variant_never_validates() -> anyhow::Result<()> {
        let nonce = Nonce::generate()?;
        let document = StubIssuer::new(AttestationVariant::Dummy)
            .issue(b"", nonce.as_bytes())
            .await?;
        let result = RejectingValidator::new(AttestationVariant::Dummy)
            .validate(&document, b"", nonce)
            .await;
        assert!(matches!(result, Err(ValidationError::UnsupportedVariant(_))));
        Ok(())
    }
}
