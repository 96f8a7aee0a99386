//! Variant to implementation tables.
//!
//! Both [`validator_for`] and [`issuer_for`] match exhaustively on
//! [`AttestationVariant`], so a new variant without an issuer or a validator
//! does not compile. [`ValidatorRegistry::ensure_complete`] repeats the check at
//! start-up for registries assembled by hand.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::ensure;
use log::info;

use crate::{
    error::ValidationError,
    issuer::{Issuer, MeasurementSource, QuoteIssuer, StubIssuer},
    policy::PolicyStore,
    quote::AttestationKeyPair,
    validator::{QuoteValidator, RejectingValidator, Validator},
    variant::{ALL_VARIANTS, AttestationVariant},
};

pub fn validator_for(variant: AttestationVariant, policies: &Arc<PolicyStore>) -> Arc<dyn Validator> {
    match variant {
        AttestationVariant::Dummy => Arc::new(RejectingValidator::new(variant)),
        AttestationVariant::AwsNitroTpm
        | AttestationVariant::AwsSevSnp
        | AttestationVariant::AzureSevSnp
        | AttestationVariant::AzureTdx
        | AttestationVariant::AzureTrustedLaunch
        | AttestationVariant::GcpSevEs
        | AttestationVariant::GcpSevSnp
        | AttestationVariant::QemuVtpm
        | AttestationVariant::QemuTdx => Arc::new(QuoteValidator::new(variant, policies.clone())),
    }
}

/// Everything a production issuer needs from the node.
pub struct IssuerMaterial {
    pub key: AttestationKeyPair,
    pub source: Box<dyn MeasurementSource>,
}

/// Builds the issuer of `variant`. `material` is only consumed by variants
/// that produce real evidence.
pub fn issuer_for(
    variant: AttestationVariant,
    material: impl FnOnce() -> anyhow::Result<IssuerMaterial>,
) -> anyhow::Result<Arc<dyn Issuer>> {
    Ok(match variant {
        AttestationVariant::Dummy => Arc::new(StubIssuer::new(variant)),
        AttestationVariant::AwsNitroTpm
        | AttestationVariant::AwsSevSnp
        | AttestationVariant::AzureSevSnp
        | AttestationVariant::AzureTdx
        | AttestationVariant::AzureTrustedLaunch
        | AttestationVariant::GcpSevEs
        | AttestationVariant::GcpSevSnp
        | AttestationVariant::QemuVtpm
        | AttestationVariant::QemuTdx => {
            let IssuerMaterial { key, source } = material()?;
            Arc::new(QuoteIssuer::new(variant, key, source))
        }
    })
}

/// Validators of the join service, built once at start-up and injected.
#[derive(Clone)]
pub struct ValidatorRegistry {
    validators: BTreeMap<AttestationVariant, Arc<dyn Validator>>,
}

impl ValidatorRegistry {
    /// A validator for every known variant, all reading `policies`.
    pub fn new(policies: &Arc<PolicyStore>) -> Self {
        ValidatorRegistry {
            validators: ALL_VARIANTS
                .iter()
                .map(|variant| (*variant, validator_for(*variant, policies)))
                .collect(),
        }
    }

    pub fn empty() -> Self {
        ValidatorRegistry {
            validators: BTreeMap::new(),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validators.insert(validator.variant(), validator);
        self
    }

    pub fn get(&self, variant: AttestationVariant) -> Result<Arc<dyn Validator>, ValidationError> {
        self.validators
            .get(&variant)
            .cloned()
            .ok_or_else(|| ValidationError::UnsupportedVariant(variant.to_string()))
    }

    pub fn ensure_complete(&self) -> anyhow::Result<()> {
        let missing: Vec<_> = ALL_VARIANTS
            .iter()
            .filter(|variant| !self.validators.contains_key(variant))
            .map(|variant| variant.as_str())
            .collect();
        ensure!(
            missing.is_empty(),
            "no validator registered for: {}",
            missing.join(", ")
        );
        for (variant, validator) in &self.validators {
            ensure!(
                validator.variant() == *variant,
                "validator for {} registered under {variant}",
                validator.variant()
            );
        }
        info!("Validators registered for {} variants", self.validators.len());
        Ok(())
    }
}
