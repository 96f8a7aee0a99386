use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::Duration,
};

use anyhow::{Context, ensure};
use fn_error_context::context;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    error::ValidationError,
    measurements::{Digest, Measurements, SHA256_DIGEST_LEN},
    quote::AttestationPublicKey,
    variant::AttestationVariant,
};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MeasurementOption {
    #[default]
    Enforce,
    WarnOnly,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExpectedMeasurement {
    pub expected: Digest,
    #[serde(default)]
    pub validation: MeasurementOption,
}

/// Reference values for one variant.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementPolicy {
    pub version: u64,
    pub variant: AttestationVariant,
    pub measurements: BTreeMap<u32, ExpectedMeasurement>,
    pub trusted_attestation_keys: BTreeSet<AttestationPublicKey>,
}

impl MeasurementPolicy {
    pub fn ensure_well_formed(&self) -> anyhow::Result<()> {
        ensure!(
            !self.measurements.is_empty(),
            "policy {} for {} has no measurements",
            self.version,
            self.variant
        );
        ensure!(
            !self.trusted_attestation_keys.is_empty(),
            "policy {} for {} trusts no attestation key",
            self.version,
            self.variant
        );
        for (index, measurement) in &self.measurements {
            ensure!(
                measurement.expected.0.len() == SHA256_DIGEST_LEN,
                "policy {} for {}: measurement {index} is not a SHA-256 digest",
                self.version,
                self.variant
            );
        }
        Ok(())
    }

    pub fn trusts(&self, key: &AttestationPublicKey) -> bool {
        self.trusted_attestation_keys.contains(key)
    }

    /// Compares reported measurements with the policy.
    ///
    /// Mismatches of warn-only entries come back as warnings, any enforced
    /// mismatch or missing register fails.
    pub fn check(&self, actual: &Measurements) -> Result<Vec<String>, ValidationError> {
        let mut warnings = Vec::new();
        for (index, measurement) in &self.measurements {
            let reported = actual.get(*index);
            if reported == Some(&measurement.expected) {
                continue;
            }
            let actual = reported.map_or_else(|| "nothing".to_string(), |digest| digest.to_string());
            match measurement.validation {
                MeasurementOption::Enforce => {
                    return Err(ValidationError::MeasurementMismatch {
                        index: *index,
                        expected: measurement.expected.clone(),
                        actual,
                    });
                }
                MeasurementOption::WarnOnly => warnings.push(format!(
                    "measurement {index}: expected {}, got {actual}",
                    measurement.expected
                )),
            }
        }
        Ok(warnings)
    }
}

/// The policies loaded from one policy file, at most one per variant.
#[derive(Clone, Debug, Default)]
pub struct PolicySet {
    policies: BTreeMap<AttestationVariant, MeasurementPolicy>,
}

impl PolicySet {
    pub fn new(policies: Vec<MeasurementPolicy>) -> anyhow::Result<Self> {
        let mut set = BTreeMap::new();
        for policy in policies {
            policy.ensure_well_formed()?;
            let variant = policy.variant;
            ensure!(
                set.insert(variant, policy).is_none(),
                "more than one policy for {variant}"
            );
        }
        Ok(PolicySet { policies: set })
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Self::new(serde_json::from_str(json).context("parsing measurement policies")?)
    }

    #[context("loading measurement policies from {}", path.display())]
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn get(&self, variant: AttestationVariant) -> Option<&MeasurementPolicy> {
        self.policies.get(&variant)
    }

    pub fn variants(&self) -> impl Iterator<Item = AttestationVariant> + '_ {
        self.policies.keys().copied()
    }
}

/// Read-mostly holder of the current [`PolicySet`].
///
/// Validations take a snapshot; a reload swaps the whole set so that a single
/// validation never sees two policy versions.
#[derive(Debug)]
pub struct PolicyStore {
    current: RwLock<Arc<PolicySet>>,
}

impl PolicyStore {
    pub fn new(set: PolicySet) -> Self {
        PolicyStore {
            current: RwLock::new(Arc::new(set)),
        }
    }

    pub fn snapshot(&self) -> Arc<PolicySet> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn replace(&self, set: PolicySet) {
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(set);
    }

    /// Re-reads `path`. On failure the previous policies stay in force.
    pub fn reload(&self, path: &Path) -> anyhow::Result<()> {
        let set = PolicySet::load(path)?;
        for variant in set.variants() {
            if let Some(policy) = set.get(variant) {
                info!("Loaded policy version {} for {}", policy.version, variant);
            }
        }
        self.replace(set);
        Ok(())
    }

    /// Reloads the policy file every `interval` until the returned task is aborted.
    pub fn spawn_refresh(
        self: Arc<Self>,
        path: PathBuf,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = self.reload(&path) {
                    error!("Keeping previous measurement policies: {:?}", err);
                }
            }
        })
    }
}

pub fn log_warnings(variant: AttestationVariant, warnings: &[String]) {
    for warning in warnings {
        warn!("{variant}: warn-only {warning}");
    }
}
