use std::{
    fmt::{self, Display},
    str::FromStr,
};

use asn1_rs::{Oid, oid};
use join_structs::structs::CloudProvider;
use serde::{Deserialize, Serialize};

/// Hardware trust technologies a node can attest with.
///
/// Adding a variant means adding a case here; the exhaustive matches in
/// [`crate::registry`] then refuse to compile until it has both an issuer and
/// a validator.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub enum AttestationVariant {
    /// Non production variant. Documents of this variant are never accepted.
    Dummy,
    AwsNitroTpm,
    AwsSevSnp,
    AzureSevSnp,
    AzureTdx,
    AzureTrustedLaunch,
    GcpSevEs,
    GcpSevSnp,
    QemuVtpm,
    QemuTdx,
}

pub const ALL_VARIANTS: [AttestationVariant; 10] = [
    AttestationVariant::Dummy,
    AttestationVariant::AwsNitroTpm,
    AttestationVariant::AwsSevSnp,
    AttestationVariant::AzureSevSnp,
    AttestationVariant::AzureTdx,
    AttestationVariant::AzureTrustedLaunch,
    AttestationVariant::GcpSevEs,
    AttestationVariant::GcpSevSnp,
    AttestationVariant::QemuVtpm,
    AttestationVariant::QemuTdx,
];

impl AttestationVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttestationVariant::Dummy => "dummy",
            AttestationVariant::AwsNitroTpm => "aws-nitro-tpm",
            AttestationVariant::AwsSevSnp => "aws-sev-snp",
            AttestationVariant::AzureSevSnp => "azure-sev-snp",
            AttestationVariant::AzureTdx => "azure-tdx",
            AttestationVariant::AzureTrustedLaunch => "azure-trustedlaunch",
            AttestationVariant::GcpSevEs => "gcp-sev-es",
            AttestationVariant::GcpSevSnp => "gcp-sev-snp",
            AttestationVariant::QemuVtpm => "qemu-vtpm",
            AttestationVariant::QemuTdx => "qemu-tdx",
        }
    }

    pub fn oid(&self) -> Oid<'static> {
        match self {
            AttestationVariant::Dummy => oid!(1.3.9900.1),
            AttestationVariant::AwsNitroTpm => oid!(1.3.9900.2.1),
            AttestationVariant::AwsSevSnp => oid!(1.3.9900.2.2),
            AttestationVariant::GcpSevEs => oid!(1.3.9900.3.1),
            AttestationVariant::GcpSevSnp => oid!(1.3.9900.3.2),
            AttestationVariant::AzureSevSnp => oid!(1.3.9900.4.1),
            AttestationVariant::AzureTrustedLaunch => oid!(1.3.9900.4.2),
            AttestationVariant::AzureTdx => oid!(1.3.9900.4.3),
            AttestationVariant::QemuVtpm => oid!(1.3.9900.5.1),
            AttestationVariant::QemuTdx => oid!(1.3.9900.5.99),
        }
    }

    /// Variant used when the operator asks for `default` on a provider.
    pub fn default_for(provider: CloudProvider) -> Self {
        match provider {
            CloudProvider::Aws => AttestationVariant::AwsSevSnp,
            CloudProvider::Azure => AttestationVariant::AzureSevSnp,
            CloudProvider::Gcp => AttestationVariant::GcpSevEs,
            CloudProvider::OpenStack | CloudProvider::BareMetal => AttestationVariant::QemuVtpm,
        }
    }

    /// Parses a variant name, resolving `default` against `provider`.
    pub fn resolve(name: &str, provider: CloudProvider) -> anyhow::Result<Self> {
        if name.eq_ignore_ascii_case("default") {
            return Ok(Self::default_for(provider));
        }
        name.parse()
    }

    pub fn is_production(&self) -> bool {
        !matches!(self, AttestationVariant::Dummy)
    }
}

/// Names accepted on command lines, for help texts.
pub fn available_variants() -> Vec<&'static str> {
    ALL_VARIANTS.iter().map(AttestationVariant::as_str).collect()
}

impl FromStr for AttestationVariant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_VARIANTS
            .iter()
            .find(|variant| variant.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| {
                anyhow::format_err!(
                    "unknown attestation variant {s:?}, choose one of: default, {}",
                    available_variants().join(", ")
                )
            })
    }
}

impl TryFrom<String> for AttestationVariant {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AttestationVariant> for String {
    fn from(value: AttestationVariant) -> Self {
        value.as_str().to_string()
    }
}

impl Display for AttestationVariant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
