use std::{
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use serde_with::{IfIsHumanReadable, base64::Base64, serde_as};

/// Reason sent to a candidate whose join attempt was refused. It is the same
/// for every refusal so that callers cannot learn which check failed.
pub const ADMISSION_DENIED: &str = "admission denied";

/// Reason sent when the service itself failed while producing admission material.
pub const SERVICE_UNAVAILABLE: &str = "join service unavailable, retry later";

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    Aws,
    Azure,
    Gcp,
    OpenStack,
    BareMetal,
}

impl FromStr for CloudProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aws" => Ok(CloudProvider::Aws),
            "azure" => Ok(CloudProvider::Azure),
            "gcp" => Ok(CloudProvider::Gcp),
            "openstack" => Ok(CloudProvider::OpenStack),
            "baremetal" | "qemu" => Ok(CloudProvider::BareMetal),
            _ => Err(anyhow::format_err!(
                "Choose a cloud provider between aws, azure, gcp, openstack, baremetal."
            )),
        }
    }
}

impl Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            CloudProvider::Aws => write!(f, "aws"),
            CloudProvider::Azure => write!(f, "azure"),
            CloudProvider::Gcp => write!(f, "gcp"),
            CloudProvider::OpenStack => write!(f, "openstack"),
            CloudProvider::BareMetal => write!(f, "baremetal"),
        }
    }
}

/// Logical role of a node inside the cluster.
///
/// A role is always derived from cloud ground truth (group name or role tag).
/// `Unknown` never satisfies a claimed role.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    #[default]
    Unknown,
    ControlPlane,
    Worker,
}

impl Role {
    pub fn from_claim(is_control_plane: bool) -> Self {
        if is_control_plane {
            Role::ControlPlane
        } else {
            Role::Worker
        }
    }

    /// Whether a candidate claiming `is_control_plane` may be admitted with this role.
    pub fn satisfies_claim(self, is_control_plane: bool) -> bool {
        match self {
            Role::Unknown => false,
            Role::ControlPlane => is_control_plane,
            Role::Worker => !is_control_plane,
        }
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "control-plane" | "controlplane" => Ok(Role::ControlPlane),
            "worker" => Ok(Role::Worker),
            _ => Ok(Role::Unknown),
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Role::Unknown => write!(f, "unknown"),
            Role::ControlPlane => write!(f, "control-plane"),
            Role::Worker => write!(f, "worker"),
        }
    }
}

/// First message of every join session, sent by the service.
#[serde_as]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Challenge {
    #[serde_as(as = "IfIsHumanReadable<Base64>")]
    pub nonce: Vec<u8>,
}

#[serde_as]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub disk_uuid: String,
    /// DER encoded PKCS#10 certificate signing request
    #[serde_as(as = "IfIsHumanReadable<Base64>")]
    pub certificate_request: Vec<u8>,
    pub is_control_plane: bool,
    #[serde_as(as = "IfIsHumanReadable<Base64>")]
    pub attestation_document: Vec<u8>,
}

#[serde_as]
#[derive(Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub bootstrap_token: String,
    /// DER encoded kubelet certificate signed by the cluster CA
    #[serde_as(as = "IfIsHumanReadable<Base64>")]
    pub signed_certificate: Vec<u8>,
    #[serde_as(as = "IfIsHumanReadable<Base64>")]
    pub disk_encryption_key: Vec<u8>,
    /// PEM bundle of the cluster CA
    #[serde_as(as = "IfIsHumanReadable<Base64>")]
    pub cluster_ca_bundle: Vec<u8>,
    pub api_server_endpoint: String,
    /// `sha256:<hex>` digest of the CA public key, as consumed by `kubeadm join`
    pub discovery_token_ca_cert_hash: String,
    pub kubernetes_version: String,
    #[serde_as(as = "IfIsHumanReadable<Base64>")]
    pub measurement_salt: Vec<u8>,
}

impl fmt::Debug for JoinResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinResponse")
            .field("bootstrap_token", &"<redacted>")
            .field("signed_certificate_len", &self.signed_certificate.len())
            .field("disk_encryption_key", &"<redacted>")
            .field("api_server_endpoint", &self.api_server_endpoint)
            .field("kubernetes_version", &self.kubernetes_version)
            .finish()
    }
}

/// Sent by an already known node after a reboot to recover its disk key.
#[serde_as]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RejoinRequest {
    pub disk_uuid: String,
    #[serde_as(as = "IfIsHumanReadable<Base64>")]
    pub attestation_document: Vec<u8>,
}

#[serde_as]
#[derive(Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RejoinResponse {
    #[serde_as(as = "IfIsHumanReadable<Base64>")]
    pub disk_encryption_key: Vec<u8>,
    #[serde_as(as = "IfIsHumanReadable<Base64>")]
    pub measurement_salt: Vec<u8>,
}

impl fmt::Debug for RejoinResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RejoinResponse")
            .field("disk_encryption_key", &"<redacted>")
            .finish()
    }
}

/// Messages the service sends over a join session.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    Challenge(Challenge),
    Admitted(JoinResponse),
    Rejoined(RejoinResponse),
    Rejected { message: String },
    Unavailable { message: String },
}

impl ServerMessage {
    pub fn rejected() -> Self {
        ServerMessage::Rejected {
            message: ADMISSION_DENIED.to_string(),
        }
    }

    pub fn unavailable() -> Self {
        ServerMessage::Unavailable {
            message: SERVICE_UNAVAILABLE.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct ClusterNode {
    pub name: String,
    pub address: String,
    pub vm_id: Option<String>,
}

/// Static inventory of a bare metal deployment.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ClusterConfiguration {
    #[serde(default)]
    pub servers: Vec<ClusterNode>,
    #[serde(default)]
    pub agents: Vec<ClusterNode>,
}

impl ClusterConfiguration {
    /// All nodes paired with the role their section of the file grants them.
    pub fn nodes(&self) -> impl Iterator<Item = (&ClusterNode, Role)> {
        self.servers
            .iter()
            .map(|node| (node, Role::ControlPlane))
            .chain(self.agents.iter().map(|node| (node, Role::Worker)))
    }
}
