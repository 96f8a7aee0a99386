//! Bare metal and QEMU deployments: a static cluster inventory file stands in
//! for the cloud control plane.

use std::path::PathBuf;

use async_trait::async_trait;
use join_structs::structs::{CloudProvider, ClusterConfiguration, ClusterNode, Role};
use serde::Deserialize;

use crate::{
    CloudApi,
    error::LookupError,
    identity::{InstanceRecord, RoleSource},
};

const HOSTNAME_PATH: &str = "/proc/sys/kernel/hostname";
const DEFAULT_PROJECT: &str = "baremetal";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Inventory {
    #[serde(flatten)]
    cluster: ClusterConfiguration,
    #[serde(default)]
    uid: String,
    #[serde(default)]
    init_secret_hash: String,
    project: Option<String>,
}

fn provider_id(node: &ClusterNode) -> String {
    format!(
        "baremetal:///{}",
        node.vm_id.as_deref().unwrap_or(&node.name)
    )
}

fn non_empty(value: &str, what: &str) -> Result<String, LookupError> {
    if value.is_empty() {
        Err(LookupError::MissingMetadata(what.to_string()))
    } else {
        Ok(value.to_string())
    }
}

pub struct BareMetalApi {
    path: PathBuf,
    hostname: Option<String>,
}

impl BareMetalApi {
    pub fn new(path: PathBuf) -> Self {
        BareMetalApi {
            path,
            hostname: None,
        }
    }

    /// Identifies the running node by `hostname` instead of the kernel hostname.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Read on every call so inventory edits apply without a restart.
    async fn inventory(&self) -> Result<Inventory, LookupError> {
        let what = format!("reading cluster inventory {}", self.path.display());
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|err| LookupError::permanent(what.as_str(), err))?;
        serde_json::from_str(&content).map_err(|err| LookupError::permanent(what, err))
    }

    async fn hostname(&self) -> Result<String, LookupError> {
        if let Some(hostname) = &self.hostname {
            return Ok(hostname.clone());
        }
        let hostname = tokio::fs::read_to_string(HOSTNAME_PATH)
            .await
            .map_err(|err| LookupError::permanent("reading the hostname", err))?;
        non_empty(hostname.trim(), "hostname")
    }

    async fn this_node(&self) -> Result<(ClusterNode, Role), LookupError> {
        let hostname = self.hostname().await?;
        let inventory = self.inventory().await?;
        let mut matches: Vec<(ClusterNode, Role)> = inventory
            .cluster
            .nodes()
            .filter(|(node, _)| node.name == hostname)
            .map(|(node, role)| (node.clone(), role))
            .collect();
        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(LookupError::NotFound(format!("node {hostname} in the inventory"))),
            count => Err(LookupError::Ambiguous {
                what: format!("node {hostname}"),
                matches: count,
            }),
        }
    }
}

#[async_trait]
impl CloudApi for BareMetalApi {
    fn provider(&self) -> CloudProvider {
        CloudProvider::BareMetal
    }

    async fn provider_id(&self) -> Result<String, LookupError> {
        Ok(provider_id(&self.this_node().await?.0))
    }

    async fn name(&self) -> Result<String, LookupError> {
        Ok(self.this_node().await?.0.name)
    }

    async fn project_id(&self) -> Result<String, LookupError> {
        Ok(self
            .inventory()
            .await?
            .project
            .unwrap_or_else(|| DEFAULT_PROJECT.to_string()))
    }

    async fn uid(&self) -> Result<String, LookupError> {
        non_empty(&self.inventory().await?.uid, "inventory uid")
    }

    async fn vpc_ip(&self) -> Result<String, LookupError> {
        non_empty(&self.this_node().await?.0.address, "node address")
    }

    async fn init_secret_hash(&self) -> Result<String, LookupError> {
        non_empty(&self.inventory().await?.init_secret_hash, "inventory initSecretHash")
    }

    async fn role_source(&self) -> Result<RoleSource, LookupError> {
        Ok(RoleSource::Tag(self.this_node().await?.1.to_string()))
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, LookupError> {
        Ok(self
            .inventory()
            .await?
            .cluster
            .nodes()
            .map(|(node, role)| InstanceRecord {
                provider_id: Some(provider_id(node)),
                name: Some(node.name.clone()),
                role_source: Some(RoleSource::Tag(role.to_string())),
                private_ips: vec![node.address.clone()],
                ..Default::default()
            })
            .collect())
    }
}
