//! GCP: metadata server for self lookups, Compute Engine API for enumeration.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use join_structs::structs::CloudProvider;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::{
    CloudApi,
    error::LookupError,
    http::{self, CONTROL_PLANE_TIMEOUT, METADATA_TIMEOUT},
    identity::{InstanceRecord, RoleSource},
};

const METADATA_URL: &str = "http://metadata.google.internal/computeMetadata/v1";
const COMPUTE_URL: &str = "https://compute.googleapis.com/compute/v1";
const COMPUTE_SCOPE: &str = "https://www.googleapis.com/auth/compute.readonly";

const UID_LABEL: &str = "constellation-uid";
const INIT_SECRET_HASH_ATTRIBUTE: &str = "constellation-init-secret-hash";
const CREATED_BY_ATTRIBUTE: &str = "created-by";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AggregatedPage {
    #[serde(default)]
    items: HashMap<String, ScopedInstances>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScopedInstances {
    #[serde(default)]
    instances: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instance {
    name: Option<String>,
    zone: Option<String>,
    #[serde(default)]
    network_interfaces: Vec<NetworkInterface>,
    metadata: Option<InstanceMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterface {
    #[serde(rename = "networkIP")]
    network_ip: Option<String>,
    #[serde(default)]
    access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessConfig {
    #[serde(rename = "natIP")]
    nat_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InstanceMetadata {
    #[serde(default)]
    items: Vec<MetadataItem>,
}

#[derive(Debug, Deserialize)]
struct MetadataItem {
    key: String,
    #[serde(default)]
    value: String,
}

/// Last path segment of a GCP resource URL such as a zone or an instance group manager.
fn last_segment(resource: &str) -> &str {
    resource.rsplit('/').next().unwrap_or(resource)
}

/// Parses the `ssh-keys` attribute, `<user>:<key>` per line.
fn parse_ssh_keys(value: &str) -> BTreeMap<String, Vec<String>> {
    let mut by_user: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for line in value.lines() {
        let Some((user, key)) = line.split_once(':') else {
            continue;
        };
        if user.is_empty() || key.trim().is_empty() {
            continue;
        }
        by_user
            .entry(user.to_string())
            .or_default()
            .push(key.trim().to_string());
    }
    by_user
}

fn convert_instance(project: &str, instance: Value) -> InstanceRecord {
    let instance = match serde_json::from_value::<Instance>(instance) {
        Ok(instance) => instance,
        Err(err) => {
            warn!("Unreadable instance entry: {err}");
            return InstanceRecord::default();
        }
    };
    let metadata = |key: &str| {
        instance
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.items.iter().find(|item| item.key == key))
            .map(|item| item.value.as_str())
    };
    let provider_id = match (&instance.zone, &instance.name) {
        (Some(zone), Some(name)) => Some(format!("gce://{project}/{}/{name}", last_segment(zone))),
        _ => None,
    };
    InstanceRecord {
        provider_id,
        role_source: metadata(CREATED_BY_ATTRIBUTE)
            .map(|created_by| RoleSource::Group(last_segment(created_by).to_string())),
        ssh_keys: metadata("ssh-keys").map(parse_ssh_keys).unwrap_or_default(),
        private_ips: instance
            .network_interfaces
            .iter()
            .filter_map(|interface| interface.network_ip.clone())
            .collect(),
        public_ips: instance
            .network_interfaces
            .iter()
            .flat_map(|interface| &interface.access_configs)
            .filter_map(|config| config.nat_ip.clone())
            .collect(),
        name: instance.name,
    }
}

pub struct GcpApi {
    client: reqwest::Client,
}

impl GcpApi {
    pub fn new() -> anyhow::Result<Self> {
        Ok(GcpApi {
            client: http::client()?,
        })
    }

    async fn metadata(&self, path: &str) -> Result<String, LookupError> {
        http::required(
            self.client
                .get(format!("{METADATA_URL}/{path}"))
                .header("Metadata-Flavor", "Google")
                .timeout(METADATA_TIMEOUT),
            path,
        )
        .await
    }

    async fn zone(&self) -> Result<String, LookupError> {
        Ok(last_segment(&self.metadata("instance/zone").await?).to_string())
    }

    fn list_url(
        project: &str,
        uid: &str,
        page_token: Option<&str>,
    ) -> Result<Url, LookupError> {
        let mut url = Url::parse(&format!("{COMPUTE_URL}/projects/{project}/aggregated/instances"))
            .map_err(|err| LookupError::permanent("building the instance list URL", err))?;
        url.query_pairs_mut()
            .append_pair("filter", &format!("labels.{UID_LABEL}={uid}"));
        if let Some(token) = page_token {
            url.query_pairs_mut().append_pair("pageToken", token);
        }
        Ok(url)
    }
}

#[async_trait]
impl CloudApi for GcpApi {
    fn provider(&self) -> CloudProvider {
        CloudProvider::Gcp
    }

    async fn provider_id(&self) -> Result<String, LookupError> {
        let project = self.project_id().await?;
        let zone = self.zone().await?;
        let name = self.name().await?;
        Ok(format!("gce://{project}/{zone}/{name}"))
    }

    async fn name(&self) -> Result<String, LookupError> {
        self.metadata("instance/name").await
    }

    async fn project_id(&self) -> Result<String, LookupError> {
        self.metadata("project/project-id").await
    }

    async fn uid(&self) -> Result<String, LookupError> {
        self.metadata(&format!("instance/attributes/{UID_LABEL}"))
            .await
    }

    async fn vpc_ip(&self) -> Result<String, LookupError> {
        self.metadata("instance/network-interfaces/0/ip").await
    }

    async fn init_secret_hash(&self) -> Result<String, LookupError> {
        self.metadata(&format!("instance/attributes/{INIT_SECRET_HASH_ATTRIBUTE}"))
            .await
    }

    async fn role_source(&self) -> Result<RoleSource, LookupError> {
        let created_by = self
            .metadata(&format!("instance/attributes/{CREATED_BY_ATTRIBUTE}"))
            .await?;
        Ok(RoleSource::Group(last_segment(&created_by).to_string()))
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, LookupError> {
        let project = self.project_id().await?;
        let uid = self.uid().await?;

        let provider = gcp_auth::provider()
            .await
            .map_err(|err| LookupError::permanent("creating the GCP auth provider", err))?;
        let token = provider
            .token(&[COMPUTE_SCOPE])
            .await
            .map_err(|err| LookupError::transient("getting a GCP access token", err))?;

        let mut records = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let url = Self::list_url(&project, &uid, page_token.as_deref())?;
            debug!("Calling GCP API: {url}");
            let page: AggregatedPage = http::json(
                self.client
                    .get(url)
                    .bearer_auth(token.as_str())
                    .timeout(CONTROL_PLANE_TIMEOUT),
                "listing instances",
            )
            .await?;
            records.extend(
                page.items
                    .into_values()
                    .flat_map(|scope| scope.instances)
                    .map(|instance| convert_instance(&project, instance)),
            );
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(records)
    }
}
