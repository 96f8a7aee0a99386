//! OpenStack: config drive style metadata service for self lookups, Keystone
//! and Nova for enumeration.

use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use join_structs::structs::CloudProvider;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    CloudApi,
    error::LookupError,
    http::{self, CONTROL_PLANE_TIMEOUT, METADATA_TIMEOUT},
    identity::{InstanceRecord, RoleSource},
};

const META_DATA_URL: &str = "http://169.254.169.254/openstack/2012-08-10/meta_data.json";
const LOCAL_IPV4_URL: &str = "http://169.254.169.254/latest/meta-data/local-ipv4";

const ROLE_TAG: &str = "constellation-role";
const UID_TAG: &str = "constellation-uid";
const INIT_SECRET_HASH_TAG: &str = "constellation-init-secret-hash";

/// Credentials for the Keystone password flow, read from the usual `OS_*` variables.
#[derive(Debug, Deserialize)]
pub struct OpenStackCredentials {
    pub os_auth_url: String,
    pub os_username: String,
    pub os_password: String,
    pub os_project_id: String,
    #[serde(default = "default_domain")]
    pub os_user_domain_name: String,
    pub os_region_name: Option<String>,
}

fn default_domain() -> String {
    "Default".to_string()
}

#[derive(Debug, Deserialize)]
struct MetaData {
    uuid: String,
    name: String,
    project_id: String,
    #[serde(default)]
    meta: BTreeMap<String, String>,
}

impl MetaData {
    fn tag(&self, key: &str) -> Result<String, LookupError> {
        self.meta
            .get(key)
            .filter(|value| !value.is_empty())
            .cloned()
            .ok_or_else(|| LookupError::MissingMetadata(format!("meta {key}")))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

#[derive(Debug, Deserialize)]
struct Endpoint {
    interface: String,
    region: Option<String>,
    url: String,
}

#[derive(Debug, Deserialize)]
struct ServerPage {
    #[serde(default)]
    servers: Vec<Value>,
    #[serde(default)]
    servers_links: Vec<Link>,
}

#[derive(Debug, Deserialize)]
struct Link {
    rel: String,
    href: String,
}

#[derive(Debug, Deserialize)]
struct Server {
    id: Option<String>,
    name: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default)]
    addresses: BTreeMap<String, Vec<Address>>,
}

#[derive(Debug, Deserialize)]
struct Address {
    addr: String,
    #[serde(rename = "OS-EXT-IPS:type")]
    kind: Option<String>,
}

/// Public compute endpoint from the service catalog, in `region` if given.
fn compute_endpoint(catalog: &[CatalogEntry], region: Option<&str>) -> Option<String> {
    catalog
        .iter()
        .filter(|entry| entry.service_type == "compute")
        .flat_map(|entry| &entry.endpoints)
        .find(|endpoint| {
            endpoint.interface == "public"
                && region.is_none_or(|region| endpoint.region.as_deref() == Some(region))
        })
        .map(|endpoint| endpoint.url.trim_end_matches('/').to_string())
}

/// Records of the servers belonging to the deployment `uid`. Servers of other
/// deployments are dropped, unreadable ones become empty records.
fn convert_servers(servers: Vec<Value>, uid: &str) -> Vec<InstanceRecord> {
    servers
        .into_iter()
        .filter_map(|server| match serde_json::from_value::<Server>(server) {
            Ok(server) if server.metadata.get(UID_TAG).map(String::as_str) != Some(uid) => None,
            Ok(server) => {
                let (floating, fixed): (Vec<Address>, Vec<Address>) = server
                    .addresses
                    .into_values()
                    .flatten()
                    .partition(|address| address.kind.as_deref() == Some("floating"));
                Some(InstanceRecord {
                    provider_id: server.id.map(|id| format!("openstack:///{id}")),
                    name: server.name,
                    role_source: server.metadata.get(ROLE_TAG).cloned().map(RoleSource::Tag),
                    private_ips: fixed.into_iter().map(|address| address.addr).collect(),
                    public_ips: floating.into_iter().map(|address| address.addr).collect(),
                    ssh_keys: BTreeMap::new(),
                })
            }
            Err(err) => {
                warn!("Unreadable server entry: {err}");
                Some(InstanceRecord::default())
            }
        })
        .collect()
}

pub struct OpenStackApi {
    client: reqwest::Client,
    credentials: OpenStackCredentials,
}

impl OpenStackApi {
    pub fn new() -> anyhow::Result<Self> {
        let credentials = envy::from_env::<OpenStackCredentials>()
            .context("Error reading OpenStack credentials from the OS_* environment variables")?;
        Ok(OpenStackApi {
            client: http::client()?,
            credentials,
        })
    }

    async fn meta_data(&self) -> Result<MetaData, LookupError> {
        http::json(
            self.client.get(META_DATA_URL).timeout(METADATA_TIMEOUT),
            "querying the OpenStack metadata service",
        )
        .await
    }

    /// Keystone token and the compute endpoint to use it with.
    async fn authenticate(&self) -> Result<(String, String), LookupError> {
        let what = "authenticating with Keystone";
        let credentials = &self.credentials;
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {"user": {
                        "name": credentials.os_username,
                        "domain": {"name": credentials.os_user_domain_name},
                        "password": credentials.os_password,
                    }}
                },
                "scope": {"project": {"id": credentials.os_project_id}}
            }
        });
        let response = http::send(
            self.client
                .post(format!(
                    "{}/auth/tokens",
                    credentials.os_auth_url.trim_end_matches('/')
                ))
                .json(&body)
                .timeout(CONTROL_PLANE_TIMEOUT),
            what,
        )
        .await?;
        let token = response
            .headers()
            .get("X-Subject-Token")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| LookupError::permanent(what, "no X-Subject-Token header"))?;
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|err| LookupError::permanent(what, err))?;
        let endpoint =
            compute_endpoint(&body.token.catalog, credentials.os_region_name.as_deref())
                .ok_or_else(|| LookupError::permanent(what, "no public compute endpoint"))?;
        Ok((token, endpoint))
    }
}

#[async_trait]
impl CloudApi for OpenStackApi {
    fn provider(&self) -> CloudProvider {
        CloudProvider::OpenStack
    }

    async fn provider_id(&self) -> Result<String, LookupError> {
        Ok(format!("openstack:///{}", self.meta_data().await?.uuid))
    }

    async fn name(&self) -> Result<String, LookupError> {
        Ok(self.meta_data().await?.name)
    }

    async fn project_id(&self) -> Result<String, LookupError> {
        Ok(self.meta_data().await?.project_id)
    }

    async fn uid(&self) -> Result<String, LookupError> {
        self.meta_data().await?.tag(UID_TAG)
    }

    async fn vpc_ip(&self) -> Result<String, LookupError> {
        http::required(
            self.client.get(LOCAL_IPV4_URL).timeout(METADATA_TIMEOUT),
            "local-ipv4",
        )
        .await
    }

    async fn init_secret_hash(&self) -> Result<String, LookupError> {
        self.meta_data().await?.tag(INIT_SECRET_HASH_TAG)
    }

    async fn role_source(&self) -> Result<RoleSource, LookupError> {
        Ok(RoleSource::Tag(self.meta_data().await?.tag(ROLE_TAG)?))
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, LookupError> {
        let uid = self.uid().await?;
        let (token, endpoint) = self.authenticate().await?;

        let mut records = Vec::new();
        let mut next = Some(format!("{endpoint}/servers/detail"));
        while let Some(url) = next {
            debug!("Listing servers: {url}");
            let page: ServerPage = http::json(
                self.client
                    .get(&url)
                    .header("X-Auth-Token", &token)
                    .timeout(CONTROL_PLANE_TIMEOUT),
                "listing servers",
            )
            .await?;
            records.extend(convert_servers(page.servers, &uid));
            next = page
                .servers_links
                .into_iter()
                .find(|link| link.rel == "next")
                .map(|link| link.href);
        }
        Ok(records)
    }
}
