//! Azure: instance metadata service for self lookups, Resource Manager REST
//! API for scale set enumeration.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use azure_core::auth::TokenCredential;
use join_structs::structs::CloudProvider;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    CloudApi,
    error::LookupError,
    http::{self, CONTROL_PLANE_TIMEOUT, METADATA_TIMEOUT},
    identity::{InstanceRecord, RoleSource},
};

const IMDS_URL: &str = "http://169.254.169.254/metadata/instance?api-version=2021-02-01";
const MANAGEMENT_URL: &str = "https://management.azure.com";
const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";
const COMPUTE_API_VERSION: &str = "2023-03-01";
const NETWORK_API_VERSION: &str = "2018-10-01";

const UID_TAG: &str = "constellation-uid";
const ROLE_TAG: &str = "role";
const INIT_SECRET_HASH_TAG: &str = "initSecretHash";

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ImdsInstance {
    compute: ImdsCompute,
    #[serde(default)]
    network: ImdsNetwork,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ImdsCompute {
    resource_id: String,
    name: String,
    #[serde(default)]
    os_profile: Option<ImdsOsProfile>,
    subscription_id: String,
    resource_group_name: String,
    #[serde(default)]
    vm_scale_set_name: String,
    #[serde(default)]
    tags_list: Vec<ImdsTag>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ImdsOsProfile {
    computer_name: String,
}

#[derive(Debug, Deserialize, Default)]
struct ImdsTag {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize, Default)]
struct ImdsNetwork {
    #[serde(default)]
    interface: Vec<ImdsInterface>,
}

#[derive(Debug, Deserialize, Default)]
struct ImdsInterface {
    ipv4: ImdsIpv4,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ImdsIpv4 {
    #[serde(default)]
    ip_address: Vec<ImdsIpAddress>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ImdsIpAddress {
    #[serde(default)]
    private_ip_address: String,
}

impl ImdsInstance {
    fn tag(&self, name: &str) -> Result<String, LookupError> {
        self.compute
            .tags_list
            .iter()
            .find(|tag| tag.name == name)
            .map(|tag| tag.value.clone())
            .ok_or_else(|| LookupError::MissingMetadata(format!("tag {name}")))
    }
}

/// One page of an ARM list operation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page {
    #[serde(default)]
    value: Vec<Value>,
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScaleSetVm {
    id: Option<String>,
    instance_id: Option<String>,
    properties: Option<ScaleSetVmProperties>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScaleSetVmProperties {
    os_profile: Option<OsProfile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OsProfile {
    computer_name: Option<String>,
    linux_configuration: Option<LinuxConfiguration>,
}

#[derive(Debug, Deserialize)]
struct LinuxConfiguration {
    ssh: Option<SshConfiguration>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SshConfiguration {
    #[serde(default)]
    public_keys: Vec<SshPublicKey>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SshPublicKey {
    path: Option<String>,
    key_data: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterface {
    properties: Option<NetworkInterfaceProperties>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterfaceProperties {
    virtual_machine: Option<SubResource>,
    #[serde(default)]
    ip_configurations: Vec<IpConfiguration>,
}

#[derive(Debug, Deserialize)]
struct SubResource {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpConfiguration {
    properties: Option<IpConfigurationProperties>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpConfigurationProperties {
    #[serde(rename = "privateIPAddress")]
    private_ip_address: Option<String>,
}

/// Groups authorized keys by the user owning `/home/<user>/.ssh/authorized_keys`.
fn extract_ssh_keys(keys: &[SshPublicKey]) -> BTreeMap<String, Vec<String>> {
    let mut by_user: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for key in keys {
        let (Some(path), Some(data)) = (&key.path, &key.key_data) else {
            continue;
        };
        let Some(user) = path
            .strip_prefix("/home/")
            .and_then(|rest| rest.strip_suffix("/.ssh/authorized_keys"))
        else {
            continue;
        };
        by_user
            .entry(user.to_string())
            .or_default()
            .push(data.clone());
    }
    by_user
}

/// Private addresses of every NIC, keyed by the lowercase VM resource ID.
fn private_ips_by_vm(interfaces: Vec<Value>) -> BTreeMap<String, Vec<String>> {
    let mut by_vm: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for interface in interfaces {
        let Ok(NetworkInterface {
            properties: Some(properties),
        }) = serde_json::from_value::<NetworkInterface>(interface)
        else {
            continue;
        };
        let Some(vm_id) = properties.virtual_machine.and_then(|vm| vm.id) else {
            continue;
        };
        by_vm.entry(vm_id.to_lowercase()).or_default().extend(
            properties
                .ip_configurations
                .into_iter()
                .filter_map(|config| config.properties?.private_ip_address),
        );
    }
    by_vm
}

/// Turns one scale set's VM list into records. Entries that do not even parse
/// become empty records, which the caller skips.
fn convert_scale_set_vms(
    scale_set: &str,
    vms: Vec<Value>,
    private_ips: &BTreeMap<String, Vec<String>>,
) -> Vec<InstanceRecord> {
    vms.into_iter()
        .map(|vm| match serde_json::from_value::<ScaleSetVm>(vm) {
            Ok(vm) => {
                let os_profile = vm.properties.and_then(|properties| properties.os_profile);
                let ssh_keys = os_profile
                    .as_ref()
                    .and_then(|profile| profile.linux_configuration.as_ref())
                    .and_then(|linux| linux.ssh.as_ref())
                    .map(|ssh| extract_ssh_keys(&ssh.public_keys))
                    .unwrap_or_default();
                InstanceRecord {
                    private_ips: vm
                        .id
                        .as_ref()
                        .and_then(|id| private_ips.get(&id.to_lowercase()))
                        .cloned()
                        .unwrap_or_default(),
                    provider_id: vm
                        .id
                        .filter(|_| vm.instance_id.is_some())
                        .map(|id| format!("azure://{id}")),
                    name: os_profile.and_then(|profile| profile.computer_name),
                    role_source: Some(RoleSource::Group(scale_set.to_string())),
                    public_ips: vec![],
                    ssh_keys,
                }
            }
            Err(err) => {
                warn!("Unreadable VM entry in scale set {scale_set}: {err}");
                InstanceRecord::default()
            }
        })
        .collect()
}

pub struct AzureApi {
    client: reqwest::Client,
    credential: Arc<dyn TokenCredential>,
}

impl AzureApi {
    pub fn new() -> anyhow::Result<Self> {
        let credential: Arc<dyn TokenCredential> = azure_identity::create_credential()
            .context("Error creating TokenCredential azure_identity")?;
        Ok(AzureApi {
            client: http::client()?,
            credential,
        })
    }

    async fn imds(&self) -> Result<ImdsInstance, LookupError> {
        http::json(
            self.client
                .get(IMDS_URL)
                .header("Metadata", "true")
                .timeout(METADATA_TIMEOUT),
            "querying Azure IMDS",
        )
        .await
    }

    async fn management_get(&self, url: &str, what: &str) -> Result<Page, LookupError> {
        let token = self
            .credential
            .get_token(&[MANAGEMENT_SCOPE])
            .await
            .map_err(|err| LookupError::transient("getting a management token", err))?;
        http::json(
            self.client
                .get(url)
                .bearer_auth(token.token.secret())
                .timeout(CONTROL_PLANE_TIMEOUT),
            what,
        )
        .await
    }

    /// Follows `nextLink` until the listing is exhausted.
    async fn list_all(&self, url: String, what: &str) -> Result<Vec<Value>, LookupError> {
        let mut values = Vec::new();
        let mut next = Some(url);
        while let Some(url) = next {
            let page = self.management_get(&url, what).await?;
            values.extend(page.value);
            next = page.next_link;
        }
        Ok(values)
    }
}

#[async_trait]
impl CloudApi for AzureApi {
    fn provider(&self) -> CloudProvider {
        CloudProvider::Azure
    }

    async fn provider_id(&self) -> Result<String, LookupError> {
        Ok(format!("azure://{}", self.imds().await?.compute.resource_id))
    }

    async fn name(&self) -> Result<String, LookupError> {
        let compute = self.imds().await?.compute;
        Ok(compute
            .os_profile
            .map(|profile| profile.computer_name)
            .filter(|name| !name.is_empty())
            .unwrap_or(compute.name))
    }

    async fn project_id(&self) -> Result<String, LookupError> {
        Ok(self.imds().await?.compute.subscription_id)
    }

    async fn uid(&self) -> Result<String, LookupError> {
        self.imds().await?.tag(UID_TAG)
    }

    async fn vpc_ip(&self) -> Result<String, LookupError> {
        self.imds()
            .await?
            .network
            .interface
            .into_iter()
            .flat_map(|interface| interface.ipv4.ip_address)
            .map(|address| address.private_ip_address)
            .find(|ip| !ip.is_empty())
            .ok_or_else(|| LookupError::MissingMetadata("private IP address".to_string()))
    }

    async fn init_secret_hash(&self) -> Result<String, LookupError> {
        self.imds().await?.tag(INIT_SECRET_HASH_TAG)
    }

    async fn role_source(&self) -> Result<RoleSource, LookupError> {
        let instance = self.imds().await?;
        if !instance.compute.vm_scale_set_name.is_empty() {
            return Ok(RoleSource::Group(instance.compute.vm_scale_set_name));
        }
        Ok(RoleSource::Tag(instance.tag(ROLE_TAG)?))
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, LookupError> {
        let compute = self.imds().await?.compute;
        let base = format!(
            "{MANAGEMENT_URL}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachineScaleSets",
            compute.subscription_id, compute.resource_group_name
        );
        let scale_sets = self
            .list_all(
                format!("{base}?api-version={COMPUTE_API_VERSION}"),
                "listing scale sets",
            )
            .await?;

        let mut records = Vec::new();
        for scale_set in scale_sets {
            let Some(name) = scale_set.get("name").and_then(Value::as_str) else {
                warn!("Skipping scale set without a name");
                continue;
            };
            let vms = self
                .list_all(
                    format!("{base}/{name}/virtualMachines?api-version={COMPUTE_API_VERSION}"),
                    "listing scale set VMs",
                )
                .await?;
            let interfaces = self
                .list_all(
                    format!(
                        "{base}/{name}/networkInterfaces?api-version={NETWORK_API_VERSION}"
                    ),
                    "listing scale set network interfaces",
                )
                .await?;
            debug!("Scale set {name}: {} VMs", vms.len());
            records.extend(convert_scale_set_vms(
                name,
                vms,
                &private_ips_by_vm(interfaces),
            ));
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const VM_ID: &str = "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/virtualMachineScaleSets/constellation-scale-set-workers-x1/virtualMachines/0";

    #[test]
    fn scale_set_vms_are_converted() {
        let vms = vec![
            json!({
                "id": VM_ID,
                "instanceId": "0",
                "properties": {"osProfile": {
                    "computerName": "worker-0",
                    "linuxConfiguration": {"ssh": {"publicKeys": [
                        {"path": "/home/user/.ssh/authorized_keys", "keyData": "ssh-ed25519 AAA"},
                        {"path": "/root/.ssh/authorized_keys", "keyData": "ignored"}
                    ]}}
                }}
            }),
            json!({"id": 17}),
            json!({"id": "/subscriptions/sub/.../virtualMachines/1", "properties": {}}),
        ];
        let interfaces = vec![
            json!({"properties": {
                "virtualMachine": {"id": VM_ID.to_uppercase()},
                "ipConfigurations": [{"properties": {"privateIPAddress": "10.9.0.4"}}]
            }}),
            json!({"properties": null}),
        ];

        let records = convert_scale_set_vms(
            "constellation-scale-set-workers-x1",
            vms,
            &private_ips_by_vm(interfaces),
        );
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].provider_id.as_deref(), Some(format!("azure://{VM_ID}").as_str()));
        assert_eq!(records[0].name.as_deref(), Some("worker-0"));
        assert_eq!(records[0].private_ips, vec!["10.9.0.4".to_string()]);
        assert_eq!(
            records[0].ssh_keys.get("user"),
            Some(&vec!["ssh-ed25519 AAA".to_string()])
        );
        assert_eq!(records[1], InstanceRecord::default());
        assert_eq!(records[2].provider_id, None);
    }

    #[test]
    fn imds_document() -> anyhow::Result<()> {
        let instance: ImdsInstance = serde_json::from_value(json!({
            "compute": {
                "resourceId": "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/virtualMachineScaleSets/ss/virtualMachines/3",
                "name": "ss_3",
                "osProfile": {"computerName": "ss000003"},
                "subscriptionId": "sub",
                "resourceGroupName": "rg",
                "vmScaleSetName": "ss",
                "tagsList": [{"name": "constellation-uid", "value": "abc"}]
            },
            "network": {"interface": [{"ipv4": {"ipAddress": [{"privateIpAddress": "10.0.0.5"}]}}]}
        }))?;
        assert_eq!(instance.tag(UID_TAG)?, "abc");
        assert!(matches!(
            instance.tag(INIT_SECRET_HASH_TAG),
            Err(LookupError::MissingMetadata(_))
        ));
        Ok(())
    }
}
