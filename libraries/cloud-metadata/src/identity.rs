use std::{collections::BTreeMap, net::IpAddr};

use join_structs::structs::Role;
use serde::Serialize;

use crate::correlator::RoleCorrelator;

/// What the cloud says decides the role of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RoleSource {
    /// Name of the scale set, instance group or auto scaling group
    Group(String),
    /// Value of an explicit role tag
    Tag(String),
}

/// One enumerated instance as the provider returned it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceRecord {
    pub provider_id: Option<String>,
    pub name: Option<String>,
    pub role_source: Option<RoleSource>,
    pub private_ips: Vec<String>,
    pub public_ips: Vec<String>,
    /// Authorized keys by user name
    pub ssh_keys: BTreeMap<String, Vec<String>>,
}

/// Cloud ground truth about one instance. Fetched per validation, never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceIdentity {
    pub provider_id: String,
    pub name: String,
    pub role: Role,
    pub private_ips: Vec<IpAddr>,
    pub public_ips: Vec<IpAddr>,
    pub ssh_keys: BTreeMap<String, Vec<String>>,
}

/// Identity of the instance the process runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelfIdentity {
    pub instance: InstanceIdentity,
    pub project_id: String,
    pub uid: String,
}

impl InstanceIdentity {
    pub fn has_ip(&self, ip: IpAddr) -> bool {
        self.private_ips.contains(&ip) || self.public_ips.contains(&ip)
    }
}

fn parse_ips(ips: Vec<String>) -> Result<Vec<IpAddr>, String> {
    ips.into_iter()
        .filter(|ip| !ip.is_empty())
        .map(|ip| ip.parse().map_err(|_| format!("invalid address {ip:?}")))
        .collect()
}

impl InstanceRecord {
    /// Completes a record into an identity, or says what is missing.
    pub fn into_identity(self, correlator: &RoleCorrelator) -> Result<InstanceIdentity, String> {
        let provider_id = self
            .provider_id
            .filter(|id| !id.is_empty())
            .ok_or("no provider ID")?;
        let name = self
            .name
            .filter(|name| !name.is_empty())
            .ok_or_else(|| format!("{provider_id} has no name"))?;
        let role = self
            .role_source
            .as_ref()
            .map_or(Role::Unknown, |source| correlator.correlate(source));
        Ok(InstanceIdentity {
            private_ips: parse_ips(self.private_ips).map_err(|err| format!("{provider_id}: {err}"))?,
            public_ips: parse_ips(self.public_ips).map_err(|err| format!("{provider_id}: {err}"))?,
            provider_id,
            name,
            role,
            ssh_keys: self.ssh_keys,
        })
    }
}
