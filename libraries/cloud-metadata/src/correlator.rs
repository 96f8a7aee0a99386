use join_structs::structs::{CloudProvider, Role};
use regex::Regex;

use crate::identity::RoleSource;

pub const DEFAULT_NAME_PREFIX: &str = "constellation";

/// Maps provider group names and role tags to cluster roles.
///
/// The naming templates are the contract with whoever provisions the groups:
///
/// | provider | control plane | worker |
/// |---|---|---|
/// | Azure | `<prefix>-scale-set-control-planes-<id>` | `<prefix>-scale-set-workers-<id>` |
/// | others | `<prefix>-control-plane-<id>` | `<prefix>-worker-<id>` |
///
/// Azure also accepts the older `coordinators` / `nodes` scale set names.
#[derive(Debug, Clone)]
pub struct RoleCorrelator {
    control_plane: Regex,
    worker: Regex,
}

impl RoleCorrelator {
    pub fn new(provider: CloudProvider, prefix: &str) -> Result<Self, regex::Error> {
        let prefix = regex::escape(prefix);
        let (control_plane, worker) = match provider {
            CloudProvider::Azure => (
                format!("{prefix}-scale-set-(control-planes|coordinators)-[0-9a-zA-Z]+$"),
                format!("{prefix}-scale-set-(workers|nodes)-[0-9a-zA-Z]+$"),
            ),
            CloudProvider::Aws
            | CloudProvider::Gcp
            | CloudProvider::OpenStack
            | CloudProvider::BareMetal => (
                format!("{prefix}-control-plane-[0-9a-z]+$"),
                format!("{prefix}-worker-[0-9a-z]+$"),
            ),
        };
        Ok(RoleCorrelator {
            control_plane: Regex::new(&control_plane)?,
            worker: Regex::new(&worker)?,
        })
    }

    pub fn for_provider(provider: CloudProvider) -> Self {
        match Self::new(provider, DEFAULT_NAME_PREFIX) {
            Ok(correlator) => correlator,
            Err(err) => unreachable!("default role patterns do not compile: {err}"),
        }
    }

    pub fn correlate_group(&self, group: &str) -> Role {
        if self.control_plane.is_match(group) {
            Role::ControlPlane
        } else if self.worker.is_match(group) {
            Role::Worker
        } else {
            Role::Unknown
        }
    }

    pub fn correlate(&self, source: &RoleSource) -> Role {
        match source {
            RoleSource::Group(group) => self.correlate_group(group),
            RoleSource::Tag(tag) => tag.parse().unwrap_or(Role::Unknown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn azure_scale_sets() {
        let correlator = RoleCorrelator::for_provider(CloudProvider::Azure);
        for (name, role) in [
            ("constellation-scale-set-control-planes-abc123", Role::ControlPlane),
            ("constellation-scale-set-coordinators-XyZ9", Role::ControlPlane),
            ("constellation-scale-set-workers-abc123", Role::Worker),
            ("constellation-scale-set-nodes-abc123", Role::Worker),
            (
                "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/virtualMachineScaleSets/constellation-scale-set-workers-q1",
                Role::Worker,
            ),
            ("constellation-scale-set-workers-", Role::Unknown),
            ("constellation-scale-set-workers-abc/extra", Role::Unknown),
            ("some-other-scale-set", Role::Unknown),
            ("", Role::Unknown),
        ] {
            assert_eq!(correlator.correlate_group(name), role, "{name}");
        }
    }

    #[test]
    fn gcp_instance_groups() {
        let correlator = RoleCorrelator::for_provider(CloudProvider::Gcp);
        assert_eq!(
            correlator.correlate_group("constellation-control-plane-1a2b"),
            Role::ControlPlane
        );
        assert_eq!(
            correlator.correlate_group("constellation-worker-1a2b"),
            Role::Worker
        );
        assert_eq!(
            correlator.correlate_group("constellation-worker-UPPER"),
            Role::Unknown
        );
    }

    #[test]
    fn custom_prefix_is_literal() -> anyhow::Result<()> {
        let correlator = RoleCorrelator::new(CloudProvider::Aws, "my.cluster")?;
        assert_eq!(
            correlator.correlate_group("my.cluster-worker-0a"),
            Role::Worker
        );
        assert_eq!(
            correlator.correlate_group("myxcluster-worker-0a"),
            Role::Unknown
        );
        Ok(())
    }

    #[test]
    fn tags() {
        let correlator = RoleCorrelator::for_provider(CloudProvider::OpenStack);
        assert_eq!(
            correlator.correlate(&RoleSource::Tag("control-plane".to_string())),
            Role::ControlPlane
        );
        assert_eq!(
            correlator.correlate(&RoleSource::Tag("admin".to_string())),
            Role::Unknown
        );
    }

    #[test]
    fn unknown_matches_no_claim() {
        let role = RoleCorrelator::for_provider(CloudProvider::Gcp).correlate_group("bastion");
        assert_eq!(role, Role::Unknown);
        assert!(!role.satisfies_claim(true));
        assert!(!role.satisfies_claim(false));
    }
}
