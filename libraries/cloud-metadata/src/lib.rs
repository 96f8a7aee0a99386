//! Instance identity from cloud metadata services and control planes.
//!
//! Every provider implements [`CloudApi`]. [`Metadata`] wraps the provider
//! chosen at start-up with retries, a concurrency limit and the
//! [`RoleCorrelator`], and offers both lookups of the running instance and
//! enumeration of the whole deployment.

pub mod aws;
pub mod azure;
pub mod baremetal;
pub mod correlator;
pub mod error;
pub mod gcp;
mod http;
pub mod identity;
pub mod metadata;
pub mod openstack;
pub mod retry;

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use join_structs::structs::CloudProvider;

pub use correlator::RoleCorrelator;
pub use error::LookupError;
pub use identity::{InstanceIdentity, InstanceRecord, RoleSource, SelfIdentity};
pub use metadata::Metadata;
pub use retry::RetryPolicy;

/// Capability set of one cloud provider.
///
/// The self lookups query the metadata endpoint of the instance the process
/// runs on; `list_instances` enumerates the deployment through the provider's
/// control plane.
#[async_trait]
pub trait CloudApi: Send + Sync {
    fn provider(&self) -> CloudProvider;

    async fn provider_id(&self) -> Result<String, LookupError>;

    async fn name(&self) -> Result<String, LookupError>;

    async fn project_id(&self) -> Result<String, LookupError>;

    async fn uid(&self) -> Result<String, LookupError>;

    async fn vpc_ip(&self) -> Result<String, LookupError>;

    async fn init_secret_hash(&self) -> Result<String, LookupError>;

    /// Group name or role tag the role of this instance is derived from.
    async fn role_source(&self) -> Result<RoleSource, LookupError>;

    /// Raw records of every instance of the deployment. Records may be incomplete.
    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, LookupError>;
}

/// Provider specific settings that cannot be discovered from the metadata endpoint.
#[derive(Debug, Clone, Default)]
pub struct ProviderOptions {
    /// Cluster inventory for bare metal deployments
    pub cluster_file: Option<PathBuf>,
}

/// Builds the [`CloudApi`] of `provider`.
pub fn new_cloud_api(
    provider: CloudProvider,
    options: &ProviderOptions,
) -> anyhow::Result<Arc<dyn CloudApi>> {
    Ok(match provider {
        CloudProvider::Aws => Arc::new(aws::AwsApi::new()?),
        CloudProvider::Azure => Arc::new(azure::AzureApi::new()?),
        CloudProvider::Gcp => Arc::new(gcp::GcpApi::new()?),
        CloudProvider::OpenStack => Arc::new(openstack::OpenStackApi::new()?),
        CloudProvider::BareMetal => {
            let path = options.cluster_file.clone().ok_or_else(|| {
                anyhow::anyhow!("bare metal deployments need a cluster inventory file")
            })?;
            Arc::new(baremetal::BareMetalApi::new(path))
        }
    })
}
