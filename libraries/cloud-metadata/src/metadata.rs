use std::{future::Future, net::IpAddr, sync::Arc};

use join_structs::structs::{CloudProvider, Role};
use log::{debug, warn};
use tokio::sync::Semaphore;

use crate::{
    CloudApi,
    correlator::RoleCorrelator,
    error::LookupError,
    identity::{InstanceIdentity, SelfIdentity},
    retry::RetryPolicy,
};

pub const DEFAULT_MAX_CONCURRENT_LOOKUPS: usize = 8;

/// Provider client shared by every join attempt.
#[derive(Clone)]
pub struct Metadata {
    api: Arc<dyn CloudApi>,
    correlator: RoleCorrelator,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
}

impl Metadata {
    pub fn new(
        api: Arc<dyn CloudApi>,
        correlator: RoleCorrelator,
        retry: RetryPolicy,
        max_concurrent_lookups: usize,
    ) -> Self {
        Metadata {
            api,
            correlator,
            retry,
            permits: Arc::new(Semaphore::new(max_concurrent_lookups.max(1))),
        }
    }

    pub fn provider(&self) -> CloudProvider {
        self.api.provider()
    }

    async fn call<'a, T, F, Fut>(&'a self, what: &str, op: F) -> Result<T, LookupError>
    where
        F: Fn(&'a dyn CloudApi) -> Fut,
        Fut: Future<Output = Result<T, LookupError>> + 'a,
    {
        let api = self.api.as_ref();
        let permits = self.permits.as_ref();
        let op = &op;
        self.retry
            .run(what, move || async move {
                let _permit = permits
                    .acquire()
                    .await
                    .map_err(|err| LookupError::transient("waiting for a lookup slot", err))?;
                op(api).await
            })
            .await
    }

    pub async fn provider_id(&self) -> Result<String, LookupError> {
        self.call("reading provider ID", |api| api.provider_id()).await
    }

    pub async fn name(&self) -> Result<String, LookupError> {
        self.call("reading instance name", |api| api.name()).await
    }

    pub async fn project_id(&self) -> Result<String, LookupError> {
        self.call("reading project ID", |api| api.project_id()).await
    }

    pub async fn uid(&self) -> Result<String, LookupError> {
        self.call("reading deployment uid", |api| api.uid()).await
    }

    pub async fn vpc_ip(&self) -> Result<String, LookupError> {
        self.call("reading VPC address", |api| api.vpc_ip()).await
    }

    pub async fn init_secret_hash(&self) -> Result<String, LookupError> {
        self.call("reading init secret hash", |api| api.init_secret_hash())
            .await
    }

    pub async fn role(&self) -> Result<Role, LookupError> {
        let source = self
            .call("reading role source", |api| api.role_source())
            .await?;
        Ok(self.correlator.correlate(&source))
    }

    /// Everything the metadata endpoint says about this instance.
    pub async fn self_identity(&self) -> Result<SelfIdentity, LookupError> {
        let (vpc_ip, provider_id, name, role, project_id, uid) = futures_util::try_join!(
            self.vpc_ip(),
            self.provider_id(),
            self.name(),
            self.role(),
            self.project_id(),
            self.uid(),
        )?;
        let vpc_ip: IpAddr = vpc_ip
            .parse()
            .map_err(|_| LookupError::MissingMetadata(format!("invalid VPC address {vpc_ip:?}")))?;
        Ok(SelfIdentity {
            instance: InstanceIdentity {
                provider_id,
                name,
                role,
                private_ips: vec![vpc_ip],
                public_ips: vec![],
                ssh_keys: Default::default(),
            },
            project_id,
            uid,
        })
    }

    /// Every well formed instance of the deployment.
    ///
    /// Incomplete records are logged and skipped, the rest of the listing is kept.
    pub async fn list(&self) -> Result<Vec<InstanceIdentity>, LookupError> {
        let records = self
            .call("listing instances", |api| api.list_instances())
            .await?;
        let total = records.len();
        let instances: Vec<_> = records
            .into_iter()
            .filter_map(|record| match record.into_identity(&self.correlator) {
                Ok(identity) => Some(identity),
                Err(reason) => {
                    warn!("Skipping malformed instance record: {reason}");
                    None
                }
            })
            .collect();
        debug!("Listed {} of {} instance records", instances.len(), total);
        Ok(instances)
    }

    /// The single instance with `provider_id`.
    pub async fn get_instance(&self, provider_id: &str) -> Result<InstanceIdentity, LookupError> {
        exactly_one(
            self.list()
                .await?
                .into_iter()
                .filter(|instance| instance.provider_id == provider_id)
                .collect(),
            provider_id,
        )
    }

    /// The single instance owning `ip`, after checking that its provider ID is
    /// not shared with another listed resource.
    pub async fn resolve_peer(&self, ip: IpAddr) -> Result<InstanceIdentity, LookupError> {
        let instances = self.list().await?;
        let owner = exactly_one(
            instances
                .iter()
                .filter(|instance| instance.has_ip(ip))
                .cloned()
                .collect(),
            &format!("instance with address {ip}"),
        )?;
        let same_id = instances
            .iter()
            .filter(|instance| instance.provider_id == owner.provider_id)
            .count();
        if same_id != 1 {
            return Err(LookupError::Ambiguous {
                what: owner.provider_id,
                matches: same_id,
            });
        }
        Ok(owner)
    }

    /// Private addresses of every control plane instance, for peer discovery.
    pub async fn control_plane_ips(&self) -> Result<Vec<IpAddr>, LookupError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|instance| instance.role == Role::ControlPlane)
            .flat_map(|instance| instance.private_ips)
            .collect())
    }
}

fn exactly_one(
    mut matches: Vec<InstanceIdentity>,
    what: &str,
) -> Result<InstanceIdentity, LookupError> {
    match matches.len() {
        0 => Err(LookupError::NotFound(what.to_string())),
        1 => Ok(matches.remove(0)),
        n => Err(LookupError::Ambiguous {
            what: what.to_string(),
            matches: n,
        }),
    }
}
