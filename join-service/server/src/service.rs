//! Join attempts from nonce to admission.
//!
//! Every attempt walks
//! `NonceIssued -> AttestationReceived -> IdentityCorrelated -> Admitted`
//! and may end in `Rejected` from any state. Nothing is released before
//! `IdentityCorrelated`, and nothing at all once the attempt deadline passed.

use std::{
    future::Future,
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use attestation::{
    AttestationVariant, Nonce,
    policy::{PolicyStore, log_warnings},
    registry::ValidatorRegistry,
};
use cloud_metadata::{InstanceIdentity, Metadata};
use join_structs::{
    binding::{join_user_data, rejoin_user_data},
    structs::{Challenge, JoinRequest, JoinResponse, RejoinRequest, RejoinResponse, Role},
};
use log::{debug, error, info, warn};
use tokio::time::{Instant, timeout_at};

use crate::{
    ca::{self, ClusterCa, NodeSubject},
    disk_keys::DiskKeyDeriver,
    error::JoinError,
    token::BootstrapTokenIssuer,
};

pub const DEFAULT_ATTEMPT_DEADLINE: Duration = Duration::from_secs(30);

/// The remote end of a join session as the transport saw it.
#[derive(Debug, Clone)]
pub struct Peer {
    pub address: IpAddr,
    /// Keying material exported from the session's TLS connection
    pub channel_binding: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    NonceIssued,
    AttestationReceived,
    IdentityCorrelated,
    Admitted,
    Rejected,
}

#[derive(Debug)]
struct Progress {
    id: u64,
    address: IpAddr,
    state: AttemptState,
}

impl Progress {
    fn advance(&mut self, next: AttemptState) {
        debug!(
            "Join attempt {} from {}: {:?} -> {:?}",
            self.id, self.address, self.state, next
        );
        self.state = next;
    }
}

/// One join session. Owns the only copy of its nonce and is consumed by the
/// request it answers.
#[derive(Debug)]
pub struct JoinAttempt {
    progress: Progress,
    nonce: Nonce,
    peer: Peer,
    deadline: Instant,
}

impl JoinAttempt {
    pub fn id(&self) -> u64 {
        self.progress.id
    }

    pub fn state(&self) -> AttemptState {
        self.progress.state
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn challenge(&self) -> Challenge {
        Challenge {
            nonce: self.nonce.as_bytes().to_vec(),
        }
    }
}

/// Cluster facts handed to every admitted node.
#[derive(Debug, Clone, Default)]
pub struct ClusterInfo {
    pub api_server_endpoint: String,
    pub kubernetes_version: String,
    pub measurement_salt: Vec<u8>,
}

/// What the service releases on admission.
pub struct Issuance {
    pub ca: Arc<ClusterCa>,
    pub tokens: Arc<dyn BootstrapTokenIssuer>,
    pub disk_keys: DiskKeyDeriver,
    pub cluster: ClusterInfo,
}

pub struct JoinService {
    variant: AttestationVariant,
    policies: Arc<PolicyStore>,
    validators: ValidatorRegistry,
    metadata: Metadata,
    issuance: Issuance,
    attempt_deadline: Duration,
    attempts: AtomicU64,
}

impl JoinService {
    pub fn new(
        variant: AttestationVariant,
        policies: Arc<PolicyStore>,
        validators: ValidatorRegistry,
        metadata: Metadata,
        issuance: Issuance,
        attempt_deadline: Duration,
    ) -> Self {
        JoinService {
            variant,
            policies,
            validators,
            metadata,
            issuance,
            attempt_deadline,
            attempts: AtomicU64::new(0),
        }
    }

    pub fn variant(&self) -> AttestationVariant {
        self.variant
    }

    /// A validator and a measurement policy are in place for the served variant.
    pub fn ready(&self) -> bool {
        self.validators.get(self.variant).is_ok()
            && self.policies.snapshot().get(self.variant).is_some()
    }

    pub fn begin_attempt(&self, peer: Peer) -> Result<JoinAttempt, JoinError> {
        let id = self.attempts.fetch_add(1, Ordering::Relaxed);
        let nonce = Nonce::generate().map_err(JoinError::Internal)?;
        info!("Join attempt {id} from {}: nonce issued", peer.address);
        Ok(JoinAttempt {
            progress: Progress {
                id,
                address: peer.address,
                state: AttemptState::NonceIssued,
            },
            nonce,
            peer,
            deadline: Instant::now() + self.attempt_deadline,
        })
    }

    pub async fn issue_join_ticket(
        &self,
        attempt: JoinAttempt,
        request: JoinRequest,
    ) -> Result<JoinResponse, JoinError> {
        let JoinAttempt {
            mut progress,
            nonce,
            peer,
            deadline,
        } = attempt;
        let result = self
            .within_deadline(deadline, self.admit(&mut progress, nonce, &peer, request))
            .await;
        self.conclude(&mut progress, result)
    }

    pub async fn issue_rejoin_ticket(
        &self,
        attempt: JoinAttempt,
        request: RejoinRequest,
    ) -> Result<RejoinResponse, JoinError> {
        let JoinAttempt {
            mut progress,
            nonce,
            peer,
            deadline,
        } = attempt;
        let result = self
            .within_deadline(deadline, self.readmit(&mut progress, nonce, &peer, request))
            .await;
        self.conclude(&mut progress, result)
    }

    /// Ends `attempt` without looking at any request.
    pub fn reject(&self, attempt: JoinAttempt, err: JoinError) -> JoinError {
        let mut progress = attempt.progress;
        record_outcome(&mut progress, Some(&err));
        err
    }

    async fn within_deadline<T>(
        &self,
        deadline: Instant,
        attempt: impl Future<Output = Result<T, JoinError>>,
    ) -> Result<T, JoinError> {
        match timeout_at(deadline, attempt).await {
            Err(_) => Err(JoinError::DeadlineExceeded(self.attempt_deadline)),
            // finished, but too late to be released
            Ok(Ok(_)) if Instant::now() > deadline => {
                Err(JoinError::DeadlineExceeded(self.attempt_deadline))
            }
            Ok(result) => result,
        }
    }

    fn conclude<T>(
        &self,
        progress: &mut Progress,
        result: Result<T, JoinError>,
    ) -> Result<T, JoinError> {
        record_outcome(progress, result.as_ref().err());
        result
    }

    async fn admit(
        &self,
        progress: &mut Progress,
        nonce: Nonce,
        peer: &Peer,
        request: JoinRequest,
    ) -> Result<JoinResponse, JoinError> {
        if request.disk_uuid.is_empty() {
            return Err(JoinError::MalformedRequest("empty disk UUID".to_string()));
        }
        if request.attestation_document.is_empty() {
            return Err(JoinError::MalformedRequest(
                "empty attestation document".to_string(),
            ));
        }
        ca::verify_request(&request.certificate_request)
            .map_err(|err| JoinError::MalformedRequest(format!("{err:#}")))?;
        progress.advance(AttemptState::AttestationReceived);

        let user_data = join_user_data(&peer.channel_binding, &request.certificate_request);
        let claims = self
            .validators
            .get(self.variant)?
            .validate(&request.attestation_document, &user_data, nonce)
            .await?;
        log_warnings(claims.variant, &claims.warnings);
        debug!(
            "Join attempt {}: attestation valid under policy version {}",
            progress.id, claims.policy_version
        );

        let instance = self
            .correlate(peer.address, Some(request.is_control_plane))
            .await?;
        progress.advance(AttemptState::IdentityCorrelated);

        let subject = NodeSubject {
            name: instance.name.clone(),
            ips: instance
                .private_ips
                .iter()
                .chain(&instance.public_ips)
                .copied()
                .collect(),
        };
        let (bootstrap_token, signed_certificate) = tokio::try_join!(
            self.issuance.tokens.create(instance.role, &instance.name),
            self.issuance
                .ca
                .sign_concurrently(request.certificate_request, subject),
        )
        .map_err(JoinError::Issuance)?;
        let disk_encryption_key = self
            .issuance
            .disk_keys
            .derive(&request.disk_uuid)
            .map_err(JoinError::Issuance)?;

        let cluster = &self.issuance.cluster;
        Ok(JoinResponse {
            bootstrap_token,
            signed_certificate,
            disk_encryption_key,
            cluster_ca_bundle: self.issuance.ca.bundle_pem().as_bytes().to_vec(),
            api_server_endpoint: cluster.api_server_endpoint.clone(),
            discovery_token_ca_cert_hash: self
                .issuance
                .ca
                .discovery_token_ca_cert_hash()
                .to_string(),
            kubernetes_version: cluster.kubernetes_version.clone(),
            measurement_salt: cluster.measurement_salt.clone(),
        })
    }

    async fn readmit(
        &self,
        progress: &mut Progress,
        nonce: Nonce,
        peer: &Peer,
        request: RejoinRequest,
    ) -> Result<RejoinResponse, JoinError> {
        if request.disk_uuid.is_empty() || request.attestation_document.is_empty() {
            return Err(JoinError::MalformedRequest(
                "incomplete rejoin request".to_string(),
            ));
        }
        progress.advance(AttemptState::AttestationReceived);

        let user_data = rejoin_user_data(&peer.channel_binding, &request.disk_uuid);
        let claims = self
            .validators
            .get(self.variant)?
            .validate(&request.attestation_document, &user_data, nonce)
            .await?;
        log_warnings(claims.variant, &claims.warnings);

        self.correlate(peer.address, None).await?;
        progress.advance(AttemptState::IdentityCorrelated);

        Ok(RejoinResponse {
            disk_encryption_key: self
                .issuance
                .disk_keys
                .derive(&request.disk_uuid)
                .map_err(JoinError::Issuance)?,
            measurement_salt: self.issuance.cluster.measurement_salt.clone(),
        })
    }

    /// Looks the peer up in the deployment and checks its role against the
    /// claim. Without a claim any known role is accepted.
    async fn correlate(
        &self,
        address: IpAddr,
        is_control_plane: Option<bool>,
    ) -> Result<InstanceIdentity, JoinError> {
        let instance = self.metadata.resolve_peer(address).await?;
        let accepted = match is_control_plane {
            Some(claim) => instance.role.satisfies_claim(claim),
            None => instance.role != Role::Unknown,
        };
        if !accepted {
            return Err(JoinError::IdentityMismatch(format!(
                "{} ({}) has role {} but claimed {}",
                instance.name,
                instance.provider_id,
                instance.role,
                is_control_plane.map_or("a known role".to_string(), |claim| {
                    Role::from_claim(claim).to_string()
                })
            )));
        }
        Ok(instance)
    }
}

fn record_outcome(progress: &mut Progress, failure: Option<&JoinError>) {
    let Some(err) = failure else {
        progress.advance(AttemptState::Admitted);
        info!("Join attempt {} from {} admitted", progress.id, progress.address);
        return;
    };
    let reached = progress.state;
    progress.advance(AttemptState::Rejected);
    if err.is_service_fault() {
        error!(
            "Join attempt {} from {} failed after {:?} ({}): {}",
            progress.id,
            progress.address,
            reached,
            err.cause(),
            err
        );
    } else {
        warn!(
            "Join attempt {} from {} rejected after {:?} ({}): {}",
            progress.id,
            progress.address,
            reached,
            err.cause(),
            err
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use async_trait::async_trait;
    use attestation::{
        Issuer, ValidationError,
        issuer::{QuoteIssuer, StaticMeasurements, StubIssuer},
        measurements::{Digest, Measurements},
        policy::{ExpectedMeasurement, MeasurementOption, MeasurementPolicy, PolicySet},
        quote::AttestationKeyPair,
    };
    use cloud_metadata::{
        CloudApi, InstanceRecord, LookupError, RetryPolicy, RoleCorrelator, RoleSource,
    };
    use join_structs::structs::CloudProvider;

    use super::*;
    use crate::{ca::tests::csr, token::tests::MemoryTokenIssuer};

    pub(crate) const WORKER_IP: &str = "10.0.1.7";
    pub(crate) const CONTROL_PLANE_IP: &str = "10.0.0.2";

    /// Deployment with one control plane and one worker instance.
    pub(crate) struct StaticCloud {
        pub(crate) records: Vec<InstanceRecord>,
        pub(crate) unreachable: bool,
    }

    impl StaticCloud {
        pub(crate) fn new() -> Self {
            let record = |id: &str, group: &str, ip: &str| InstanceRecord {
                provider_id: Some(format!("gce://project/zone/{id}")),
                name: Some(id.to_string()),
                role_source: Some(RoleSource::Group(group.to_string())),
                private_ips: vec![ip.to_string()],
                ..Default::default()
            };
            StaticCloud {
                records: vec![
                    record("cp0", "constellation-control-plane-uid1", CONTROL_PLANE_IP),
                    record("w0", "constellation-worker-uid1", WORKER_IP),
                    InstanceRecord::default(),
                ],
                unreachable: false,
            }
        }
    }

    #[async_trait]
    impl CloudApi for StaticCloud {
        fn provider(&self) -> CloudProvider {
            CloudProvider::Gcp
        }

        async fn provider_id(&self) -> Result<String, LookupError> {
            Ok("gce://project/zone/cp0".to_string())
        }

        async fn name(&self) -> Result<String, LookupError> {
            Ok("cp0".to_string())
        }

        async fn project_id(&self) -> Result<String, LookupError> {
            Ok("project".to_string())
        }

        async fn uid(&self) -> Result<String, LookupError> {
            Ok("uid1".to_string())
        }

        async fn vpc_ip(&self) -> Result<String, LookupError> {
            Ok(CONTROL_PLANE_IP.to_string())
        }

        async fn init_secret_hash(&self) -> Result<String, LookupError> {
            Ok("hash".to_string())
        }

        async fn role_source(&self) -> Result<RoleSource, LookupError> {
            Ok(RoleSource::Group("constellation-control-plane-uid1".to_string()))
        }

        async fn list_instances(&self) -> Result<Vec<InstanceRecord>, LookupError> {
            if self.unreachable {
                return Err(LookupError::transient("listing instances", "HTTP 503"));
            }
            Ok(self.records.clone())
        }
    }

    pub(crate) fn golden() -> Measurements {
        [(4, Digest(vec![0x44; 32])), (9, Digest(vec![0x99; 32]))]
            .into_iter()
            .collect()
    }

    pub(crate) fn policies_trusting(key: &AttestationKeyPair) -> anyhow::Result<Arc<PolicyStore>> {
        let policy = MeasurementPolicy {
            version: 3,
            variant: AttestationVariant::QemuVtpm,
            measurements: golden()
                .0
                .into_iter()
                .map(|(index, expected)| {
                    (
                        index,
                        ExpectedMeasurement {
                            expected,
                            validation: MeasurementOption::Enforce,
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>(),
            trusted_attestation_keys: BTreeSet::from([key.public_key()]),
        };
        Ok(Arc::new(PolicyStore::new(PolicySet::new(vec![policy])?)))
    }

    pub(crate) struct Fixture {
        pub(crate) service: JoinService,
        pub(crate) issuer: QuoteIssuer,
    }

    pub(crate) fn fixture_with(
        cloud: StaticCloud,
        tokens: Arc<dyn BootstrapTokenIssuer>,
        deadline: Duration,
    ) -> anyhow::Result<Fixture> {
        let key = AttestationKeyPair::generate();
        let policies = policies_trusting(&key)?;
        let metadata = Metadata::new(
            Arc::new(cloud),
            RoleCorrelator::for_provider(CloudProvider::Gcp),
            RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
            },
            4,
        );
        let service = JoinService::new(
            AttestationVariant::QemuVtpm,
            policies.clone(),
            ValidatorRegistry::new(&policies),
            metadata,
            Issuance {
                ca: Arc::new(ClusterCa::generate("cluster-ca")?),
                tokens,
                disk_keys: DiskKeyDeriver::new(vec![5; 32], b"disk-salt".to_vec())?,
                cluster: ClusterInfo {
                    api_server_endpoint: "10.0.0.2:6443".to_string(),
                    kubernetes_version: "v1.31.1".to_string(),
                    measurement_salt: vec![3; 32],
                },
            },
            deadline,
        );
        let issuer = QuoteIssuer::new(
            AttestationVariant::QemuVtpm,
            key,
            Box::new(StaticMeasurements(golden())),
        );
        Ok(Fixture { service, issuer })
    }

    pub(crate) fn fixture() -> anyhow::Result<Fixture> {
        fixture_with(
            StaticCloud::new(),
            Arc::new(MemoryTokenIssuer::default()),
            DEFAULT_ATTEMPT_DEADLINE,
        )
    }

    fn peer(address: &str) -> Peer {
        Peer {
            address: address.parse().unwrap(),
            channel_binding: vec![0x5a; 32],
        }
    }

    async fn join_request(
        issuer: &dyn Issuer,
        attempt: &JoinAttempt,
        is_control_plane: bool,
    ) -> anyhow::Result<JoinRequest> {
        let certificate_request = csr("node")?;
        let user_data = join_user_data(&attempt.peer.channel_binding, &certificate_request);
        let attestation_document = issuer
            .issue(&user_data, &attempt.challenge().nonce)
            .await?;
        Ok(JoinRequest {
            disk_uuid: "3f4c9a62-disk".to_string(),
            certificate_request,
            is_control_plane,
            attestation_document,
        })
    }

    #[tokio::test]
    async fn genuine_worker_is_admitted() -> anyhow::Result<()> {
        let Fixture { service, issuer } = fixture()?;
        let attempt = service.begin_attempt(peer(WORKER_IP))?;
        assert_eq!(attempt.state(), AttemptState::NonceIssued);
        let request = join_request(&issuer, &attempt, false).await?;

        let response = service.issue_join_ticket(attempt, request).await?;
        assert!(crate::token::is_well_formed(&response.bootstrap_token));
        assert!(!response.signed_certificate.is_empty());
        assert_eq!(response.disk_encryption_key.len(), 32);
        assert!(
            String::from_utf8(response.cluster_ca_bundle)?.starts_with("-----BEGIN CERTIFICATE")
        );
        assert!(response.discovery_token_ca_cert_hash.starts_with("sha256:"));
        assert_eq!(response.api_server_endpoint, "10.0.0.2:6443");
        Ok(())
    }

    #[tokio::test]
    async fn claimed_control_plane_on_a_worker_is_rejected() -> anyhow::Result<()> {
        let Fixture { service, issuer } = fixture()?;
        let attempt = service.begin_attempt(peer(WORKER_IP))?;
        let request = join_request(&issuer, &attempt, true).await?;
        let err = service.issue_join_ticket(attempt, request).await.unwrap_err();
        assert!(matches!(err, JoinError::IdentityMismatch(_)), "{err}");
        assert!(!err.is_service_fault());
        Ok(())
    }

    #[tokio::test]
    async fn control_plane_is_admitted_as_control_plane() -> anyhow::Result<()> {
        let Fixture { service, issuer } = fixture()?;
        let attempt = service.begin_attempt(peer(CONTROL_PLANE_IP))?;
        let request = join_request(&issuer, &attempt, true).await?;
        service.issue_join_ticket(attempt, request).await?;
        Ok(())
    }

    #[tokio::test]
    async fn document_for_another_attempt_is_rejected() -> anyhow::Result<()> {
        let Fixture { service, issuer } = fixture()?;
        let first = service.begin_attempt(peer(WORKER_IP))?;
        let second = service.begin_attempt(peer(WORKER_IP))?;
        let request = join_request(&issuer, &first, false).await?;

        let err = service
            .issue_join_ticket(second, request)
            .await
            .unwrap_err();
        assert!(
            matches!(err, JoinError::Validation(ValidationError::ExpiredOrWrongNonce)),
            "{err}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn document_bound_to_another_channel_is_rejected() -> anyhow::Result<()> {
        let Fixture { service, issuer } = fixture()?;
        let mut relayed = peer(WORKER_IP);
        relayed.channel_binding = vec![0x11; 32];
        let attempt = service.begin_attempt(relayed)?;

        let certificate_request = csr("node")?;
        let user_data = join_user_data(&[0x5a; 32], &certificate_request);
        let attestation_document = issuer
            .issue(&user_data, &attempt.challenge().nonce)
            .await?;
        let request = JoinRequest {
            disk_uuid: "disk".to_string(),
            certificate_request,
            is_control_plane: false,
            attestation_document,
        };
        let err = service.issue_join_ticket(attempt, request).await.unwrap_err();
        assert!(
            matches!(err, JoinError::Validation(ValidationError::UserDataMismatch)),
            "{err}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn unattested_node_is_rejected() -> anyhow::Result<()> {
        let Fixture { service, .. } = fixture()?;
        let stub = StubIssuer::new(AttestationVariant::QemuVtpm);

        let attempt = service.begin_attempt(peer(WORKER_IP))?;
        let attestation_document = stub
            .issue(&join_user_data(&[0x5a; 32], &[]), &attempt.challenge().nonce)
            .await?;
        let empty = JoinRequest {
            disk_uuid: String::new(),
            certificate_request: vec![],
            is_control_plane: false,
            attestation_document,
        };
        let err = service.issue_join_ticket(attempt, empty).await.unwrap_err();
        assert_eq!(err.response(), join_structs::structs::ServerMessage::rejected());

        let attempt = service.begin_attempt(peer(WORKER_IP))?;
        let complete = join_request(&stub, &attempt, false).await?;
        let err = service
            .issue_join_ticket(attempt, complete)
            .await
            .unwrap_err();
        assert!(matches!(err, JoinError::Validation(_)), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn unknown_peer_is_rejected() -> anyhow::Result<()> {
        let Fixture { service, issuer } = fixture()?;
        let attempt = service.begin_attempt(peer("192.168.7.7"))?;
        let request = join_request(&issuer, &attempt, false).await?;
        let err = service.issue_join_ticket(attempt, request).await.unwrap_err();
        assert!(
            matches!(err, JoinError::Lookup(LookupError::NotFound(_))),
            "{err}"
        );
        assert!(!err.is_service_fault());
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_cloud_is_unavailable() -> anyhow::Result<()> {
        let mut cloud = StaticCloud::new();
        cloud.unreachable = true;
        let Fixture { service, issuer } = fixture_with(
            cloud,
            Arc::new(MemoryTokenIssuer::default()),
            DEFAULT_ATTEMPT_DEADLINE,
        )?;
        let attempt = service.begin_attempt(peer(WORKER_IP))?;
        let request = join_request(&issuer, &attempt, false).await?;
        let err = service.issue_join_ticket(attempt, request).await.unwrap_err();
        assert!(err.is_service_fault(), "{err}");
        Ok(())
    }

    struct SlowTokens(Duration);

    #[async_trait]
    impl BootstrapTokenIssuer for SlowTokens {
        async fn create(&self, _role: Role, _node_name: &str) -> anyhow::Result<String> {
            tokio::time::sleep(self.0).await;
            crate::token::generate_token()
        }
    }

    #[tokio::test]
    async fn nothing_is_released_after_the_deadline() -> anyhow::Result<()> {
        let Fixture { service, issuer } = fixture_with(
            StaticCloud::new(),
            Arc::new(SlowTokens(Duration::from_secs(5))),
            Duration::from_millis(500),
        )?;
        let attempt = service.begin_attempt(peer(WORKER_IP))?;
        let request = join_request(&issuer, &attempt, false).await?;
        let err = service.issue_join_ticket(attempt, request).await.unwrap_err();
        assert!(matches!(err, JoinError::DeadlineExceeded(_)), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn same_disk_twice_gets_two_independent_attempts() -> anyhow::Result<()> {
        let Fixture { service, issuer } = fixture()?;
        let first = service.begin_attempt(peer(WORKER_IP))?;
        let second = service.begin_attempt(peer(WORKER_IP))?;
        assert_ne!(first.id(), second.id());
        assert_ne!(first.challenge(), second.challenge());

        let first_request = join_request(&issuer, &first, false).await?;
        let second_request = join_request(&issuer, &second, false).await?;
        let a = service.issue_join_ticket(first, first_request).await?;
        let b = service.issue_join_ticket(second, second_request).await?;
        assert_ne!(a.bootstrap_token, b.bootstrap_token);
        assert_eq!(a.disk_encryption_key, b.disk_encryption_key);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_attempts() -> anyhow::Result<()> {
        let Fixture { service, issuer } = fixture()?;
        let mut sessions = Vec::new();
        for _ in 0..6 {
            let attempt = service.begin_attempt(peer(WORKER_IP))?;
            let request = join_request(&issuer, &attempt, false).await?;
            sessions.push(service.issue_join_ticket(attempt, request));
        }
        for result in futures_util::future::join_all(sessions).await {
            result?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn rejoin_returns_the_same_disk_key() -> anyhow::Result<()> {
        let Fixture { service, issuer } = fixture()?;
        let attempt = service.begin_attempt(peer(WORKER_IP))?;
        let request = join_request(&issuer, &attempt, false).await?;
        let disk_uuid = request.disk_uuid.clone();
        let joined = service.issue_join_ticket(attempt, request).await?;

        let attempt = service.begin_attempt(peer(WORKER_IP))?;
        let attestation_document = issuer
            .issue(
                &rejoin_user_data(&[0x5a; 32], &disk_uuid),
                &attempt.challenge().nonce,
            )
            .await?;
        let rejoined = service
            .issue_rejoin_ticket(
                attempt,
                RejoinRequest {
                    disk_uuid,
                    attestation_document,
                },
            )
            .await?;
        assert_eq!(rejoined.disk_encryption_key, joined.disk_encryption_key);
        assert_eq!(rejoined.measurement_salt, joined.measurement_salt);
        Ok(())
    }

    #[tokio::test]
    async fn join_document_does_not_open_rejoin() -> anyhow::Result<()> {
        let Fixture { service, issuer } = fixture()?;
        let attempt = service.begin_attempt(peer(WORKER_IP))?;
        let join = join_request(&issuer, &attempt, false).await?;
        let err = service
            .issue_rejoin_ticket(
                attempt,
                RejoinRequest {
                    disk_uuid: join.disk_uuid,
                    attestation_document: join.attestation_document,
                },
            )
            .await
            .unwrap_err();
        assert!(
            matches!(err, JoinError::Validation(ValidationError::UserDataMismatch)),
            "{err}"
        );
        Ok(())
    }

    #[test]
    fn readiness_follows_the_policy() -> anyhow::Result<()> {
        let Fixture { service, .. } = fixture()?;
        assert!(service.ready());
        service.policies.replace(PolicySet::default());
        assert!(!service.ready());
        Ok(())
    }
}
