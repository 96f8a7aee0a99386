//! Client and service talking over a real TLS socket on the loopback interface.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use attestation::{
    AttestationVariant, Issuer,
    issuer::{QuoteIssuer, StaticMeasurements, StubIssuer},
    measurements::{Digest, Measurements},
    policy::{ExpectedMeasurement, MeasurementOption, MeasurementPolicy, PolicySet, PolicyStore},
    quote::AttestationKeyPair,
    registry::ValidatorRegistry,
};
use axum_server::{
    Handle,
    tls_rustls::{RustlsAcceptor, RustlsConfig},
};
use cloud_metadata::{
    CloudApi, InstanceRecord, LookupError, Metadata, RetryPolicy, RoleCorrelator, RoleSource,
};
use join_client::{ClientError, JoinClient, JoinParameters, material::kubelet_key};
use join_service::{
    api,
    ca::ClusterCa,
    disk_keys::DiskKeyDeriver,
    server_tls_acceptor::CustomAcceptor,
    service::{ClusterInfo, Issuance, JoinService},
    token::{BootstrapTokenIssuer, generate_token},
};
use join_structs::structs::{ADMISSION_DENIED, CloudProvider, Role};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use url::Url;

struct LoopbackCloud;

#[async_trait]
impl CloudApi for LoopbackCloud {
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
        Ok("10.0.0.2".to_string())
    }

    async fn init_secret_hash(&self) -> Result<String, LookupError> {
        Ok("hash".to_string())
    }

    async fn role_source(&self) -> Result<RoleSource, LookupError> {
        Ok(RoleSource::Group("constellation-control-plane-uid1".to_string()))
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, LookupError> {
        Ok(vec![
            InstanceRecord::default(),
            InstanceRecord {
                provider_id: Some("gce://project/zone/w0".to_string()),
                name: Some("w0".to_string()),
                role_source: Some(RoleSource::Group("constellation-worker-uid1".to_string())),
                private_ips: vec!["127.0.0.1".to_string()],
                ..Default::default()
            },
        ])
    }
}

struct FreshTokens;

#[async_trait]
impl BootstrapTokenIssuer for FreshTokens {
    async fn create(&self, _role: Role, _node_name: &str) -> anyhow::Result<String> {
        generate_token()
    }
}

fn golden() -> Measurements {
    [(4, Digest(vec![0x44; 32])), (9, Digest(vec![0x99; 32]))]
        .into_iter()
        .collect()
}

fn service_trusting(key: &AttestationKeyPair) -> anyhow::Result<JoinService> {
    let policy = MeasurementPolicy {
        version: 1,
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
    let policies = Arc::new(PolicyStore::new(PolicySet::new(vec![policy])?));
    let metadata = Metadata::new(
        Arc::new(LoopbackCloud),
        RoleCorrelator::for_provider(CloudProvider::Gcp),
        RetryPolicy::no_retry(),
        4,
    );
    Ok(JoinService::new(
        AttestationVariant::QemuVtpm,
        policies.clone(),
        ValidatorRegistry::new(&policies),
        metadata,
        Issuance {
            ca: Arc::new(ClusterCa::generate("cluster-ca")?),
            tokens: Arc::new(FreshTokens),
            disk_keys: DiskKeyDeriver::new(vec![5; 32], b"disk-salt".to_vec())?,
            cluster: ClusterInfo {
                api_server_endpoint: "127.0.0.1:6443".to_string(),
                kubernetes_version: "v1.31.1".to_string(),
                measurement_salt: vec![3; 32],
            },
        },
        Duration::from_secs(10),
    ))
}

struct Running {
    endpoint: Url,
    server_cert: CertificateDer<'static>,
    handle: Handle,
}

async fn serve(service: JoinService) -> anyhow::Result<Running> {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
    let server_cert = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        certified.signing_key.serialize_der(),
    ));
    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13])?
    .with_no_client_auth()
    .with_single_cert(vec![server_cert.clone()], key)?;

    let handle = Handle::new();
    let server = axum_server::bind("127.0.0.1:0".parse()?)
        .handle(handle.clone())
        .acceptor(CustomAcceptor::new(RustlsAcceptor::new(
            RustlsConfig::from_config(Arc::new(config)),
        )))
        .serve(api::router(Arc::new(service)).into_make_service_with_connect_info::<SocketAddr>());
    tokio::spawn(server);

    let address = handle
        .listening()
        .await
        .context("the join service did not start listening")?;
    Ok(Running {
        endpoint: Url::parse(&format!("wss://127.0.0.1:{}/", address.port()))?,
        server_cert,
        handle,
    })
}

async fn genuine_setup() -> anyhow::Result<(Running, Arc<dyn Issuer>)> {
    let key = AttestationKeyPair::generate();
    let running = serve(service_trusting(&key)?).await?;
    let issuer: Arc<dyn Issuer> = Arc::new(QuoteIssuer::new(
        AttestationVariant::QemuVtpm,
        key,
        Box::new(StaticMeasurements(golden())),
    ));
    Ok((running, issuer))
}

#[tokio::test]
async fn genuine_worker_joins_and_rejoins() -> anyhow::Result<()> {
    let (running, issuer) = genuine_setup().await?;
    let client = JoinClient::new(running.endpoint.clone(), running.server_cert.clone(), issuer)?;

    let (_, certificate_request) = kubelet_key("w0")?;
    let response = client
        .join(&JoinParameters {
            disk_uuid: "3f4c9a62-disk".to_string(),
            certificate_request,
            is_control_plane: false,
        })
        .await?;
    assert!(join_service::token::is_well_formed(&response.bootstrap_token));
    assert_eq!(response.disk_encryption_key.len(), 32);
    assert_eq!(response.api_server_endpoint, "127.0.0.1:6443");
    assert!(response.discovery_token_ca_cert_hash.starts_with("sha256:"));

    let rejoined = client.rejoin("3f4c9a62-disk").await?;
    assert_eq!(rejoined.disk_encryption_key, response.disk_encryption_key);
    assert_eq!(rejoined.measurement_salt, vec![3; 32]);

    running.handle.shutdown();
    Ok(())
}

#[tokio::test]
async fn unattested_node_is_rejected() -> anyhow::Result<()> {
    let (running, _) = genuine_setup().await?;
    let client = JoinClient::new(
        running.endpoint.clone(),
        running.server_cert.clone(),
        Arc::new(StubIssuer::new(AttestationVariant::QemuVtpm)),
    )?;

    let outcome = client
        .join(&JoinParameters {
            disk_uuid: String::new(),
            certificate_request: Vec::new(),
            is_control_plane: false,
        })
        .await;
    match outcome {
        Err(ClientError::Rejected(message)) => assert_eq!(message, ADMISSION_DENIED),
        other => panic!("expected a rejection, got {other:?}"),
    }

    running.handle.shutdown();
    Ok(())
}

#[tokio::test]
async fn worker_claiming_control_plane_is_rejected() -> anyhow::Result<()> {
    let (running, issuer) = genuine_setup().await?;
    let client = JoinClient::new(running.endpoint.clone(), running.server_cert.clone(), issuer)?;

    let (_, certificate_request) = kubelet_key("w0")?;
    let outcome = client
        .join(&JoinParameters {
            disk_uuid: "3f4c9a62-disk".to_string(),
            certificate_request,
            is_control_plane: true,
        })
        .await;
    match outcome {
        Err(ClientError::Rejected(message)) => assert_eq!(message, ADMISSION_DENIED),
        other => panic!("expected a rejection, got {other:?}"),
    }

    running.handle.shutdown();
    Ok(())
}

#[tokio::test]
async fn other_server_certificate_is_refused() -> anyhow::Result<()> {
    let (running, issuer) = genuine_setup().await?;
    let impostor = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
    let client = JoinClient::new(running.endpoint.clone(), impostor.cert.der().clone(), issuer)?;

    let (_, certificate_request) = kubelet_key("w0")?;
    let outcome = client
        .join(&JoinParameters {
            disk_uuid: "3f4c9a62-disk".to_string(),
            certificate_request,
            is_control_plane: false,
        })
        .await;
    match outcome {
        Err(err @ ClientError::Transport(_)) => assert!(err.is_retryable()),
        other => panic!("expected a transport error, got {other:?}"),
    }

    running.handle.shutdown();
    Ok(())
}
