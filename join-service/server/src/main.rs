use std::{fs, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, anyhow};
use attestation::{
    AttestationVariant,
    policy::{PolicySet, PolicyStore},
    registry::ValidatorRegistry,
};
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use clap::Parser;
use cloud_metadata::{
    Metadata, ProviderOptions, RetryPolicy, RoleCorrelator, correlator::DEFAULT_NAME_PREFIX,
    metadata::DEFAULT_MAX_CONCURRENT_LOOKUPS, new_cloud_api,
};
use join_service::{
    api,
    ca::ClusterCa,
    disk_keys::DiskKeyDeriver,
    server_tls_acceptor::CustomAcceptor,
    service::{ClusterInfo, Issuance, JoinService},
    token::KubeadmTokenIssuer,
};
use join_structs::structs::CloudProvider;
use log::info;
use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(version, about = "Admits attested nodes into the cluster", long_about = None)]
struct Args {
    #[arg(long, env = "JOIN_SERVICE_PORT", default_value_t = 9090)]
    port: u16,

    /// aws, azure, gcp, openstack or baremetal
    #[arg(long, env = "CONSTELLATION_CSP")]
    csp: CloudProvider,

    /// Attestation variant accepted from candidates, `default` for the provider's
    #[arg(long, env = "JOIN_SERVICE_VARIANT", default_value = "default")]
    variant: String,

    #[arg(long, env = "JOIN_SERVICE_CA_CERT")]
    ca_cert: PathBuf,

    #[arg(long, env = "JOIN_SERVICE_CA_KEY")]
    ca_key: PathBuf,

    /// Validity of signed kubelet certificates
    #[arg(long, env = "JOIN_SERVICE_CERT_VALIDITY_DAYS", default_value_t = 365)]
    cert_validity_days: u64,

    /// Serving certificate. A self signed one is generated when absent.
    #[arg(long, env = "JOIN_SERVICE_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    #[arg(long, env = "JOIN_SERVICE_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Where to write the generated serving certificate for candidates to pin
    #[arg(long, env = "JOIN_SERVICE_GENERATED_CERT_OUT")]
    generated_cert_out: Option<PathBuf>,

    /// JSON list of measurement policies
    #[arg(long, env = "JOIN_SERVICE_POLICY")]
    policy: PathBuf,

    #[arg(long, env = "JOIN_SERVICE_POLICY_REFRESH_SECS", default_value_t = 60)]
    policy_refresh_secs: u64,

    #[arg(long, env = "JOIN_SERVICE_MASTER_SECRET")]
    master_secret: PathBuf,

    #[arg(long, env = "JOIN_SERVICE_MASTER_SALT")]
    master_salt: PathBuf,

    /// Salt candidates mix into their measurements
    #[arg(long, env = "JOIN_SERVICE_MEASUREMENT_SALT")]
    measurement_salt: PathBuf,

    /// `host:port` of the Kubernetes API server
    #[arg(long, env = "JOIN_SERVICE_API_SERVER_ENDPOINT")]
    api_server_endpoint: String,

    #[arg(long, env = "JOIN_SERVICE_KUBERNETES_VERSION")]
    kubernetes_version: String,

    #[arg(long, env = "JOIN_SERVICE_ATTEMPT_DEADLINE_SECS", default_value_t = 30)]
    attempt_deadline_secs: u64,

    #[arg(long, env = "JOIN_SERVICE_LOOKUP_ATTEMPTS", default_value_t = 4)]
    lookup_attempts: u32,

    #[arg(long, env = "JOIN_SERVICE_LOOKUP_BACKOFF_MS", default_value_t = 200)]
    lookup_backoff_ms: u64,

    #[arg(long, env = "JOIN_SERVICE_MAX_CONCURRENT_LOOKUPS", default_value_t = DEFAULT_MAX_CONCURRENT_LOOKUPS)]
    max_concurrent_lookups: usize,

    #[arg(long, env = "JOIN_SERVICE_TOKEN_TTL_SECS", default_value_t = 3600)]
    token_ttl_secs: u64,

    #[arg(long, env = "JOIN_SERVICE_KUBEADM", default_value = "/usr/bin/kubeadm")]
    kubeadm: PathBuf,

    #[arg(long, env = "KUBECONFIG", default_value = "/etc/kubernetes/admin.conf")]
    kubeconfig: PathBuf,

    /// Prefix of the scale set / instance group names roles are read from
    #[arg(long, env = "JOIN_SERVICE_NAME_PREFIX", default_value = DEFAULT_NAME_PREFIX)]
    name_prefix: String,

    /// Cluster inventory, bare metal only
    #[arg(long, env = "JOIN_SERVICE_CLUSTER_FILE")]
    cluster_file: Option<PathBuf>,
}

fn serving_identity(
    args: &Args,
) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    if let (Some(cert), Some(key)) = (&args.tls_cert, &args.tls_key) {
        let chain = CertificateDer::pem_file_iter(cert)
            .with_context(|| format!("reading {}", cert.display()))?
            .collect::<Result<Vec<_>, _>>()
            .context("Error parsing the serving certificate")?;
        let key = PrivateKeyDer::from_pem_file(key)
            .with_context(|| format!("reading {}", key.display()))?;
        return Ok((chain, key));
    }

    let subject_alt_names = vec!["join-service".to_string(), "localhost".to_string()];
    let certified_key = rcgen::generate_simple_self_signed(subject_alt_names)
        .context("Error while generating self signed ephemeral cert")?;
    if let Some(out) = &args.generated_cert_out {
        fs::write(out, certified_key.cert.pem())
            .with_context(|| format!("writing {}", out.display()))?;
        info!("Serving certificate written to {}", out.display());
    }
    let key = certified_key
        .signing_key
        .serialize_der()
        .try_into()
        .map_err(|e| anyhow!("{:?}", e))
        .context("Error bad private key")?;
    Ok((vec![certified_key.cert.der().clone()], key))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "join_service=debug,attestation=debug,cloud_metadata=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let variant = AttestationVariant::resolve(&args.variant, args.csp)?;
    info!("Accepting {variant} attestations on {}", args.csp);

    let policies = Arc::new(PolicyStore::new(PolicySet::load(&args.policy)?));
    policies.clone().spawn_refresh(
        args.policy.clone(),
        Duration::from_secs(args.policy_refresh_secs.max(1)),
    );
    let validators = ValidatorRegistry::new(&policies);
    validators.ensure_complete()?;

    let api = new_cloud_api(
        args.csp,
        &ProviderOptions {
            cluster_file: args.cluster_file.clone(),
        },
    )?;
    let metadata = Metadata::new(
        api,
        RoleCorrelator::new(args.csp, &args.name_prefix)
            .context("Error building role patterns from the name prefix")?,
        RetryPolicy {
            max_attempts: args.lookup_attempts.max(1),
            initial_backoff: Duration::from_millis(args.lookup_backoff_ms),
            ..Default::default()
        },
        args.max_concurrent_lookups,
    );

    let issuance = Issuance {
        ca: Arc::new(
            ClusterCa::load(&args.ca_cert, &args.ca_key)?
                .with_validity_days(args.cert_validity_days),
        ),
        tokens: Arc::new(KubeadmTokenIssuer::new(
            args.kubeadm.clone(),
            args.kubeconfig.clone(),
            Duration::from_secs(args.token_ttl_secs),
        )),
        disk_keys: DiskKeyDeriver::load(&args.master_secret, &args.master_salt)?,
        cluster: ClusterInfo {
            api_server_endpoint: args.api_server_endpoint.clone(),
            kubernetes_version: args.kubernetes_version.clone(),
            measurement_salt: fs::read(&args.measurement_salt).with_context(|| {
                format!("reading {}", args.measurement_salt.display())
            })?,
        },
    };
    let service = Arc::new(JoinService::new(
        variant,
        policies,
        validators,
        metadata,
        issuance,
        Duration::from_secs(args.attempt_deadline_secs),
    ));

    let (chain, key) = serving_identity(&args)?;
    let config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .context("Error while creating the rustls ServerConfig")?;

    let app = api::router(service);
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("listening on {}", addr);

    let acceptor = CustomAcceptor::new(RustlsAcceptor::new(RustlsConfig::from_config(Arc::from(
        config,
    ))));
    axum_server::bind(addr)
        .acceptor(acceptor)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("join service stopped")?;
    Ok(())
}
