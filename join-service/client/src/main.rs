use std::{path::Path, sync::Arc, time::Duration};

use anyhow::{Context, anyhow};
use attestation::{
    AttestationVariant, Issuer,
    issuer::{MeasurementSource, StaticMeasurements, SysfsPcrSource},
    quote::AttestationKeyPair,
    registry::{IssuerMaterial, issuer_for},
};
use join_client::{
    JoinClient, JoinParameters,
    config::ClientConfig,
    material::{kubelet_key, write_join_material, write_rejoin_material},
};
use log::info;
use rustls_pki_types::{CertificateDer, pem::PemObject};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

fn node_issuer(config: &ClientConfig) -> anyhow::Result<Arc<dyn Issuer>> {
    let variant = AttestationVariant::resolve(&config.variant, config.csp)?;
    issuer_for(variant, || {
        let key_path = config
            .attestation_key
            .as_deref()
            .ok_or_else(|| anyhow!("JOIN_ATTESTATION_KEY is required for {variant}"))?;
        let source: Box<dyn MeasurementSource> = match &config.measurements {
            Some(path) => Box::new(StaticMeasurements::load(path)?),
            None => Box::new(SysfsPcrSource::with_default_bank()),
        };
        Ok(IssuerMaterial {
            key: AttestationKeyPair::load(key_path)?,
            source,
        })
    })
}

fn pinned_certificate(path: &Path) -> anyhow::Result<CertificateDer<'static>> {
    CertificateDer::from_pem_file(path).with_context(|| format!("reading {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "join_client=debug,attestation=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ClientConfig::from_env()?;
    let issuer = node_issuer(&config)?;
    info!("Attesting with {}", issuer.variant());

    let endpoint = Url::parse(&config.endpoint)
        .with_context(|| format!("invalid join service endpoint {}", config.endpoint))?;
    let client = JoinClient::new(endpoint, pinned_certificate(&config.server_cert)?, issuer)?;

    if config.rejoin {
        let response = client.rejoin(&config.disk_uuid).await?;
        write_rejoin_material(&config.output_dir, &response)?;
        info!("Disk key recovered into {}", config.output_dir.display());
        return Ok(());
    }

    let (key, certificate_request) = kubelet_key(&config.node_name)?;
    let parameters = JoinParameters {
        disk_uuid: config.disk_uuid.clone(),
        certificate_request,
        is_control_plane: config.control_plane,
    };
    let response = client
        .join_with_retries(
            &parameters,
            config.attempts.max(1),
            Duration::from_secs(config.backoff_secs),
        )
        .await?;
    write_join_material(&config.output_dir, &response, &key)?;
    info!("Join material written to {}", config.output_dir.display());
    Ok(())
}
