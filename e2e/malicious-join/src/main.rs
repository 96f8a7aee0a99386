//! Sends join requests no honest node would send and checks that the join
//! service refuses every one of them.

mod report;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, anyhow, bail};
use attestation::{
    AttestationVariant,
    issuer::StubIssuer,
    variant::available_variants,
};
use clap::Parser;
use join_client::{ClientError, JoinClient, JoinParameters, material::kubelet_key};
use join_structs::structs::CloudProvider;
use log::{error, info};
use rustls_pki_types::{CertificateDer, pem::PemObject};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

use crate::report::Report;

#[derive(Parser, Debug)]
#[command(version, about = "Issues malicious join requests to a join service", long_about = None)]
struct Args {
    /// `wss://host:port` of the join service
    #[arg(long)]
    js_endpoint: Url,

    /// PEM certificate served by the join service
    #[arg(long)]
    server_cert: PathBuf,

    #[arg(long)]
    csp: CloudProvider,

    #[arg(long, default_value = "default", help = format!(
        "Attestation variant to use, `default` for the provider's or one of: {}",
        available_variants().join(", ")
    ))]
    variant: String,
}

#[derive(Debug, Clone, Copy)]
enum Case {
    /// A stub issuer and an empty request
    JoinFromUnattestedNode,
    /// A stub issuer and a well formed request for a control plane certificate
    JoinClaimingControlPlane,
}

impl Case {
    const ALL: [Case; 2] = [Case::JoinFromUnattestedNode, Case::JoinClaimingControlPlane];

    fn name(self) -> &'static str {
        match self {
            Case::JoinFromUnattestedNode => "JoinFromUnattestedNode",
            Case::JoinClaimingControlPlane => "JoinClaimingControlPlane",
        }
    }

    fn want_err(self) -> bool {
        true
    }

    fn parameters(self) -> anyhow::Result<JoinParameters> {
        Ok(match self {
            Case::JoinFromUnattestedNode => JoinParameters {
                disk_uuid: String::new(),
                certificate_request: Vec::new(),
                is_control_plane: false,
            },
            Case::JoinClaimingControlPlane => JoinParameters {
                disk_uuid: "00000000-0000-0000-0000-000000000000".to_string(),
                certificate_request: kubelet_key("intruder")?.1,
                is_control_plane: true,
            },
        })
    }

    async fn run(self, client: &JoinClient) -> Result<(), ClientError> {
        let response = client.join(&self.parameters()?).await?;
        info!(
            "{} was admitted with a token for {}",
            self.name(),
            response.api_server_endpoint
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "malicious_join=debug,join_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    info!(
        "Running tests against {} with csp {} and variant {}",
        args.js_endpoint, args.csp, args.variant
    );
    let variant = AttestationVariant::resolve(&args.variant, args.csp)?;
    let server_cert = CertificateDer::from_pem_file(&args.server_cert)
        .with_context(|| format!("reading {}", args.server_cert.display()))?;
    let client = JoinClient::new(
        args.js_endpoint.clone(),
        server_cert,
        Arc::new(StubIssuer::new(variant)),
    )?;

    let mut report = Report::new();
    for case in Case::ALL {
        info!("Running test case {}", case.name());
        let result = case.run(&client).await;
        if let Err(err) = &result {
            info!("{} ended with: {err}", case.name());
        }
        report.record(case.name(), case.want_err(), result);
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.all_passed {
        error!("The join service accepted a malicious join request");
        bail!("not all test cases passed");
    }
    Ok(())
}
