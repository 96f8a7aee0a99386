//! Cluster certificate authority: signs kubelet certificates for admitted nodes.

use std::{fs, net::IpAddr, path::Path, sync::Arc};

use anyhow::{Context, anyhow, ensure};
use chrono::{Datelike, Days, NaiveDate, Utc};
use fn_error_context::context;
use log::debug;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls_pki_types::CertificateSigningRequestDer;
use sha2::{Digest, Sha256};
use x509_parser::{
    certification_request::X509CertificationRequest, parse_x509_certificate, pem::parse_x509_pem,
    prelude::FromDer,
};

pub const DEFAULT_VALIDITY_DAYS: u64 = 365;

/// Who a kubelet certificate is issued to. Always taken from cloud ground
/// truth, never from the request.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSubject {
    pub name: String,
    pub ips: Vec<IpAddr>,
}

pub struct ClusterCa {
    issuer: Issuer<'static, KeyPair>,
    bundle_pem: String,
    discovery_hash: String,
    validity_days: u64,
}

fn ymd(date: NaiveDate) -> anyhow::Result<(i32, u8, u8)> {
    let month = u8::try_from(date.month()).context("month out of range")?;
    let day = u8::try_from(date.day()).context("day out of range")?;
    Ok((date.year(), month, day))
}

/// `sha256:<hex>` over the CA's SubjectPublicKeyInfo, the pin `kubeadm join` expects.
fn discovery_hash(ca_der: &[u8]) -> anyhow::Result<String> {
    let (_, certificate) = parse_x509_certificate(ca_der)?;
    Ok(format!(
        "sha256:{}",
        hex::encode(Sha256::digest(certificate.public_key().raw))
    ))
}

/// Checks that `csr_der` is a PKCS#10 request signed by the key it carries.
pub fn verify_request(csr_der: &[u8]) -> anyhow::Result<()> {
    let (_, csr) = X509CertificationRequest::from_der(csr_der)
        .map_err(|err| anyhow!("Error parsing the certificate request: {err}"))?;
    csr.verify_signature()
        .map_err(|err| anyhow!("Bad certificate request signature: {err}"))?;
    Ok(())
}

impl ClusterCa {
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> anyhow::Result<Self> {
        let key = KeyPair::from_pem(key_pem).context("Error parsing the CA private key")?;
        let (_, pem) = parse_x509_pem(cert_pem.as_bytes()).context("Error parsing the CA PEM")?;
        ensure!(
            pem.parse_x509()?.is_ca(),
            "the cluster CA certificate is not a CA"
        );
        let issuer = Issuer::from_ca_cert_pem(cert_pem, key)
            .context("Error building the CA issuer")?;
        Ok(ClusterCa {
            issuer,
            bundle_pem: cert_pem.to_string(),
            discovery_hash: discovery_hash(&pem.contents)?,
            validity_days: DEFAULT_VALIDITY_DAYS,
        })
    }

    #[context("loading the cluster CA from {}", cert_path.display())]
    pub fn load(cert_path: &Path, key_path: &Path) -> anyhow::Result<Self> {
        let cert_pem = fs::read_to_string(cert_path)?;
        let key_pem = fs::read_to_string(key_path)
            .with_context(|| format!("reading {}", key_path.display()))?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Self signed CA for development clusters.
    pub fn generate(common_name: &str) -> anyhow::Result<Self> {
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let certificate = params.self_signed(&key)?;
        Ok(ClusterCa {
            discovery_hash: discovery_hash(certificate.der())?,
            bundle_pem: certificate.pem(),
            issuer: Issuer::new(params, key),
            validity_days: DEFAULT_VALIDITY_DAYS,
        })
    }

    pub fn with_validity_days(mut self, days: u64) -> Self {
        self.validity_days = days;
        self
    }

    pub fn bundle_pem(&self) -> &str {
        &self.bundle_pem
    }

    pub fn discovery_token_ca_cert_hash(&self) -> &str {
        &self.discovery_hash
    }

    fn kubelet_params(&self, node: &NodeSubject) -> anyhow::Result<CertificateParams> {
        let today = Utc::now().date_naive();
        let mut params = CertificateParams::default();

        let mut subject = DistinguishedName::new();
        subject.push(DnType::CommonName, format!("system:node:{}", node.name));
        subject.push(DnType::OrganizationName, "system:nodes");
        params.distinguished_name = subject;

        params.subject_alt_names = node.ips.iter().copied().map(SanType::IpAddress).collect();
        params
            .subject_alt_names
            .push(SanType::DnsName(node.name.clone().try_into()?));
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let (year, month, day) = ymd(
            today
                .checked_sub_days(Days::new(1))
                .ok_or_else(|| anyhow!("date underflow"))?,
        )?;
        params.not_before = rcgen::date_time_ymd(year, month, day);
        let (year, month, day) = ymd(
            today
                .checked_add_days(Days::new(self.validity_days))
                .ok_or_else(|| anyhow!("date overflow"))?,
        )?;
        params.not_after = rcgen::date_time_ymd(year, month, day);
        params.use_authority_key_identifier_extension = true;
        Ok(params)
    }

    /// Signs the public key of `csr_der` for `node`.
    ///
    /// Only the key and its proof of possession are taken from the request.
    /// Subject, names, usages and CA flag come from `node` and fixed values.
    pub fn sign_node_certificate(&self, csr_der: &[u8], node: &NodeSubject) -> anyhow::Result<Vec<u8>> {
        verify_request(csr_der)?;
        let mut request =
            CertificateSigningRequestParams::from_der(&CertificateSigningRequestDer::from(csr_der))
                .context("Error reading the certificate request")?;
        request.params = self.kubelet_params(node)?;
        let certificate = request
            .signed_by(&self.issuer)
            .context("Error signing the kubelet certificate")?;
        debug!("Signed kubelet certificate for {}", node.name);
        Ok(certificate.der().to_vec())
    }

    /// Signs on the blocking pool; any number of signatures may run at once.
    pub async fn sign_concurrently(
        self: &Arc<Self>,
        csr_der: Vec<u8>,
        node: NodeSubject,
    ) -> anyhow::Result<Vec<u8>> {
        let ca = self.clone();
        tokio::task::spawn_blocking(move || ca.sign_node_certificate(&csr_der, &node)).await?
    }
}
