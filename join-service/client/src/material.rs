//! Kubelet key generation and the files a joined node needs afterwards.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    os::unix::fs::OpenOptionsExt,
    path::Path,
};

use anyhow::Context;
use base64::prelude::*;
use join_structs::structs::{JoinResponse, RejoinResponse};
use rcgen::{CertificateParams, DnType, KeyPair};
use serde::Serialize;

pub const TOKEN_FILE: &str = "bootstrap-token";
pub const KUBELET_CERT_FILE: &str = "kubelet.crt";
pub const KUBELET_KEY_FILE: &str = "kubelet.key";
pub const CA_FILE: &str = "ca.crt";
pub const DISK_KEY_FILE: &str = "disk.key";
pub const JOIN_CONFIG_FILE: &str = "join-config.json";

/// Fresh kubelet key pair and a certificate request for it.
pub fn kubelet_key(node_name: &str) -> anyhow::Result<(KeyPair, Vec<u8>)> {
    let key = KeyPair::generate()?;
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, format!("system:node:{node_name}"));
    let request = params
        .serialize_request(&key)
        .context("Error creating the kubelet certificate request")?;
    Ok((key, request.der().to_vec()))
}

pub fn der_to_pem(label: &str, der: &[u8]) -> anyhow::Result<String> {
    let encoded = BASE64_STANDARD.encode(der);
    Ok(format!(
        "-----BEGIN {label}-----\n{}\n-----END {label}-----\n",
        encoded
            .as_bytes()
            .chunks(64) // PEM format splits base64 into 64-character lines
            .map(std::str::from_utf8)
            .collect::<Result<Vec<_>, _>>()?
            .join("\n")
    ))
}

fn write_secret(path: &Path, content: &[u8]) -> anyhow::Result<()> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .and_then(|mut file| file.write_all(content))
        .with_context(|| format!("writing {}", path.display()))
}

fn write_public(path: &Path, content: &[u8]) -> anyhow::Result<()> {
    fs::write(path, content).with_context(|| format!("writing {}", path.display()))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinConfig<'a> {
    api_server_endpoint: &'a str,
    discovery_token_ca_cert_hash: &'a str,
    kubernetes_version: &'a str,
    measurement_salt: String,
}

pub fn write_join_material(
    dir: &Path,
    response: &JoinResponse,
    kubelet_key: &KeyPair,
) -> anyhow::Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    write_secret(&dir.join(TOKEN_FILE), response.bootstrap_token.as_bytes())?;
    write_public(
        &dir.join(KUBELET_CERT_FILE),
        der_to_pem("CERTIFICATE", &response.signed_certificate)?.as_bytes(),
    )?;
    write_secret(
        &dir.join(KUBELET_KEY_FILE),
        kubelet_key.serialize_pem().as_bytes(),
    )?;
    write_public(&dir.join(CA_FILE), &response.cluster_ca_bundle)?;
    write_secret(&dir.join(DISK_KEY_FILE), &response.disk_encryption_key)?;

    let config = JoinConfig {
        api_server_endpoint: &response.api_server_endpoint,
        discovery_token_ca_cert_hash: &response.discovery_token_ca_cert_hash,
        kubernetes_version: &response.kubernetes_version,
        measurement_salt: hex_lower(&response.measurement_salt),
    };
    write_public(
        &dir.join(JOIN_CONFIG_FILE),
        &serde_json::to_vec_pretty(&config)?,
    )
}

pub fn write_rejoin_material(dir: &Path, response: &RejoinResponse) -> anyhow::Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    write_secret(&dir.join(DISK_KEY_FILE), &response.disk_encryption_key)
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn pem_lines_are_wrapped() -> anyhow::Result<()> {
        let pem = der_to_pem("CERTIFICATE", &[0xab; 100])?;
        let lines: Vec<_> = pem.lines().collect();
        assert_eq!(lines[0], "-----BEGIN CERTIFICATE-----");
        assert_eq!(lines[1].len(), 64);
        assert_eq!(lines.last(), Some(&"-----END CERTIFICATE-----"));
        Ok(())
    }

    #[test]
    fn material_on_disk() -> anyhow::Result<()> {
        let dir = std::env::temp_dir().join(format!("join-material-{}", std::process::id()));
        let (key, _) = kubelet_key("w0")?;
        let response = JoinResponse {
            bootstrap_token: "abcdef.0123456789abcdef".to_string(),
            signed_certificate: vec![1, 2, 3],
            disk_encryption_key: vec![9; 32],
            cluster_ca_bundle: b"-----BEGIN CERTIFICATE-----\n".to_vec(),
            api_server_endpoint: "10.0.0.2:6443".to_string(),
            discovery_token_ca_cert_hash: "sha256:00".to_string(),
            kubernetes_version: "v1.31.1".to_string(),
            measurement_salt: vec![0xaa, 0x01],
        };
        write_join_material(&dir, &response, &key)?;

        assert_eq!(fs::read(dir.join(DISK_KEY_FILE))?, vec![9; 32]);
        let mode = fs::metadata(dir.join(DISK_KEY_FILE))?.permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        insta::assert_snapshot!(fs::read_to_string(dir.join(JOIN_CONFIG_FILE))?, @r#"
        {
          "apiServerEndpoint": "10.0.0.2:6443",
          "discoveryTokenCaCertHash": "sha256:00",
          "kubernetesVersion": "v1.31.1",
          "measurementSalt": "aa01"
        }
        "#);
        fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
