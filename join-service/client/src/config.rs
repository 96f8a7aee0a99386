use std::path::PathBuf;

use anyhow::Context;
use join_structs::structs::CloudProvider;
use serde::Deserialize;

/// Candidate settings, read from `JOIN_*` environment variables.
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    /// `wss://host:port` of the join service
    pub endpoint: String,
    /// PEM certificate the join service must present
    pub server_cert: PathBuf,
    pub csp: CloudProvider,
    #[serde(default = "default_variant")]
    pub variant: String,
    pub disk_uuid: String,
    #[serde(default)]
    pub control_plane: bool,
    pub node_name: String,
    pub output_dir: PathBuf,
    /// Hex encoded signing key of the node's trusted environment
    pub attestation_key: Option<PathBuf>,
    /// JSON measurements to report instead of the TPM PCR bank
    pub measurements: Option<PathBuf>,
    /// Ask only for the disk key of an already joined node
    #[serde(default)]
    pub rejoin: bool,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
}

fn default_variant() -> String {
    "default".to_string()
}

fn default_attempts() -> u32 {
    5
}

fn default_backoff_secs() -> u64 {
    3
}

impl ClientConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        envy::prefixed("JOIN_")
            .from_env::<ClientConfig>()
            .context("Error parsing environment variables")
    }

    fn from_iter(vars: impl IntoIterator<Item = (String, String)>) -> anyhow::Result<Self> {
        envy::prefixed("JOIN_")
            .from_iter(vars)
            .context("Error parsing environment variables")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn defaults() -> anyhow::Result<()> {
        let config = ClientConfig::from_iter(vars(&[
            ("JOIN_ENDPOINT", "wss://10.0.0.2:9090"),
            ("JOIN_SERVER_CERT", "/run/join/server.pem"),
            ("JOIN_CSP", "gcp"),
            ("JOIN_DISK_UUID", "3f4c9a62"),
            ("JOIN_NODE_NAME", "w0"),
            ("JOIN_OUTPUT_DIR", "/run/join"),
        ]))?;
        assert_eq!(config.csp, CloudProvider::Gcp);
        assert_eq!(config.variant, "default");
        assert!(!config.control_plane);
        assert!(!config.rejoin);
        assert_eq!(config.attempts, 5);
        assert!(config.attestation_key.is_none());
        Ok(())
    }

    #[test]
    fn missing_endpoint_is_an_error() {
        let err = ClientConfig::from_iter(vars(&[("JOIN_CSP", "azure")])).unwrap_err();
        assert!(format!("{err:#}").contains("endpoint"), "{err:#}");
    }
}
