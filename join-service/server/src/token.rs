//! kubeadm bootstrap tokens.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, ensure};
use async_trait::async_trait;
use join_structs::structs::Role;
use log::info;
use ring::rand::{SecureRandom, SystemRandom};

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const TOKEN_ID_LEN: usize = 6;
const TOKEN_SECRET_LEN: usize = 16;

#[async_trait]
pub trait BootstrapTokenIssuer: Send + Sync {
    /// Registers a fresh token with the cluster and returns it.
    async fn create(&self, role: Role, node_name: &str) -> anyhow::Result<String>;
}

fn random_chars(rng: &SystemRandom, count: usize) -> anyhow::Result<String> {
    let mut out = String::with_capacity(count);
    let mut buf = [0u8; 32];
    while out.len() < count {
        rng.fill(&mut buf)
            .map_err(|_| anyhow::anyhow!("the system random generator failed"))?;
        // 252 is the largest multiple of 36 that fits a byte
        for byte in buf.iter().filter(|byte| **byte < 252) {
            if out.len() == count {
                break;
            }
            out.push(ALPHABET[usize::from(*byte) % ALPHABET.len()] as char);
        }
    }
    Ok(out)
}

/// `[a-z0-9]{6}.[a-z0-9]{16}`
pub fn generate_token() -> anyhow::Result<String> {
    let rng = SystemRandom::new();
    Ok(format!(
        "{}.{}",
        random_chars(&rng, TOKEN_ID_LEN)?,
        random_chars(&rng, TOKEN_SECRET_LEN)?
    ))
}

pub fn is_well_formed(token: &str) -> bool {
    let well_formed = |part: &str, len: usize| {
        part.len() == len
            && part
                .bytes()
                .all(|byte| byte.is_ascii_lowercase() || byte.is_ascii_digit())
    };
    match token.split_once('.') {
        Some((id, secret)) => well_formed(id, TOKEN_ID_LEN) && well_formed(secret, TOKEN_SECRET_LEN),
        None => false,
    }
}

/// Registers tokens through `kubeadm token create` on the control plane.
pub struct KubeadmTokenIssuer {
    kubeadm: PathBuf,
    kubeconfig: PathBuf,
    ttl: Duration,
}

impl KubeadmTokenIssuer {
    pub fn new(kubeadm: PathBuf, kubeconfig: PathBuf, ttl: Duration) -> Self {
        KubeadmTokenIssuer {
            kubeadm,
            kubeconfig,
            ttl,
        }
    }

    fn arguments(&self, token: &str, role: Role, node_name: &str) -> Vec<String> {
        vec![
            "token".to_string(),
            "create".to_string(),
            token.to_string(),
            "--ttl".to_string(),
            format!("{}s", self.ttl.as_secs()),
            "--kubeconfig".to_string(),
            self.kubeconfig.display().to_string(),
            "--usages".to_string(),
            "signing,authentication".to_string(),
            "--groups".to_string(),
            format!("system:bootstrappers:kubeadm:default-node-token,system:bootstrappers:{role}"),
            "--description".to_string(),
            format!("join ticket for {node_name}"),
        ]
    }
}

#[async_trait]
impl BootstrapTokenIssuer for KubeadmTokenIssuer {
    async fn create(&self, role: Role, node_name: &str) -> anyhow::Result<String> {
        let token = generate_token()?;
        let output = tokio::process::Command::new(&self.kubeadm)
            .args(self.arguments(&token, role, node_name))
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("running {}", self.kubeadm.display()))?;
        ensure!(
            output.status.success(),
            "kubeadm token create failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
        info!("Created a bootstrap token for {node_name} ({role})");
        Ok(token)
    }
}
