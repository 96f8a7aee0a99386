//! Disk encryption keys derived from the cluster master secret.

use std::path::Path;

use anyhow::{Context, ensure};
use fn_error_context::context;
use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const DISK_KEY_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// HKDF-SHA256 (RFC 5869), extract then expand.
fn hkdf_sha256(secret: &[u8], salt: &[u8], info: &[u8], length_bytes: usize) -> anyhow::Result<Vec<u8>> {
    ensure!(length_bytes <= 255 * 32, "HKDF output too long");

    let mut extract = HmacSha256::new_from_slice(salt)?;
    extract.update(secret);
    let prk = extract.finalize().into_bytes();

    let mut okm = Vec::with_capacity(length_bytes);
    let mut previous: Vec<u8> = Vec::new();
    let mut counter: u8 = 1;
    while okm.len() < length_bytes {
        // T(i) = HMAC(PRK, T(i-1) || info || i)
        let mut mac = HmacSha256::new_from_slice(&prk)?;
        mac.update(&previous);
        mac.update(info);
        mac.update(&[counter]);
        previous = mac.finalize().into_bytes().to_vec();
        okm.extend_from_slice(&previous);
        counter = counter.wrapping_add(1);
    }
    okm.truncate(length_bytes);
    Ok(okm)
}

pub struct DiskKeyDeriver {
    master_secret: Vec<u8>,
    salt: Vec<u8>,
}

impl DiskKeyDeriver {
    pub fn new(master_secret: Vec<u8>, salt: Vec<u8>) -> anyhow::Result<Self> {
        ensure!(
            master_secret.len() >= 16,
            "the master secret must be at least 16 bytes"
        );
        Ok(DiskKeyDeriver {
            master_secret,
            salt,
        })
    }

    #[context("loading the master secret from {}", secret_path.display())]
    pub fn load(secret_path: &Path, salt_path: &Path) -> anyhow::Result<Self> {
        let master_secret = std::fs::read(secret_path)?;
        let salt = std::fs::read(salt_path)
            .with_context(|| format!("reading {}", salt_path.display()))?;
        Self::new(master_secret, salt)
    }

    /// Key for the state disk `disk_uuid`. Same inputs, same key.
    pub fn derive(&self, disk_uuid: &str) -> anyhow::Result<Vec<u8>> {
        ensure!(!disk_uuid.is_empty(), "empty disk UUID");
        hkdf_sha256(
            &self.master_secret,
            &self.salt,
            format!("key-{disk_uuid}").as_bytes(),
            DISK_KEY_LEN,
        )
    }
}
