use core::fmt;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_with::{IfIsHumanReadable, serde_as};

pub const SHA256_DIGEST_LEN: usize = 32;

#[serde_as]
#[derive(Serialize, Deserialize, Clone, Eq, PartialEq, Default)]
pub struct Digest(#[serde_as(as = "IfIsHumanReadable<serde_with::hex::Hex>")] pub Vec<u8>);

impl Digest {
    pub fn from_hex(s: &str) -> anyhow::Result<Self> {
        Ok(Digest(hex::decode(s.trim())?))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// SHA-256 measurement registers of a node, keyed by register index.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct Measurements(pub BTreeMap<u32, Digest>);

impl Measurements {
    pub fn get(&self, index: u32) -> Option<&Digest> {
        self.0.get(&index)
    }

    pub fn insert(&mut self, index: u32, digest: Digest) {
        self.0.insert(index, digest);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every register must hold a SHA-256 sized digest.
    pub fn ensure_sanitized(&self) -> anyhow::Result<()> {
        for (index, digest) in &self.0 {
            anyhow::ensure!(
                digest.0.len() == SHA256_DIGEST_LEN,
                "measurement {index} has {} bytes, expected {SHA256_DIGEST_LEN}",
                digest.0.len()
            );
        }
        Ok(())
    }
}

impl FromIterator<(u32, Digest)> for Measurements {
    fn from_iter<I: IntoIterator<Item = (u32, Digest)>>(iter: I) -> Self {
        Measurements(iter.into_iter().collect())
    }
}
