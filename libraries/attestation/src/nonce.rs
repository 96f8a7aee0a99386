use std::fmt;

use ring::rand::{SecureRandom, SystemRandom};

use crate::error::ValidationError;

pub const NONCE_LEN: usize = 32;

/// A single use freshness token.
///
/// `Nonce` is intentionally neither `Clone` nor `Copy`: the join service hands
/// the value it generated to exactly one validation and it is gone afterwards.
#[derive(PartialEq, Eq)]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    pub fn generate() -> anyhow::Result<Self> {
        let mut bytes = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| anyhow::anyhow!("system random generator failed"))?;
        Ok(Nonce(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ValidationError> {
        let bytes: [u8; NONCE_LEN] = bytes.try_into().map_err(|_| {
            ValidationError::MalformedDocument(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Nonce(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", hex::encode(&self.0[..8]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_nonces_differ() -> anyhow::Result<()> {
        assert_ne!(Nonce::generate()?, Nonce::generate()?);
        Ok(())
    }

    #[test]
    fn wrong_length_is_malformed() {
        assert!(matches!(
            Nonce::from_slice(&[0u8; 16]),
            Err(ValidationError::MalformedDocument(_))
        ));
    }
}
