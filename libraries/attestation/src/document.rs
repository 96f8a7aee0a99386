use serde::{Deserialize, Serialize};
use serde_with::{IfIsHumanReadable, base64::Base64, serde_as};
use sha2::{Digest as _, Sha256};

use crate::{error::ValidationError, quote::Quote, variant::AttestationVariant};

/// Evidence a candidate presents to the join service.
///
/// Nonce and user data travel in clear next to the quote; the quote itself
/// only carries [`report_data`] over both.
#[serde_as]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttestationDocument {
    pub variant: AttestationVariant,
    #[serde_as(as = "IfIsHumanReadable<Base64>")]
    pub nonce: Vec<u8>,
    #[serde_as(as = "IfIsHumanReadable<Base64>")]
    pub user_data: Vec<u8>,
    pub quote: Quote,
}

impl AttestationDocument {
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ValidationError> {
        serde_json::from_slice(bytes)
            .map_err(|err| ValidationError::MalformedDocument(err.to_string()))
    }
}

/// Binds a nonce and user data into the 32 bytes a quote signs over.
pub fn report_data(nonce: &[u8], user_data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update((nonce.len() as u64).to_be_bytes());
    hasher.update(nonce);
    hasher.update(user_data);
    hasher.finalize().into()
}
