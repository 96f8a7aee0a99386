//! User data a candidate binds into its attestation document.
//!
//! Both ends of a join session export the same keying material from the TLS
//! connection. Hashing it into the user data ties the document to the
//! connection it was issued for, so a document captured from one session is
//! worthless in any other.

use sha2::{Digest, Sha256};

/// TLS exporter label of the channel binding.
pub const CHANNEL_BINDING_LABEL: &[u8] = b"EXPORTER-cluster-join-channel-binding";
pub const CHANNEL_BINDING_LEN: usize = 32;

const JOIN_DOMAIN: &[u8] = b"cluster-join-v1";
const REJOIN_DOMAIN: &[u8] = b"cluster-rejoin-v1";

fn bind(domain: &[u8], channel_binding: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update((channel_binding.len() as u64).to_be_bytes());
    hasher.update(channel_binding);
    hasher.update(payload);
    hasher.finalize().to_vec()
}

/// User data of a join attempt: the channel and the certificate request.
pub fn join_user_data(channel_binding: &[u8], certificate_request: &[u8]) -> Vec<u8> {
    bind(JOIN_DOMAIN, channel_binding, certificate_request)
}

/// User data of a rejoin attempt: the channel and the disk asking for its key.
pub fn rejoin_user_data(channel_binding: &[u8], disk_uuid: &str) -> Vec<u8> {
    bind(REJOIN_DOMAIN, channel_binding, disk_uuid.as_bytes())
}
