//! Admission authority of the cluster.
//!
//! A candidate node connects over TLS, receives a nonce, and answers with an
//! attestation document bound to that nonce and to its TLS channel. The
//! service validates the document, checks what the cloud says about the
//! connecting instance, and only then releases a bootstrap token, a kubelet
//! certificate and the node's disk encryption key.

pub mod api;
pub mod ca;
pub mod disk_keys;
pub mod error;
pub mod server_tls_acceptor;
pub mod service;
pub mod token;
mod web_error;

pub use error::JoinError;
pub use service::{JoinService, Peer};
