//! Candidate side of the join protocol.
//!
//! [`JoinClient`] opens one WebSocket session per attempt, answers the
//! service's challenge with a document from its [`Issuer`], and returns what
//! the service released.

mod client_tls_config;
pub mod config;
pub mod material;

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use attestation::{IssuanceError, Issuer};
use futures_util::{SinkExt, StreamExt};
use join_structs::{
    binding::{CHANNEL_BINDING_LABEL, CHANNEL_BINDING_LEN, join_user_data, rejoin_user_data},
    structs::{Challenge, JoinRequest, JoinResponse, RejoinRequest, RejoinResponse, ServerMessage},
};
use log::{debug, info, warn};
use rustls_pki_types::CertificateDer;
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config,
    tungstenite::{self, Message},
};
use url::Url;

type Session = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("join rejected: {0}")]
    Rejected(String),

    #[error("join service unavailable: {0}")]
    Unavailable(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("issuing the attestation document failed: {0}")]
    Issuance(#[from] IssuanceError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClientError {
    /// Whether a new attempt may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Unavailable(_) | ClientError::Transport(_))
    }
}

/// What the candidate asks for. Sent as is, nothing is checked locally.
#[derive(Debug, Clone)]
pub struct JoinParameters {
    pub disk_uuid: String,
    /// DER encoded PKCS#10 request for the kubelet key
    pub certificate_request: Vec<u8>,
    pub is_control_plane: bool,
}

pub struct JoinClient {
    endpoint: Url,
    tls: Arc<rustls::ClientConfig>,
    issuer: Arc<dyn Issuer>,
}

impl JoinClient {
    /// `endpoint` is the `wss://host:port` base of the join service.
    pub fn new(
        endpoint: Url,
        server_cert: CertificateDer<'static>,
        issuer: Arc<dyn Issuer>,
    ) -> anyhow::Result<Self> {
        Ok(JoinClient {
            endpoint,
            tls: Arc::new(client_tls_config::pinned_client_config(server_cert)?),
            issuer,
        })
    }

    /// Connects to `path` and exports the channel binding of the connection.
    async fn open(&self, path: &str) -> Result<(Session, Vec<u8>), ClientError> {
        let url = self
            .endpoint
            .join(path)
            .with_context(|| format!("joining {path} onto {}", self.endpoint))?;
        debug!("Connecting to {url}");
        let (session, _) = connect_async_tls_with_config(
            url.as_str(),
            None,
            false,
            Some(Connector::Rustls(self.tls.clone())),
        )
        .await?;
        let channel_binding = match session.get_ref() {
            MaybeTlsStream::Rustls(tls) => tls
                .get_ref()
                .1
                .export_keying_material([0u8; CHANNEL_BINDING_LEN], CHANNEL_BINDING_LABEL, None)
                .map_err(|err| ClientError::Protocol(format!("no channel binding: {err}")))?,
            _ => {
                return Err(ClientError::Protocol(
                    "the join service must be reached over TLS".to_string(),
                ));
            }
        };
        Ok((session, channel_binding.to_vec()))
    }

    pub async fn join(&self, parameters: &JoinParameters) -> Result<JoinResponse, ClientError> {
        let (mut session, channel_binding) = self.open("issue_join_ticket").await?;
        let challenge = expect_challenge(&mut session).await?;

        let user_data = join_user_data(&channel_binding, &parameters.certificate_request);
        let attestation_document = self.issuer.issue(&user_data, &challenge.nonce).await?;
        let request = JoinRequest {
            disk_uuid: parameters.disk_uuid.clone(),
            certificate_request: parameters.certificate_request.clone(),
            is_control_plane: parameters.is_control_plane,
            attestation_document,
        };
        send(&mut session, &request).await?;

        let outcome = receive(&mut session).await;
        let _ = session.close(None).await;
        match outcome? {
            ServerMessage::Admitted(response) => Ok(response),
            other => Err(refusal(other)),
        }
    }

    pub async fn rejoin(&self, disk_uuid: &str) -> Result<RejoinResponse, ClientError> {
        let (mut session, channel_binding) = self.open("issue_rejoin_ticket").await?;
        let challenge = expect_challenge(&mut session).await?;

        let user_data = rejoin_user_data(&channel_binding, disk_uuid);
        let attestation_document = self.issuer.issue(&user_data, &challenge.nonce).await?;
        send(
            &mut session,
            &RejoinRequest {
                disk_uuid: disk_uuid.to_string(),
                attestation_document,
            },
        )
        .await?;

        let outcome = receive(&mut session).await;
        let _ = session.close(None).await;
        match outcome? {
            ServerMessage::Rejoined(response) => Ok(response),
            other => Err(refusal(other)),
        }
    }

    /// Repeats [`JoinClient::join`] while the failure is retryable.
    pub async fn join_with_retries(
        &self,
        parameters: &JoinParameters,
        max_attempts: u32,
        backoff: Duration,
    ) -> Result<JoinResponse, ClientError> {
        let mut attempt = 1;
        loop {
            match self.join(parameters).await {
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    warn!("Join attempt {attempt}/{max_attempts} failed, retrying in {backoff:?}: {err}");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                result => {
                    if result.is_ok() {
                        info!("Admitted into the cluster after {attempt} attempt(s)");
                    }
                    return result;
                }
            }
        }
    }
}

fn refusal(message: ServerMessage) -> ClientError {
    match message {
        ServerMessage::Rejected { message } => ClientError::Rejected(message),
        ServerMessage::Unavailable { message } => ClientError::Unavailable(message),
        ServerMessage::Challenge(_) => ClientError::Protocol("unexpected challenge".to_string()),
        ServerMessage::Admitted(_) | ServerMessage::Rejoined(_) => {
            ClientError::Protocol("unexpected outcome".to_string())
        }
    }
}

async fn send(session: &mut Session, message: &impl Serialize) -> Result<(), ClientError> {
    let json = serde_json::to_string(message).context("encoding the request")?;
    session.send(Message::Text(json.into())).await?;
    Ok(())
}

async fn receive(session: &mut Session) -> Result<ServerMessage, ClientError> {
    while let Some(message) = session.next().await {
        let parsed = match message? {
            Message::Text(text) => serde_json::from_str(text.as_str()),
            Message::Binary(bytes) => serde_json::from_slice(&bytes),
            Message::Close(_) => break,
            _ => continue,
        };
        return parsed.map_err(|err| ClientError::Protocol(format!("unreadable message: {err}")));
    }
    Err(ClientError::Protocol(
        "the join service closed the session without an answer".to_string(),
    ))
}

async fn expect_challenge(session: &mut Session) -> Result<Challenge, ClientError> {
    match receive(session).await? {
        ServerMessage::Challenge(challenge) => Ok(challenge),
        other => Err(refusal(other)),
    }
}
