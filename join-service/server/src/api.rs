//! WebSocket endpoints. One connection carries exactly one join attempt:
//! challenge, request, outcome, close.

use std::{net::SocketAddr, sync::Arc};

use anyhow::anyhow;
use axum::{
    Extension, Json, Router,
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use join_structs::structs::{JoinRequest, RejoinRequest, ServerMessage};
use log::{info, warn};
use serde::Serialize;
use tokio::time::timeout_at;
use tower_http::trace::TraceLayer;

use crate::{
    error::JoinError,
    server_tls_acceptor::TlsData,
    service::{JoinAttempt, JoinService, Peer},
    web_error::AppError,
};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<JoinService>,
}

#[derive(Debug, Clone, Copy)]
enum Ticket {
    Join,
    Rejoin,
}

pub fn router(service: Arc<JoinService>) -> Router {
    Router::new()
        .route("/issue_join_ticket", get(issue_join_ticket))
        .route("/issue_rejoin_ticket", get(issue_rejoin_ticket))
        .route("/health", get(health))
        .with_state(AppState { service })
        .layer(TraceLayer::new_for_http())
}

fn peer(addr: SocketAddr, tls_data: TlsData) -> Peer {
    Peer {
        address: addr.ip().to_canonical(),
        channel_binding: tls_data.channel_binding,
    }
}

pub(crate) async fn issue_join_ticket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(tls_data): Extension<TlsData>,
) -> impl IntoResponse {
    let peer = peer(addr, tls_data);
    ws.on_upgrade(move |socket| session(socket, state.service, peer, Ticket::Join))
}

pub(crate) async fn issue_rejoin_ticket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(tls_data): Extension<TlsData>,
) -> impl IntoResponse {
    let peer = peer(addr, tls_data);
    ws.on_upgrade(move |socket| session(socket, state.service, peer, Ticket::Rejoin))
}

#[derive(Serialize)]
pub(crate) struct Health {
    variant: String,
}

pub(crate) async fn health(State(state): State<AppState>) -> Result<Json<Health>, AppError> {
    let variant = state.service.variant();
    if !state.service.ready() {
        return Err(anyhow!("no validator or measurement policy for {variant}").into());
    }
    Ok(Json(Health {
        variant: variant.to_string(),
    }))
}

async fn send(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> anyhow::Result<()> {
    let json = serde_json::to_string(message)?;
    sender.send(Message::Text(json.into())).await?;
    Ok(())
}

/// Next data frame, `None` once the candidate closed the connection.
async fn next_text(receiver: &mut SplitStream<WebSocket>) -> anyhow::Result<Option<String>> {
    while let Some(message) = receiver.next().await {
        match message? {
            Message::Text(text) => return Ok(Some(text.as_str().to_string())),
            Message::Binary(bytes) => return Ok(Some(String::from_utf8(bytes.to_vec())?)),
            Message::Close(_) => return Ok(None),
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    Ok(None)
}

/// Resolves when the candidate goes away.
async fn disconnected(receiver: &mut SplitStream<WebSocket>) {
    while let Some(Ok(message)) = receiver.next().await {
        if matches!(message, Message::Close(_)) {
            return;
        }
    }
}

async fn answer(
    service: &JoinService,
    attempt: JoinAttempt,
    ticket: Ticket,
    text: &str,
) -> Result<ServerMessage, JoinError> {
    match ticket {
        Ticket::Join => match serde_json::from_str::<JoinRequest>(text) {
            Ok(request) => service
                .issue_join_ticket(attempt, request)
                .await
                .map(ServerMessage::Admitted),
            Err(err) => Err(service.reject(attempt, JoinError::MalformedRequest(err.to_string()))),
        },
        Ticket::Rejoin => match serde_json::from_str::<RejoinRequest>(text) {
            Ok(request) => service
                .issue_rejoin_ticket(attempt, request)
                .await
                .map(ServerMessage::Rejoined),
            Err(err) => Err(service.reject(attempt, JoinError::MalformedRequest(err.to_string()))),
        },
    }
}

async fn session(socket: WebSocket, service: Arc<JoinService>, peer: Peer, ticket: Ticket) {
    let (mut sender, mut receiver) = socket.split();
    let address = peer.address;

    let attempt = match service.begin_attempt(peer) {
        Ok(attempt) => attempt,
        Err(err) => {
            warn!("Could not start a join attempt for {address}: {err}");
            let _ = send(&mut sender, &err.response()).await;
            return;
        }
    };
    let id = attempt.id();
    if let Err(err) = send(&mut sender, &ServerMessage::Challenge(attempt.challenge())).await {
        let err = service.reject(attempt, JoinError::Internal(err));
        warn!("Join attempt {id}: challenge not delivered: {err}");
        return;
    }

    let text = match timeout_at(attempt.deadline(), next_text(&mut receiver)).await {
        Ok(Ok(Some(text))) => text,
        Ok(Ok(None)) => {
            service.reject(
                attempt,
                JoinError::MalformedRequest("connection closed before the request".to_string()),
            );
            return;
        }
        Ok(Err(err)) => {
            service.reject(attempt, JoinError::MalformedRequest(format!("{err:#}")));
            return;
        }
        Err(_) => {
            let err = service.reject(
                attempt,
                JoinError::MalformedRequest("no request before the deadline".to_string()),
            );
            let _ = send(&mut sender, &err.response()).await;
            return;
        }
    };

    tokio::select! {
        outcome = answer(&service, attempt, ticket, &text) => {
            let message = outcome.unwrap_or_else(|err| err.response());
            if let Err(err) = send(&mut sender, &message).await {
                warn!("Join attempt {id}: outcome not delivered: {err:#}");
            }
            let _ = sender.close().await;
        }
        _ = disconnected(&mut receiver) => {
            info!("Join attempt {id} from {address}: candidate disconnected, attempt abandoned");
        }
    }
}
