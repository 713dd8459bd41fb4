//! WebSocket endpoint (`GET /ws`).
//!
//! Each accepted socket gets a fresh [`ClientId`]. The hub is told about the
//! close exactly once, whichever side ends the session.

use crate::actors::HubActorHandle;
use crate::signaling::{encode, ServerMessage};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use common::types::ClientId;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Encoded frames buffered between the connection actor and the socket.
const OUTBOUND_BUFFER: usize = 64;

/// Router state for the signaling endpoint.
#[derive(Clone, Debug)]
pub struct SignalingState {
    pub hub: HubActorHandle,
}

/// Router serving `GET /ws`.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` to
/// have peer addresses logged.
pub fn signaling_router(state: SignalingState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SignalingState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let origin = connect_info.map(|ConnectInfo(addr)| addr);
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub, origin))
}

/// Run one signaling session until either side closes.
#[instrument(skip_all, name = "hub.transport.ws", fields(client_id = tracing::field::Empty))]
pub async fn handle_socket(socket: WebSocket, hub: HubActorHandle, origin: Option<SocketAddr>) {
    let client_id = ClientId::new();
    tracing::Span::current().record("client_id", client_id.as_str());

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);

    if let Err(e) = hub.connect(client_id.clone(), origin, outbound_tx).await {
        warn!(
            target: "hub.transport.ws",
            client_id = %client_id,
            error = %e,
            "Connection refused"
        );
        let refusal = ServerMessage::error(e.client_message(), e.error_code(), None, None);
        if let Ok(text) = encode(&refusal) {
            let _ = ws_sender.send(Message::Text(text)).await;
        }
        let _ = ws_sender.close().await;
        return;
    }

    info!(target: "hub.transport.ws", client_id = %client_id, origin = ?origin, "WebSocket session started");

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if ws_sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    loop {
        tokio::select! {
            _ = &mut writer => {
                debug!(target: "hub.transport.ws", client_id = %client_id, "Writer finished");
                break;
            }

            incoming = ws_receiver.next() => {
                let Some(result) = incoming else {
                    break;
                };
                match result {
                    Ok(Message::Text(text)) => {
                        if hub.inbound(client_id.clone(), text).await.is_err() {
                            debug!(target: "hub.transport.ws", client_id = %client_id, "Hub gone, closing socket");
                            break;
                        }
                    }
                    Ok(Message::Binary(_)) => {
                        debug!(target: "hub.transport.ws", client_id = %client_id, "Ignoring binary frame");
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(target: "hub.transport.ws", client_id = %client_id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = hub.disconnect(client_id.clone()).await {
        debug!(target: "hub.transport.ws", client_id = %client_id, error = %e, "Disconnect not delivered");
    }
    info!(target: "hub.transport.ws", client_id = %client_id, "WebSocket session ended");
}
