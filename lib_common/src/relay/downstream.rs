//! # Downstream Client Sessions
//!
//! `GET /ws` upgrades to the client protocol; `GET /health` reports the
//! number of connected clients.
//!
//! Each session runs in its own task and owns its socket. The task:
//!
//! 1.  Registers a `ClientConnection` and logs the registry size.
//! 2.  Writes every `OutboundFrame` queued for it (broadcast text or a
//!     liveness ping) to the socket.
//! 3.  Validates inbound text as JSON and re-broadcasts the original text to
//!     every client, the sender included. Malformed text is logged and dropped.
//! 4.  Marks the connection alive on every pong.
//! 5.  Deregisters on close, socket error, eviction or relay shutdown.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;

use crate::core::envelope::validate_peer_message;
use crate::core::registry::{ClientConnection, ConnectionId, OutboundFrame};
use crate::relay::state::RelayState;

/// Builds the relay's HTTP router.
pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    connections: usize,
}

async fn health_handler(State(state): State<RelayState>) -> Json<Health> {
    Json(Health {
        status: "OK",
        connections: state.registry.len(),
    })
}

/// Relays one inbound text frame. Returns `false` if it was dropped.
fn relay_peer_message(state: &RelayState, from: ConnectionId, text: &str) -> bool {
    match validate_peer_message(text) {
        Ok(()) => {
            let report = state.dispatcher.broadcast(text);
            log::debug!("Client {} message relayed to {} client(s)", from, report.delivered);
            true
        }
        Err(e) => {
            log::warn!("Dropping malformed message from client {}: {}", from, e);
            false
        }
    }
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let (connection, mut outbound) = ClientConnection::new(state.registry.next_connection_id());
    let id = connection.id();
    let connected = state.registry.add(Arc::clone(&connection));
    log::info!("Client {} connected. {} client(s) connected.", id, connected);

    let terminated = connection.termination_token();
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            _ = terminated.cancelled() => {
                // Evicted: drop the socket without a close handshake.
                log::info!("Client {} terminated.", id);
                break;
            }
            _ = state.shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            frame = outbound.recv() => {
                let message = match frame {
                    Some(OutboundFrame::Text(text)) => Message::Text(text.as_ref().to_owned().into()),
                    Some(OutboundFrame::Ping) => Message::Ping(Bytes::new()),
                    None => break,
                };
                if let Err(e) = sink.send(message).await {
                    log::debug!("Client {} send failed: {}", id, e);
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        relay_peer_message(&state, id, text.as_str());
                    }
                    Some(Ok(Message::Pong(_))) => connection.mark_alive(),
                    Some(Ok(Message::Close(_))) | None => break,
                    // Binary frames are not part of the protocol; pings are
                    // answered by the socket layer.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("Client {} read error: {}", id, e);
                        break;
                    }
                }
            }
        }
    }

    connection.terminate();
    state.registry.remove(id);
    log::info!("Client {} disconnected. {} client(s) connected.", id, state.registry.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn valid_peer_message_is_broadcast_to_everyone_including_sender() {
        let state = RelayState::new(CancellationToken::new());
        let (sender, mut sender_rx) = ClientConnection::new(state.registry.next_connection_id());
        let (peer, mut peer_rx) = ClientConnection::new(state.registry.next_connection_id());
        state.registry.add(Arc::clone(&sender));
        state.registry.add(Arc::clone(&peer));

        let text = r#"{"action":"share_item","item":{"id":3}}"#;
        assert!(relay_peer_message(&state, sender.id(), text));

        let expected = OutboundFrame::Text(Arc::from(text));
        assert_eq!(sender_rx.try_recv().ok(), Some(expected.clone()));
        assert_eq!(peer_rx.try_recv().ok(), Some(expected));
    }

    #[test]
    fn malformed_peer_message_is_dropped() {
        let state = RelayState::new(CancellationToken::new());
        let (client, mut rx) = ClientConnection::new(state.registry.next_connection_id());
        state.registry.add(Arc::clone(&client));

        assert!(!relay_peer_message(&state, client.id(), "{not json"));
        assert!(rx.try_recv().is_err());
    }
}
