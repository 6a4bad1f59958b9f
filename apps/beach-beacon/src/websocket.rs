use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use metrics::gauge;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::router::{RouteOutcome, SignalingRouter};
use crate::server::AppState;
use crate::signaling::{ConnectionId, ServerMessage};

#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    /// Caller-chosen connection id; a random one is assigned when absent.
    #[serde(default)]
    pub client_id: Option<String>,
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    Query(query): Query<ConnectQuery>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    let requested = query
        .client_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .map(ConnectionId::from);

    if let Some(id) = &requested {
        if state.router.registry().contains(id) {
            warn!(connection_id = %id, %remote_addr, "rejecting duplicate connection id");
            return (StatusCode::CONFLICT, "connection id already in use").into_response();
        }
    }

    let router = state.router.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, router, requested, remote_addr))
}

/// Handle a WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    router: SignalingRouter,
    requested: Option<ConnectionId>,
    remote_addr: SocketAddr,
) {
    let (mut sender, mut receiver) = socket.split();

    // Outbound queue drained by the writer task
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let mut connection_id = match router.connect(requested, tx) {
        Ok(id) => id,
        Err(err) => {
            // Lost a race for the same caller-chosen id after the upgrade.
            warn!(%remote_addr, error = %err, "connection rejected");
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: err.to_string().into(),
                })))
                .await;
            return;
        }
    };
    gauge!("beach_beacon_connections_active", router.registry().len() as f64);

    info!(
        connection_id = %connection_id,
        %remote_addr,
        "websocket connected"
    );

    let writer_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(connection_id = %writer_id, error = %err, "failed to encode outbound message");
                }
            }
        }
        debug!(connection_id = %writer_id, "writer task finished");
    });

    while let Some(msg_result) = receiver.next().await {
        let msg = match msg_result {
            Ok(m) => m,
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "websocket receive error");
                break;
            }
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    debug!(connection_id = %connection_id, "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Message::Close(frame) => {
                debug!(
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        let outcome = router.handle_text(&connection_id, &text);
        debug!(connection_id = %connection_id, ?outcome, "frame handled");
        if let RouteOutcome::Rekeyed(id) = outcome {
            connection_id = id;
        }
    }

    router.disconnect(&connection_id);
    writer.abort();
    gauge!("beach_beacon_connections_active", router.registry().len() as f64);

    info!(connection_id = %connection_id, %remote_addr, "websocket disconnected");
}
