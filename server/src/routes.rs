use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;

use bitswarm::{Bitswarm, BitswarmError, Broadcast, ClientKey, ClientMessage, Snapshot};

#[derive(Clone)]
pub struct AppState {
    pub swarm: Arc<Bitswarm>,
    pub trusted_headers: Arc<[String]>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/initial-state", get(initial_state))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

struct AppError(BitswarmError);

impl From<BitswarmError> for AppError {
    fn from(err: BitswarmError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(error = ?self.0, "Request failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
    }
}

async fn initial_state(State(state): State<AppState>) -> Result<Json<Snapshot>, AppError> {
    Ok(Json(state.swarm.snapshot().await?))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let origin = ClientKey::resolve(
        |name| headers.get(name).and_then(|value| value.to_str().ok()),
        &state.trusted_headers,
        peer.ip(),
    );

    if !state.swarm.admit_connection(&origin) {
        return StatusCode::BAD_REQUEST.into_response();
    }

    ws.on_upgrade(move |socket| serve_client(socket, state.swarm, origin))
}

async fn serve_client(socket: WebSocket, swarm: Arc<Bitswarm>, origin: ClientKey) {
    let feed = match swarm.connect_client().await {
        Ok(feed) => feed,
        Err(err) => {
            tracing::error!(error = ?err, origin = %origin, "Failed to attach client");
            return;
        }
    };

    tracing::debug!(origin = %origin, "Client connected");

    let (mut sink, mut stream) = socket.split();
    let mut broadcasts = feed.receiver;
    let first = Broadcast::FullState(Arc::new(feed.snapshot));

    let mut send_task = {
        let swarm = Arc::clone(&swarm);

        tokio::spawn(async move {
            let mut next = Some(first);

            loop {
                let message = match next.take() {
                    Some(message) => message,
                    None => match broadcasts.recv().await {
                        Ok(message) => message,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "Client lagged, resending full state");
                            match swarm.snapshot().await {
                                Ok(snapshot) => Broadcast::FullState(Arc::new(snapshot)),
                                Err(err) => {
                                    tracing::error!(error = ?err, "Failed to read snapshot");
                                    continue;
                                }
                            }
                        }
                        Err(RecvError::Closed) => break,
                    },
                };

                let text = match message.to_message() {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::error!(error = ?err, "Failed to encode broadcast");
                        continue;
                    }
                };

                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        })
    };

    let mut recv_task = {
        let origin = origin.clone();

        tokio::spawn(async move {
            while let Some(Ok(message)) = stream.next().await {
                let text = match message {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };

                let index = match ClientMessage::parse(text.as_str()) {
                    Ok(ClientMessage::ToggleBit { index }) => index,
                    Err(err) => {
                        tracing::debug!(error = ?err, origin = %origin, "Ignoring malformed frame");
                        continue;
                    }
                };

                // detached, so a disconnect does not cancel a toggle in flight
                let swarm = Arc::clone(&swarm);
                let origin = origin.clone();
                tokio::spawn(async move {
                    match swarm.toggle(&origin, index).await {
                        Ok(decision) => {
                            tracing::trace!(origin = %origin, index, ?decision, "Toggle handled");
                        }
                        Err(err) => {
                            tracing::warn!(error = ?err, origin = %origin, index, "Toggle failed");
                        }
                    }
                });
            }
        })
    };

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    tracing::debug!(origin = %origin, "Client disconnected");
}
