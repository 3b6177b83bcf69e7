use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::connection::Outbound;
use crate::errors::{RelayError, RelayResult};
use crate::models::{ClientMessage, HealthResponse, ServerMessage};
use crate::service::AppState;

#[derive(Deserialize)]
struct TerminalParams {
    token: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/terminal/{room}", get(terminal_socket))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.connections.len(),
    })
}

async fn terminal_socket(
    State(state): State<AppState>,
    Path(room): Path<String>,
    Query(params): Query<TerminalParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> RelayResult<Response> {
    let channel = Channel::parse(&room).inspect_err(|error| {
        warn!(%room, %error, "rejecting terminal connection");
    })?;
    let token = bearer_token(&headers).or(params.token);

    Ok(ws.on_upgrade(move |socket| serve_terminal(state, channel, token, socket)))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

/// Parse a client frame and make sure it addresses this connection's
/// sandbox.
pub fn parse_client_message(raw: &str, channel: &Channel) -> RelayResult<ClientMessage> {
    let message: ClientMessage =
        serde_json::from_str(raw).map_err(|e| RelayError::Protocol(e.to_string()))?;
    if message.sandbox_id() != channel.sandbox_id {
        return Err(RelayError::Protocol(format!(
            "{} addressed to sandbox '{}' on channel for '{}'",
            message.kind(),
            message.sandbox_id(),
            channel.sandbox_id
        )));
    }
    Ok(message)
}

/// Drive one terminal WebSocket. A reader task validates frames into a
/// bounded queue, this task handles them one at a time, and a writer task
/// drains the outbound queue to the socket. Either side cancelling `closed`
/// tears the connection down.
async fn serve_terminal(
    state: AppState,
    channel: Channel,
    token: Option<String>,
    socket: WebSocket,
) {
    let (mut sink, mut stream) = socket.split();
    let closed = CancellationToken::new();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(state.config().outbound_queue_size);
    let outbound = Outbound::new(&channel.sandbox_id, out_tx, closed.clone());
    let (id, connection) =
        state
            .controller
            .open_connection(&state.connections, channel.clone(), token, outbound);
    info!(connection_id = %id, %channel, "terminal connected");

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(error) => {
                    warn!(connection_id = %id, %error, "failed to encode server message");
                    continue;
                }
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let (in_tx, mut in_rx) = mpsc::channel::<ClientMessage>(state.config().inbound_queue_size);
    let reader = {
        let closed = closed.clone();
        let channel = channel.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = closed.cancelled() => break,
                    frame = stream.next() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                let parsed = match frame {
                    Ok(Message::Text(text)) => parse_client_message(text.as_str(), &channel),
                    Ok(Message::Binary(data)) => std::str::from_utf8(&data)
                        .map_err(|e| RelayError::Protocol(e.to_string()))
                        .and_then(|raw| parse_client_message(raw, &channel)),
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                    Ok(Message::Close(frame)) => {
                        debug!(connection_id = %id, ?frame, "client closed terminal");
                        break;
                    }
                    Err(error) => {
                        warn!(connection_id = %id, %error, "terminal socket error");
                        break;
                    }
                };

                match parsed {
                    Ok(message) => {
                        if in_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => warn!(connection_id = %id, %error, "rejected client message"),
                }
            }
            closed.cancel();
        })
    };

    loop {
        let message = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            message = in_rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let mut info = connection.lock().await;
        state.controller.handle_message(&mut info, message).await;
    }

    // Unblocks a reader parked on a full inbound queue.
    drop(in_rx);
    let _ = reader.await;
    state.controller.close_connection(&state.connections, id).await;
    writer.abort();
    info!(connection_id = %id, %channel, "terminal disconnected");
}
