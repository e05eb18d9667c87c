use crate::error::AppError;
use crate::state::AppState;
use axum::{
    extract::{
        Path, State,
        ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::stream::StreamExt;
use market_data::broadcast::{UpdateKind, UpdateRecord, topic};
use tokio::sync::broadcast::{Receiver, error::RecvError};
use types::prelude::{Exchange, Symbol};

/// `GET /v1/stream/{kind}/{exchange}/{symbol}`: forward one broadcast
/// topic to the client as JSON text frames.
pub async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path((kind, exchange, symbol)): Path<(String, String, String)>,
) -> Result<Response, AppError> {
    let kind = UpdateKind::parse(&kind)
        .ok_or_else(|| AppError::BadRequest(format!("unknown stream kind: {}", kind)))?;
    let exchange = Exchange::new(exchange);
    state.engine.connection(&exchange)?;
    let topic = topic(kind, &exchange, &Symbol::new(symbol));

    let updates = state.engine.broadcast().subscribe(&topic);
    tracing::debug!(topic = %topic, "stream client subscribed");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, updates, topic)))
}

async fn handle_socket(mut socket: WebSocket, mut updates: Receiver<UpdateRecord>, topic: String) {
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(record) => {
                    let text = match serde_json::to_string(&record) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!(topic = %topic, error = %e, "failed to encode update");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(Utf8Bytes::from(text))).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(topic = %topic, skipped, "stream client lagging");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::debug!(topic = %topic, "stream client disconnected");
}
