//! `GET /ws`: live event stream.
//!
//! The socket is split into a reader and a writer task. The writer drains the
//! client's queue in the [`BroadcastHub`]; the reader feeds control messages
//! back into the hub. Whichever finishes first ends the session.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};

use crate::state::AppState;

pub async fn events_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let hub = state.hub.clone();
    let (client, mut outbound) = hub.connect();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let mut egress = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let ingest_hub = hub.clone();
    let mut ingest = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => ingest_hub.handle_message(client, text.as_str()),
                Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                    Ok(text) => ingest_hub.handle_message(client, text),
                    Err(_) => ingest_hub.handle_message(client, ""),
                },
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut ingest => { egress.abort(); }
        _ = &mut egress => { ingest.abort(); }
    }

    hub.disconnect(client);
}
