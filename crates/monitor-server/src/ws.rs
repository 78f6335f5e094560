//! The live dashboard channel.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tracing::debug;

use crate::fanout::{ClientConnection, ClientId, ClientMessage, ServerMessage};
use crate::state::ServiceContext;

pub async fn ws_handler(ws: WebSocketUpgrade, State(ctx): State<ServiceContext>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

async fn handle_socket(socket: WebSocket, ctx: ServiceContext) {
    let ClientConnection { id, mut updates } = ctx.fanout.register();
    let (mut sender, mut receiver) = socket.split();

    // Start from the latest snapshot; queued updates at or below it are stale.
    let mut last_sent = 0;
    if let Some(published) = ctx.store.current() {
        match serde_json::to_string(&ServerMessage::update(&published)) {
            Ok(text) => {
                if sender.send(Message::Text(text.into())).await.is_err() {
                    ctx.fanout.unregister(id);
                    return;
                }
                last_sent = published.sequence;
            }
            Err(e) => debug!(client = %id, error = %e, "Failed to encode initial snapshot"),
        }
    }

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            outbound = updates.recv() => {
                let Some(outbound) = outbound else {
                    // Fan-out closed this client.
                    break;
                };
                if outbound.sequence.is_some_and(|s| s <= last_sent) {
                    continue;
                }
                if sender.send(Message::Text(outbound.text.as_ref().into())).await.is_err() {
                    break;
                }
                if let Some(sequence) = outbound.sequence {
                    last_sent = sequence;
                }
            }
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => handle_client_message(&ctx, id, text.as_str()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(client = %id, error = %e, "WebSocket receive failed");
                    break;
                }
            },
        }
    }

    let _ = sender.send(Message::Close(None)).await;
    ctx.fanout.unregister(id);
}

fn handle_client_message(ctx: &ServiceContext, id: ClientId, text: &str) {
    let result = serde_json::from_str::<ClientMessage>(text)
        .map_err(|e| format!("invalid message: {}", e))
        .and_then(|message| match message {
            ClientMessage::SetTimeScale { scale } => ctx
                .change_granularity(Some(id), &scale)
                .map(|_| ())
                .map_err(|e| e.to_string()),
        });

    if let Err(message) = result {
        debug!(client = %id, error = %message, "Rejected client request");
        ctx.fanout.send_to(id, &ServerMessage::error(message));
    }
}
