use crate::state::AppState;
use crate::ws::connections::Outbound;
use crate::ws::dispatcher::Dispatcher;
use axum::{
    body::Bytes,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Create channel for outbound frames and register the connection
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let lease = state.connections.register(tx).await;
    let connection_id = lease.id;

    tracing::info!("Connection {} opened", connection_id);

    // Spawn task to forward queued frames to the WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let message = match frame {
                Outbound::Text(text) => Message::Text(text.into()),
                Outbound::Ping => Message::Ping(Bytes::new()),
                Outbound::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut dispatcher = Dispatcher::new(
        connection_id,
        state.manager.clone(),
        state.connections.clone(),
    );

    // Frames are handled one at a time, reply queued before the next read
    loop {
        tokio::select! {
            _ = lease.terminate.notified() => {
                tracing::info!("Connection {} terminated by keepalive", connection_id);
                break;
            }
            frame = receiver.next() => {
                let Some(frame) = frame else {
                    break;
                };
                match frame {
                    Ok(Message::Text(text)) => {
                        if let Some(reply) = dispatcher.handle_frame(text.as_str()).await {
                            tracing::debug!(
                                target: "access",
                                "S -> C[{}] send: {} uuid={:?} error={}",
                                connection_id,
                                reply.message_type,
                                reply.uuid,
                                reply.error.is_some()
                            );
                            state.connections.send_to(connection_id, &reply).await;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        state.connections.mark_alive(connection_id).await;
                    }
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        tracing::warn!("WebSocket error on {}: {}", connection_id, e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    // Cleanup on disconnect
    dispatcher.close().await;
    state.connections.unregister(connection_id).await;
    send_task.abort();

    tracing::info!("Connection {} closed", connection_id);
}
