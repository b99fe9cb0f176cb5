use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::channel::RequestChannel;
use crate::error::Result;

/// Open a WebSocket to the signaling server and wire it to a [`RequestChannel`].
///
/// The writer task drains frames handed over by the channel; the reader task
/// routes inbound frames back into it and closes the channel when the socket
/// goes away.
pub async fn connect(url: &str, request_timeout: Duration) -> Result<RequestChannel> {
    let (ws_stream, _) = connect_async(url).await?;
    tracing::info!("Connected to {}", url);

    let (mut write, mut read) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let channel = RequestChannel::new(tx, request_timeout);

    // Outgoing frames
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write.send(Message::Text(frame.into())).await {
                tracing::error!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
        let _ = write.send(Message::Close(None)).await;
    });

    // Incoming frames
    let reader_channel = channel.clone();
    tokio::spawn(async move {
        while let Some(result) = read.next().await {
            match result {
                Ok(Message::Text(text)) => reader_channel.handle_incoming(&text),
                Ok(Message::Close(_)) => {
                    tracing::info!("WebSocket closed by server");
                    break;
                }
                Err(e) => {
                    tracing::error!("WebSocket error: {}", e);
                    break;
                }
                // Pong is handled automatically by tungstenite
                _ => {}
            }
        }

        reader_channel.close();
    });

    Ok(channel)
}
