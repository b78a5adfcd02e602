use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};
use url::Url;

use super::{Connection, Connector, Inbound, TransportError};

/// WebSocket implementation of the Connector trait
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &Url) -> Result<Connection, TransportError> {
        let (ws_stream, response) =
            connect_async(endpoint.as_str())
                .await
                .map_err(|err| TransportError::Connect {
                    endpoint: endpoint.to_string(),
                    reason: err.to_string(),
                })?;
        debug!(
            target = "transport::websocket",
            endpoint = %endpoint,
            status = %response.status(),
            "websocket open"
        );

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Inbound>();

        // Writer ends when the connection drops its sender, which is how an explicit
        // close turns into a close handshake.
        let writer_endpoint = endpoint.to_string();
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = ws_sender.send(Message::Text(text)).await {
                    debug!(
                        target = "transport::websocket",
                        endpoint = %writer_endpoint,
                        error = %err,
                        "write failed"
                    );
                    return;
                }
            }
            let _ = ws_sender.close().await;
            trace!(target = "transport::websocket", endpoint = %writer_endpoint, "writer closed");
        });

        let reader_endpoint = endpoint.to_string();
        let reader = tokio::spawn(async move {
            while let Some(message) = ws_receiver.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(Inbound::Message(text)).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Binary(bytes)) => {
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        if inbound_tx.send(Inbound::Message(text)).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(
                            target = "transport::websocket",
                            endpoint = %reader_endpoint,
                            ?frame,
                            "peer closed"
                        );
                        break;
                    }
                    Ok(_) => {} // ping/pong are answered by tungstenite
                    Err(err) => {
                        let _ = inbound_tx.send(Inbound::Error(err.to_string()));
                        break;
                    }
                }
            }
            let _ = inbound_tx.send(Inbound::Closed);
        });

        Ok(Connection::from_channels(
            endpoint.clone(),
            outbound_tx,
            inbound_rx,
            vec![reader],
        ))
    }
}
