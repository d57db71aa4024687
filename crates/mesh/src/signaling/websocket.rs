//! WebSocket transport for the relay
//!
//! Text frames carry `{"event", "data"}` JSON. The relay's first frame must be
//! `connect {socketId}`; until it arrives the connection is not handed out.

use super::client::{SignalingConnector, SignalingLink};
use super::protocol::{ConnectPayload, Direction, Frame, SignalingMessage, CONNECT_EVENT};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to a relay over ws:// or wss://
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    handshake_timeout: Duration,
}

impl WebSocketConnector {
    /// Create a connector
    ///
    /// # Arguments
    ///
    /// * `url` - WebSocket signaling server URL (ws:// or wss://)
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            handshake_timeout: Duration::from_secs(10),
        }
    }

    /// How long to wait for the relay's `connect` frame
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    async fn await_socket_id(&self, read: &mut futures::stream::SplitStream<WsStream>) -> Result<String> {
        let wait = async {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let frame: Frame = serde_json::from_str(&text).map_err(|e| {
                            Error::SerializationError(format!("Invalid relay frame: {}", e))
                        })?;
                        if frame.event == CONNECT_EVENT {
                            let payload: ConnectPayload =
                                serde_json::from_value(frame.data).map_err(|e| {
                                    Error::SerializationError(format!(
                                        "Invalid connect payload: {}",
                                        e
                                    ))
                                })?;
                            return Ok(payload.socket_id);
                        }
                        warn!("Ignoring '{}' before connect frame", frame.event);
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        return Err(Error::WebSocketError(format!("Handshake failed: {}", e)));
                    }
                }
            }
            Err(Error::SignalingError(
                "Relay closed before assigning an id".to_string(),
            ))
        };

        tokio::time::timeout(self.handshake_timeout, wait)
            .await
            .map_err(|_| Error::SignalingError("Timed out waiting for relay id".to_string()))?
    }

    /// Sender task: serializes queued messages onto the socket
    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<SignalingMessage>,
        cancel: CancellationToken,
    ) {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            let text = match msg.to_json(Direction::ToRelay) {
                Ok(text) => text,
                Err(e) => {
                    error!("Dropping unserializable signaling message: {}", e);
                    continue;
                }
            };

            if let Err(e) = write.send(Message::Text(text)).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
        }

        let _ = write.send(Message::Close(None)).await;
        debug!("Sender task terminated");
    }

    /// Receiver task: parses frames and forwards typed messages
    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        tx: mpsc::UnboundedSender<SignalingMessage>,
        cancel: CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = read.next() => next,
            };

            match next {
                Some(Ok(Message::Text(text))) => match SignalingMessage::from_json(&text) {
                    Ok(Some(msg)) => {
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Ok(None) => debug!("Ignoring unknown relay event: {}", text),
                    Err(e) => warn!("Failed to parse signaling message: {}", e),
                },
                Some(Ok(Message::Close(_))) => {
                    info!("WebSocket connection closed by relay");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                None => break,
            }
        }

        debug!("Receiver task terminated");
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    #[instrument(skip(self, cancel), fields(url = %self.url))]
    async fn open(&self, cancel: CancellationToken) -> Result<SignalingLink> {
        info!("Connecting to signaling server: {}", self.url);

        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

        let (write, mut read) = ws_stream.split();
        let local_id = self.await_socket_id(&mut read).await?;

        info!("Relay assigned id {}", local_id);

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        let sender = tokio::spawn(Self::sender_task(write, outbound_rx, cancel.clone()));
        let receiver = tokio::spawn(Self::receiver_task(read, inbound_tx, cancel));

        Ok(SignalingLink {
            local_id,
            outbound,
            inbound,
            tasks: vec![sender, receiver],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused_is_websocket_error() {
        // Port 9 (discard) is not listening in test environments
        let connector = WebSocketConnector::new("ws://127.0.0.1:9/signaling");
        let result = connector.open(CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::WebSocketError(_))));
    }

    #[test]
    fn test_handshake_timeout_builder() {
        let connector = WebSocketConnector::new("ws://localhost:4000")
            .with_handshake_timeout(Duration::from_millis(250));
        assert_eq!(connector.handshake_timeout, Duration::from_millis(250));
    }
}
