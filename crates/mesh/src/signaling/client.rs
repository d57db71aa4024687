//! Signaling client: one owned relay connection per session
//!
//! The client is constructed explicitly and injected into the session, so
//! several sessions (or tests) can each talk to their own relay.

use super::protocol::{PeerId, SignalingMessage};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// An open relay connection, as produced by a [`SignalingConnector`]
///
/// The inbound channel closing means the relay connection is gone.
pub struct SignalingLink {
    /// Id the relay assigned to this connection
    pub local_id: PeerId,
    /// Messages to the relay
    pub outbound: mpsc::UnboundedSender<SignalingMessage>,
    /// Messages from the relay
    pub inbound: mpsc::UnboundedReceiver<SignalingMessage>,
    /// Background I/O tasks, aborted on disconnect
    pub tasks: Vec<JoinHandle<()>>,
}

/// Transport that can open relay connections
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    /// Open a connection and wait for the relay to assign an id
    ///
    /// Background tasks must stop when `cancel` fires.
    async fn open(&self, cancel: CancellationToken) -> Result<SignalingLink>;
}

/// Clonable sending half of the current relay connection
#[derive(Clone)]
pub struct SignalSender {
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

impl SignalSender {
    /// Wrap the outbound half of a relay connection
    pub fn new(tx: mpsc::UnboundedSender<SignalingMessage>) -> Self {
        Self { tx }
    }

    /// Queue a message for the relay
    pub fn send(&self, message: SignalingMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| Error::SignalingError("Relay connection closed".to_string()))
    }
}

/// What the relay connection produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    /// A typed message
    Message(SignalingMessage),
    /// The relay connection dropped
    Disconnected,
}

struct ActiveLink {
    local_id: PeerId,
    sender: SignalSender,
    inbound: mpsc::UnboundedReceiver<SignalingMessage>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

/// Typed bidirectional channel to the relay
pub struct SignalingClient {
    connector: Arc<dyn SignalingConnector>,
    link: Option<ActiveLink>,
}

impl SignalingClient {
    /// Create a disconnected client over a transport
    pub fn new(connector: Arc<dyn SignalingConnector>) -> Self {
        Self {
            connector,
            link: None,
        }
    }

    /// Connect to the relay, replacing any previous connection
    ///
    /// # Arguments
    ///
    /// * `cancel` - Parent token; cancelling it tears the connection down
    ///
    /// # Returns
    ///
    /// The relay-assigned local participant id
    pub async fn connect(&mut self, cancel: &CancellationToken) -> Result<PeerId> {
        self.disconnect();

        let child = cancel.child_token();
        let link = self.connector.open(child.clone()).await?;
        let local_id = link.local_id.clone();

        info!("Signaling connected as {}", local_id);

        self.link = Some(ActiveLink {
            local_id: link.local_id,
            sender: SignalSender { tx: link.outbound },
            inbound: link.inbound,
            tasks: link.tasks,
            cancel: child,
        });

        Ok(local_id)
    }

    /// Whether a relay connection is open
    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Relay-assigned id of the current connection
    pub fn local_id(&self) -> Option<&str> {
        self.link.as_ref().map(|l| l.local_id.as_str())
    }

    /// Sending half of the current connection
    pub fn sender(&self) -> Option<SignalSender> {
        self.link.as_ref().map(|l| l.sender.clone())
    }

    /// Send a message over the current connection
    ///
    /// # Errors
    ///
    /// Returns `Error::SignalingError` when not connected.
    pub fn send(&self, message: SignalingMessage) -> Result<()> {
        match &self.link {
            Some(link) => link.sender.send(message),
            None => Err(Error::SignalingError("Not connected".to_string())),
        }
    }

    /// Wait for the next inbound event
    ///
    /// Pends forever while disconnected, so it can sit in a `select!`.
    pub async fn recv(&mut self) -> SignalingEvent {
        let Some(link) = self.link.as_mut() else {
            return std::future::pending().await;
        };

        let received = link.inbound.recv().await;
        match received {
            Some(message) => SignalingEvent::Message(message),
            None => {
                self.drop_link();
                SignalingEvent::Disconnected
            }
        }
    }

    /// Take an already-delivered inbound event without waiting
    pub fn try_recv(&mut self) -> Option<SignalingEvent> {
        let link = self.link.as_mut()?;

        let received = link.inbound.try_recv();
        match received {
            Ok(message) => Some(SignalingEvent::Message(message)),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.drop_link();
                Some(SignalingEvent::Disconnected)
            }
        }
    }

    /// Close the relay connection; idempotent
    pub fn disconnect(&mut self) {
        if let Some(link) = self.link.as_ref() {
            info!("Disconnecting signaling ({})", link.local_id);
        }
        self.drop_link();
    }

    fn drop_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.cancel.cancel();
            for task in link.tasks {
                task.abort();
            }
            debug!("Signaling link {} released", link.local_id);
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.drop_link();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::protocol::{KickedPayload, SignalingMessage};

    struct LoopConnector;

    #[async_trait]
    impl SignalingConnector for LoopConnector {
        async fn open(&self, _cancel: CancellationToken) -> Result<SignalingLink> {
            // Echo: whatever is sent comes straight back
            let (outbound, mut echo_rx) = mpsc::unbounded_channel();
            let (echo_tx, inbound) = mpsc::unbounded_channel();
            let task = tokio::spawn(async move {
                while let Some(msg) = echo_rx.recv().await {
                    if echo_tx.send(msg).is_err() {
                        break;
                    }
                }
            });
            Ok(SignalingLink {
                local_id: "echo-1".to_string(),
                outbound,
                inbound,
                tasks: vec![task],
            })
        }
    }

    fn kicked() -> SignalingMessage {
        SignalingMessage::Kicked(KickedPayload {
            message: "bye".to_string(),
            kicked_by: "Alice".to_string(),
        })
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let client = SignalingClient::new(Arc::new(LoopConnector));
        assert!(matches!(client.send(kicked()), Err(Error::SignalingError(_))));
        assert!(client.local_id().is_none());
    }

    #[tokio::test]
    async fn test_round_trip_and_disconnect() {
        let mut client = SignalingClient::new(Arc::new(LoopConnector));
        let cancel = CancellationToken::new();

        let id = client.connect(&cancel).await.unwrap();
        assert_eq!(id, "echo-1");
        assert!(client.is_connected());

        client.send(kicked()).unwrap();
        assert_eq!(client.recv().await, SignalingEvent::Message(kicked()));
        assert!(client.try_recv().is_none());

        client.disconnect();
        assert!(!client.is_connected());
        assert!(client.try_recv().is_none());
    }
}
