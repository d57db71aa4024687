//! Task-backed session: the controller runs in its own task and is driven
//! through a cloneable handle
//!
//! Commands and relay/link input are interleaved by one loop, so the
//! controller keeps its single-owner model while several callers (a UI, a
//! stdin reader) talk to it concurrently.

use super::controller::SessionController;
use super::generation::TeardownHandle;
use super::state::SessionSnapshot;
use crate::media::{DeviceList, RenderSurface, TrackKind};
use crate::roster::Identity;
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

/// Command mailbox size
const COMMAND_CHANNEL_BUFFER: usize = 64;

enum Command {
    Join {
        room: String,
        identity: Identity,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Leave {
        respond_to: oneshot::Sender<()>,
    },
    ToggleMic {
        respond_to: oneshot::Sender<Result<bool>>,
    },
    ToggleVideo {
        respond_to: oneshot::Sender<Result<bool>>,
    },
    ChangeInput {
        kind: TrackKind,
        device_id: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
    ChangeOutput {
        device_id: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
    AttachSurface {
        surface: Arc<dyn RenderSurface>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    EnumerateDevices {
        respond_to: oneshot::Sender<Result<DeviceList>>,
    },
    SendChat {
        text: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Kick {
        target: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
}

/// Handle to a session running in its own task
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
    teardown: TeardownHandle,
}

impl SessionHandle {
    /// Move a controller into a task
    ///
    /// Take the event stream from the controller before spawning it. The
    /// session leaves the room when every handle is dropped.
    pub fn spawn(controller: SessionController) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let handle = Self {
            sender,
            snapshots: controller.subscribe(),
            teardown: controller.teardown_handle(),
        };

        let task = tokio::spawn(run(controller, receiver));
        (handle, task)
    }

    /// Latest snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Watch snapshots
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Enter a room
    pub async fn join(&self, room: &str, identity: Identity) -> Result<()> {
        self.request(|respond_to| Command::Join {
            room: room.to_string(),
            identity,
            respond_to,
        })
        .await?
    }

    /// Leave the room, interrupting a join in progress
    #[instrument(skip(self))]
    pub async fn leave(&self) -> Result<()> {
        self.teardown.cancel();
        self.request(|respond_to| Command::Leave { respond_to }).await
    }

    /// Mute or unmute the microphone
    pub async fn toggle_mic(&self) -> Result<bool> {
        self.request(|respond_to| Command::ToggleMic { respond_to })
            .await?
    }

    /// Turn the camera on or off
    pub async fn toggle_video(&self) -> Result<bool> {
        self.request(|respond_to| Command::ToggleVideo { respond_to })
            .await?
    }

    /// Switch a capture device
    pub async fn change_input(&self, kind: TrackKind, device_id: &str) -> Result<()> {
        self.request(|respond_to| Command::ChangeInput {
            kind,
            device_id: device_id.to_string(),
            respond_to,
        })
        .await?
    }

    /// Switch the audio output device
    pub async fn change_output(&self, device_id: &str) -> Result<()> {
        self.request(|respond_to| Command::ChangeOutput {
            device_id: device_id.to_string(),
            respond_to,
        })
        .await?
    }

    /// Register a rendering surface
    pub async fn attach_surface(&self, surface: Arc<dyn RenderSurface>) -> Result<()> {
        self.request(|respond_to| Command::AttachSurface {
            surface,
            respond_to,
        })
        .await?
    }

    /// Physical devices per category
    pub async fn enumerate_devices(&self) -> Result<DeviceList> {
        self.request(|respond_to| Command::EnumerateDevices { respond_to })
            .await?
    }

    /// Send a chat line
    pub async fn send_chat(&self, text: &str) -> Result<()> {
        self.request(|respond_to| Command::SendChat {
            text: text.to_string(),
            respond_to,
        })
        .await?
    }

    /// Ask the relay to remove a participant
    pub async fn kick(&self, target: &str) -> Result<()> {
        self.request(|respond_to| Command::Kick {
            target: target.to_string(),
            respond_to,
        })
        .await?
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|e| Error::InternalError(format!("session task stopped: {e}")))?;

        rx.await
            .map_err(|e| Error::InternalError(format!("session task dropped the request: {e}")))
    }
}

async fn run(mut controller: SessionController, mut commands: mpsc::Receiver<Command>) {
    debug!("Session task started");

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => execute(&mut controller, command).await,
                None => {
                    debug!("Every session handle dropped");
                    controller.leave().await;
                    break;
                }
            },
            input = controller.next_input() => controller.handle_input(input).await,
        }
    }

    debug!("Session task stopped");
}

async fn execute(controller: &mut SessionController, command: Command) {
    // A caller that stopped waiting for its answer is not an error
    match command {
        Command::Join {
            room,
            identity,
            respond_to,
        } => {
            let _ = respond_to.send(controller.join(&room, identity).await);
        }
        Command::Leave { respond_to } => {
            controller.leave().await;
            let _ = respond_to.send(());
        }
        Command::ToggleMic { respond_to } => {
            let _ = respond_to.send(controller.toggle_mic());
        }
        Command::ToggleVideo { respond_to } => {
            let _ = respond_to.send(controller.toggle_video());
        }
        Command::ChangeInput {
            kind,
            device_id,
            respond_to,
        } => {
            let _ = respond_to.send(controller.change_input(kind, &device_id).await);
        }
        Command::ChangeOutput {
            device_id,
            respond_to,
        } => {
            let _ = respond_to.send(controller.change_output(&device_id));
        }
        Command::AttachSurface {
            surface,
            respond_to,
        } => {
            let _ = respond_to.send(controller.attach_surface(surface));
        }
        Command::EnumerateDevices { respond_to } => {
            let _ = respond_to.send(controller.enumerate_devices().await);
        }
        Command::SendChat { text, respond_to } => {
            let _ = respond_to.send(controller.send_chat(&text));
        }
        Command::Kick { target, respond_to } => {
            let _ = respond_to.send(controller.kick(&target));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use crate::media::SyntheticBackend;
    use crate::peer::LoopbackNetwork;
    use crate::session::LifecycleState;
    use crate::signaling::MemoryRelay;
    use std::time::Duration;

    #[tokio::test]
    async fn test_handle_join_and_leave() {
        let relay = MemoryRelay::new();
        let controller = SessionController::new(
            MeshConfig::default(),
            Arc::new(relay.clone()),
            Arc::new(LoopbackNetwork::new()),
            Arc::new(SyntheticBackend::with_default_devices()),
        )
        .unwrap();
        let (handle, task) = SessionHandle::spawn(controller);

        handle
            .join("abc-1234-xyz", Identity::new("Alice", "a@x.io"))
            .await
            .unwrap();
        assert_eq!(handle.snapshot().state, LifecycleState::Active);
        assert!(!handle.toggle_video().await.unwrap());

        handle.leave().await.unwrap();
        assert_eq!(handle.snapshot().state, LifecycleState::Closed);

        drop(handle);
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_leave_during_slow_capture_discards_the_join() {
        let relay = MemoryRelay::new();
        let backend = Arc::new(
            SyntheticBackend::with_default_devices().with_delay(Duration::from_millis(300)),
        );
        let controller = SessionController::new(
            MeshConfig::default(),
            Arc::new(relay.clone()),
            Arc::new(LoopbackNetwork::new()),
            backend.clone(),
        )
        .unwrap();
        let (handle, task) = SessionHandle::spawn(controller);

        let joining = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .join("abc-1234-xyz", Identity::new("Alice", "a@x.io"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.leave().await.unwrap();

        let joined = joining.await.unwrap();
        assert!(joined.is_err());
        assert_eq!(handle.snapshot().state, LifecycleState::Closed);
        assert_eq!(relay.connection_count(), 0);
        assert!(backend.issued_tracks().iter().all(|t| t.is_stopped()));

        // A capture finishing after teardown must not bring tracks back
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(relay.connection_count(), 0);
        assert!(backend.issued_tracks().iter().all(|t| t.is_stopped()));

        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
