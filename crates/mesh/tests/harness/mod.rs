//! In-process mesh test harness
//!
//! Runs whole rooms inside one test: every participant is a real
//! [`SessionController`] talking to a shared [`MemoryRelay`] and a shared
//! [`LoopbackNetwork`], each with its own synthetic capture backend.
//!
//! Basic usage pattern:
//!
//! 1. Create a `MeshHarness`
//! 2. Add participants with `harness.add("Alice")`
//! 3. Join them one by one with `harness.join(i)` (join order decides roles)
//! 4. Call `harness.settle()` after every action to let messages flow
//! 5. Assert on sessions, the relay and the network

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;
use vido_mesh::config::MeshConfig;
use vido_mesh::media::SyntheticBackend;
use vido_mesh::peer::{ConnectionState, LoopbackNetwork};
use vido_mesh::signaling::{MemoryRelay, ReconnectionPolicy};
use vido_mesh::{Identity, SessionController, SessionEvent};

/// Room every harness participant joins
pub const ROOM: &str = "abc-1234-xyz";

/// Upper bound for one `settle` call
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive idle rounds before the mesh counts as settled
const QUIET_ROUNDS: usize = 5;

/// Initialize test logging (call once per test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,vido_mesh=debug")
        .with_test_writer()
        .try_init();
}

/// One simulated participant
pub struct Participant {
    pub name: String,
    pub session: SessionController,
    pub backend: Arc<SyntheticBackend>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Shared relay and network plus the participants using them
pub struct MeshHarness {
    pub relay: MemoryRelay,
    pub net: LoopbackNetwork,
    participants: Vec<Participant>,
}

impl MeshHarness {
    pub fn new() -> Self {
        init_logging();
        Self {
            relay: MemoryRelay::new(),
            net: LoopbackNetwork::new(),
            participants: Vec::new(),
        }
    }

    /// Configuration used by every participant
    pub fn config() -> MeshConfig {
        MeshConfig::default().with_reconnect(ReconnectionPolicy::immediate(3))
    }

    /// Add a participant with the default synthetic devices
    pub fn add(&mut self, name: &str) -> usize {
        self.add_with_backend(name, SyntheticBackend::with_default_devices())
    }

    /// Add a participant with a prepared backend
    pub fn add_with_backend(&mut self, name: &str, backend: SyntheticBackend) -> usize {
        let backend = Arc::new(backend);
        let mut session = SessionController::new(
            Self::config(),
            Arc::new(self.relay.clone()),
            Arc::new(self.net.clone()),
            backend.clone(),
        )
        .expect("default config is valid");
        let events = session.take_events().expect("fresh session has events");

        self.participants.push(Participant {
            name: name.to_string(),
            session,
            backend,
            events,
        });
        self.participants.len() - 1
    }

    /// Join `ROOM` and let the room react
    pub async fn join(&mut self, index: usize) {
        let participant = &mut self.participants[index];
        let identity = Identity::new(
            participant.name.clone(),
            format!("{}@example.com", participant.name.to_lowercase()),
        );
        participant
            .session
            .join(ROOM, identity)
            .await
            .unwrap_or_else(|e| panic!("{} failed to join: {}", participant.name, e));
        self.settle().await;
    }

    /// Add and join several participants in order
    pub async fn room_of(names: &[&str]) -> Self {
        let mut harness = Self::new();
        for name in names {
            let index = harness.add(name);
            harness.join(index).await;
        }
        harness
    }

    /// Pump every session until no input is left anywhere
    pub async fn settle(&mut self) {
        let deadline = Instant::now() + SETTLE_TIMEOUT;
        let mut quiet = 0;
        let mut rounds = 0;

        while quiet < QUIET_ROUNDS {
            assert!(Instant::now() < deadline, "mesh did not settle in time");

            let mut handled = 0;
            for participant in &mut self.participants {
                handled += participant.session.process_pending().await;
            }
            tokio::task::yield_now().await;

            quiet = if handled == 0 { quiet + 1 } else { 0 };
            rounds += 1;
        }

        debug!("Mesh settled after {} round(s)", rounds);
    }

    pub fn session(&self, index: usize) -> &SessionController {
        &self.participants[index].session
    }

    pub fn session_mut(&mut self, index: usize) -> &mut SessionController {
        &mut self.participants[index].session
    }

    pub fn backend(&self, index: usize) -> &SyntheticBackend {
        &self.participants[index].backend
    }

    /// Relay id of a joined participant
    pub fn id(&self, index: usize) -> String {
        self.session(index)
            .local_id()
            .map(str::to_string)
            .unwrap_or_else(|| panic!("{} is not connected", self.participants[index].name))
    }

    /// Everything the participant emitted since the last call
    pub fn drain_events(&mut self, index: usize) -> Vec<SessionEvent> {
        let events = &mut self.participants[index].events;
        std::iter::from_fn(|| events.try_recv().ok()).collect()
    }

    /// Connection state `from` holds towards `to`
    pub fn link_state(&self, from: usize, to: usize) -> Option<ConnectionState> {
        let peer = self.id(to);
        self.session(from).peers().and_then(|p| p.state(&peer))
    }

    /// Whether every pair of joined participants is connected both ways
    pub fn fully_meshed(&self) -> bool {
        let n = self.participants.len();
        (0..n).all(|a| {
            (0..n)
                .filter(|b| *b != a)
                .all(|b| self.link_state(a, b) == Some(ConnectionState::Connected))
        })
    }
}

impl Default for MeshHarness {
    fn default() -> Self {
        Self::new()
    }
}
