//! Headless mesh call participant
//!
//! Joins a room over the WebSocket relay with synthetic capture devices and
//! logs everything that happens in the room. Lines typed on stdin are sent
//! as chat; a few slash commands drive the session.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin mesh-client -- \
//!   --room abc-1234-xyz \
//!   --name Alice --email alice@example.com \
//!   --signaling-url ws://localhost:4000/signaling
//!
//! # Relay through TURN
//! cargo run --bin mesh-client -- --room abc-1234-xyz \
//!   --turn-domain turn.example.com --turn-user videochat --turn-pass secret
//! ```
//!
//! Commands: `/mic`, `/video`, `/kick <peer-id>`, `/who`, `/leave`.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vido_mesh::config::{IceServerConfig, MeshConfig};
use vido_mesh::directory::{Credentials, HttpRoomDirectory};
use vido_mesh::media::SyntheticBackend;
use vido_mesh::peer::WebRtcLinkFactory;
use vido_mesh::signaling::WebSocketConnector;
use vido_mesh::{Identity, SessionController, SessionEvent, SessionHandle};

/// Mesh call client
///
/// Joins a room and keeps a WebRTC connection to every other participant.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Room code (abc-1234-xyz)
    #[arg(short, long, env = "MESH_ROOM")]
    room: String,

    /// Display name
    #[arg(long, default_value = "Guest", env = "MESH_NAME")]
    name: String,

    /// Email shown to other participants
    #[arg(long, default_value = "guest@localhost", env = "MESH_EMAIL")]
    email: String,

    /// Avatar URL
    #[arg(long, env = "MESH_IMAGE")]
    image: Option<String>,

    /// Signaling relay URL
    #[arg(long, env = "MESH_SIGNALING_URL")]
    signaling_url: Option<String>,

    /// TURN domain; adds STUN plus TURN over UDP, TCP and TLS
    #[arg(long, env = "MESH_TURN_DOMAIN")]
    turn_domain: Option<String>,

    /// TURN username
    #[arg(long, default_value = "videochat", env = "MESH_TURN_USER")]
    turn_user: String,

    /// TURN password
    #[arg(long, default_value = "", env = "MESH_TURN_PASS", hide_env_values = true)]
    turn_pass: String,

    /// Room service base URL; when set the room is looked up before joining
    #[arg(long, env = "MESH_API_URL")]
    api_url: Option<String>,

    /// Bearer token for the room service
    #[arg(long, env = "MESH_API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,

    /// Maximum remote peers
    #[arg(long, default_value_t = 10, env = "MESH_MAX_PEERS")]
    max_peers: usize,

    /// Emit logs as JSON
    #[arg(long, default_value_t = false, env = "MESH_LOG_JSON")]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn build_config(args: &Args) -> MeshConfig {
    let mut config = MeshConfig::from_env().with_max_peers(args.max_peers);

    if let Some(url) = &args.signaling_url {
        config = config.with_signaling_url(url);
    }
    if let Some(domain) = &args.turn_domain {
        config = config.with_ice_servers(IceServerConfig::for_turn_domain(
            domain,
            &args.turn_user,
            &args.turn_pass,
        ));
    }
    if let Some(api) = &args.api_url {
        config = config.with_api_base_url(api);
    }

    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!(
        version = vido_mesh::version(),
        room = %args.room,
        "Mesh client starting"
    );

    let config = build_config(&args);
    config.validate().context("invalid configuration")?;

    info!(
        signaling_url = %config.signaling_url,
        ice_servers = config.ice_servers.len(),
        max_peers = config.max_peers,
        "Configuration loaded"
    );

    let connector = Arc::new(WebSocketConnector::new(&config.signaling_url));
    let factory = Arc::new(
        WebRtcLinkFactory::new(&config.ice_servers).context("failed to build WebRTC stack")?,
    );
    let backend = Arc::new(SyntheticBackend::with_default_devices());

    let directory = match &config.api_base_url {
        Some(api) => {
            let credentials = match &args.api_token {
                Some(token) => Credentials::Bearer(token.clone()),
                None => Credentials::None,
            };
            Some(Arc::new(HttpRoomDirectory::new(api, credentials)?))
        }
        None => None,
    };

    let mut controller = SessionController::new(config, connector, factory, backend)?;
    if let Some(directory) = directory {
        controller = controller.with_directory(directory);
    }

    let events = controller
        .take_events()
        .context("session event stream already taken")?;
    let (session, task) = SessionHandle::spawn(controller);
    let printer = tokio::spawn(log_events(events));

    let mut identity = Identity::new(&args.name, &args.email);
    if let Some(image) = &args.image {
        identity = identity.with_image(image);
    }

    session
        .join(&args.room, identity)
        .await
        .with_context(|| format!("failed to join room {}", args.room))?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !execute_line(&session, line.trim()).await {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, leaving");
                break;
            }
        }
    }

    session.leave().await?;
    drop(session);

    if let Err(e) = task.await {
        error!("Session task panicked: {}", e);
    }
    printer.abort();

    info!("Mesh client stopped");
    Ok(())
}

/// Returns `false` once the user asked to leave
async fn execute_line(session: &SessionHandle, line: &str) -> bool {
    let result = match line.split_once(' ').unwrap_or((line, "")) {
        ("/leave", _) | ("/quit", _) => return false,
        ("/mic", _) => session
            .toggle_mic()
            .await
            .map(|on| info!("Microphone {}", if on { "on" } else { "muted" })),
        ("/video", _) => session
            .toggle_video()
            .await
            .map(|on| info!("Camera {}", if on { "on" } else { "off" })),
        ("/kick", target) if !target.trim().is_empty() => session.kick(target.trim()).await,
        ("/who", _) => {
            let snapshot = session.snapshot();
            for participant in snapshot.participants.iter() {
                info!(
                    peer_id = %participant.peer_id,
                    moderator = participant.is_moderator,
                    local = participant.is_local,
                    "{}",
                    participant.name
                );
            }
            Ok(())
        }
        (command, _) if command.starts_with('/') => {
            warn!("Unknown command: {}", command);
            Ok(())
        }
        _ => session.send_chat(line).await,
    };

    if let Err(e) = result {
        warn!(category = ?e.category(), "{}", e);
    }
    true
}

async fn log_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::StateChanged { from, to } => info!(%from, %to, "Session state"),
            SessionEvent::ParticipantJoined(p) => {
                info!(peer_id = %p.peer_id, "{} joined", p.name)
            }
            SessionEvent::ParticipantLeft {
                peer_id,
                name,
                reason,
            } => info!(
                %peer_id,
                %reason,
                "{} left",
                name.as_deref().unwrap_or("participant")
            ),
            SessionEvent::ModeratorChanged { peer_id, name } => {
                info!(%peer_id, "{} is now the moderator", name)
            }
            SessionEvent::BecameModerator => info!("You are the moderator"),
            SessionEvent::PeerConnected(peer_id) => info!(%peer_id, "Media connected"),
            SessionEvent::PeerRemoved { peer_id, reason } => {
                info!(%peer_id, ?reason, "Peer connection removed")
            }
            SessionEvent::LocalMediaChanged { audio, video } => {
                info!(audio, video, "Local media")
            }
            SessionEvent::DeviceChanged { kind, device_id } => {
                info!(?kind, %device_id, "Device switched")
            }
            SessionEvent::MediaError { kind, message } => warn!(%kind, "{}", message),
            SessionEvent::Chat(entry) => {
                if !entry.is_local {
                    info!(time = %entry.time.format("%H:%M"), "<{}> {}", entry.sender_name, entry.text)
                }
            }
            SessionEvent::Kicked { message, kicked_by } => {
                warn!(%kicked_by, "{}", message)
            }
            SessionEvent::InvalidRoomCode { code, redirect_in } => {
                error!(%code, "Invalid room code, returning home in {}s", redirect_in.as_secs())
            }
            SessionEvent::Reconnecting { attempt, delay } => {
                warn!(attempt, delay_ms = delay.as_millis() as u64, "Relay lost, reconnecting")
            }
        }
    }
}
