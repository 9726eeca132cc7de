//! Top-level wiring (§9 Design Notes)
//!
//! Assembles the Connections Registry, one Tracker Client per configured
//! tracker, the Peer Engine, and the Front Plane into one running daemon.
//! Every cross-component link is one of the small handle traits built
//! alongside each component (`registry::PeerEngineHandle`,
//! `peer::FrontHandle`) rather than a direct reference, so each piece still
//! owns exactly its own state and runs as its own cooperative task (§9).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use crate::config::parser::DEFAULT_MTU;
use crate::config::{BhidConfig, TrackerSettings};
use crate::control;
use crate::error::{BhidError, TrackerError};
use crate::front::FrontPlane;
use crate::identity::{Identity, PeerDirectory};
use crate::peer::{FrontHandle, PeerEngine, PeerEngineSender};
use crate::registry::{
    ClientTunnel, ConnectionsRegistry, PeerEngineHandle, ServerTunnel, TunnelDefinition,
};
use crate::tracker::{TrackerClient, TrackerClientConfig, TrackerCommand, TrackerEvent};

const TRACKER_COMMAND_QUEUE: usize = 32;
const TRACKER_EVENT_QUEUE: usize = 64;

/// Bridges the Connections Registry to both the Peer Engine and the Front
/// Plane: every registry mutation first mirrors the tunnel's definition into
/// [`FrontPlane`] (so a later `session_established` callback knows which
/// role to run) and then forwards to the engine exactly as
/// [`PeerEngineSender`] alone would (§9).
struct CoordinatorHandle {
    engine: PeerEngineSender,
    front: Arc<FrontPlane>,
}

impl PeerEngineHandle for CoordinatorHandle {
    fn close(&self, tracker: &str, name: &str) {
        self.front.forget_definition(tracker, name);
        self.engine.close(tracker, name);
    }

    fn open_server(&self, def: &TunnelDefinition, tunnel: &ServerTunnel) {
        self.front.register_definition(def.clone());
        self.engine.open_server(def, tunnel);
    }

    fn open_client(&self, def: &TunnelDefinition, tunnel: &ClientTunnel) {
        self.front.register_definition(def.clone());
        self.engine.open_client(def, tunnel);
    }
}

/// Directories and files derived from the daemon's config directory (§6
/// "On-disk identity").
pub struct Paths {
    pub registry_file: PathBuf,
    pub private_key: PathBuf,
    pub peers_dir: PathBuf,
    pub control_socket: PathBuf,
}

pub struct Coordinator {
    engine: PeerEngine,
    event_rx: Option<mpsc::UnboundedReceiver<TrackerEvent>>,
    registry: Arc<Mutex<ConnectionsRegistry>>,
    control_socket: PathBuf,
    tracker_commands: HashMap<String, mpsc::Sender<TrackerCommand>>,
    background: Vec<tokio::task::JoinHandle<()>>,
}

impl Coordinator {
    /// Builds every component and spawns each Tracker Client's own session
    /// loop, but does not yet run the Peer Engine or the control socket —
    /// that happens in [`Coordinator::run`].
    pub async fn bootstrap(config: &BhidConfig, paths: Paths) -> Result<Self, BhidError> {
        let identity = Arc::new(Identity::load_or_generate(&paths.private_key)?);
        let peers = Arc::new(PeerDirectory::new(paths.peers_dir));
        let front = Arc::new(FrontPlane::new());

        let mut tracker_commands = HashMap::new();
        let mut tracker_command_rx = HashMap::new();
        for tracker in &config.trackers {
            let (tx, rx) = mpsc::channel(TRACKER_COMMAND_QUEUE);
            tracker_commands.insert(tracker.host.clone(), tx);
            tracker_command_rx.insert(tracker.host.clone(), rx);
        }

        let bind_addr = format!("0.0.0.0:{}", config.daemon.port)
            .parse()
            .expect("formatted socket address is always valid");
        let mtu = config.daemon.mtu.unwrap_or(DEFAULT_MTU);
        let (engine, engine_sender, event_tx, event_rx) = PeerEngine::bind(
            bind_addr,
            mtu,
            identity.clone(),
            peers.clone(),
            front.clone() as Arc<dyn FrontHandle>,
            tracker_commands.clone(),
        )
        .await?;

        let handle: Arc<dyn PeerEngineHandle> = Arc::new(CoordinatorHandle {
            engine: engine_sender,
            front: front.clone(),
        });
        let mut registry = ConnectionsRegistry::new(paths.registry_file, handle);
        registry.load()?;
        let registry = Arc::new(Mutex::new(registry));

        let mut background = Vec::new();
        for tracker in &config.trackers {
            let commands_rx = tracker_command_rx
                .remove(&tracker.host)
                .expect("every configured tracker got a command channel above");
            let (tracker_event_tx, tracker_event_rx) = mpsc::channel(TRACKER_EVENT_QUEUE);
            let client_config = build_tracker_config(tracker)?;
            let mut client = TrackerClient::new(client_config, commands_rx, tracker_event_tx)?;
            background.push(tokio::spawn(async move {
                client.run().await;
            }));
            background.push(tokio::spawn(forward_events(tracker_event_rx, event_tx.clone())));
        }

        Ok(Self {
            engine,
            event_rx: Some(event_rx),
            registry,
            control_socket: paths.control_socket,
            tracker_commands,
            background,
        })
    }

    /// A clone of the registry handle, for the SIGHUP reload path in the
    /// daemon binary (§SPEC_FULL 3 "Config reload on SIGHUP").
    pub fn registry_handle(&self) -> Arc<Mutex<ConnectionsRegistry>> {
        self.registry.clone()
    }

    /// Runs the Peer Engine and the control socket until cancelled. Returns
    /// once `cancel` fires; call [`Coordinator::shutdown`] afterward to
    /// drain trackers and sessions.
    pub async fn run(&mut self, cancel: oneshot::Receiver<()>) {
        let (control_shutdown_tx, control_shutdown_rx) = oneshot::channel();
        let control_handle = tokio::spawn(control::serve(
            self.control_socket.clone(),
            self.registry.clone(),
            control_shutdown_rx,
        ));

        let event_rx = self
            .event_rx
            .take()
            .expect("Coordinator::run is only ever called once");

        tokio::select! {
            _ = self.engine.run(event_rx) => {}
            _ = cancel => {}
        }

        let _ = control_shutdown_tx.send(());
        if let Ok(Err(e)) = control_handle.await {
            tracing::warn!("control socket stopped with an error: {e}");
        }
    }

    /// Graceful shutdown (§4.2, SPEC_FULL §3): announce `active=false`
    /// STATUS for every server-role tunnel, tell each Tracker Client to
    /// close its session, and stop the background forwarder/session tasks.
    pub async fn shutdown(self) {
        let server_tunnels: Vec<TunnelDefinition> = self
            .registry
            .lock()
            .unwrap()
            .get_all()
            .filter(|def| matches!(def.role, crate::registry::TunnelRole::Server(_)))
            .cloned()
            .collect();

        for def in server_tunnels {
            let Some(sender) = self.tracker_commands.get(&def.tracker) else { continue };
            let _ = sender
                .send(TrackerCommand::Status(crate::wire::tracker::StatusMessage {
                    tracker: def.tracker.clone(),
                    tunnel: def.name.clone(),
                    connected: def.connected,
                    active: false,
                    addresses: Vec::new(),
                    utp_port: 0,
                }))
                .await;
        }

        for sender in self.tracker_commands.values() {
            let _ = sender.send(TrackerCommand::Shutdown).await;
        }
        for task in self.background {
            task.abort();
        }
    }
}

async fn forward_events(mut from: mpsc::Receiver<TrackerEvent>, to: mpsc::UnboundedSender<TrackerEvent>) {
    while let Some(event) = from.recv().await {
        if to.send(event).is_err() {
            break;
        }
    }
}

fn build_tracker_config(settings: &TrackerSettings) -> Result<TrackerClientConfig, BhidError> {
    let ca_pem = settings
        .ca_file
        .as_ref()
        .map(std::fs::read)
        .transpose()
        .map_err(|e| BhidError::Tracker(TrackerError::Tls { reason: e.to_string() }))?;
    Ok(TrackerClientConfig {
        host: settings.host.clone(),
        port: settings.port,
        token: settings.token.clone(),
        ca_pem,
    })
}

impl Paths {
    /// Derives the standard file layout under `<configdir>` (§6 "On-disk
    /// identity", "Local control socket").
    pub fn new(config_dir: &Path, registry_file: PathBuf, instance: Option<&str>, explicit_socket: Option<PathBuf>) -> Self {
        Self {
            registry_file,
            private_key: config_dir.join("id").join("private.rsa"),
            peers_dir: config_dir.join("peers"),
            control_socket: control::socket_path(instance, explicit_socket.as_deref()),
        }
    }
}
