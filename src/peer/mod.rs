//! Peer Engine (§4.3)
//!
//! Hosts one UTP endpoint per daemon instance, opens/closes sessions as the
//! Connections Registry's tunnel definitions change, performs the RSA/X25519
//! handshake, runs NAT traversal for client-role (outbound) tunnels, and
//! hands established sessions to the Front Plane through a small channel
//! handle (§9) rather than a shared reference.

pub mod handshake;
pub mod multiplex;
pub mod nat;
pub mod reconnect;
pub mod session;
pub mod utp;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::PeerError;
use crate::identity::{Identity, PeerDirectory};
use crate::registry::{ClientTunnel, PeerEngineHandle, ServerTunnel, TunnelDefinition, TunnelRole};
use crate::tracker::{TrackerCommand, TrackerEvent};
use crate::wire::peer::{outer_message, OuterMessage, OuterType};
use crate::wire::tracker::StatusMessage;

use handshake::{build_connect_request, build_connect_response, verify_handshake};
use multiplex::{open_inner, seal_inner};
use nat::{AttemptKind, AttemptPlan};
use session::{PeerSession, SessionRole, SessionState};
use utp::{UtpConnection, UtpEndpoint};

/// Deadline for a dialed peer to answer CONNECT_REQUEST with CONNECT_RESPONSE (§4.3.2)
const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Inner message traffic handed to the Front Plane for one established session
pub struct TunnelChannels {
    pub outbound: mpsc::UnboundedSender<crate::wire::peer::InnerMessage>,
    pub inbound: mpsc::UnboundedReceiver<crate::wire::peer::InnerMessage>,
}

/// Notified when a session for a hosted tunnel becomes established or closes (§9)
pub trait FrontHandle: Send + Sync {
    fn session_established(&self, tracker: &str, name: &str, encrypted: bool, channels: TunnelChannels);
    fn session_closed(&self, tracker: &str, name: &str);
}

enum EngineCommand {
    Close { tracker: String, name: String },
    OpenServer { def: TunnelDefinition, tunnel: ServerTunnel },
    OpenClient { def: TunnelDefinition, tunnel: ClientTunnel },
}

/// A tracker-pushed peer address, routed from [`PeerEngine::handle_tracker_event`]
/// into the hosted client tunnel's dial loop (§4.3.2, §4.3.5).
struct PeerAvailableTrigger {
    peer_fingerprint: String,
    internal_addresses: Vec<(String, u16)>,
    external_address: Option<(String, u16)>,
}

/// Cloneable handle the Connections Registry holds; forwards to the
/// engine's own task rather than sharing engine state directly (§9).
#[derive(Clone)]
pub struct PeerEngineSender(mpsc::UnboundedSender<EngineCommand>);

impl PeerEngineHandle for PeerEngineSender {
    fn close(&self, tracker: &str, name: &str) {
        let _ = self.0.send(EngineCommand::Close {
            tracker: tracker.to_string(),
            name: name.to_string(),
        });
    }
    fn open_server(&self, def: &TunnelDefinition, tunnel: &ServerTunnel) {
        let _ = self.0.send(EngineCommand::OpenServer {
            def: def.clone(),
            tunnel: tunnel.clone(),
        });
    }
    fn open_client(&self, def: &TunnelDefinition, tunnel: &ClientTunnel) {
        let _ = self.0.send(EngineCommand::OpenClient {
            def: def.clone(),
            tunnel: tunnel.clone(),
        });
    }
}

struct HostedTunnel {
    def: TunnelDefinition,
    /// the `(tracker, name)` this session's dial/accept loop is driven by;
    /// cancelled and replaced whenever the Registry reconfigures this tunnel
    cancel: oneshot::Sender<()>,
    /// set for client-role tunnels: routes tracker `PEER_AVAILABLE` pushes
    /// into this tunnel's own dial loop (§4.3.2)
    dial: Option<mpsc::UnboundedSender<PeerAvailableTrigger>>,
}

pub struct PeerEngine {
    identity: Arc<Identity>,
    peers: Arc<PeerDirectory>,
    endpoint: Arc<UtpEndpoint>,
    incoming: mpsc::Receiver<UtpConnection>,
    front: Arc<dyn FrontHandle>,
    tracker_commands: Arc<HashMap<String, mpsc::Sender<TrackerCommand>>>,
    hosted: Arc<Mutex<HashMap<(String, String), HostedTunnel>>>,
    commands: mpsc::UnboundedReceiver<EngineCommand>,
}

impl PeerEngine {
    pub async fn bind(
        bind_addr: SocketAddr,
        mtu: u16,
        identity: Arc<Identity>,
        peers: Arc<PeerDirectory>,
        front: Arc<dyn FrontHandle>,
        tracker_commands: HashMap<String, mpsc::Sender<TrackerCommand>>,
    ) -> Result<(Self, PeerEngineSender, mpsc::UnboundedSender<TrackerEvent>, mpsc::UnboundedReceiver<TrackerEvent>), PeerError>
    {
        let (endpoint, incoming) = UtpEndpoint::bind(bind_addr, mtu).await?;
        let endpoint = Arc::new(endpoint);
        let (tx, rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let engine = Self {
            identity,
            peers,
            endpoint,
            incoming,
            front,
            tracker_commands: Arc::new(tracker_commands),
            hosted: Arc::new(Mutex::new(HashMap::new())),
            commands: rx,
        };
        Ok((engine, PeerEngineSender(tx), event_tx, event_rx))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Drains engine commands (Registry changes) and inbound UTP connections
    /// (server-role accepts) until the channel closes.
    pub async fn run(&mut self, mut tracker_events: mpsc::UnboundedReceiver<TrackerEvent>) {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(EngineCommand::Close { tracker, name }) => self.close_tunnel(&tracker, &name).await,
                        Some(EngineCommand::OpenServer { def, tunnel }) => self.open_tunnel(def, TunnelRole::Server(tunnel)).await,
                        Some(EngineCommand::OpenClient { def, tunnel }) => self.open_tunnel(def, TunnelRole::Client(tunnel)).await,
                        None => return,
                    }
                }
                incoming = self.incoming.recv() => {
                    let Some(connection) = incoming else { return };
                    self.spawn_inbound_accept(connection);
                }
                event = tracker_events.recv() => {
                    if let Some(event) = event {
                        self.handle_tracker_event(event).await;
                    }
                }
            }
        }
    }

    /// Routes a `PEER_AVAILABLE` push into the hosted client tunnel whose
    /// name matches, triggering that tunnel's dial loop (§4.3.2, §4.3.5).
    /// The event carries only a tunnel name, not a tracker host, so the
    /// first hosted client tunnel with that name claims it — matching the
    /// Connections Registry's own per-name keying in practice.
    async fn handle_tracker_event(&self, event: TrackerEvent) {
        if let TrackerEvent::PeerAvailable {
            tunnel,
            peer_fingerprint,
            internal_addresses,
            external_address,
        } = event
        {
            let hosted = self.hosted.lock().await;
            let dial = hosted
                .iter()
                .find(|(key, t)| key.1 == tunnel && t.dial.is_some())
                .and_then(|(_, t)| t.dial.clone());
            drop(hosted);

            let Some(dial) = dial else {
                tracing::debug!("peer {peer_fingerprint} available for unhosted client tunnel {tunnel}");
                return;
            };
            let _ = dial.send(PeerAvailableTrigger {
                peer_fingerprint,
                internal_addresses,
                external_address,
            });
        }
    }

    async fn close_tunnel(&self, tracker: &str, name: &str) {
        let mut hosted = self.hosted.lock().await;
        if let Some(tunnel) = hosted.remove(&(tracker.to_string(), name.to_string())) {
            let _ = tunnel.cancel.send(());
            self.front.session_closed(tracker, name);
        }
    }

    async fn open_tunnel(&self, def: TunnelDefinition, role: TunnelRole) {
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let key = def.key();

        let dial_tx = if let TunnelRole::Client(_) = &role {
            let (dial_tx, dial_rx) = mpsc::unbounded_channel();

            let identity = self.identity.clone();
            let peers = self.peers.clone();
            let endpoint = self.endpoint.clone();
            let front = self.front.clone();
            let tracker_commands = self.tracker_commands.clone();
            let def = def.clone();
            let TunnelRole::Client(client_tunnel) = role else { unreachable!() };
            tokio::spawn(async move {
                tokio::select! {
                    _ = &mut cancel_rx => {}
                    _ = drive_client_tunnel(def, client_tunnel, identity, peers, endpoint, front, tracker_commands, dial_rx) => {}
                }
            });

            Some(dial_tx)
        } else {
            None
        };

        let mut hosted = self.hosted.lock().await;
        hosted.insert(
            key,
            HostedTunnel {
                def,
                cancel: cancel_tx,
                dial: dial_tx,
            },
        );
        // Server-role tunnels accept passively via `spawn_inbound_accept`;
        // nothing to actively drive here beyond bookkeeping above.
    }

    fn spawn_inbound_accept(&self, connection: UtpConnection) {
        let identity = self.identity.clone();
        let peers = self.peers.clone();
        let hosted = self.hosted.clone();
        let front = self.front.clone();
        tokio::spawn(async move {
            if let Err(e) = accept_inbound(connection, identity, peers, hosted, front).await {
                tracing::warn!("inbound peer handshake failed: {e}");
            }
        });
    }
}

/// Drives a client-role (outbound) tunnel for as long as the engine hosts
/// it: announces STATUS so the tracker keeps its `PEER_AVAILABLE` reply
/// fresh, waits for that reply to arrive over `dial_rx`, then attempts the
/// NAT-traversal order from §4.3.2/§4.3.5 (internal addresses, then ten
/// punch probes followed by the external address) and hands an established
/// session to the Front Plane. Reconnects follow the resolved policy in
/// §4.3.6: retry the attempt kind that last succeeded before falling back
/// to a fresh discovery round.
async fn drive_client_tunnel(
    def: TunnelDefinition,
    tunnel: ClientTunnel,
    identity: Arc<Identity>,
    peers: Arc<PeerDirectory>,
    endpoint: Arc<UtpEndpoint>,
    front: Arc<dyn FrontHandle>,
    tracker_commands: Arc<HashMap<String, mpsc::Sender<TrackerCommand>>>,
    mut dial_rx: mpsc::UnboundedReceiver<PeerAvailableTrigger>,
) {
    let mut last_successful_kind: Option<AttemptKind> = None;
    let mut last_plan: Option<(String, AttemptPlan)> = None;

    loop {
        let (peer_fingerprint, plan) = match last_plan.take() {
            Some(cached) => cached,
            None => {
                announce_status(&def, &endpoint, &tracker_commands).await;
                match wait_for_peer(&mut dial_rx, &tunnel, nat::RESTART_DISCOVERY_PAUSE).await {
                    Some(found) => found,
                    None => continue,
                }
            }
        };

        let preferred = match reconnect::decide(last_successful_kind) {
            reconnect::ReconnectDecision::RetryAttemptKind(kind) => Some(kind),
            reconnect::ReconnectDecision::RestartDiscovery => None,
        };
        let ordered = plan.ordered_attempts_preferring(preferred);
        match try_attempts(&ordered, &plan, &endpoint, &identity, &peers, &peer_fingerprint, def.encrypted).await {
            Some((connection, mut session, kind)) => {
                last_successful_kind = Some(kind);
                last_plan = Some((peer_fingerprint, plan));
                session.tracker = def.tracker.clone();
                session.tunnel = def.name.clone();
                if let Err(e) = relay_established(connection, session, &def.tracker, &def.name, def.encrypted, front.clone()).await {
                    tracing::warn!("outbound session for {}#{} ended: {e}", def.tracker, def.name);
                }
            }
            None => {
                tracing::debug!("all dial attempts for {}#{} failed", def.tracker, def.name);
                last_successful_kind = None;
                last_plan = None;
                tokio::time::sleep(nat::RESTART_DISCOVERY_PAUSE).await;
            }
        }
    }
}

/// Waits up to `timeout` for a `PEER_AVAILABLE` push naming `tunnel.server`
/// as the peer, turning it into an [`AttemptPlan`] (§4.3.2).
async fn wait_for_peer(
    dial_rx: &mut mpsc::UnboundedReceiver<PeerAvailableTrigger>,
    tunnel: &ClientTunnel,
    timeout: Duration,
) -> Option<(String, AttemptPlan)> {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            trigger = dial_rx.recv() => {
                let trigger = trigger?;
                if trigger.peer_fingerprint != tunnel.server {
                    continue;
                }
                let internal_addresses = trigger
                    .internal_addresses
                    .iter()
                    .filter_map(|(ip, port)| format!("{ip}:{port}").parse().ok())
                    .collect();
                let external_address = trigger
                    .external_address
                    .and_then(|(ip, port)| format!("{ip}:{port}").parse().ok());
                return Some((trigger.peer_fingerprint, AttemptPlan { internal_addresses, external_address }));
            }
            _ = &mut deadline => return None,
        }
    }
}

async fn announce_status(
    def: &TunnelDefinition,
    endpoint: &UtpEndpoint,
    tracker_commands: &HashMap<String, mpsc::Sender<TrackerCommand>>,
) {
    let Some(sender) = tracker_commands.get(&def.tracker) else { return };
    let status = StatusMessage {
        tracker: def.tracker.clone(),
        tunnel: def.name.clone(),
        connected: def.connected,
        active: true,
        addresses: Vec::new(),
        utp_port: endpoint.local_addr().map(|a| u32::from(a.port())).unwrap_or(0),
    };
    let _ = sender.send(TrackerCommand::Status(status)).await;
}

/// Tries each `(addr, kind)` pair in order, punching the external address
/// ten times before dialing it (§4.3.2 (b)), and returns the first
/// successfully established session.
async fn try_attempts(
    ordered: &[(SocketAddr, AttemptKind)],
    plan: &AttemptPlan,
    endpoint: &UtpEndpoint,
    identity: &Identity,
    peers: &PeerDirectory,
    peer_fingerprint: &str,
    encrypted: bool,
) -> Option<(UtpConnection, PeerSession, AttemptKind)> {
    for (addr, kind) in ordered {
        if *kind == AttemptKind::External {
            if let Err(e) = plan.punch_external(endpoint).await {
                tracing::debug!("punch probes to {addr} failed: {e}");
            }
        }
        match connect_to_peer(endpoint, *addr, identity, peers, peer_fingerprint, encrypted).await {
            Ok((connection, session)) => return Some((connection, session, *kind)),
            Err(e) => tracing::debug!("connect attempt to {addr} ({kind:?}) failed: {e}"),
        }
    }
    None
}

/// Dials one address: opens a UTP connection, sends CONNECT_REQUEST, and
/// verifies the peer's signed CONNECT_RESPONSE (§4.3.2, §4.3.3).
async fn connect_to_peer(
    endpoint: &UtpEndpoint,
    addr: SocketAddr,
    identity: &Identity,
    peers: &PeerDirectory,
    peer_fingerprint: &str,
    encrypted: bool,
) -> Result<(UtpConnection, PeerSession), PeerError> {
    use prost::Message;

    let public_key = peers
        .load(peer_fingerprint)?
        .ok_or_else(|| PeerError::IdentityNotFound { peer: peer_fingerprint.to_string() })?;

    let mut connection = endpoint.connect(addr).await;
    let mut session = PeerSession::new(String::new(), String::new(), SessionRole::Outbound, addr);
    session.peer_fingerprint = Some(peer_fingerprint.to_string());
    session.peer_public_key = Some(public_key.clone());

    let request = build_connect_request(
        &identity.fingerprint,
        &identity.private_key,
        &session.local_ephemeral_public,
        encrypted,
    )?;
    let outer = OuterMessage {
        r#type: OuterType::ConnectRequest as i32,
        payload: Some(outer_message::Payload::ConnectRequest(request)),
    };
    let mut buf = Vec::with_capacity(outer.encoded_len());
    outer.encode(&mut buf).expect("Vec<u8> grows to fit any encoded length");
    connection.send(&buf).await?;

    let bytes = tokio::time::timeout(ESTABLISH_TIMEOUT, connection.recv())
        .await
        .map_err(|_| PeerError::EstablishTimeout)?
        .ok_or_else(|| PeerError::Decode { reason: "connection closed before CONNECT_RESPONSE".to_string() })?;
    let response_outer = OuterMessage::decode(bytes.as_slice()).map_err(|e| PeerError::Decode { reason: e.to_string() })?;
    let Some(outer_message::Payload::ConnectResponse(response)) = response_outer.payload else {
        return Err(PeerError::Decode {
            reason: "expected CONNECT_RESPONSE as the dial reply".to_string(),
        });
    };

    if !response.accepted {
        return Err(PeerError::PolicyRejected { peer: peer_fingerprint.to_string() });
    }
    verify_handshake(&public_key, &response.ephemeral_public_key, &response.signature)
        .map_err(|_| PeerError::SignatureInvalid { peer: peer_fingerprint.to_string() })?;

    let mut remote_ephemeral = [0u8; 32];
    if response.ephemeral_public_key.len() != 32 {
        return Err(PeerError::Decode {
            reason: "ephemeral public key must be 32 bytes".to_string(),
        });
    }
    remote_ephemeral.copy_from_slice(&response.ephemeral_public_key);
    session.remote_ephemeral_public = Some(remote_ephemeral);
    session.encrypted = response.encrypted;
    session.state = SessionState::Established;
    session.successful = true;

    Ok((connection, session))
}

async fn accept_inbound(
    mut connection: UtpConnection,
    identity: Arc<Identity>,
    peers: Arc<PeerDirectory>,
    hosted: Arc<Mutex<HashMap<(String, String), HostedTunnel>>>,
    front: Arc<dyn FrontHandle>,
) -> Result<(), PeerError> {
    use prost::Message;

    let bytes = connection
        .recv()
        .await
        .ok_or_else(|| PeerError::Decode { reason: "connection closed before handshake".to_string() })?;
    let outer = OuterMessage::decode(bytes.as_slice()).map_err(|e| PeerError::Decode { reason: e.to_string() })?;

    let Some(outer_message::Payload::ConnectRequest(request)) = outer.payload else {
        return Err(PeerError::Decode {
            reason: "expected CONNECT_REQUEST as the first inbound message".to_string(),
        });
    };

    let mut session = PeerSession::new(
        String::new(),
        String::new(),
        SessionRole::Inbound,
        connection.remote_addr(),
    );
    session.peer_fingerprint = Some(request.identity_fingerprint.clone());

    let public_key = peers
        .load(&request.identity_fingerprint)?
        .ok_or_else(|| PeerError::IdentityNotFound {
            peer: request.identity_fingerprint.clone(),
        })?;
    session.peer_public_key = Some(public_key.clone());

    verify_handshake(&public_key, &request.ephemeral_public_key, &request.signature).map_err(|_| {
        PeerError::SignatureInvalid {
            peer: request.identity_fingerprint.clone(),
        }
    })?;

    let mut remote_ephemeral = [0u8; 32];
    if request.ephemeral_public_key.len() != 32 {
        return Err(PeerError::Decode {
            reason: "ephemeral public key must be 32 bytes".to_string(),
        });
    }
    remote_ephemeral.copy_from_slice(&request.ephemeral_public_key);
    session.remote_ephemeral_public = Some(remote_ephemeral);
    session.encrypted = request.encrypted;
    session.state = SessionState::Verified;

    let response = build_connect_response(
        &identity.fingerprint,
        &identity.private_key,
        &session.local_ephemeral_public,
        request.encrypted,
        true,
    )?;
    let outer_response = OuterMessage {
        r#type: OuterType::ConnectResponse as i32,
        payload: Some(outer_message::Payload::ConnectResponse(response)),
    };
    let mut buf = Vec::with_capacity(outer_response.encoded_len());
    outer_response
        .encode(&mut buf)
        .expect("Vec<u8> grows to fit any encoded length");
    connection.send(&buf).await?;

    session.state = SessionState::Established;
    session.successful = true;

    // The tunnel this inbound session belongs to is resolved from the
    // hosted map by matching `is_peer_allowed`; the first hosted server
    // tunnel that allows this peer claims the session.
    let hosted_guard = hosted.lock().await;
    let matched = hosted_guard
        .iter()
        .find(|(_, t)| t.def.is_peer_allowed(&request.identity_fingerprint))
        .map(|(key, t)| (key.clone(), t.def.encrypted));
    drop(hosted_guard);

    let Some((key, encrypted)) = matched else {
        return Err(PeerError::PolicyRejected {
            peer: request.identity_fingerprint,
        });
    };
    session.tracker = key.0.clone();
    session.tunnel = key.1.clone();

    relay_established(connection, session, &key.0, &key.1, encrypted, front).await
}

/// Runs an established session's relay loop: seals/sends outbound inner
/// messages, decrypts/forwards inbound ones, until either side closes the
/// connection, then notifies the Front Plane (§4.3.4, §4.4).
async fn relay_established(
    mut connection: UtpConnection,
    mut session: PeerSession,
    tracker: &str,
    name: &str,
    encrypted: bool,
    front: Arc<dyn FrontHandle>,
) -> Result<(), PeerError> {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    front.session_established(tracker, name, encrypted, TunnelChannels {
        outbound: outbound_tx,
        inbound: inbound_rx,
    });

    let shared_key = if encrypted { session.shared_key() } else { None };

    let result = 'relay: loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                let Some(inner) = outbound else { break 'relay Ok(()) };
                let payload = match seal_inner(&inner, shared_key.as_ref()) {
                    Ok(payload) => payload,
                    Err(e) => break 'relay Err(e),
                };
                let outer = OuterMessage {
                    r#type: OuterType::Data as i32,
                    payload: Some(outer_message::Payload::Data(payload)),
                };
                let mut buf = Vec::with_capacity(outer.encoded_len());
                outer.encode(&mut buf).expect("Vec<u8> grows to fit any encoded length");
                if let Err(e) = connection.send(&buf).await {
                    break 'relay Err(e);
                }
            }
            incoming = connection.recv() => {
                let Some(bytes) = incoming else { break 'relay Ok(()) };
                let outer = match OuterMessage::decode(bytes.as_slice()) {
                    Ok(outer) => outer,
                    Err(e) => break 'relay Err(PeerError::Decode { reason: e.to_string() }),
                };
                if let Some(outer_message::Payload::Data(payload)) = outer.payload {
                    match open_inner(&payload, shared_key.as_ref()) {
                        Ok(inner) => { let _ = inbound_tx.send(inner); }
                        Err(e) => break 'relay Err(e),
                    }
                }
            }
        }
    };

    front.session_closed(tracker, name);
    result
}
