//! Tracker Client (§4.2)
//!
//! One persistent, keep-alive TLS session per configured tracker. Drives
//! registration, STATUS announcements, NAT-punch coordination, and
//! identity lookups. The connect/retry and event-loop shape follow the
//! teacher's `WireGuardClient::connect_with_retry`/`event_loop`
//! (`client.rs`), generalized from a single UDP endpoint to a framed TLS
//! stream and from a fixed message set to the tracker protocol's dispatch.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant};
use tokio_rustls::{rustls, TlsConnector};
use uuid::Uuid;

use crate::error::TrackerError;
use crate::wire::framing::{read_frame, write_frame};
use crate::wire::tracker::{
    client_message, server_message, AliveMessage, ClientMessage, LookupIdentityRequest,
    MessageType, PunchRequest, RegisterDaemonRequest, ServerMessage, StatusMessage,
};

/// Connection lifecycle (§4.2): `disconnected -> connecting -> connected -> registered`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Disconnected,
    Connecting,
    Connected,
    Registered,
}

/// How long to wait after a connect failure or stream error before retrying (§4.2)
const RECONNECT_PAUSE: Duration = Duration::from_secs(3);
/// Liveness check cadence (§4.2, §5, §8 scenario 6)
const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_millis(500);
/// Send an unsolicited ALIVE once a session has gone this long without a write
const WRITE_IDLE_ALIVE: Duration = Duration::from_secs(7);
/// Declare the session dead once it has gone this long without a read
const READ_STARVED_DEAD: Duration = Duration::from_secs(10);
/// Timeout for a LOOKUP_IDENTITY_REQUEST round trip (§4.3.2)
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Requests the rest of the daemon sends to a running Tracker Client task
pub enum TrackerCommand {
    Status(StatusMessage),
    LookupIdentity {
        peer_fingerprint: String,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    Punch(PunchRequest),
    Shutdown,
}

/// Events the Tracker Client publishes for the Peer Engine to react to
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    Registered,
    ServerAvailable { tunnel: String, peer_fingerprint: String },
    PeerAvailable {
        tunnel: String,
        peer_fingerprint: String,
        internal_addresses: Vec<(String, u16)>,
        external_address: Option<(String, u16)>,
    },
    Disconnected,
}

pub struct TrackerClientConfig {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
    pub ca_pem: Option<Vec<u8>>,
}

/// Owns one tracker's TLS session and runs its event loop until told to shut down.
pub struct TrackerClient {
    config: TrackerClientConfig,
    tls_connector: TlsConnector,
    commands: mpsc::Receiver<TrackerCommand>,
    events: mpsc::Sender<TrackerEvent>,
    pending_lookups: std::collections::HashMap<String, oneshot::Sender<Option<Vec<u8>>>>,
}

impl TrackerClient {
    pub fn new(
        config: TrackerClientConfig,
        commands: mpsc::Receiver<TrackerCommand>,
        events: mpsc::Sender<TrackerEvent>,
    ) -> Result<Self, TrackerError> {
        let tls_connector = build_tls_connector(config.ca_pem.as_deref())?;
        Ok(Self {
            config,
            tls_connector,
            commands,
            events,
            pending_lookups: std::collections::HashMap::new(),
        })
    }

    /// Runs forever, reconnecting with a fixed pause on every failure, until
    /// a [`TrackerCommand::Shutdown`] is received.
    pub async fn run(&mut self) {
        loop {
            match self.run_one_session().await {
                Ok(ShutdownRequested) => return,
                Err(e) => {
                    tracing::warn!("tracker {} session ended: {e}", self.config.host);
                    let _ = self.events.send(TrackerEvent::Disconnected).await;
                    tokio::time::sleep(RECONNECT_PAUSE).await;
                }
            }
        }
    }

    async fn run_one_session(&mut self) -> Result<ShutdownRequested, TrackerError> {
        let mut stream = self.connect_with_retry().await;
        tracing::info!("tracker {}:{} connected", self.config.host, self.config.port);

        if let Some(token) = self.config.token.clone() {
            let request = ClientMessage {
                r#type: MessageType::RegisterDaemonRequest as i32,
                message_id: Uuid::new_v4().to_string(),
                payload: Some(client_message::Payload::RegisterDaemonRequest(
                    RegisterDaemonRequest { token },
                )),
            };
            write_frame(&mut stream, &request)
                .await
                .map_err(|e| TrackerError::Decode { reason: e.to_string() })?;
        }

        let mut last_read = Instant::now();
        let mut last_write = Instant::now();
        let mut liveness = interval(LIVENESS_CHECK_INTERVAL);

        loop {
            tokio::select! {
                frame = read_frame::<_, ServerMessage>(&mut stream) => {
                    let message = frame.map_err(|e| TrackerError::Decode { reason: e.to_string() })?;
                    last_read = Instant::now();
                    self.handle_server_message(message).await?;
                }
                _ = liveness.tick() => {
                    if last_read.elapsed() >= READ_STARVED_DEAD {
                        tracing::warn!("tracker {} session dead: no reads for {:?}", self.config.host, last_read.elapsed());
                        let _ = stream.shutdown().await;
                        return Err(TrackerError::Timeout);
                    }
                    if last_write.elapsed() >= WRITE_IDLE_ALIVE {
                        let alive = ClientMessage {
                            r#type: MessageType::Alive as i32,
                            message_id: Uuid::new_v4().to_string(),
                            payload: Some(client_message::Payload::Alive(AliveMessage {})),
                        };
                        write_frame(&mut stream, &alive).await.map_err(|e| TrackerError::Decode { reason: e.to_string() })?;
                        last_write = Instant::now();
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(TrackerCommand::Status(status)) => {
                            let msg = ClientMessage {
                                r#type: MessageType::Status as i32,
                                message_id: Uuid::new_v4().to_string(),
                                payload: Some(client_message::Payload::Status(status)),
                            };
                            write_frame(&mut stream, &msg).await.map_err(|e| TrackerError::Decode { reason: e.to_string() })?;
                            last_write = Instant::now();
                        }
                        Some(TrackerCommand::Punch(punch)) => {
                            let msg = ClientMessage {
                                r#type: MessageType::PunchRequest as i32,
                                message_id: Uuid::new_v4().to_string(),
                                payload: Some(client_message::Payload::PunchRequest(punch)),
                            };
                            write_frame(&mut stream, &msg).await.map_err(|e| TrackerError::Decode { reason: e.to_string() })?;
                            last_write = Instant::now();
                        }
                        Some(TrackerCommand::LookupIdentity { peer_fingerprint, reply }) => {
                            let correlation_id = Uuid::new_v4().to_string();
                            self.pending_lookups.insert(correlation_id.clone(), reply);
                            let msg = ClientMessage {
                                r#type: MessageType::LookupIdentityRequest as i32,
                                message_id: Uuid::new_v4().to_string(),
                                payload: Some(client_message::Payload::LookupIdentityRequest(
                                    LookupIdentityRequest { correlation_id, peer_fingerprint },
                                )),
                            };
                            write_frame(&mut stream, &msg).await.map_err(|e| TrackerError::Decode { reason: e.to_string() })?;
                            last_write = Instant::now();
                        }
                        Some(TrackerCommand::Shutdown) | None => {
                            let _ = stream.shutdown().await;
                            return Ok(ShutdownRequested);
                        }
                    }
                }
            }
        }
    }

    async fn handle_server_message(&mut self, message: ServerMessage) -> Result<(), TrackerError> {
        match message.payload {
            Some(server_message::Payload::RegisterDaemonResponse(r)) if r.accepted => {
                let _ = self.events.send(TrackerEvent::Registered).await;
            }
            Some(server_message::Payload::RegisterDaemonResponse(r)) => {
                return Err(TrackerError::Rejected { reason: r.reason });
            }
            Some(server_message::Payload::ServerAvailable(s)) => {
                let _ = self
                    .events
                    .send(TrackerEvent::ServerAvailable {
                        tunnel: s.tunnel,
                        peer_fingerprint: s.peer_fingerprint,
                    })
                    .await;
            }
            Some(server_message::Payload::PeerAvailable(p)) => {
                let internal = p
                    .internal_addresses
                    .into_iter()
                    .map(|a| (a.ip, a.port as u16))
                    .collect();
                let external = p.external_address.map(|a| (a.ip, a.port as u16));
                let _ = self
                    .events
                    .send(TrackerEvent::PeerAvailable {
                        tunnel: p.tunnel,
                        peer_fingerprint: p.peer_fingerprint,
                        internal_addresses: internal,
                        external_address: external,
                    })
                    .await;
            }
            Some(server_message::Payload::LookupIdentityResponse(r)) => {
                if let Some(reply) = self.pending_lookups.remove(&r.correlation_id) {
                    let key = if r.found { Some(r.public_key_pem) } else { None };
                    let _ = reply.send(key);
                }
            }
            Some(server_message::Payload::Alive(_)) => {}
            _ => tracing::debug!("unhandled tracker message type {:?}", message.r#type),
        }
        Ok(())
    }

    /// Exponential backoff reconnect (teacher's `connect_with_retry`, §4.2)
    async fn connect_with_retry(&self) -> tokio_rustls::client::TlsStream<TcpStream> {
        let mut backoff = ExponentialBackoff::default();
        loop {
            match self.try_connect().await {
                Ok(stream) => return stream,
                Err(e) => {
                    let pause = backoff.next_backoff().unwrap_or(RECONNECT_PAUSE);
                    tracing::warn!(
                        "tracker {}:{} connect failed: {e}, retrying in {:?}",
                        self.config.host,
                        self.config.port,
                        pause
                    );
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }

    async fn try_connect(&self) -> Result<tokio_rustls::client::TlsStream<TcpStream>, TrackerError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| TrackerError::ConnectFailed {
                host: self.config.host.clone(),
                port: self.config.port,
                reason: e.to_string(),
            })?;

        let server_name = rustls::pki_types::ServerName::try_from(self.config.host.clone())
            .map_err(|e| TrackerError::Tls { reason: e.to_string() })?;

        self.tls_connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| TrackerError::Tls { reason: e.to_string() })
    }
}

struct ShutdownRequested;

fn build_tls_connector(ca_pem: Option<&[u8]>) -> Result<TlsConnector, TrackerError> {
    let mut roots = rustls::RootCertStore::empty();

    if let Some(pem) = ca_pem {
        let certs: Vec<_> = rustls_pemfile::certs(&mut std::io::Cursor::new(pem))
            .collect::<Result<_, _>>()
            .map_err(|e| TrackerError::Tls { reason: e.to_string() })?;
        for cert in certs {
            roots
                .add(cert)
                .map_err(|e| TrackerError::Tls { reason: e.to_string() })?;
        }
    } else {
        roots.extend(webpki_roots_or_empty());
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// No platform trust store dependency is pulled in; without an explicit
/// `ca_file` a tracker connection relies on a CA it is separately given.
fn webpki_roots_or_empty() -> Vec<rustls::pki_types::CertificateDer<'static>> {
    Vec::new()
}
