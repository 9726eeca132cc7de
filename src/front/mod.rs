//! Front Plane (§4.4)
//!
//! Terminates the local TCP (or Unix-domain) side of every tunnel. Each
//! hosted tunnel gets its own task — a passive dial-on-OPEN loop for
//! server-role tunnels (`server_side`), an accept loop for client-role
//! tunnels (`client_side`) — driven by the [`crate::peer::TunnelChannels`]
//! the Peer Engine hands over once a session is established.

pub mod client_side;
pub mod server_side;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::error::FrontError;
use crate::peer::{FrontHandle, TunnelChannels};
use crate::registry::TunnelDefinition;

struct ActiveTunnel {
    cancel: oneshot::Sender<()>,
}

/// Implements [`FrontHandle`]; the Peer Engine calls this whenever a hosted
/// tunnel's session comes up or goes down (§9). Both maps use a plain
/// `std::sync::Mutex` (not `tokio::sync::Mutex`) so the synchronous
/// `FrontHandle` methods can register/cancel without spawning a task first.
pub struct FrontPlane {
    tunnels: Arc<Mutex<HashMap<(String, String), TunnelDefinition>>>,
    active: Arc<Mutex<HashMap<(String, String), ActiveTunnel>>>,
}

impl FrontPlane {
    pub fn new() -> Self {
        Self {
            tunnels: Arc::new(Mutex::new(HashMap::new())),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registers a tunnel's definition so a later `session_established`
    /// callback knows which role (server/client) to run. The Connections
    /// Registry's `open_server`/`open_client` calls reach here indirectly
    /// through the coordinator, which mirrors each definition into this map
    /// alongside notifying the Peer Engine.
    pub fn register_definition(&self, def: TunnelDefinition) {
        self.tunnels.lock().unwrap().insert(def.key(), def);
    }

    pub fn forget_definition(&self, tracker: &str, name: &str) {
        self.tunnels
            .lock()
            .unwrap()
            .remove(&(tracker.to_string(), name.to_string()));
    }
}

impl Default for FrontPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl FrontHandle for FrontPlane {
    fn session_established(&self, tracker: &str, name: &str, encrypted: bool, channels: TunnelChannels) {
        let _ = encrypted; // encryption is transparent to the Front Plane: bytes in, bytes out
        let key = (tracker.to_string(), name.to_string());

        let def = self.tunnels.lock().unwrap().get(&key).cloned();
        let Some(def) = def else {
            tracing::warn!("session established for unregistered tunnel {}#{}", key.0, key.1);
            return;
        };

        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.active
            .lock()
            .unwrap()
            .insert(key.clone(), ActiveTunnel { cancel: cancel_tx });

        tokio::spawn(async move {
            let result = match &def.role {
                crate::registry::TunnelRole::Server(server) => {
                    server_side::run(server.clone(), channels, cancel_rx).await
                }
                crate::registry::TunnelRole::Client(client) => {
                    client_side::run(client.clone(), channels, cancel_rx).await
                }
            };
            if let Err(e) = result {
                tracing::warn!("front plane for {}#{} ended: {e}", key.0, key.1);
            }
        });
    }

    fn session_closed(&self, tracker: &str, name: &str) {
        let key = (tracker.to_string(), name.to_string());
        if let Some(tunnel) = self.active.lock().unwrap().remove(&key) {
            let _ = tunnel.cancel.send(());
        }
    }
}

/// Classifies a client-role tunnel's configured listen address (§4.4):
/// empty/`*` selects an OS-assigned TCP port, a leading `/` selects a Unix
/// socket path, anything else parses as a TCP port number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenTarget {
    Tcp { address: String, port: u16 },
    TcpAnyPort { address: String },
    Unix { path: String },
}

pub fn classify_listen_target(listen_address: &str, listen_port: &str) -> Result<ListenTarget, FrontError> {
    if listen_port.starts_with('/') {
        return Ok(ListenTarget::Unix {
            path: listen_port.to_string(),
        });
    }
    if listen_port.is_empty() || listen_port == "*" {
        return Ok(ListenTarget::TcpAnyPort {
            address: listen_address.to_string(),
        });
    }
    let port: u16 = listen_port.parse().map_err(|_| FrontError::BindFailed {
        addr: format!("{listen_address}:{listen_port}"),
        reason: "listen_port is neither empty, \"*\", a Unix path, nor a valid port number".to_string(),
    })?;
    Ok(ListenTarget::Tcp {
        address: listen_address.to_string(),
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_port_selects_os_assigned_tcp() {
        assert_eq!(
            classify_listen_target("127.0.0.1", "").unwrap(),
            ListenTarget::TcpAnyPort {
                address: "127.0.0.1".to_string()
            }
        );
        assert_eq!(
            classify_listen_target("127.0.0.1", "*").unwrap(),
            ListenTarget::TcpAnyPort {
                address: "127.0.0.1".to_string()
            }
        );
    }

    #[test]
    fn leading_slash_selects_unix_socket() {
        assert_eq!(
            classify_listen_target("", "/tmp/bhid.sock").unwrap(),
            ListenTarget::Unix {
                path: "/tmp/bhid.sock".to_string()
            }
        );
    }

    #[test]
    fn numeric_string_selects_tcp_port() {
        assert_eq!(
            classify_listen_target("0.0.0.0", "9090").unwrap(),
            ListenTarget::Tcp {
                address: "0.0.0.0".to_string(),
                port: 9090
            }
        );
    }

    #[test]
    fn garbage_port_is_rejected() {
        assert!(classify_listen_target("0.0.0.0", "not-a-port").is_err());
    }
}
