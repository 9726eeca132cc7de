//! Connections Registry — the daemon's authoritative tunnel definitions (§3, §4.1)
//!
//! Keyed by `(tracker, tunnel name)`, loaded from and persisted to the INI
//! configuration file. Every mutating operation notifies a
//! [`PeerEngineHandle`] so the Peer Engine can close and reopen the
//! affected connections without the Registry holding a direct reference to
//! it (§9: components talk through small handle traits, not long-lived
//! cross-references).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::parser::{BhidConfig, Ini};
use crate::error::{ConfigError, RegistryError};

/// Whether a tunnel section plays the server or client role (§4.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// `[<host>#<name>:server]` — listens for peers and forwards to a local service
#[derive(Debug, Clone)]
pub struct ServerTunnel {
    pub connect_address: String,
    pub connect_port: u16,
    pub fixed: bool,
    pub clients: Vec<String>,
}

/// `[<host>#<name>:client]` — listens locally and forwards to one named peer
#[derive(Debug, Clone)]
pub struct ClientTunnel {
    /// "", "*", a bare port number, or a `/...` path selecting a Unix socket
    pub listen_address: String,
    pub listen_port: String,
    pub fixed: bool,
    pub server: String,
}

#[derive(Debug, Clone)]
pub enum TunnelRole {
    Server(ServerTunnel),
    Client(ClientTunnel),
}

impl TunnelRole {
    pub fn role(&self) -> Role {
        match self {
            TunnelRole::Server(_) => Role::Server,
            TunnelRole::Client(_) => Role::Client,
        }
    }
}

/// One tunnel definition as held by the Registry (§3)
#[derive(Debug, Clone)]
pub struct TunnelDefinition {
    pub tracker: String,
    pub name: String,
    pub role: TunnelRole,
    pub encrypted: bool,
    /// live counter: number of currently established peer sessions
    pub connected: u32,
}

impl TunnelDefinition {
    pub fn key(&self) -> (String, String) {
        (self.tracker.clone(), self.name.clone())
    }

    /// Whether `peer_name` may use this tunnel, per the fixed/non-fixed
    /// policy in §3: server tunnels allow any peer unless `fixed` names an
    /// allow-list; client tunnels are effectively always fixed to the one
    /// configured `server` name.
    pub fn is_peer_allowed(&self, peer_name: &str) -> bool {
        match &self.role {
            TunnelRole::Server(s) => !s.fixed || s.clients.iter().any(|c| c == peer_name),
            TunnelRole::Client(c) => c.server == peer_name,
        }
    }
}

/// Notified whenever a tunnel definition is added, replaced, or removed, so
/// the Peer Engine can close stale sessions and open new ones (§4.1, §9).
pub trait PeerEngineHandle: Send + Sync {
    fn close(&self, tracker: &str, name: &str);
    fn open_server(&self, def: &TunnelDefinition, tunnel: &ServerTunnel);
    fn open_client(&self, def: &TunnelDefinition, tunnel: &ClientTunnel);
}

/// No-op handle used before the Peer Engine is wired in, and in tests.
pub struct NullPeerEngineHandle;

impl PeerEngineHandle for NullPeerEngineHandle {
    fn close(&self, _tracker: &str, _name: &str) {}
    fn open_server(&self, _def: &TunnelDefinition, _tunnel: &ServerTunnel) {}
    fn open_client(&self, _def: &TunnelDefinition, _tunnel: &ClientTunnel) {}
}

pub struct ConnectionsRegistry {
    path: PathBuf,
    entries: HashMap<(String, String), TunnelDefinition>,
    /// staged `import(tracker, token, list)` entries, not yet activated
    imports: HashMap<String, (String, HashMap<String, TunnelDefinition>)>,
    engine: Arc<dyn PeerEngineHandle>,
}

impl ConnectionsRegistry {
    pub fn new(path: PathBuf, engine: Arc<dyn PeerEngineHandle>) -> Self {
        Self {
            path,
            entries: HashMap::new(),
            imports: HashMap::new(),
            engine,
        }
    }

    fn notify_open(&self, def: &TunnelDefinition) {
        match &def.role {
            TunnelRole::Server(s) => self.engine.open_server(def, s),
            TunnelRole::Client(c) => self.engine.open_client(def, c),
        }
    }

    /// Reads the config file, rebuilds the in-memory map, and closes/opens
    /// Peer connections so they match (§4.1). On error the previous map is
    /// left intact.
    pub fn load(&mut self) -> Result<(), RegistryError> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RegistryError::Config(ConfigError::FileNotFound {
                    path: self.path.display().to_string(),
                })
            } else {
                RegistryError::Io(e)
            }
        })?;
        let ini = Ini::parse(&content)?;
        let config = BhidConfig::from_ini(&ini)?;

        let new_entries: HashMap<_, _> = config
            .tunnels
            .into_iter()
            .map(|def| (def.key(), def))
            .collect();

        for key in self.entries.keys() {
            if !new_entries.contains_key(key) {
                self.engine.close(&key.0, &key.1);
            }
        }
        for def in new_entries.values() {
            self.engine.close(&def.tracker, &def.name);
            self.notify_open(def);
        }

        self.entries = new_entries;
        Ok(())
    }

    /// Replaces every entry belonging to `tracker` with `list` (§4.1 `set`)
    pub fn set(&mut self, tracker: &str, list: Vec<TunnelDefinition>) -> Result<(), RegistryError> {
        let stale: Vec<_> = self
            .entries
            .keys()
            .filter(|(t, _)| t == tracker)
            .cloned()
            .collect();
        for key in &stale {
            self.engine.close(&key.0, &key.1);
            self.entries.remove(key);
        }
        for mut def in list {
            def.connected = 0;
            self.engine.close(&def.tracker, &def.name);
            self.notify_open(&def);
            self.entries.insert(def.key(), def);
        }
        self.save()
    }

    /// Upserts a single entry, restarting its Peer connection when `restart`
    /// is set or the entry is new (§4.1 `update`)
    pub fn update(&mut self, mut def: TunnelDefinition, restart: bool) -> Result<(), RegistryError> {
        let key = def.key();
        let is_new = !self.entries.contains_key(&key);
        if let Some(existing) = self.entries.get(&key) {
            if !restart {
                def.connected = existing.connected;
            }
        }
        if restart || is_new {
            self.engine.close(&key.0, &key.1);
            self.notify_open(&def);
        }
        self.entries.insert(key, def);
        self.save()
    }

    /// Removes an entry and closes its Peer connection (§4.1 `delete`)
    pub fn delete(&mut self, tracker: &str, name: &str) -> Result<(), RegistryError> {
        let key = (tracker.to_string(), name.to_string());
        if self.entries.remove(&key).is_some() {
            self.engine.close(tracker, name);
            self.save()?;
        }
        Ok(())
    }

    pub fn get(&self, tracker: &str, name: &str) -> Option<&TunnelDefinition> {
        self.entries.get(&(tracker.to_string(), name.to_string()))
    }

    pub fn get_all(&self) -> impl Iterator<Item = &TunnelDefinition> {
        self.entries.values()
    }

    /// Stages an imported list for one tracker without activating it (§4.1 `import`)
    pub fn import(&mut self, tracker: &str, token: &str, list: Vec<TunnelDefinition>) {
        let staged = list.into_iter().map(|d| (d.name.clone(), d)).collect();
        self.imports
            .insert(tracker.to_string(), (token.to_string(), staged));
    }

    pub fn get_import(&self, tracker: &str, name: &str) -> Option<&TunnelDefinition> {
        self.imports.get(tracker).and_then(|(_, m)| m.get(name))
    }

    /// Persists the in-memory map, merging with whatever non-tunnel
    /// sections (`[daemon]`, `[<host>:tracker]`) are present on disk (§4.1 `save`)
    pub fn save(&self) -> Result<(), RegistryError> {
        let existing = std::fs::read_to_string(&self.path).unwrap_or_default();
        let preserved = Ini::parse(&existing).unwrap_or_default();
        let ini = BhidConfig::merge_tunnels(&preserved, self.entries.values());
        std::fs::write(&self.path, ini.serialize()).map_err(|e| RegistryError::PersistFailed {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandle {
        closed: Mutex<Vec<(String, String)>>,
        opened: Mutex<Vec<(String, String)>>,
    }

    impl PeerEngineHandle for RecordingHandle {
        fn close(&self, tracker: &str, name: &str) {
            self.closed
                .lock()
                .unwrap()
                .push((tracker.to_string(), name.to_string()));
        }
        fn open_server(&self, def: &TunnelDefinition, _tunnel: &ServerTunnel) {
            self.opened.lock().unwrap().push(def.key());
        }
        fn open_client(&self, def: &TunnelDefinition, _tunnel: &ClientTunnel) {
            self.opened.lock().unwrap().push(def.key());
        }
    }

    fn server_def(tracker: &str, name: &str) -> TunnelDefinition {
        TunnelDefinition {
            tracker: tracker.to_string(),
            name: name.to_string(),
            role: TunnelRole::Server(ServerTunnel {
                connect_address: "127.0.0.1".to_string(),
                connect_port: 8080,
                fixed: false,
                clients: vec![],
            }),
            encrypted: true,
            connected: 0,
        }
    }

    #[test]
    fn update_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bhid.conf");
        std::fs::write(&path, "").unwrap();
        let engine = Arc::new(RecordingHandle::default());
        let mut registry = ConnectionsRegistry::new(path, engine.clone());

        registry.update(server_def("t1", "svc"), false).unwrap();
        let got = registry.get("t1", "svc").unwrap();
        assert_eq!(got.tracker, "t1");
        assert_eq!(engine.opened.lock().unwrap().len(), 1);
    }

    #[test]
    fn delete_closes_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bhid.conf");
        std::fs::write(&path, "").unwrap();
        let engine = Arc::new(RecordingHandle::default());
        let mut registry = ConnectionsRegistry::new(path, engine.clone());

        registry.update(server_def("t1", "svc"), false).unwrap();
        registry.delete("t1", "svc").unwrap();
        assert!(registry.get("t1", "svc").is_none());
        assert!(engine
            .closed
            .lock()
            .unwrap()
            .contains(&("t1".to_string(), "svc".to_string())));
    }

    #[test]
    fn is_peer_allowed_respects_fixed_allow_list() {
        let mut def = server_def("t1", "svc");
        assert!(def.is_peer_allowed("anyone"));
        if let TunnelRole::Server(s) = &mut def.role {
            s.fixed = true;
            s.clients = vec!["alice".to_string()];
        }
        assert!(def.is_peer_allowed("alice"));
        assert!(!def.is_peer_allowed("mallory"));
    }

    #[test]
    fn client_tunnel_only_allows_configured_server() {
        let def = TunnelDefinition {
            tracker: "t1".to_string(),
            name: "svc".to_string(),
            role: TunnelRole::Client(ClientTunnel {
                listen_address: "127.0.0.1".to_string(),
                listen_port: "9090".to_string(),
                fixed: true,
                server: "bob".to_string(),
            }),
            encrypted: false,
            connected: 0,
        };
        assert!(def.is_peer_allowed("bob"));
        assert!(!def.is_peer_allowed("anyone-else"));
    }

    #[test]
    fn load_reopens_connections_present_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bhid.conf");
        std::fs::write(
            &path,
            "[t1#svc:server]\nconnect_address = 127.0.0.1\nconnect_port = 80\nencrypted = yes\nfixed = no\n",
        )
        .unwrap();
        let engine = Arc::new(RecordingHandle::default());
        let mut registry = ConnectionsRegistry::new(path, engine.clone());
        registry.load().unwrap();

        assert!(registry.get("t1", "svc").is_some());
        assert_eq!(engine.opened.lock().unwrap().len(), 1);
    }
}
