//! INI configuration file parsing (§6 External Interfaces — Configuration)
//!
//! Generalizes the section-tracking, line-oriented `key = value` parser
//! used for WireGuard `.conf` files to the section shapes bhid uses:
//!
//! ```text
//! [daemon]
//! [<host>:tracker]
//! [<host>#<name>:server]
//! [<host>#<name>:client]
//! ```

use std::path::Path;

use crate::error::ConfigError;
use crate::registry::{ClientTunnel, Role, ServerTunnel, TunnelDefinition, TunnelRole};

/// UDP port the Peer Engine's endpoint binds by default (§4.3.1)
pub const DEFAULT_DAEMON_PORT: u16 = 42049;
/// TLS port the Tracker Client connects to by default (§3)
pub const DEFAULT_TRACKER_PORT: u16 = 42042;
/// Minimum accepted MTU: below this there is no room for the IP header (§4.3.1)
pub const MIN_MTU: u16 = 21;
/// MTU assumed when `[daemon] mtu` is not set (§4.3.1)
pub const DEFAULT_MTU: u16 = 1420;

/// `[daemon]` section
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub port: u16,
    pub mtu: Option<u16>,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_DAEMON_PORT,
            mtu: None,
        }
    }
}

/// `[<host>:tracker]` section
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub host: String,
    pub port: u16,
    pub ca_file: Option<String>,
    pub token: Option<String>,
    pub default: bool,
}

impl TrackerSettings {
    fn from_section(host: String, section: &IniSection) -> Result<Self, ConfigError> {
        let mut settings = TrackerSettings {
            host,
            port: DEFAULT_TRACKER_PORT,
            ca_file: None,
            token: None,
            default: false,
        };
        for (key, value) in &section.entries {
            match key.to_lowercase().as_str() {
                "port" => {
                    settings.port = value.parse().map_err(|_| ConfigError::InvalidPort {
                        value: value.clone(),
                    })?;
                }
                "ca_file" => settings.ca_file = Some(value.clone()),
                "token" => settings.token = Some(value.clone()),
                "default" => settings.default = parse_bool(value),
                other => tracing::debug!("Unknown tracker key: {}", other),
            }
        }
        Ok(settings)
    }

    fn to_section(&self) -> IniSection {
        let mut entries = vec![("port".to_string(), self.port.to_string())];
        if let Some(ca) = &self.ca_file {
            entries.push(("ca_file".to_string(), ca.clone()));
        }
        if let Some(token) = &self.token {
            entries.push(("token".to_string(), token.clone()));
        }
        if self.default {
            entries.push(("default".to_string(), "yes".to_string()));
        }
        IniSection {
            name: format!("{}:tracker", self.host),
            entries,
        }
    }
}

/// Fully parsed configuration file
#[derive(Debug, Clone, Default)]
pub struct BhidConfig {
    pub daemon: DaemonSettings,
    pub trackers: Vec<TrackerSettings>,
    pub tunnels: Vec<TunnelDefinition>,
}

impl BhidConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        let ini = Ini::parse(&content)?;
        Self::from_ini(&ini)
    }

    pub fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut config = BhidConfig::default();

        for section in &ini.sections {
            match classify(&section.name) {
                Some(SectionKind::Daemon) => {
                    config.daemon = DaemonSettings::from_section(section)?;
                }
                Some(SectionKind::Tracker { host }) => {
                    config.trackers.push(TrackerSettings::from_section(host, section)?);
                }
                Some(SectionKind::Tunnel { host, name, role }) => {
                    config
                        .tunnels
                        .push(TunnelDefinition::from_section(host, name, role, section)?);
                }
                None => {
                    tracing::debug!("Unrecognized config section: [{}]", section.name);
                }
            }
        }

        Ok(config)
    }

    /// Rebuilds an [`Ini`] document that keeps every non-tunnel section from
    /// `preserved` untouched and replaces all tunnel sections with `tunnels`
    /// (§4.1 `save()`, §8 round-trip property).
    pub fn merge_tunnels<'a>(
        preserved: &Ini,
        tunnels: impl Iterator<Item = &'a TunnelDefinition>,
    ) -> Ini {
        let mut sections: Vec<IniSection> = preserved
            .sections
            .iter()
            .filter(|s| !matches!(classify(&s.name), Some(SectionKind::Tunnel { .. })))
            .cloned()
            .collect();

        for def in tunnels {
            sections.push(def.to_section());
        }

        Ini { sections }
    }
}

impl DaemonSettings {
    fn from_section(section: &IniSection) -> Result<Self, ConfigError> {
        let mut settings = DaemonSettings::default();
        for (key, value) in &section.entries {
            match key.to_lowercase().as_str() {
                "port" => {
                    settings.port = value.parse().map_err(|_| ConfigError::InvalidPort {
                        value: value.clone(),
                    })?;
                }
                "mtu" => {
                    let mtu: u16 = value.parse().map_err(|_| ConfigError::ParseError {
                        line: 0,
                        message: format!("Invalid mtu: {value}"),
                    })?;
                    if mtu < MIN_MTU {
                        return Err(ConfigError::MtuTooSmall { value: mtu });
                    }
                    settings.mtu = Some(mtu);
                }
                other => tracing::debug!("Unknown daemon key: {}", other),
            }
        }
        Ok(settings)
    }
}

impl TunnelDefinition {
    pub(crate) fn from_section(
        tracker: String,
        name: String,
        role: Role,
        section: &IniSection,
    ) -> Result<Self, ConfigError> {
        let mut encrypted = false;
        let mut fixed = false;
        let mut connect_address = String::new();
        let mut connect_port = 0u16;
        let mut clients = Vec::new();
        let mut listen_address = String::new();
        let mut listen_port = String::new();
        let mut server = String::new();

        for (key, value) in &section.entries {
            match key.to_lowercase().as_str() {
                "encrypted" => encrypted = parse_bool(value),
                "fixed" => fixed = parse_bool(value),
                "connect_address" => connect_address = value.clone(),
                "connect_port" => {
                    connect_port = value.parse().map_err(|_| ConfigError::InvalidPort {
                        value: value.clone(),
                    })?
                }
                "clients" => clients = parse_list(value),
                "listen_address" => listen_address = value.clone(),
                "listen_port" => listen_port = value.clone(),
                "server" => server = value.clone(),
                other => tracing::debug!("Unknown tunnel key: {}", other),
            }
        }

        let role = match role {
            Role::Server => TunnelRole::Server(ServerTunnel {
                connect_address,
                connect_port,
                fixed,
                clients,
            }),
            Role::Client => {
                if server.is_empty() {
                    return Err(ConfigError::MissingField {
                        field: format!("server in [{tracker}#{name}:client]"),
                    });
                }
                TunnelRole::Client(ClientTunnel {
                    listen_address,
                    listen_port,
                    fixed,
                    server,
                })
            }
        };

        Ok(Self {
            tracker,
            name,
            role,
            encrypted,
            connected: 0,
        })
    }

    pub(crate) fn to_section(&self) -> IniSection {
        let mut entries = vec![("encrypted".to_string(), bool_str(self.encrypted))];
        let (suffix, kind_entries): (&str, Vec<(String, String)>) = match &self.role {
            TunnelRole::Server(s) => (
                "server",
                vec![
                    ("connect_address".to_string(), s.connect_address.clone()),
                    ("connect_port".to_string(), s.connect_port.to_string()),
                    ("fixed".to_string(), bool_str(s.fixed)),
                    ("clients".to_string(), s.clients.join(",")),
                ],
            ),
            TunnelRole::Client(c) => (
                "client",
                vec![
                    ("listen_address".to_string(), c.listen_address.clone()),
                    ("listen_port".to_string(), c.listen_port.clone()),
                    ("fixed".to_string(), bool_str(c.fixed)),
                    ("server".to_string(), c.server.clone()),
                ],
            ),
        };
        entries.extend(kind_entries);
        IniSection {
            name: format!("{}#{}:{}", self.tracker, self.name, suffix),
            entries,
        }
    }
}

/// Which kind of section a `[...]` header names
enum SectionKind {
    Daemon,
    Tracker { host: String },
    Tunnel { host: String, name: String, role: Role },
}

fn classify(name: &str) -> Option<SectionKind> {
    if name.eq_ignore_ascii_case("daemon") {
        return Some(SectionKind::Daemon);
    }
    if let Some(host) = name.strip_suffix(":tracker") {
        return Some(SectionKind::Tracker {
            host: host.to_string(),
        });
    }
    for (suffix, role) in [(":server", Role::Server), (":client", Role::Client)] {
        if let Some(rest) = name.strip_suffix(suffix) {
            if let Some((host, tname)) = rest.split_once('#') {
                return Some(SectionKind::Tunnel {
                    host: host.to_string(),
                    name: tname.to_string(),
                    role,
                });
            }
        }
    }
    None
}

fn parse_bool(v: &str) -> bool {
    matches!(v.trim().to_lowercase().as_str(), "yes" | "true" | "1")
}

fn bool_str(b: bool) -> String {
    if b {
        "yes".to_string()
    } else {
        "no".to_string()
    }
}

fn parse_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// One `[section]` with its ordered key/value pairs, as read from disk
#[derive(Debug, Clone, Default)]
pub struct IniSection {
    pub name: String,
    pub entries: Vec<(String, String)>,
}

/// A parsed INI document, preserving section order and unrecognized sections
#[derive(Debug, Clone, Default)]
pub struct Ini {
    pub sections: Vec<IniSection>,
}

impl Ini {
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut sections = Vec::new();
        let mut current: Option<IniSection> = None;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') {
                let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) else {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: format!("Malformed section header: {line}"),
                    });
                };
                if let Some(section) = current.take() {
                    sections.push(section);
                }
                current = Some(IniSection {
                    name: name.trim().to_string(),
                    entries: Vec::new(),
                });
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Expected 'key = value', got: {line}"),
                });
            };

            let section = current.as_mut().ok_or_else(|| ConfigError::ParseError {
                line: line_num,
                message: "Value outside of any section".to_string(),
            })?;

            section
                .entries
                .push((key.trim().to_string(), value.trim().to_string()));
        }

        if let Some(section) = current.take() {
            sections.push(section);
        }

        Ok(Self { sections })
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            out.push('[');
            out.push_str(&section.name);
            out.push_str("]\n");
            for (k, v) in &section.entries {
                out.push_str(k);
                out.push_str(" = ");
                out.push_str(v);
                out.push('\n');
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CONFIG: &str = r#"
[daemon]
port = 42049
mtu = 1400

[tracker.example:tracker]
port = 42042
token = abc123
default = yes

[tracker.example#svc:server]
connect_address = 127.0.0.1
connect_port = 8080
encrypted = yes
fixed = no

[tracker.example#svc2:client]
listen_address = 127.0.0.1
listen_port = 9090
encrypted = no
server = peer-b
"#;

    fn parse(content: &str) -> Result<BhidConfig, ConfigError> {
        let ini = Ini::parse(content)?;
        BhidConfig::from_ini(&ini)
    }

    #[test]
    fn parses_all_section_kinds() {
        let config = parse(TEST_CONFIG).unwrap();
        assert_eq!(config.daemon.port, 42049);
        assert_eq!(config.daemon.mtu, Some(1400));
        assert_eq!(config.trackers.len(), 1);
        assert_eq!(config.trackers[0].token.as_deref(), Some("abc123"));
        assert_eq!(config.tunnels.len(), 2);
    }

    #[test]
    fn round_trips_tunnel_sections() {
        let config = parse(TEST_CONFIG).unwrap();
        let ini = Ini::parse(TEST_CONFIG).unwrap();
        let merged = BhidConfig::merge_tunnels(&ini, config.tunnels.iter());
        let reparsed = BhidConfig::from_ini(&merged).unwrap();
        assert_eq!(reparsed.tunnels.len(), config.tunnels.len());
        assert_eq!(reparsed.daemon.port, config.daemon.port);
    }

    #[test]
    fn tracker_settings_round_trip() {
        let config = parse(TEST_CONFIG).unwrap();
        let section = config.trackers[0].to_section();
        let reparsed =
            TrackerSettings::from_section("tracker.example".to_string(), &section).unwrap();
        assert_eq!(reparsed.port, config.trackers[0].port);
        assert_eq!(reparsed.token, config.trackers[0].token);
    }

    #[test]
    fn rejects_mtu_below_minimum() {
        let bad = "[daemon]\nmtu = 10\n";
        assert!(parse(bad).is_err());
    }

    #[test]
    fn client_tunnel_requires_server_field() {
        let bad = "[t#s:client]\nlisten_port = *\n";
        assert!(parse(bad).is_err());
    }
}
