//! Configuration file parsing for bhid
//!
//! Handles the daemon's INI-style configuration file: the `[daemon]`
//! settings block, one `[<host>:tracker]` section per configured tracker,
//! and the server/client tunnel sections the Connections Registry loads.

pub mod parser;

pub use parser::{BhidConfig, DaemonSettings, Ini, IniSection, TrackerSettings};
