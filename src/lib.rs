//! bhid — a peer-to-peer TCP tunneling daemon
//!
//! Three cooperating subsystems share a [`registry::ConnectionsRegistry`]
//! and a [`identity::Identity`]:
//!
//! - the [`tracker`] client, a persistent TLS session to a coordination
//!   server that carries registration, STATUS, and peer-discovery traffic;
//! - the [`peer`] engine, which performs the RSA/X25519 handshake, NAT
//!   traversal, and session multiplexing over an internal reliable-datagram
//!   substrate;
//! - the [`front`] plane, which terminates the local TCP (or Unix-domain)
//!   side of every tunnel.
//!
//! [`coordinator`] wires the three together; [`control`] exposes a small
//! read-only request/response interface over a local Unix socket.

pub mod config;
pub mod control;
pub mod coordinator;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod front;
pub mod peer;
pub mod registry;
pub mod tracker;
pub mod wire;

pub use coordinator::{Coordinator, Paths};
pub use error::{BhidError, Result};
