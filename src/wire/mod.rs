//! Wire protocol types and framing (§6)
//!
//! `tracker`, `peer` and `control` are the `prost`-generated protobuf
//! message types compiled from `proto/tracker.proto`, `proto/peer.proto`
//! and `proto/control.proto`. `framing` carries the shared 4-byte
//! length-delimited envelope all three protocols use.

pub mod framing;

pub mod tracker {
    include!(concat!(env!("OUT_DIR"), "/bhid.tracker.rs"));
}

pub mod peer {
    include!(concat!(env!("OUT_DIR"), "/bhid.peer.rs"));
}

pub mod control {
    include!(concat!(env!("OUT_DIR"), "/bhid.control.rs"));
}
