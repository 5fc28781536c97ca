//! Network interface and stack dispatch layer
//!
//! This module ties interfaces to protocol engines:
//! - Interface abstraction (channel and TAP backed)
//! - Protocol-number dispatch of decoded IPv4 payloads
//! - Per-interface stack instances and their receive loops

pub mod interface;
pub mod ipv4;
pub mod stack;

// Re-export commonly used items
pub use interface::{channel, ChannelInterface, FrameSender, NetworkInterface, TapInterface};
pub use ipv4::{Deliveries, Ipv4Demux, ProtocolDemux, RawDatagram};
pub use stack::{Engines, ListenHandle, ShutdownHandle, StackInstance};
