//! Packet-ingestion core of a small TCP/IP stack
//!
//! This library turns raw Ethernet frames into typed headers and routes the
//! decoded payloads to pluggable protocol engines:
//! - Ethernet II and IPv4 header parsing
//! - Protocol-number dispatch (ICMP, TCP, UDP, other)
//! - Port-keyed TCP and UDP listener registries
//! - A cancellable per-interface receive loop

pub mod config;
pub mod engine;
pub mod error;
pub mod iface;
pub mod link;
pub mod network;
pub mod transport;

// Re-export commonly used types
pub use config::StackConfig;
pub use engine::{
    ArpEngine, DropUnhandled, EthernetEngine, IcmpEngine, Ipv4Engine, ProtocolUpcall, TcpEngine,
    UdpEngine,
};
pub use error::{EngineError, ParseError, StackError};
pub use iface::{
    channel, ChannelInterface, Deliveries, Engines, FrameSender, Ipv4Demux, ListenHandle,
    NetworkInterface, ProtocolDemux, RawDatagram, ShutdownHandle, StackInstance, TapInterface,
};
pub use link::{EtherType, EthernetFrame, MacAddr};
pub use network::{protocol, Ipv4Header};
pub use transport::{handler, Handler, ListenerLookup, ListenerRegistry, UdpDatagram, UdpDemux};
