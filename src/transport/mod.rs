//! Transport layer
//!
//! Port-keyed listener registries shared by the TCP and UDP engines, and a
//! minimal UDP engine that demultiplexes datagrams by destination port.

pub mod listener;
pub mod udp;

// Re-export commonly used items
pub use listener::{handler, BoxFuture, Handler, ListenerLookup, ListenerRegistry};
pub use udp::{UdpDatagram, UdpDemux, UdpHeader};
