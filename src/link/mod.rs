//! Link layer
//!
//! Ethernet II framing for frames received from a network interface.

pub mod ethernet;

pub use ethernet::{EtherType, EthernetFrame, MacAddr, ETHERNET_HEADER_LEN};
