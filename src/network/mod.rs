//! Network layer
//!
//! IPv4 header parsing. Routing, checksums and fragment reassembly belong to
//! the IPv4 engine plugged into the stack.

pub mod ipv4;

pub use ipv4::{protocol, Ipv4Header, IPV4_MIN_HEADER_LEN};
