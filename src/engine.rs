//! Protocol engine interfaces
//!
//! ARP resolution, IPv4 routing, ICMP and the TCP/UDP state machines are
//! supplied from outside the stack. The dispatcher only knows them through
//! these traits. The IPv4 engine runs inside the receive loop, one frame at a
//! time; every other `input` entry point is called from a spawned task, so
//! engines must be shareable across threads and return `Send` futures.

use std::future::Future;
use std::net::Ipv4Addr;

use log::debug;

use crate::error::EngineError;
use crate::link::EtherType;
use crate::transport::ListenerLookup;

/// Receives payloads for ethertypes without a dedicated engine (IPv6, ...)
pub trait EthernetEngine: Send + Sync + 'static {
    fn input(&self, ethertype: EtherType, payload: &[u8]) -> impl Future<Output = ()> + Send;
}

/// Address resolution engine
pub trait ArpEngine: Send + Sync + 'static {
    fn input(&self, payload: &[u8]) -> impl Future<Output = ()> + Send;
}

/// Protocol-number callback handed to the IPv4 engine.
///
/// Called once per accepted packet with the decoded protocol number,
/// addresses and payload. The call picks the protocol branch and returns
/// without waiting for the transport engine to run.
pub trait ProtocolUpcall: Send + Sync {
    fn deliver(&self, proto: u8, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]);
}

/// IPv4 input engine
///
/// Parses the packet, applies whatever policy it implements, and hands the
/// payload to `upcall`. The receive loop awaits this before reading the next
/// frame. An error is logged by the dispatcher and the packet is dropped.
pub trait Ipv4Engine: Send + Sync + 'static {
    fn input<P: ProtocolUpcall>(
        &self,
        upcall: &P,
        packet: &[u8],
    ) -> impl Future<Output = Result<(), EngineError>> + Send;
}

pub trait IcmpEngine: Send + Sync + 'static {
    fn input(&self, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8])
        -> impl Future<Output = ()> + Send;
}

/// TCP engine
///
/// `Flow` is what listeners receive, typically an accepted connection.
/// The engine resolves the destination port through `listeners`.
pub trait TcpEngine: Send + Sync + 'static {
    type Flow: Send + 'static;

    fn input(
        &self,
        listeners: &ListenerLookup<Self::Flow>,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        payload: &[u8],
    ) -> impl Future<Output = ()> + Send;
}

/// UDP engine, see [`UdpDemux`](crate::transport::UdpDemux) for a minimal one
pub trait UdpEngine: Send + Sync + 'static {
    type Datagram: Send + 'static;

    fn input(
        &self,
        listeners: &ListenerLookup<Self::Datagram>,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        payload: &[u8],
    ) -> impl Future<Output = ()> + Send;
}

/// Discards every frame it is given.
#[derive(Debug, Default, Clone, Copy)]
pub struct DropUnhandled;

impl EthernetEngine for DropUnhandled {
    async fn input(&self, ethertype: EtherType, payload: &[u8]) {
        debug!(
            "No engine for {:?}, dropping {} byte payload",
            ethertype,
            payload.len()
        );
    }
}
