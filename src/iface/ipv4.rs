//! IPv4 protocol dispatch
//!
//! [`ProtocolDemux`] decides where the payload of an accepted IPv4 packet
//! goes, based on the protocol number:
//! - 1 (ICMP) to the ICMP engine
//! - 6 (TCP) to the TCP engine, with the TCP listener lookup
//! - 17 (UDP) to the UDP engine, with the UDP listener lookup
//! - anything else to the default handler, if one is set
//!
//! The decision is made synchronously, in packet order. The chosen engine
//! call is packaged as a detached task that the receive loop spawns.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, trace};

use crate::engine::{IcmpEngine, Ipv4Engine, ProtocolUpcall, TcpEngine, UdpEngine};
use crate::error::EngineError;
use crate::network::ipv4::{protocol, Ipv4Header};
use crate::transport::{BoxFuture, Handler, ListenerLookup};

/// Payload of a protocol the stack has no engine for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDatagram {
    pub proto: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub payload: Vec<u8>,
}

pub struct ProtocolDemux<C, T: TcpEngine, U: UdpEngine> {
    icmp: Arc<C>,
    tcp: Arc<T>,
    udp: Arc<U>,
    tcp_listeners: ListenerLookup<T::Flow>,
    udp_listeners: ListenerLookup<U::Datagram>,
    default: Option<Handler<RawDatagram>>,
}

impl<C, T, U> ProtocolDemux<C, T, U>
where
    C: IcmpEngine,
    T: TcpEngine,
    U: UdpEngine,
{
    pub fn new(
        icmp: Arc<C>,
        tcp: Arc<T>,
        udp: Arc<U>,
        tcp_listeners: ListenerLookup<T::Flow>,
        udp_listeners: ListenerLookup<U::Datagram>,
    ) -> Self {
        ProtocolDemux {
            icmp,
            tcp,
            udp,
            tcp_listeners,
            udp_listeners,
            default: None,
        }
    }

    pub fn with_default(mut self, default: Option<Handler<RawDatagram>>) -> Self {
        self.default = default;
        self
    }

    /// Pick the branch for `proto` and return the engine invocation.
    ///
    /// `None` means the packet was dropped: the protocol is unknown and no
    /// default handler is set.
    pub fn route(&self, proto: u8, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Option<BoxFuture> {
        let task: BoxFuture = match proto {
            protocol::ICMP => {
                let icmp = Arc::clone(&self.icmp);
                let payload = payload.to_vec();
                Box::pin(async move { icmp.input(src, dst, &payload).await })
            }
            protocol::TCP => {
                let tcp = Arc::clone(&self.tcp);
                let listeners = self.tcp_listeners.clone();
                let payload = payload.to_vec();
                Box::pin(async move { tcp.input(&listeners, src, dst, &payload).await })
            }
            protocol::UDP => {
                let udp = Arc::clone(&self.udp);
                let listeners = self.udp_listeners.clone();
                let payload = payload.to_vec();
                Box::pin(async move { udp.input(&listeners, src, dst, &payload).await })
            }
            _ => match &self.default {
                Some(default) => default(RawDatagram {
                    proto,
                    src,
                    dst,
                    payload: payload.to_vec(),
                }),
                None => {
                    debug!("Unsupported protocol {} from {}, dropping", proto, src);
                    return None;
                }
            },
        };
        Some(task)
    }
}

/// Upcall collecting the engine invocations for one received frame.
///
/// Branches are chosen while the IPv4 engine runs; the collected tasks are
/// taken afterwards with [`Deliveries::into_tasks`], in delivery order.
pub struct Deliveries<'a, C, T: TcpEngine, U: UdpEngine> {
    demux: &'a ProtocolDemux<C, T, U>,
    tasks: Mutex<Vec<BoxFuture>>,
}

impl<'a, C, T, U> Deliveries<'a, C, T, U>
where
    C: IcmpEngine,
    T: TcpEngine,
    U: UdpEngine,
{
    pub fn new(demux: &'a ProtocolDemux<C, T, U>) -> Self {
        Deliveries {
            demux,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn into_tasks(self) -> Vec<BoxFuture> {
        self.tasks.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C, T, U> ProtocolUpcall for Deliveries<'_, C, T, U>
where
    C: IcmpEngine,
    T: TcpEngine,
    U: UdpEngine,
{
    fn deliver(&self, proto: u8, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) {
        if let Some(task) = self.demux.route(proto, src, dst, payload) {
            self.tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(task);
        }
    }
}

/// Header-only IPv4 engine.
///
/// Parses the header and passes every packet up, without routing,
/// checksum verification or reassembly.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ipv4Demux;

impl Ipv4Engine for Ipv4Demux {
    async fn input<P: ProtocolUpcall>(&self, upcall: &P, packet: &[u8]) -> Result<(), EngineError> {
        let header = Ipv4Header::parse(packet)?;
        trace!(
            "IPv4 {} -> {} proto {} ({} byte payload)",
            header.src,
            header.dst,
            header.proto,
            header.payload_or_empty().len()
        );
        upcall.deliver(header.proto, header.src, header.dst, header.payload_or_empty());
        Ok(())
    }
}
