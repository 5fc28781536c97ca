//! A TAP interface listener example
//!
//! This example brings up a TAP device, starts a stack instance on it and
//! logs what arrives:
//! - ARP and ICMP payloads are logged by small logging engines
//! - UDP datagrams to port 7 are logged by a registered listener
//! - TCP segments are logged with their destination port
//!
//! To run this example:
//!
//! ```sh
//! sudo RUST_LOG=debug cargo run --example tap_listener
//! ```
//!
//! Then, from another shell: `echo hi | nc -u 10.0.0.1 7`.
//!
//! `LogArp` only logs ARP requests and never answers them, so the example
//! installs a static neighbour entry for 10.0.0.1 on the TAP device (the
//! equivalent of `ip neigh replace 10.0.0.1 lladdr 02:00:00:00:00:01 nud permanent dev tap0`).
//! Without it the host stays stuck resolving 10.0.0.1 and only ARP requests
//! show up in the log.
//! Root/sudo privileges are required to create and configure the TAP device.

use std::io;
use std::net::Ipv4Addr;

use log::info;
use toy_stack::{
    handler, ArpEngine, DropUnhandled, Engines, IcmpEngine, Ipv4Demux, ListenerLookup,
    StackConfig, StackInstance, TapInterface, TcpEngine, UdpDatagram, UdpDemux,
};

mod utils;
use utils::network::{add_static_neighbor, configure_interface};

const UDP_ECHO_PORT: i64 = 7;
const STACK_ADDR: &str = "10.0.0.1";
const STACK_MAC: &str = "02:00:00:00:00:01";

struct LogArp;

impl ArpEngine for LogArp {
    async fn input(&self, payload: &[u8]) {
        info!("ARP: {} bytes", payload.len());
    }
}

struct LogIcmp;

impl IcmpEngine for LogIcmp {
    async fn input(&self, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) {
        let kind = payload.first().copied().unwrap_or_default();
        info!("ICMP type {} {} -> {}", kind, src, dst);
    }
}

struct LogTcp;

impl TcpEngine for LogTcp {
    type Flow = ();

    async fn input(
        &self,
        listeners: &ListenerLookup<()>,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        payload: &[u8],
    ) {
        if payload.len() < 4 {
            return;
        }
        let port = u16::from_be_bytes([payload[2], payload[3]]);
        info!("TCP {} -> {}:{}", src, dst, port);
        listeners.deliver(port, ()).await;
    }
}

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let iface = TapInterface::open("tap0")?;
    configure_interface(iface.name(), "10.0.0.254/24")?;
    add_static_neighbor(iface.name(), STACK_ADDR, STACK_MAC)?;
    let config = StackConfig::new(iface.name());

    let engines = Engines {
        ethernet: DropUnhandled,
        arp: LogArp,
        ipv4: Ipv4Demux,
        icmp: LogIcmp,
        tcp: LogTcp,
        udp: UdpDemux,
    };
    let mut stack = StackInstance::new(config, iface, engines);

    stack
        .listen_udp(
            UDP_ECHO_PORT,
            handler(|datagram: UdpDatagram| async move {
                info!(
                    "UDP {}:{} -> port {}: {:?}",
                    datagram.src,
                    datagram.src_port,
                    datagram.dst_port,
                    String::from_utf8_lossy(&datagram.payload)
                );
            }),
        )
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let handle = stack
        .start_listening()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    let shutdown = stack.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.shutdown();
        }
    });

    handle
        .join()
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}
