//! End-to-end dispatch tests: frames pushed through a channel interface and
//! observed at fake engines and registered listeners.

use std::io;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;

use toy_stack::{
    channel, handler, protocol, ArpEngine, ChannelInterface, EngineError, Engines, EtherType,
    EthernetEngine, FrameSender, IcmpEngine, Ipv4Demux, Ipv4Engine, Ipv4Header, ListenerLookup,
    ProtocolUpcall, RawDatagram, StackConfig, StackError, StackInstance, TcpEngine, UdpDatagram,
    UdpDemux, UdpEngine,
};

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Event {
    Arp(Vec<u8>),
    Unhandled(u16, Vec<u8>),
    Icmp(Vec<u8>),
    Tcp(Vec<u8>),
    Default(u8, Vec<u8>),
}

/// Fake engine recording every input it sees
#[derive(Clone)]
struct Recorder(mpsc::UnboundedSender<Event>);

impl EthernetEngine for Recorder {
    async fn input(&self, ethertype: EtherType, payload: &[u8]) {
        let _ = self.0.send(Event::Unhandled(ethertype.into(), payload.to_vec()));
    }
}

impl ArpEngine for Recorder {
    async fn input(&self, payload: &[u8]) {
        let _ = self.0.send(Event::Arp(payload.to_vec()));
    }
}

impl IcmpEngine for Recorder {
    async fn input(&self, _src: Ipv4Addr, _dst: Ipv4Addr, payload: &[u8]) {
        let _ = self.0.send(Event::Icmp(payload.to_vec()));
    }
}

impl TcpEngine for Recorder {
    type Flow = Vec<u8>;

    async fn input(
        &self,
        listeners: &ListenerLookup<Vec<u8>>,
        _src: Ipv4Addr,
        _dst: Ipv4Addr,
        payload: &[u8],
    ) {
        let _ = self.0.send(Event::Tcp(payload.to_vec()));
        if payload.len() >= 4 {
            let port = u16::from_be_bytes([payload[2], payload[3]]);
            listeners.deliver(port, payload.to_vec()).await;
        }
    }
}

/// UDP engine handing the whole IPv4 payload to a single port
struct FixedPortUdp(u16);

impl UdpEngine for FixedPortUdp {
    type Datagram = Vec<u8>;

    async fn input(
        &self,
        listeners: &ListenerLookup<Vec<u8>>,
        _src: Ipv4Addr,
        _dst: Ipv4Addr,
        payload: &[u8],
    ) {
        listeners.deliver(self.0, payload.to_vec()).await;
    }
}

/// IPv4 engine noting the sequence number at the start of each payload as
/// its protocol branch is chosen
struct Sequenced(Arc<Mutex<Vec<u32>>>);

struct SequenceTap<'a, P> {
    inner: &'a P,
    seen: &'a Mutex<Vec<u32>>,
}

impl<P: ProtocolUpcall> ProtocolUpcall for SequenceTap<'_, P> {
    fn deliver(&self, proto: u8, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) {
        let seq = u32::from_be_bytes(payload[..4].try_into().unwrap());
        self.seen.lock().unwrap().push(seq);
        self.inner.deliver(proto, src, dst, payload);
    }
}

impl Ipv4Engine for Sequenced {
    async fn input<P: ProtocolUpcall>(&self, upcall: &P, packet: &[u8]) -> Result<(), EngineError> {
        tokio::task::yield_now().await;
        let tap = SequenceTap {
            inner: upcall,
            seen: &self.0,
        };
        Ipv4Demux.input(&tap, packet).await
    }
}

type Stack<I, U> = StackInstance<ChannelInterface, Recorder, Recorder, I, Recorder, Recorder, U>;

fn stack<U: UdpEngine>(
    config: StackConfig,
    udp: U,
) -> (Stack<Ipv4Demux, U>, FrameSender, mpsc::UnboundedReceiver<Event>) {
    stack_with(config, Ipv4Demux, udp)
}

fn stack_with<I: Ipv4Engine, U: UdpEngine>(
    config: StackConfig,
    ipv4: I,
    udp: U,
) -> (Stack<I, U>, FrameSender, mpsc::UnboundedReceiver<Event>) {
    let (tx, events) = mpsc::unbounded_channel();
    let recorder = Recorder(tx);
    let (frames, iface) = channel(64);
    let engines = Engines {
        ethernet: recorder.clone(),
        arp: recorder.clone(),
        ipv4,
        icmp: recorder.clone(),
        tcp: recorder,
        udp,
    };
    (StackInstance::new(config, iface, engines), frames, events)
}

fn eth(ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
    frame.extend_from_slice(&[0x02, 0x00, 0x00, 0x00, 0x00, 0x02]);
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn ipv4(proto: u8, payload: &[u8]) -> Vec<u8> {
    let total = (20 + payload.len()) as u16;
    let mut packet = vec![0x45, 0x00];
    packet.extend_from_slice(&total.to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x01, 0x40, 0x00, 0x40, proto, 0x00, 0x00]);
    packet.extend_from_slice(&[10, 0, 0, 2, 10, 0, 0, 1]);
    packet.extend_from_slice(payload);
    packet
}

fn udp(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut segment = Vec::new();
    segment.extend_from_slice(&src_port.to_be_bytes());
    segment.extend_from_slice(&dst_port.to_be_bytes());
    segment.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    segment.extend_from_slice(&[0, 0]);
    segment.extend_from_slice(payload);
    segment
}

fn udp_frame(dst_port: u16, payload: &[u8]) -> Vec<u8> {
    eth(0x0800, &ipv4(protocol::UDP, &udp(40000, dst_port, payload)))
}

fn collecting<T: Send + 'static>() -> (toy_stack::Handler<T>, mpsc::UnboundedReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let h = handler(move |value: T| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(value);
        }
    });
    (h, rx)
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for dispatch")
        .expect("channel closed")
}

async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    if let Ok(Some(value)) = timeout(QUIET, rx.recv()).await {
        panic!("unexpected dispatch: {:?}", value);
    }
}

#[tokio::test]
async fn test_udp_datagram_reaches_listener() {
    let (mut stack, frames, _events) = stack(StackConfig::default(), UdpDemux);
    let (dns, mut datagrams) = collecting::<UdpDatagram>();
    stack.listen_udp(53, dns).unwrap();

    let handle = stack.start_listening().unwrap();
    frames.send(udp_frame(53, b"query")).await.unwrap();

    let datagram = next(&mut datagrams).await;
    assert_eq!(datagram.src, Ipv4Addr::new(10, 0, 0, 2));
    assert_eq!(datagram.dst, Ipv4Addr::new(10, 0, 0, 1));
    assert_eq!(datagram.src_port, 40000);
    assert_eq!(datagram.dst_port, 53);
    assert_eq!(datagram.payload, b"query");

    handle.shutdown();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn test_header_only_udp_packet_invokes_listener_with_empty_payload() {
    let (mut stack, frames, _events) = stack(StackConfig::default(), FixedPortUdp(53));
    let (h, mut calls) = collecting::<Vec<u8>>();
    stack.listen_udp(53, h).unwrap();

    let packet = ipv4(protocol::UDP, &[]);
    let header = Ipv4Header::parse(&packet).unwrap();
    assert_eq!(header.options, None);
    assert_eq!(header.payload, None);

    let _handle = stack.start_listening().unwrap();
    frames.send(eth(0x0800, &packet)).await.unwrap();

    assert_eq!(next(&mut calls).await, Vec::<u8>::new());
    assert_quiet(&mut calls).await;
}

#[tokio::test]
async fn test_each_frame_takes_exactly_one_path() {
    let (default, mut raw) = collecting::<RawDatagram>();
    let (stack, frames, mut events) = stack(StackConfig::default(), UdpDemux);
    let mut stack = stack.with_default_handler(default);
    let _handle = stack.start_listening().unwrap();

    let arp = vec![0x00, 0x01, 0x08, 0x00, 0x06, 0x04, 0x00, 0x01];
    frames.send(eth(0x0806, &arp)).await.unwrap();
    frames.send(eth(0x86DD, b"v6")).await.unwrap();
    frames.send(eth(0x0800, &ipv4(protocol::ICMP, b"ping"))).await.unwrap();
    frames.send(eth(0x0800, &ipv4(protocol::TCP, b"syn!"))).await.unwrap();
    frames.send(eth(0x0800, &ipv4(47, b"gre"))).await.unwrap();

    // engines run detached, so only the set of calls is fixed here
    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(next(&mut events).await);
    }
    seen.sort();
    assert_eq!(
        seen,
        vec![
            Event::Arp(arp),
            Event::Unhandled(0x86DD, b"v6".to_vec()),
            Event::Icmp(b"ping".to_vec()),
            Event::Tcp(b"syn!".to_vec()),
        ]
    );

    let datagram = next(&mut raw).await;
    assert_eq!(datagram.proto, 47);
    assert_eq!(datagram.payload, b"gre");

    assert_quiet(&mut events).await;
    assert_quiet(&mut raw).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_protocol_branch_follows_receive_order() {
    const FRAMES: u32 = 2000;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (mut stack, frames, mut events) =
        stack_with(StackConfig::default(), Sequenced(seen.clone()), UdpDemux);
    let handle = stack.start_listening().unwrap();

    for seq in 0..FRAMES {
        let frame = eth(0x0800, &ipv4(protocol::ICMP, &seq.to_be_bytes()));
        frames.send(frame).await.unwrap();
    }
    for _ in 0..FRAMES {
        assert!(matches!(next(&mut events).await, Event::Icmp(_)));
    }
    handle.shutdown();
    timeout(WAIT, handle.join()).await.unwrap().unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, (0..FRAMES).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_tcp_listener_lookup() {
    let (mut stack, frames, mut events) = stack(StackConfig::default(), UdpDemux);
    let (http, mut flows) = collecting::<Vec<u8>>();
    stack.listen_tcp(80, http).unwrap();
    let _handle = stack.start_listening().unwrap();

    // ports 40000 -> 80
    let segment = [0x9c, 0x40, 0x00, 0x50, 0xde, 0xad];
    frames.send(eth(0x0800, &ipv4(protocol::TCP, &segment))).await.unwrap();
    assert_eq!(next(&mut flows).await, segment.to_vec());
    assert_eq!(next(&mut events).await, Event::Tcp(segment.to_vec()));

    // ports 40000 -> 443, nobody listening
    let segment = [0x9c, 0x40, 0x01, 0xbb, 0xbe, 0xef];
    frames.send(eth(0x0800, &ipv4(protocol::TCP, &segment))).await.unwrap();
    assert_eq!(next(&mut events).await, Event::Tcp(segment.to_vec()));
    assert_quiet(&mut flows).await;
}

#[tokio::test]
async fn test_malformed_frames_are_dropped() {
    let (mut stack, frames, mut events) = stack(StackConfig::default(), UdpDemux);
    let (h, mut datagrams) = collecting::<UdpDatagram>();
    stack.listen_udp(7, h).unwrap();
    let handle = stack.start_listening().unwrap();

    // short frame, unknown ethertype, IHL below 5, total length below header length
    frames.send(vec![0u8; 13]).await.unwrap();
    frames.send(eth(0x88cc, b"lldp")).await.unwrap();
    let mut bad_ihl = ipv4(protocol::UDP, &udp(1, 7, b"x"));
    bad_ihl[0] = 0x44;
    frames.send(eth(0x0800, &bad_ihl)).await.unwrap();
    let mut bad_total = ipv4(protocol::UDP, &udp(1, 7, b"x"));
    bad_total[2..4].copy_from_slice(&19u16.to_be_bytes());
    frames.send(eth(0x0800, &bad_total)).await.unwrap();

    frames.send(udp_frame(7, b"echo")).await.unwrap();
    assert_eq!(next(&mut datagrams).await.payload, b"echo");

    assert_quiet(&mut datagrams).await;
    assert_quiet(&mut events).await;
    assert!(!handle.is_finished());
}

#[tokio::test]
async fn test_listener_registered_while_running() {
    let (mut stack, frames, _events) = stack(StackConfig::default(), UdpDemux);
    let _handle = stack.start_listening().unwrap();
    let (first, mut first_rx) = collecting::<UdpDatagram>();
    let (second, mut second_rx) = collecting::<UdpDatagram>();

    frames.send(udp_frame(9, b"early")).await.unwrap();
    assert_quiet(&mut first_rx).await;

    stack.listen_udp(9, first).unwrap();
    frames.send(udp_frame(9, b"one")).await.unwrap();
    assert_eq!(next(&mut first_rx).await.payload, b"one");

    stack.listen_udp(9, second).unwrap();
    assert_eq!(stack.udp_listeners().len(), 1);
    frames.send(udp_frame(9, b"two")).await.unwrap();
    assert_eq!(next(&mut second_rx).await.payload, b"two");
    assert_quiet(&mut first_rx).await;
}

#[tokio::test]
async fn test_invalid_port_rejected() {
    let (stack, _frames, _events) = stack(StackConfig::default(), UdpDemux);
    let (h, _rx) = collecting::<UdpDatagram>();
    assert!(matches!(
        stack.listen_udp(65536, h),
        Err(StackError::InvalidPort(65536))
    ));
    let (h, _rx) = collecting::<Vec<u8>>();
    assert!(matches!(
        stack.listen_tcp(-1, h),
        Err(StackError::InvalidPort(-1))
    ));
    assert!(stack.udp_listeners().is_empty());
    assert!(stack.tcp_listeners().is_empty());
}

#[tokio::test]
async fn test_interface_error_ends_loop() {
    let (mut stack, frames, _events) = stack(StackConfig::default(), UdpDemux);
    let handle = stack.start_listening().unwrap();

    frames
        .fail(io::Error::new(io::ErrorKind::Other, "link down"))
        .await
        .unwrap();

    match timeout(WAIT, handle.join()).await.unwrap() {
        Err(StackError::Interface(e)) => assert_eq!(e.to_string(), "link down"),
        other => panic!("expected interface error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_interface_close_ends_loop() {
    let (mut stack, frames, _events) = stack(StackConfig::new("closing"), UdpDemux);
    let handle = stack.start_listening().unwrap();
    drop(frames);
    timeout(WAIT, handle.join()).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_start_twice() {
    let (mut stack, _frames, _events) = stack(StackConfig::default(), UdpDemux);
    let _handle = stack.start_listening().unwrap();
    assert!(matches!(
        stack.start_listening(),
        Err(StackError::AlreadyListening)
    ));
}

#[test]
fn test_start_outside_runtime() {
    let (mut stack, _frames, _events) = stack(StackConfig::default(), UdpDemux);
    assert!(matches!(
        stack.start_listening(),
        Err(StackError::Runtime(_))
    ));
    // the interface is still available once a runtime exists
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let handle = stack.start_listening().unwrap();
        handle.shutdown();
        handle.join().await.unwrap();
    });
}

#[tokio::test]
async fn test_shutdown_stops_loop_with_interface_open() {
    let (mut stack, frames, _events) = stack(StackConfig::default(), UdpDemux);
    let (h, mut datagrams) = collecting::<UdpDatagram>();
    stack.listen_udp(53, h).unwrap();
    let handle = stack.start_listening().unwrap();

    stack.shutdown_handle().shutdown();
    timeout(WAIT, handle.join()).await.unwrap().unwrap();

    // the loop no longer reads the interface
    let _ = frames.send(udp_frame(53, b"late")).await;
    assert_quiet(&mut datagrams).await;
}

#[tokio::test]
async fn test_teardown_clears_listeners() {
    let (mut stack, _frames, _events) = stack(StackConfig::default(), UdpDemux);
    let (h, _rx) = collecting::<UdpDatagram>();
    stack.listen_udp(53, h).unwrap();
    let registry = stack.udp_listeners().clone();
    let handle = stack.start_listening().unwrap();

    stack.teardown();
    assert!(registry.is_empty());
    timeout(WAIT, handle.join()).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_bounded_dispatch_waits_for_free_slot() {
    let (mut stack, frames, _events) = stack(StackConfig::default().with_max_in_flight(1), UdpDemux);
    let gate = Arc::new(Semaphore::new(0));
    let (tx, mut datagrams) = mpsc::unbounded_channel();
    let blocking = {
        let gate = gate.clone();
        handler(move |datagram: UdpDatagram| {
            let gate = gate.clone();
            let tx = tx.clone();
            async move {
                let _ = tx.send(datagram.payload);
                let _ = gate.acquire().await.map(|permit| permit.forget());
            }
        })
    };
    stack.listen_udp(5000, blocking).unwrap();
    let _handle = stack.start_listening().unwrap();

    frames.send(udp_frame(5000, b"first")).await.unwrap();
    frames.send(udp_frame(5000, b"second")).await.unwrap();

    assert_eq!(next(&mut datagrams).await, b"first");
    assert_quiet(&mut datagrams).await;

    gate.add_permits(2);
    assert_eq!(next(&mut datagrams).await, b"second");
}

#[tokio::test]
async fn test_unbounded_dispatch_does_not_wait_for_handlers() {
    let (mut stack, frames, _events) = stack(StackConfig::default(), UdpDemux);
    let gate = Arc::new(Semaphore::new(0));
    let (tx, mut datagrams) = mpsc::unbounded_channel();
    let blocking = {
        let gate = gate.clone();
        handler(move |datagram: UdpDatagram| {
            let gate = gate.clone();
            let tx = tx.clone();
            async move {
                let _ = tx.send(datagram.payload);
                let _ = gate.acquire().await.map(|permit| permit.forget());
            }
        })
    };
    stack.listen_udp(5000, blocking).unwrap();
    let _handle = stack.start_listening().unwrap();

    frames.send(udp_frame(5000, b"first")).await.unwrap();
    frames.send(udp_frame(5000, b"second")).await.unwrap();

    let mut payloads = vec![next(&mut datagrams).await, next(&mut datagrams).await];
    payloads.sort();
    assert_eq!(payloads, vec![b"first".to_vec(), b"second".to_vec()]);
    gate.close();
}

#[tokio::test]
async fn test_shutdown_while_waiting_for_dispatch_slot() {
    let (mut stack, frames, _events) = stack(StackConfig::default().with_max_in_flight(1), UdpDemux);
    let (tx, mut started) = mpsc::unbounded_channel();
    let stuck = handler(move |datagram: UdpDatagram| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(datagram.payload);
            std::future::pending::<()>().await
        }
    });
    stack.listen_udp(9, stuck).unwrap();
    let handle = stack.start_listening().unwrap();

    frames.send(udp_frame(9, b"stuck")).await.unwrap();
    frames.send(udp_frame(9, b"waiting")).await.unwrap();
    assert_eq!(next(&mut started).await, b"stuck");
    assert_quiet(&mut started).await;

    handle.shutdown();
    timeout(WAIT, handle.join())
        .await
        .expect("loop kept waiting for a dispatch slot")
        .unwrap();
    assert_quiet(&mut started).await;
}
