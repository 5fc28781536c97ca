//! Stack instance and receive loop
//!
//! A [`StackInstance`] ties one network interface to a set of protocol
//! engines and the TCP/UDP listener registries. Once started, its receive
//! loop pulls frames from the interface and, one frame at a time, decodes the
//! Ethernet header, runs the IPv4 engine and picks the protocol-number
//! branch. Only the final engine call (ARP, ICMP, TCP, UDP, default or
//! unhandled ethertype) runs in a spawned task, and the loop never waits for
//! it before reading the next frame.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use crate::config::StackConfig;
use crate::engine::{ArpEngine, EthernetEngine, IcmpEngine, Ipv4Engine, TcpEngine, UdpEngine};
use crate::error::StackError;
use crate::iface::interface::NetworkInterface;
use crate::iface::ipv4::{Deliveries, ProtocolDemux, RawDatagram};
use crate::link::{EtherType, EthernetFrame, ETHERNET_HEADER_LEN};
use crate::transport::{Handler, ListenerRegistry};

/// The protocol engines plugged into a stack instance
#[derive(Debug, Clone, Default)]
pub struct Engines<E, A, I, C, T, U> {
    pub ethernet: E,
    pub arp: A,
    pub ipv4: I,
    pub icmp: C,
    pub tcp: T,
    pub udp: U,
}

/// Signal that stops a receive loop at the top of its next iteration
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        ShutdownHandle { tx: Arc::new(tx) }
    }

    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Handle to a running receive loop
#[derive(Debug)]
pub struct ListenHandle {
    task: JoinHandle<Result<(), StackError>>,
    shutdown: ShutdownHandle,
}

impl ListenHandle {
    /// Ask the loop to stop. Already dispatched frames keep running.
    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to exit.
    ///
    /// Returns `Ok` on shutdown or when the interface closes, and the
    /// interface error if one ended the loop.
    pub async fn join(self) -> Result<(), StackError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(StackError::Join(e.to_string())),
        }
    }
}

/// One configured network interface and everything routing its traffic
pub struct StackInstance<N, E, A, I, C, T: TcpEngine, U: UdpEngine> {
    config: StackConfig,
    iface: Option<N>,
    ethernet: Arc<E>,
    arp: Arc<A>,
    ipv4: Arc<I>,
    icmp: Arc<C>,
    tcp: Arc<T>,
    udp: Arc<U>,
    tcp_listeners: ListenerRegistry<T::Flow>,
    udp_listeners: ListenerRegistry<U::Datagram>,
    default: Option<Handler<RawDatagram>>,
    shutdown: ShutdownHandle,
}

impl<N, E, A, I, C, T, U> StackInstance<N, E, A, I, C, T, U>
where
    N: NetworkInterface,
    E: EthernetEngine,
    A: ArpEngine,
    I: Ipv4Engine,
    C: IcmpEngine,
    T: TcpEngine,
    U: UdpEngine,
{
    pub fn new(config: StackConfig, iface: N, engines: Engines<E, A, I, C, T, U>) -> Self {
        StackInstance {
            config,
            iface: Some(iface),
            ethernet: Arc::new(engines.ethernet),
            arp: Arc::new(engines.arp),
            ipv4: Arc::new(engines.ipv4),
            icmp: Arc::new(engines.icmp),
            tcp: Arc::new(engines.tcp),
            udp: Arc::new(engines.udp),
            tcp_listeners: ListenerRegistry::new(),
            udp_listeners: ListenerRegistry::new(),
            default: None,
            shutdown: ShutdownHandle::new(),
        }
    }

    /// Handler for IPv4 protocols other than ICMP, TCP and UDP.
    ///
    /// Takes effect for loops started afterwards.
    pub fn with_default_handler(mut self, handler: Handler<RawDatagram>) -> Self {
        self.default = Some(handler);
        self
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Listen for UDP datagrams on `port`, replacing any existing listener
    pub fn listen_udp(&self, port: i64, handler: Handler<U::Datagram>) -> Result<(), StackError> {
        let port = valid_port(port)?;
        debug!("{}: listening on udp/{}", self.config.name, port);
        self.udp_listeners.register(port, handler);
        Ok(())
    }

    /// Listen for TCP flows on `port`, replacing any existing listener
    pub fn listen_tcp(&self, port: i64, handler: Handler<T::Flow>) -> Result<(), StackError> {
        let port = valid_port(port)?;
        debug!("{}: listening on tcp/{}", self.config.name, port);
        self.tcp_listeners.register(port, handler);
        Ok(())
    }

    pub fn udp_listeners(&self) -> &ListenerRegistry<U::Datagram> {
        &self.udp_listeners
    }

    pub fn tcp_listeners(&self) -> &ListenerRegistry<T::Flow> {
        &self.tcp_listeners
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Start the receive loop on the current Tokio runtime.
    ///
    /// The interface moves into the loop, so this succeeds once per instance.
    /// Listeners can still be registered on `self` while the loop runs.
    pub fn start_listening(&mut self) -> Result<ListenHandle, StackError> {
        let runtime = Handle::try_current().map_err(|e| StackError::Runtime(e.to_string()))?;
        let iface = self.iface.take().ok_or(StackError::AlreadyListening)?;

        let demux = ProtocolDemux::new(
            Arc::clone(&self.icmp),
            Arc::clone(&self.tcp),
            Arc::clone(&self.udp),
            self.tcp_listeners.lookup_handle(),
            self.udp_listeners.lookup_handle(),
        )
        .with_default(self.default.clone());

        let dispatcher = Dispatcher {
            name: self.config.name.clone(),
            ethernet: Arc::clone(&self.ethernet),
            arp: Arc::clone(&self.arp),
            ipv4: Arc::clone(&self.ipv4),
            demux,
            limit: self
                .config
                .max_in_flight
                .map(|n| Arc::new(Semaphore::new(n.max(1)))),
        };

        let task = runtime.spawn(receive_loop(iface, dispatcher, self.shutdown.subscribe()));
        Ok(ListenHandle {
            task,
            shutdown: self.shutdown.clone(),
        })
    }

    /// Stop the receive loop and drop every registered listener
    pub fn teardown(self) {
        info!("{}: tearing down", self.config.name);
        self.shutdown.shutdown();
        self.tcp_listeners.clear();
        self.udp_listeners.clear();
    }
}

fn valid_port(port: i64) -> Result<u16, StackError> {
    u16::try_from(port).map_err(|_| StackError::InvalidPort(port))
}

struct Dispatcher<E, A, I, C, T: TcpEngine, U: UdpEngine> {
    name: String,
    ethernet: Arc<E>,
    arp: Arc<A>,
    ipv4: Arc<I>,
    demux: ProtocolDemux<C, T, U>,
    limit: Option<Arc<Semaphore>>,
}

impl<E, A, I, C, T, U> Dispatcher<E, A, I, C, T, U>
where
    E: EthernetEngine,
    A: ArpEngine,
    I: Ipv4Engine,
    C: IcmpEngine,
    T: TcpEngine,
    U: UdpEngine,
{
    /// Route one frame. Breaks when shutdown was requested while waiting
    /// for a dispatch slot.
    async fn dispatch(
        &self,
        frame: Vec<u8>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ControlFlow<()> {
        let ethertype = match EthernetFrame::parse(&frame) {
            Ok(eth) => eth.ethertype,
            Err(e) => {
                debug!("{}: dropping frame: {}", self.name, e);
                return ControlFlow::Continue(());
            }
        };

        match ethertype {
            EtherType::Arp => {
                let arp = Arc::clone(&self.arp);
                let task = async move { arp.input(&frame[ETHERNET_HEADER_LEN..]).await };
                self.spawn(task, shutdown).await
            }
            EtherType::Ipv4 => {
                let deliveries = Deliveries::new(&self.demux);
                if let Err(e) = self
                    .ipv4
                    .input(&deliveries, &frame[ETHERNET_HEADER_LEN..])
                    .await
                {
                    warn!("{}: IPv4 input failed: {}", self.name, e);
                }
                for task in deliveries.into_tasks() {
                    if self.spawn(task, shutdown).await.is_break() {
                        return ControlFlow::Break(());
                    }
                }
                ControlFlow::Continue(())
            }
            other => {
                let ethernet = Arc::clone(&self.ethernet);
                let task =
                    async move { ethernet.input(other, &frame[ETHERNET_HEADER_LEN..]).await };
                self.spawn(task, shutdown).await
            }
        }
    }

    /// Run `task` detached, waiting for a free slot first when dispatch is bounded
    async fn spawn<F>(&self, task: F, shutdown: &mut watch::Receiver<bool>) -> ControlFlow<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(limit) = &self.limit else {
            tokio::spawn(task);
            return ControlFlow::Continue(());
        };

        let permit = tokio::select! {
            biased;
            _ = stop_requested(shutdown) => {
                debug!("{}: shutdown while waiting for a dispatch slot", self.name);
                return ControlFlow::Break(());
            }
            permit = Arc::clone(limit).acquire_owned() => permit,
        };
        match permit {
            Ok(permit) => {
                tokio::spawn(async move {
                    task.await;
                    drop(permit);
                });
            }
            Err(_) => debug!("{}: dispatch limiter closed", self.name),
        }
        ControlFlow::Continue(())
    }
}

async fn receive_loop<N, E, A, I, C, T, U>(
    mut iface: N,
    dispatcher: Dispatcher<E, A, I, C, T, U>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), StackError>
where
    N: NetworkInterface,
    E: EthernetEngine,
    A: ArpEngine,
    I: Ipv4Engine,
    C: IcmpEngine,
    T: TcpEngine,
    U: UdpEngine,
{
    info!("{}: receive loop started", dispatcher.name);
    loop {
        let received = tokio::select! {
            biased;
            _ = stop_requested(&mut shutdown) => {
                info!("{}: shutdown requested, leaving receive loop", dispatcher.name);
                return Ok(());
            }
            received = iface.recv() => received,
        };

        match received {
            Some(Ok(frame)) => {
                if dispatcher.dispatch(frame, &mut shutdown).await.is_break() {
                    info!("{}: shutdown requested, leaving receive loop", dispatcher.name);
                    return Ok(());
                }
            }
            Some(Err(e)) => {
                error!("{}: interface error, leaving receive loop: {}", dispatcher.name, e);
                return Err(StackError::Interface(e));
            }
            None => {
                info!("{}: interface closed", dispatcher.name);
                return Ok(());
            }
        }
    }
}

/// Resolves once shutdown is signalled; never resolves if every handle is gone
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let closed = shutdown.wait_for(|stop| *stop).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_range() {
        assert_eq!(valid_port(0).unwrap(), 0);
        assert_eq!(valid_port(65535).unwrap(), 65535);
        assert!(matches!(valid_port(65536), Err(StackError::InvalidPort(65536))));
        assert!(matches!(valid_port(-1), Err(StackError::InvalidPort(-1))));
    }

    #[test]
    fn test_shutdown_handle() {
        let handle = ShutdownHandle::new();
        let rx = handle.subscribe();
        assert!(!handle.is_shutdown());
        handle.clone().shutdown();
        assert!(handle.is_shutdown());
        assert!(*rx.borrow());
    }
}
