//! Network interface abstraction
//!
//! The stack pulls raw Ethernet frames from a [`NetworkInterface`] one at a
//! time, in the order the interface received them. Two implementations are
//! provided:
//! - [`ChannelInterface`], fed from a [`FrameSender`] (tests, bridges)
//! - [`TapInterface`], a Linux TAP device read from a dedicated thread

use std::future::Future;
use std::io;
use std::thread;

use log::{debug, warn};
use tokio::sync::mpsc;
use tun_tap::{Iface, Mode};

/// Largest frame read from a TAP device: 1500 byte MTU plus Ethernet header and VLAN tag
pub const MAX_FRAME_LEN: usize = 1518;

const TAP_QUEUE_LEN: usize = 256;

/// Source of received link-layer frames
pub trait NetworkInterface: Send + 'static {
    /// Next received frame.
    ///
    /// `None` means the interface is closed. An `Err` is fatal for the
    /// receive loop reading this interface.
    fn recv(&mut self) -> impl Future<Output = Option<io::Result<Vec<u8>>>> + Send;
}

/// Create a connected frame sender / interface pair holding up to `capacity` frames.
pub fn channel(capacity: usize) -> (FrameSender, ChannelInterface) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (FrameSender { tx }, ChannelInterface { rx })
}

/// Push side of a [`ChannelInterface`]. Dropping every sender closes the interface.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<io::Result<Vec<u8>>>,
}

impl FrameSender {
    /// Deliver a received frame, waiting while the queue is full
    pub async fn send(&self, frame: Vec<u8>) -> io::Result<()> {
        self.tx.send(Ok(frame)).await.map_err(|_| closed())
    }

    /// Report a fatal interface error to the receive loop
    pub async fn fail(&self, error: io::Error) -> io::Result<()> {
        self.tx.send(Err(error)).await.map_err(|_| closed())
    }

    fn blocking_send(&self, item: io::Result<Vec<u8>>) -> io::Result<()> {
        self.tx.blocking_send(item).map_err(|_| closed())
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "network interface closed")
}

/// Interface backed by an in-memory frame queue
#[derive(Debug)]
pub struct ChannelInterface {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
}

impl NetworkInterface for ChannelInterface {
    async fn recv(&mut self) -> Option<io::Result<Vec<u8>>> {
        self.rx.recv().await
    }
}

/// Linux TAP device delivering Ethernet frames
#[derive(Debug)]
pub struct TapInterface {
    name: String,
    frames: ChannelInterface,
}

impl TapInterface {
    /// Open (or create) the TAP device `name`.
    ///
    /// Requires CAP_NET_ADMIN. Address configuration and link bring-up are
    /// left to the caller.
    pub fn open(name: &str) -> io::Result<Self> {
        let iface = Iface::without_packet_info(name, Mode::Tap)?;
        let name = iface.name().to_string();
        let (tx, frames) = channel(TAP_QUEUE_LEN);

        thread::Builder::new()
            .name(format!("{}-rx", name))
            .spawn(move || pump(iface, tx))?;

        Ok(TapInterface { name, frames })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl NetworkInterface for TapInterface {
    async fn recv(&mut self) -> Option<io::Result<Vec<u8>>> {
        self.frames.recv().await
    }
}

/// Blocking read loop moving frames from the device into the queue
fn pump(iface: Iface, tx: FrameSender) {
    let mut buf = [0u8; MAX_FRAME_LEN];
    loop {
        match iface.recv(&mut buf) {
            Ok(nbytes) => {
                if tx.blocking_send(Ok(buf[..nbytes].to_vec())).is_err() {
                    debug!("{}: receiver gone, stopping reader", iface.name());
                    return;
                }
            }
            Err(e) => {
                warn!("{}: read failed: {}", iface.name(), e);
                let _ = tx.blocking_send(Err(e));
                return;
            }
        }
    }
}
