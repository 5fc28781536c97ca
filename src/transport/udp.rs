//! UDP (User Datagram Protocol) port demultiplexing
//!
//! This module decodes the UDP header and hands each datagram to the
//! listener registered on its destination port. Checksums are not verified.

use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};
use log::debug;

use crate::engine::UdpEngine;
use crate::error::ParseError;
use crate::transport::listener::ListenerLookup;

/// UDP header length in bytes
pub const UDP_HEADER_LEN: usize = 8;

/// UDP packet header structure
///
/// Represents the standard 8-byte UDP header as defined in RFC 768
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16, // Length of UDP header and data
    pub checksum: u16,
}

impl UdpHeader {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < UDP_HEADER_LEN {
            return Err(ParseError::Truncated(format!(
                "UDP header needs {} bytes but segment has {}",
                UDP_HEADER_LEN,
                data.len()
            )));
        }

        Ok(UdpHeader {
            src_port: BigEndian::read_u16(&data[0..2]),
            dst_port: BigEndian::read_u16(&data[2..4]),
            length: BigEndian::read_u16(&data[4..6]),
            checksum: BigEndian::read_u16(&data[6..8]),
        })
    }

    pub fn to_bytes(&self) -> [u8; UDP_HEADER_LEN] {
        let mut bytes = [0u8; UDP_HEADER_LEN];
        BigEndian::write_u16(&mut bytes[0..2], self.src_port);
        BigEndian::write_u16(&mut bytes[2..4], self.dst_port);
        BigEndian::write_u16(&mut bytes[4..6], self.length);
        BigEndian::write_u16(&mut bytes[6..8], self.checksum);
        bytes
    }
}

/// A received datagram as seen by a UDP listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Vec<u8>,
}

/// Stateless UDP engine: header decode plus port lookup.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpDemux;

impl UdpEngine for UdpDemux {
    type Datagram = UdpDatagram;

    async fn input(
        &self,
        listeners: &ListenerLookup<UdpDatagram>,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        segment: &[u8],
    ) {
        let header = match UdpHeader::parse(segment) {
            Ok(header) => header,
            Err(e) => {
                debug!("Dropping UDP segment from {}: {}", src, e);
                return;
            }
        };

        let end = header.length as usize;
        if end < UDP_HEADER_LEN || end > segment.len() {
            debug!(
                "Dropping UDP segment from {}: length field {} does not fit {} bytes",
                src,
                header.length,
                segment.len()
            );
            return;
        }

        let datagram = UdpDatagram {
            src,
            dst,
            src_port: header.src_port,
            dst_port: header.dst_port,
            payload: segment[UDP_HEADER_LEN..end].to_vec(),
        };
        listeners.deliver(header.dst_port, datagram).await;
    }
}
