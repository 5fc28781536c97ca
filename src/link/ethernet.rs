//! Ethernet II frame parsing
//!
//! Decodes the fixed 14-byte header of a received frame:
//! - Destination MAC (6 bytes)
//! - Source MAC (6 bytes)
//! - EtherType (2 bytes)
//!
//! The payload is handed out as a view into the received buffer.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};

use crate::error::ParseError;

/// Length of the fixed Ethernet II header in bytes
pub const ETHERNET_HEADER_LEN: usize = 14;

/// A 6-byte hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Group bit set, broadcast included
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Payload protocols this stack knows how to route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum EtherType {
    Ipv4 = 0x0800,
    Arp = 0x0806,
    Ipv6 = 0x86DD,
}

impl TryFrom<u16> for EtherType {
    type Error = ParseError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0800 => Ok(EtherType::Ipv4),
            0x0806 => Ok(EtherType::Arp),
            0x86DD => Ok(EtherType::Ipv6),
            other => Err(ParseError::UnknownEtherType(other)),
        }
    }
}

impl From<EtherType> for u16 {
    fn from(value: EtherType) -> u16 {
        value as u16
    }
}

/// A decoded Ethernet frame borrowing its payload from the receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetFrame<'a> {
    pub src: MacAddr,
    pub dst: MacAddr,
    pub ethertype: EtherType,
    /// Everything after the fixed header, possibly empty
    pub payload: &'a [u8],
}

impl<'a> EthernetFrame<'a> {
    /// Parse an Ethernet II frame.
    ///
    /// Frames of exactly 14 bytes parse with an empty payload.
    pub fn parse(frame: &'a [u8]) -> Result<Self, ParseError> {
        if frame.len() < ETHERNET_HEADER_LEN {
            return Err(ParseError::FrameTooShort { len: frame.len() });
        }

        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&frame[0..6]);
        src.copy_from_slice(&frame[6..12]);
        let ethertype = EtherType::try_from(BigEndian::read_u16(&frame[12..14]))?;

        Ok(EthernetFrame {
            src: MacAddr(src),
            dst: MacAddr(dst),
            ethertype,
            payload: &frame[ETHERNET_HEADER_LEN..],
        })
    }
}
