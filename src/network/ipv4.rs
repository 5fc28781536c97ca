//! IPv4 header parsing
//!
//! This module decodes the IPv4 header of a received packet, including the
//! variable-length options area, and slices the payload using the declared
//! total length.
//!
//! Checksums are not verified and fragments are not reassembled; callers get
//! the header fields exactly as received.

use std::net::Ipv4Addr;
use std::ops::Range;

use byteorder::{BigEndian, ByteOrder};

use crate::error::ParseError;

/// Length of an IPv4 header without options
pub const IPV4_MIN_HEADER_LEN: usize = 20;

const TOTAL_LEN: Range<usize> = 2..4;
const PROTOCOL: usize = 9;
const SRC_ADDR: Range<usize> = 12..16;
const DST_ADDR: Range<usize> = 16..20;

/// IPv4 protocol numbers routed by the stack
pub mod protocol {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

/// A decoded IPv4 header borrowing options and payload from the packet buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header<'a> {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
    /// Present only when the header is longer than 20 bytes
    pub options: Option<&'a [u8]>,
    /// Absent when the total length covers the header alone
    pub payload: Option<&'a [u8]>,
}

impl<'a> Ipv4Header<'a> {
    /// Parse an IPv4 header.
    ///
    /// Bytes past the declared total length, such as Ethernet padding, are
    /// ignored. Any read outside `buf` fails with [`ParseError::Truncated`],
    /// as does a total length smaller than the header length.
    pub fn parse(buf: &'a [u8]) -> Result<Self, ParseError> {
        let version_ihl = *buf
            .first()
            .ok_or_else(|| ParseError::Truncated("missing version/IHL byte".to_string()))?;
        let header_len = (version_ihl & 0x0F) as usize * 4;
        if header_len < IPV4_MIN_HEADER_LEN {
            return Err(ParseError::HeaderTooSmall(header_len));
        }

        let options_len = header_len - IPV4_MIN_HEADER_LEN;
        let options = if options_len > 0 {
            Some(slice(buf, IPV4_MIN_HEADER_LEN..header_len, "options")?)
        } else {
            None
        };

        let src = Ipv4Addr::from(read_addr(buf, SRC_ADDR, "source address")?);
        let dst = Ipv4Addr::from(read_addr(buf, DST_ADDR, "destination address")?);
        let proto = *buf
            .get(PROTOCOL)
            .ok_or_else(|| ParseError::Truncated("missing protocol byte".to_string()))?;

        let total_len = BigEndian::read_u16(slice(buf, TOTAL_LEN, "total length")?) as usize;
        let payload_len = total_len.checked_sub(header_len).ok_or_else(|| {
            ParseError::Truncated(format!(
                "total length {} is less than header length {}",
                total_len, header_len
            ))
        })?;
        let payload = if payload_len == 0 {
            None
        } else {
            Some(slice(buf, header_len..total_len, "payload")?)
        };

        Ok(Ipv4Header {
            src,
            dst,
            proto,
            options,
            payload,
        })
    }

    /// Header length in bytes, options included
    pub fn header_len(&self) -> usize {
        IPV4_MIN_HEADER_LEN + self.options.map_or(0, <[u8]>::len)
    }

    /// The payload, or an empty slice when the packet carries none
    pub fn payload_or_empty(&self) -> &'a [u8] {
        self.payload.unwrap_or(&[])
    }
}

fn slice<'a>(buf: &'a [u8], range: Range<usize>, what: &str) -> Result<&'a [u8], ParseError> {
    let (start, end) = (range.start, range.end);
    buf.get(range).ok_or_else(|| {
        ParseError::Truncated(format!(
            "{} needs bytes {}..{} but packet has {}",
            what,
            start,
            end,
            buf.len()
        ))
    })
}

fn read_addr(buf: &[u8], range: Range<usize>, what: &str) -> Result<[u8; 4], ParseError> {
    let mut addr = [0u8; 4];
    addr.copy_from_slice(slice(buf, range, what)?);
    Ok(addr)
}
