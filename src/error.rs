//! Error types shared by the parsers, the engines and the stack dispatcher.

use std::io;

/// Structural failure while decoding a received header.
///
/// Parse errors are always recoverable: the dispatcher drops the offending
/// frame and keeps listening.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("frame too short: {len} bytes, need at least 14")]
    FrameTooShort { len: usize },
    #[error("unknown ethertype 0x{0:04x}")]
    UnknownEtherType(u16),
    #[error("IPv4 header length {0} is below the 20 byte minimum")]
    HeaderTooSmall(usize),
    #[error("truncated header: {0}")]
    Truncated(String),
}

/// Error reported by a protocol engine back to the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("packet rejected: {0}")]
    Rejected(String),
}

/// Errors visible to the code that owns a [`StackInstance`](crate::StackInstance).
#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error("port {0} is outside 0..=65535")]
    InvalidPort(i64),
    #[error("stack is already listening")]
    AlreadyListening,
    #[error("network interface error: {0}")]
    Interface(#[source] io::Error),
    #[error("no Tokio runtime to listen on: {0}")]
    Runtime(String),
    #[error("listen task failed: {0}")]
    Join(String),
}
