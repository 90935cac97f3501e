//! Error types for the tapstack engine

use std::io;
use thiserror::Error;

/// Result type alias for stack operations
pub type Result<T> = std::result::Result<T, StackError>;

/// Main error type for the interception stack
#[derive(Error, Debug)]
pub enum StackError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("packet too short: expected {expected}, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("invalid IP version: {0}")]
    InvalidIpVersion(u8),

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("invalid IPv6 extension chain: {0}")]
    ExtensionChainInvalid(String),

    #[error("unsupported transport protocol: {0}")]
    UnsupportedProtocol(u8),

    #[error("session table full: {0}")]
    SessionTableFull(usize),

    #[error("channel closed")]
    ChannelClosed,

    #[error("real socket failure: {0}")]
    SocketFailure(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StackError {
    /// True for errors raised at the codec boundary. Such packets never
    /// reach the session handler; they are dropped after being counted.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            StackError::PacketTooShort { .. }
                | StackError::InvalidIpVersion(_)
                | StackError::MalformedHeader(_)
                | StackError::ExtensionChainInvalid(_)
                | StackError::UnsupportedProtocol(_)
        )
    }
}
