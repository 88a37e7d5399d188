//! Protocol error types

use thiserror::Error;

/// Errors produced while decoding frames or validating tunnel requests.
///
/// Request-policy rejections (`BadAuthToken`, `PortNotAllowed`,
/// `PortUnavailable`) are delivered to the peer as the UTF-8 text of a
/// `ResponseErr` message, so their `Display` output is part of the protocol
/// surface.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Bad Auth Token")]
    BadAuthToken,

    #[error("remote port {0} not allowed")]
    PortNotAllowed(u16),

    #[error("no port available in {0}")]
    PortUnavailable(String),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("truncated {0} message")]
    Truncated(&'static str),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::Malformed(err.to_string())
    }
}
