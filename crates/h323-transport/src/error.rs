use std::net::SocketAddr;

use rvoip_h323_proto::CodecError;
use thiserror::Error;

/// Errors raised by H.323 transports
#[derive(Error, Debug)]
pub enum Error {
    /// Underlying socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport has been closed
    #[error("Transport closed")]
    TransportClosed,

    /// Connecting to the remote endpoint failed
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: SocketAddr, reason: String },

    /// Bad TPKT framing on the byte stream
    #[error("Framing error: {0}")]
    Framing(#[from] CodecError),

    /// Event channel receiver went away
    #[error("Event channel closed")]
    ChannelClosed,
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;
