use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;

use crate::error::Result;

/// Events emitted by a connected transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// One complete TPKT payload arrived
    PayloadReceived { payload: Bytes, source: SocketAddr },

    /// Receive side error; the connection may still be usable
    Error { error: String },

    /// The connection is gone
    Closed,
}

/// A stream connection carrying framed H.225.0 or H.245 PDUs
#[async_trait::async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Local socket address
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Remote socket address
    fn peer_addr(&self) -> Result<SocketAddr>;

    /// Frame and send one encoded PDU
    async fn send_payload(&self, payload: Bytes) -> Result<()>;

    /// Shut the connection down
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}
