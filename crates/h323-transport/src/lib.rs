//! H.323 transport layer implementation for the rvoip stack
//!
//! Both the H.225.0 call signaling channel and a separate H.245 control
//! channel run over TCP with TPKT framing. This crate provides the
//! [`Transport`] trait the call manager writes through, a TCP implementation
//! and a listener for incoming connections.

pub mod error;
pub mod tcp;
pub mod transport;

pub use error::{Error, Result};
pub use tcp::{ListenerEvent, TcpTransport, TpktListener};
pub use transport::{Transport, TransportEvent};

/// Connect a TPKT transport to the specified address
pub async fn connect_tcp(
    addr: std::net::SocketAddr,
) -> Result<(TcpTransport, tokio::sync::mpsc::Receiver<TransportEvent>)> {
    TcpTransport::connect(addr, None, None).await
}

/// Bind a TPKT listener to the specified address
pub async fn bind_tcp(
    addr: std::net::SocketAddr,
) -> Result<(TpktListener, tokio::sync::mpsc::Receiver<ListenerEvent>)> {
    TpktListener::bind(addr).await
}

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        bind_tcp, connect_tcp, Error, ListenerEvent, Result, TcpTransport, TpktListener, Transport,
        TransportEvent,
    };
}
