use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::{TcpTransport, DEFAULT_CHANNEL_CAPACITY};
use crate::error::Result;
use crate::transport::TransportEvent;

/// Events emitted by a listening socket
#[derive(Debug)]
pub enum ListenerEvent {
    /// A peer connected; its events arrive on `events`
    Accepted {
        transport: TcpTransport,
        events: mpsc::Receiver<TransportEvent>,
        peer: SocketAddr,
    },

    /// Accept failed
    Error { error: String },
}

/// Listening socket for incoming H.225.0 or H.245 connections
#[derive(Clone)]
pub struct TpktListener {
    inner: Arc<TpktListenerInner>,
}

struct TpktListenerInner {
    local_addr: SocketAddr,
    closed: AtomicBool,
}

impl TpktListener {
    /// Bind and start accepting connections
    pub async fn bind(addr: SocketAddr) -> Result<(Self, mpsc::Receiver<ListenerEvent>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("TPKT listener bound to {}", local_addr);

        let (events_tx, events_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let this = TpktListener {
            inner: Arc::new(TpktListenerInner { local_addr, closed: AtomicBool::new(false) }),
        };
        this.spawn_accept_loop(listener, events_tx);

        Ok((this, events_rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Stop accepting; already accepted connections stay open
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }

    fn spawn_accept_loop(&self, listener: TcpListener, events_tx: mpsc::Sender<ListenerEvent>) {
        let this = self.clone();

        tokio::spawn(async move {
            while !this.is_closed() {
                let event = match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        match TcpTransport::from_stream(stream, None) {
                            Ok((transport, events)) => {
                                ListenerEvent::Accepted { transport, events, peer }
                            }
                            Err(e) => ListenerEvent::Error {
                                error: format!("Failed to set up {}: {}", peer, e),
                            },
                        }
                    }
                    Err(e) => {
                        error!("Accept failed on {}: {}", this.inner.local_addr, e);
                        ListenerEvent::Error { error: e.to_string() }
                    }
                };
                if events_tx.send(event).await.is_err() {
                    break;
                }
            }
            info!("TPKT accept loop on {} terminated", this.inner.local_addr);
        });
    }
}

impl std::fmt::Debug for TpktListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TpktListener({})", self.inner.local_addr)
    }
}
