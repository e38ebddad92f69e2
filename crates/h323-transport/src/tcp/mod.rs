mod listener;

pub use listener::{ListenerEvent, TpktListener};

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, trace, warn};

use rvoip_h323_proto::tpkt::{self, TpktDecoder};

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportEvent};

// Default channel capacity
const DEFAULT_CHANNEL_CAPACITY: usize = 100;

// Read buffer size for the receive loop
const READ_BUFFER_SIZE: usize = 4096;

/// TCP connection carrying TPKT framed PDUs
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<TcpTransportInner>,
}

struct TcpTransportInner {
    writer: Mutex<OwnedWriteHalf>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    closed: AtomicBool,
    events_tx: mpsc::Sender<TransportEvent>,
}

impl TcpTransport {
    /// Connect to a remote H.225.0 or H.245 endpoint
    pub async fn connect(
        addr: SocketAddr,
        connect_timeout: Option<Duration>,
        channel_capacity: Option<usize>,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let connect = TcpStream::connect(addr);
        let stream = match connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| Error::ConnectFailed { addr, reason: "timed out".to_string() })?,
            None => connect.await,
        }
        .map_err(|e| Error::ConnectFailed { addr, reason: e.to_string() })?;

        info!("TPKT connection established to {}", addr);
        Self::from_stream(stream, channel_capacity)
    }

    /// Wrap an accepted or connected stream and start its receive loop
    pub fn from_stream(
        stream: TcpStream,
        channel_capacity: Option<usize>,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let capacity = channel_capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(capacity);

        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        let transport = TcpTransport {
            inner: Arc::new(TcpTransportInner {
                writer: Mutex::new(writer),
                local_addr,
                peer_addr,
                closed: AtomicBool::new(false),
                events_tx,
            }),
        };

        transport.spawn_receive_loop(reader);

        Ok((transport, events_rx))
    }

    // Spawns a task reading the stream and emitting one event per TPKT payload
    fn spawn_receive_loop(&self, mut reader: OwnedReadHalf) {
        let transport = self.clone();

        tokio::spawn(async move {
            let inner = &transport.inner;
            let mut decoder = TpktDecoder::new();
            let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

            'outer: while !inner.closed.load(Ordering::Relaxed) {
                buf.clear();
                match reader.read_buf(&mut buf).await {
                    Ok(0) => {
                        debug!("Peer {} closed the connection", inner.peer_addr);
                        break;
                    }
                    Ok(n) => {
                        trace!("Read {} bytes from {}", n, inner.peer_addr);
                        decoder.extend(&buf);
                        loop {
                            match decoder.next_frame() {
                                Ok(Some(payload)) => {
                                    let event = TransportEvent::PayloadReceived {
                                        payload,
                                        source: inner.peer_addr,
                                    };
                                    if let Err(e) = inner.events_tx.send(event).await {
                                        error!("Error sending event: {}", e);
                                        break 'outer;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    // the stream cannot be resynchronised after a bad header
                                    warn!("Bad TPKT framing from {}: {}", inner.peer_addr, e);
                                    let _ = inner.events_tx.send(TransportEvent::Error {
                                        error: format!("Bad TPKT framing: {}", e),
                                    }).await;
                                    break 'outer;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        if inner.closed.load(Ordering::Relaxed) {
                            break;
                        }
                        error!("Error reading from {}: {}", inner.peer_addr, e);
                        let _ = inner.events_tx.send(TransportEvent::Error {
                            error: format!("Error reading stream: {}", e),
                        }).await;
                        break;
                    }
                }
            }

            inner.closed.store(true, Ordering::Relaxed);
            let _ = inner.events_tx.send(TransportEvent::Closed).await;
            info!("TPKT receive loop for {} terminated", inner.peer_addr);
        });
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr)
    }

    fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.peer_addr)
    }

    async fn send_payload(&self, payload: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }

        let framed = tpkt::frame(&payload)?;
        debug!("Sending {} byte PDU to {}", payload.len(), self.inner.peer_addr);

        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&framed).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Shutdown of {} failed: {}", self.inner.peer_addr, e);
        }
        info!("Closed TPKT connection to {}", self.inner.peer_addr);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TcpTransport({} -> {})", self.inner.local_addr, self.inner.peer_addr)
    }
}
