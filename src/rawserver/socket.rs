use bytes::{Bytes, BytesMut};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::session::ConnectPermit;

const READ_CHUNK: usize = 32 * 1024;

/// Identifies a socket for the lifetime of a [`super::RawServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Events posted by socket and connect tasks.
pub(crate) enum SocketEvent {
    Connected {
        addr: SocketAddr,
        stream: TcpStream,
        permit: Option<ConnectPermit>,
    },
    ConnectFailed {
        addr: SocketAddr,
        error: io::Error,
    },
    Data {
        id: SocketId,
        data: Bytes,
    },
    /// The write queue drained.
    Flushed {
        id: SocketId,
    },
    Closed {
        id: SocketId,
        error: Option<io::Error>,
    },
}

/// The engine's side of a live socket.
///
/// Reading and writing happen on two tasks that only move bytes; everything
/// they see is reported back as a [`SocketEvent`].
pub(crate) struct SocketHandle {
    addr: SocketAddr,
    outgoing: mpsc::UnboundedSender<Bytes>,
    queued: Arc<AtomicUsize>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SocketHandle {
    pub(crate) fn spawn(
        id: SocketId,
        addr: SocketAddr,
        stream: TcpStream,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> Self {
        let _ = stream.set_nodelay(true);
        let (mut read_half, mut write_half) = stream.into_split();
        let (outgoing, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let queued = Arc::new(AtomicUsize::new(0));

        let reader_events = events.clone();
        let reader = tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(READ_CHUNK);
            loop {
                buf.reserve(READ_CHUNK);
                let event = match read_half.read_buf(&mut buf).await {
                    Ok(0) => SocketEvent::Closed { id, error: None },
                    Ok(_) => SocketEvent::Data {
                        id,
                        data: buf.split().freeze(),
                    },
                    Err(error) => SocketEvent::Closed {
                        id,
                        error: Some(error),
                    },
                };
                let closed = matches!(event, SocketEvent::Closed { .. });
                if reader_events.send(event).is_err() || closed {
                    break;
                }
            }
        });

        let writer_queued = Arc::clone(&queued);
        let writer = tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if let Err(error) = write_half.write_all(&data).await {
                    let _ = events.send(SocketEvent::Closed {
                        id,
                        error: Some(error),
                    });
                    return;
                }
                let before = writer_queued.fetch_sub(data.len(), Ordering::AcqRel);
                if before == data.len() && events.send(SocketEvent::Flushed { id }).is_err() {
                    return;
                }
            }
            let _ = write_half.shutdown().await;
        });

        Self {
            addr,
            outgoing,
            queued,
            reader,
            writer,
        }
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queues bytes for writing. Returns false once the writer is gone.
    pub(crate) fn send(&self, data: Bytes) -> bool {
        let len = data.len();
        self.queued.fetch_add(len, Ordering::AcqRel);
        if self.outgoing.send(data).is_err() {
            self.queued.fetch_sub(len, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Bytes handed to the writer but not yet written.
    pub(crate) fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Stops reading and lets the writer drain what is queued. The returned
    /// handle completes once the write side is shut down.
    pub(crate) fn close(self) -> JoinHandle<()> {
        self.reader.abort();
        drop(self.outgoing);
        self.writer
    }
}
