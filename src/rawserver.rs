//! Event loop plumbing.
//!
//! [`RawServer`] multiplexes the listening socket, every peer socket and a
//! queue of timed tasks into a single stream of [`RawEvent`]s. The engine
//! awaits [`RawServer::next_event`] in a loop and handles one event at a
//! time, so nothing above this layer needs locking.
//!
//! Sockets run as a reader task and a writer task that only move bytes.
//! Outbound connects run on their own task and report back when done.

mod scheduler;
mod socket;

pub use scheduler::{TaskId, TaskQueue};
pub use socket::SocketId;

use socket::{SocketEvent, SocketHandle};

use crate::peer::Message;
use crate::session::ConnectPermit;
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Messages queued by the protocol layers, addressed by socket.
pub type Outgoing = Vec<(SocketId, Message)>;

#[derive(Debug)]
pub enum RawEvent<T> {
    Accepted {
        id: SocketId,
        addr: SocketAddr,
    },
    Connected {
        id: SocketId,
        addr: SocketAddr,
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
    Flushed {
        id: SocketId,
    },
    Closed {
        id: SocketId,
        error: Option<io::Error>,
    },
    Task(T),
}

enum Step {
    Accept(io::Result<(TcpStream, SocketAddr)>),
    Socket(SocketEvent),
    Timer,
}

pub struct RawServer<T> {
    listener: Option<TcpListener>,
    events_tx: mpsc::UnboundedSender<SocketEvent>,
    events_rx: mpsc::UnboundedReceiver<SocketEvent>,
    sockets: HashMap<SocketId, SocketHandle>,
    next_id: u64,
    tasks: TaskQueue<T>,
    closing: Vec<JoinHandle<()>>,
}

impl<T> RawServer<T> {
    /// A server without a listening socket; it only makes outbound
    /// connections.
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            listener: None,
            events_tx,
            events_rx,
            sockets: HashMap::new(),
            next_id: 0,
            tasks: TaskQueue::new(),
            closing: Vec::new(),
        }
    }

    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let mut server = Self::new();
        server.listener = Some(TcpListener::bind(addr).await?);
        Ok(server)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn schedule(&mut self, delay: Duration, task: T) -> TaskId {
        self.tasks.schedule_in(delay, task)
    }

    pub fn schedule_at(&mut self, deadline: Instant, task: T) -> TaskId {
        self.tasks.schedule(deadline, task)
    }

    pub fn cancel(&mut self, id: TaskId) -> bool {
        self.tasks.cancel(id)
    }

    /// Starts a TCP connect on a separate task. The result arrives as
    /// [`RawEvent::Connected`] or [`RawEvent::ConnectFailed`]; the permit
    /// travels with it.
    pub fn connect(&self, addr: SocketAddr, timeout: Duration, permit: Option<ConnectPermit>) {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let event = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => SocketEvent::Connected {
                    addr,
                    stream,
                    permit,
                },
                Ok(Err(error)) => SocketEvent::ConnectFailed { addr, error },
                Err(_) => SocketEvent::ConnectFailed {
                    addr,
                    error: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                },
            };
            let _ = events.send(event);
        });
    }

    pub fn send(&self, id: SocketId, data: Bytes) -> bool {
        self.sockets.get(&id).is_some_and(|s| s.send(data))
    }

    /// Bytes queued on a socket but not yet written.
    pub fn queued(&self, id: SocketId) -> usize {
        self.sockets.get(&id).map_or(0, |s| s.queued())
    }

    pub fn addr(&self, id: SocketId) -> Option<SocketAddr> {
        self.sockets.get(&id).map(|s| s.addr())
    }

    /// Closes a socket after its queued bytes are written. No further
    /// events are reported for it.
    pub fn close(&mut self, id: SocketId) {
        if let Some(socket) = self.sockets.remove(&id) {
            debug!("closing socket {} to {}", id, socket.addr());
            self.closing.retain(|h| !h.is_finished());
            self.closing.push(socket.close());
        }
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    fn register(&mut self, stream: TcpStream, addr: SocketAddr) -> SocketId {
        let id = SocketId(self.next_id);
        self.next_id += 1;
        let handle = SocketHandle::spawn(id, addr, stream, self.events_tx.clone());
        self.sockets.insert(id, handle);
        id
    }

    /// Waits for the next event: a due task, an accepted or connected
    /// socket, incoming bytes or a socket closing.
    pub async fn next_event(&mut self) -> RawEvent<T> {
        loop {
            if let Some(task) = self.tasks.pop_due(Instant::now()) {
                return RawEvent::Task(task);
            }
            let deadline = self.tasks.next_deadline();
            let sleep_until = deadline.map(tokio::time::Instant::from_std);

            let step = tokio::select! {
                accepted = accept(self.listener.as_ref()) => Step::Accept(accepted),
                Some(event) = self.events_rx.recv() => Step::Socket(event),
                _ = sleep(sleep_until) => Step::Timer,
            };

            match step {
                Step::Accept(Ok((stream, addr))) => {
                    let id = self.register(stream, addr);
                    return RawEvent::Accepted { id, addr };
                }
                Step::Accept(Err(e)) => {
                    warn!("accept failed: {}", e);
                }
                Step::Socket(SocketEvent::Connected {
                    addr,
                    stream,
                    permit,
                }) => {
                    let id = self.register(stream, addr);
                    return RawEvent::Connected { id, addr, permit };
                }
                Step::Socket(SocketEvent::ConnectFailed { addr, error }) => {
                    return RawEvent::ConnectFailed { addr, error };
                }
                Step::Socket(SocketEvent::Data { id, data }) if self.sockets.contains_key(&id) => {
                    return RawEvent::Data { id, data };
                }
                Step::Socket(SocketEvent::Flushed { id }) if self.sockets.contains_key(&id) => {
                    return RawEvent::Flushed { id };
                }
                Step::Socket(SocketEvent::Closed { id, error }) => {
                    if let Some(socket) = self.sockets.remove(&id) {
                        self.closing.push(socket.close());
                        return RawEvent::Closed { id, error };
                    }
                }
                Step::Socket(_) | Step::Timer => {}
            }
        }
    }

    /// Closes every socket and the listener, then waits up to `grace` for
    /// queued writes to finish.
    pub async fn shutdown(&mut self, grace: Duration) {
        self.listener = None;
        let ids: Vec<SocketId> = self.sockets.keys().copied().collect();
        for id in ids {
            self.close(id);
        }
        let handles = std::mem::take(&mut self.closing);
        if tokio::time::timeout(grace, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("socket writers still busy after {:?}", grace);
        }
    }
}

impl<T> Default for RawServer<T> {
    fn default() -> Self {
        Self::new()
    }
}

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn sleep(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests;
