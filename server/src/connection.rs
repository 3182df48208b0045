//! Non-blocking connection handling and the per-loop multiplexer registry.
//!
//! Each server loop (authentication, queue, one per game session) owns a
//! [`ConnSet`] holding the connections currently registered with it. A
//! connection is "moved" between loops by deregistering it from the source
//! set, which yields the owned [`Connection`] without closing the socket,
//! and sending it over the destination loop's intake channel. The socket is
//! closed only when the `Connection` is dropped on logout, quit or timeout.

use log::warn;
use shared::{encode_frame, FrameBuffer, Message};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpStream;

/// How often each loop sweeps its registered connections for readable data
/// and runs housekeeping. Loops never block on an individual socket.
pub const POLL_INTERVAL_MS: u64 = 10;

/// Ceiling on outbound bytes buffered for one connection. A peer that
/// stops reading long enough to pile up this much is dropped instead of
/// being allowed to stall the loop that owns it.
pub const MAX_OUTBOX_BYTES: usize = 256 * 1024;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Something a connection produced during a readiness sweep.
#[derive(Debug)]
pub enum Event {
    /// A complete frame was decoded.
    Message(Message),
    /// The peer disconnected (end-of-stream, reset, or a protocol
    /// violation that forces a drop). The handler must deregister.
    Closed,
}

/// One live client socket plus its decode state.
///
/// The id is stable for the lifetime of the TCP connection and is what the
/// player directory binds identity to while the socket migrates between
/// loops.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    stream: TcpStream,
    buffer: FrameBuffer,
    outbox: Vec<u8>,
}

impl Connection {
    /// Wraps an accepted stream and assigns it a fresh connection id.
    pub fn new(stream: TcpStream) -> Self {
        Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            stream,
            buffer: FrameBuffer::new(),
            outbox: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queues one framed message and writes as much as the socket will
    /// take right now.
    ///
    /// Never waits on the peer: bytes the kernel does not accept stay in
    /// the outbound buffer and are retried on every sweep. Fails when the
    /// buffer outgrows [`MAX_OUTBOX_BYTES`], meaning the peer has stopped
    /// reading; the caller drops the connection.
    pub fn send(&mut self, message: &Message) -> io::Result<()> {
        let frame = encode_frame(message)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.outbox.extend_from_slice(&frame);
        self.try_flush()?;
        if self.outbox.len() > MAX_OUTBOX_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "outbound buffer overflow",
            ));
        }
        Ok(())
    }

    /// Writes buffered outbound bytes until the socket would block.
    fn try_flush(&mut self) -> io::Result<()> {
        while !self.outbox.is_empty() {
            match self.stream.try_write(&self.outbox) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket closed while flushing",
                    ));
                }
                Ok(n) => {
                    self.outbox.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Outbound bytes queued but not yet accepted by the kernel.
    pub fn pending_outbound(&self) -> usize {
        self.outbox.len()
    }

    /// Drains everything currently readable without blocking.
    ///
    /// Retries any buffered outbound bytes first, then performs `try_read`
    /// until the socket would block and decodes as many complete frames as
    /// the buffered bytes hold. A would-block with no full frame yields an
    /// empty event list; end-of-stream, reset, malformed frames and a
    /// failed or overflowing outbound flush all yield a terminal
    /// [`Event::Closed`].
    pub fn drain_events(&mut self) -> Vec<Event> {
        if self.try_flush().is_err() || self.outbox.len() > MAX_OUTBOX_BYTES {
            warn!("conn {}: outbound flush failed, dropping", self.id);
            return vec![Event::Closed];
        }

        let mut events = Vec::new();
        let mut chunk = [0u8; 4096];
        let mut closed = false;

        loop {
            match self.stream.try_read(&mut chunk) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => self.buffer.extend(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("conn {}: read failed: {}", self.id, e);
                    closed = true;
                    break;
                }
            }
        }

        loop {
            match self.buffer.next_frame() {
                Ok(Some(message)) => events.push(Event::Message(message)),
                Ok(None) => break,
                Err(e) => {
                    warn!("conn {}: dropping connection: {}", self.id, e);
                    closed = true;
                    break;
                }
            }
        }

        if closed {
            events.push(Event::Closed);
        }
        events
    }
}

/// Registry of connections owned by one loop instance.
pub struct ConnSet {
    conns: HashMap<u64, Connection>,
}

impl ConnSet {
    pub fn new() -> Self {
        Self {
            conns: HashMap::new(),
        }
    }

    /// Registers a connection for read interest on this loop.
    pub fn register(&mut self, conn: Connection) {
        self.conns.insert(conn.id(), conn);
    }

    /// Cancels interest without closing the socket.
    ///
    /// Returns the owned connection so the caller can hand it to another
    /// loop or drop it (which closes the socket).
    pub fn deregister(&mut self, id: u64) -> Option<Connection> {
        self.conns.remove(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Sweeps every registered connection and collects its events.
    pub fn poll(&mut self) -> Vec<(u64, Event)> {
        let mut all = Vec::new();
        for (id, conn) in self.conns.iter_mut() {
            for event in conn.drain_events() {
                all.push((*id, event));
            }
        }
        all
    }

    /// Sends a message to every registered connection, optionally skipping
    /// one. Delivery is best-effort; a failed write surfaces as a `Closed`
    /// event on the next sweep.
    pub fn broadcast(&mut self, message: &Message, exclude: Option<u64>) {
        for (id, conn) in self.conns.iter_mut() {
            if Some(*id) == exclude {
                continue;
            }
            if let Err(e) = conn.send(message) {
                warn!("conn {}: broadcast failed: {}", id, e);
            }
        }
    }
}

impl Default for ConnSet {
    fn default() -> Self {
        Self::new()
    }
}
