//! Peer handle
//!
//! A connected remote node: a duplicated socket handle safe to write from
//! any thread, plus the stream barrier that parks the peer's read loop while
//! the file server consumes a raw stream straight off the socket.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Condvar, Mutex};

/// Single-slot completion signal. The read loop `begin`s and `wait`s; the
/// stream consumer `complete`s. At most one stream is in flight per peer.
pub struct StreamBarrier {
    pending: Mutex<u32>,
    cond: Condvar,
}

impl StreamBarrier {
    fn new() -> Self {
        Self {
            pending: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn begin(&self) {
        *self.pending.lock().unwrap() += 1;
    }

    /// Block until every pending stream has been completed.
    pub fn wait(&self) {
        let mut pending = self.pending.lock().unwrap();
        while *pending > 0 {
            pending = self.cond.wait(pending).unwrap();
        }
    }

    /// Release one pending stream. Completing an idle barrier is a no-op.
    pub fn complete(&self) {
        let mut pending = self.pending.lock().unwrap();
        if *pending > 0 {
            *pending -= 1;
        }
        self.cond.notify_all();
    }
}

/// A remote node over an established TCP connection.
pub struct TcpPeer {
    stream: TcpStream,
    remote_addr: String,
    outbound: bool,
    barrier: StreamBarrier,
}

impl TcpPeer {
    /// Wrap a connected socket. `outbound` is true when we dialled the peer,
    /// false when we accepted it.
    pub fn new(stream: TcpStream, outbound: bool) -> io::Result<Self> {
        let remote_addr = stream.peer_addr()?.to_string();
        Ok(Self {
            stream,
            remote_addr,
            outbound,
            barrier: StreamBarrier::new(),
        })
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub fn barrier(&self) -> &StreamBarrier {
        &self.barrier
    }

    /// Write raw bytes to the peer. Callers frame their own traffic; no tag
    /// byte is added here.
    pub fn send(&self, data: &[u8]) -> io::Result<()> {
        (&self.stream).write_all(data)
    }

    /// Signal that the raw stream currently being consumed from this peer's
    /// socket is finished, releasing its parked read loop.
    pub fn close_stream(&self) {
        self.barrier.complete();
    }

    /// Bound reads on this peer's socket. Applies to the shared connection,
    /// so only hold a timeout while consuming a stream directly.
    pub fn set_read_timeout(&self, timeout: Option<std::time::Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    /// Shut the connection down; the peer's read loop terminates on its next
    /// socket operation.
    pub fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Reads consume the peer's socket directly; used by the file server while
/// the peer's read loop is parked on the stream barrier.
impl Read for &TcpPeer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }
}

/// Writes go straight to the peer's socket, unframed, like [`TcpPeer::send`].
impl Write for &TcpPeer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.stream).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&self.stream).flush()
    }
}
