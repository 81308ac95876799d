//! TCP transport
//!
//! Listens, dials, and runs one read loop per established connection. The
//! read loop classifies each frame by its leading tag byte: control payloads
//! are published on the inbound channel, stream tags park the loop on the
//! peer's barrier so the file server can read the socket exclusively.

use super::message::{Rpc, CONTROL_TAG, MAX_CONTROL_FRAME, STREAM_TAG};
use super::peer::TcpPeer;
use super::{OnPeerClosedFn, OnPeerFn, TransportError, TransportResult};
use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

/// Connection-setup hook, run before a peer is registered. The default
/// accepts everyone.
pub type HandshakeFn = fn(&TcpPeer) -> TransportResult<()>;

/// No-op handshake; peers are not authenticated.
pub fn nop_handshake(_peer: &TcpPeer) -> TransportResult<()> {
    Ok(())
}

/// TCP transport configuration
pub struct TcpTransportOpts {
    /// Address to listen on, `:port` or `host:port`
    pub listen_addr: String,
    pub handshake: HandshakeFn,
    /// Invoked for every new connection after the handshake
    pub on_peer: Option<OnPeerFn>,
    /// Invoked when a peer's read loop terminates
    pub on_peer_closed: Option<OnPeerClosedFn>,
}

/// TCP listener plus dialler
pub struct TcpTransport {
    opts: TcpTransportOpts,
    rpc_tx: Sender<Rpc>,
    rpc_rx: Mutex<Option<Receiver<Rpc>>>,
    listener: Mutex<Option<TcpListener>>,
    closed: AtomicBool,
}

fn listen_addr_of(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

fn dial_addr_of(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("127.0.0.1{}", addr)
    } else {
        addr.to_string()
    }
}

impl TcpTransport {
    pub fn new(opts: TcpTransportOpts) -> Arc<Self> {
        let (rpc_tx, rpc_rx) = mpsc::channel();
        Arc::new(Self {
            opts,
            rpc_tx,
            rpc_rx: Mutex::new(Some(rpc_rx)),
            listener: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// The address this transport accepts connections on.
    pub fn addr(&self) -> &str {
        &self.opts.listen_addr
    }

    /// Take the inbound RPC channel. Yields `None` after the first call.
    pub fn take_inbox(&self) -> Option<Receiver<Rpc>> {
        self.rpc_rx.lock().unwrap().take()
    }

    /// Bind the listen address and start the accept loop.
    pub fn listen_and_accept(self: &Arc<Self>) -> TransportResult<()> {
        let listener = TcpListener::bind(listen_addr_of(&self.opts.listen_addr))?;
        let accept_listener = listener.try_clone()?;
        *self.listener.lock().unwrap() = Some(listener);

        let transport = Arc::clone(self);
        thread::spawn(move || transport.accept_loop(accept_listener));

        log::info!("[{}] transport listening", self.opts.listen_addr);
        Ok(())
    }

    /// Connect out to a remote node.
    pub fn dial(self: &Arc<Self>, addr: &str) -> TransportResult<()> {
        let stream = TcpStream::connect(dial_addr_of(addr))?;
        let transport = Arc::clone(self);
        thread::spawn(move || transport.handle_conn(stream, true));
        Ok(())
    }

    /// Stop accepting connections. Peer read loops terminate when their
    /// sockets are closed by the peer registry.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake the accept loop so it observes the flag
        let local = self
            .listener
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|l| l.local_addr().ok());
        if let Some(addr) = local {
            let _ = TcpStream::connect(addr);
        }
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        for stream in listener.incoming() {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => {
                    let transport = Arc::clone(&self);
                    thread::spawn(move || transport.handle_conn(stream, false));
                }
                Err(e) => {
                    log::warn!("[{}] accept error: {}", self.opts.listen_addr, e);
                }
            }
        }
        log::debug!("[{}] accept loop terminated", self.opts.listen_addr);
    }

    fn handle_conn(self: Arc<Self>, stream: TcpStream, outbound: bool) {
        let peer = match stream.try_clone().and_then(|dup| TcpPeer::new(dup, outbound)) {
            Ok(peer) => Arc::new(peer),
            Err(e) => {
                log::warn!("[{}] dropping connection: {}", self.opts.listen_addr, e);
                return;
            }
        };
        let remote = peer.remote_addr().to_string();

        if let Err(e) = (self.opts.handshake)(&peer) {
            log::warn!("[{}] handshake with {} failed: {}", self.opts.listen_addr, remote, e);
            return;
        }

        if let Some(on_peer) = &self.opts.on_peer {
            if let Err(e) = on_peer(Arc::clone(&peer)) {
                log::warn!("[{}] peer {} rejected: {}", self.opts.listen_addr, remote, e);
                return;
            }
        }

        self.read_loop(stream, &peer);

        peer.close();
        if let Some(on_peer_closed) = &self.opts.on_peer_closed {
            on_peer_closed(&remote);
        }
        log::info!("[{}] dropped peer connection {}", self.opts.listen_addr, remote);
    }

    // The socket is read raw, never through a buffered reader: after a
    // stream tag the remaining bytes belong to the file server.
    fn read_loop(&self, stream: TcpStream, peer: &Arc<TcpPeer>) {
        let remote = peer.remote_addr().to_string();

        loop {
            let mut tag = [0u8; 1];
            if let Err(e) = (&stream).read_exact(&mut tag) {
                // The file server may hold a temporary read timeout on the
                // shared socket while consulting this peer; retry.
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) {
                    continue;
                }
                log::debug!("[{}] read loop for {} ended: {}", self.opts.listen_addr, remote, e);
                return;
            }

            match tag[0] {
                STREAM_TAG => {
                    // Arm the barrier before publishing so a fast consumer
                    // cannot release a stream we have not parked on yet.
                    peer.barrier().begin();
                    let rpc = Rpc {
                        from: remote.clone(),
                        payload: Vec::new(),
                        stream: true,
                    };
                    if self.rpc_tx.send(rpc).is_err() {
                        return;
                    }
                    log::debug!("[{}] incoming stream from {}", self.opts.listen_addr, remote);
                    peer.barrier().wait();
                    log::debug!("[{}] stream from {} done", self.opts.listen_addr, remote);
                }
                CONTROL_TAG => {
                    let mut buf = vec![0u8; MAX_CONTROL_FRAME];
                    let n = loop {
                        match (&stream).read(&mut buf) {
                            Ok(0) => return,
                            Ok(n) => break n,
                            Err(e)
                                if matches!(
                                    e.kind(),
                                    std::io::ErrorKind::WouldBlock
                                        | std::io::ErrorKind::TimedOut
                                ) =>
                            {
                                continue;
                            }
                            Err(e) => {
                                log::debug!(
                                    "[{}] read loop for {} ended: {}",
                                    self.opts.listen_addr,
                                    remote,
                                    e
                                );
                                return;
                            }
                        }
                    };
                    buf.truncate(n);
                    let rpc = Rpc {
                        from: remote.clone(),
                        payload: buf,
                        stream: false,
                    };
                    if self.rpc_tx.send(rpc).is_err() {
                        return;
                    }
                }
                other => {
                    log::warn!(
                        "[{}] protocol violation from {}: unknown frame tag {:#x}",
                        self.opts.listen_addr,
                        remote,
                        other
                    );
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("listen_addr", &self.opts.listen_addr)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}
