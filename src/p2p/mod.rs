//! Peer-to-peer networking
//!
//! Message framing, the TCP transport with its per-peer read loops, and the
//! registry of live peers.

pub mod message;
pub mod peer;
pub mod transport;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub use message::{Message, Rpc, CONTROL_TAG, MAX_CONTROL_FRAME, STREAM_TAG};
pub use peer::{StreamBarrier, TcpPeer};
pub use transport::{nop_handshake, HandshakeFn, TcpTransport, TcpTransportOpts};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer rejected: {0}")]
    Rejected(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Invoked for every freshly-connected peer; an error aborts the connection.
pub type OnPeerFn = Arc<dyn Fn(Arc<TcpPeer>) -> TransportResult<()> + Send + Sync>;

/// Invoked with the remote address when a peer's read loop terminates.
pub type OnPeerClosedFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Thread-safe map of live peers by remote address. Iteration snapshots the
/// set under the lock; peer I/O happens after unlock.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<TcpPeer>>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, peer: Arc<TcpPeer>) {
        let addr = peer.remote_addr().to_string();
        log::info!("connected with remote {}", addr);
        self.inner.lock().unwrap().insert(addr, peer);
    }

    pub fn remove(&self, addr: &str) {
        self.inner.lock().unwrap().remove(addr);
    }

    pub fn get(&self, addr: &str) -> Option<Arc<TcpPeer>> {
        self.inner.lock().unwrap().get(addr).cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<TcpPeer>> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every peer socket and clear the map.
    pub fn close_all(&self) {
        let peers: Vec<_> = {
            let mut map = self.inner.lock().unwrap();
            map.drain().map(|(_, peer)| peer).collect()
        };
        for peer in peers {
            peer.close();
        }
    }
}
