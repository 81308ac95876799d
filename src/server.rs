//! File server
//!
//! Dispatches inbound peer RPCs and implements the replication protocols:
//! store-fanout, pull-on-miss, and broadcast-delete. One server owns one
//! node identity, one blob store, one metadata index and one transport.

use crate::crypto::{self, CryptoError, IV_SIZE};
use crate::meta::{FileMetadata, MetaError, MetadataStore};
use crate::p2p::{
    nop_handshake, Message, PeerRegistry, Rpc, TcpPeer, TcpTransport, TcpTransportOpts,
    TransportError, CONTROL_TAG, STREAM_TAG,
};
use crate::store::{PathTransform, Store, StoreError};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use rand::Rng;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Pause between announcing a store and streaming its bytes, so peers can
/// arm their stream readers
const STREAM_ARM_DELAY: Duration = Duration::from_millis(5);

/// Pause between a network fetch broadcast and reading peer responses
const FETCH_RESPONSE_DELAY: Duration = Duration::from_millis(500);

/// Bound on waiting for a single peer's fetch response; peers holding
/// nothing never answer
const FETCH_READ_TIMEOUT: Duration = Duration::from_secs(2);

const BOOTSTRAP_MAX_ATTEMPTS: u32 = 3;
const BOOTSTRAP_INITIAL_DELAY: Duration = Duration::from_secs(2);
const BOOTSTRAP_MAX_JITTER_MS: u64 = 1000;

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("({0}) does not exist on disk")]
    NotFoundLocally(String),

    #[error("received message from unknown peer: {0}")]
    PeerUnknown(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("metadata error: {0}")]
    Meta(#[from] MetaError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("message encoding error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for server operations
pub type ServerResult<T> = Result<T, ServerError>;

/// File server configuration
pub struct FileServerOpts {
    /// Node identity; generated when empty
    pub id: String,
    /// 32-byte fan-out encryption key
    pub enc_key: Vec<u8>,
    pub listen_addr: String,
    pub storage_root: PathBuf,
    pub path_transform: PathTransform,
    pub bootstrap_nodes: Vec<String>,
    pub db_file: PathBuf,
}

/// A node of the store: accepts client operations and replicates them
/// across its connected peers.
pub struct FileServer {
    id: String,
    enc_key: Vec<u8>,
    addr: String,
    bootstrap_nodes: Vec<String>,
    store: Store,
    meta: Arc<MetadataStore>,
    peers: PeerRegistry,
    transport: Arc<TcpTransport>,
    inbox: Mutex<Option<Receiver<Rpc>>>,
    quit: AtomicBool,
}

impl FileServer {
    pub fn new(opts: FileServerOpts) -> ServerResult<Arc<Self>> {
        let id = if opts.id.is_empty() {
            crypto::generate_id()
        } else {
            opts.id
        };

        let meta = Arc::new(MetadataStore::open(&id, &opts.db_file)?);
        let store = Store::new(opts.storage_root, opts.path_transform, Arc::clone(&meta));

        let peers = PeerRegistry::new();
        let on_peer_registry = peers.clone();
        let on_closed_registry = peers.clone();

        let transport = TcpTransport::new(TcpTransportOpts {
            listen_addr: opts.listen_addr.clone(),
            handshake: nop_handshake,
            on_peer: Some(Arc::new(move |peer| {
                on_peer_registry.add(peer);
                Ok(())
            })),
            on_peer_closed: Some(Arc::new(move |addr| {
                on_closed_registry.remove(addr);
            })),
        });
        let inbox = transport.take_inbox();

        Ok(Arc::new(Self {
            id,
            enc_key: opts.enc_key,
            addr: opts.listen_addr,
            bootstrap_nodes: opts.bootstrap_nodes,
            store,
            meta,
            peers,
            transport,
            inbox: Mutex::new(inbox),
            quit: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Direct access to this node's blob store (local-only operations).
    pub fn local_store(&self) -> &Store {
        &self.store
    }

    /// Start listening, dial the bootstrap nodes, then run the inbound
    /// dispatch loop until [`stop`](Self::stop) is called.
    pub fn start(&self) -> ServerResult<()> {
        log::info!("[{}] starting server", self.addr);
        self.transport.listen_and_accept()?;
        self.bootstrap_network();
        self.run_loop();
        Ok(())
    }

    /// Signal shutdown: the dispatch loop exits, the metadata index closes,
    /// every peer socket and the listener are torn down.
    pub fn stop(&self) {
        self.quit.store(true, Ordering::SeqCst);
        self.meta.close();
        self.peers.close_all();
        self.transport.close();
    }

    /// Store a file locally, fan the encrypted payload out to every
    /// connected peer, and record the replica set in the metadata index.
    pub fn store_file<R: Read>(&self, key: &str, r: &mut R) -> ServerResult<()> {
        // One pass over the input: plaintext to the local store, a copy
        // kept in memory for the encrypted fan-out.
        let mut file_buffer = Vec::new();
        let mut tee = TeeReader::new(r, &mut file_buffer);
        let size = self.store.write(&self.id, key, &mut tee)?;

        self.broadcast(&Message::StoreFile {
            owner_id: self.id.clone(),
            hashed_key: crypto::hash_key(key),
            size: size + IV_SIZE as u64,
        })?;

        thread::sleep(STREAM_ARM_DELAY);

        let peers = self.peers.snapshot();
        let mut fanout = PeerMultiWriter::new(&peers, &self.addr);
        fanout.write_all(&[STREAM_TAG])?;
        let mut plaintext: &[u8] = &file_buffer;
        let n = crypto::copy_encrypt(&self.enc_key, &mut plaintext, &mut fanout)?;

        let mut replica_locations = vec![self.addr.clone()];
        replica_locations.extend(peers.iter().map(|p| p.remote_addr().to_string()));

        self.meta.upsert(&FileMetadata {
            key: key.to_string(),
            size: size + IV_SIZE as u64,
            replicas: peers.len() as u32 + 1,
            replica_locations,
        })?;

        log::info!("[{}] stored ({}) and fanned out {} bytes", self.addr, key, n);
        Ok(())
    }

    /// Fetch a file: served from the local store when present, otherwise
    /// pulled from the network, decrypted to disk, and served from there.
    pub fn get_file(&self, key: &str) -> ServerResult<(u64, Box<dyn Read + Send>)> {
        if self.store.has(&self.id, key) {
            log::info!("[{}] serving ({}) locally", self.addr, key);
            return Ok(self.store.read(&self.id, key)?);
        }

        log::info!("[{}] ({}) not held locally, fetching from network", self.addr, key);

        self.broadcast(&Message::GetFile {
            owner_id: self.id.clone(),
            hashed_key: crypto::hash_key(key),
        })?;

        thread::sleep(FETCH_RESPONSE_DELAY);

        // Every responding peer is drained in turn; the last response wins.
        for peer in self.peers.snapshot() {
            if let Err(e) = self.pull_from_peer(&peer, key) {
                log::warn!(
                    "[{}] fetch of ({}) from {} failed: {}",
                    self.addr,
                    key,
                    peer.remote_addr(),
                    e
                );
            }
            peer.close_stream();
        }

        let (size, reader) = self.store.read(&self.id, key)?;
        if let Err(e) = self.meta.add_local_replica(key, &self.addr) {
            log::warn!("[{}] error updating metadata for ({}): {}", self.addr, key, e);
        }
        Ok((size, reader))
    }

    fn pull_from_peer(&self, peer: &Arc<TcpPeer>, key: &str) -> ServerResult<()> {
        // A peer that holds nothing never answers; bound the wait so the
        // fetch can fall through to the local NotFound.
        peer.set_read_timeout(Some(FETCH_READ_TIMEOUT))?;
        let result = (|| -> ServerResult<()> {
            let mut reader = peer.as_ref();
            let file_size = reader.read_u64::<LittleEndian>()?;
            let mut limited = reader.take(file_size);
            let n = self
                .store
                .write_decrypt(&self.enc_key, &self.id, key, &mut limited)?;
            log::info!(
                "[{}] received {} bytes for ({}) from {}",
                self.addr,
                n,
                key,
                peer.remote_addr()
            );
            Ok(())
        })();
        peer.set_read_timeout(None)?;
        result
    }

    /// Delete a file cluster-wide: peers drop their replicas, then the local
    /// blob and metadata entry are removed.
    pub fn delete_file(&self, key: &str) -> ServerResult<()> {
        log::info!("[{}] broadcasting delete for ({})", self.addr, key);
        self.broadcast(&Message::DeleteFile {
            owner_id: self.id.clone(),
            hashed_key: crypto::hash_key(key),
        })?;

        if !self.store.has(&self.id, key) {
            // Scrub any stale metadata left behind by a crashed delete
            if let Err(e) = self.meta.delete(key) {
                log::debug!("[{}] no stale metadata for ({}): {}", self.addr, key, e);
            }
            return Err(ServerError::NotFoundLocally(key.to_string()));
        }

        self.meta.delete(key)?;
        self.store.delete(&self.id, key)?;
        log::info!("[{}] deleted ({}) locally", self.addr, key);
        Ok(())
    }

    /// Remove only this node's copy: one replica record and the local blob.
    pub fn delete_local(&self, key: &str) -> ServerResult<()> {
        self.store.delete(&self.id, key)?;
        Ok(())
    }

    /// All files recorded in this node's metadata namespace.
    pub fn list_files(&self) -> ServerResult<Vec<FileMetadata>> {
        Ok(self.meta.list()?)
    }

    /// Encode a control message and send it, tag byte first, to every
    /// connected peer. Per-peer failures are logged, never fatal.
    fn broadcast(&self, msg: &Message) -> ServerResult<()> {
        let buf = msg.encode()?;
        for peer in self.peers.snapshot() {
            if let Err(e) = peer
                .send(&[CONTROL_TAG])
                .and_then(|_| peer.send(&buf))
            {
                log::warn!(
                    "[{}] broadcast to {} failed: {}",
                    self.addr,
                    peer.remote_addr(),
                    e
                );
            }
        }
        Ok(())
    }

    fn run_loop(&self) {
        let inbox = match self.inbox.lock().unwrap().take() {
            Some(inbox) => inbox,
            None => return,
        };

        loop {
            if self.quit.load(Ordering::SeqCst) {
                break;
            }
            match inbox.recv_timeout(Duration::from_millis(200)) {
                Ok(rpc) => {
                    if rpc.stream {
                        // The paired control handler consumes the socket
                        continue;
                    }
                    match Message::decode(&rpc.payload) {
                        Ok(msg) => {
                            if let Err(e) = self.handle_message(&rpc.from, &msg) {
                                log::warn!("[{}] failed to handle message: {}", self.addr, e);
                            }
                        }
                        Err(e) => {
                            log::warn!("[{}] failed to decode payload: {}", self.addr, e);
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        log::info!("[{}] shutting down", self.addr);
        self.transport.close();
    }

    fn handle_message(&self, from: &str, msg: &Message) -> ServerResult<()> {
        match msg {
            Message::StoreFile {
                owner_id,
                hashed_key,
                size,
            } => self.handle_store_file(from, owner_id, hashed_key, *size),
            Message::GetFile {
                owner_id,
                hashed_key,
            } => self.handle_get_file(from, owner_id, hashed_key),
            Message::DeleteFile {
                owner_id,
                hashed_key,
            } => self.handle_delete_file(from, owner_id, hashed_key),
        }
    }

    /// A peer is about to stream `size` bytes for `(owner_id, hashed_key)`:
    /// read exactly that many off its socket and store them verbatim (the
    /// replica keeps the IV-prefixed ciphertext as-is).
    fn handle_store_file(
        &self,
        from: &str,
        owner_id: &str,
        hashed_key: &str,
        size: u64,
    ) -> ServerResult<()> {
        let peer = self
            .peers
            .get(from)
            .ok_or_else(|| ServerError::PeerUnknown(from.to_string()))?;

        let mut limited = peer.as_ref().take(size);
        let n = self.store.write(owner_id, hashed_key, &mut limited)?;
        log::info!("[{}] wrote {} bytes to disk for {}", self.addr, n, from);

        peer.close_stream();
        Ok(())
    }

    /// A peer asked for `(owner_id, hashed_key)`: if held, stream it back as
    /// a raw frame of `size (u64 le) || bytes`.
    fn handle_get_file(&self, from: &str, owner_id: &str, hashed_key: &str) -> ServerResult<()> {
        if !self.store.has(owner_id, hashed_key) {
            return Err(ServerError::NotFoundLocally(hashed_key.to_string()));
        }

        log::info!("[{}] serving ({}) to peer {}", self.addr, hashed_key, from);
        let (file_size, mut reader) = self.store.read(owner_id, hashed_key)?;

        let peer = self
            .peers
            .get(from)
            .ok_or_else(|| ServerError::PeerUnknown(from.to_string()))?;

        peer.send(&[STREAM_TAG])?;
        let mut size_buf = [0u8; 8];
        LittleEndian::write_u64(&mut size_buf, file_size);
        peer.send(&size_buf)?;

        let mut writer = peer.as_ref();
        let n = io::copy(&mut reader, &mut writer)?;
        log::info!("[{}] wrote {} bytes to peer {}", self.addr, n, from);
        Ok(())
    }

    fn handle_delete_file(&self, from: &str, owner_id: &str, hashed_key: &str) -> ServerResult<()> {
        if !self.store.has(owner_id, hashed_key) {
            log::debug!(
                "[{}] delete of ({}) requested by {}, nothing held",
                self.addr,
                hashed_key,
                from
            );
            return Ok(());
        }

        log::info!("[{}] deleting ({}) on request from {}", self.addr, hashed_key, from);
        self.store.delete(owner_id, hashed_key)?;
        Ok(())
    }

    /// Dial every bootstrap node with exponential backoff. Failures are
    /// logged and never abort the node.
    fn bootstrap_network(&self) {
        for addr in &self.bootstrap_nodes {
            if addr.is_empty() {
                continue;
            }

            let mut delay = BOOTSTRAP_INITIAL_DELAY;
            let mut last_err = None;

            for attempt in 1..=BOOTSTRAP_MAX_ATTEMPTS {
                log::info!("[{}] dialing {} (attempt {})", self.addr, addr, attempt);
                match self.transport.dial(addr) {
                    Ok(()) => {
                        last_err = None;
                        break;
                    }
                    Err(e) => {
                        log::warn!(
                            "[{}] failed to dial {}: {} (retrying in {:?})",
                            self.addr,
                            addr,
                            e,
                            delay
                        );
                        last_err = Some(e);
                        if attempt < BOOTSTRAP_MAX_ATTEMPTS {
                            thread::sleep(delay);
                            let jitter = rand::thread_rng().gen_range(0..BOOTSTRAP_MAX_JITTER_MS);
                            delay = delay * 2 + Duration::from_millis(jitter);
                        }
                    }
                }
            }

            if let Some(e) = last_err {
                log::warn!(
                    "[{}] giving up on {} after {} attempts: {}",
                    self.addr,
                    addr,
                    BOOTSTRAP_MAX_ATTEMPTS,
                    e
                );
            }
        }
    }
}

/// Copies everything read from `inner` into `buf` as a side effect.
struct TeeReader<'a, R> {
    inner: &'a mut R,
    buf: &'a mut Vec<u8>,
}

impl<'a, R: Read> TeeReader<'a, R> {
    fn new(inner: &'a mut R, buf: &'a mut Vec<u8>) -> Self {
        Self { inner, buf }
    }
}

impl<R: Read> Read for TeeReader<'_, R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(out)?;
        self.buf.extend_from_slice(&out[..n]);
        Ok(n)
    }
}

/// Writes the same bytes serially to every peer. A failing peer is logged
/// and skipped for the rest of the fan-out; the write itself never errors,
/// matching the best-effort broadcast policy.
struct PeerMultiWriter<'a> {
    peers: &'a [Arc<TcpPeer>],
    failed: Vec<bool>,
    addr: &'a str,
}

impl<'a> PeerMultiWriter<'a> {
    fn new(peers: &'a [Arc<TcpPeer>], addr: &'a str) -> Self {
        Self {
            peers,
            failed: vec![false; peers.len()],
            addr,
        }
    }
}

impl Write for PeerMultiWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for (i, peer) in self.peers.iter().enumerate() {
            if self.failed[i] {
                continue;
            }
            if let Err(e) = peer.send(buf) {
                log::warn!(
                    "[{}] fan-out to {} failed: {}",
                    self.addr,
                    peer.remote_addr(),
                    e
                );
                self.failed[i] = true;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
