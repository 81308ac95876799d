//! loomfs - a peer-to-peer content-addressed file store
//!
//! A small cluster of nodes cooperate so that any node can accept a stored
//! file, fan the encrypted payload out to its connected peers, and later
//! serve it from local disk or by pulling a replica back from the network.
//! Blobs are content-addressed on disk and namespaced per node identity; a
//! per-node SQLite index tracks replica locations for each key.

pub mod config;
pub mod crypto;
pub mod meta;
pub mod p2p;
pub mod server;
pub mod shell;
pub mod store;

pub use config::{ConfigError, NodeConfig};
pub use meta::{FileMetadata, MetadataStore};
pub use server::{FileServer, FileServerOpts, ServerError};
pub use store::{cas_path_transform, default_path_transform, PathKey, Store};
