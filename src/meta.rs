//! Metadata index
//!
//! Persistent mapping of hashed logical keys to replica book-keeping, one
//! SQLite file per node. Every owner id gets an isolated namespace inside the
//! file, so nodes sharing a database never see each other's entries.

use crate::crypto;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

/// Metadata errors
#[derive(Debug, Error)]
pub enum MetaError {
    #[error("file not found")]
    NotFound,

    #[error("owner namespace not found")]
    NamespaceMissing,

    #[error("replica count would become negative")]
    NegativeReplicas,

    #[error("metadata store is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("metadata encoding error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Result type for metadata operations
pub type MetaResult<T> = Result<T, MetaError>;

/// Replica book-keeping for one stored file.
///
/// `replica_locations` is ordered most-recent-first: adds prepend, removes
/// pop the front. `replicas` always equals the location count while the
/// entry exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub key: String,
    pub size: u64,
    pub replicas: u32,
    pub replica_locations: Vec<String>,
}

/// Persistent `(owner, hashed key) -> FileMetadata` index.
pub struct MetadataStore {
    conn: Mutex<Option<Connection>>,
    owner: String,
}

impl MetadataStore {
    /// Open (or create) the index file and bind it to an owner namespace.
    pub fn open<P: AsRef<Path>>(owner: &str, db_file: P) -> MetaResult<Self> {
        let db_file = db_file.as_ref();
        if let Some(parent) = db_file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_file)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS files (
                 owner      TEXT NOT NULL,
                 hashed_key TEXT NOT NULL,
                 metadata   BLOB NOT NULL,
                 PRIMARY KEY (owner, hashed_key)
             )",
            [],
        )?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(db_file, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            owner: owner.to_string(),
        })
    }

    /// Close the underlying database. Later operations fail with `Closed`.
    pub fn close(&self) {
        let mut guard = self.conn.lock().unwrap();
        if let Some(conn) = guard.take() {
            if let Err((_, e)) = conn.close() {
                log::warn!("error closing metadata store: {}", e);
            }
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> MetaResult<T>) -> MetaResult<T> {
        let guard = self.conn.lock().unwrap();
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(MetaError::Closed),
        }
    }

    fn namespace_exists(&self, conn: &Connection) -> MetaResult<bool> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM files WHERE owner = ?1)",
            params![self.owner],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Create or replace the entry keyed by the hash of `fmd.key`.
    /// Returns true when a write occurred.
    pub fn upsert(&self, fmd: &FileMetadata) -> MetaResult<bool> {
        let hashed_key = crypto::hash_key(&fmd.key);
        let blob = bincode::serialize(fmd)?;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO files (owner, hashed_key, metadata)
                 VALUES (?1, ?2, ?3)",
                params![self.owner, hashed_key, blob],
            )?;
            Ok(true)
        })
    }

    /// Look up the entry for a logical key.
    pub fn get(&self, key: &str) -> MetaResult<FileMetadata> {
        let hashed_key = crypto::hash_key(key);

        self.with_conn(|conn| {
            let blob: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT metadata FROM files WHERE owner = ?1 AND hashed_key = ?2",
                    params![self.owner, hashed_key],
                    |row| row.get(0),
                )
                .optional()?;

            match blob {
                Some(blob) => Ok(bincode::deserialize(&blob)?),
                None if self.namespace_exists(conn)? => Err(MetaError::NotFound),
                None => Err(MetaError::NamespaceMissing),
            }
        })
    }

    /// Enumerate every entry in this owner's namespace.
    pub fn list(&self) -> MetaResult<Vec<FileMetadata>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT metadata FROM files WHERE owner = ?1 ORDER BY hashed_key")?;
            let rows = stmt.query_map(params![self.owner], |row| row.get::<_, Vec<u8>>(0))?;

            let mut files = Vec::new();
            for blob in rows {
                files.push(bincode::deserialize(&blob?)?);
            }
            Ok(files)
        })
    }

    /// Remove the entry for a logical key. Removing a key that was never
    /// written is not an error as long as the namespace exists.
    pub fn delete(&self, key: &str) -> MetaResult<()> {
        let hashed_key = crypto::hash_key(key);

        self.with_conn(|conn| {
            if !self.namespace_exists(conn)? {
                return Err(MetaError::NamespaceMissing);
            }
            conn.execute(
                "DELETE FROM files WHERE owner = ?1 AND hashed_key = ?2",
                params![self.owner, hashed_key],
            )?;
            Ok(())
        })
    }

    /// Record a newly-created local replica: bump the count and prepend the
    /// address. No-op when the entry is absent.
    pub fn add_local_replica(&self, key: &str, addr: &str) -> MetaResult<()> {
        let mut fmd = match self.get(key) {
            Ok(fmd) => fmd,
            Err(MetaError::NotFound) | Err(MetaError::NamespaceMissing) => return Ok(()),
            Err(e) => return Err(e),
        };

        fmd.replicas += 1;
        fmd.replica_locations.insert(0, addr.to_string());
        self.upsert(&fmd)?;
        Ok(())
    }

    /// Drop one replica record: decrement the count and pop the front
    /// address. The entry is removed entirely when the count reaches zero.
    /// No-op when the entry is absent.
    pub fn remove_one_replica(&self, key: &str) -> MetaResult<()> {
        let mut fmd = match self.get(key) {
            Ok(fmd) => fmd,
            Err(MetaError::NotFound) | Err(MetaError::NamespaceMissing) => return Ok(()),
            Err(e) => return Err(e),
        };

        if fmd.replicas == 0 {
            return Err(MetaError::NegativeReplicas);
        }
        fmd.replicas -= 1;
        if fmd.replicas == 0 {
            return self.delete(key);
        }

        fmd.replica_locations.remove(0);
        self.upsert(&fmd)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(key: &str) -> FileMetadata {
        FileMetadata {
            key: key.to_string(),
            size: 38,
            replicas: 3,
            replica_locations: vec![":5000".into(), ":3000".into(), ":4000".into()],
        }
    }

    fn open_store(temp: &TempDir) -> MetadataStore {
        MetadataStore::open("owner-1", temp.path().join("node.db")).unwrap()
    }

    #[test]
    fn test_upsert_and_get() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        assert!(store.upsert(&sample("a.txt")).unwrap());
        let fmd = store.get("a.txt").unwrap();
        assert_eq!(fmd, sample("a.txt"));
    }

    #[test]
    fn test_get_missing_namespace() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        assert!(matches!(
            store.get("a.txt").unwrap_err(),
            MetaError::NamespaceMissing
        ));
    }

    #[test]
    fn test_get_missing_key() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        store.upsert(&sample("a.txt")).unwrap();
        assert!(matches!(store.get("b.txt").unwrap_err(), MetaError::NotFound));
    }

    #[test]
    fn test_list_and_delete() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        store.upsert(&sample("a.txt")).unwrap();
        store.upsert(&sample("b.txt")).unwrap();
        assert_eq!(store.list().unwrap().len(), 2);

        store.delete("a.txt").unwrap();
        let files = store.list().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].key, "b.txt");

        // deleting a missing key in an existing namespace is benign
        store.delete("a.txt").unwrap();
    }

    #[test]
    fn test_add_local_replica() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        store.upsert(&sample("a.txt")).unwrap();
        store.add_local_replica("a.txt", ":6000").unwrap();

        let fmd = store.get("a.txt").unwrap();
        assert_eq!(fmd.replicas, 4);
        assert_eq!(fmd.replica_locations[0], ":6000");

        // absent entry: silently ignored
        store.add_local_replica("missing.txt", ":6000").unwrap();
    }

    #[test]
    fn test_remove_one_replica_until_gone() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        store.upsert(&sample("a.txt")).unwrap();

        store.remove_one_replica("a.txt").unwrap();
        let fmd = store.get("a.txt").unwrap();
        assert_eq!(fmd.replicas, 2);
        assert_eq!(fmd.replica_locations, vec![":3000", ":4000"]);

        store.remove_one_replica("a.txt").unwrap();
        store.remove_one_replica("a.txt").unwrap();
        assert!(matches!(store.get("a.txt").unwrap_err(), MetaError::NotFound));
    }

    #[test]
    fn test_remove_refuses_negative() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        let mut fmd = sample("a.txt");
        fmd.replicas = 0;
        fmd.replica_locations.clear();
        store.upsert(&fmd).unwrap();

        assert!(matches!(
            store.remove_one_replica("a.txt").unwrap_err(),
            MetaError::NegativeReplicas
        ));
    }

    #[test]
    fn test_persists_across_reopen() {
        let temp = TempDir::new().unwrap();
        let db_file = temp.path().join("node.db");

        {
            let store = MetadataStore::open("owner-1", &db_file).unwrap();
            store.upsert(&sample("a.txt")).unwrap();
            store.close();
        }

        let store = MetadataStore::open("owner-1", &db_file).unwrap();
        assert_eq!(store.get("a.txt").unwrap(), sample("a.txt"));
    }

    #[test]
    fn test_owner_namespaces_are_isolated() {
        let temp = TempDir::new().unwrap();
        let db_file = temp.path().join("shared.db");

        let first = MetadataStore::open("owner-1", &db_file).unwrap();
        first.upsert(&sample("a.txt")).unwrap();
        first.close();

        let second = MetadataStore::open("owner-2", &db_file).unwrap();
        assert!(second.list().unwrap().is_empty());
        assert!(matches!(
            second.get("a.txt").unwrap_err(),
            MetaError::NamespaceMissing
        ));
    }

    #[test]
    fn test_closed_store_errors() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        store.close();
        assert!(matches!(store.list().unwrap_err(), MetaError::Closed));
    }
}
