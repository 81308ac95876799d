//! Local blob store
//!
//! Namespaced content-addressed storage on the local filesystem. This is the
//! only component that touches blob files; replica book-keeping lives in the
//! metadata index and is kept roughly in step by `delete`.

pub mod path;

use crate::crypto::{self, CryptoError};
use crate::meta::MetadataStore;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub use path::{cas_path_transform, default_path_transform, PathKey, PathTransform};

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("blob not found")]
    NotFound,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Content-addressed blob store rooted at one directory, with one
/// sub-namespace per owner id.
pub struct Store {
    root: PathBuf,
    transform: PathTransform,
    meta: Arc<MetadataStore>,
}

impl Store {
    pub fn new<P: Into<PathBuf>>(root: P, transform: PathTransform, meta: Arc<MetadataStore>) -> Self {
        Self {
            root: root.into(),
            transform,
            meta,
        }
    }

    fn blob_path(&self, id: &str, key: &str) -> PathBuf {
        let path_key = (self.transform)(key);
        self.root.join(id).join(path_key.full_path())
    }

    /// Whether a blob exists for `(id, key)`.
    pub fn has(&self, id: &str, key: &str) -> bool {
        self.blob_path(id, key).exists()
    }

    fn open_for_writing(&self, id: &str, key: &str) -> StoreResult<File> {
        let path_key = (self.transform)(key);
        let dir = self.root.join(id).join(&path_key.path_name);
        fs::create_dir_all(&dir)?;
        Ok(File::create(dir.join(&path_key.file_name))?)
    }

    /// Stream `r` into the blob file for `(id, key)`, creating parent
    /// directories as needed. Returns the number of bytes written. An
    /// existing blob is overwritten.
    pub fn write<R: Read>(&self, id: &str, key: &str, r: &mut R) -> StoreResult<u64> {
        let mut file = self.open_for_writing(id, key)?;
        Ok(io::copy(r, &mut file)?)
    }

    /// Like `write`, but `r` carries an IV-prefixed encrypted stream which is
    /// decrypted on the way to disk. Returns the number of bytes consumed
    /// from `r`, IV included.
    pub fn write_decrypt<R: Read>(
        &self,
        enc_key: &[u8],
        id: &str,
        key: &str,
        r: &mut R,
    ) -> StoreResult<u64> {
        let mut file = self.open_for_writing(id, key)?;
        let n = crypto::copy_decrypt(enc_key, r, &mut file)?;
        Ok(n as u64)
    }

    /// Open the blob for `(id, key)` and return its size and a reader over
    /// its bytes. The file handle is released when the reader is dropped.
    pub fn read(&self, id: &str, key: &str) -> StoreResult<(u64, Box<dyn Read + Send>)> {
        let full_path = self.blob_path(id, key);
        let file = File::open(&full_path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StoreError::NotFound
            } else {
                StoreError::Io(e)
            }
        })?;
        let size = file.metadata()?.len();

        // Windows holds an exclusive handle on open files; copy through a
        // buffer there so concurrent writers and deletes on the same path
        // are not blocked.
        #[cfg(windows)]
        {
            let mut file = file;
            let mut buf = Vec::with_capacity(size as usize);
            file.read_to_end(&mut buf)?;
            return Ok((size, Box::new(io::Cursor::new(buf))));
        }

        #[cfg(not(windows))]
        Ok((size, Box::new(file)))
    }

    /// Remove the blob for `(id, key)` together with the directory chain
    /// derived from its key, and drop one replica record from the metadata
    /// index. A missing blob directory surfaces as an I/O error.
    pub fn delete(&self, id: &str, key: &str) -> StoreResult<()> {
        let path_key = (self.transform)(key);

        if let Err(e) = self.meta.remove_one_replica(key) {
            log::warn!("error removing metadata for ({}): {}", path_key.file_name, e);
        }

        let first_dir = self.root.join(id).join(path_key.first_segment());
        fs::remove_dir_all(&first_dir)?;
        log::debug!("deleted ({}) from disk", path_key.file_name);
        Ok(())
    }

    /// Remove the entire store root.
    pub fn clear(&self) -> StoreResult<()> {
        fs::remove_dir_all(&self.root)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{copy_encrypt, new_encryption_key};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn new_store(temp: &TempDir) -> Store {
        let meta =
            Arc::new(MetadataStore::open("node-1", temp.path().join("meta.db")).unwrap());
        Store::new(temp.path().join("blobs"), cas_path_transform, meta)
    }

    fn read_all(r: &mut dyn Read) -> Vec<u8> {
        let mut buf = Vec::new();
        r.read_to_end(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_write_read_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = new_store(&temp);

        let payload = b"some jpg bytes";
        let n = store
            .write("node-1", "picture_1.png", &mut Cursor::new(&payload[..]))
            .unwrap();
        assert_eq!(n, payload.len() as u64);
        assert!(store.has("node-1", "picture_1.png"));

        let (size, mut reader) = store.read("node-1", "picture_1.png").unwrap();
        assert_eq!(size, payload.len() as u64);
        assert_eq!(read_all(&mut reader), payload);
    }

    #[test]
    fn test_read_missing() {
        let temp = TempDir::new().unwrap();
        let store = new_store(&temp);
        let err = match store.read("node-1", "nope") {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, StoreError::NotFound));
        assert!(!store.has("node-1", "nope"));
    }

    #[test]
    fn test_write_decrypt() {
        let temp = TempDir::new().unwrap();
        let store = new_store(&temp);

        let key = new_encryption_key();
        let payload = b"my big data file here!";
        let mut ciphertext = Vec::new();
        copy_encrypt(&key, &mut Cursor::new(&payload[..]), &mut ciphertext).unwrap();

        let n = store
            .write_decrypt(&key, "node-1", "secret.bin", &mut Cursor::new(&ciphertext))
            .unwrap();
        assert_eq!(n, ciphertext.len() as u64);

        let (_, mut reader) = store.read("node-1", "secret.bin").unwrap();
        assert_eq!(read_all(&mut reader), payload);
    }

    #[test]
    fn test_delete_reclaims_directories() {
        let temp = TempDir::new().unwrap();
        let store = new_store(&temp);

        store
            .write("node-1", "picture_1.png", &mut Cursor::new(&b"data"[..]))
            .unwrap();
        store.delete("node-1", "picture_1.png").unwrap();
        assert!(!store.has("node-1", "picture_1.png"));

        let first = cas_path_transform("picture_1.png");
        assert!(!temp
            .path()
            .join("blobs")
            .join("node-1")
            .join(first.first_segment())
            .exists());
    }

    #[test]
    fn test_delete_missing_is_io_error() {
        let temp = TempDir::new().unwrap();
        let store = new_store(&temp);
        assert!(matches!(
            store.delete("node-1", "nope").unwrap_err(),
            StoreError::Io(_)
        ));
    }

    #[test]
    fn test_owner_namespaces_do_not_collide() {
        let temp = TempDir::new().unwrap();
        let store = new_store(&temp);

        store
            .write("node-1", "shared.txt", &mut Cursor::new(&b"one"[..]))
            .unwrap();
        store
            .write("node-2", "shared.txt", &mut Cursor::new(&b"two"[..]))
            .unwrap();

        let (_, mut r1) = store.read("node-1", "shared.txt").unwrap();
        let (_, mut r2) = store.read("node-2", "shared.txt").unwrap();
        assert_eq!(read_all(&mut r1), b"one");
        assert_eq!(read_all(&mut r2), b"two");
    }

    #[test]
    fn test_clear() {
        let temp = TempDir::new().unwrap();
        let store = new_store(&temp);

        store
            .write("node-1", "a", &mut Cursor::new(&b"x"[..]))
            .unwrap();
        store.clear().unwrap();
        assert!(!store.has("node-1", "a"));
        assert!(!temp.path().join("blobs").exists());
    }
}
