//! Content-addressed path derivation
//!
//! Maps a logical key onto a hierarchical on-disk location so that blob
//! directories fan out instead of piling up in one folder.

use sha1::{Digest, Sha1};
use std::path::{PathBuf, MAIN_SEPARATOR};

const SEGMENT_LEN: usize = 5;

/// On-disk location of a blob, relative to an owner's namespace root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey {
    /// Directory chain, segments joined by the platform separator
    pub path_name: String,
    /// File name, the full hex digest of the logical key
    pub file_name: String,
}

impl PathKey {
    /// Relative path of the blob file: `path_name` / `file_name`.
    pub fn full_path(&self) -> PathBuf {
        PathBuf::from(&self.path_name).join(&self.file_name)
    }

    /// First directory segment of `path_name`. Deleting it reclaims every
    /// intermediate directory of this blob.
    pub fn first_segment(&self) -> &str {
        self.path_name
            .split(MAIN_SEPARATOR)
            .next()
            .unwrap_or_default()
    }
}

/// Derives the on-disk location for a logical key.
pub type PathTransform = fn(&str) -> PathKey;

/// Hash the key and split the hex digest into equal 5-char directory
/// segments; the file name is the full digest.
pub fn cas_path_transform(key: &str) -> PathKey {
    let digest = hex::encode(Sha1::digest(key.as_bytes()));

    let segments: Vec<&str> = digest
        .as_bytes()
        .chunks(SEGMENT_LEN)
        .map(|chunk| std::str::from_utf8(chunk).expect("hex digest is ascii"))
        .collect();

    PathKey {
        path_name: segments.join(&MAIN_SEPARATOR.to_string()),
        file_name: digest,
    }
}

/// Fallback transform: the key is used literally as directory and file name.
pub fn default_path_transform(key: &str) -> PathKey {
    PathKey {
        path_name: key.to_string(),
        file_name: key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cas_path_transform() {
        let path_key = cas_path_transform("awesomePicture");
        assert_eq!(
            path_key.file_name,
            "34ae125e927e54823ca1d7c8726e3a8c273de692"
        );

        let segments: Vec<&str> = path_key.path_name.split(MAIN_SEPARATOR).collect();
        assert_eq!(segments.len(), 8);
        assert!(segments.iter().all(|s| s.len() == 5));
        assert_eq!(segments.join(""), path_key.file_name);
        assert_eq!(path_key.first_segment(), &path_key.file_name[..5]);
    }

    #[test]
    fn test_cas_path_transform_deterministic() {
        assert_eq!(cas_path_transform("k"), cas_path_transform("k"));
        assert_ne!(
            cas_path_transform("k").file_name,
            cas_path_transform("l").file_name
        );
    }

    #[test]
    fn test_full_path_appends_file_name() {
        let path_key = cas_path_transform("some key");
        let full = path_key.full_path();
        assert!(full.ends_with(&path_key.file_name));
        assert!(full.starts_with(path_key.first_segment()));
    }

    #[test]
    fn test_default_path_transform() {
        let path_key = default_path_transform("plain");
        assert_eq!(path_key.path_name, "plain");
        assert_eq!(path_key.file_name, "plain");
    }
}
