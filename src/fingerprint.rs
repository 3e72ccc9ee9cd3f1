//! File fingerprints: whole-file SHA-256, size and modification time.
//!
//! Also defines how paths become metadata keys. Keys are the canonical path
//! rendered as a string; directory prefixes always end in the platform
//! separator so `/a/b` never claims files under `/a/bc`.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::time::SystemTime;
use tokio::io::AsyncReadExt;

use crate::error::IngestError;

const READ_BUF_BYTES: usize = 64 * 1024;

/// Current state of one file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFingerprint {
    pub path: PathBuf,
    pub key: String,
    pub size: u64,
    /// Milliseconds since the Unix epoch.
    pub modified_ms: i64,
    pub content_hash: String,
}

pub fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Metadata key prefix matching every file below `dir`.
pub fn dir_prefix(dir: &Path) -> String {
    let mut key = path_key(dir);
    if !key.ends_with(MAIN_SEPARATOR) {
        key.push(MAIN_SEPARATOR);
    }
    key
}

pub fn modified_ms(modified: std::io::Result<SystemTime>) -> i64 {
    modified
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Stream `path` through SHA-256 and capture its size and mtime.
pub async fn fingerprint_file(path: &Path) -> Result<FileFingerprint, IngestError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| IngestError::io(path, e))?;

    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| IngestError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_BYTES];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| IngestError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(FileFingerprint {
        path: path.to_path_buf(),
        key: path_key(path),
        size: metadata.len(),
        modified_ms: modified_ms(metadata.modified()),
        content_hash: hex::encode(hasher.finalize()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_prefix_appends_separator_once() {
        let p = dir_prefix(Path::new("/a/b"));
        assert_eq!(p, format!("/a/b{}", MAIN_SEPARATOR));
        assert_eq!(dir_prefix(Path::new(&p)), p);
        assert!(!"/a/bc/x.txt".starts_with(&p));
        assert!("/a/b/x.txt".starts_with(&p));
    }

    #[tokio::test]
    async fn fingerprint_matches_one_shot_digest() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("a.txt");
        // Larger than one read buffer to exercise streaming.
        let body = "x".repeat(READ_BUF_BYTES * 2 + 17);
        std::fs::write(&path, &body).unwrap();

        let fp = fingerprint_file(&path).await.unwrap();
        assert_eq!(fp.size, body.len() as u64);
        assert_eq!(fp.content_hash, hex::encode(Sha256::digest(body.as_bytes())));
        assert!(fp.modified_ms > 0);
        assert_eq!(fp.key, path_key(&path));
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let err = fingerprint_file(Path::new("/definitely/not/here.txt"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "io");
    }
}
