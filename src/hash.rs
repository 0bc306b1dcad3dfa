//! Content digests for files and bundle directories.
//!
//! The canonical digest is SHA-256, emitted as lowercase hex. A bundle
//! directory is digested by walking it in lexicographic pre-order and
//! feeding the ASCII hex digest of every regular file into an outer
//! SHA-256; the outer digest is the bundle digest. The walk order is part
//! of the digest contract: repeated hashes of an unchanged bundle must be
//! bitwise identical.

use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use walkdir::WalkDir;

const READ_BUF_SIZE: usize = 1024 * 1024;

/// Streaming SHA-256 of a file's bytes, as lowercase hex.
pub async fn file_digest(path: &Path) -> io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Digest of a bundle directory: SHA-256 over the concatenated hex digests
/// of every regular file beneath the root, in lexicographic pre-order.
/// Directories contribute nothing. Any unreadable byte aborts the hash.
pub async fn bundle_digest(root: &Path) -> io::Result<String> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }

    let mut outer = Sha256::new();
    for path in files {
        let digest = file_digest(&path).await?;
        outer.update(digest.as_bytes());
    }
    Ok(hex::encode(outer.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_digest_known_value() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, b"hello").unwrap();

        assert_eq!(
            file_digest(&path).await.unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[tokio::test]
    async fn test_file_digest_missing_file_errors() {
        let dir = tempdir().unwrap();
        let err = file_digest(&dir.path().join("nope")).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_bundle_digest_is_hex_of_hex_in_walk_order() {
        let dir = tempdir().unwrap();
        let bundle = dir.path().join("run.d");
        fs::create_dir_all(bundle.join("a")).unwrap();
        fs::create_dir_all(bundle.join("b")).unwrap();
        fs::write(bundle.join("a/1.bin"), vec![0xAAu8; 10]).unwrap();
        fs::write(bundle.join("b/2.bin"), vec![0xBBu8; 20]).unwrap();

        let d1 = hex::encode(Sha256::digest(vec![0xAAu8; 10]));
        let d2 = hex::encode(Sha256::digest(vec![0xBBu8; 20]));
        let mut outer = Sha256::new();
        outer.update(d1.as_bytes());
        outer.update(d2.as_bytes());
        let expected = hex::encode(outer.finalize());

        assert_eq!(bundle_digest(&bundle).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_bundle_digest_stable_across_repeated_hashes() {
        let dir = tempdir().unwrap();
        let bundle = dir.path().join("run.d");
        fs::create_dir_all(&bundle).unwrap();
        fs::write(bundle.join("z.bin"), b"zz").unwrap();
        fs::write(bundle.join("a.bin"), b"aa").unwrap();

        let first = bundle_digest(&bundle).await.unwrap();
        let second = bundle_digest(&bundle).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_empty_bundle_digest_is_digest_of_nothing() {
        let dir = tempdir().unwrap();
        let bundle = dir.path().join("empty.d");
        fs::create_dir_all(&bundle).unwrap();

        assert_eq!(
            bundle_digest(&bundle).await.unwrap(),
            hex::encode(Sha256::digest(b"")),
        );
    }
}
