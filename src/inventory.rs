//! Candidate enumeration under a source root.
//!
//! A candidate is either a regular file or a bundle directory (a directory
//! whose name ends in `.d`, treated as a single publication unit). The walk
//! is lexicographic pre-order; bundle directories are emitted as one
//! candidate and never descended into. Paths carrying the reserved staging
//! suffix are refused as candidates. Symlinks are not followed.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;
use walkdir::WalkDir;

/// Reserved suffix for in-flight destination files. A source path ending in
/// this suffix is never a candidate.
pub const STAGING_SUFFIX: &str = ".cat.part";

/// Directories with this suffix are treated as single publication units.
pub const BUNDLE_SUFFIX: &str = ".d";

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("walk failed under {root}: {source}")]
    Walk {
        root: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// A path eligible for consideration this tick.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub path: PathBuf,
    pub is_bundle: bool,
    /// Byte length for files; recursive sum of regular-file sizes for bundles.
    pub size: u64,
}

/// Enumerate the candidates under `root`, in lexicographic pre-order.
///
/// A per-entry stat failure skips that candidate; a walker failure aborts
/// the whole root.
pub fn list_candidates(root: &Path) -> Result<Vec<Candidate>, InventoryError> {
    let mut candidates = Vec::new();
    let mut walker = WalkDir::new(root).sort_by_file_name().into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|source| InventoryError::Walk {
            root: root.to_path_buf(),
            source,
        })?;
        let name = entry.file_name().to_string_lossy().into_owned();

        if entry.file_type().is_dir() {
            if entry.depth() > 0 && name.ends_with(BUNDLE_SUFFIX) {
                match bundle_size(entry.path()) {
                    Ok(size) => candidates.push(Candidate {
                        path: entry.path().to_path_buf(),
                        is_bundle: true,
                        size,
                    }),
                    Err(err) => warn!(
                        path = %entry.path().display(),
                        error = %err,
                        "skipping unreadable bundle this tick"
                    ),
                }
                walker.skip_current_dir();
            }
            continue;
        }

        if !entry.file_type().is_file() || name.ends_with(STAGING_SUFFIX) {
            continue;
        }

        match entry.metadata() {
            Ok(meta) => candidates.push(Candidate {
                path: entry.path().to_path_buf(),
                is_bundle: false,
                size: meta.len(),
            }),
            Err(err) => warn!(
                path = %entry.path().display(),
                error = %err,
                "skipping unreadable candidate this tick"
            ),
        }
    }

    Ok(candidates)
}

/// Recursive sum of regular-file sizes beneath `root`. Directories
/// contribute nothing.
pub fn bundle_size(root: &Path) -> io::Result<u64> {
    let mut total = 0u64;
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() {
            total += entry.metadata().map(|m| m.len())?;
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_files_listed_in_lexicographic_order() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), b"b").unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/c.txt"), b"ccc").unwrap();

        let candidates = list_candidates(dir.path()).unwrap();
        let names: Vec<_> = candidates
            .iter()
            .map(|c| c.path.strip_prefix(dir.path()).unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub/c.txt"]);
        assert!(candidates.iter().all(|c| !c.is_bundle));
        assert_eq!(candidates[2].size, 3);
    }

    #[test]
    fn test_bundle_emitted_as_unit_without_descending() {
        let dir = tempdir().unwrap();
        let bundle = dir.path().join("run.d");
        fs::create_dir_all(bundle.join("a")).unwrap();
        fs::write(bundle.join("a/1.bin"), vec![0u8; 10]).unwrap();
        fs::write(bundle.join("2.bin"), vec![0u8; 20]).unwrap();

        let candidates = list_candidates(dir.path()).unwrap();
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].is_bundle);
        assert_eq!(candidates[0].path, bundle);
        assert_eq!(candidates[0].size, 30);
    }

    #[test]
    fn test_plain_directories_traversed_but_not_emitted() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("x/y")).unwrap();
        fs::write(dir.path().join("x/y/deep.txt"), b"deep").unwrap();

        let candidates = list_candidates(dir.path()).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].path, dir.path().join("x/y/deep.txt"));
    }

    #[test]
    fn test_staging_suffix_refused() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt.cat.part"), b"partial").unwrap();
        fs::write(dir.path().join("a.txt"), b"whole").unwrap();

        let candidates = list_candidates(dir.path()).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].path, dir.path().join("a.txt"));
    }

    #[test]
    fn test_missing_root_aborts_walk() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(list_candidates(&missing).is_err());
    }

    #[test]
    fn test_bundle_size_ignores_directories() {
        let dir = tempdir().unwrap();
        let bundle = dir.path().join("run.d");
        fs::create_dir_all(bundle.join("a/b/c")).unwrap();
        fs::write(bundle.join("a/1.bin"), vec![0u8; 7]).unwrap();
        fs::write(bundle.join("a/b/2.bin"), vec![0u8; 5]).unwrap();

        assert_eq!(bundle_size(&bundle).unwrap(), 12);
    }
}
