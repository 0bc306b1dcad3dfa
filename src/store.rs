//! Persistent metadata store backing idempotency and crash resumption.
//!
//! Two tables: `observed` records the most recent size measurement for every
//! source path ever seen, `published` records one row per successful
//! (source, destination) publication. The `published` row is the idempotency
//! anchor across restarts: a candidate with a row is never recopied unless
//! the source changes.
//!
//! The store is the only mutable state shared between workers. Every public
//! method runs inside one critical section on a process-wide mutex, and the
//! publication commit couples the `published` insert with the observed-digest
//! update in a single transaction.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

/// Errors surfaced by the metadata store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("metadata store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS observed (
    path             TEXT    NOT NULL,
    is_bundle        INTEGER NOT NULL,
    size             INTEGER NOT NULL,
    last_measured_at INTEGER NOT NULL,
    content_digest   TEXT,
    PRIMARY KEY (path, is_bundle)
);
CREATE TABLE IF NOT EXISTS published (
    path           TEXT    NOT NULL,
    destination    TEXT    NOT NULL,
    is_bundle      INTEGER NOT NULL,
    size           INTEGER NOT NULL,
    content_digest TEXT,
    PRIMARY KEY (path, destination, is_bundle)
);
";

/// A size measurement previously recorded for a source path.
#[derive(Debug, Clone)]
pub struct Observation {
    pub size: u64,
    /// Unix epoch milliseconds of the most recent size update.
    pub last_measured_at: i64,
    pub content_digest: Option<String>,
}

/// A successful publication of a source path at a destination root.
#[derive(Debug, Clone)]
pub struct Publication {
    pub size: u64,
    pub content_digest: Option<String>,
}

/// SQLite-backed metadata store. A single process owns the database file.
pub struct MetadataStore {
    conn: Mutex<Connection>,
}

impl MetadataStore {
    /// Open (creating if necessary) the store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open a transient in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("metadata store mutex poisoned")
    }

    /// Record a size measurement for a source path.
    ///
    /// The stored content digest survives re-measurements at the same size
    /// and is cleared when the size changed, since it no longer describes
    /// the bytes on disk.
    pub fn record_observation(
        &self,
        path: &Path,
        is_bundle: bool,
        size: u64,
        measured_at_ms: i64,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO observed (path, is_bundle, size, last_measured_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (path, is_bundle) DO UPDATE SET
                 content_digest = CASE
                     WHEN observed.size = excluded.size THEN observed.content_digest
                     ELSE NULL
                 END,
                 size = excluded.size,
                 last_measured_at = excluded.last_measured_at",
            params![key(path), is_bundle, size as i64, measured_at_ms],
        )?;
        Ok(())
    }

    pub fn get_observation(&self, path: &Path, is_bundle: bool) -> Result<Option<Observation>> {
        let row = self
            .conn()
            .query_row(
                "SELECT size, last_measured_at, content_digest
                 FROM observed WHERE path = ?1 AND is_bundle = ?2",
                params![key(path), is_bundle],
                |row| {
                    Ok(Observation {
                        size: row.get::<_, i64>(0)? as u64,
                        last_measured_at: row.get(1)?,
                        content_digest: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn set_observed_digest(&self, path: &Path, is_bundle: bool, digest: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE observed SET content_digest = ?3 WHERE path = ?1 AND is_bundle = ?2",
            params![key(path), is_bundle, digest],
        )?;
        Ok(())
    }

    /// Record a successful publication. Upserts so that a republication
    /// under `override_if_different` refreshes size and digest.
    pub fn record_publication(
        &self,
        path: &Path,
        destination: &Path,
        is_bundle: bool,
        size: u64,
        digest: Option<&str>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO published (path, destination, is_bundle, size, content_digest)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (path, destination, is_bundle) DO UPDATE SET
                 size = excluded.size,
                 content_digest = excluded.content_digest",
            params![key(path), key(destination), is_bundle, size as i64, digest],
        )?;
        Ok(())
    }

    /// The step that makes a publication durable: the `published` row and the
    /// observed content digest are committed in one transaction, so a crash
    /// can never leave a publication on record whose source digest is absent.
    pub fn record_publication_and_observed_digest(
        &self,
        path: &Path,
        destination: &Path,
        is_bundle: bool,
        size: u64,
        digest: &str,
        measured_at_ms: i64,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO published (path, destination, is_bundle, size, content_digest)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (path, destination, is_bundle) DO UPDATE SET
                 size = excluded.size,
                 content_digest = excluded.content_digest",
            params![key(path), key(destination), is_bundle, size as i64, digest],
        )?;
        tx.execute(
            "INSERT INTO observed (path, is_bundle, size, last_measured_at, content_digest)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (path, is_bundle) DO UPDATE SET
                 content_digest = excluded.content_digest",
            params![key(path), is_bundle, size as i64, measured_at_ms, digest],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_publication(
        &self,
        path: &Path,
        destination: &Path,
        is_bundle: bool,
    ) -> Result<Option<Publication>> {
        let row = self
            .conn()
            .query_row(
                "SELECT size, content_digest
                 FROM published WHERE path = ?1 AND destination = ?2 AND is_bundle = ?3",
                params![key(path), key(destination), is_bundle],
                |row| {
                    Ok(Publication {
                        size: row.get::<_, i64>(0)? as u64,
                        content_digest: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn is_published(&self, path: &Path, destination: &Path, is_bundle: bool) -> Result<bool> {
        let row = self
            .conn()
            .query_row(
                "SELECT 1 FROM published WHERE path = ?1 AND destination = ?2 AND is_bundle = ?3",
                params![key(path), key(destination), is_bundle],
                |_| Ok(()),
            )
            .optional()?;
        Ok(row.is_some())
    }

    pub fn update_published_digest(
        &self,
        path: &Path,
        destination: &Path,
        is_bundle: bool,
        digest: &str,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE published SET content_digest = ?4
             WHERE path = ?1 AND destination = ?2 AND is_bundle = ?3",
            params![key(path), key(destination), is_bundle, digest],
        )?;
        Ok(())
    }

    pub fn update_published_size(
        &self,
        path: &Path,
        destination: &Path,
        is_bundle: bool,
        size: u64,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE published SET size = ?4
             WHERE path = ?1 AND destination = ?2 AND is_bundle = ?3",
            params![key(path), key(destination), is_bundle, size as i64],
        )?;
        Ok(())
    }
}

fn key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn store() -> MetadataStore {
        MetadataStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_observation_roundtrip() {
        let store = store();
        let path = PathBuf::from("/src/a.txt");

        assert!(store.get_observation(&path, false).unwrap().is_none());

        store.record_observation(&path, false, 5, 1_000).unwrap();
        let obs = store.get_observation(&path, false).unwrap().unwrap();
        assert_eq!(obs.size, 5);
        assert_eq!(obs.last_measured_at, 1_000);
        assert!(obs.content_digest.is_none());
    }

    #[test]
    fn test_observation_keyed_by_bundle_flag() {
        let store = store();
        let path = PathBuf::from("/src/run.d");

        store.record_observation(&path, true, 30, 1_000).unwrap();
        assert!(store.get_observation(&path, false).unwrap().is_none());
        assert_eq!(store.get_observation(&path, true).unwrap().unwrap().size, 30);
    }

    #[test]
    fn test_reobservation_at_same_size_keeps_digest() {
        let store = store();
        let path = PathBuf::from("/src/a.txt");

        store.record_observation(&path, false, 5, 1_000).unwrap();
        store.set_observed_digest(&path, false, "abc123").unwrap();
        store.record_observation(&path, false, 5, 2_000).unwrap();

        let obs = store.get_observation(&path, false).unwrap().unwrap();
        assert_eq!(obs.last_measured_at, 2_000);
        assert_eq!(obs.content_digest.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_size_change_clears_stale_digest() {
        let store = store();
        let path = PathBuf::from("/src/a.txt");

        store.record_observation(&path, false, 5, 1_000).unwrap();
        store.set_observed_digest(&path, false, "abc123").unwrap();
        store.record_observation(&path, false, 9, 2_000).unwrap();

        let obs = store.get_observation(&path, false).unwrap().unwrap();
        assert_eq!(obs.size, 9);
        assert!(obs.content_digest.is_none());
    }

    #[test]
    fn test_publication_keyed_by_destination() {
        let store = store();
        let path = PathBuf::from("/src/a.txt");
        let dst1 = PathBuf::from("/mirror1");
        let dst2 = PathBuf::from("/mirror2");

        store.record_publication(&path, &dst1, false, 5, Some("abc")).unwrap();

        assert!(store.is_published(&path, &dst1, false).unwrap());
        assert!(!store.is_published(&path, &dst2, false).unwrap());
        assert!(!store.is_published(&path, &dst1, true).unwrap());

        let row = store.get_publication(&path, &dst1, false).unwrap().unwrap();
        assert_eq!(row.size, 5);
        assert_eq!(row.content_digest.as_deref(), Some("abc"));
    }

    #[test]
    fn test_publication_updates() {
        let store = store();
        let path = PathBuf::from("/src/a.txt");
        let dst = PathBuf::from("/mirror");

        store.record_publication(&path, &dst, false, 5, None).unwrap();
        store.update_published_digest(&path, &dst, false, "def").unwrap();
        store.update_published_size(&path, &dst, false, 7).unwrap();

        let row = store.get_publication(&path, &dst, false).unwrap().unwrap();
        assert_eq!(row.size, 7);
        assert_eq!(row.content_digest.as_deref(), Some("def"));
    }

    #[test]
    fn test_publication_commit_writes_both_tables() {
        let store = store();
        let path = PathBuf::from("/src/a.txt");
        let dst = PathBuf::from("/mirror");

        store
            .record_publication_and_observed_digest(&path, &dst, false, 5, "abc", 1_000)
            .unwrap();

        let publication = store.get_publication(&path, &dst, false).unwrap().unwrap();
        assert_eq!(publication.content_digest.as_deref(), Some("abc"));
        let observation = store.get_observation(&path, false).unwrap().unwrap();
        assert_eq!(observation.content_digest.as_deref(), Some("abc"));
    }

    #[test]
    fn test_publication_commit_preserves_observation_timing() {
        let store = store();
        let path = PathBuf::from("/src/a.txt");
        let dst = PathBuf::from("/mirror");

        store.record_observation(&path, false, 5, 1_000).unwrap();
        store
            .record_publication_and_observed_digest(&path, &dst, false, 5, "abc", 9_000)
            .unwrap();

        // The commit only attaches the digest; the stability bookkeeping
        // (size, last_measured_at) is untouched for an existing row.
        let obs = store.get_observation(&path, false).unwrap().unwrap();
        assert_eq!(obs.last_measured_at, 1_000);
        assert_eq!(obs.content_digest.as_deref(), Some("abc"));
    }
}
