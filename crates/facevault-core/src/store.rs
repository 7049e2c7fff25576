//! Durable identity → embedding store.
//!
//! One SQLite row per identity holds the embedding and, optionally, the
//! encoded source image, so the two can only ever be written or removed
//! together. Every row is loaded into an in-memory map at open time; reads are
//! served from the map, writes go to disk first and update the map only after
//! the transaction commits.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode};
use thiserror::Error;

use crate::extractor::{extract_from_bytes, EmbeddingExtractor, ExtractionError};
use crate::types::{Embedding, FaceRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS faces (
    identity      TEXT PRIMARY KEY NOT NULL,
    embedding     BLOB NOT NULL,
    dimension     INTEGER NOT NULL,
    model_version TEXT,
    image         BLOB,
    registered_at TEXT NOT NULL
) WITHOUT ROWID;
";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity must be a non-empty string")]
    InvalidIdentity,
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error("persistence failure: {0}")]
    Persistence(#[from] rusqlite::Error),
    #[error("persistence failure at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Lock-guarded face table with an explicit load / reload lifecycle.
pub struct FaceStore {
    path: Option<PathBuf>,
    keep_images: bool,
    /// Serializes every durable mutation.
    conn: Mutex<Connection>,
    records: RwLock<BTreeMap<String, FaceRecord>>,
}

impl FaceStore {
    /// Open (or create) the store at `path` and load every record.
    ///
    /// A file that SQLite reports as not a database, or as corrupt, is moved
    /// aside and replaced by an empty store. Any other failure, such as a lock
    /// held by another process, is returned and the file is left in place.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let (conn, records) = match open_file(path) {
            Ok(loaded) => loaded,
            Err(e) if path.exists() && is_unreadable(&e) => {
                let moved_to = quarantine(path)?;
                tracing::warn!(
                    path = %path.display(),
                    moved_to = %moved_to.display(),
                    error = %e,
                    "face database unreadable; starting with an empty store"
                );
                open_file(path)?
            }
            Err(e) => return Err(e),
        };

        tracing::info!(path = %path.display(), faces = records.len(), "face store opened");

        Ok(Self {
            path: Some(path.to_path_buf()),
            keep_images: true,
            conn: Mutex::new(conn),
            records: RwLock::new(records),
        })
    }

    /// Volatile store, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path: None,
            keep_images: true,
            conn: Mutex::new(conn),
            records: RwLock::new(BTreeMap::new()),
        })
    }

    /// Whether registrations keep the uploaded image next to the embedding.
    pub fn keep_images(mut self, keep: bool) -> Self {
        self.keep_images = keep;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Extract an embedding from `image` and store it under `identity`,
    /// replacing any previous record.
    ///
    /// Extraction runs before any lock is taken.
    pub fn register(
        &self,
        extractor: &dyn EmbeddingExtractor,
        identity: &str,
        image: &[u8],
    ) -> Result<FaceRecord, StoreError> {
        validate_identity(identity)?;

        let embedding = extract_from_bytes(extractor, image)?;
        let record = FaceRecord {
            identity: identity.to_string(),
            embedding,
            image: self.keep_images.then(|| image.to_vec()),
            registered_at: Utc::now(),
        };

        self.put(record.clone())?;
        tracing::info!(
            identity,
            dimension = record.embedding.dimension(),
            "face registered"
        );
        Ok(record)
    }

    /// Persist `record`, replacing any record with the same identity.
    pub fn put(&self, mut record: FaceRecord) -> Result<(), StoreError> {
        validate_identity(&record.identity)?;
        if !self.keep_images {
            record.image = None;
        }

        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO faces (identity, embedding, dimension, model_version, image, registered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(identity) DO UPDATE SET
                embedding = excluded.embedding,
                dimension = excluded.dimension,
                model_version = excluded.model_version,
                image = excluded.image,
                registered_at = excluded.registered_at",
            params![
                record.identity,
                embedding_to_bytes(&record.embedding.values),
                record.embedding.dimension() as i64,
                record.embedding.model_version,
                record.image,
                record.registered_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        self.write_records().insert(record.identity.clone(), record);
        Ok(())
    }

    pub fn get(&self, identity: &str) -> Option<FaceRecord> {
        self.read_records().get(identity).cloned()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.read_records().contains_key(identity)
    }

    /// All stored identities, in key order.
    pub fn list(&self) -> Vec<String> {
        self.read_records().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read_records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_records().is_empty()
    }

    /// Remove `identity`. Returns `false` when nothing was stored under it.
    pub fn delete(&self, identity: &str) -> Result<bool, StoreError> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM faces WHERE identity = ?1", params![identity])?;
        tx.commit()?;

        self.write_records().remove(identity);
        if removed > 0 {
            tracing::info!(identity, "face deleted");
        }
        Ok(removed > 0)
    }

    /// Consistent snapshot of every (identity, embedding) pair, in key order.
    pub fn embeddings(&self) -> Vec<(String, Embedding)> {
        self.read_records()
            .iter()
            .map(|(id, r)| (id.clone(), r.embedding.clone()))
            .collect()
    }

    /// Discard the in-memory map and load it again from disk.
    pub fn reload(&self) -> Result<usize, StoreError> {
        let conn = self.lock_conn();
        let records = load_records(&conn)?;
        let count = records.len();
        *self.write_records() = records;
        tracing::debug!(faces = count, "face store reloaded");
        Ok(count)
    }

    // The map is only written after a commit, so a panic while a lock is
    // held cannot leave it ahead of disk; recovering the guard is safe.
    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_records(&self) -> RwLockReadGuard<'_, BTreeMap<String, FaceRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_records(&self) -> RwLockWriteGuard<'_, BTreeMap<String, FaceRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn validate_identity(identity: &str) -> Result<(), StoreError> {
    if identity.is_empty() {
        return Err(StoreError::InvalidIdentity);
    }
    Ok(())
}

/// SQLite could open the file but it does not hold a usable database.
fn is_unreadable(e: &StoreError) -> bool {
    matches!(
        e,
        StoreError::Persistence(rusqlite::Error::SqliteFailure(f, _))
            if matches!(f.code, ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt)
    )
}

fn open_file(path: &Path) -> Result<(Connection, BTreeMap<String, FaceRecord>), StoreError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.execute_batch(SCHEMA)?;
    let records = load_records(&conn)?;
    Ok((conn, records))
}

/// Move a database file and its WAL side files out of the way.
fn quarantine(path: &Path) -> Result<PathBuf, StoreError> {
    let suffix = format!("corrupt-{}", Utc::now().format("%Y%m%dT%H%M%SZ"));
    let moved_to = sibling(path, &suffix);

    std::fs::rename(path, &moved_to).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    for side in ["wal", "shm"] {
        let side_path = sibling(path, &format!("-{side}"));
        if side_path.exists() {
            let target = sibling(&moved_to, &format!("-{side}"));
            if let Err(e) = std::fs::rename(&side_path, &target) {
                tracing::warn!(path = %side_path.display(), error = %e, "could not move side file");
            }
        }
    }

    Ok(moved_to)
}

/// `faces.db` + `corrupt-x` → `faces.db.corrupt-x`; `faces.db` + `-wal` → `faces.db-wal`.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    if !suffix.starts_with('-') {
        name.push(".");
    }
    name.push(suffix);
    PathBuf::from(name)
}

fn load_records(conn: &Connection) -> Result<BTreeMap<String, FaceRecord>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT identity, embedding, dimension, model_version, image, registered_at FROM faces",
    )?;

    let rows = stmt.query_map([], |row| {
        Ok(RawRow {
            identity: row.get(0)?,
            embedding: row.get(1)?,
            dimension: row.get(2)?,
            model_version: row.get(3)?,
            image: row.get(4)?,
            registered_at: row.get(5)?,
        })
    })?;

    let mut records = BTreeMap::new();
    for row in rows {
        let raw = row?;
        let identity = raw.identity.clone();
        match raw.into_record() {
            Ok(record) => {
                records.insert(identity, record);
            }
            Err(reason) => {
                tracing::warn!(identity = %identity, reason, "skipping malformed face record")
            }
        }
    }
    Ok(records)
}

struct RawRow {
    identity: String,
    embedding: Vec<u8>,
    dimension: i64,
    model_version: Option<String>,
    image: Option<Vec<u8>>,
    registered_at: String,
}

impl RawRow {
    fn into_record(self) -> Result<FaceRecord, &'static str> {
        if self.identity.is_empty() {
            return Err("empty identity");
        }
        let values =
            embedding_from_bytes(&self.embedding).ok_or("embedding blob is not f32-aligned")?;
        if values.len() as i64 != self.dimension {
            return Err("embedding length disagrees with stored dimension");
        }
        let registered_at = DateTime::parse_from_rfc3339(&self.registered_at)
            .map_err(|_| "unparseable registration timestamp")?
            .with_timezone(&Utc);

        Ok(FaceRecord {
            identity: self.identity,
            embedding: Embedding {
                values,
                model_version: self.model_version,
            },
            image: self.image,
            registered_at,
        })
    }
}

/// Little-endian f32 bytes; round-trips bit-exactly.
fn embedding_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn embedding_from_bytes(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}
