//! SQLite backed state store.
//!
//! Records live in named buckets keyed by [`StateKey`]. PSMs use the
//! [`PSM_BUCKET`] bucket and each representative tag gets its own bucket.
//! Inbound payloads are journaled separately until they are processed.

use crate::rep::{decode, downcast, encode};
use crate::{Psm, PsmError, Rep, RepRegistry, Result, StateKey};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Bucket holding PSM records.
pub const PSM_BUCKET: &str = "psm";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Inbound payload that has been received but not yet processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    pub id: u64,
    /// Server side address the payload arrived at.
    pub address: String,
    pub payload: Vec<u8>,
    /// Unix time in milliseconds.
    pub received_at: i64,
}

/// Persistent store for PSMs, representatives and the inbound journal.
pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    reps: Arc<RepRegistry>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("reps", &self.reps)
            .finish_non_exhaustive()
    }
}

fn rep_bucket(tag: u8) -> String {
    format!("rep_{}", tag)
}

impl Store {
    /// Open or create the store file at `path`.
    pub fn open(path: impl AsRef<Path>, reps: Arc<RepRegistry>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")?;
        initialize_schema(&conn)?;
        info!(path = %path.display(), "opened state store");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
            reps,
        })
    }

    /// Store that lives only as long as the process.
    pub fn open_in_memory(reps: Arc<RepRegistry>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
            reps,
        })
    }

    /// Flush and close the underlying database.
    pub fn close(self) -> Result<()> {
        let conn = self.conn.into_inner();
        conn.close().map_err(|(_, e)| PsmError::Storage(e))?;
        if let Some(path) = &self.path {
            info!(path = %path.display(), "closed state store");
        }
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The registry used to decode representatives.
    pub fn reps(&self) -> &Arc<RepRegistry> {
        &self.reps
    }

    pub fn put(&self, bucket: &str, key: &StateKey, value: &[u8]) -> Result<()> {
        let conn = self.conn.lock();
        put_record(&conn, bucket, key, value)
    }

    pub fn get(&self, bucket: &str, key: &StateKey) -> Result<Vec<u8>> {
        let conn = self.conn.lock();
        get_record(&conn, bucket, key)?.ok_or_else(|| PsmError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    /// Remove a record. Returns whether it existed.
    pub fn delete(&self, bucket: &str, key: &StateKey) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM records WHERE bucket = ?1 AND owner = ?2 AND nonce = ?3",
            params![bucket, key.did, key.nonce],
        )?;
        Ok(removed > 0)
    }

    /// Every key present in `bucket`.
    pub fn keys(&self, bucket: &str) -> Result<Vec<StateKey>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT owner, nonce FROM records WHERE bucket = ?1 ORDER BY owner, nonce")?;
        let rows = stmt.query_map(params![bucket], |row| {
            Ok(StateKey {
                did: row.get(0)?,
                nonce: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn add_psm(&self, psm: &Psm) -> Result<()> {
        self.put(PSM_BUCKET, &psm.key, &encode(psm)?)
    }

    pub fn get_psm(&self, key: &StateKey) -> Result<Psm> {
        decode(&self.get(PSM_BUCKET, key)?)
    }

    /// Read, modify and write one PSM in a single immediate transaction.
    ///
    /// `init` builds the record when none exists. If `update` fails nothing
    /// is written.
    pub fn transact_psm<F>(&self, key: &StateKey, init: impl FnOnce() -> Psm, update: F) -> Result<Psm>
    where
        F: FnOnce(&mut Psm) -> Result<()>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut psm = match get_record(&tx, PSM_BUCKET, key)? {
            Some(bytes) => decode::<Psm>(&bytes)?,
            None => init(),
        };
        update(&mut psm)?;
        put_record(&tx, PSM_BUCKET, key, &encode(&psm)?)?;
        tx.commit()?;

        debug!(key = %key, states = psm.states.len(), "stored psm");
        Ok(psm)
    }

    /// Write a representative, replacing the previous one of the same tag.
    pub fn add_rep(&self, rep: &dyn Rep) -> Result<()> {
        self.put(&rep_bucket(rep.tag()), rep.key(), &rep.data()?)
    }

    pub fn get_rep(&self, tag: u8, key: &StateKey) -> Result<Box<dyn Rep>> {
        let bytes = self.get(&rep_bucket(tag), key)?;
        self.reps.decode(tag, &bytes)
    }

    /// Read a representative as its concrete type.
    pub fn get_rep_as<T: Rep + Clone>(&self, tag: u8, key: &StateKey) -> Result<T> {
        downcast(self.get_rep(tag, key)?.as_ref())
    }

    /// Every representative stored under `tag`.
    pub fn reps_by_tag(&self, tag: u8) -> Result<Vec<Box<dyn Rep>>> {
        let bucket = rep_bucket(tag);
        let values: Vec<Vec<u8>> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare("SELECT value FROM records WHERE bucket = ?1 ORDER BY owner, nonce")?;
            let rows = stmt.query_map(params![bucket], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        values
            .iter()
            .map(|bytes| self.reps.decode(tag, bytes))
            .collect()
    }

    /// Journal an inbound payload before it is processed.
    pub fn add_raw_payload(&self, address: &str, payload: &[u8]) -> Result<u64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO raw_payloads (address, payload, received_at) VALUES (?1, ?2, ?3)",
            params![address, payload, chrono::Utc::now().timestamp_millis()],
        )?;
        Ok(conn.last_insert_rowid() as u64)
    }

    pub fn remove_raw_payload(&self, id: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM raw_payloads WHERE id = ?1", params![id as i64])?;
        Ok(())
    }

    /// Journaled payloads that were never completed, oldest first.
    pub fn pending_raw_payloads(&self) -> Result<Vec<RawPayload>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, address, payload, received_at FROM raw_payloads ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(RawPayload {
                id: row.get::<_, i64>(0)? as u64,
                address: row.get(1)?,
                payload: row.get(2)?,
                received_at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS records (
           bucket TEXT NOT NULL,
           owner TEXT NOT NULL,
           nonce TEXT NOT NULL,
           value BLOB NOT NULL,
           PRIMARY KEY (bucket, owner, nonce)
         );
         CREATE TABLE IF NOT EXISTS raw_payloads (
           id INTEGER PRIMARY KEY AUTOINCREMENT,
           address TEXT NOT NULL,
           payload BLOB NOT NULL,
           received_at INTEGER NOT NULL
         );",
    )?;
    Ok(())
}

fn put_record(conn: &Connection, bucket: &str, key: &StateKey, value: &[u8]) -> Result<()> {
    conn.execute(
        "INSERT INTO records (bucket, owner, nonce, value) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (bucket, owner, nonce) DO UPDATE SET value = excluded.value",
        params![bucket, key.did, key.nonce, value],
    )?;
    Ok(())
}

fn get_record(conn: &Connection, bucket: &str, key: &StateKey) -> Result<Option<Vec<u8>>> {
    Ok(conn
        .query_row(
            "SELECT value FROM records WHERE bucket = ?1 AND owner = ?2 AND nonce = ?3",
            params![bucket, key.did, key.nonce],
            |row| row.get(0),
        )
        .optional()?)
}
