//! Durable validation results.
//!
//! Each bootstrap commit gets its own database file, named after the
//! bootstrap hash, so that invalidating one bootstrap's decisions never
//! touches another's. Writes are deferred in memory and flushed in a single
//! transaction when the cache is closed; the transaction gives us the
//! exclusive-writer guarantee, with concurrent openers waiting on the
//! database lock.
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::{fmt, fs, time};

use sqlite as sql;
use thiserror::Error;

use crate::git::Oid;
use crate::rule::Violation;

/// How long to wait for the database lock to be released before failing.
const DB_TIMEOUT: time::Duration = time::Duration::from_secs(6);

#[derive(Error, Debug)]
pub enum Error {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// An internal error.
    #[error("internal error: {0}")]
    Internal(#[from] sql::Error),
    /// Violation serialization error.
    #[error("violation encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A single cached decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub valid: bool,
    pub violation: Option<Violation>,
}

impl Entry {
    pub fn valid() -> Self {
        Self {
            valid: true,
            violation: None,
        }
    }

    pub fn invalid(violation: Violation) -> Self {
        Self {
            valid: false,
            violation: Some(violation),
        }
    }
}

/// Durable mapping of commit id to validation outcome, scoped to one
/// bootstrap. A missing entry means "not yet decided".
pub struct Cache {
    db: sql::Connection,
    pending: BTreeMap<Oid, Option<Entry>>,
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cache(pending: {})", self.pending.len())
    }
}

impl Cache {
    const SCHEMA: &'static str = include_str!("cache/schema.sql");

    /// Open the cache for the given bootstrap, creating the store directory
    /// and database file if they don't exist.
    pub fn open<P: AsRef<Path>>(dir: P, bootstrap: Oid) -> Result<Self, Error> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let mut db = sql::Connection::open(dir.join(format!("{bootstrap}.db")))?;
        db.set_busy_timeout(DB_TIMEOUT.as_millis() as usize)?;
        db.execute(Self::SCHEMA)?;

        Ok(Self {
            db,
            pending: BTreeMap::new(),
        })
    }

    /// Create a new in-memory cache.
    pub fn memory() -> Result<Self, Error> {
        let db = sql::Connection::open(":memory:")?;
        db.execute(Self::SCHEMA)?;

        Ok(Self {
            db,
            pending: BTreeMap::new(),
        })
    }

    /// List the bootstraps with a cache file in the given directory.
    pub fn list<P: AsRef<Path>>(dir: P) -> Result<Vec<Oid>, Error> {
        let mut bootstraps = Vec::new();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(bootstraps),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(stem) = name.strip_suffix(".db") else {
                continue;
            };
            if stem.len() == 40 && stem.chars().all(|c| c.is_ascii_hexdigit()) {
                if let Ok(oid) = Oid::from_str(stem) {
                    bootstraps.push(oid);
                }
            }
        }
        Ok(bootstraps)
    }

    /// Whether a decision exists for the given commit.
    pub fn has(&self, oid: Oid) -> Result<bool, Error> {
        Ok(self.get(oid)?.is_some())
    }

    /// Get the decision for the given commit, if any. An entry that cannot
    /// be decoded is treated as undecided.
    pub fn get(&self, oid: Oid) -> Result<Option<Entry>, Error> {
        if let Some(pending) = self.pending.get(&oid) {
            return Ok(pending.clone());
        }
        let mut stmt = self
            .db
            .prepare("SELECT valid, violation FROM commits WHERE oid = ?")?;
        stmt.bind((1, oid.to_string().as_str()))?;

        if let Some(Ok(row)) = stmt.into_iter().next() {
            let Ok(valid) = row.try_read::<i64, _>("valid") else {
                return Ok(None);
            };
            let Ok(violation) = row.try_read::<&str, _>("violation") else {
                return Ok(None);
            };
            let violation = if violation.is_empty() {
                None
            } else {
                match serde_json::from_str(violation) {
                    Ok(v) => Some(v),
                    // No silent trust: an unreadable row is undecided.
                    Err(_) => return Ok(None),
                }
            };
            return Ok(Some(Entry {
                valid: valid != 0,
                violation,
            }));
        }
        Ok(None)
    }

    /// Record a decision. The write is deferred until [`Cache::close`].
    pub fn set(&mut self, oid: Oid, entry: Entry) {
        self.pending.insert(oid, Some(entry));
    }

    /// Remove a decision. The removal is deferred until [`Cache::close`].
    pub fn remove(&mut self, oid: Oid) {
        self.pending.insert(oid, None);
    }

    /// Whether there are writes waiting to be flushed.
    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drop all pending writes without touching durable state.
    pub fn discard(&mut self) {
        self.pending.clear();
    }

    /// Flush pending writes in a single transaction.
    pub fn flush(&mut self) -> Result<(), Error> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.db.execute("BEGIN")?;
        let result = self.flush_pending();
        if result.is_err() {
            self.db.execute("ROLLBACK").ok();
            return result;
        }
        self.db.execute("COMMIT")?;
        self.pending.clear();

        Ok(())
    }

    fn flush_pending(&self) -> Result<(), Error> {
        for (oid, entry) in &self.pending {
            match entry {
                Some(entry) => {
                    let violation = match &entry.violation {
                        Some(v) => serde_json::to_string(v)?,
                        None => String::new(),
                    };
                    let mut stmt = self.db.prepare(
                        "INSERT INTO commits (oid, valid, violation)
                         VALUES (?1, ?2, ?3)
                         ON CONFLICT DO UPDATE
                         SET valid = ?2, violation = ?3",
                    )?;
                    stmt.bind((1, oid.to_string().as_str()))?;
                    stmt.bind((2, entry.valid as i64))?;
                    stmt.bind((3, violation.as_str()))?;
                    stmt.next()?;
                }
                None => {
                    let mut stmt = self.db.prepare("DELETE FROM commits WHERE oid = ?")?;
                    stmt.bind((1, oid.to_string().as_str()))?;
                    stmt.next()?;
                }
            }
        }
        Ok(())
    }

    /// Flush pending writes and consume the cache.
    pub fn close(mut self) -> Result<(), Error> {
        self.flush()
    }
}
