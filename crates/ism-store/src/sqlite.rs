//! SQLite-based store implementation

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::{
    DocKind, HistoryEntry, Store, StoreError, StoreResult, Version, Versioned, WriteCondition,
};

/// Primary term of documents written by this store
const PRIMARY_TERM: i64 = 1;

/// SQLite-based store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            -- Versioned documents
            CREATE TABLE IF NOT EXISTS documents (
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                seq_no INTEGER NOT NULL,
                primary_term INTEGER NOT NULL,
                source TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (kind, id)
            );

            -- Store-wide sequence number (single row)
            CREATE TABLE IF NOT EXISTS sequence (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                value INTEGER NOT NULL
            );
            INSERT OR IGNORE INTO sequence (id, value) VALUES (1, 0);

            -- Metadata history (append-only)
            CREATE TABLE IF NOT EXISTS history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                index_name TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                entry_json TEXT NOT NULL
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_history_index ON history(index_name, id);
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }
}

fn current_version(tx: &Transaction<'_>, kind: DocKind, id: &str) -> StoreResult<Option<Version>> {
    let version = tx
        .query_row(
            "SELECT seq_no, primary_term FROM documents WHERE kind = ? AND id = ?",
            params![kind.as_str(), id],
            |row| Ok(Version::new(row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(version)
}

fn next_seq_no(tx: &Transaction<'_>) -> StoreResult<i64> {
    tx.execute("UPDATE sequence SET value = value + 1 WHERE id = 1", [])?;
    let seq_no = tx.query_row("SELECT value FROM sequence WHERE id = 1", [], |row| row.get(0))?;
    Ok(seq_no)
}

fn check_condition(
    kind: DocKind,
    id: &str,
    current: Option<Version>,
    condition: WriteCondition,
) -> StoreResult<()> {
    match (condition, current) {
        (WriteCondition::Any, _) | (WriteCondition::Create, None) => Ok(()),
        (WriteCondition::Create, Some(_)) => Err(StoreError::AlreadyExists {
            kind,
            id: id.to_string(),
        }),
        (WriteCondition::Match(expected), Some(current)) if expected == current => Ok(()),
        (WriteCondition::Match(_), _) => Err(StoreError::VersionConflict {
            kind,
            id: id.to_string(),
        }),
    }
}

impl Store for SqliteStore {
    fn get_document(&self, kind: DocKind, id: &str) -> StoreResult<Option<Versioned<String>>> {
        let conn = self.conn()?;

        let doc = conn
            .query_row(
                "SELECT source, seq_no, primary_term FROM documents WHERE kind = ? AND id = ?",
                params![kind.as_str(), id],
                |row| {
                    Ok(Versioned {
                        value: row.get(0)?,
                        version: Version::new(row.get(1)?, row.get(2)?),
                    })
                },
            )
            .optional()?;

        Ok(doc)
    }

    fn put_document(
        &self,
        kind: DocKind,
        id: &str,
        source: &str,
        condition: WriteCondition,
    ) -> StoreResult<Version> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let current = current_version(&tx, kind, id)?;
        if let Err(e) = check_condition(kind, id, current, condition) {
            debug!(kind = %kind, id, ?current, ?condition, "Conditional write rejected");
            return Err(e);
        }

        let version = Version::new(next_seq_no(&tx)?, PRIMARY_TERM);
        tx.execute(
            r#"
            INSERT INTO documents (kind, id, seq_no, primary_term, source, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(kind, id)
            DO UPDATE SET seq_no = excluded.seq_no,
                          primary_term = excluded.primary_term,
                          source = excluded.source,
                          updated_at = excluded.updated_at
            "#,
            params![
                kind.as_str(),
                id,
                version.seq_no,
                version.primary_term,
                source,
                ism_util::now().to_rfc3339()
            ],
        )?;
        tx.commit()?;

        debug!(kind = %kind, id, seq_no = version.seq_no, "Document written");
        Ok(version)
    }

    fn delete_document(
        &self,
        kind: DocKind,
        id: &str,
        expected: Option<Version>,
    ) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let current = current_version(&tx, kind, id)?;
        if let Some(expected) = expected {
            check_condition(kind, id, current, WriteCondition::Match(expected))?;
        }
        if current.is_none() {
            return Ok(false);
        }

        tx.execute(
            "DELETE FROM documents WHERE kind = ? AND id = ?",
            params![kind.as_str(), id],
        )?;
        // Deletes consume a sequence number so a recreated document never
        // reuses a version the deleted one had.
        next_seq_no(&tx)?;
        tx.commit()?;

        debug!(kind = %kind, id, "Document deleted");
        Ok(true)
    }

    fn list_documents(&self, kind: DocKind) -> StoreResult<Vec<(String, Versioned<String>)>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            "SELECT id, source, seq_no, primary_term FROM documents WHERE kind = ? ORDER BY id",
        )?;

        let rows = stmt.query_map([kind.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                Versioned {
                    value: row.get(1)?,
                    version: Version::new(row.get(2)?, row.get(3)?),
                },
            ))
        })?;

        let mut docs = Vec::new();
        for row in rows {
            docs.push(row?);
        }
        Ok(docs)
    }

    fn append_history(&self, entry: &HistoryEntry) -> StoreResult<i64> {
        let conn = self.conn()?;
        let entry_json = serde_json::to_string(entry)?;

        conn.execute(
            "INSERT INTO history (index_name, timestamp, entry_json) VALUES (?, ?, ?)",
            params![entry.index, entry.timestamp.to_rfc3339(), entry_json],
        )?;

        let id = conn.last_insert_rowid();
        debug!(history_id = id, index = %entry.index, "History entry appended");
        Ok(id)
    }

    fn recent_history(&self, index: &str, limit: usize) -> StoreResult<Vec<HistoryEntry>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            "SELECT id, timestamp, entry_json FROM history WHERE index_name = ? ORDER BY id DESC LIMIT ?",
        )?;

        let rows = stmt.query_map(params![index, limit as i64], |row| {
            let id: i64 = row.get(0)?;
            let timestamp_str: String = row.get(1)?;
            let entry_json: String = row.get(2)?;
            Ok((id, timestamp_str, entry_json))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, timestamp_str, entry_json) = row?;
            let mut entry: HistoryEntry = serde_json::from_str(&entry_json)?;
            entry.id = id;
            if let Ok(ts) = DateTime::parse_from_rfc3339(&timestamp_str) {
                entry.timestamp = ts.with_timezone(&Utc);
            }
            entries.push(entry);
        }

        Ok(entries)
    }

    fn is_healthy(&self) -> bool {
        match self.conn.lock() {
            Ok(conn) => conn.query_row("SELECT 1", [], |_| Ok(())).is_ok(),
            Err(_) => {
                warn!("Store lock poisoned");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DocumentStore, LockDocument};
    use chrono::TimeZone;
    use ism_api::ManagedIndexMetaData;
    use ism_util::{NodeId, PolicyId};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn metadata() -> ManagedIndexMetaData {
        ManagedIndexMetaData::new("logs-000001", "uuid-1", PolicyId::new("hot-delete"))
    }

    #[test]
    fn test_in_memory_store() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.is_healthy());
    }

    #[test]
    fn create_rejects_existing() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .put_metadata(&metadata(), WriteCondition::Create)
            .unwrap();
        let err = store
            .put_metadata(&metadata(), WriteCondition::Create)
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { kind: DocKind::Metadata, .. }));
        assert!(err.is_conflict());
        assert!(!err.is_transient());
    }

    #[test]
    fn versions_increase_and_stale_writes_fail() {
        let store = SqliteStore::in_memory().unwrap();
        let mut meta = metadata();

        let mut version = store.put_metadata(&meta, WriteCondition::Create).unwrap();
        let first = version;
        for i in 0..5 {
            meta.info = ism_api::info_message(format!("tick {}", i));
            let next = store
                .put_metadata(&meta, WriteCondition::Match(version))
                .unwrap();
            assert!(next > version);
            version = next;
        }

        let err = store
            .put_metadata(&meta, WriteCondition::Match(first))
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));

        let stored = store.get_metadata("logs-000001").unwrap().unwrap();
        assert_eq!(stored.version, version);
        assert_eq!(stored.value.message(), Some("tick 4"));
    }

    #[test]
    fn match_on_missing_document_conflicts() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store
            .put_metadata(&metadata(), WriteCondition::Match(Version::new(1, 1)))
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
    }

    #[test]
    fn recreated_document_gets_fresh_version() {
        let store = SqliteStore::in_memory().unwrap();
        let v1 = store.put_metadata(&metadata(), WriteCondition::Create).unwrap();
        assert!(store.delete_document(DocKind::Metadata, "logs-000001", Some(v1)).unwrap());
        assert!(!store.delete_document(DocKind::Metadata, "logs-000001", None).unwrap());

        let v2 = store.put_metadata(&metadata(), WriteCondition::Create).unwrap();
        assert!(v2 > v1);

        // Deleting at a stale version is rejected
        let err = store
            .delete_document(DocKind::Metadata, "logs-000001", Some(v1))
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
    }

    #[test]
    fn kinds_are_separate_namespaces() {
        let store = SqliteStore::in_memory().unwrap();
        store.put_metadata(&metadata(), WriteCondition::Create).unwrap();
        let lock = LockDocument::new("logs-000001", NodeId::new("a"), t0(), t0());
        store.put_lock(&lock, WriteCondition::Create).unwrap();

        assert_eq!(store.list_documents(DocKind::Metadata).unwrap().len(), 1);
        assert_eq!(store.get_lock("logs-000001").unwrap().unwrap().value, lock);
        assert!(store.get_managed_config("logs-000001").unwrap().is_none());
    }

    #[test]
    fn history_is_newest_first_per_index() {
        let store = SqliteStore::in_memory().unwrap();

        for i in 0..3 {
            let meta = metadata().with_message(format!("step {}", i));
            store
                .append_history(&HistoryEntry::new(meta, t0() + chrono::Duration::minutes(i)))
                .unwrap();
        }
        let other = ManagedIndexMetaData::new("other", "u2", PolicyId::new("p"));
        store.append_history(&HistoryEntry::new(other, t0())).unwrap();

        let entries = store.recent_history("logs-000001", 2).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].metadata.message(), Some("step 2"));
        assert_eq!(entries[1].metadata.message(), Some("step 1"));
        assert!(entries[0].id > entries[1].id);
        assert_eq!(entries[0].timestamp, t0() + chrono::Duration::minutes(2));
    }

    #[test]
    fn store_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ismd.db");

        let version = {
            let store = SqliteStore::open(&path).unwrap();
            store.put_metadata(&metadata(), WriteCondition::Create).unwrap()
        };

        let store = SqliteStore::open(&path).unwrap();
        let stored = store.get_metadata("logs-000001").unwrap().unwrap();
        assert_eq!(stored.version, version);

        // The sequence survives reopening
        let next = store
            .put_metadata(&metadata(), WriteCondition::Match(version))
            .unwrap();
        assert!(next > version);
    }
}
