use crate::audit::{AuditEntry, AuditStore};
use custodia_core::{
    AttributeRecord, AttributeType, AuditHash, CustodiaError, CustodiaResult, LedgerStore,
    NewAttribute, RecordId, Timestamp, UserId,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Mutex, MutexGuard};

/// SQLite ledger. One row per attribute record, never updated.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

const SELECT_COLUMNS: &str = "seq, id, user_id, attribute_type, value, is_validated, \
                              created_secs, created_nanos";

impl SqliteLedger {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &str) -> CustodiaResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| CustodiaError::Storage(format!("failed to open database: {}", e)))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS attribute_records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                attribute_type TEXT NOT NULL,
                value TEXT NOT NULL,
                is_validated INTEGER NOT NULL,
                created_secs INTEGER NOT NULL,
                created_nanos INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_attribute_records_lookup
                ON attribute_records (user_id, attribute_type, created_secs, created_nanos);",
        )
        .map_err(|e| CustodiaError::Storage(format!("failed to create tables: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> CustodiaResult<Self> {
        Self::open(":memory:")
    }

    fn lock(&self) -> CustodiaResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CustodiaError::Storage(format!("lock poisoned: {}", e)))
    }

    fn query_user(&self, user_id: &UserId, validated_only: bool) -> CustodiaResult<Vec<AttributeRecord>> {
        let conn = self.lock()?;
        let sql = if validated_only {
            format!(
                "SELECT {} FROM attribute_records WHERE user_id = ?1 AND is_validated = 1 ORDER BY seq",
                SELECT_COLUMNS
            )
        } else {
            format!(
                "SELECT {} FROM attribute_records WHERE user_id = ?1 ORDER BY seq",
                SELECT_COLUMNS
            )
        };

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| CustodiaError::Storage(format!("prepare failed: {}", e)))?;
        let rows = stmt
            .query_map(params![user_id.as_str()], read_row)
            .map_err(|e| CustodiaError::Storage(format!("query failed: {}", e)))?;

        let mut records = Vec::new();
        for row in rows {
            let raw = row.map_err(|e| CustodiaError::Storage(format!("row read failed: {}", e)))?;
            records.push(raw.into_record()?);
        }
        Ok(records)
    }
}

/// Row as stored, before the attribute type is parsed.
struct RawRow {
    seq: i64,
    id: String,
    user_id: String,
    attribute_type: String,
    value: String,
    is_validated: bool,
    created_secs: i64,
    created_nanos: i64,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        seq: row.get(0)?,
        id: row.get(1)?,
        user_id: row.get(2)?,
        attribute_type: row.get(3)?,
        value: row.get(4)?,
        is_validated: row.get(5)?,
        created_secs: row.get(6)?,
        created_nanos: row.get(7)?,
    })
}

impl RawRow {
    fn into_record(self) -> CustodiaResult<AttributeRecord> {
        let attribute_type = AttributeType::parse(&self.attribute_type).ok_or_else(|| {
            CustodiaError::Storage(format!(
                "record {} has unknown attribute type '{}'",
                self.id, self.attribute_type
            ))
        })?;
        Ok(AttributeRecord {
            id: RecordId::new(self.id),
            seq: self.seq.max(0) as u64,
            user_id: UserId::new(self.user_id),
            attribute_type,
            value: self.value,
            is_validated: self.is_validated,
            created_at: Timestamp::from_parts(
                self.created_secs.max(0) as u64,
                self.created_nanos.clamp(0, u32::MAX as i64) as u32,
            ),
        })
    }
}

impl LedgerStore for SqliteLedger {
    fn append_batch(&self, batch: &[NewAttribute]) -> CustodiaResult<Vec<AttributeRecord>> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| CustodiaError::Storage(format!("begin failed: {}", e)))?;

        let mut appended = Vec::with_capacity(batch.len());
        for new in batch {
            tx.execute(
                "INSERT INTO attribute_records
                    (id, user_id, attribute_type, value, is_validated, created_secs, created_nanos)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    new.id.as_str(),
                    new.user_id.as_str(),
                    new.attribute_type.as_str(),
                    new.value,
                    new.is_validated,
                    new.created_at.seconds_since_epoch as i64,
                    new.created_at.nanoseconds as i64,
                ],
            )
            .map_err(|e| CustodiaError::Storage(format!("insert failed: {}", e)))?;
            let seq = tx.last_insert_rowid().max(0) as u64;
            appended.push(new.clone().into_record(seq));
        }

        // Dropping an uncommitted transaction rolls it back, so an early
        // return above leaves nothing behind.
        tx.commit()
            .map_err(|e| CustodiaError::Storage(format!("commit failed: {}", e)))?;
        Ok(appended)
    }

    fn validated_records(&self, user_id: &UserId) -> CustodiaResult<Vec<AttributeRecord>> {
        self.query_user(user_id, true)
    }

    fn records_for_user(&self, user_id: &UserId) -> CustodiaResult<Vec<AttributeRecord>> {
        self.query_user(user_id, false)
    }

    fn purge_created_before(&self, cutoff: Timestamp) -> CustodiaResult<usize> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM attribute_records
             WHERE created_secs < ?1 OR (created_secs = ?1 AND created_nanos < ?2)",
            params![
                cutoff.seconds_since_epoch as i64,
                cutoff.nanoseconds as i64
            ],
        )
        .map_err(|e| CustodiaError::Storage(format!("purge failed: {}", e)))
    }
}

/// SQLite audit log. Entries are kept whole as JSON, keyed by insertion order.
pub struct SqliteAuditStore {
    conn: Mutex<Connection>,
}

impl SqliteAuditStore {
    /// Open or create the audit table in the database at `path`.
    pub fn open(path: &str) -> CustodiaResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| CustodiaError::Storage(format!("failed to open database: {}", e)))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS audit_entries (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                hash TEXT NOT NULL UNIQUE,
                user_id TEXT,
                event TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_entries_user
                ON audit_entries (user_id, seq);",
        )
        .map_err(|e| CustodiaError::Storage(format!("failed to create tables: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> CustodiaResult<Self> {
        Self::open(":memory:")
    }

    fn lock(&self) -> CustodiaResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CustodiaError::Storage(format!("lock poisoned: {}", e)))
    }

    fn query(&self, sql: &str, user_id: Option<&UserId>) -> CustodiaResult<Vec<AuditEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| CustodiaError::Storage(format!("prepare failed: {}", e)))?;
        let rows = match user_id {
            Some(user_id) => stmt.query_map(params![user_id.as_str()], read_event),
            None => stmt.query_map(params![], read_event),
        }
        .map_err(|e| CustodiaError::Storage(format!("query failed: {}", e)))?;

        let mut entries = Vec::new();
        for row in rows {
            let json = row.map_err(|e| CustodiaError::Storage(format!("row read failed: {}", e)))?;
            entries.push(decode_entry(&json)?);
        }
        Ok(entries)
    }
}

fn read_event(row: &Row<'_>) -> rusqlite::Result<String> {
    row.get(0)
}

fn decode_entry(json: &str) -> CustodiaResult<AuditEntry> {
    serde_json::from_str(json)
        .map_err(|e| CustodiaError::Storage(format!("corrupt audit entry: {}", e)))
}

impl AuditStore for SqliteAuditStore {
    fn push(&self, entry: &AuditEntry) -> CustodiaResult<()> {
        let json = serde_json::to_string(entry)
            .map_err(|e| CustodiaError::Storage(format!("failed to encode audit entry: {}", e)))?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO audit_entries (hash, user_id, event) VALUES (?1, ?2, ?3)",
            params![
                entry.hash.to_string(),
                entry.event.kind.user_id().map(|u| u.as_str()),
                json
            ],
        )
        .map_err(|e| CustodiaError::Storage(format!("insert failed: {}", e)))?;
        Ok(())
    }

    fn entries(&self) -> CustodiaResult<Vec<AuditEntry>> {
        self.query("SELECT event FROM audit_entries ORDER BY seq", None)
    }

    fn entries_for_user(&self, user_id: &UserId) -> CustodiaResult<Vec<AuditEntry>> {
        self.query(
            "SELECT event FROM audit_entries WHERE user_id = ?1 ORDER BY seq",
            Some(user_id),
        )
    }

    fn last(&self) -> CustodiaResult<Option<AuditEntry>> {
        let conn = self.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT event FROM audit_entries ORDER BY seq DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| CustodiaError::Storage(format!("query failed: {}", e)))?;
        json.as_deref().map(decode_entry).transpose()
    }

    fn len(&self) -> CustodiaResult<usize> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM audit_entries", [], |row| row.get(0))
            .map_err(|e| CustodiaError::Storage(format!("count failed: {}", e)))?;
        Ok(count.max(0) as usize)
    }

    fn anchor(&self) -> CustodiaResult<Option<AuditHash>> {
        Ok(None)
    }
}
