use custodia_core::{
    ClientId, ConsentId, ConsentRecord, ConsentStore, CustodiaError, CustodiaResult, Decision,
    ScopeSet, Timestamp, UserId,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Mutex, MutexGuard};

/// SQLite consent store. `(user_id, client_id)` is unique; `version` guards
/// every overwrite.
pub struct SqliteConsentStore {
    conn: Mutex<Connection>,
}

const SELECT_COLUMNS: &str = "id, user_id, client_id, granted_scopes, decision, \
                              created_secs, created_nanos, updated_secs, updated_nanos, version";

impl SqliteConsentStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &str) -> CustodiaResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| CustodiaError::Storage(format!("failed to open database: {}", e)))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS consent_records (
                id TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                client_id TEXT NOT NULL,
                granted_scopes TEXT NOT NULL,
                decision TEXT NOT NULL,
                created_secs INTEGER NOT NULL,
                created_nanos INTEGER NOT NULL,
                updated_secs INTEGER NOT NULL,
                updated_nanos INTEGER NOT NULL,
                version INTEGER NOT NULL,
                UNIQUE (user_id, client_id)
            );",
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
}

struct RawRow {
    id: String,
    user_id: String,
    client_id: String,
    granted_scopes: String,
    decision: String,
    created: (i64, i64),
    updated: (i64, i64),
    version: i64,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        client_id: row.get(2)?,
        granted_scopes: row.get(3)?,
        decision: row.get(4)?,
        created: (row.get(5)?, row.get(6)?),
        updated: (row.get(7)?, row.get(8)?),
        version: row.get(9)?,
    })
}

fn to_timestamp((secs, nanos): (i64, i64)) -> Timestamp {
    Timestamp::from_parts(secs.max(0) as u64, nanos.clamp(0, u32::MAX as i64) as u32)
}

impl RawRow {
    fn into_record(self) -> CustodiaResult<ConsentRecord> {
        let decision = Decision::parse(&self.decision).ok_or_else(|| {
            CustodiaError::Storage(format!(
                "consent {} has unknown decision '{}'",
                self.id, self.decision
            ))
        })?;
        let granted_scopes: ScopeSet = serde_json::from_str(&self.granted_scopes).map_err(|e| {
            CustodiaError::Storage(format!("consent {} has malformed scopes: {}", self.id, e))
        })?;
        Ok(ConsentRecord {
            id: ConsentId::new(self.id),
            user_id: UserId::new(self.user_id),
            client_id: ClientId::new(self.client_id),
            granted_scopes,
            decision,
            created_at: to_timestamp(self.created),
            updated_at: to_timestamp(self.updated),
            version: self.version.max(0) as u64,
        })
    }
}

fn scopes_json(scopes: &ScopeSet) -> CustodiaResult<String> {
    serde_json::to_string(scopes)
        .map_err(|e| CustodiaError::Storage(format!("failed to encode scopes: {}", e)))
}

fn select_one(
    conn: &Connection,
    user_id: &UserId,
    client_id: &ClientId,
) -> CustodiaResult<Option<ConsentRecord>> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {} FROM consent_records WHERE user_id = ?1 AND client_id = ?2",
                SELECT_COLUMNS
            ),
            params![user_id.as_str(), client_id.as_str()],
            read_row,
        )
        .optional()
        .map_err(|e| CustodiaError::Storage(format!("query failed: {}", e)))?;
    raw.map(RawRow::into_record).transpose()
}

impl ConsentStore for SqliteConsentStore {
    fn get(&self, user_id: &UserId, client_id: &ClientId) -> CustodiaResult<Option<ConsentRecord>> {
        let conn = self.lock()?;
        select_one(&conn, user_id, client_id)
    }

    fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        record: &ConsentRecord,
    ) -> CustodiaResult<bool> {
        let conn = self.lock()?;
        let scopes = scopes_json(&record.granted_scopes)?;

        let rows = match expected_version {
            None => conn.execute(
                "INSERT INTO consent_records
                    (id, user_id, client_id, granted_scopes, decision,
                     created_secs, created_nanos, updated_secs, updated_nanos, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT (user_id, client_id) DO NOTHING",
                params![
                    record.id.as_str(),
                    record.user_id.as_str(),
                    record.client_id.as_str(),
                    scopes,
                    record.decision.as_str(),
                    record.created_at.seconds_since_epoch as i64,
                    record.created_at.nanoseconds as i64,
                    record.updated_at.seconds_since_epoch as i64,
                    record.updated_at.nanoseconds as i64,
                    record.version as i64,
                ],
            ),
            Some(expected) => conn.execute(
                "UPDATE consent_records
                 SET granted_scopes = ?1, decision = ?2,
                     updated_secs = ?3, updated_nanos = ?4, version = ?5
                 WHERE user_id = ?6 AND client_id = ?7 AND version = ?8",
                params![
                    scopes,
                    record.decision.as_str(),
                    record.updated_at.seconds_since_epoch as i64,
                    record.updated_at.nanoseconds as i64,
                    record.version as i64,
                    record.user_id.as_str(),
                    record.client_id.as_str(),
                    expected as i64,
                ],
            ),
        }
        .map_err(|e| CustodiaError::Storage(format!("consent write failed: {}", e)))?;

        Ok(rows == 1)
    }

    fn mark_denied(
        &self,
        user_id: &UserId,
        client_id: &ClientId,
        at: Timestamp,
    ) -> CustodiaResult<Option<ConsentRecord>> {
        let conn = self.lock()?;
        // Right-hand sides see the pre-update row, so both CASEs compare
        // against the same stored timestamp.
        let rows = conn
            .execute(
                "UPDATE consent_records
                 SET decision = 'denied',
                     version = version + 1,
                     updated_nanos = CASE
                         WHEN ?1 > updated_secs OR (?1 = updated_secs AND ?2 > updated_nanos)
                         THEN ?2 ELSE updated_nanos END,
                     updated_secs = CASE
                         WHEN ?1 > updated_secs OR (?1 = updated_secs AND ?2 > updated_nanos)
                         THEN ?1 ELSE updated_secs END
                 WHERE user_id = ?3 AND client_id = ?4",
                params![
                    at.seconds_since_epoch as i64,
                    at.nanoseconds as i64,
                    user_id.as_str(),
                    client_id.as_str(),
                ],
            )
            .map_err(|e| CustodiaError::Storage(format!("revoke failed: {}", e)))?;

        if rows == 0 {
            return Ok(None);
        }
        select_one(&conn, user_id, client_id)
    }

    fn list_for_user(&self, user_id: &UserId) -> CustodiaResult<Vec<ConsentRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM consent_records WHERE user_id = ?1 ORDER BY client_id",
                SELECT_COLUMNS
            ))
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
