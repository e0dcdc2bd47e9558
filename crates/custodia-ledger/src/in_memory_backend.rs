use custodia_core::{
    AttributeRecord, CustodiaError, CustodiaResult, LedgerStore, NewAttribute, Timestamp, UserId,
};
use std::sync::{Mutex, MutexGuard};

/// In-memory ledger implementing LedgerStore.
///
/// Useful for tests and for running the engine without a database.
pub struct InMemoryLedger {
    inner: Mutex<LedgerData>,
}

#[derive(Default)]
struct LedgerData {
    records: Vec<AttributeRecord>,
    next_seq: u64,
}

fn lock_data(mutex: &Mutex<LedgerData>) -> CustodiaResult<MutexGuard<'_, LedgerData>> {
    mutex
        .lock()
        .map_err(|e| CustodiaError::Storage(format!("lock poisoned: {}", e)))
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LedgerData {
                records: Vec::new(),
                next_seq: 1,
            }),
        }
    }

    /// Number of stored records across all users.
    pub fn count(&self) -> usize {
        lock_data(&self.inner).map(|d| d.records.len()).unwrap_or(0)
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerStore for InMemoryLedger {
    fn append_batch(&self, batch: &[NewAttribute]) -> CustodiaResult<Vec<AttributeRecord>> {
        let mut data = lock_data(&self.inner)?;

        if let Some(dup) = batch
            .iter()
            .find(|n| data.records.iter().any(|r| r.id == n.id))
        {
            return Err(CustodiaError::Storage(format!(
                "duplicate record id {}",
                dup.id
            )));
        }

        let mut appended = Vec::with_capacity(batch.len());
        for new in batch {
            let seq = data.next_seq;
            data.next_seq += 1;
            appended.push(new.clone().into_record(seq));
        }
        data.records.extend(appended.iter().cloned());
        Ok(appended)
    }

    fn validated_records(&self, user_id: &UserId) -> CustodiaResult<Vec<AttributeRecord>> {
        let data = lock_data(&self.inner)?;
        Ok(data
            .records
            .iter()
            .filter(|r| &r.user_id == user_id && r.is_validated)
            .cloned()
            .collect())
    }

    fn records_for_user(&self, user_id: &UserId) -> CustodiaResult<Vec<AttributeRecord>> {
        let data = lock_data(&self.inner)?;
        Ok(data
            .records
            .iter()
            .filter(|r| &r.user_id == user_id)
            .cloned()
            .collect())
    }

    fn purge_created_before(&self, cutoff: Timestamp) -> CustodiaResult<usize> {
        let mut data = lock_data(&self.inner)?;
        let before = data.records.len();
        data.records.retain(|r| r.created_at >= cutoff);
        Ok(before - data.records.len())
    }
}
