use custodia_core::{
    ClientId, ConsentRecord, ConsentStore, CustodiaError, CustodiaResult, Decision, Timestamp,
    UserId,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

type ConsentMap = HashMap<(UserId, ClientId), ConsentRecord>;

/// In-memory consent store implementing ConsentStore.
pub struct InMemoryConsentStore {
    data: Mutex<ConsentMap>,
}

fn lock_data(mutex: &Mutex<ConsentMap>) -> CustodiaResult<MutexGuard<'_, ConsentMap>> {
    mutex
        .lock()
        .map_err(|e| CustodiaError::Storage(format!("lock poisoned: {}", e)))
}

impl InMemoryConsentStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }

    pub fn count(&self) -> usize {
        lock_data(&self.data).map(|d| d.len()).unwrap_or(0)
    }
}

impl Default for InMemoryConsentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsentStore for InMemoryConsentStore {
    fn get(&self, user_id: &UserId, client_id: &ClientId) -> CustodiaResult<Option<ConsentRecord>> {
        let data = lock_data(&self.data)?;
        Ok(data.get(&(user_id.clone(), client_id.clone())).cloned())
    }

    fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        record: &ConsentRecord,
    ) -> CustodiaResult<bool> {
        let mut data = lock_data(&self.data)?;
        let key = (record.user_id.clone(), record.client_id.clone());
        let current = data.get(&key).map(|r| r.version);
        if current != expected_version {
            return Ok(false);
        }
        data.insert(key, record.clone());
        Ok(true)
    }

    fn mark_denied(
        &self,
        user_id: &UserId,
        client_id: &ClientId,
        at: Timestamp,
    ) -> CustodiaResult<Option<ConsentRecord>> {
        let mut data = lock_data(&self.data)?;
        let Some(current) = data.get_mut(&(user_id.clone(), client_id.clone())) else {
            return Ok(None);
        };
        *current = current.superseded(current.granted_scopes.clone(), Decision::Denied, at);
        Ok(Some(current.clone()))
    }

    fn list_for_user(&self, user_id: &UserId) -> CustodiaResult<Vec<ConsentRecord>> {
        let data = lock_data(&self.data)?;
        let mut records: Vec<ConsentRecord> = data
            .values()
            .filter(|r| &r.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        Ok(records)
    }
}
