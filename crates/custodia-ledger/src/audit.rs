use custodia_core::{
    AuditChainWriter, AuditEvent, AuditHash, CustodiaError, CustodiaResult, UserId,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Entries the in-memory store keeps before dropping the oldest.
pub const DEFAULT_MEMORY_WINDOW: usize = 10_000;

/// Hash-chained append-only audit log.
///
/// Each entry includes the hash of the previous entry for tamper evidence.
/// The chain can be verified by recomputing all hashes from the oldest
/// retained entry. Entries name attribute types and scopes, never values.
///
/// Entries live in an `AuditStore`. `new` keeps a bounded window in memory;
/// `with_storage` writes through to a durable store and resumes its head.
pub struct AuditChain {
    store: Box<dyn AuditStore>,
    head: Mutex<Option<AuditHash>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub event: AuditEvent,
    pub hash: AuditHash,
}

/// Where audit entries are kept. Appends arrive already chained and in order.
pub trait AuditStore: Send + Sync {
    fn push(&self, entry: &AuditEntry) -> CustodiaResult<()>;

    /// Retained entries, oldest first.
    fn entries(&self) -> CustodiaResult<Vec<AuditEntry>>;

    fn entries_for_user(&self, user_id: &UserId) -> CustodiaResult<Vec<AuditEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.event.kind.user_id() == Some(user_id))
            .collect())
    }

    fn last(&self) -> CustodiaResult<Option<AuditEntry>>;

    fn len(&self) -> CustodiaResult<usize>;

    /// Hash the oldest retained entry points back to when older entries were
    /// dropped. `None` means the store still holds the genesis entry.
    fn anchor(&self) -> CustodiaResult<Option<AuditHash>>;
}

impl AuditChain {
    /// In-memory chain keeping the most recent `DEFAULT_MEMORY_WINDOW` entries.
    pub fn new() -> Self {
        Self {
            store: Box::new(InMemoryAuditStore::with_window(DEFAULT_MEMORY_WINDOW)),
            head: Mutex::new(None),
        }
    }

    /// Chain over `store`, continuing from whatever it already holds.
    pub fn with_storage(store: Box<dyn AuditStore>) -> CustodiaResult<Self> {
        let head = store.last()?.map(|e| e.hash);
        Ok(Self {
            store,
            head: Mutex::new(head),
        })
    }

    fn lock_head(&self) -> CustodiaResult<MutexGuard<'_, Option<AuditHash>>> {
        self.head
            .lock()
            .map_err(|e| CustodiaError::Storage(format!("audit lock poisoned: {}", e)))
    }

    fn compute_hash(event: &AuditEvent, previous: Option<&AuditHash>) -> AuditHash {
        let mut hasher = Sha256::new();

        if let Some(prev) = previous {
            hasher.update(prev.0);
        }

        hasher.update(event.timestamp.seconds_since_epoch.to_le_bytes());
        hasher.update(event.timestamp.nanoseconds.to_le_bytes());

        let kind_bytes = serde_json::to_vec(&event.kind).unwrap_or_default();
        hasher.update(&kind_bytes);

        let hash = hasher.finalize();
        let mut result = [0u8; 32];
        result.copy_from_slice(&hash);
        AuditHash(result)
    }

    pub fn len(&self) -> usize {
        self.store.len().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retained entries, oldest first (for export).
    pub fn entries(&self) -> CustodiaResult<Vec<AuditEntry>> {
        self.store.entries()
    }

    /// Entries that concern one user, oldest first.
    pub fn entries_for_user(&self, user_id: &UserId) -> CustodiaResult<Vec<AuditEntry>> {
        self.store.entries_for_user(user_id)
    }
}

impl Default for AuditChain {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditChainWriter for AuditChain {
    fn append(&self, mut event: AuditEvent) -> CustodiaResult<AuditHash> {
        // Held across the store write so concurrent appends chain in order.
        let mut head = self.lock_head()?;

        event.previous_hash = head.clone();
        let hash = Self::compute_hash(&event, head.as_ref());
        self.store.push(&AuditEntry {
            event,
            hash: hash.clone(),
        })?;

        *head = Some(hash.clone());
        Ok(hash)
    }

    fn verify_chain(&self) -> CustodiaResult<bool> {
        let _head = self.lock_head()?;
        let entries = self.store.entries()?;

        let mut previous = self.store.anchor()?;
        for entry in &entries {
            if entry.event.previous_hash != previous {
                return Ok(false);
            }
            if Self::compute_hash(&entry.event, previous.as_ref()) != entry.hash {
                return Ok(false);
            }
            previous = Some(entry.hash.clone());
        }

        Ok(true)
    }

    fn head(&self) -> CustodiaResult<Option<AuditHash>> {
        Ok(self.lock_head()?.clone())
    }
}

// ---------------------------------------------------------------------------
// In-memory store: a bounded window over the newest entries
// ---------------------------------------------------------------------------

pub struct InMemoryAuditStore {
    inner: Mutex<Window>,
}

struct Window {
    entries: VecDeque<AuditEntry>,
    capacity: usize,
    anchor: Option<AuditHash>,
}

impl InMemoryAuditStore {
    /// Keep at most `capacity` entries (at least one).
    pub fn with_window(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Window {
                entries: VecDeque::new(),
                capacity: capacity.max(1),
                anchor: None,
            }),
        }
    }

    fn lock(&self) -> CustodiaResult<MutexGuard<'_, Window>> {
        self.inner
            .lock()
            .map_err(|e| CustodiaError::Storage(format!("audit lock poisoned: {}", e)))
    }
}

impl AuditStore for InMemoryAuditStore {
    fn push(&self, entry: &AuditEntry) -> CustodiaResult<()> {
        let mut window = self.lock()?;
        window.entries.push_back(entry.clone());
        while window.entries.len() > window.capacity {
            if let Some(dropped) = window.entries.pop_front() {
                window.anchor = Some(dropped.hash);
            }
        }
        Ok(())
    }

    fn entries(&self) -> CustodiaResult<Vec<AuditEntry>> {
        Ok(self.lock()?.entries.iter().cloned().collect())
    }

    fn last(&self) -> CustodiaResult<Option<AuditEntry>> {
        Ok(self.lock()?.entries.back().cloned())
    }

    fn len(&self) -> CustodiaResult<usize> {
        Ok(self.lock()?.entries.len())
    }

    fn anchor(&self) -> CustodiaResult<Option<AuditHash>> {
        Ok(self.lock()?.anchor.clone())
    }
}
