use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CustodiaResult;
use crate::record::{Application, AttributeRecord, ConsentRecord, NewAttribute};
use crate::types::{AttributeType, AuditHash, ClientId, Decision, ScopeSet, Timestamp, UserId};

// ---------------------------------------------------------------------------
// LedgerStore: the append-only attribute history
//
// Records are never updated in place. The only destructive operation is the
// retention purge, which runs outside the normal request flow.
// ---------------------------------------------------------------------------

pub trait LedgerStore: Send + Sync {
    /// Append every entry or none. Returned records carry their assigned `seq`
    /// in input order.
    fn append_batch(&self, batch: &[NewAttribute]) -> CustodiaResult<Vec<AttributeRecord>>;

    /// Every validated record of the user, in any order.
    fn validated_records(&self, user_id: &UserId) -> CustodiaResult<Vec<AttributeRecord>>;

    /// Every record of the user, validated or not, ordered by `seq`.
    fn records_for_user(&self, user_id: &UserId) -> CustodiaResult<Vec<AttributeRecord>>;

    /// Delete records created strictly before `cutoff`. Returns how many went.
    fn purge_created_before(&self, cutoff: Timestamp) -> CustodiaResult<usize>;
}

// ---------------------------------------------------------------------------
// ConsentStore: one record per (user, application) pair
// ---------------------------------------------------------------------------

pub trait ConsentStore: Send + Sync {
    fn get(&self, user_id: &UserId, client_id: &ClientId) -> CustodiaResult<Option<ConsentRecord>>;

    /// Write `record` only if the stored version matches `expected_version`.
    /// `None` means "no record exists yet". Returns true if the write happened.
    fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        record: &ConsentRecord,
    ) -> CustodiaResult<bool>;

    /// Set the decision to Denied in one atomic step. Returns the updated
    /// record, or `None` when the pair has no record.
    fn mark_denied(
        &self,
        user_id: &UserId,
        client_id: &ClientId,
        at: Timestamp,
    ) -> CustodiaResult<Option<ConsentRecord>>;

    fn list_for_user(&self, user_id: &UserId) -> CustodiaResult<Vec<ConsentRecord>>;
}

// ---------------------------------------------------------------------------
// ClaimSource: what the token issuer calls at claim-emission time
// ---------------------------------------------------------------------------

pub trait ClaimSource: Send + Sync {
    /// Claims keyed by scope name, or `AccessDenied` when the pair has no
    /// standing grant.
    fn claims_for(
        &self,
        user_id: &UserId,
        client_id: &ClientId,
    ) -> CustodiaResult<BTreeMap<String, String>>;
}

// ---------------------------------------------------------------------------
// ApplicationRegistry: read-only view of registered relying parties
// ---------------------------------------------------------------------------

pub trait ApplicationRegistry: Send + Sync {
    fn get(&self, client_id: &ClientId) -> CustodiaResult<Option<Application>>;
    fn list(&self) -> CustodiaResult<Vec<Application>>;
}

// ---------------------------------------------------------------------------
// AuditChainWriter: append-only hash-chained audit log
//
// Each entry includes the hash of the previous entry for tamper evidence.
// ---------------------------------------------------------------------------

pub trait AuditChainWriter: Send + Sync {
    fn append(&self, event: AuditEvent) -> CustodiaResult<AuditHash>;
    fn verify_chain(&self) -> CustodiaResult<bool>;
    fn head(&self) -> CustodiaResult<Option<AuditHash>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: Timestamp,
    pub kind: AuditEventKind,
    pub previous_hash: Option<AuditHash>,
}

impl AuditEvent {
    pub fn new(kind: AuditEventKind) -> Self {
        Self {
            timestamp: Timestamp::now(),
            kind,
            previous_hash: None,
        }
    }
}

/// What happened. Values never appear here, only types and scope names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEventKind {
    AttributesAppended {
        user_id: UserId,
        types: Vec<AttributeType>,
    },
    ConsentDecided {
        user_id: UserId,
        client_id: ClientId,
        decision: Decision,
        scopes: ScopeSet,
    },
    ConsentRevoked {
        user_id: UserId,
        client_id: ClientId,
    },
    ClaimsAssembled {
        user_id: UserId,
        client_id: ClientId,
        scopes: ScopeSet,
    },
    ClaimsRefused {
        user_id: UserId,
        client_id: ClientId,
    },
    LedgerPurged {
        cutoff: Timestamp,
        removed: usize,
    },
}

impl AuditEventKind {
    pub fn user_id(&self) -> Option<&UserId> {
        match self {
            AuditEventKind::AttributesAppended { user_id, .. }
            | AuditEventKind::ConsentDecided { user_id, .. }
            | AuditEventKind::ConsentRevoked { user_id, .. }
            | AuditEventKind::ClaimsAssembled { user_id, .. }
            | AuditEventKind::ClaimsRefused { user_id, .. } => Some(user_id),
            AuditEventKind::LedgerPurged { .. } => None,
        }
    }
}
