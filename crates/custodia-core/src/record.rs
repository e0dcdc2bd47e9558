use serde::{Deserialize, Serialize};

use crate::types::{
    AttributeType, ClientId, ConsentId, Decision, RecordId, ScopeSet, Timestamp, UserId,
};

// ---------------------------------------------------------------------------
// AttributeRecord: one immutable ledger entry
// ---------------------------------------------------------------------------

/// A single attested value. Never updated in place; a correction is a new
/// record with a later `created_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeRecord {
    pub id: RecordId,
    /// Insertion order assigned by the store. Breaks `created_at` ties.
    pub seq: u64,
    pub user_id: UserId,
    pub attribute_type: AttributeType,
    pub value: String,
    pub is_validated: bool,
    pub created_at: Timestamp,
}

/// A record that has not been appended yet. The store assigns `seq`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAttribute {
    pub id: RecordId,
    pub user_id: UserId,
    pub attribute_type: AttributeType,
    pub value: String,
    pub is_validated: bool,
    pub created_at: Timestamp,
}

impl NewAttribute {
    pub fn into_record(self, seq: u64) -> AttributeRecord {
        AttributeRecord {
            id: self.id,
            seq,
            user_id: self.user_id,
            attribute_type: self.attribute_type,
            value: self.value,
            is_validated: self.is_validated,
            created_at: self.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// ConsentRecord: the (user, application) decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub id: ConsentId,
    pub user_id: UserId,
    pub client_id: ClientId,
    pub granted_scopes: ScopeSet,
    pub decision: Decision,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    /// Bumped on every write; guards compare-and-swap upserts.
    pub version: u64,
}

impl ConsentRecord {
    pub fn first(
        user_id: UserId,
        client_id: ClientId,
        scopes: ScopeSet,
        decision: Decision,
        now: Timestamp,
    ) -> Self {
        Self {
            id: ConsentId::generate(),
            user_id,
            client_id,
            granted_scopes: scopes,
            decision,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// The record that supersedes `self` with a new decision and scope set.
    pub fn superseded(&self, scopes: ScopeSet, decision: Decision, now: Timestamp) -> Self {
        Self {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            client_id: self.client_id.clone(),
            granted_scopes: scopes,
            decision,
            created_at: self.created_at,
            updated_at: now.max(self.updated_at),
            version: self.version + 1,
        }
    }

    pub fn is_granted(&self) -> bool {
        self.decision == Decision::Granted
    }
}

// ---------------------------------------------------------------------------
// Application: what the registry knows about a relying party
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub client_id: ClientId,
    pub name: String,
    pub owner_user_id: UserId,
    pub declared_scopes: ScopeSet,
    pub redirect_targets: Vec<String>,
    #[serde(default)]
    pub disabled: bool,
}

impl Application {
    pub fn redirect_target(&self) -> Option<&str> {
        self.redirect_targets.first().map(|s| s.as_str())
    }
}
