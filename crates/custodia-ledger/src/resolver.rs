use custodia_core::{
    AttributeRecord, Category, CustodiaError, CustodiaResult, LedgerStore, ScopeCatalog,
    ScopeName, ScopeSet, UserId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::projection::latest_validated;

/// Outcome of resolving a scope set against one user's ledger.
///
/// Every requested scope lands in exactly one of `satisfied` or `missing`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub satisfied: BTreeMap<ScopeName, AttributeRecord>,
    /// In request order.
    pub missing: ScopeSet,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// Scope name to current value, the flat shape claims are emitted in.
    pub fn values(&self) -> BTreeMap<String, String> {
        self.satisfied
            .iter()
            .map(|(scope, rec)| (scope.as_str().to_string(), rec.value.clone()))
            .collect()
    }

    pub fn satisfied_scopes(&self) -> ScopeSet {
        ScopeSet::new(self.satisfied.keys().cloned())
    }
}

/// One category of a user's history, newest records first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySection {
    pub category: Category,
    pub title: String,
    pub records: Vec<AttributeRecord>,
}

/// Decides which requested scopes a user's validated history already covers.
#[derive(Clone)]
pub struct ScopeResolver {
    ledger: Arc<dyn LedgerStore>,
    catalog: Arc<ScopeCatalog>,
}

impl ScopeResolver {
    pub fn new(ledger: Arc<dyn LedgerStore>, catalog: Arc<ScopeCatalog>) -> Self {
        Self { ledger, catalog }
    }

    pub fn catalog(&self) -> &ScopeCatalog {
        &self.catalog
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerStore> {
        &self.ledger
    }

    /// Strict resolution. A scope the catalog does not know means the caller
    /// was configured with a bad scope list, so the whole request fails.
    pub fn resolve(&self, user_id: &UserId, requested: &ScopeSet) -> CustodiaResult<Resolution> {
        let unknown = self.catalog.unknown_in(requested);
        if !unknown.is_empty() {
            tracing::error!(
                user_id = %user_id,
                unknown = %unknown.to_scope_string(),
                "resolve called with scopes missing from the catalog"
            );
            return Err(CustodiaError::Configuration(format!(
                "unknown scopes requested: {}",
                unknown.to_scope_string()
            )));
        }
        self.resolve_known(user_id, requested)
    }

    /// Lenient resolution for previously granted sets. Scopes the catalog no
    /// longer knows are dropped instead of failing the request.
    pub fn resolve_retained(
        &self,
        user_id: &UserId,
        granted: &ScopeSet,
    ) -> CustodiaResult<Resolution> {
        let unknown = self.catalog.unknown_in(granted);
        if !unknown.is_empty() {
            tracing::warn!(
                user_id = %user_id,
                dropped = %unknown.to_scope_string(),
                "granted scopes no longer in catalog; omitting them"
            );
        }
        self.resolve_known(user_id, &granted.difference(&unknown))
    }

    fn resolve_known(&self, user_id: &UserId, requested: &ScopeSet) -> CustodiaResult<Resolution> {
        let records = self.ledger.validated_records(user_id)?;
        let mut latest = latest_validated(&records);

        let mut satisfied = BTreeMap::new();
        let mut missing = ScopeSet::empty();
        for scope in requested {
            let current = self
                .catalog
                .attribute_type(scope)
                .and_then(|t| latest.remove(&t));
            match current {
                Some(record) => {
                    satisfied.insert(scope.clone(), record);
                }
                None => missing.push(scope.clone()),
            }
        }

        tracing::debug!(
            user_id = %user_id,
            satisfied = satisfied.len(),
            missing = missing.len(),
            "scopes resolved"
        );
        Ok(Resolution { satisfied, missing })
    }

    /// The user's whole ledger grouped by catalog category, newest first
    /// inside each group. Types dropped from the catalog are left out.
    pub fn history(&self, user_id: &UserId) -> CustodiaResult<Vec<HistorySection>> {
        let mut records = self.ledger.records_for_user(user_id)?;
        records.sort_by(|a, b| (b.created_at, b.seq).cmp(&(a.created_at, a.seq)));

        let mut grouped: BTreeMap<Category, Vec<AttributeRecord>> = BTreeMap::new();
        for record in records {
            if let Some(def) = self.catalog.definition_for(record.attribute_type) {
                grouped.entry(def.category).or_default().push(record);
            }
        }

        Ok(grouped
            .into_iter()
            .map(|(category, records)| HistorySection {
                category,
                title: category.title().to_string(),
                records,
            })
            .collect())
    }
}
