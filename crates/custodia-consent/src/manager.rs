use custodia_core::{
    ApplicationRegistry, AuditChainWriter, AuditEvent, AuditEventKind, ClientId, ConsentRecord,
    ConsentStore, CustodiaError, CustodiaResult, Decision, ScopeSet, Timestamp, UserId,
    ValidationIssue,
};
use custodia_ledger::ScopeResolver;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Attempts per upsert: the first write plus one retry on a fresh read.
const UPSERT_ATTEMPTS: usize = 2;

/// One consent record as the settings view lists it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedApp {
    /// Display name from the registry; `None` once the application is gone.
    pub application_name: Option<String>,
    #[serde(flatten)]
    pub record: ConsentRecord,
}

/// A user's consent records split by decision, for the settings view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connections {
    pub allowed: Vec<ConnectedApp>,
    pub revoked: Vec<ConnectedApp>,
    pub pending: Vec<ConnectedApp>,
}

/// Owns every write to consent records.
pub struct ConsentManager {
    store: Arc<dyn ConsentStore>,
    resolver: ScopeResolver,
    audit: Option<Arc<dyn AuditChainWriter>>,
    registry: Option<Arc<dyn ApplicationRegistry>>,
}

impl ConsentManager {
    pub fn new(store: Arc<dyn ConsentStore>, resolver: ScopeResolver) -> Self {
        Self {
            store,
            resolver,
            audit: None,
            registry: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditChainWriter>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Registry used to name applications in `connections`.
    pub fn with_registry(mut self, registry: Arc<dyn ApplicationRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn store(&self) -> &Arc<dyn ConsentStore> {
        &self.store
    }

    pub fn get(&self, user_id: &UserId, client_id: &ClientId) -> CustodiaResult<Option<ConsentRecord>> {
        self.store.get(user_id, client_id)
    }

    /// Record the user's answer for `requested`.
    ///
    /// Scopes outside the catalog are a configuration error for either
    /// answer. Accepting while any scope is still missing fails with
    /// `UnsatisfiedScopes`. Neither failure writes anything.
    pub fn decide(
        &self,
        user_id: &UserId,
        client_id: &ClientId,
        requested: &ScopeSet,
        accept: bool,
    ) -> CustodiaResult<ConsentRecord> {
        let unknown = self.resolver.catalog().unknown_in(requested);
        if !unknown.is_empty() {
            tracing::error!(
                user_id = %user_id,
                client_id = %client_id,
                unknown = %unknown.to_scope_string(),
                "decision names scopes missing from the catalog"
            );
            return Err(CustodiaError::Configuration(format!(
                "unknown scopes requested: {}",
                unknown.to_scope_string()
            )));
        }

        if accept {
            let resolution = self.resolver.resolve(user_id, requested)?;
            if !resolution.is_complete() {
                tracing::info!(
                    user_id = %user_id,
                    client_id = %client_id,
                    missing = %resolution.missing.to_scope_string(),
                    "grant refused, scopes still missing"
                );
                return Err(CustodiaError::validation(
                    ValidationIssue::UnsatisfiedScopes {
                        missing: resolution.missing,
                    },
                ));
            }
        }

        let decision = Decision::from_accept(accept);
        let record = self.upsert(user_id, client_id, requested, decision)?;

        tracing::info!(
            user_id = %user_id,
            client_id = %client_id,
            decision = %decision,
            version = record.version,
            "consent decided"
        );
        self.record_event(AuditEventKind::ConsentDecided {
            user_id: user_id.clone(),
            client_id: client_id.clone(),
            decision,
            scopes: requested.clone(),
        });
        Ok(record)
    }

    /// Create a Pending record the first time a user reaches the decision
    /// prompt. An existing record is returned untouched.
    pub fn begin(
        &self,
        user_id: &UserId,
        client_id: &ClientId,
        scopes: &ScopeSet,
    ) -> CustodiaResult<ConsentRecord> {
        if let Some(existing) = self.store.get(user_id, client_id)? {
            return Ok(existing);
        }

        let pending = ConsentRecord::first(
            user_id.clone(),
            client_id.clone(),
            scopes.clone(),
            Decision::Pending,
            Timestamp::now(),
        );
        if self.store.compare_and_swap(None, &pending)? {
            tracing::debug!(user_id = %user_id, client_id = %client_id, "pending consent recorded");
            return Ok(pending);
        }

        // Someone else created it between our read and write; theirs stands.
        self.store.get(user_id, client_id)?.ok_or_else(|| {
            CustodiaError::Conflict(format!(
                "consent for {} / {} vanished during creation",
                user_id, client_id
            ))
        })
    }

    /// Flip the pair to Denied in one atomic write. A pair that was never
    /// connected stays unconnected and yields `None`.
    pub fn revoke(
        &self,
        user_id: &UserId,
        client_id: &ClientId,
    ) -> CustodiaResult<Option<ConsentRecord>> {
        let revoked = self.store.mark_denied(user_id, client_id, Timestamp::now())?;
        match &revoked {
            Some(record) => {
                tracing::info!(
                    user_id = %user_id,
                    client_id = %client_id,
                    version = record.version,
                    "consent revoked"
                );
                self.record_event(AuditEventKind::ConsentRevoked {
                    user_id: user_id.clone(),
                    client_id: client_id.clone(),
                });
            }
            None => {
                tracing::debug!(user_id = %user_id, client_id = %client_id, "revoke of unconnected pair ignored");
            }
        }
        Ok(revoked)
    }

    pub fn connections(&self, user_id: &UserId) -> CustodiaResult<Connections> {
        let mut out = Connections::default();
        for record in self.store.list_for_user(user_id)? {
            let application_name = match &self.registry {
                Some(registry) => registry.get(&record.client_id)?.map(|app| app.name),
                None => None,
            };
            let bucket = match record.decision {
                Decision::Granted => &mut out.allowed,
                Decision::Denied => &mut out.revoked,
                Decision::Pending => &mut out.pending,
            };
            bucket.push(ConnectedApp {
                application_name,
                record,
            });
        }
        Ok(out)
    }

    fn upsert(
        &self,
        user_id: &UserId,
        client_id: &ClientId,
        scopes: &ScopeSet,
        decision: Decision,
    ) -> CustodiaResult<ConsentRecord> {
        for attempt in 1..=UPSERT_ATTEMPTS {
            let current = self.store.get(user_id, client_id)?;
            let now = Timestamp::now();
            let next = match &current {
                Some(existing) => existing.superseded(scopes.clone(), decision, now),
                None => ConsentRecord::first(
                    user_id.clone(),
                    client_id.clone(),
                    scopes.clone(),
                    decision,
                    now,
                ),
            };

            let expected = current.as_ref().map(|r| r.version);
            if self.store.compare_and_swap(expected, &next)? {
                return Ok(next);
            }
            tracing::warn!(
                user_id = %user_id,
                client_id = %client_id,
                attempt,
                "consent write lost a concurrent update"
            );
        }

        Err(CustodiaError::Conflict(format!(
            "consent for {} / {} changed concurrently",
            user_id, client_id
        )))
    }

    fn record_event(&self, kind: AuditEventKind) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.append(AuditEvent::new(kind)) {
                tracing::warn!(error = %e, "failed to append consent audit event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory_backend::InMemoryConsentStore;
    use crate::registry::InMemoryRegistry;
    use custodia_core::{Application, LedgerStore, ScopeCatalog};
    use custodia_ledger::{AuditChain, InMemoryLedger, IntakeGate, IntakePolicy};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        gate: IntakeGate,
        manager: ConsentManager,
        audit: Arc<AuditChain>,
    }

    fn harness_with_store(store: Arc<dyn ConsentStore>) -> Harness {
        let ledger: Arc<dyn LedgerStore> = Arc::new(InMemoryLedger::new());
        let resolver = ScopeResolver::new(ledger, Arc::new(ScopeCatalog::standard()));
        let audit = Arc::new(AuditChain::new());
        Harness {
            gate: IntakeGate::new(resolver.clone(), IntakePolicy::default()),
            manager: ConsentManager::new(store, resolver).with_audit(audit.clone()),
            audit,
        }
    }

    fn harness() -> Harness {
        harness_with_store(Arc::new(InMemoryConsentStore::new()))
    }

    fn fill(h: &Harness, pairs: &[(&str, &str)]) {
        let entries: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        h.gate
            .submit(&UserId::new("u"), &entries, &ScopeSet::empty())
            .unwrap();
    }

    fn user() -> UserId {
        UserId::new("u")
    }

    fn client() -> ClientId {
        ClientId::new("rp")
    }

    #[test]
    fn test_grant_with_missing_scopes_writes_nothing() {
        let h = harness();
        let err = h
            .manager
            .decide(&user(), &client(), &ScopeSet::new(["email"]), true)
            .unwrap_err();
        assert_eq!(
            err.issues(),
            &[ValidationIssue::UnsatisfiedScopes {
                missing: ScopeSet::new(["email"])
            }]
        );
        assert!(h.manager.get(&user(), &client()).unwrap().is_none());
    }

    #[test]
    fn test_deny_needs_no_data() {
        let h = harness();
        let rec = h
            .manager
            .decide(&user(), &client(), &ScopeSet::new(["email"]), false)
            .unwrap();
        assert_eq!(rec.decision, Decision::Denied);
    }

    #[test]
    fn test_unknown_scope_rejected_for_either_answer() {
        let h = harness();
        fill(&h, &[("email", "a@b.cl")]);
        let scopes = ScopeSet::new(["email", "shoe-size"]);

        for accept in [false, true] {
            let (result, logs) = crate::log_capture::capture_logs(|| {
                h.manager.decide(&user(), &client(), &scopes, accept)
            });
            assert!(
                matches!(result, Err(CustodiaError::Configuration(ref m)) if m.contains("shoe-size"))
            );
            assert!(logs.contains("ERROR"), "{}", logs);
        }
        assert!(h.manager.get(&user(), &client()).unwrap().is_none());
        assert!(h
            .audit
            .entries()
            .unwrap()
            .iter()
            .all(|e| !matches!(e.event.kind, AuditEventKind::ConsentDecided { .. })));
    }

    #[test]
    fn test_regrant_larger_set_keeps_single_record() {
        let h = harness();
        fill(&h, &[("email", "a@b.cl"), ("phone", "+56 9 1")]);

        let first = h
            .manager
            .decide(&user(), &client(), &ScopeSet::new(["email"]), true)
            .unwrap();
        let second = h
            .manager
            .decide(&user(), &client(), &ScopeSet::new(["email", "phone"]), true)
            .unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.version, first.version + 1);
        let stored = h.manager.store().list_for_user(&user()).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].granted_scopes, ScopeSet::new(["email", "phone"]));
    }

    #[test]
    fn test_revoke_never_connected_is_noop() {
        let h = harness();
        assert!(h.manager.revoke(&user(), &client()).unwrap().is_none());
        assert!(h.manager.get(&user(), &client()).unwrap().is_none());
    }

    #[test]
    fn test_revoke_keeps_record() {
        let h = harness();
        fill(&h, &[("email", "a@b.cl")]);
        h.manager
            .decide(&user(), &client(), &ScopeSet::new(["email"]), true)
            .unwrap();
        let revoked = h.manager.revoke(&user(), &client()).unwrap().unwrap();
        assert_eq!(revoked.decision, Decision::Denied);
        assert_eq!(revoked.granted_scopes, ScopeSet::new(["email"]));
    }

    #[test]
    fn test_begin_is_idempotent_and_does_not_override() {
        let h = harness();
        let scopes = ScopeSet::new(["email"]);
        let pending = h.manager.begin(&user(), &client(), &scopes).unwrap();
        assert_eq!(pending.decision, Decision::Pending);
        let again = h.manager.begin(&user(), &client(), &scopes).unwrap();
        assert_eq!(again.version, pending.version);

        h.manager.decide(&user(), &client(), &scopes, false).unwrap();
        let after = h.manager.begin(&user(), &client(), &scopes).unwrap();
        assert_eq!(after.decision, Decision::Denied);
    }

    #[test]
    fn test_connections_split_by_decision() {
        let h = harness();
        fill(&h, &[("email", "a@b.cl")]);
        let scopes = ScopeSet::new(["email"]);
        h.manager
            .decide(&user(), &ClientId::new("a"), &scopes, true)
            .unwrap();
        h.manager
            .decide(&user(), &ClientId::new("b"), &scopes, true)
            .unwrap();
        h.manager.revoke(&user(), &ClientId::new("b")).unwrap();
        h.manager.begin(&user(), &ClientId::new("c"), &scopes).unwrap();

        let conns = h.manager.connections(&user()).unwrap();
        assert_eq!(conns.allowed.len(), 1);
        assert_eq!(conns.revoked.len(), 1);
        assert_eq!(conns.pending.len(), 1);
        assert_eq!(conns.revoked[0].record.client_id, ClientId::new("b"));
        assert_eq!(conns.allowed[0].application_name, None);
    }

    #[test]
    fn test_connections_carry_application_name() {
        let registry = Arc::new(InMemoryRegistry::new([Application {
            client_id: ClientId::new("a"),
            name: "Banco Ejemplo".into(),
            owner_user_id: UserId::new("dev"),
            declared_scopes: ScopeSet::new(["email"]),
            redirect_targets: vec!["https://a/cb".into()],
            disabled: false,
        }]));
        let mut h = harness();
        h.manager = h.manager.with_registry(registry);
        fill(&h, &[("email", "a@b.cl")]);
        let scopes = ScopeSet::new(["email"]);
        h.manager
            .decide(&user(), &ClientId::new("a"), &scopes, true)
            .unwrap();
        h.manager
            .decide(&user(), &ClientId::new("gone"), &scopes, false)
            .unwrap();

        let conns = h.manager.connections(&user()).unwrap();
        assert_eq!(
            conns.allowed[0].application_name.as_deref(),
            Some("Banco Ejemplo")
        );
        assert_eq!(conns.revoked[0].application_name, None);
        assert_eq!(conns.allowed[0].record.decision, Decision::Granted);
    }

    #[test]
    fn test_decisions_are_audited() {
        let h = harness();
        h.manager
            .decide(&user(), &client(), &ScopeSet::new(["email"]), false)
            .unwrap();
        h.manager.revoke(&user(), &client()).unwrap();
        assert_eq!(h.audit.len(), 2);
        assert!(h.audit.verify_chain().unwrap());
    }

    /// Loses the first `losses` compare-and-swaps as if another writer got
    /// there first.
    struct RacingStore {
        inner: InMemoryConsentStore,
        losses: AtomicUsize,
    }

    impl ConsentStore for RacingStore {
        fn get(&self, u: &UserId, c: &ClientId) -> CustodiaResult<Option<ConsentRecord>> {
            self.inner.get(u, c)
        }

        fn compare_and_swap(
            &self,
            expected: Option<u64>,
            record: &ConsentRecord,
        ) -> CustodiaResult<bool> {
            if self.losses.load(Ordering::SeqCst) > 0 {
                self.losses.fetch_sub(1, Ordering::SeqCst);
                return Ok(false);
            }
            self.inner.compare_and_swap(expected, record)
        }

        fn mark_denied(
            &self,
            u: &UserId,
            c: &ClientId,
            at: Timestamp,
        ) -> CustodiaResult<Option<ConsentRecord>> {
            self.inner.mark_denied(u, c, at)
        }

        fn list_for_user(&self, u: &UserId) -> CustodiaResult<Vec<ConsentRecord>> {
            self.inner.list_for_user(u)
        }
    }

    #[test]
    fn test_single_lost_race_is_retried() {
        let h = harness_with_store(Arc::new(RacingStore {
            inner: InMemoryConsentStore::new(),
            losses: AtomicUsize::new(1),
        }));
        let rec = h
            .manager
            .decide(&user(), &client(), &ScopeSet::new(["email"]), false)
            .unwrap();
        assert_eq!(rec.decision, Decision::Denied);
    }

    #[test]
    fn test_two_lost_races_is_conflict() {
        let h = harness_with_store(Arc::new(RacingStore {
            inner: InMemoryConsentStore::new(),
            losses: AtomicUsize::new(2),
        }));
        let err = h
            .manager
            .decide(&user(), &client(), &ScopeSet::new(["email"]), false)
            .unwrap_err();
        assert!(matches!(err, CustodiaError::Conflict(_)));
        assert!(h.audit.is_empty());
    }
}
