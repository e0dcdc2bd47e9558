use custodia_core::{
    AuditChainWriter, AuditEvent, AuditEventKind, ClaimSource, ClientId, ConsentStore,
    CustodiaError, CustodiaResult, UserId,
};
use custodia_ledger::ScopeResolver;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builds the claim payload the token issuer embeds for a (user, client)
/// pair. Only a Granted consent record lets anything through.
pub struct ClaimsAssembler {
    consents: Arc<dyn ConsentStore>,
    resolver: ScopeResolver,
    audit: Option<Arc<dyn AuditChainWriter>>,
}

impl ClaimsAssembler {
    pub fn new(consents: Arc<dyn ConsentStore>, resolver: ScopeResolver) -> Self {
        Self {
            consents,
            resolver,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditChainWriter>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Current values of every granted scope that can still be satisfied.
    pub fn assemble(
        &self,
        user_id: &UserId,
        client_id: &ClientId,
    ) -> CustodiaResult<BTreeMap<String, String>> {
        let record = match self.consents.get(user_id, client_id)? {
            Some(record) if record.is_granted() => record,
            // Absent, pending and denied all look the same from outside.
            _ => {
                tracing::info!(user_id = %user_id, client_id = %client_id, "claims refused");
                self.record_event(AuditEventKind::ClaimsRefused {
                    user_id: user_id.clone(),
                    client_id: client_id.clone(),
                });
                return Err(CustodiaError::AccessDenied);
            }
        };

        let resolution = self
            .resolver
            .resolve_retained(user_id, &record.granted_scopes)?;
        if !resolution.missing.is_empty() {
            tracing::debug!(
                user_id = %user_id,
                client_id = %client_id,
                omitted = %resolution.missing.to_scope_string(),
                "granted scopes no longer satisfiable"
            );
        }

        self.record_event(AuditEventKind::ClaimsAssembled {
            user_id: user_id.clone(),
            client_id: client_id.clone(),
            scopes: resolution.satisfied_scopes(),
        });
        Ok(resolution.values())
    }

    fn record_event(&self, kind: AuditEventKind) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.append(AuditEvent::new(kind)) {
                tracing::warn!(error = %e, "failed to append claims audit event");
            }
        }
    }
}

impl ClaimSource for ClaimsAssembler {
    fn claims_for(
        &self,
        user_id: &UserId,
        client_id: &ClientId,
    ) -> CustodiaResult<BTreeMap<String, String>> {
        self.assemble(user_id, client_id)
    }
}
