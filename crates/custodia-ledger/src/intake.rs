use custodia_core::{
    AttributeRecord, AuditChainWriter, AuditEvent, AuditEventKind, CustodiaError, CustodiaResult,
    NewAttribute, RecordId, ScopeName, ScopeSet, Timestamp, UserId, ValidationIssue,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::resolver::{Resolution, ScopeResolver};

pub const DEFAULT_MAX_VALUE_LEN: usize = 1024;

/// How submitted values are checked and flagged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakePolicy {
    /// Whether self-attested values count as validated on arrival.
    pub mark_validated: bool,
    /// Upper bound on a trimmed value, in characters.
    pub max_value_len: usize,
}

impl Default for IntakePolicy {
    fn default() -> Self {
        Self {
            mark_validated: true,
            max_value_len: DEFAULT_MAX_VALUE_LEN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub appended: Vec<AttributeRecord>,
    /// The requested set re-resolved after the append.
    pub resolution: Resolution,
}

/// Validates submitted values and appends them to the ledger as one batch.
pub struct IntakeGate {
    resolver: ScopeResolver,
    policy: IntakePolicy,
    audit: Option<Arc<dyn AuditChainWriter>>,
}

impl IntakeGate {
    pub fn new(resolver: ScopeResolver, policy: IntakePolicy) -> Self {
        Self {
            resolver,
            policy,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditChainWriter>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn policy(&self) -> &IntakePolicy {
        &self.policy
    }

    pub fn resolver(&self) -> &ScopeResolver {
        &self.resolver
    }

    /// Append `entries` (scope name to raw value) and re-resolve `requested`.
    ///
    /// Either every entry is appended or none is. All problems are reported
    /// together so the form can be re-prompted in one pass.
    pub fn submit(
        &self,
        user_id: &UserId,
        entries: &BTreeMap<String, String>,
        requested: &ScopeSet,
    ) -> CustodiaResult<Submission> {
        let unknown_requested = self.resolver.catalog().unknown_in(requested);
        if !unknown_requested.is_empty() {
            tracing::error!(
                user_id = %user_id,
                unknown = %unknown_requested.to_scope_string(),
                "submission re-resolves scopes missing from the catalog"
            );
            return Err(CustodiaError::Configuration(format!(
                "unknown scopes requested: {}",
                unknown_requested.to_scope_string()
            )));
        }

        let batch = self.validate(user_id, entries)?;
        let appended = self.resolver.ledger().append_batch(&batch)?;

        tracing::info!(
            user_id = %user_id,
            count = appended.len(),
            validated = self.policy.mark_validated,
            "attributes appended"
        );

        if let Some(audit) = &self.audit {
            let event = AuditEvent::new(AuditEventKind::AttributesAppended {
                user_id: user_id.clone(),
                types: appended.iter().map(|r| r.attribute_type).collect(),
            });
            if let Err(e) = audit.append(event) {
                tracing::warn!(user_id = %user_id, error = %e, "failed to audit intake batch");
            }
        }

        let resolution = self.resolver.resolve(user_id, requested)?;
        Ok(Submission {
            appended,
            resolution,
        })
    }

    fn validate(
        &self,
        user_id: &UserId,
        entries: &BTreeMap<String, String>,
    ) -> CustodiaResult<Vec<NewAttribute>> {
        if entries.is_empty() {
            return Err(CustodiaError::validation(ValidationIssue::EmptySubmission));
        }

        let now = Timestamp::now();
        let mut issues = Vec::new();
        let mut batch = Vec::with_capacity(entries.len());

        // BTreeMap iteration gives the sorted scope order the batch is written in.
        for (name, raw) in entries {
            let scope = ScopeName::new(name.as_str());
            let Some(attribute_type) = self.resolver.catalog().attribute_type(&scope) else {
                issues.push(ValidationIssue::UnknownScope { scope });
                continue;
            };

            let value = raw.trim();
            if value.is_empty() {
                issues.push(ValidationIssue::EmptyValue { scope });
                continue;
            }
            if value.chars().count() > self.policy.max_value_len {
                issues.push(ValidationIssue::ValueTooLong {
                    scope,
                    max_len: self.policy.max_value_len,
                });
                continue;
            }

            batch.push(NewAttribute {
                id: RecordId::generate(),
                user_id: user_id.clone(),
                attribute_type,
                value: value.to_string(),
                is_validated: self.policy.mark_validated,
                created_at: now,
            });
        }

        if !issues.is_empty() {
            tracing::info!(
                user_id = %user_id,
                issues = issues.len(),
                "intake submission rejected"
            );
            return Err(CustodiaError::Validation(issues));
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditChain;
    use crate::in_memory_backend::InMemoryLedger;
    use custodia_core::{AttributeType, LedgerStore, ScopeCatalog};

    fn gate_with(policy: IntakePolicy) -> (Arc<InMemoryLedger>, IntakeGate) {
        let ledger = Arc::new(InMemoryLedger::new());
        let resolver = ScopeResolver::new(ledger.clone(), Arc::new(ScopeCatalog::standard()));
        (ledger, IntakeGate::new(resolver, policy))
    }

    fn entries(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_submit_satisfies_missing_scopes() {
        let (_, gate) = gate_with(IntakePolicy::default());
        let user = UserId::new("u");
        let requested = ScopeSet::new(["email", "legal-id"]);

        let before = gate.resolver().resolve(&user, &requested).unwrap();
        assert_eq!(before.missing, requested);

        let sub = gate
            .submit(
                &user,
                &entries(&[("email", " a@b.cl "), ("legal-id", "12.345.678-9")]),
                &requested,
            )
            .unwrap();
        assert_eq!(sub.appended.len(), 2);
        assert!(sub.resolution.is_complete());
        assert_eq!(sub.resolution.values()["email"], "a@b.cl");
    }

    #[test]
    fn test_batch_is_written_in_sorted_scope_order() {
        let (_, gate) = gate_with(IntakePolicy::default());
        let sub = gate
            .submit(
                &UserId::new("u"),
                &entries(&[("phone", "1"), ("address", "Calle 1"), ("email", "e@x.cl")]),
                &ScopeSet::empty(),
            )
            .unwrap();
        let types: Vec<AttributeType> = sub.appended.iter().map(|r| r.attribute_type).collect();
        assert_eq!(
            types,
            vec![AttributeType::Address, AttributeType::Email, AttributeType::Phone]
        );
        assert!(sub.appended.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn test_all_issues_reported_and_nothing_appended() {
        let (ledger, gate) = gate_with(IntakePolicy {
            max_value_len: 5,
            ..IntakePolicy::default()
        });
        let err = gate
            .submit(
                &UserId::new("u"),
                &entries(&[
                    ("email", "   "),
                    ("phone", "1234567"),
                    ("rut", "1-9"),
                    ("address", "ok"),
                ]),
                &ScopeSet::empty(),
            )
            .unwrap_err();

        let issues = err.issues();
        assert_eq!(issues.len(), 3);
        assert!(issues.contains(&ValidationIssue::EmptyValue {
            scope: ScopeName::new("email")
        }));
        assert!(issues.contains(&ValidationIssue::ValueTooLong {
            scope: ScopeName::new("phone"),
            max_len: 5
        }));
        assert!(issues.contains(&ValidationIssue::UnknownScope {
            scope: ScopeName::new("rut")
        }));
        assert_eq!(ledger.count(), 0);
    }

    #[test]
    fn test_empty_submission_rejected() {
        let (_, gate) = gate_with(IntakePolicy::default());
        let err = gate
            .submit(&UserId::new("u"), &BTreeMap::new(), &ScopeSet::empty())
            .unwrap_err();
        assert_eq!(err.issues(), &[ValidationIssue::EmptySubmission]);
    }

    #[test]
    fn test_resubmitting_same_values_appends_again() {
        let (ledger, gate) = gate_with(IntakePolicy::default());
        let user = UserId::new("u");
        let requested = ScopeSet::new(["email"]);
        let values = entries(&[("email", "a@b.cl")]);

        let first = gate.submit(&user, &values, &requested).unwrap();
        let second = gate.submit(&user, &values, &requested).unwrap();

        assert_eq!(ledger.records_for_user(&user).unwrap().len(), 2);
        assert_eq!(first.resolution.values(), second.resolution.values());
    }

    #[test]
    fn test_unvalidated_policy_leaves_scopes_missing() {
        let (_, gate) = gate_with(IntakePolicy {
            mark_validated: false,
            ..IntakePolicy::default()
        });
        let sub = gate
            .submit(
                &UserId::new("u"),
                &entries(&[("income", "1500000")]),
                &ScopeSet::new(["income"]),
            )
            .unwrap();
        assert!(!sub.appended[0].is_validated);
        assert_eq!(sub.resolution.missing, ScopeSet::new(["income"]));
    }

    #[test]
    fn test_unknown_requested_scope_appends_nothing() {
        let (ledger, gate) = gate_with(IntakePolicy::default());
        let (result, logs) = crate::log_capture::capture_logs(|| {
            gate.submit(
                &UserId::new("u"),
                &entries(&[("email", "a@b.cl")]),
                &ScopeSet::new(["shoe-size"]),
            )
        });
        assert!(matches!(result, Err(CustodiaError::Configuration(_))));
        assert_eq!(ledger.count(), 0);
        assert!(logs.contains("ERROR"), "{}", logs);
        assert!(logs.contains("shoe-size"), "{}", logs);
    }

    #[test]
    fn test_batches_are_audited() {
        let (_, gate) = gate_with(IntakePolicy::default());
        let chain = Arc::new(AuditChain::new());
        let gate = gate.with_audit(chain.clone());
        gate.submit(
            &UserId::new("u"),
            &entries(&[("email", "a@b.cl")]),
            &ScopeSet::empty(),
        )
        .unwrap();
        assert_eq!(chain.len(), 1);
        assert!(chain.verify_chain().unwrap());
    }
}
