//! The authorization checkpoint a user passes through before an application
//! receives any data.
//!
//! ```text
//! Unauthenticated -> Evaluating -> Collecting -> Evaluating (loop)
//!                              \-> AwaitingDecision -> Granted | Denied
//! ```
//!
//! `Evaluating` is transient and never returned. Every call recomputes the
//! state from the stores, so the checkpoint itself holds no session data.

use custodia_core::{
    Application, ApplicationRegistry, ClientId, ConsentRecord, CustodiaError, CustodiaResult,
    ScopeDefinition, ScopeSet, Session, UserId, ValidationIssue,
};
use custodia_ledger::{IntakeGate, Resolution};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::manager::ConsentManager;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CheckpointState {
    /// No session; the caller must send the user to log in first.
    Unauthenticated,
    /// Some requested scopes have no validated value yet.
    Collecting {
        client_id: ClientId,
        application_name: String,
        requested: ScopeSet,
        /// Catalog entries for the missing scopes, in request order.
        prompts: Vec<ScopeDefinition>,
        resolution: Resolution,
    },
    /// Everything is satisfied; show the accept/deny prompt.
    AwaitingDecision {
        client_id: ClientId,
        application_name: String,
        requested: ScopeSet,
        resolution: Resolution,
        record: ConsentRecord,
    },
    Granted {
        redirect_uri: String,
        record: ConsentRecord,
    },
    Denied {
        redirect_uri: String,
        record: ConsentRecord,
    },
}

impl CheckpointState {
    pub fn name(&self) -> &'static str {
        match self {
            CheckpointState::Unauthenticated => "unauthenticated",
            CheckpointState::Collecting { .. } => "collecting",
            CheckpointState::AwaitingDecision { .. } => "awaiting_decision",
            CheckpointState::Granted { .. } => "granted",
            CheckpointState::Denied { .. } => "denied",
        }
    }

    pub fn redirect_uri(&self) -> Option<&str> {
        match self {
            CheckpointState::Granted { redirect_uri, .. }
            | CheckpointState::Denied { redirect_uri, .. } => Some(redirect_uri),
            _ => None,
        }
    }
}

pub struct ConsentCheckpoint {
    registry: Arc<dyn ApplicationRegistry>,
    gate: Arc<IntakeGate>,
    manager: Arc<ConsentManager>,
}

impl ConsentCheckpoint {
    pub fn new(
        registry: Arc<dyn ApplicationRegistry>,
        gate: Arc<IntakeGate>,
        manager: Arc<ConsentManager>,
    ) -> Self {
        Self {
            registry,
            gate,
            manager,
        }
    }

    pub fn evaluate(
        &self,
        session: &Session,
        client_id: &ClientId,
        narrower: Option<&ScopeSet>,
    ) -> CustodiaResult<CheckpointState> {
        let Some(user_id) = &session.user_id else {
            return Ok(CheckpointState::Unauthenticated);
        };
        let app = self.application(client_id)?;
        let requested = requested_scopes(&app, narrower)?;
        self.evaluate_for(user_id, &app, requested)
    }

    /// Feed collected values through the intake gate, then evaluate again.
    pub fn submit(
        &self,
        session: &Session,
        client_id: &ClientId,
        narrower: Option<&ScopeSet>,
        entries: &BTreeMap<String, String>,
    ) -> CustodiaResult<CheckpointState> {
        let Some(user_id) = &session.user_id else {
            return Ok(CheckpointState::Unauthenticated);
        };
        let app = self.application(client_id)?;
        let requested = requested_scopes(&app, narrower)?;
        self.gate.submit(user_id, entries, &requested)?;
        self.evaluate_for(user_id, &app, requested)
    }

    /// Record the accept/deny answer. A grant that races a data change is
    /// still refused by the manager's own check.
    pub fn decide(
        &self,
        session: &Session,
        client_id: &ClientId,
        narrower: Option<&ScopeSet>,
        accept: bool,
    ) -> CustodiaResult<CheckpointState> {
        let Some(user_id) = &session.user_id else {
            return Ok(CheckpointState::Unauthenticated);
        };
        let app = self.application(client_id)?;
        let requested = requested_scopes(&app, narrower)?;
        let target = app.redirect_target().ok_or_else(|| {
            CustodiaError::Configuration(format!(
                "application {} has no redirect target",
                app.client_id
            ))
        })?;
        let target = target.to_string();

        let record = self
            .manager
            .decide(user_id, &app.client_id, &requested, accept)?;

        if accept {
            Ok(CheckpointState::Granted {
                redirect_uri: target,
                record,
            })
        } else {
            Ok(CheckpointState::Denied {
                redirect_uri: with_access_denied(&target),
                record,
            })
        }
    }

    fn application(&self, client_id: &ClientId) -> CustodiaResult<Application> {
        match self.registry.get(client_id)? {
            Some(app) if !app.disabled => Ok(app),
            Some(_) => {
                tracing::error!(client_id = %client_id, "checkpoint reached for disabled application");
                Err(CustodiaError::Configuration(format!(
                    "application {} is disabled",
                    client_id
                )))
            }
            None => {
                tracing::error!(client_id = %client_id, "checkpoint reached for unknown application");
                Err(CustodiaError::Configuration(format!(
                    "unknown application {}",
                    client_id
                )))
            }
        }
    }

    fn evaluate_for(
        &self,
        user_id: &UserId,
        app: &Application,
        requested: ScopeSet,
    ) -> CustodiaResult<CheckpointState> {
        let resolution = self.gate.resolver().resolve(user_id, &requested)?;

        if !resolution.is_complete() {
            let catalog = self.gate.resolver().catalog();
            let prompts = resolution
                .missing
                .iter()
                .filter_map(|s| catalog.lookup(s).cloned())
                .collect();
            tracing::debug!(
                user_id = %user_id,
                client_id = %app.client_id,
                missing = %resolution.missing.to_scope_string(),
                "collecting missing data"
            );
            return Ok(CheckpointState::Collecting {
                client_id: app.client_id.clone(),
                application_name: app.name.clone(),
                requested,
                prompts,
                resolution,
            });
        }

        let record = self.manager.begin(user_id, &app.client_id, &requested)?;
        Ok(CheckpointState::AwaitingDecision {
            client_id: app.client_id.clone(),
            application_name: app.name.clone(),
            requested,
            resolution,
            record,
        })
    }
}

/// The declared scopes, or a narrower request that stays inside them.
fn requested_scopes(app: &Application, narrower: Option<&ScopeSet>) -> CustodiaResult<ScopeSet> {
    let Some(narrower) = narrower else {
        return Ok(app.declared_scopes.clone());
    };
    let undeclared: Vec<ValidationIssue> = narrower
        .difference(&app.declared_scopes)
        .iter()
        .map(|scope| ValidationIssue::ScopeNotDeclared {
            scope: scope.clone(),
        })
        .collect();
    if !undeclared.is_empty() {
        return Err(CustodiaError::Validation(undeclared));
    }
    Ok(narrower.clone())
}

/// Append `error=access_denied` to the query, keeping any fragment last.
fn with_access_denied(target: &str) -> String {
    let (base, fragment) = match target.split_once('#') {
        Some((base, frag)) => (base, Some(frag)),
        None => (target, None),
    };
    let sep = if base.contains('?') { '&' } else { '?' };
    match fragment {
        Some(frag) => format!("{}{}error=access_denied#{}", base, sep, frag),
        None => format!("{}{}error=access_denied", base, sep),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::ClaimsAssembler;
    use crate::in_memory_backend::InMemoryConsentStore;
    use crate::registry::InMemoryRegistry;
    use custodia_core::{ConsentStore, Decision, LedgerStore, ScopeCatalog};
    use custodia_ledger::{InMemoryLedger, IntakePolicy, ScopeResolver};

    struct Harness {
        checkpoint: ConsentCheckpoint,
        assembler: ClaimsAssembler,
        registry: Arc<InMemoryRegistry>,
    }

    fn app(declared: &[&str]) -> Application {
        Application {
            client_id: ClientId::new("banco"),
            name: "Banco Ejemplo".into(),
            owner_user_id: UserId::new("dev"),
            declared_scopes: ScopeSet::new(declared.iter().copied()),
            redirect_targets: vec!["https://banco.example/callback?state=xyz".into()],
            disabled: false,
        }
    }

    fn harness() -> Harness {
        let ledger: Arc<dyn LedgerStore> = Arc::new(InMemoryLedger::new());
        let consents: Arc<dyn ConsentStore> = Arc::new(InMemoryConsentStore::new());
        let resolver = ScopeResolver::new(ledger, Arc::new(ScopeCatalog::standard()));
        let registry = Arc::new(InMemoryRegistry::new([app(&["email", "legal-id"])]));
        let gate = Arc::new(IntakeGate::new(resolver.clone(), IntakePolicy::default()));
        let manager = Arc::new(ConsentManager::new(consents.clone(), resolver.clone()));
        Harness {
            checkpoint: ConsentCheckpoint::new(registry.clone(), gate, manager),
            assembler: ClaimsAssembler::new(consents, resolver),
            registry,
        }
    }

    fn session() -> Session {
        Session::authenticated("u-1")
    }

    fn client() -> ClientId {
        ClientId::new("banco")
    }

    fn entries(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_anonymous_session_is_unauthenticated() {
        let h = harness();
        let state = h
            .checkpoint
            .evaluate(&Session::anonymous(), &client(), None)
            .unwrap();
        assert_eq!(state, CheckpointState::Unauthenticated);
    }

    #[test]
    fn test_full_journey_collect_then_grant() {
        let h = harness();

        let state = h.checkpoint.evaluate(&session(), &client(), None).unwrap();
        let CheckpointState::Collecting { prompts, .. } = &state else {
            panic!("expected collecting, got {}", state.name());
        };
        let labels: Vec<&str> = prompts.iter().map(|p| p.display_label.as_str()).collect();
        assert_eq!(labels, vec!["Correo electrónico", "RUT / DNI"]);

        // Partial submission stays in collecting.
        let state = h
            .checkpoint
            .submit(&session(), &client(), None, &entries(&[("email", "a@b.cl")]))
            .unwrap();
        assert_eq!(state.name(), "collecting");

        let state = h
            .checkpoint
            .submit(
                &session(),
                &client(),
                None,
                &entries(&[("legal-id", "12.345.678-9")]),
            )
            .unwrap();
        let CheckpointState::AwaitingDecision { record, .. } = &state else {
            panic!("expected awaiting_decision, got {}", state.name());
        };
        assert_eq!(record.decision, Decision::Pending);

        let state = h
            .checkpoint
            .decide(&session(), &client(), None, true)
            .unwrap();
        assert_eq!(
            state.redirect_uri(),
            Some("https://banco.example/callback?state=xyz")
        );

        let claims = h
            .assembler
            .assemble(&UserId::new("u-1"), &client())
            .unwrap();
        assert_eq!(claims["legal-id"], "12.345.678-9");
        assert_eq!(claims["email"], "a@b.cl");
    }

    #[test]
    fn test_deny_redirects_with_error() {
        let h = harness();
        let state = h
            .checkpoint
            .decide(&session(), &client(), None, false)
            .unwrap();
        let CheckpointState::Denied { redirect_uri, record } = state else {
            panic!("expected denied");
        };
        assert_eq!(
            redirect_uri,
            "https://banco.example/callback?state=xyz&error=access_denied"
        );
        assert_eq!(record.decision, Decision::Denied);
    }

    #[test]
    fn test_grant_while_collecting_is_refused() {
        let h = harness();
        let err = h
            .checkpoint
            .decide(&session(), &client(), None, true)
            .unwrap_err();
        assert!(matches!(
            err.issues(),
            [ValidationIssue::UnsatisfiedScopes { .. }]
        ));
    }

    #[test]
    fn test_narrower_request() {
        let h = harness();
        h.checkpoint
            .submit(
                &session(),
                &client(),
                None,
                &entries(&[("email", "a@b.cl")]),
            )
            .unwrap();

        let narrow = ScopeSet::new(["email"]);
        let state = h
            .checkpoint
            .evaluate(&session(), &client(), Some(&narrow))
            .unwrap();
        assert_eq!(state.name(), "awaiting_decision");

        let wide = ScopeSet::new(["email", "income"]);
        let err = h
            .checkpoint
            .evaluate(&session(), &client(), Some(&wide))
            .unwrap_err();
        assert_eq!(
            err.issues(),
            &[ValidationIssue::ScopeNotDeclared {
                scope: "income".into()
            }]
        );
    }

    #[test]
    fn test_unknown_and_disabled_apps() {
        let h = harness();
        let (result, logs) = crate::log_capture::capture_logs(|| {
            h.checkpoint
                .evaluate(&session(), &ClientId::new("nope"), None)
        });
        assert!(matches!(result, Err(CustodiaError::Configuration(_))));
        assert!(logs.contains("ERROR") && logs.contains("unknown application"), "{}", logs);

        let mut disabled = app(&["email"]);
        disabled.disabled = true;
        h.registry.register(disabled).unwrap();
        let (result, logs) = crate::log_capture::capture_logs(|| {
            h.checkpoint.evaluate(&session(), &client(), None)
        });
        assert!(matches!(result, Err(CustodiaError::Configuration(ref m)) if m.contains("disabled")));
        assert!(logs.contains("ERROR") && logs.contains("disabled application"), "{}", logs);
    }

    #[test]
    fn test_with_access_denied() {
        assert_eq!(
            with_access_denied("https://rp/cb"),
            "https://rp/cb?error=access_denied"
        );
        assert_eq!(
            with_access_denied("https://rp/cb?a=1#frag"),
            "https://rp/cb?a=1&error=access_denied#frag"
        );
    }
}
