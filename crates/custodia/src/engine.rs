//! Wires stores, resolver, gate, manager, assembler and checkpoint together
//! from a validated configuration.

use custodia_consent::{
    ClaimsAssembler, ConsentCheckpoint, ConsentManager, InMemoryConsentStore, InMemoryRegistry,
};
use custodia_core::{
    AuditChainWriter, AuditEvent, AuditEventKind, ConsentStore, LedgerStore, ScopeCatalog,
    Timestamp,
};
use custodia_ledger::{
    AuditChain, AuditStore, InMemoryAuditStore, InMemoryLedger, IntakeGate, ScopeResolver,
};
use std::sync::Arc;
use tracing::info;

use crate::config::{RootConfig, StorageBackend};
use crate::error::{RootError, RootResult};

pub struct Engine {
    pub catalog: Arc<ScopeCatalog>,
    pub ledger: Arc<dyn LedgerStore>,
    pub consents: Arc<dyn ConsentStore>,
    pub registry: Arc<InMemoryRegistry>,
    pub audit: Arc<AuditChain>,
    pub resolver: ScopeResolver,
    pub gate: Arc<IntakeGate>,
    pub manager: Arc<ConsentManager>,
    pub assembler: Arc<ClaimsAssembler>,
    pub checkpoint: ConsentCheckpoint,
}

impl Engine {
    pub fn build(config: &RootConfig) -> RootResult<Self> {
        let catalog = Arc::new(config.catalog.build()?);
        let (ledger, consents, audit) = open_stores(config)?;
        Ok(Self::assemble(config, catalog, ledger, consents, audit))
    }

    /// Build over caller-supplied stores. The audit log stays in memory.
    pub fn with_stores(
        config: &RootConfig,
        ledger: Arc<dyn LedgerStore>,
        consents: Arc<dyn ConsentStore>,
    ) -> RootResult<Self> {
        let catalog = Arc::new(config.catalog.build()?);
        let audit = memory_audit(config)?;
        Ok(Self::assemble(config, catalog, ledger, consents, audit))
    }

    fn assemble(
        config: &RootConfig,
        catalog: Arc<ScopeCatalog>,
        ledger: Arc<dyn LedgerStore>,
        consents: Arc<dyn ConsentStore>,
        audit: AuditChain,
    ) -> Self {
        let audit = Arc::new(audit);
        let audit_writer: Arc<dyn AuditChainWriter> = audit.clone();
        let registry = Arc::new(InMemoryRegistry::new(config.applications.iter().cloned()));

        let resolver = ScopeResolver::new(ledger.clone(), catalog.clone());
        let gate = Arc::new(
            IntakeGate::new(resolver.clone(), config.intake.policy())
                .with_audit(audit_writer.clone()),
        );
        let manager = Arc::new(
            ConsentManager::new(consents.clone(), resolver.clone())
                .with_audit(audit_writer.clone())
                .with_registry(registry.clone()),
        );
        let assembler = Arc::new(
            ClaimsAssembler::new(consents.clone(), resolver.clone()).with_audit(audit_writer),
        );
        let checkpoint = ConsentCheckpoint::new(registry.clone(), gate.clone(), manager.clone());

        Self {
            catalog,
            ledger,
            consents,
            registry,
            audit,
            resolver,
            gate,
            manager,
            assembler,
            checkpoint,
        }
    }

    /// Retention job: drop ledger records older than `days` days.
    pub fn purge(&self, days: u64) -> RootResult<usize> {
        let cutoff = Timestamp::now().days_before(days);
        let removed = self.ledger.purge_created_before(cutoff)?;
        info!(days, removed, cutoff = %cutoff.to_rfc3339(), "ledger purged");
        self.audit
            .append(AuditEvent::new(AuditEventKind::LedgerPurged { cutoff, removed }))?;
        Ok(removed)
    }
}

type Stores = (Arc<dyn LedgerStore>, Arc<dyn ConsentStore>, AuditChain);

fn memory_audit(config: &RootConfig) -> RootResult<AuditChain> {
    let store: Box<dyn AuditStore> =
        Box::new(InMemoryAuditStore::with_window(config.audit.memory_window));
    Ok(AuditChain::with_storage(store)?)
}

fn open_stores(config: &RootConfig) -> RootResult<Stores> {
    match config.storage.backend {
        StorageBackend::Memory => {
            info!(window = config.audit.memory_window, "using in-memory stores");
            Ok((
                Arc::new(InMemoryLedger::new()),
                Arc::new(InMemoryConsentStore::new()),
                memory_audit(config)?,
            ))
        }
        StorageBackend::Sqlite => open_sqlite(config),
    }
}

#[cfg(feature = "sqlite")]
fn open_sqlite(config: &RootConfig) -> RootResult<Stores> {
    let db_path = config.database_path();
    let db_path = db_path
        .to_str()
        .ok_or_else(|| RootError::Internal("database path not valid UTF-8".into()))?;
    info!(path = %db_path, "opening sqlite stores");
    let audit_store = custodia_ledger::SqliteAuditStore::open(db_path)?;
    Ok((
        Arc::new(custodia_ledger::SqliteLedger::open(db_path)?),
        Arc::new(custodia_consent::SqliteConsentStore::open(db_path)?),
        AuditChain::with_storage(Box::new(audit_store))?,
    ))
}

#[cfg(not(feature = "sqlite"))]
fn open_sqlite(_config: &RootConfig) -> RootResult<Stores> {
    Err(RootError::Config(
        "storage.backend = \"sqlite\" requires the sqlite feature".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use custodia_core::{AttributeType, NewAttribute, RecordId, UserId};

    fn memory_config() -> RootConfig {
        let mut config = RootConfig::default();
        config.storage.backend = StorageBackend::Memory;
        config
    }

    #[test]
    fn test_purge_is_audited() {
        let engine = Engine::build(&memory_config()).unwrap();
        engine
            .ledger
            .append_batch(&[NewAttribute {
                id: RecordId::generate(),
                user_id: UserId::new("u"),
                attribute_type: AttributeType::Email,
                value: "a@b.cl".into(),
                is_validated: true,
                created_at: Timestamp::from_seconds(10),
            }])
            .unwrap();

        assert_eq!(engine.purge(30).unwrap(), 1);
        assert_eq!(engine.purge(30).unwrap(), 0);
        assert_eq!(engine.audit.len(), 2);
    }

    #[test]
    fn test_memory_audit_honors_window() {
        let mut config = memory_config();
        config.audit.memory_window = 1;
        let engine = Engine::build(&config).unwrap();
        engine.purge(30).unwrap();
        engine.purge(30).unwrap();
        assert_eq!(engine.audit.len(), 1);
        assert!(engine.audit.verify_chain().unwrap());
    }

    #[test]
    fn test_disabled_scope_config_shapes_catalog() {
        let mut config = memory_config();
        config.catalog.disabled_scopes = vec!["income".into()];
        let engine = Engine::build(&config).unwrap();
        assert!(engine.catalog.lookup(&"income".into()).is_none());
    }
}
