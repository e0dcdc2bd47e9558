pub mod audit;
pub mod in_memory_backend;
pub mod intake;
pub mod projection;
pub mod resolver;

#[cfg(test)]
mod log_capture;

#[cfg(feature = "sqlite")]
pub mod storage;

pub use audit::{
    AuditChain, AuditEntry, AuditStore, InMemoryAuditStore, DEFAULT_MEMORY_WINDOW,
};
pub use in_memory_backend::InMemoryLedger;
pub use intake::{IntakeGate, IntakePolicy, Submission};
pub use projection::latest_validated;
pub use resolver::{HistorySection, Resolution, ScopeResolver};

#[cfg(feature = "sqlite")]
pub use storage::{SqliteAuditStore, SqliteLedger};
