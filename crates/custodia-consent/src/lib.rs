pub mod checkpoint;
pub mod claims;
pub mod in_memory_backend;
pub mod manager;
pub mod registry;

#[cfg(test)]
mod log_capture;

#[cfg(feature = "sqlite")]
pub mod storage;

pub use checkpoint::{CheckpointState, ConsentCheckpoint};
pub use claims::ClaimsAssembler;
pub use in_memory_backend::InMemoryConsentStore;
pub use manager::{ConnectedApp, ConsentManager, Connections};
pub use registry::InMemoryRegistry;

#[cfg(feature = "sqlite")]
pub use storage::SqliteConsentStore;
