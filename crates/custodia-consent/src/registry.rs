use custodia_core::{
    Application, ApplicationRegistry, ClientId, CustodiaError, CustodiaResult,
};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Registry backed by a map, loaded from configuration at startup.
pub struct InMemoryRegistry {
    apps: RwLock<BTreeMap<ClientId, Application>>,
}

impl InMemoryRegistry {
    pub fn new(apps: impl IntoIterator<Item = Application>) -> Self {
        Self {
            apps: RwLock::new(
                apps.into_iter()
                    .map(|app| (app.client_id.clone(), app))
                    .collect(),
            ),
        }
    }

    /// Add or replace an application.
    pub fn register(&self, app: Application) -> CustodiaResult<()> {
        let mut apps = self
            .apps
            .write()
            .map_err(|e| CustodiaError::Storage(format!("registry lock poisoned: {}", e)))?;
        tracing::debug!(client_id = %app.client_id, "application registered");
        apps.insert(app.client_id.clone(), app);
        Ok(())
    }
}

impl ApplicationRegistry for InMemoryRegistry {
    fn get(&self, client_id: &ClientId) -> CustodiaResult<Option<Application>> {
        let apps = self
            .apps
            .read()
            .map_err(|e| CustodiaError::Storage(format!("registry lock poisoned: {}", e)))?;
        Ok(apps.get(client_id).cloned())
    }

    fn list(&self) -> CustodiaResult<Vec<Application>> {
        let apps = self
            .apps
            .read()
            .map_err(|e| CustodiaError::Storage(format!("registry lock poisoned: {}", e)))?;
        Ok(apps.values().cloned().collect())
    }
}
