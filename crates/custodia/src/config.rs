use custodia_core::{Application, ScopeCatalog, ScopeName};
use custodia_ledger::IntakePolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::error::{RootError, RootResult};

/// Where ledger and consent records live.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// SQLite file under `data_dir` (default).
    #[default]
    Sqlite,
    /// Process memory only; everything is lost on exit.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// File name of the SQLite database, relative to `data_dir`.
    #[serde(default = "default_database_file")]
    pub database_file: String,
}

fn default_database_file() -> String {
    "custodia.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            database_file: default_database_file(),
        }
    }
}

/// How the intake gate treats submitted values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeConfig {
    /// Self-attested values count as validated on arrival.
    #[serde(default = "default_mark_validated")]
    pub mark_validated: bool,

    /// Longest accepted value after trimming, in characters.
    #[serde(default = "default_max_value_len")]
    pub max_value_len: usize,
}

fn default_mark_validated() -> bool {
    true
}

fn default_max_value_len() -> usize {
    custodia_ledger::intake::DEFAULT_MAX_VALUE_LEN
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            mark_validated: default_mark_validated(),
            max_value_len: default_max_value_len(),
        }
    }
}

impl IntakeConfig {
    pub fn policy(&self) -> IntakePolicy {
        IntakePolicy {
            mark_validated: self.mark_validated,
            max_value_len: self.max_value_len,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Entries kept when the audit log lives in memory. The SQLite backend
    /// keeps every entry in the database instead.
    #[serde(default = "default_memory_window")]
    pub memory_window: usize,
}

fn default_memory_window() -> usize {
    custodia_ledger::DEFAULT_MEMORY_WINDOW
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            memory_window: default_memory_window(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Standard scopes this deployment does not offer.
    #[serde(default)]
    pub disabled_scopes: Vec<ScopeName>,
}

impl CatalogConfig {
    pub fn build(&self) -> RootResult<ScopeCatalog> {
        Ok(ScopeCatalog::standard_without(&self.disabled_scopes)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Claim under which userinfo nests the assembled attributes.
    #[serde(default = "default_claims_namespace")]
    pub claims_namespace: String,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_claims_namespace() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            claims_namespace: default_claims_namespace(),
        }
    }
}

/// Top-level configuration for the Custodia binary.
///
/// Loaded from a TOML file (typically `~/.custodia/config.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub intake: IntakeConfig,

    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub server: ServerConfig,

    /// Registered relying parties. Client secrets are not kept here.
    #[serde(default)]
    pub applications: Vec<Application>,
}

fn default_data_dir() -> PathBuf {
    dirs_or_default(".custodia")
}

/// Returns `$HOME/<suffix>` if HOME is available, otherwise `./<suffix>`.
fn dirs_or_default(suffix: &str) -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(suffix))
        .unwrap_or_else(|_| PathBuf::from(suffix))
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            storage: StorageConfig::default(),
            intake: IntakeConfig::default(),
            catalog: CatalogConfig::default(),
            audit: AuditConfig::default(),
            server: ServerConfig::default(),
            applications: Vec::new(),
        }
    }
}

impl RootConfig {
    /// Load configuration from a TOML file. If the file does not exist,
    /// returns a default configuration.
    pub fn load(path: &Path) -> RootResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(RootError::Io)?;
        let config: RootConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> RootResult<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| RootError::Config(format!("TOML serialize error: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(RootError::Io)?;
        }
        std::fs::write(path, contents).map_err(RootError::Io)?;
        Ok(())
    }

    pub fn validate(&self) -> RootResult<()> {
        if self.intake.max_value_len == 0 {
            return Err(RootError::Config("intake.max_value_len must be > 0".into()));
        }
        if self.audit.memory_window == 0 {
            return Err(RootError::Config("audit.memory_window must be > 0".into()));
        }
        if self.server.claims_namespace.trim().is_empty() {
            return Err(RootError::Config(
                "server.claims_namespace must not be empty".into(),
            ));
        }
        if self.storage.backend == StorageBackend::Sqlite
            && self.storage.database_file.trim().is_empty()
        {
            return Err(RootError::Config(
                "storage.database_file must not be empty".into(),
            ));
        }

        let catalog = self.catalog.build()?;
        let mut seen = BTreeSet::new();
        for app in &self.applications {
            if !seen.insert(app.client_id.clone()) {
                return Err(RootError::Config(format!(
                    "application {} is registered twice",
                    app.client_id
                )));
            }
            let unknown = catalog.unknown_in(&app.declared_scopes);
            if !unknown.is_empty() {
                return Err(RootError::Config(format!(
                    "application {} declares unknown scopes: {}",
                    app.client_id,
                    unknown.to_scope_string()
                )));
            }
            if app.redirect_targets.is_empty() {
                return Err(RootError::Config(format!(
                    "application {} has no redirect target",
                    app.client_id
                )));
            }
        }
        Ok(())
    }

    /// Absolute path of the SQLite database file.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.database_file)
    }

    /// Return the path to the default config file location.
    pub fn default_config_path() -> PathBuf {
        dirs_or_default(".custodia/config.toml")
    }
}
