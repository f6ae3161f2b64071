//! Configuration types for contentdb.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{CmsError, Result};
use crate::sql::Ident;

/// Environment variable overriding `database.url`.
pub const DATABASE_URL_ENV: &str = "CMS_DATABASE_URL";

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CmsConfig {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Schema compilation and procedure generation.
    #[serde(default)]
    pub schema: SchemaConfig,

    /// Sync engine configuration.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Materialized view configuration.
    #[serde(default)]
    pub views: ViewsConfig,

    /// Migration configuration.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Upper bound of pooled connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connections kept open while idle.
    #[serde(default)]
    pub min_connections: u32,

    /// Recycle connections after this many seconds.
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime_secs: u64,

    /// Close connections idle for this many seconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Give up acquiring a connection after this many seconds.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: 0,
            max_lifetime_secs: default_max_lifetime(),
            idle_timeout_secs: default_idle_timeout(),
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }
}

impl DatabaseConfig {
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// Schema compilation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Live namespace (PostgreSQL schema) of the tenant.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Link levels expanded by query procedures.
    #[serde(default = "default_include_depth")]
    pub max_include_depth: u8,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            max_include_depth: default_include_depth(),
        }
    }
}

impl SchemaConfig {
    /// The live namespace as a validated identifier.
    pub fn namespace_ident(&self) -> Result<Ident> {
        Ident::new(&self.namespace)
    }
}

/// Sync engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Rate-limit retries per page before giving up.
    #[serde(default = "default_rate_limit_retries")]
    pub max_rate_limit_retries: u32,

    /// Backoff when the source does not advertise one, in milliseconds.
    #[serde(default = "default_backoff_ms")]
    pub default_backoff_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_rate_limit_retries: default_rate_limit_retries(),
            default_backoff_ms: default_backoff_ms(),
        }
    }
}

impl SyncConfig {
    pub fn default_backoff(&self) -> Duration {
        Duration::from_millis(self.default_backoff_ms)
    }
}

/// Materialized view configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewsConfig {
    /// Refresh worker pool size.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Dependency levels walked on publish; defaults to the include depth.
    #[serde(default)]
    pub dependency_depth: Option<u8>,

    /// Use `REFRESH MATERIALIZED VIEW CONCURRENTLY`.
    #[serde(default = "default_true")]
    pub concurrent_refresh: bool,
}

impl Default for ViewsConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            dependency_depth: None,
            concurrent_refresh: true,
        }
    }
}

/// Migration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Suffix of the namespace a migration builds into.
    #[serde(default = "default_shadow_suffix")]
    pub shadow_suffix: String,

    /// Suffix the previous live namespace is renamed to during a swap.
    #[serde(default = "default_retired_suffix")]
    pub retired_suffix: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            shadow_suffix: default_shadow_suffix(),
            retired_suffix: default_retired_suffix(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Colored output.
    #[serde(default = "default_true")]
    pub ansi: bool,

    /// Include the event target (module path).
    #[serde(default)]
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            ansi: true,
            with_target: false,
        }
    }
}

// Default value functions

fn default_true() -> bool {
    true
}

fn default_database_url() -> String {
    "postgres://localhost/contentdb".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_max_lifetime() -> u64 {
    1800
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_namespace() -> String {
    "content".to_string()
}

fn default_include_depth() -> u8 {
    3
}

fn default_rate_limit_retries() -> u32 {
    5
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_workers() -> usize {
    10
}

fn default_shadow_suffix() -> String {
    "_shadow".to_string()
}

fn default_retired_suffix() -> String {
    "_retired".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl CmsConfig {
    /// Load configuration from file.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&content).map_err(|e| CmsError::Config {
            message: format!("Failed to parse config: {}", e),
        })?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default paths.
    pub fn load_default() -> Result<Self> {
        // Try user config first
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("contentdb").join("config.toml");
            if user_config.exists() {
                return Self::load(&user_config);
            }
        }

        // Try local config
        let local_config = PathBuf::from("contentdb.toml");
        if local_config.exists() {
            return Self::load(&local_config);
        }

        let mut config = Self::default();
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
            if !url.is_empty() {
                self.database.url = url;
            }
        }
    }

    /// Reject values no component can run with.
    pub fn validate(&self) -> Result<()> {
        self.schema.namespace_ident().map_err(|_| {
            CmsError::config(format!(
                "schema.namespace {:?} is not a valid identifier",
                self.schema.namespace
            ))
        })?;
        if self.views.workers == 0 {
            return Err(CmsError::config("views.workers must be at least 1"));
        }
        if self.database.max_connections == 0 {
            return Err(CmsError::config("database.max_connections must be at least 1"));
        }
        if self.migration.shadow_suffix.is_empty()
            || self.migration.retired_suffix.is_empty()
            || self.migration.shadow_suffix == self.migration.retired_suffix
        {
            return Err(CmsError::config(
                "migration suffixes must be non-empty and distinct",
            ));
        }
        Ok(())
    }

    /// Dependency depth used by view refresh on publish.
    pub fn dependency_depth(&self) -> u8 {
        self.views
            .dependency_depth
            .unwrap_or(self.schema.max_include_depth)
    }
}
