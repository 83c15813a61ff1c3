// ⚙️ Settings - TOML file with environment overrides
//
// Lookup order: explicit path, DISPENSER_CONFIG, ./dispenser.toml, defaults.

use crate::allocator::RetryPolicy;
use crate::credentials::CredentialScheme;
use crate::decompose::Denominations;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "dispenser.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub allocation: AllocationConfig,
    pub credentials: CredentialsConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: PathBuf::from("dispenser.db"),
            busy_timeout_ms: 5000,
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    pub denominations: Denominations,
    #[serde(flatten)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub scheme: CredentialScheme,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub admin_password: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "0.0.0.0:8000".to_string(),
            admin_password: "admin".to_string(),
        }
    }
}

impl Settings {
    /// Resolve and load settings, then apply environment overrides
    pub fn load(explicit: Option<&Path>) -> Result<Settings> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| env::var_os("DISPENSER_CONFIG").map(PathBuf::from))
            .or_else(|| {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                default.exists().then_some(default)
            });

        let mut settings = match path {
            Some(path) => Settings::from_file(&path)?,
            None => Settings::default(),
        };

        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Settings> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Settings::from_toml(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Settings> {
        let settings: Settings = toml::from_str(content)?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(path) = env::var_os("DISPENSER_DB") {
            self.database.path = PathBuf::from(path);
        }
        if let Ok(password) = env::var("DISPENSER_ADMIN_PASSWORD") {
            self.server.admin_password = password;
        }
        if let Ok(bind) = env::var("DISPENSER_BIND") {
            self.server.bind = bind;
        }
    }

    /// Shape constraints are enforced while deserialising; greedy optimality
    /// is checked here.
    pub fn validate(&self) -> Result<()> {
        self.allocation
            .denominations
            .verify_greedy_optimal()
            .context("Configured denominations are not supported")?;
        Ok(())
    }
}
