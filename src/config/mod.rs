use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::auth::CallerConfig;
use crate::credentials::{RotationPolicy, Timeouts};
use crate::crypto::{CryptoEngine, KdfParams, KeyMaterial};

/// Environment variable holding the active master secret.
pub const MASTER_KEY_ENV: &str = "CREDVAULT_MASTER_KEY";
/// Environment variable holding the KDF salt.
pub const KDF_SALT_ENV: &str = "CREDVAULT_KDF_SALT";

/// Complete service configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CredvaultConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub rotation: RotationPolicy,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Upper bound on any single repository call
    #[serde(default = "default_storage_timeout")]
    pub timeout_seconds: u64,
}

fn default_database_path() -> String {
    "credvault.db".to_string()
}

fn default_storage_timeout() -> u64 {
    10
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            timeout_seconds: default_storage_timeout(),
        }
    }
}

/// Key settings. Secrets themselves only come from the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct CryptoConfig {
    #[serde(default = "default_key_id")]
    pub key_id: String,
    /// Fall back to a random per-process key when no master key is set.
    /// Local development only.
    #[serde(default)]
    pub allow_ephemeral_key: bool,
    #[serde(default = "default_kdf_memory_kib")]
    pub kdf_memory_kib: u32,
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
    #[serde(default = "default_kdf_parallelism")]
    pub kdf_parallelism: u32,
    #[serde(default)]
    pub retired_keys: Vec<RetiredKeyConfig>,
}

fn default_key_id() -> String {
    "primary".to_string()
}

fn default_kdf_memory_kib() -> u32 {
    KdfParams::default().memory_kib
}

fn default_kdf_iterations() -> u32 {
    KdfParams::default().iterations
}

fn default_kdf_parallelism() -> u32 {
    KdfParams::default().parallelism
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            key_id: default_key_id(),
            allow_ephemeral_key: false,
            kdf_memory_kib: default_kdf_memory_kib(),
            kdf_iterations: default_kdf_iterations(),
            kdf_parallelism: default_kdf_parallelism(),
            retired_keys: Vec::new(),
        }
    }
}

/// A key kept only to decrypt records written before a key rotation.
#[derive(Debug, Clone, Deserialize)]
pub struct RetiredKeyConfig {
    pub key_id: String,
    /// Name of the environment variable holding this key's master secret
    pub master_key_env: String,
    /// Name of the environment variable holding its salt; defaults to the
    /// active salt variable
    #[serde(default)]
    pub salt_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_refresh_timeout")]
    pub timeout_seconds: u64,
    /// Platform name → OAuth token endpoint
    #[serde(default)]
    pub token_urls: HashMap<String, String>,
}

fn default_refresh_timeout() -> u64 {
    30
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_refresh_timeout(),
            token_urls: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub callers: Vec<CallerConfig>,
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<CredvaultConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: CredvaultConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file {}", path))?;
    Ok(config)
}

impl CredvaultConfig {
    /// File named by `CREDVAULT_CONFIG` (defaults when unset), then
    /// environment overrides, then validation.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("CREDVAULT_CONFIG") {
            Ok(path) => load_config(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Overrides from environment variables. Unparseable values are ignored.
    pub fn apply_env_overrides<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = env("CREDVAULT_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = env("CREDVAULT_DATABASE_PATH") {
            self.storage.database_path = v;
        }
        if let Some(v) = env("CREDVAULT_ROTATION_THRESHOLD_PERCENT") {
            if let Ok(n) = v.parse::<u8>() {
                self.rotation.rotation_threshold_percent = n;
            }
        }
        if let Some(v) = env("CREDVAULT_AUTO_ROTATE_ENABLED") {
            if let Ok(b) = v.parse::<bool>() {
                self.rotation.auto_rotate_enabled = b;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Err(msg) = self.rotation.validate() {
            bail!("Invalid [rotation] config: {}", msg);
        }
        if self.storage.timeout_seconds == 0 {
            bail!("storage.timeout_seconds must be greater than 0");
        }
        if self.refresh.timeout_seconds == 0 {
            bail!("refresh.timeout_seconds must be greater than 0");
        }
        if self.crypto.key_id.trim().is_empty() {
            bail!("crypto.key_id must not be empty");
        }
        for caller in &self.auth.callers {
            if caller.token.trim().is_empty() || caller.user_id.trim().is_empty() {
                bail!("Every [[auth.callers]] entry needs a token and a user_id");
            }
        }
        Ok(())
    }

    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            memory_kib: self.crypto.kdf_memory_kib,
            iterations: self.crypto.kdf_iterations,
            parallelism: self.crypto.kdf_parallelism,
        }
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            storage: Duration::from_secs(self.storage.timeout_seconds),
            refresh: Duration::from_secs(self.refresh.timeout_seconds),
        }
    }

    /// Active key material from the environment, or an ephemeral key when
    /// allowed and no master key is set.
    pub fn build_key_material<F>(&self, env: F) -> Result<KeyMaterial>
    where
        F: Fn(&str) -> Option<String>,
    {
        match (env(MASTER_KEY_ENV), env(KDF_SALT_ENV)) {
            (Some(secret), Some(salt)) => {
                KeyMaterial::configured(self.crypto.key_id.clone(), secret, salt)
                    .context("Invalid master key material")
            }
            (Some(_), None) => bail!("{} is set but {} is missing", MASTER_KEY_ENV, KDF_SALT_ENV),
            (None, _) if self.crypto.allow_ephemeral_key => {
                Ok(KeyMaterial::ephemeral(self.crypto.key_id.clone()))
            }
            (None, _) => bail!(
                "{} and {} are required (set crypto.allow_ephemeral_key for local development)",
                MASTER_KEY_ENV,
                KDF_SALT_ENV
            ),
        }
    }

    /// Engine with the active key and every configured retired key.
    pub fn build_crypto_engine<F>(&self, env: F) -> Result<CryptoEngine>
    where
        F: Fn(&str) -> Option<String>,
    {
        let active = self.build_key_material(&env)?;
        let mut engine = CryptoEngine::new(active, self.kdf_params());

        for retired in &self.crypto.retired_keys {
            let secret = env(&retired.master_key_env).with_context(|| {
                format!(
                    "{} is required for retired key '{}'",
                    retired.master_key_env, retired.key_id
                )
            })?;
            let salt_env = retired.salt_env.as_deref().unwrap_or(KDF_SALT_ENV);
            let salt = env(salt_env).with_context(|| {
                format!("{} is required for retired key '{}'", salt_env, retired.key_id)
            })?;

            let material = KeyMaterial::configured(retired.key_id.clone(), secret, salt)
                .with_context(|| format!("Invalid material for retired key '{}'", retired.key_id))?;
            engine = engine
                .with_retired_key(material)
                .context("Failed to register retired key")?;
        }

        Ok(engine)
    }
}
