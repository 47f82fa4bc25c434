use serde::Deserialize;
use std::{env, path::Path, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    pub app: AppConfig,
    pub paths: PathsConfig,
    pub google: GoogleConfig,
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub worker: WorkerSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AppConfig {
    pub service_name: String,
    pub env: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PathsConfig {
    pub database: PathBuf,
    pub blob_root: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CryptoConfig {
    pub encryption_key_base64: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkerSettings {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: f64,
    #[serde(default = "default_history_poll_interval")]
    pub history_poll_interval_seconds: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            history_poll_interval_seconds: default_history_poll_interval(),
        }
    }
}

fn default_poll_interval() -> f64 {
    0.5
}

fn default_history_poll_interval() -> u64 {
    30
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ConfigBuild(config::ConfigError),
    #[error("failed to parse configuration: {0}")]
    Deserialize(config::ConfigError),
    #[error("missing required environment variable {0}")]
    MissingEnvVar(String),
}

impl Config {
    /// Load configuration from the provided path, apply environment overrides, and
    /// resolve any `env:` indirections.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(ConfigError::ConfigBuild)?;

        let mut cfg: Config = raw.try_deserialize().map_err(ConfigError::Deserialize)?;
        cfg.apply_env_overrides();
        cfg.resolve_env_markers()?;
        cfg.expand_paths();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(client_id) = env::var("GOOGLE_CLIENT_ID") {
            self.google.client_id = client_id;
        }
        if let Ok(client_secret) = env::var("GOOGLE_CLIENT_SECRET") {
            self.google.client_secret = client_secret;
        }
        if let Ok(key) = env::var("ENCRYPTION_KEY_BASE64") {
            self.crypto.encryption_key_base64 = key;
        }
    }

    fn resolve_env_markers(&mut self) -> Result<(), ConfigError> {
        apply_env_marker(&mut self.app.service_name)?;
        apply_env_marker(&mut self.app.env)?;
        apply_env_marker(&mut self.google.client_id)?;
        apply_env_marker(&mut self.google.client_secret)?;
        apply_env_marker(&mut self.google.redirect_uri)?;
        apply_env_marker(&mut self.crypto.encryption_key_base64)?;
        apply_env_marker_path(&mut self.paths.database)?;
        apply_env_marker_path(&mut self.paths.blob_root)?;
        Ok(())
    }

    fn expand_paths(&mut self) {
        self.paths.database = expand_tilde(&self.paths.database);
        self.paths.blob_root = expand_tilde(&self.paths.blob_root);
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&raw);
    PathBuf::from(expanded.as_ref())
}

fn apply_env_marker(value: &mut String) -> Result<(), ConfigError> {
    if let Some(rest) = value.strip_prefix("env:") {
        let resolved = env::var(rest).map_err(|_| ConfigError::MissingEnvVar(rest.to_string()))?;
        *value = resolved;
    }
    Ok(())
}

fn apply_env_marker_path(path: &mut PathBuf) -> Result<(), ConfigError> {
    let mut value = path.to_string_lossy().to_string();
    apply_env_marker(&mut value)?;
    *path = PathBuf::from(value);
    Ok(())
}
