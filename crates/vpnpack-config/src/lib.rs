//! Daemon configuration for vpnpack.
//!
//! Built-in defaults, an optional TOML file, and `VPNPACK_*` environment
//! variables are layered with figment, validated, and translated into
//! [`vpnpack_core::DaemonConfig`]. API key resolution lives here too.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use vpnpack_core::{
    ApiKeyFile, CoreError, DaemonConfig, IntegrationSettings, Paths, WatcherSettings,
};

/// Default location of the config file.
pub const DEFAULT_CONFIG_PATH: &str = "/persistent/vpn-pack/config/vpnpack.toml";

/// Environment variable prefix; nested keys are split on `__`.
pub const ENV_PREFIX: &str = "VPNPACK_";

/// Overrides the stored API key file when set and non-empty.
pub const API_KEY_ENV: &str = "VPNPACK_API_KEY";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("API key file unreadable: {0}")]
    KeyFile(#[source] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub integration: IntegrationConfig,
    pub watcher: WatcherConfig,
    pub firewall: FirewallConfig,
    pub logging: LoggingConfig,
}

/// File locations. Unset state paths derive from `persistent_dir`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsConfig {
    pub persistent_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wg_s2s_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tailscaled_defaults: Option<PathBuf>,
    pub udapi_socket: PathBuf,
    pub udapi_net_config: PathBuf,
    pub sys_class_net: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let paths = Paths::default();
        Self {
            persistent_dir: paths.persistent_dir,
            manifest: None,
            api_key: None,
            wg_s2s_dir: None,
            tailscaled_defaults: None,
            udapi_socket: paths.udapi_socket,
            udapi_net_config: paths.udapi_net_config,
            sys_class_net: paths.sys_class_net,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct IntegrationConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    /// Accept the appliance's self-signed certificate.
    pub insecure: bool,
    pub page_limit: u32,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        let settings = IntegrationSettings::default();
        Self {
            base_url: settings.base_url,
            timeout_secs: settings.timeout.as_secs(),
            insecure: settings.insecure,
            page_limit: settings.page_limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub poll_interval_secs: u64,
    pub debounce_ms: u64,
    pub queue_capacity: usize,
    /// Minimum seconds between credential checks made by the poll loop.
    pub validate_interval_secs: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            debounce_ms: 500,
            queue_capacity: 8,
            validate_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// Port of the Network application's local database, used for
    /// chain-prefix discovery.
    pub mongo_port: u16,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            mongo_port: DaemonConfig::DEFAULT_MONGO_PORT,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
    /// Mirror logs to a daily-rolling file in this directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Text,
            directory: None,
        }
    }
}

// ── Loading ─────────────────────────────────────────────────────────

/// The layered sources: defaults, then `path` (if present), then the
/// environment.
pub fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(
            Env::prefixed(ENV_PREFIX)
                .ignore(&["config", "api_key"])
                .split("__"),
        )
}

/// Load and validate the configuration. A missing file is not an error.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    extract(&figment(path))
}

fn extract(figment: &Figment) -> Result<Config, ConfigError> {
    let config: Config = figment.extract()?;
    config.validate()?;
    Ok(config)
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.paths.persistent_dir.as_os_str().is_empty() {
            return Err(invalid("paths.persistent_dir", "must not be empty"));
        }
        let url: url::Url = self
            .integration
            .base_url
            .parse()
            .map_err(|e| invalid("integration.base_url", format!("{e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(
                "integration.base_url",
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }
        if self.integration.timeout_secs == 0 {
            return Err(invalid("integration.timeout_secs", "must be positive"));
        }
        if self.integration.page_limit == 0 {
            return Err(invalid("integration.page_limit", "must be positive"));
        }
        if self.watcher.poll_interval_secs == 0 {
            return Err(invalid("watcher.poll_interval_secs", "must be positive"));
        }
        if self.watcher.queue_capacity == 0 {
            return Err(invalid("watcher.queue_capacity", "must be positive"));
        }
        if self.firewall.mongo_port == 0 {
            return Err(invalid("firewall.mongo_port", "must be positive"));
        }
        Ok(())
    }

    /// Resolve every path and duration into the daemon's runtime form.
    pub fn to_daemon_config(&self) -> DaemonConfig {
        let p = &self.paths;
        let mut paths = Paths::under(&p.persistent_dir);
        if let Some(manifest) = &p.manifest {
            paths.manifest.clone_from(manifest);
        }
        if let Some(api_key) = &p.api_key {
            paths.api_key.clone_from(api_key);
        }
        if let Some(dir) = &p.wg_s2s_dir {
            paths.wg_s2s_dir.clone_from(dir);
        }
        if let Some(defaults) = &p.tailscaled_defaults {
            paths.tailscaled_defaults.clone_from(defaults);
        }
        paths.udapi_socket.clone_from(&p.udapi_socket);
        paths.udapi_net_config.clone_from(&p.udapi_net_config);
        paths.sys_class_net.clone_from(&p.sys_class_net);

        DaemonConfig {
            paths,
            integration: IntegrationSettings {
                base_url: self.integration.base_url.clone(),
                timeout: Duration::from_secs(self.integration.timeout_secs),
                insecure: self.integration.insecure,
                page_limit: self.integration.page_limit,
            },
            watcher: WatcherSettings {
                poll_interval: Duration::from_secs(self.watcher.poll_interval_secs),
                debounce: Duration::from_millis(self.watcher.debounce_ms),
                queue_capacity: self.watcher.queue_capacity,
                validate_interval: Duration::from_secs(self.watcher.validate_interval_secs),
                ..WatcherSettings::default()
            },
            mongo_port: self.firewall.mongo_port,
        }
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Write the default configuration to `path` unless a file is already there.
/// Returns whether a file was written.
pub fn write_default(path: &Path) -> Result<bool, ConfigError> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, Config::default().to_toml()?)?;
    Ok(true)
}

// ── Credential resolution ───────────────────────────────────────────

/// The API key from [`API_KEY_ENV`], else the key file. `None` means
/// integration is unconfigured.
pub fn resolve_api_key(paths: &Paths) -> Result<Option<SecretString>, ConfigError> {
    resolve_api_key_from(
        std::env::var(API_KEY_ENV).ok(),
        &ApiKeyFile::new(&paths.api_key),
    )
}

fn resolve_api_key_from(
    env_value: Option<String>,
    file: &ApiKeyFile,
) -> Result<Option<SecretString>, ConfigError> {
    if let Some(key) = env_value
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
    {
        return Ok(Some(SecretString::from(key.to_owned())));
    }
    file.load().map_err(ConfigError::KeyFile)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use secrecy::ExposeSecret;

    use super::*;

    fn from_toml(raw: &str) -> Result<Config, ConfigError> {
        extract(
            &Figment::new()
                .merge(Serialized::defaults(Config::default()))
                .merge(Toml::string(raw)),
        )
    }

    #[test]
    fn defaults_resolve_under_persistent_dir() {
        let daemon = Config::default().to_daemon_config();
        assert_eq!(
            daemon.paths.manifest,
            PathBuf::from("/persistent/vpn-pack/config/manifest.json")
        );
        assert_eq!(
            daemon.paths.udapi_socket,
            PathBuf::from("/run/ubnt-udapi-server.sock")
        );
        assert_eq!(daemon.watcher.poll_interval, Duration::from_secs(5));
        assert_eq!(daemon.mongo_port, 27117);
        assert!(daemon.integration.insecure);
    }

    #[test]
    fn toml_overrides_layer_over_defaults() {
        let config = from_toml(
            r#"
            [paths]
            persistent_dir = "/data/vpn"
            manifest = "/tmp/manifest.json"

            [watcher]
            debounce_ms = 250
            validate_interval_secs = 60

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        let daemon = config.to_daemon_config();
        assert_eq!(daemon.paths.manifest, PathBuf::from("/tmp/manifest.json"));
        assert_eq!(daemon.paths.api_key, PathBuf::from("/data/vpn/config/api-key"));
        assert_eq!(daemon.watcher.debounce, Duration::from_millis(250));
        assert_eq!(daemon.watcher.queue_capacity, 8);
        assert_eq!(daemon.watcher.validate_interval, Duration::from_secs(60));
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn validation_names_the_field() {
        let err = from_toml("[integration]\nbase_url = \"not a url\"").unwrap_err();
        assert!(
            matches!(&err, ConfigError::Validation { field, .. } if field == "integration.base_url")
        );

        let err = from_toml("[watcher]\npoll_interval_secs = 0").unwrap_err();
        assert!(
            matches!(&err, ConfigError::Validation { field, .. } if field == "watcher.poll_interval_secs")
        );
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.integration, IntegrationConfig::default());
    }

    #[test]
    fn default_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config/vpnpack.toml");

        assert!(write_default(&path).unwrap());
        assert!(!write_default(&path).unwrap());
        assert_eq!(load_config(&path).unwrap().watcher, WatcherConfig::default());
    }

    #[test]
    fn api_key_prefers_environment() {
        let dir = tempfile::tempdir().unwrap();
        let file = ApiKeyFile::new(dir.path().join("api-key"));

        assert!(resolve_api_key_from(None, &file).unwrap().is_none());

        file.save(&SecretString::from("from-file".to_owned())).unwrap();
        let key = resolve_api_key_from(Some("  ".into()), &file).unwrap().unwrap();
        assert_eq!(key.expose_secret(), "from-file");

        let key = resolve_api_key_from(Some(" from-env ".into()), &file)
            .unwrap()
            .unwrap();
        assert_eq!(key.expose_secret(), "from-env");
    }
}
