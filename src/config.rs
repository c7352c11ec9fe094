//! Console configuration module
//!
//! Handles loading, saving, and validating the console's own settings: where
//! the test backend lives and how long to wait for remote processes. Test
//! configurations themselves are stored by the backend.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variables with this prefix override file values,
/// e.g. `FABRICBENCH__BACKEND__BASE_URL`
pub const ENV_PREFIX: &str = "FABRICBENCH";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// Test backend connection
    #[serde(default)]
    pub backend: BackendConfig,

    /// Probe polling bounds
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Local API server
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend root URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Path prefix of the backend API
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,

    /// Per-request timeout; precheck and collect fan out over SSH and can be slow
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_api_prefix() -> String {
    "/api".to_string()
}

fn default_request_timeout() -> u64 { 120 }

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_prefix: default_api_prefix(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Bounds of the probe loop.
///
/// The total wait is `interval_ms * max_attempts`; the defaults give
/// 2 s x 150 = 300 s (5 minutes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Pause between two probe requests (milliseconds)
    #[serde(default = "default_probe_interval")]
    pub interval_ms: u64,

    /// Maximum number of probe requests
    #[serde(default = "default_probe_attempts")]
    pub max_attempts: u32,
}

fn default_probe_interval() -> u64 { 2_000 }
fn default_probe_attempts() -> u32 { 150 }

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Longest time the probe stage can spend waiting
    pub fn max_wait(&self) -> Duration {
        self.interval() * self.max_attempts
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_probe_interval(),
            max_attempts: default_probe_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Port for the local progress API
    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_api_port() -> u16 { 9877 }

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: default_api_port() }
    }
}

impl ConsoleConfig {
    /// Load configuration: defaults, then the TOML file if given, then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: ConsoleConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;

        let commented = format!(
            r#"# Fabricbench console configuration
# Generated by fabricbench init
#
# Every value can be overridden from the environment, for example
# FABRICBENCH__BACKEND__BASE_URL=http://10.0.0.5:8080
#
# The probe stage waits at most probe.interval_ms x probe.max_attempts.

{}
"#,
            content
        );

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, commented)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend.base_url.trim().is_empty() {
            anyhow::bail!("backend.base_url must not be empty");
        }
        if self.backend.request_timeout_secs == 0 {
            anyhow::bail!("backend.request_timeout_secs must be greater than 0");
        }
        if self.probe.interval_ms == 0 {
            anyhow::bail!("probe.interval_ms must be greater than 0");
        }
        if self.probe.max_attempts == 0 {
            anyhow::bail!("probe.max_attempts must be greater than 0");
        }
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("fabricbench").join("config.toml"))
    }

    /// Load from the given path, else from the default location if it exists, else defaults
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(Some(p)),
            None => {
                let default = Self::default_path().filter(|p| p.exists());
                Self::load(default.as_deref())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConsoleConfig::default();
        assert_eq!(config.backend.base_url, "http://127.0.0.1:8080");
        assert_eq!(config.probe.max_wait(), Duration::from_secs(300));
        tokio_test::assert_ok!(config.validate());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: ConsoleConfig = toml::from_str(
            r#"
            [probe]
            max_attempts = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.probe.max_attempts, 10);
        assert_eq!(config.probe.interval_ms, 2_000);
        assert_eq!(config.api.port, 9877);
    }

    #[test]
    fn test_layered_load_from_file() {
        let path = std::env::temp_dir().join(format!("fabricbench-layer-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "[backend]\nbase_url = \"http://bench-master:8080\"\n").unwrap();

        let config = ConsoleConfig::load(Some(&path)).unwrap();
        assert_eq!(config.backend.base_url, "http://bench-master:8080");
        assert_eq!(config.backend.api_prefix, "/api");
        assert_eq!(config.probe.max_attempts, 150);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = ConsoleConfig::default();
        config.probe.max_attempts = 0;
        tokio_test::assert_err!(config.validate());
    }

    #[test]
    fn test_save_and_reload() {
        let path = std::env::temp_dir().join(format!("fabricbench-test-{}.toml", uuid::Uuid::new_v4()));
        let mut config = ConsoleConfig::default();
        config.backend.base_url = "http://10.1.2.3:8080".to_string();
        config.save_to_file(&path).unwrap();

        let loaded = ConsoleConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.backend.base_url, "http://10.1.2.3:8080");

        let _ = std::fs::remove_file(&path);
    }
}
