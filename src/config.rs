use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::error::{Result, TranspassError};

// Default values for engine configuration
fn default_persist_delay_ms() -> u64 {
    5_000
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    pub engine: EngineConfig,
    pub http: HttpConfig,
    pub endpoints: EndpointConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the settings file and logs
    pub state_dir: PathBuf,
    /// File name of the JSON settings store inside `state_dir`
    pub settings_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Quiet window before a dirty cache is pruned and written back
    #[serde(default = "default_persist_delay_ms")]
    pub persist_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Request timeout for provider calls
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Base URL of the Azure translator API
    pub azure: String,
    /// Base URL of the Google Cloud translation API
    pub google: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig {
                state_dir: PathBuf::from(".transpass"),
                settings_file: "settings.json".to_string(),
            },
            engine: EngineConfig {
                persist_delay_ms: default_persist_delay_ms(),
            },
            http: HttpConfig {
                timeout_secs: default_timeout_secs(),
                user_agent: concat!("transpass/", env!("CARGO_PKG_VERSION")).to_string(),
            },
            endpoints: EndpointConfig::default(),
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            azure: "https://api.cognitive.microsofttranslator.com".to_string(),
            google: "https://translation.googleapis.com".to_string(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TranspassError::Config(format!("Failed to read config file: {}", e)))?;

        Ok(toml::from_str(&content)?)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| TranspassError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| TranspassError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    pub fn settings_path(&self) -> PathBuf {
        self.store.state_dir.join(&self.store.settings_file)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.store.state_dir.join("log")
    }

    pub fn persist_delay(&self) -> Duration {
        Duration::from_millis(self.engine.persist_delay_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transpass.toml");

        let mut config = Config::default();
        config.engine.persist_delay_ms = 250;
        config.endpoints.google = "http://localhost:9000".to_string();
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.persist_delay(), Duration::from_millis(250));
        assert_eq!(loaded.endpoints.google, "http://localhost:9000");
        assert_eq!(loaded.settings_path(), PathBuf::from(".transpass/settings.json"));
    }

    #[test]
    fn test_missing_optional_fields_use_defaults() {
        let content = r#"
[store]
state_dir = "/tmp/tp"
settings_file = "s.json"

[engine]

[http]
user_agent = "test"

[endpoints]
azure = "http://a"
google = "http://g"
"#;
        let config: Config = toml::from_str(content).unwrap();
        assert_eq!(config.engine.persist_delay_ms, 5_000);
        assert_eq!(config.http.timeout_secs, 30);
    }

    #[test]
    fn test_malformed_file_is_a_toml_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transpass.toml");
        std::fs::write(&path, "[store\nstate_dir = 1").unwrap();

        assert!(matches!(Config::from_file(&path), Err(TranspassError::Toml(_))));
        assert!(matches!(
            Config::from_file(dir.path().join("missing.toml")),
            Err(TranspassError::Config(_))
        ));
    }
}
