use crate::roster::PollSettings;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "PLAYTEST_";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub poll: PollConfig,
    pub tracker: TrackerConfig,
    pub registry: RegistryConfig,
    pub server: ServerConfig,
    pub notifier: NotifierConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub command: String,
    pub id_prefix: String,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            timeout_ms: 5000,
            command: "player_info".to_string(),
            id_prefix: "[U:".to_string(),
        }
    }
}

impl PollConfig {
    pub fn settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(self.interval_ms),
            io_timeout: Duration::from_millis(self.timeout_ms),
            command: self.command.clone(),
            id_prefix: self.id_prefix.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub interval_ms: u64,
    pub queue_capacity: usize,
    pub stop_grace_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            queue_capacity: 256,
            stop_grace_ms: 6000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub path: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: "config.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 7171,
            token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct NotifierConfig {
    pub webhook_url: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            match toml::from_str::<Config>(&raw) {
                Ok(file_config) => config = file_config,
                Err(err) => tracing::warn!(
                    path = %config_path.display(),
                    error = %err,
                    "ignoring unparsable config file"
                ),
            }
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var(format!("{}POLL_INTERVAL_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.poll.interval_ms = ms;
            }
        }
        if let Ok(val) = env::var(format!("{}POLL_TIMEOUT_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.poll.timeout_ms = ms;
            }
        }
        if let Ok(val) = env::var(format!("{}POLL_COMMAND", ENV_PREFIX)) {
            self.poll.command = val;
        }

        if let Ok(val) = env::var(format!("{}REGISTRY_PATH", ENV_PREFIX)) {
            self.registry.path = val;
        }

        if let Ok(val) = env::var(format!("{}SERVER_PORT", ENV_PREFIX)) {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }
        if let Ok(val) = env::var(format!("{}SERVER_TOKEN", ENV_PREFIX)) {
            self.server.token = Some(val);
        }

        if let Ok(val) = env::var(format!("{}WEBHOOK_URL", ENV_PREFIX)) {
            self.notifier.webhook_url = Some(val);
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.poll.interval_ms == 0 {
            return Err("poll.interval_ms must be non-zero".into());
        }
        if self.poll.timeout_ms < 100 {
            return Err("poll.timeout_ms must be >= 100".into());
        }
        if self.poll.command.trim().is_empty() {
            return Err("poll.command must be set".into());
        }
        if self.poll.id_prefix.is_empty() {
            return Err("poll.id_prefix must be set".into());
        }
        if self.tracker.interval_ms == 0 {
            return Err("tracker.interval_ms must be non-zero".into());
        }
        if self.tracker.queue_capacity == 0 {
            return Err("tracker.queue_capacity must be non-zero".into());
        }
        if self.server.port == 0 {
            return Err("server.port must be non-zero".into());
        }
        if let Some(url) = self.notifier.webhook_url.as_deref() {
            if url.trim().is_empty() {
                return Err("notifier.webhook_url must not be blank when set".into());
            }
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        config_path()
    }

    pub fn tracker_interval(&self) -> Duration {
        Duration::from_millis(self.tracker.interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.tracker.stop_grace_ms)
    }
}

fn config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    PathBuf::from(CONFIG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = Config::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.poll.command, "player_info");
        assert_eq!(parsed.poll.settings().interval, Duration::from_secs(1));
        assert_eq!(parsed.poll.settings().io_timeout, Duration::from_secs(5));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: Config = toml::from_str("[poll]\ninterval_ms = 2000\n").unwrap();
        assert_eq!(parsed.poll.interval_ms, 2000);
        assert_eq!(parsed.poll.timeout_ms, 5000);
        assert_eq!(parsed.registry.path, "config.json");
        assert_eq!(parsed.server.port, 7171);
    }

    #[test]
    fn validate_rejects_zero_values() {
        let mut cfg = Config::default();
        cfg.poll.interval_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.tracker.queue_capacity = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.server.port = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_short_timeout_and_blank_command() {
        let mut cfg = Config::default();
        cfg.poll.timeout_ms = 10;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.poll.command = "  ".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_blank_webhook() {
        let mut cfg = Config::default();
        cfg.notifier.webhook_url = Some(" ".to_string());
        assert!(cfg.validate().is_err());
        cfg.notifier.webhook_url = Some("https://chat.example.test/hook".to_string());
        assert!(cfg.validate().is_ok());
    }
}
