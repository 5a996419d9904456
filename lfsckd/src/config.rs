use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/lfsckd/lfsckd.toml";
const ENV_CONFIG_PATH: &str = "LFSCKD_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DaemonConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

impl DaemonConfig {
    /// Load configuration from file. The path can be overridden with the
    /// `LFSCKD_CONFIG` environment variable. If the file is missing or
    /// fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => DaemonConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Governor tick window, in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Scanned items between bookmark checkpoints.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
    /// Speed limit applied to a freshly registered instance before any
    /// `set_speed` call.
    #[serde(default = "default_speed_limit")]
    pub default_speed_limit: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            checkpoint_interval: default_checkpoint_interval(),
            default_speed_limit: default_speed_limit(),
        }
    }
}

fn default_tick_ms() -> u64 {
    1000
}
fn default_checkpoint_interval() -> u64 {
    lfsck_proto::CHECKPOINT_INTERVAL
}
fn default_speed_limit() -> u32 {
    0
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> String {
    "/var/lib/lfsckd/lfsckd.db".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub audit_file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            audit_file: None,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:7878".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_config_defaults() {
        let toml = r#"[runtime]
tick_ms = 500
checkpoint_interval = 2048
default_speed_limit = 1000
[storage]
sqlite_path = "/tmp/lfsckd-test.db"
[logging]
level = "debug"
[http]
bind_addr = "0.0.0.0:9000"
"#;
        let cfg: DaemonConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.runtime.tick_ms, 500);
        assert_eq!(cfg.runtime.checkpoint_interval, 2048);
        assert_eq!(cfg.storage.sqlite_path, "/tmp/lfsckd-test.db");
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.http.bind_addr, "0.0.0.0:9000");
    }

    #[test]
    fn defaults_when_file_absent() {
        let cfg = DaemonConfig::default();
        assert_eq!(cfg.runtime.checkpoint_interval, lfsck_proto::CHECKPOINT_INTERVAL);
        assert_eq!(cfg.http.bind_addr, "127.0.0.1:7878");
    }

    #[test]
    fn env_override() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[runtime]\ntick_ms = 42").unwrap();
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, file.path());
        }
        let cfg = DaemonConfig::load();
        assert_eq!(cfg.runtime.tick_ms, 42);
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
    }
}
