// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Daemon configuration: INI file, environment overrides, validation.
//!
//! Precedence is defaults < file < environment < command line. The file is
//! parsed by hand; the format is five flat sections of `key = value` pairs
//! with `#`/`;` comments.

use nix::unistd::{access, AccessFlags};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use vigil_common::{Error, Result};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/vigil/vigild.conf";

const ENV_LOG_LEVEL: &str = "VIGIL_LOG_LEVEL";
const ENV_DETECTOR_BINARY: &str = "VIGIL_DETECTOR_BINARY";
const ENV_DETECTOR_CONFIG: &str = "VIGIL_DETECTOR_CONFIG";
const ENV_INTERFACE: &str = "VIGIL_INTERFACE";
const ENV_SOCKET_DIR: &str = "VIGIL_SOCKET_DIR";
const ENV_DATABASE: &str = "VIGIL_DATABASE";

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "fatal"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneralConfig {
    pub log_level: String,
    pub pid_file: PathBuf,
    pub daemonize: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetectorConfig {
    pub binary: PathBuf,
    pub config: PathBuf,
    pub rules_dir: PathBuf,
    pub interfaces: Vec<String>,
    pub log_dir: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpcConfig {
    pub socket_dir: PathBuf,
    pub event_buffer_size: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageConfig {
    pub database: PathBuf,
    pub retention_days: u32,
    pub max_size_mb: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchdogConfig {
    pub check_interval_ms: u32,
    pub heartbeat_timeout_s: u32,
    pub max_restart_attempts: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub general: GeneralConfig,
    pub detector: DetectorConfig,
    pub ipc: IpcConfig,
    pub storage: StorageConfig,
    pub watchdog: WatchdogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            general: GeneralConfig {
                log_level: "info".to_owned(),
                pid_file: "/var/run/vigild.pid".into(),
                daemonize: true,
            },
            detector: DetectorConfig {
                binary: "/usr/bin/suricata".into(),
                config: "/etc/vigil/detector.yaml".into(),
                rules_dir: "/etc/vigil/rules".into(),
                interfaces: vec!["eth0".to_owned()],
                log_dir: None,
            },
            ipc: IpcConfig {
                socket_dir: "/var/run/vigil".into(),
                event_buffer_size: 32_768,
            },
            storage: StorageConfig {
                database: "/var/lib/vigil/events.db".into(),
                retention_days: 7,
                max_size_mb: 500,
            },
            watchdog: WatchdogConfig {
                check_interval_ms: 5000,
                heartbeat_timeout_s: 2,
                max_restart_attempts: 5,
            },
        }
    }
}

impl Config {
    /// Path of the control socket inside the socket directory.
    pub fn api_socket(&self) -> PathBuf {
        self.ipc.socket_dir.join("api.sock")
    }

    /// Path of the detector's event socket inside the socket directory.
    pub fn event_socket(&self) -> PathBuf {
        self.ipc.socket_dir.join("events.sock")
    }

    /// Merges `key = value` pairs from an INI file over the current values.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read config file {}: {e}", path.display()))
        })?;

        let mut section = String::new();
        for (line_num, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(rest) = line.strip_prefix('[') {
                match rest.split_once(']') {
                    Some((name, _)) => section = name.trim().to_owned(),
                    None => warn!(line = line_num + 1, "invalid section header in config"),
                }
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!(line = line_num + 1, "invalid key-value pair in config");
                continue;
            };
            self.apply(&section, key.trim(), value.trim());
        }

        debug!(path = %path.display(), "configuration loaded");
        Ok(())
    }

    fn apply(&mut self, section: &str, key: &str, value: &str) {
        match (section, key) {
            ("general", "log_level") => self.general.log_level = value.to_owned(),
            ("general", "pid_file") => self.general.pid_file = value.into(),
            ("general", "daemonize") => self.general.daemonize = parse_bool(value),
            ("detector", "binary") => self.detector.binary = value.into(),
            ("detector", "config") => self.detector.config = value.into(),
            ("detector", "rules_dir") => self.detector.rules_dir = value.into(),
            ("detector", "interface") => self.detector.interfaces = parse_interfaces(value),
            ("detector", "log_dir") => self.detector.log_dir = Some(value.into()),
            ("ipc", "socket_dir") => self.ipc.socket_dir = value.into(),
            ("ipc", "event_buffer_size") => {
                self.ipc.event_buffer_size = value.parse().unwrap_or(self.ipc.event_buffer_size)
            }
            ("storage", "database") => self.storage.database = value.into(),
            ("storage", "retention_days") => {
                self.storage.retention_days = value.parse().unwrap_or(self.storage.retention_days)
            }
            ("storage", "max_size_mb") => {
                self.storage.max_size_mb = value.parse().unwrap_or(self.storage.max_size_mb)
            }
            ("watchdog", "check_interval_ms") => {
                self.watchdog.check_interval_ms =
                    value.parse().unwrap_or(self.watchdog.check_interval_ms)
            }
            ("watchdog", "heartbeat_timeout_s") => {
                self.watchdog.heartbeat_timeout_s =
                    value.parse().unwrap_or(self.watchdog.heartbeat_timeout_s)
            }
            ("watchdog", "max_restart_attempts") => {
                self.watchdog.max_restart_attempts =
                    value.parse().unwrap_or(self.watchdog.max_restart_attempts)
            }
            _ => debug!(section, key, "ignoring unknown config key"),
        }
    }

    /// Applies the fixed set of environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var(ENV_LOG_LEVEL) {
            self.general.log_level = value;
        }
        if let Ok(value) = std::env::var(ENV_DETECTOR_BINARY) {
            self.detector.binary = value.into();
        }
        if let Ok(value) = std::env::var(ENV_DETECTOR_CONFIG) {
            self.detector.config = value.into();
        }
        if let Ok(value) = std::env::var(ENV_INTERFACE) {
            self.detector.interfaces = parse_interfaces(&value);
        }
        if let Ok(value) = std::env::var(ENV_SOCKET_DIR) {
            self.ipc.socket_dir = value.into();
        }
        if let Ok(value) = std::env::var(ENV_DATABASE) {
            self.storage.database = value.into();
        }
    }

    /// Startup validation. Failures here are fatal: the daemon refuses to
    /// start on an unusable configuration. Validation has no side effects,
    /// so re-validating yields the same result.
    pub fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.general.log_level.as_str()) {
            return Err(Error::Config(format!(
                "unknown log level {:?}",
                self.general.log_level
            )));
        }

        let binary = &self.detector.binary;
        if binary.as_os_str().is_empty() {
            return Err(Error::Config("detector binary path not configured".into()));
        }
        if !binary.exists() {
            return Err(Error::Config(format!(
                "detector binary not found: {}",
                binary.display()
            )));
        }
        if access(binary, AccessFlags::X_OK).is_err() {
            return Err(Error::Config(format!(
                "detector binary is not executable: {}",
                binary.display()
            )));
        }

        if self.detector.config.as_os_str().is_empty() {
            return Err(Error::Config("detector config path not configured".into()));
        }
        if !self.detector.config.exists() {
            return Err(Error::Config(format!(
                "detector config not found: {}",
                self.detector.config.display()
            )));
        }

        if self.detector.rules_dir.as_os_str().is_empty() {
            return Err(Error::Config("rules directory not configured".into()));
        }
        if !self.detector.rules_dir.is_dir() {
            return Err(Error::Config(format!(
                "rules directory not found: {}",
                self.detector.rules_dir.display()
            )));
        }

        if self.detector.interfaces.is_empty() {
            return Err(Error::Config("network interface not configured".into()));
        }

        if !(1024..=1_048_576).contains(&self.ipc.event_buffer_size) {
            return Err(Error::Config(
                "event buffer size must be between 1024 and 1048576".into(),
            ));
        }
        if !(1..=365).contains(&self.storage.retention_days) {
            return Err(Error::Config(
                "retention days must be between 1 and 365".into(),
            ));
        }
        if !(100..=10_000).contains(&self.watchdog.check_interval_ms) {
            return Err(Error::Config(
                "watchdog check interval must be between 100ms and 10000ms".into(),
            ));
        }
        if !(1..=60).contains(&self.watchdog.heartbeat_timeout_s) {
            return Err(Error::Config(
                "heartbeat timeout must be between 1 and 60 seconds".into(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "yes" | "on" | "1"
    )
}

fn parse_interfaces(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("vigild.conf");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    /// A config whose referenced paths all exist.
    fn valid_config(dir: &Path) -> Config {
        let binary = dir.join("detector");
        fs::write(&binary, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();
        let detector_config = dir.join("detector.yaml");
        fs::write(&detector_config, b"%YAML 1.1\n").unwrap();
        let rules_dir = dir.join("rules");
        fs::create_dir_all(&rules_dir).unwrap();

        let mut config = Config::default();
        config.detector.binary = binary;
        config.detector.config = detector_config;
        config.detector.rules_dir = rules_dir;
        config
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.general.log_level, "info");
        assert!(config.general.daemonize);
        assert_eq!(config.ipc.event_buffer_size, 32_768);
        assert_eq!(config.storage.retention_days, 7);
        assert_eq!(config.watchdog.check_interval_ms, 5000);
        assert_eq!(config.api_socket(), PathBuf::from("/var/run/vigil/api.sock"));
        assert_eq!(
            config.event_socket(),
            PathBuf::from("/var/run/vigil/events.sock")
        );
    }

    #[test]
    fn ini_sections_and_comments_are_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "# general settings\n\
             [general]\n\
             log_level = debug\n\
             daemonize = no\n\
             ; detector\n\
             [detector]\n\
             binary = /opt/detector\n\
             interface = eth0, eth1\n\
             [watchdog]\n\
             check_interval_ms = 250\n\
             bogus line without equals\n",
        );

        let mut config = Config::default();
        config.load(&path).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert!(!config.general.daemonize);
        assert_eq!(config.detector.binary, PathBuf::from("/opt/detector"));
        assert_eq!(config.detector.interfaces, vec!["eth0", "eth1"]);
        assert_eq!(config.watchdog.check_interval_ms, 250);
        // Untouched values stay at their defaults.
        assert_eq!(config.storage.retention_days, 7);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let mut config = Config::default();
        assert!(matches!(
            config.load("/nonexistent/vigild.conf"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn env_overrides_take_effect() {
        // Serialized by running in one test: env vars are process-global.
        std::env::set_var(ENV_LOG_LEVEL, "warn");
        std::env::set_var(ENV_INTERFACE, "can0");
        std::env::set_var(ENV_DATABASE, "/tmp/custom.db");
        let mut config = Config::default();
        config.apply_env();
        std::env::remove_var(ENV_LOG_LEVEL);
        std::env::remove_var(ENV_INTERFACE);
        std::env::remove_var(ENV_DATABASE);

        assert_eq!(config.general.log_level, "warn");
        assert_eq!(config.detector.interfaces, vec!["can0"]);
        assert_eq!(config.storage.database, PathBuf::from("/tmp/custom.db"));
    }

    #[test]
    fn validation_accepts_a_complete_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = valid_config(dir.path());
        config.validate().unwrap();
    }

    #[test]
    fn validation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = valid_config(dir.path());
        assert!(config.validate().is_ok());
        assert!(config.validate().is_ok());

        let mut bad = config;
        bad.storage.retention_days = 0;
        assert!(bad.validate().is_err());
        assert!(bad.validate().is_err());
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        let dir = tempfile::tempdir().unwrap();
        let good = valid_config(dir.path());

        let mut config = good.clone();
        config.ipc.event_buffer_size = 512;
        assert!(config.validate().is_err());

        let mut config = good.clone();
        config.storage.retention_days = 366;
        assert!(config.validate().is_err());

        let mut config = good.clone();
        config.watchdog.check_interval_ms = 50;
        assert!(config.validate().is_err());

        let mut config = good.clone();
        config.watchdog.heartbeat_timeout_s = 0;
        assert!(config.validate().is_err());

        let mut config = good;
        config.general.log_level = "verbose".to_owned();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_missing_or_unexecutable_binary() {
        let dir = tempfile::tempdir().unwrap();
        let good = valid_config(dir.path());

        let mut config = good.clone();
        config.detector.binary = dir.path().join("missing");
        assert!(config.validate().is_err());

        let mut config = good;
        let plain = dir.path().join("plain");
        fs::write(&plain, b"").unwrap();
        config.detector.binary = plain;
        assert!(config.validate().is_err());
    }
}
