use crate::sysinfo::ApplicationPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    pub interval_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_database")]
    pub database: PathBuf,
    #[serde(default = "default_inventory")]
    pub inventory: PathBuf,
    #[serde(default)]
    pub probes: ProbesConfig,
    #[serde(default)]
    pub interpretation: InterpretationConfig,
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    #[serde(default = "default_sync_max_age_secs")]
    pub sync_max_age_secs: u64,
    #[serde(default = "default_touch_events_window_days")]
    pub touch_events_window_days: u64,
    #[serde(default)]
    pub blacklist: BlacklistConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProbesConfig {
    #[serde(default)]
    pub icmp: IcmpConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub sysinfo: SysinfoConfig,
    #[serde(default)]
    pub bandwidth: BandwidthConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IcmpConfig {
    #[serde(default = "default_ping_binary")]
    pub binary: String,
    #[serde(default = "default_icmp_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_binary")]
    pub binary: String,
    #[serde(default = "default_ssh_keyfile")]
    pub keyfile: String,
    #[serde(default = "default_ssh_users")]
    pub users: Vec<String>,
    #[serde(default = "default_ssh_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SysinfoConfig {
    #[serde(default = "default_sysinfo_port")]
    pub port: u16,
    #[serde(default = "default_sysinfo_path")]
    pub path: String,
    #[serde(default = "default_sysinfo_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BandwidthConfig {
    #[serde(default = "default_bandwidth_enabled")]
    pub enabled: bool,
    #[serde(default = "default_iperf_binary")]
    pub binary: String,
    #[serde(default = "default_bandwidth_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_skip_lte")]
    pub skip_lte: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InterpretationConfig {
    #[serde(default)]
    pub application_policy: ApplicationPolicy,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BlacklistConfig {
    #[serde(default = "default_blacklist_path")]
    pub path: PathBuf,
    #[serde(default = "default_blacklist_window_days")]
    pub window_days: u64,
    #[serde(default = "default_blacklist_threshold")]
    pub threshold: f64,
    #[serde(default = "default_min_download_kbps")]
    pub min_download_kbps: f64,
    #[serde(default)]
    pub track_sync: bool,
    #[serde(default = "default_blacklist_regenerate_interval_secs")]
    pub regenerate_interval_secs: u64,
}

impl Default for IcmpConfig {
    fn default() -> Self {
        Self {
            binary: default_ping_binary(),
            timeout_secs: default_icmp_timeout_secs(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            binary: default_ssh_binary(),
            keyfile: default_ssh_keyfile(),
            users: default_ssh_users(),
            connect_timeout_secs: default_ssh_connect_timeout_secs(),
        }
    }
}

impl Default for SysinfoConfig {
    fn default() -> Self {
        Self {
            port: default_sysinfo_port(),
            path: default_sysinfo_path(),
            timeout_secs: default_sysinfo_timeout_secs(),
        }
    }
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            enabled: default_bandwidth_enabled(),
            binary: default_iperf_binary(),
            timeout_secs: default_bandwidth_timeout_secs(),
            skip_lte: default_skip_lte(),
        }
    }
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            path: default_blacklist_path(),
            window_days: default_blacklist_window_days(),
            threshold: default_blacklist_threshold(),
            min_download_kbps: default_min_download_kbps(),
            track_sync: false,
            regenerate_interval_secs: default_blacklist_regenerate_interval_secs(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле listen обязательно".to_string(),
            ));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "поле listen должно быть корректным адресом host:port".to_string(),
            ));
        }
        if self.interval_secs < 60 {
            return Err(ConfigError::Validation(
                "interval_secs должно быть >= 60".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(ConfigError::Validation(
                "workers должно быть >= 1".to_string(),
            ));
        }
        if self.retention_days == 0 {
            return Err(ConfigError::Validation(
                "retention_days должно быть >= 1".to_string(),
            ));
        }

        validate_probes(&self.probes)?;
        validate_blacklist(&self.blacklist)?;

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_probes(cfg: &ProbesConfig) -> Result<(), ConfigError> {
    if cfg.icmp.timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "probes.icmp.timeout_secs должен быть > 0".to_string(),
        ));
    }
    if cfg.ssh.users.iter().all(|u| u.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "probes.ssh.users должен содержать хотя бы одного пользователя".to_string(),
        ));
    }
    if cfg.ssh.connect_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "probes.ssh.connect_timeout_secs должен быть > 0".to_string(),
        ));
    }
    if cfg.sysinfo.port == 0 {
        return Err(ConfigError::Validation(
            "probes.sysinfo.port должен быть в диапазоне 1..65535".to_string(),
        ));
    }
    if cfg.sysinfo.timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "probes.sysinfo.timeout_secs должен быть > 0".to_string(),
        ));
    }
    if cfg.bandwidth.enabled && cfg.bandwidth.timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "probes.bandwidth.timeout_secs должен быть > 0".to_string(),
        ));
    }
    Ok(())
}

fn validate_blacklist(cfg: &BlacklistConfig) -> Result<(), ConfigError> {
    if !(0.0..1.0).contains(&cfg.threshold) {
        return Err(ConfigError::Validation(
            "blacklist.threshold должно быть в диапазоне 0..1".to_string(),
        ));
    }
    if cfg.window_days == 0 {
        return Err(ConfigError::Validation(
            "blacklist.window_days должно быть >= 1".to_string(),
        ));
    }
    if !cfg.min_download_kbps.is_finite() || cfg.min_download_kbps < 0.0 {
        return Err(ConfigError::Validation(
            "blacklist.min_download_kbps должно быть конечным числом >= 0".to_string(),
        ));
    }
    if cfg.regenerate_interval_secs < 60 {
        return Err(ConfigError::Validation(
            "blacklist.regenerate_interval_secs должно быть >= 60".to_string(),
        ));
    }
    Ok(())
}

const fn default_workers() -> usize {
    6
}

fn default_database() -> PathBuf {
    PathBuf::from("/var/lib/sysmond/checks.sqlite")
}

fn default_inventory() -> PathBuf {
    PathBuf::from("/etc/sysmond/systems.yaml")
}

const fn default_retention_days() -> u64 {
    90
}

const fn default_sync_max_age_secs() -> u64 {
    86_400
}

const fn default_touch_events_window_days() -> u64 {
    21
}

fn default_ping_binary() -> String {
    "/usr/bin/ping".to_string()
}

const fn default_icmp_timeout_secs() -> u64 {
    5
}

fn default_ssh_binary() -> String {
    "/usr/bin/ssh".to_string()
}

fn default_ssh_keyfile() -> String {
    "/etc/sysmond/id_ed25519".to_string()
}

fn default_ssh_users() -> Vec<String> {
    vec!["root".to_string(), "homeinfo".to_string()]
}

const fn default_ssh_connect_timeout_secs() -> u64 {
    5
}

const fn default_sysinfo_port() -> u16 {
    8000
}

fn default_sysinfo_path() -> String {
    "/".to_string()
}

const fn default_sysinfo_timeout_secs() -> u64 {
    15
}

const fn default_bandwidth_enabled() -> bool {
    true
}

fn default_iperf_binary() -> String {
    "/usr/bin/iperf3".to_string()
}

const fn default_bandwidth_timeout_secs() -> u64 {
    15
}

const fn default_skip_lte() -> bool {
    true
}

fn default_blacklist_path() -> PathBuf {
    PathBuf::from("/var/lib/sysmond/blacklist.json")
}

const fn default_blacklist_window_days() -> u64 {
    90
}

const fn default_blacklist_threshold() -> f64 {
    0.8
}

const fn default_min_download_kbps() -> f64 {
    1945.6
}

const fn default_blacklist_regenerate_interval_secs() -> u64 {
    86_400
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        listen: "127.0.0.1:9110".to_string(),
        interval_secs: 3600,
        workers: 2,
        database: PathBuf::from(":memory:"),
        inventory: PathBuf::from("systems.yaml"),
        probes: ProbesConfig::default(),
        interpretation: InterpretationConfig::default(),
        retention_days: 90,
        sync_max_age_secs: 86_400,
        touch_events_window_days: 21,
        blacklist: BlacklistConfig::default(),
    }
}
