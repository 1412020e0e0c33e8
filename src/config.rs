use crate::bandwidth::{DEFAULT_SPEEDTEST_EXECUTABLE, DEFAULT_SPEEDTEST_TIMEOUT_SECS};
use crate::power::DEFAULT_PSU_CAPACITY_WATTS;
use crate::reachability::{DEFAULT_PROBE_TARGET, DEFAULT_PROBE_TIMEOUT_MS};
use crate::sensors::rules::{
    ClassificationRule, RuleTable, DEFAULT_NETWORK_ADAPTER, DEFAULT_STORAGE_VOLUME_TOKEN,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_psu_capacity_watts")]
    pub psu_capacity_watts: f64,
    #[serde(default)]
    pub sensors: SensorsConfig,
    #[serde(default)]
    pub reachability: ReachabilityConfig,
    #[serde(default)]
    pub speedtest: SpeedtestConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorBackend {
    #[default]
    Auto,
    Lhm,
    Sysinfo,
}

impl SensorBackend {
    pub fn resolve(self) -> Self {
        match self {
            Self::Auto if cfg!(windows) => Self::Lhm,
            Self::Auto => Self::Sysinfo,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SensorsConfig {
    #[serde(default)]
    pub backend: SensorBackend,
    #[serde(default = "default_network_adapter")]
    pub primary_network_adapter: String,
    #[serde(default = "default_storage_volume_token")]
    pub storage_volume_token: String,
    #[serde(default)]
    pub rules: Option<Vec<ClassificationRule>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    #[default]
    Tcp,
    Http,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReachabilityConfig {
    #[serde(default)]
    pub method: ProbeMethod,
    #[serde(default = "default_probe_target")]
    pub target: String,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpeedtestConfig {
    #[serde(default = "default_speedtest_executable")]
    pub executable: String,
    #[serde(default)]
    pub executable_dir: Option<PathBuf>,
    #[serde(default = "default_speedtest_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            backend: SensorBackend::default(),
            primary_network_adapter: default_network_adapter(),
            storage_volume_token: default_storage_volume_token(),
            rules: None,
        }
    }
}

impl SensorsConfig {
    pub fn rule_table(&self) -> RuleTable {
        match &self.rules {
            Some(rules) => RuleTable::new(rules.clone()),
            None => RuleTable::defaults(&self.primary_network_adapter, &self.storage_volume_token),
        }
    }
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            method: ProbeMethod::default(),
            target: default_probe_target(),
            timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl Default for SpeedtestConfig {
    fn default() -> Self {
        Self {
            executable: default_speedtest_executable(),
            executable_dir: None,
            timeout_secs: default_speedtest_timeout_secs(),
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
        if self.interval_secs < 1 {
            return Err(ConfigError::Validation(
                "interval_secs должно быть >= 1".to_string(),
            ));
        }
        if !self.psu_capacity_watts.is_finite() || self.psu_capacity_watts <= 0.0 {
            return Err(ConfigError::Validation(
                "psu_capacity_watts должно быть > 0".to_string(),
            ));
        }

        validate_sensors(&self.sensors)?;
        validate_reachability(&self.reachability)?;
        validate_speedtest(&self.speedtest)?;

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_sensors(cfg: &SensorsConfig) -> Result<(), ConfigError> {
    if cfg.primary_network_adapter.trim().is_empty() {
        return Err(ConfigError::Validation(
            "sensors.primary_network_adapter не должен быть пустым".to_string(),
        ));
    }
    if cfg.storage_volume_token.trim().is_empty() {
        return Err(ConfigError::Validation(
            "sensors.storage_volume_token не должен быть пустым".to_string(),
        ));
    }
    if let Some(rules) = &cfg.rules {
        if rules.is_empty() {
            return Err(ConfigError::Validation(
                "sensors.rules задан, но пуст".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_reachability(cfg: &ReachabilityConfig) -> Result<(), ConfigError> {
    if cfg.timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "reachability.timeout_ms должен быть > 0".to_string(),
        ));
    }
    match cfg.method {
        ProbeMethod::Tcp => {
            let Some((host, port)) = cfg.target.rsplit_once(':') else {
                return Err(ConfigError::Validation(format!(
                    "reachability.target '{}' должен иметь вид host:port",
                    cfg.target
                )));
            };
            if host.trim().is_empty() || port.parse::<u16>().map_or(true, |p| p == 0) {
                return Err(ConfigError::Validation(format!(
                    "reachability.target '{}' должен иметь вид host:port",
                    cfg.target
                )));
            }
        }
        ProbeMethod::Http => {
            if !(cfg.target.starts_with("http://") || cfg.target.starts_with("https://")) {
                return Err(ConfigError::Validation(format!(
                    "reachability.target '{}' должен быть URL http(s)",
                    cfg.target
                )));
            }
        }
    }
    Ok(())
}

fn validate_speedtest(cfg: &SpeedtestConfig) -> Result<(), ConfigError> {
    if cfg.executable.trim().is_empty() {
        return Err(ConfigError::Validation(
            "speedtest.executable не должен быть пустым".to_string(),
        ));
    }
    if cfg.timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "speedtest.timeout_secs должен быть > 0".to_string(),
        ));
    }
    Ok(())
}

const fn default_interval_secs() -> u64 {
    1
}

const fn default_psu_capacity_watts() -> f64 {
    DEFAULT_PSU_CAPACITY_WATTS
}

fn default_network_adapter() -> String {
    DEFAULT_NETWORK_ADAPTER.to_string()
}

fn default_storage_volume_token() -> String {
    DEFAULT_STORAGE_VOLUME_TOKEN.to_string()
}

fn default_probe_target() -> String {
    DEFAULT_PROBE_TARGET.to_string()
}

const fn default_probe_timeout_ms() -> u64 {
    DEFAULT_PROBE_TIMEOUT_MS
}

fn default_speedtest_executable() -> String {
    DEFAULT_SPEEDTEST_EXECUTABLE.to_string()
}

const fn default_speedtest_timeout_secs() -> u64 {
    DEFAULT_SPEEDTEST_TIMEOUT_SECS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::rules::RuleAction;
    use std::io::Write;

    fn valid_config() -> Config {
        Config {
            listen: "127.0.0.1:9108".to_string(),
            interval_secs: 1,
            psu_capacity_watts: 750.0,
            sensors: SensorsConfig::default(),
            reachability: ReachabilityConfig::default(),
            speedtest: SpeedtestConfig::default(),
        }
    }

    #[test]
    fn example_config_parses_and_validates() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml())
            .expect("пример конфигурации должен разбираться");
        cfg.validate().expect("пример конфигурации должен быть валиден");
        assert_eq!(cfg.psu_capacity_watts, 750.0);
        assert_eq!(cfg.reachability.target, "8.8.8.8:53");
        assert_eq!(cfg.speedtest.timeout_secs, 60);
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg: Config = serde_yaml::from_str("listen: \"0.0.0.0:9108\"\n").unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.interval_secs, 1);
        assert_eq!(cfg.sensors.backend, SensorBackend::Auto);
        assert_eq!(cfg.sensors.primary_network_adapter, "Local Area Connection");
        assert_eq!(cfg.sensors.storage_volume_token, "/nvme/0/");
        assert_eq!(cfg.reachability.method, ProbeMethod::Tcp);
        assert_eq!(cfg.reachability.timeout_ms, 1000);
        assert!(cfg.speedtest.executable_dir.is_none());
    }

    #[test]
    fn rejects_non_positive_capacity_and_timeouts() {
        let mut cfg = valid_config();
        cfg.psu_capacity_watts = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.reachability.timeout_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.speedtest.timeout_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.interval_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn probe_target_must_match_method() {
        let mut cfg = valid_config();
        cfg.reachability.target = "8.8.8.8".to_string();
        assert!(cfg.validate().is_err());

        cfg.reachability.method = ProbeMethod::Http;
        cfg.reachability.target = "https://example.com/".to_string();
        cfg.validate().unwrap();

        cfg.reachability.target = "example.com:443".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn custom_rules_replace_defaults() {
        let yaml = r#"
listen: "127.0.0.1:9108"
sensors:
  primary_network_adapter: "Ethernet"
  rules:
    - category: cpu
      kind: power
      name_contains: ["Package"]
      field: total_power_draw
      action: accumulate
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        cfg.validate().unwrap();
        let table = cfg.sensors.rule_table();
        assert_eq!(table.rules().len(), 1);
        assert_eq!(table.rules()[0].action, RuleAction::Accumulate);

        let defaults = SensorsConfig::default().rule_table();
        assert_eq!(defaults.rules().len(), 13);
    }

    #[test]
    fn load_from_file_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "listen: [not, a, string").unwrap();
        assert!(matches!(
            Config::load_from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            Config::load_from_file("/definitely/missing/config.yaml"),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn auto_backend_resolves_per_platform() {
        let resolved = SensorBackend::Auto.resolve();
        if cfg!(windows) {
            assert_eq!(resolved, SensorBackend::Lhm);
        } else {
            assert_eq!(resolved, SensorBackend::Sysinfo);
        }
        assert_eq!(SensorBackend::Lhm.resolve(), SensorBackend::Lhm);
    }
}
