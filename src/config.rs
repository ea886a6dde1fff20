//! Configuration
//!
//! Loaded from a TOML file at startup. Every section has defaults, so a
//! missing file or a partial one is fine. Command tuning is re-read on every
//! execution through [`ConfigService`], which makes it hot-reloadable.

use raybot_shared::limits;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Minimum age before a finished command may be pruned
pub const MIN_DELETE_OLD_COMMAND_THRESHOLD_SECS: u64 = 60 * 60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("failed to serialize config: {0}")]
    Serialize(String),

    #[error("invalid config {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub hardware: HardwareConfig,
    pub command: CommandConfig,
    pub cron: CronConfig,
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub pic: DeviceConfig,
    pub esp: DeviceConfig,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            pic: DeviceConfig::with_port("/dev/ttyUSB0"),
            esp: DeviceConfig::with_port("/dev/ttyUSB1"),
        }
    }
}

/// One microcontroller link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub enable_ack: bool,
    /// 0 means the default timeout
    pub command_ack_timeout_ms: u64,
    pub serial: SerialConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::with_port("/dev/ttyUSB0")
    }
}

impl DeviceConfig {
    fn with_port(port: &str) -> Self {
        Self {
            enable_ack: true,
            command_ack_timeout_ms: limits::DEFAULT_COMMAND_ACK_TIMEOUT_MS,
            serial: SerialConfig {
                port: port.into(),
                ..SerialConfig::default()
            },
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        match self.command_ack_timeout_ms {
            0 => Duration::from_millis(limits::DEFAULT_COMMAND_ACK_TIMEOUT_MS),
            ms => Duration::from_millis(ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

impl FromStr for Parity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(Parity::None),
            "ODD" => Ok(Parity::Odd),
            "EVEN" => Ok(Parity::Even),
            other => Err(format!("invalid parity {other}, expected NONE, ODD or EVEN")),
        }
    }
}

impl TryFrom<String> for Parity {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Parity> for String {
    fn from(parity: Parity) -> Self {
        parity.to_string()
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parity::None => f.write_str("NONE"),
            Parity::Odd => f.write_str("ODD"),
            Parity::Even => f.write_str("EVEN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    pub read_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".into(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            read_timeout_ms: 1000,
        }
    }
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port.trim().is_empty() {
            return Err(ConfigError::invalid("serial.port", "must not be empty"));
        }
        if !(1200..=115_200).contains(&self.baud_rate) {
            return Err(ConfigError::invalid(
                "serial.baud_rate",
                format!("{} is outside 1200..=115200", self.baud_rate),
            ));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(ConfigError::invalid(
                "serial.data_bits",
                format!("{} is outside 5..=8", self.data_bits),
            ));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(ConfigError::invalid(
                "serial.stop_bits",
                format!("{} must be 1 or 2", self.stop_bits),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub cargo_lift: CargoLiftConfig,
    pub cargo_lower: CargoLowerConfig,
}

impl CommandConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cargo_lower.bottom_obstacle_tracking.validate()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CargoLiftConfig {
    /// 0 is treated as 1
    pub stable_read_count: u8,
}

impl CargoLiftConfig {
    pub fn stable_read_count(&self) -> u8 {
        self.stable_read_count.max(1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CargoLowerConfig {
    /// 0 is treated as 1
    pub stable_read_count: u8,
    pub bottom_obstacle_tracking: ObstacleTrackingConfig,
}

impl CargoLowerConfig {
    pub fn stable_read_count(&self) -> u8 {
        self.stable_read_count.max(1)
    }
}

/// Distances in cm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObstacleTrackingConfig {
    pub enter_distance: u16,
    pub exit_distance: u16,
}

impl Default for ObstacleTrackingConfig {
    fn default() -> Self {
        Self {
            enter_distance: limits::DEFAULT_OBSTACLE_ENTER_DISTANCE,
            exit_distance: limits::DEFAULT_OBSTACLE_EXIT_DISTANCE,
        }
    }
}

impl ObstacleTrackingConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.enter_distance >= self.exit_distance {
            return Err(ConfigError::invalid(
                "command.cargo_lower.bottom_obstacle_tracking",
                format!(
                    "enter_distance ({}) must be less than exit_distance ({})",
                    self.enter_distance, self.exit_distance
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    pub delete_old_command: DeleteOldCommandConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteOldCommandConfig {
    pub interval_secs: u64,
    pub threshold_secs: u64,
}

impl Default for DeleteOldCommandConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60 * 60,
            threshold_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl DeleteOldCommandConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn threshold(&self) -> Duration {
        Duration::from_secs(self.threshold_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub execute_interval_ms: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            execute_interval_ms: 1000,
        }
    }
}

impl JobsConfig {
    pub fn execute_interval(&self) -> Duration {
        Duration::from_millis(self.execute_interval_ms)
    }
}

impl Config {
    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_read(path, std::fs::read_to_string(path))
    }

    /// [`Config::load`] without blocking the runtime
    pub async fn load_async(path: &Path) -> Result<Self, ConfigError> {
        Self::from_read(path, tokio::fs::read_to_string(path).await)
    }

    fn from_read(path: &Path, read: std::io::Result<String>) -> Result<Self, ConfigError> {
        match read {
            Ok(content) => Self::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.hardware.pic.serial.validate()?;
        self.hardware.esp.serial.validate()?;
        if self.hardware.pic.serial.port == self.hardware.esp.serial.port {
            return Err(ConfigError::invalid(
                "hardware.esp.serial.port",
                "PIC and ESP serial ports must be different",
            ));
        }
        self.command.validate()?;
        if self.cron.delete_old_command.threshold_secs < MIN_DELETE_OLD_COMMAND_THRESHOLD_SECS {
            return Err(ConfigError::invalid(
                "cron.delete_old_command.threshold_secs",
                "must be at least one hour",
            ));
        }
        if self.cron.delete_old_command.interval_secs == 0 {
            return Err(ConfigError::invalid(
                "cron.delete_old_command.interval_secs",
                "must be greater than 0",
            ));
        }
        if self.jobs.execute_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "jobs.execute_interval_ms",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Shared, hot-reloadable view of the configuration
#[derive(Debug)]
pub struct ConfigService {
    path: Option<PathBuf>,
    config: RwLock<Config>,
}

impl ConfigService {
    /// Wrap `config`; with a `path`, updates are written back and reloads read it
    pub fn new(config: Config, path: Option<PathBuf>) -> Self {
        Self {
            path,
            config: RwLock::new(config),
        }
    }

    /// Load from a file and remember the path for later writes
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = Config::load(&path)?;
        Ok(Self::new(config, Some(path)))
    }

    /// Snapshot of the whole configuration
    pub fn config(&self) -> Config {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Snapshot of the command tuning, read once per execution
    pub fn command_config(&self) -> CommandConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .command
            .clone()
    }

    /// Validate and swap the command section, then persist the file
    pub async fn update_command_config(&self, command: CommandConfig) -> Result<(), ConfigError> {
        command.validate()?;
        let snapshot = {
            let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
            config.command = command;
            config.clone()
        };
        self.persist(&snapshot).await?;
        info!("command config updated");
        Ok(())
    }

    /// Re-read the file; the current config is kept if it fails to load
    pub async fn reload(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let fresh = Config::load_async(path).await?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        info!(path = %path.display(), "config reloaded");
        Ok(())
    }

    async fn persist(&self, config: &Config) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content =
            toml::to_string_pretty(config).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| ConfigError::Io {
                path: path.clone(),
                source: e,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.hardware.pic.enable_ack);
        assert_eq!(config.hardware.pic.ack_timeout(), Duration::from_secs(1));
        assert_eq!(config.command.cargo_lift.stable_read_count(), 1);
    }

    #[test]
    fn test_parse_partial_file() {
        let config = Config::parse(
            r#"
            [hardware.pic]
            enable_ack = false
            command_ack_timeout_ms = 0

            [hardware.pic.serial]
            port = "/dev/ttyACM0"
            parity = "even"

            [command.cargo_lower]
            stable_read_count = 3

            [command.cargo_lower.bottom_obstacle_tracking]
            enter_distance = 15
            exit_distance = 30
            "#,
        )
        .expect("parse failed");

        assert!(!config.hardware.pic.enable_ack);
        assert_eq!(config.hardware.pic.ack_timeout(), Duration::from_secs(1));
        assert_eq!(config.hardware.pic.serial.parity, Parity::Even);
        assert_eq!(config.hardware.esp.serial.port, "/dev/ttyUSB1");
        assert_eq!(config.command.cargo_lower.stable_read_count(), 3);
        assert_eq!(
            config.command.cargo_lower.bottom_obstacle_tracking.enter_distance,
            15
        );
    }

    #[test]
    fn test_invalid_serial_settings() {
        let mut config = Config::default();
        config.hardware.pic.serial.baud_rate = 300;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "serial.baud_rate", .. })
        ));

        let mut config = Config::default();
        config.hardware.esp.serial.stop_bits = 3;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.hardware.esp.serial.port = config.hardware.pic.serial.port.clone();
        assert!(config.validate().is_err());

        assert!(Config::parse("[hardware.pic.serial]\nparity = \"MARK\"").is_err());
    }

    #[test]
    fn test_obstacle_thresholds_must_be_ordered() {
        let mut config = Config::default();
        config.command.cargo_lower.bottom_obstacle_tracking = ObstacleTrackingConfig {
            enter_distance: 20,
            exit_distance: 20,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_delete_threshold_minimum() {
        let mut config = Config::default();
        config.cron.delete_old_command.threshold_secs = 59 * 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[tokio::test]
    async fn test_update_command_config_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let service = ConfigService::new(Config::default(), Some(path.clone()));

        let mut command = service.command_config();
        command.cargo_lift.stable_read_count = 4;
        service.update_command_config(command).await.unwrap();
        assert_eq!(service.command_config().cargo_lift.stable_read_count, 4);

        let reloaded = ConfigService::load(&path).unwrap();
        assert_eq!(reloaded.command_config().cargo_lift.stable_read_count, 4);

        let mut bad = service.command_config();
        bad.cargo_lower.bottom_obstacle_tracking.enter_distance = 50;
        assert!(service.update_command_config(bad).await.is_err());
        assert_eq!(
            service
                .command_config()
                .cargo_lower
                .bottom_obstacle_tracking
                .enter_distance,
            limits::DEFAULT_OBSTACLE_ENTER_DISTANCE
        );
    }

    #[tokio::test]
    async fn test_reload_picks_up_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[command.cargo_lift]\nstable_read_count = 2\n").unwrap();
        let service = ConfigService::load(&path).unwrap();
        assert_eq!(service.command_config().cargo_lift.stable_read_count, 2);

        std::fs::write(&path, "[command.cargo_lift]\nstable_read_count = 5\n").unwrap();
        service.reload().await.unwrap();
        assert_eq!(service.command_config().cargo_lift.stable_read_count, 5);
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_current_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[command.cargo_lift]\nstable_read_count = 3\n").unwrap();
        let service = ConfigService::load(&path).unwrap();

        std::fs::write(&path, "[command.cargo_lift]\nstable_read_count = \"many\"\n").unwrap();
        assert!(matches!(service.reload().await, Err(ConfigError::Parse(_))));
        assert_eq!(service.command_config().cargo_lift.stable_read_count, 3);
    }
}
