//! Daemon configuration.
//!
//! Settings come from an optional TOML file named by `BOARDWATCH_CONFIG`,
//! then from `BOARDWATCH_*` environment variables. Everything has a default,
//! so a missing file gives the stock BT-11 setup.
//!
//! ```toml
//! [serial]
//! port = "/dev/ttyTHS0"
//! baud_rate = 1200
//!
//! [device]
//! variant = "bt01"
//!
//! [network]
//! ping_hosts = ["8.8.8.8", "www.google.com"]
//! failure_threshold = 4
//!
//! [jobs]
//! read_logs_at = "02:00"
//! archive_path = "/var/log/boardwatch/board.log"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use serde::Deserialize;

use crate::archive::{CommandHandoff, DEFAULT_GENERATIONS};
use crate::error::{Error, Result};
use crate::supervisor::network::PingProbe;
use crate::supervisor::{
    DeviceSettings, DeviceVariant, HeartbeatFailurePolicy, SupervisorConfig, SystemHost,
};
use crate::transport::serial::{DEFAULT_BAUD_RATE, DEFAULT_PORT, SerialConfig};

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_VAR: &str = "BOARDWATCH_CONFIG";

/// Prefix of all override variables.
const ENV_PREFIX: &str = "BOARDWATCH_";

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub serial: SerialSection,
    pub device: DeviceSection,
    pub liveness: LivenessSection,
    pub network: NetworkSection,
    pub jobs: JobsSection,
}

/// `[serial]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SerialSection {
    pub port: String,
    pub baud_rate: u32,
    /// Exit after this many failed opens. Unset retries forever.
    pub max_open_attempts: Option<u32>,
    pub open_retry_delay_ms: u64,
}

impl Default for SerialSection {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.to_owned(),
            baud_rate: DEFAULT_BAUD_RATE,
            max_open_attempts: None,
            open_retry_delay_ms: 0,
        }
    }
}

/// `[device]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceSection {
    pub variant: DeviceVariant,
    /// Overrides the variant's heartbeat failure policy.
    pub heartbeat_policy: Option<HeartbeatFailurePolicy>,
    /// Device heartbeat timeout code pushed on activation.
    pub heartbeat_period_code: Option<u8>,
    /// Device power-off delay code pushed on activation.
    pub poweroff_time_code: Option<u8>,
}

/// `[liveness]`, all durations in seconds unless noted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LivenessSection {
    /// Unset uses the variant default.
    pub startup_delay_secs: Option<u64>,
    pub poll_interval_secs: u64,
    pub handshake_deadline_secs: u64,
    pub handshake_retry_secs: u64,
    pub heartbeat_period_secs: u64,
    /// Unset uses the variant default.
    pub heartbeat_deadline_secs: Option<u64>,
    pub recovery_pause_secs: u64,
    pub recovery_interval_secs: u64,
    pub command_timeout_secs: u64,
    pub status_timeout_secs: u64,
    pub log_pause_ms: u64,
}

impl Default for LivenessSection {
    fn default() -> Self {
        Self {
            startup_delay_secs: None,
            poll_interval_secs: 10,
            handshake_deadline_secs: 60,
            handshake_retry_secs: 60,
            heartbeat_period_secs: 300,
            heartbeat_deadline_secs: None,
            recovery_pause_secs: 5,
            recovery_interval_secs: 300,
            command_timeout_secs: 30,
            status_timeout_secs: 10,
            log_pause_ms: 1000,
        }
    }
}

/// `[network]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkSection {
    pub ping_period_secs: u64,
    pub ping_hosts: Vec<String>,
    pub failure_threshold: u32,
    /// Per-reply wait handed to `ping -W`.
    pub ping_wait_secs: u64,
    /// Run on escalation, program first.
    pub shutdown_command: Vec<String>,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            ping_period_secs: 300,
            ping_hosts: vec!["8.8.8.8".to_owned(), "www.google.com".to_owned()],
            failure_threshold: 4,
            ping_wait_secs: 10,
            shutdown_command: vec!["shutdown".to_owned(), "-h".to_owned(), "now".to_owned()],
        }
    }
}

/// `[jobs]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobsSection {
    /// Local `HH:MM`.
    pub read_logs_at: String,
    /// Local `HH:MM`.
    pub rotate_logs_at: String,
    pub archive_path: PathBuf,
    pub keep_generations: u32,
    /// Receives each rotated archive path as its last argument. Empty
    /// disables the hand-off.
    pub handoff_command: Vec<String>,
}

impl Default for JobsSection {
    fn default() -> Self {
        Self {
            read_logs_at: "02:00".to_owned(),
            rotate_logs_at: "02:15".to_owned(),
            archive_path: PathBuf::from("/var/log/boardwatch/board.log"),
            keep_generations: DEFAULT_GENERATIONS,
            handoff_command: Vec::new(),
        }
    }
}

/// Parses a local `HH:MM` time of day.
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|e| Error::Config {
        message: format!("invalid time of day {value:?}: {e}"),
    })
}

fn parse_number<N: std::str::FromStr>(name: &str, value: &str) -> Result<N> {
    value.trim().parse().map_err(|_| Error::Config {
        message: format!("{ENV_PREFIX}{name}: not a number: {value:?}"),
    })
}

fn invalid(message: impl Into<String>) -> Error {
    Error::Config {
        message: message.into(),
    }
}

impl Config {
    /// Loads the file named by `BOARDWATCH_CONFIG` (if set), applies the
    /// environment overrides and validates the result.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var_os(CONFIG_PATH_VAR) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file without overrides or validation.
    pub fn from_file(path: &Path) -> Result<Self> {
        tracing::debug!("reading configuration from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses TOML text without overrides or validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Applies `BOARDWATCH_*` overrides from `(name, value)` pairs. Unrelated
    /// variables are ignored.
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match key {
                "SERIAL_PORT" => self.serial.port = value,
                "BAUD_RATE" => self.serial.baud_rate = parse_number(key, &value)?,
                "OPEN_MAX_ATTEMPTS" => {
                    self.serial.max_open_attempts = Some(parse_number(key, &value)?);
                }
                "HEARTBEAT_PERIOD_SECS" => {
                    self.liveness.heartbeat_period_secs = parse_number(key, &value)?;
                }
                "PING_PERIOD_SECS" => self.network.ping_period_secs = parse_number(key, &value)?,
                "PING_HOSTS" => {
                    self.network.ping_hosts = value
                        .split(',')
                        .map(str::trim)
                        .filter(|host| !host.is_empty())
                        .map(str::to_owned)
                        .collect();
                }
                "FAILURE_THRESHOLD" => {
                    self.network.failure_threshold = parse_number(key, &value)?;
                }
                "READ_LOGS_AT" => self.jobs.read_logs_at = value,
                "ROTATE_LOGS_AT" => self.jobs.rotate_logs_at = value,
                "ARCHIVE_PATH" => self.jobs.archive_path = PathBuf::from(value),
                "CONFIG" => {}
                _ => tracing::warn!("ignoring unknown setting {}", name),
            }
        }
        Ok(())
    }

    /// Checks values that would stall or break the supervisor.
    pub fn validate(&self) -> Result<()> {
        if self.serial.port.is_empty() {
            return Err(invalid("serial.port is empty"));
        }
        if self.serial.baud_rate == 0 {
            return Err(invalid("serial.baud_rate must be positive"));
        }
        if self.serial.max_open_attempts == Some(0) {
            return Err(invalid("serial.max_open_attempts must be at least 1"));
        }

        let liveness = &self.liveness;
        for (name, value) in [
            ("poll_interval_secs", liveness.poll_interval_secs),
            ("handshake_deadline_secs", liveness.handshake_deadline_secs),
            ("heartbeat_period_secs", liveness.heartbeat_period_secs),
            ("recovery_interval_secs", liveness.recovery_interval_secs),
            ("command_timeout_secs", liveness.command_timeout_secs),
            ("status_timeout_secs", liveness.status_timeout_secs),
        ] {
            if value == 0 {
                return Err(invalid(format!("liveness.{name} must be positive")));
            }
        }
        if liveness.heartbeat_deadline_secs == Some(0) {
            return Err(invalid("liveness.heartbeat_deadline_secs must be positive"));
        }

        if self.network.ping_period_secs == 0 {
            return Err(invalid("network.ping_period_secs must be positive"));
        }
        if self.network.ping_hosts.is_empty() {
            return Err(invalid("network.ping_hosts needs at least one host"));
        }
        if self.network.failure_threshold == 0 {
            return Err(invalid("network.failure_threshold must be at least 1"));
        }
        if self.network.shutdown_command.is_empty() {
            return Err(invalid("network.shutdown_command is empty"));
        }

        parse_time_of_day(&self.jobs.read_logs_at)?;
        parse_time_of_day(&self.jobs.rotate_logs_at)?;
        if self.jobs.keep_generations == 0 {
            return Err(invalid("jobs.keep_generations must be at least 1"));
        }
        Ok(())
    }

    /// Serial port settings.
    #[must_use]
    pub fn serial_config(&self) -> SerialConfig {
        SerialConfig::new(self.serial.port.clone())
            .baud_rate(self.serial.baud_rate)
            .max_open_attempts(self.serial.max_open_attempts)
            .open_retry_delay(Duration::from_millis(self.serial.open_retry_delay_ms))
    }

    /// Supervisor timing and policy, starting from the variant defaults.
    pub fn supervisor_config(&self) -> Result<SupervisorConfig> {
        let variant = self.device.variant;
        let defaults = SupervisorConfig::for_variant(variant);
        let liveness = &self.liveness;
        let secs = Duration::from_secs;

        let device_settings = match (
            self.device.heartbeat_period_code,
            self.device.poweroff_time_code,
        ) {
            (None, None) => defaults.device_settings,
            (heartbeat_period, poweroff_time) => {
                let base = variant.device_settings().unwrap_or(DeviceSettings {
                    heartbeat_period: 11,
                    poweroff_time: 0,
                });
                Some(DeviceSettings {
                    heartbeat_period: heartbeat_period.unwrap_or(base.heartbeat_period),
                    poweroff_time: poweroff_time.unwrap_or(base.poweroff_time),
                })
            }
        };

        Ok(SupervisorConfig {
            startup_delay: liveness
                .startup_delay_secs
                .map_or(defaults.startup_delay, secs),
            poll_interval: secs(liveness.poll_interval_secs),
            handshake_deadline: secs(liveness.handshake_deadline_secs),
            handshake_retry: secs(liveness.handshake_retry_secs),
            heartbeat_period: secs(liveness.heartbeat_period_secs),
            heartbeat_deadline: liveness
                .heartbeat_deadline_secs
                .map_or(defaults.heartbeat_deadline, secs),
            heartbeat_policy: self
                .device
                .heartbeat_policy
                .unwrap_or(defaults.heartbeat_policy),
            recovery_pause: secs(liveness.recovery_pause_secs),
            recovery_interval: secs(liveness.recovery_interval_secs),
            command_timeout: secs(liveness.command_timeout_secs),
            status_timeout: secs(liveness.status_timeout_secs),
            log_pause: Duration::from_millis(liveness.log_pause_ms),
            device_settings,
            ping_period: secs(self.network.ping_period_secs),
            ping_hosts: self.network.ping_hosts.clone(),
            failure_threshold: self.network.failure_threshold,
            read_logs_at: parse_time_of_day(&self.jobs.read_logs_at)?,
            rotate_logs_at: parse_time_of_day(&self.jobs.rotate_logs_at)?,
        })
    }

    /// Reachability probe.
    #[must_use]
    pub fn ping_probe(&self) -> PingProbe {
        PingProbe::new(Duration::from_secs(self.network.ping_wait_secs))
    }

    /// Host control used on escalation.
    #[must_use]
    pub fn shutdown_host(&self) -> SystemHost {
        SystemHost::from_command_line(&self.network.shutdown_command).unwrap_or_default()
    }

    /// Archive hand-off, if configured.
    #[must_use]
    pub fn handoff(&self) -> Option<CommandHandoff> {
        CommandHandoff::from_command_line(&self.jobs.handoff_command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn test_defaults_match_field_setup() {
        let config = Config::default();
        config.validate().unwrap();

        let serial = config.serial_config();
        assert_eq!(serial.port, "/dev/ttyTHS0");
        assert_eq!(serial.baud_rate, 1200);
        assert_eq!(serial.max_open_attempts, None);

        let supervisor = config.supervisor_config().unwrap();
        assert_eq!(supervisor.heartbeat_period, Duration::from_secs(300));
        assert_eq!(supervisor.heartbeat_deadline, Duration::from_secs(15));
        assert_eq!(supervisor.heartbeat_policy, HeartbeatFailurePolicy::Retry);
        assert_eq!(supervisor.failure_threshold, 4);
        assert_eq!(supervisor.ping_hosts, vec!["8.8.8.8", "www.google.com"]);
        assert_eq!(
            supervisor.read_logs_at,
            NaiveTime::from_hms_opt(2, 0, 0).unwrap()
        );
        assert!(config.handoff().is_none());
    }

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn test_parse_file() {
        let config = Config::from_toml(
            r#"
            [serial]
            port = "/dev/ttyACM0"
            max_open_attempts = 5

            [device]
            variant = "bt01"

            [liveness]
            heartbeat_period_secs = 120

            [jobs]
            rotate_logs_at = "03:30"
            handoff_command = ["sendlog", "ops@example.com"]
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.serial.port, "/dev/ttyACM0");
        assert_eq!(config.serial_config().max_open_attempts, Some(5));

        let supervisor = config.supervisor_config().unwrap();
        assert_eq!(supervisor.heartbeat_policy, HeartbeatFailurePolicy::Recover);
        assert_eq!(supervisor.startup_delay, Duration::from_secs(60));
        assert_eq!(supervisor.heartbeat_deadline, Duration::from_secs(10));
        assert_eq!(supervisor.device_settings, None);
        assert_eq!(supervisor.heartbeat_period, Duration::from_secs(120));
        assert_eq!(
            supervisor.rotate_logs_at,
            NaiveTime::from_hms_opt(3, 30, 0).unwrap()
        );
        assert!(config.handoff().is_some());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = Config::from_toml("[serial]\nbaud = 9600\n").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn test_policy_and_codes_override_variant() {
        let config = Config::from_toml(
            r#"
            [device]
            variant = "bt01"
            heartbeat_policy = "restart"
            poweroff_time_code = 3
            "#,
        )
        .unwrap();
        let supervisor = config.supervisor_config().unwrap();
        assert_eq!(supervisor.heartbeat_policy, HeartbeatFailurePolicy::Restart);
        assert_eq!(
            supervisor.device_settings,
            Some(DeviceSettings {
                heartbeat_period: 11,
                poweroff_time: 3
            })
        );
    }

    #[test]
    fn test_environment_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(vars(&[
                ("BOARDWATCH_SERIAL_PORT", "/dev/ttyUSB1"),
                ("BOARDWATCH_BAUD_RATE", "9600"),
                ("BOARDWATCH_OPEN_MAX_ATTEMPTS", "10"),
                ("BOARDWATCH_PING_HOSTS", "1.1.1.1, example.com,"),
                ("BOARDWATCH_FAILURE_THRESHOLD", "6"),
                ("BOARDWATCH_READ_LOGS_AT", "04:45"),
                ("BOARDWATCH_ARCHIVE_PATH", "/tmp/board.log"),
                ("HOME", "/root"),
            ]))
            .unwrap();
        config.validate().unwrap();

        assert_eq!(config.serial.port, "/dev/ttyUSB1");
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.serial.max_open_attempts, Some(10));
        assert_eq!(config.network.ping_hosts, vec!["1.1.1.1", "example.com"]);
        assert_eq!(config.network.failure_threshold, 6);
        assert_eq!(config.jobs.archive_path, PathBuf::from("/tmp/board.log"));
        assert_eq!(
            config.supervisor_config().unwrap().read_logs_at,
            NaiveTime::from_hms_opt(4, 45, 0).unwrap()
        );
    }

    #[test]
    fn test_bad_override_is_error() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(vars(&[("BOARDWATCH_BAUD_RATE", "fast")]))
            .unwrap_err();
        assert!(err.to_string().contains("BOARDWATCH_BAUD_RATE"));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.network.ping_hosts.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.network.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.jobs.read_logs_at = "25:00".to_owned();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.liveness.poll_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boardwatch.toml");
        std::fs::write(&path, "[network]\nfailure_threshold = 2\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.network.failure_threshold, 2);
        assert!(matches!(
            Config::from_file(&dir.path().join("missing.toml")),
            Err(Error::Io(_))
        ));
    }
}
