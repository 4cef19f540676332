//! # Configuration Management Module
//!
//! Settings for a fault-injection session are resolved once at startup into a
//! [`Config`] and passed by reference to whatever needs them. Sources, highest
//! precedence first: CLI flags, the TOML file, built-in defaults.
//!
//! ## Configuration Structure
//!
//! - [`SerialConfig`] - UART device and timeouts
//! - [`CampaignConfig`] - area/time profile selection and end-of-campaign policy
//! - [`PreflightConfig`] - connectivity check budget
//! - [`ControllerConfig`] - RX loop and watcher pacing
//! - [`PlatformConfig`] - SEM clocking used to cap injection rates
//! - [`LoggingConfig`] - diagnostic log and per-session event log
//!
//! ## Configuration File Format
//!
//! ```toml
//! [serial]
//! device = "/dev/ttyUSB0"
//! baud_rate = 1250000
//!
//! [campaign]
//! area = "address_list"
//! area_args = "path=lfas.txt,mode=random"
//! time = "uniform"
//! time_args = "rate_hz=10,max_shots=100"
//! on_end = "manual"
//! ```
//!
//! ## Profile arguments
//!
//! Profiles receive their arguments as a CSV `key=value` list (a bare `key`
//! means `true`). [`ProfileArgs`] parses that list once; its typed accessors
//! reject values that do not parse instead of silently using a default.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tokio::fs;

use crate::error::{ArmingError, ConfigError};
use crate::semio::transport::{SerialLinkConfig, DEFAULT_PROMPT_PATTERN};

/// Default config file name used by the CLI.
pub const DEFAULT_CONFIG_PATH: &str = "semfi.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub campaign: CampaignConfig,
    #[serde(default)]
    pub preflight: PreflightConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub device: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub open_timeout_ms: u64,
    /// Regex matching a bare device prompt.
    pub prompt_pattern: String,
    pub terminator: String,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: 1_250_000,
            read_timeout_ms: 50,
            write_timeout_ms: 100,
            open_timeout_ms: 2000,
            prompt_pattern: DEFAULT_PROMPT_PATTERN.to_string(),
            terminator: "\r".to_string(),
        }
    }
}

impl SerialConfig {
    pub fn link_config(&self) -> Result<SerialLinkConfig, ConfigError> {
        let prompt = regex::Regex::new(&self.prompt_pattern).map_err(|e| ConfigError::Invalid {
            key: "serial.prompt_pattern".into(),
            value: self.prompt_pattern.clone(),
            reason: e.to_string(),
        })?;
        let mut link = SerialLinkConfig::new(self.device.clone(), self.baud_rate);
        link.read_timeout = Duration::from_millis(self.read_timeout_ms);
        link.write_timeout = Duration::from_millis(self.write_timeout_ms);
        link.open_timeout = Duration::from_millis(self.open_timeout_ms);
        link.terminator = self.terminator.clone();
        link.prompt = prompt;
        Ok(link)
    }
}

/// What happens when a campaign ends or cannot be armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnEnd {
    /// Pause and hand control to the operator.
    #[default]
    Manual,
    /// Terminate the process.
    Exit,
}

impl fmt::Display for OnEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnEnd::Manual => f.write_str("manual"),
            OnEnd::Exit => f.write_str("exit"),
        }
    }
}

/// Device mode entered right after prompt synchronisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StartMode {
    #[default]
    Idle,
    Observe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignConfig {
    pub area: String,
    pub area_args: String,
    pub time: String,
    pub time_args: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub on_end: OnEnd,
    pub start_mode: StartMode,
    /// Print one status snapshot after the preflight succeeds.
    pub status_on_start: bool,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            area: "address_list".to_string(),
            area_args: String::new(),
            time: "uniform".to_string(),
            time_args: "rate_hz=1".to_string(),
            seed: None,
            on_end: OnEnd::Manual,
            start_mode: StartMode::Idle,
            status_on_start: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreflightConfig {
    pub attempts: u32,
    pub interval_ms: u64,
    /// Read window for each status reply.
    pub window_ms: u64,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            interval_ms: 500,
            window_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub rx_poll_ms: u64,
    pub sync_window_ms: u64,
    pub watcher_poll_ms: u64,
    /// Hold `[SEND]` echoes for injections until the previous shot completed.
    pub echo_gate: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            rx_poll_ms: 30,
            sync_window_ms: 500,
            watcher_poll_ms: 100,
            echo_gate: true,
        }
    }
}

/// SEM clocking used to derive the maximum sustainable injection rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub icap_fmax_hz: f64,
    pub sem_freq_hz: f64,
    pub inject_latency_us_at_fmax: f64,
    pub safety_derate: f64,
    /// Extra ceiling imposed by the UART; 0 disables it.
    pub uart_cap_hz: f64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            icap_fmax_hz: 200_000_000.0,
            sem_freq_hz: 100_000_000.0,
            inject_latency_us_at_fmax: 50.0,
            safety_derate: 1.0,
            uart_cap_hz: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub results_dir: String,
    pub run_name: String,
    pub session_label: String,
    /// Spaces between a TX command and its `*` marker in the event log.
    pub tx_marker_gap: usize,
    pub tags: LogTags,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            results_dir: "results".to_string(),
            run_name: "run".to_string(),
            session_label: "session".to_string(),
            tx_marker_gap: 15,
            tags: LogTags::default(),
        }
    }
}

/// Per-tag switches for the session event log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogTags {
    pub sem_cmd: bool,
    pub info: bool,
    pub error: bool,
    pub cnsl_cmd: bool,
    pub prof_time: bool,
    pub prof_area: bool,
}

impl Default for LogTags {
    fn default() -> Self {
        Self {
            sem_cmd: true,
            info: true,
            error: true,
            cnsl_cmd: true,
            prof_time: true,
            prof_area: true,
        }
    }
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub device: Option<String>,
    pub baud: Option<u32>,
    pub area: Option<String>,
    pub area_args: Option<String>,
    pub time: Option<String>,
    pub time_args: Option<String>,
    pub seed: Option<u64>,
    pub on_end: Option<OnEnd>,
    pub run_name: Option<String>,
    pub session_label: Option<String>,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config
            .validate()
            .map_err(|e| anyhow!("Invalid config file {}: {}", path, e))?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub async fn load_or_default(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            log::debug!("Config file {} not found, using defaults", path);
            return Ok(Config::default());
        }
        Self::load(path).await
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn apply_overrides(&mut self, cli: &CliOverrides) {
        if let Some(dev) = &cli.device {
            self.serial.device = dev.clone();
        }
        if let Some(baud) = cli.baud {
            self.serial.baud_rate = baud;
        }
        if let Some(area) = &cli.area {
            self.campaign.area = area.clone();
        }
        if let Some(args) = &cli.area_args {
            self.campaign.area_args = args.clone();
        }
        if let Some(time) = &cli.time {
            self.campaign.time = time.clone();
        }
        if let Some(args) = &cli.time_args {
            self.campaign.time_args = args.clone();
        }
        if cli.seed.is_some() {
            self.campaign.seed = cli.seed;
        }
        if let Some(on_end) = cli.on_end {
            self.campaign.on_end = on_end;
        }
        if let Some(run) = &cli.run_name {
            self.logging.run_name = run.clone();
        }
        if let Some(session) = &cli.session_label {
            self.logging.session_label = session.clone();
        }
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.serial.device.trim().is_empty() {
            return Err(ConfigError::Missing("serial.device".into()));
        }
        if self.serial.baud_rate == 0 {
            return Err(invalid("serial.baud_rate", "0", "must be positive"));
        }
        self.serial.link_config()?;
        if self.preflight.attempts == 0 {
            return Err(invalid("preflight.attempts", "0", "at least one attempt is required"));
        }
        let p = &self.platform;
        for (key, value) in [
            ("platform.icap_fmax_hz", p.icap_fmax_hz),
            ("platform.sem_freq_hz", p.sem_freq_hz),
            ("platform.inject_latency_us_at_fmax", p.inject_latency_us_at_fmax),
            ("platform.safety_derate", p.safety_derate),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(invalid(key, &value.to_string(), "must be a positive number"));
            }
        }
        if !(p.uart_cap_hz.is_finite() && p.uart_cap_hz >= 0.0) {
            return Err(invalid(
                "platform.uart_cap_hz",
                &p.uart_cap_hz.to_string(),
                "must be zero or positive",
            ));
        }
        if self.campaign.area.trim().is_empty() {
            return Err(ConfigError::Missing("campaign.area".into()));
        }
        if self.campaign.time.trim().is_empty() {
            return Err(ConfigError::Missing("campaign.time".into()));
        }
        Ok(())
    }

    /// Configured seed, or a fresh random one.
    pub fn resolve_seed(&self) -> u64 {
        self.campaign.seed.unwrap_or_else(rand::random)
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.into(),
        value: value.into(),
        reason: reason.into(),
    }
}

/// Parsed `key=value` arguments for one profile. Keys are lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileArgs {
    entries: BTreeMap<String, String>,
}

impl ProfileArgs {
    /// Parse a CSV list. Empty items are skipped; a bare key maps to `true`.
    pub fn parse(csv: &str) -> Self {
        let mut entries = BTreeMap::new();
        for part in csv.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some((k, v)) => entries.insert(k.trim().to_ascii_lowercase(), v.trim().to_string()),
                None => entries.insert(part.to_ascii_lowercase(), "true".to_string()),
            };
        }
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// First present key among `keys` (aliases) together with its value.
    pub fn first<'a>(&'a self, keys: &[&'a str]) -> Option<(&'a str, &'a str)> {
        keys.iter()
            .find_map(|k| self.entries.get(*k).map(|v| (*k, v.as_str())))
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.entries.insert(key.to_ascii_lowercase(), value.into());
    }

    pub fn set_default(&mut self, key: &str, value: impl Into<String>) {
        self.entries
            .entry(key.to_ascii_lowercase())
            .or_insert_with(|| value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn str(&self, keys: &[&str]) -> Option<String> {
        self.first(keys).map(|(_, v)| v.to_string())
    }

    pub fn f64(&self, profile: &'static str, keys: &[&str]) -> Result<Option<f64>, ArmingError> {
        self.typed(profile, keys, |v| {
            v.parse::<f64>()
                .ok()
                .filter(|x| x.is_finite())
                .ok_or("expected a number")
        })
    }

    pub fn u64(&self, profile: &'static str, keys: &[&str]) -> Result<Option<u64>, ArmingError> {
        self.typed(profile, keys, |v| parse_u64(v).ok_or("expected a non-negative integer"))
    }

    pub fn bool(&self, profile: &'static str, keys: &[&str]) -> Result<Option<bool>, ArmingError> {
        self.typed(profile, keys, |v| match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err("expected true/false"),
        })
    }

    fn typed<T>(
        &self,
        profile: &'static str,
        keys: &[&str],
        parse: impl Fn(&str) -> Result<T, &'static str>,
    ) -> Result<Option<T>, ArmingError> {
        match self.first(keys) {
            None => Ok(None),
            Some((key, value)) => parse(value)
                .map(Some)
                .map_err(|reason| ArmingError::InvalidArgument {
                    profile,
                    key: format!("{key}={value}"),
                    reason: reason.to_string(),
                }),
        }
    }
}

impl fmt::Display for ProfileArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.entries {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

/// Decimal or `0x`-prefixed hexadecimal.
fn parse_u64(v: &str) -> Option<u64> {
    let v = v.trim();
    match v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => v.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.preflight.attempts, 3);
        assert_eq!(config.campaign.on_end, OnEnd::Manual);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [serial]
            device = "/dev/ttyACM3"

            [campaign]
            on_end = "exit"
            "#,
        )
        .unwrap();
        assert_eq!(config.serial.device, "/dev/ttyACM3");
        assert_eq!(config.serial.baud_rate, 1_250_000);
        assert_eq!(config.campaign.on_end, OnEnd::Exit);
        assert_eq!(config.controller.watcher_poll_ms, 100);
    }

    #[test]
    fn test_cli_overrides_win() {
        let mut config = Config::default();
        config.apply_overrides(&CliOverrides {
            device: Some("/dev/ttyS9".into()),
            baud: Some(115_200),
            time_args: Some("rate_hz=5".into()),
            seed: Some(7),
            ..Default::default()
        });
        assert_eq!(config.serial.device, "/dev/ttyS9");
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.campaign.time_args, "rate_hz=5");
        assert_eq!(config.resolve_seed(), 7);
    }

    #[test]
    fn test_invalid_prompt_pattern_rejected() {
        let mut config = Config::default();
        config.serial.prompt_pattern = "([".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_profile_args_parse_and_aliases() {
        let args = ProfileArgs::parse(" Rate_Hz = 2.5 , ack ,, max_shots=0x10");
        assert_eq!(args.get("rate_hz"), Some("2.5"));
        assert_eq!(args.bool("uniform", &["ack"]).unwrap(), Some(true));
        assert_eq!(args.u64("uniform", &["max_shots"]).unwrap(), Some(16));
        assert_eq!(args.f64("uniform", &["rate", "rate_hz"]).unwrap(), Some(2.5));
        assert_eq!(args.f64("uniform", &["period_s"]).unwrap(), None);
    }

    #[test]
    fn test_profile_args_reject_bad_values() {
        let args = ProfileArgs::parse("rate_hz=fast,ack=maybe");
        let err = args.f64("uniform", &["rate_hz"]).unwrap_err();
        assert!(err.to_string().contains("rate_hz=fast"));
        assert!(args.bool("uniform", &["ack"]).is_err());
    }

    #[test]
    fn test_profile_args_set_default_keeps_existing() {
        let mut args = ProfileArgs::parse("seed=5");
        args.set_default("seed", "99");
        args.set_default("mode", "sequential");
        assert_eq!(args.get("seed"), Some("5"));
        assert_eq!(args.to_string(), "mode=sequential,seed=5");
    }
}
