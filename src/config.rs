//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Every section and key is optional; missing values take the defaults below.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{FcLinkError, Result};
use crate::msp::protocol::MSP_MAX_CHUNK_SIZE;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub cli: CliConfig,
    #[serde(default)]
    pub decode: DecodeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serial port and request/response configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SerialConfig {
    /// Device path, or "auto" to scan
    #[serde(default = "default_serial_port")]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Time to wait for one response before retransmitting
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Retransmissions after the first attempt
    #[serde(default = "default_retries")]
    pub retries: u32,
}

/// Dataflash download configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DownloadConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u16,

    /// Extra attempts per chunk after the first
    #[serde(default = "default_chunk_retries")]
    pub chunk_retries: u32,

    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

/// CLI command channel configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CliConfig {
    /// Time to wait for the prompt after a command
    #[serde(default = "default_cli_timeout_ms")]
    pub timeout_ms: u64,
}

/// Blackbox decoding and flight segmentation configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DecodeConfig {
    /// Shorter arm/disarm cycles are discarded
    #[serde(default = "default_min_flight_duration_ms")]
    pub min_flight_duration_ms: u64,

    /// Slow-frame field carrying the arm state
    #[serde(default = "default_arming_field")]
    pub arming_field: String,

    /// Bit of `arming_field` that is set while armed
    #[serde(default)]
    pub arming_bit: u8,
}

/// Log output configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_file_enabled")]
    pub file_enabled: bool,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

// Default value functions
fn default_serial_port() -> String { "auto".to_string() }
fn default_baud_rate() -> u32 { 115_200 }
fn default_timeout_ms() -> u64 { 1000 }
fn default_retries() -> u32 { 3 }

fn default_chunk_size() -> u16 { 4096 }
fn default_chunk_retries() -> u32 { 5 }
fn default_output_dir() -> String { "./blackbox".to_string() }

fn default_cli_timeout_ms() -> u64 { 3000 }

fn default_min_flight_duration_ms() -> u64 { 2000 }
fn default_arming_field() -> String { "flightModeFlags".to_string() }

fn default_log_file_enabled() -> bool { true }
fn default_log_dir() -> String { "./logs".to_string() }

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baud_rate: default_baud_rate(),
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_retries: default_chunk_retries(),
            output_dir: default_output_dir(),
        }
    }
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_cli_timeout_ms(),
        }
    }
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            min_flight_duration_ms: default_min_flight_duration_ms(),
            arming_field: default_arming_field(),
            arming_bit: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file_enabled: default_log_file_enabled(),
            log_dir: default_log_dir(),
        }
    }
}

impl SerialConfig {
    /// Per-attempt response timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use fc_link::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.serial.port.trim().is_empty() {
            return Err(invalid("serial port cannot be empty (use \"auto\" to scan)"));
        }

        if ![9600, 19200, 38400, 57600, 115200, 230400, 250000, 460800, 500000, 921600, 1000000]
            .contains(&self.serial.baud_rate)
        {
            return Err(invalid("baud_rate must be a standard MSP rate (9600..=1000000)"));
        }

        if self.serial.timeout_ms == 0 || self.serial.timeout_ms > 30000 {
            return Err(invalid("timeout_ms must be between 1 and 30000"));
        }

        if self.serial.retries > 20 {
            return Err(invalid("retries must be at most 20"));
        }

        if self.download.chunk_size < 16 || self.download.chunk_size > MSP_MAX_CHUNK_SIZE {
            return Err(invalid(&format!(
                "chunk_size must be between 16 and {}",
                MSP_MAX_CHUNK_SIZE
            )));
        }

        if self.download.chunk_retries > 50 {
            return Err(invalid("chunk_retries must be at most 50"));
        }

        if self.download.output_dir.is_empty() {
            return Err(invalid("download output_dir cannot be empty"));
        }

        if self.cli.timeout_ms == 0 || self.cli.timeout_ms > 60000 {
            return Err(invalid("cli timeout_ms must be between 1 and 60000"));
        }

        if self.decode.min_flight_duration_ms > 3_600_000 {
            return Err(invalid("min_flight_duration_ms must be at most one hour"));
        }

        if self.decode.arming_field.is_empty() {
            return Err(invalid("arming_field cannot be empty"));
        }

        if self.decode.arming_bit > 31 {
            return Err(invalid("arming_bit must be between 0 and 31"));
        }

        if self.logging.file_enabled && self.logging.log_dir.is_empty() {
            return Err(invalid("logging log_dir cannot be empty when file logging is enabled"));
        }

        Ok(())
    }
}

fn invalid(message: &str) -> FcLinkError {
    FcLinkError::Config(toml::de::Error::custom(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_valid_config() -> Config {
        Config::default()
    }

    #[test]
    fn test_default_config() {
        let config = create_valid_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.serial.port, "auto");
        assert_eq!(config.serial.timeout(), Duration::from_millis(1000));
        assert_eq!(config.decode.min_flight_duration_ms, 2000);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.download.chunk_size, 4096);
        assert_eq!(config.decode.arming_field, "flightModeFlags");
    }

    #[test]
    fn test_load_config_from_file() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let toml_content = r#"
[serial]
port = "/dev/ttyACM0"
retries = 1

[download]
chunk_size = 2048

[decode]
min_flight_duration_ms = 5000
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.serial.port, "/dev/ttyACM0");
        assert_eq!(config.serial.retries, 1);
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.download.chunk_size, 2048);
        assert_eq!(config.decode.min_flight_duration_ms, 5000);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let result = Config::load("/nonexistent/fc-link.toml");
        assert!(matches!(result, Err(FcLinkError::Io(_))));
    }

    #[test]
    fn test_malformed_toml() {
        let result = Config::from_toml("[serial\nport = 1");
        assert!(matches!(result, Err(FcLinkError::Config(_))));
    }

    #[test]
    fn test_empty_serial_port() {
        let mut config = create_valid_config();
        config.serial.port = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_baud_rate() {
        let mut config = create_valid_config();
        config.serial.baud_rate = 420_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeout_ms_zero() {
        let mut config = create_valid_config();
        config.serial.timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeout_ms_too_high() {
        let mut config = create_valid_config();
        config.serial.timeout_ms = 30001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_retries_allowed() {
        let mut config = create_valid_config();
        config.serial.retries = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_chunk_size_bounds() {
        let mut config = create_valid_config();
        config.download.chunk_size = 8;
        assert!(config.validate().is_err());

        config.download.chunk_size = 8193;
        assert!(config.validate().is_err());

        // Address plus data must fit one MSP payload
        config.download.chunk_size = 8189;
        assert!(config.validate().is_err());

        config.download.chunk_size = 8188;
        assert!(config.validate().is_ok());

        config.download.chunk_size = 512;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_timeout_zero() {
        let mut config = create_valid_config();
        config.cli.timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_arming_bit_out_of_range() {
        let mut config = create_valid_config();
        config.decode.arming_bit = 32;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_log_dir_when_disabled() {
        let mut config = create_valid_config();
        config.logging.file_enabled = false;
        config.logging.log_dir = String::new();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_log_dir_when_enabled() {
        let mut config = create_valid_config();
        config.logging.log_dir = String::new();
        assert!(config.validate().is_err());
    }
}
