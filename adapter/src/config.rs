//! Adapter configuration.
//!
//! Settings are stored as TOML for human readability. Everything has a
//! default, so a missing file or an empty table still yields a runnable
//! configuration for the common single-printer setup.

use std::path::Path;

use serde::{Deserialize, Serialize};

use printer_protocol::{DEFAULT_RESET_PIN, SD_MOUNT_NAME};

/// Complete adapter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub serial: SerialSettings,

    #[serde(default)]
    pub printer: PrinterSettings,
}

/// Serial link parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Device path of the printer port.
    #[serde(default = "default_port")]
    pub port: String,

    /// Baud rate, 8-N-1 assumed.
    #[serde(default = "default_baud")]
    pub baud: u32,
}

/// Printer behavior switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterSettings {
    /// BCM pin wired to the printer reset line.
    #[serde(default = "default_reset_pin")]
    pub reset_pin: u8,

    /// Keep FINISHED / STOPPED on screen until the user confirms them.
    #[serde(default)]
    pub m0_after_prints: bool,

    /// Mount point name of the SD card in long file paths.
    #[serde(default = "default_sd_mount_name")]
    pub sd_mount_name: String,
}

fn default_port() -> String {
    "/dev/ttyACM0".to_string()
}

fn default_baud() -> u32 {
    115_200
}

fn default_reset_pin() -> u8 {
    DEFAULT_RESET_PIN
}

fn default_sd_mount_name() -> String {
    SD_MOUNT_NAME.to_string()
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud: default_baud(),
        }
    }
}

impl Default for PrinterSettings {
    fn default() -> Self {
        Self {
            reset_pin: default_reset_pin(),
            m0_after_prints: false,
            sd_mount_name: default_sd_mount_name(),
        }
    }
}

impl Settings {
    /// Loads settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Saves settings to a TOML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializationError(e.to_string()))?;
        std::fs::write(path.as_ref(), contents).map_err(|e| ConfigError::IoError(e.to_string()))
    }

    /// Validates that the configuration is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.port.is_empty() {
            return Err(ConfigError::InvalidConfiguration(
                "serial port path cannot be empty".to_string(),
            ));
        }
        if self.serial.baud == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "baud rate must be positive".to_string(),
            ));
        }
        if self.printer.sd_mount_name.is_empty() {
            return Err(ConfigError::InvalidConfiguration(
                "SD mount name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.serial.baud, 115_200);
        assert_eq!(settings.printer.reset_pin, DEFAULT_RESET_PIN);
        assert_eq!(settings.printer.sd_mount_name, SD_MOUNT_NAME);
        assert!(!settings.printer.m0_after_prints);
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            [serial]
            port = "/dev/ttyUSB1"
            "#,
        )
        .unwrap();
        assert_eq!(settings.serial.port, "/dev/ttyUSB1");
        assert_eq!(settings.serial.baud, 115_200);
        assert_eq!(settings.printer.reset_pin, DEFAULT_RESET_PIN);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adapter.toml");

        let mut settings = Settings::default();
        settings.serial.port = "/dev/ttyACM3".to_string();
        settings.printer.m0_after_prints = true;
        settings.to_file(&path).unwrap();

        let loaded = Settings::from_file(&path).unwrap();
        assert_eq!(loaded.serial.port, "/dev/ttyACM3");
        assert!(loaded.printer.m0_after_prints);
    }

    #[test]
    fn test_validation_rejects_empty_port() {
        let mut settings = Settings::default();
        settings.serial.port.clear();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidConfiguration(_))
        ));
    }
}
