use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Deserialize, Serialize)]
pub struct DaemonConfig {
    pub bluetooth: BluetoothConfig,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BluetoothConfig {
    /// Run a bounded discovery scan right after startup so freshly booted
    /// systems pick up nearby devices without an explicit request.
    pub scan_on_startup: bool,
    pub startup_scan_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bluetooth: BluetoothConfig {
                scan_on_startup: false,
                startup_scan_secs: 30,
            },
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &str) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(_) => {
                // Create default config if not found
                let config = Self::default();
                let _ = fs::write(path, toml::to_string_pretty(&config)?);
                Ok(config)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let config = DaemonConfig::default();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let parsed: DaemonConfig = toml::from_str(&rendered).unwrap();

        assert!(!parsed.bluetooth.scan_on_startup);
        assert_eq!(parsed.bluetooth.startup_scan_secs, 30);
    }
}
