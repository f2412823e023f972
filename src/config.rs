use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AggregatorError, Result};

fn default_main_loop_interval_ms() -> u64 {
    120
}
fn default_max_mcu_time_difference_ms() -> u64 {
    150
}
fn default_data_validity_threshold_ms() -> u64 {
    300
}
fn default_scan_timeout_ms() -> u64 {
    1_500
}
fn default_scan_check_interval_ms() -> u64 {
    500
}
fn default_connection_timeout_ms() -> u64 {
    8_000
}
fn default_reconnection_delay_ms() -> u64 {
    1_000
}
fn default_max_consecutive_fail() -> u32 {
    15
}
fn default_mtu_ceiling() -> usize {
    512
}
fn default_advertisement_name() -> String {
    "CENTRAL_PI".to_string()
}
fn default_settle_delay_ms() -> u64 {
    300
}

/// One fixed roster entry. Ordering in the roster file defines the slot index
/// used everywhere downstream (session table, combined-frame keys).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PeerSpec {
    /// BLE hardware address, e.g. "AA:BB:CC:DD:EE:FF".
    pub address: String,
    pub display_name: String,
    #[serde(default)]
    pub short_name: Option<String>,
}

impl PeerSpec {
    /// Resolved short name: explicit override, or initials derived from `display_name`
    /// (e.g. `LEFT_ARM` -> `LA`).
    pub fn short_name(&self) -> String {
        match &self.short_name {
            Some(name) => name.clone(),
            None => initials(&self.display_name),
        }
    }
}

fn initials(display_name: &str) -> String {
    let letters: String = display_name
        .split(|c: char| c == '_' || c == ' ' || c == '-')
        .filter(|part| !part.is_empty())
        .filter_map(|part| part.chars().next())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    if letters.is_empty() {
        display_name.to_ascii_uppercase()
    } else {
        letters
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub roster: Vec<PeerSpec>,

    #[serde(default = "default_main_loop_interval_ms")]
    pub main_loop_interval_ms: u64,
    #[serde(default = "default_max_mcu_time_difference_ms")]
    pub max_mcu_time_difference_ms: u64,
    #[serde(default = "default_data_validity_threshold_ms")]
    pub data_validity_threshold_ms: u64,
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    #[serde(default = "default_scan_check_interval_ms")]
    pub scan_check_interval_ms: u64,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_reconnection_delay_ms")]
    pub reconnection_delay_ms: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_max_consecutive_fail")]
    pub max_consecutive_fail: u32,
    #[serde(default = "default_mtu_ceiling")]
    pub mtu_ceiling: usize,
    #[serde(default = "default_advertisement_name")]
    pub advertisement_name: String,
}

impl Config {
    /// Read and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AggregatorError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| AggregatorError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.roster.is_empty() {
            return Err(AggregatorError::Config("roster must not be empty".into()));
        }

        let mut seen = HashSet::new();
        for peer in &self.roster {
            if !seen.insert(peer.address.to_ascii_uppercase()) {
                return Err(AggregatorError::Config(format!(
                    "duplicate roster address: {}",
                    peer.address
                )));
            }
        }

        let durations_ms = [
            ("main_loop_interval_ms", self.main_loop_interval_ms),
            ("max_mcu_time_difference_ms", self.max_mcu_time_difference_ms),
            ("data_validity_threshold_ms", self.data_validity_threshold_ms),
            ("scan_timeout_ms", self.scan_timeout_ms),
            ("scan_check_interval_ms", self.scan_check_interval_ms),
            ("connection_timeout_ms", self.connection_timeout_ms),
            ("reconnection_delay_ms", self.reconnection_delay_ms),
            ("settle_delay_ms", self.settle_delay_ms),
        ];
        for (name, value) in durations_ms {
            if value == 0 {
                return Err(AggregatorError::Config(format!("{name} must be > 0")));
            }
        }

        if self.max_consecutive_fail == 0 {
            return Err(AggregatorError::Config("max_consecutive_fail must be > 0".into()));
        }
        if self.mtu_ceiling == 0 {
            return Err(AggregatorError::Config("mtu_ceiling must be > 0".into()));
        }

        Ok(())
    }

    pub fn main_loop_interval(&self) -> Duration {
        Duration::from_millis(self.main_loop_interval_ms)
    }
    pub fn max_mcu_time_difference(&self) -> Duration {
        Duration::from_millis(self.max_mcu_time_difference_ms)
    }
    pub fn data_validity_threshold(&self) -> Duration {
        Duration::from_millis(self.data_validity_threshold_ms)
    }
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }
    pub fn scan_check_interval(&self) -> Duration {
        Duration::from_millis(self.scan_check_interval_ms)
    }
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
    pub fn reconnection_delay(&self) -> Duration {
        Duration::from_millis(self.reconnection_delay_ms)
    }
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}
