//! Engine configuration, loadable from TOML.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::protocol::constants::{
    DFU_FIRMWARE_ADDRESS, DFU_FIRMWARE_SIZE, DFU_PIDS, DFU_TRANSFER_SIZE, LEGO_VENDOR_ID,
    MAX_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION,
};

/// Configuration shared by connections, transfers and the flasher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Bound on opening a transport.
    pub connect_timeout_ms: u64,
    /// Bound on each negotiation read.
    pub negotiate_timeout_ms: u64,
    /// Bound on waiting for a chunk acknowledgement.
    pub ack_timeout_ms: u64,
    /// Bound on a discovery scan.
    pub scan_timeout_ms: u64,
    /// Bound on draining buffered output while disconnecting.
    pub disconnect_timeout_ms: u64,
    /// Resends of a chunk whose echoed checksum mismatched.
    pub max_chunk_retries: u32,
    /// Lowest supported protocol version (inclusive).
    pub min_protocol: semver::Version,
    /// First unsupported protocol version (exclusive).
    pub max_protocol: semver::Version,
    /// Capacity of each connection's event channel.
    pub event_capacity: usize,
    /// Output frames held by the connection when subscribers fall behind.
    pub pending_output_capacity: usize,
    pub dfu: UsbDfuConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            negotiate_timeout_ms: 5_000,
            ack_timeout_ms: 5_000,
            scan_timeout_ms: 10_000,
            disconnect_timeout_ms: 5_000,
            max_chunk_retries: 3,
            min_protocol: MIN_PROTOCOL_VERSION,
            max_protocol: MAX_PROTOCOL_VERSION,
            event_capacity: 64,
            pending_output_capacity: 256,
            dfu: UsbDfuConfig::default(),
        }
    }
}

impl HubConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: HubConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn negotiate_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiate_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }
}

/// USB DFU bootloader parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbDfuConfig {
    pub vendor_id: u16,
    pub product_ids: Vec<u16>,
    pub flash_address: u32,
    pub flash_size: usize,
    pub transfer_size: usize,
}

impl Default for UsbDfuConfig {
    fn default() -> Self {
        Self {
            vendor_id: LEGO_VENDOR_ID,
            product_ids: DFU_PIDS.to_vec(),
            flash_address: DFU_FIRMWARE_ADDRESS,
            flash_size: DFU_FIRMWARE_SIZE,
            transfer_size: DFU_TRANSFER_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hublink.toml");
        let config = HubConfig {
            max_chunk_retries: 5,
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        assert_eq!(HubConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: HubConfig = toml::from_str(
            r#"
            ack_timeout_ms = 250
            min_protocol = "1.1.0"

            [dfu]
            flash_size = 4096
            "#,
        )
        .unwrap();
        assert_eq!(config.ack_timeout(), Duration::from_millis(250));
        assert_eq!(config.min_protocol, semver::Version::new(1, 1, 0));
        assert_eq!(config.max_protocol, MAX_PROTOCOL_VERSION);
        assert_eq!(config.dfu.flash_size, 4096);
        assert_eq!(config.dfu.vendor_id, LEGO_VENDOR_ID);
    }
}
