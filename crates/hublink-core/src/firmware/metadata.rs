//! `firmware.metadata.json` descriptor.
//!
//! The schema is selected by the `metadata-version` field and nothing else:
//! 1.x images carry an embedded script area, 2.x images are used as-is with
//! an optional hub name patch.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::FirmwareError;
use crate::protocol::HubKind;

/// Whole-image checksum algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    /// 32-bit word sum complement
    Sum,
    /// STM32 hardware CRC32
    Crc32,
    None,
}

impl fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumKind::Sum => write!(f, "sum"),
            ChecksumKind::Crc32 => write!(f, "crc32"),
            ChecksumKind::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetadataV1 {
    pub firmware_version: String,
    pub device_id: u8,
    pub checksum_type: ChecksumKind,
    pub mpy_abi_version: u32,
    #[serde(default)]
    pub mpy_cross_options: Vec<String>,
    pub user_mpy_offset: usize,
    pub max_firmware_size: usize,
    /// Added in 1.1.0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub_name_offset: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_hub_name_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetadataV2 {
    pub firmware_version: String,
    pub device_id: u8,
    pub checksum_type: ChecksumKind,
    pub checksum_size: usize,
    pub hub_name_offset: usize,
    pub hub_name_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "metadata-version")]
pub enum FirmwareMetadata {
    #[serde(rename = "1.0.0")]
    V100(MetadataV1),
    #[serde(rename = "1.1.0")]
    V110(MetadataV1),
    #[serde(rename = "2.0.0")]
    V200(MetadataV2),
    #[serde(rename = "2.1.0")]
    V210(MetadataV2),
}

const SCHEMAS: &[&str] = &["1.0.0", "1.1.0", "2.0.0", "2.1.0"];

impl FirmwareMetadata {
    /// Parse and validate a metadata document.
    pub fn from_json(raw: &[u8]) -> Result<Self, FirmwareError> {
        let value: serde_json::Value = serde_json::from_slice(raw)?;
        let version = value
            .get("metadata-version")
            .and_then(|v| v.as_str())
            .ok_or_else(|| FirmwareError::InvalidMetadata("missing metadata-version".into()))?;
        if !SCHEMAS.contains(&version) {
            return Err(FirmwareError::UnsupportedMetadata(version.to_string()));
        }
        let metadata: FirmwareMetadata = serde_json::from_value(value)?;
        metadata.validate()?;
        Ok(metadata)
    }

    pub fn to_json(&self) -> Result<String, FirmwareError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn schema_version(&self) -> semver::Version {
        match self {
            FirmwareMetadata::V100(_) => semver::Version::new(1, 0, 0),
            FirmwareMetadata::V110(_) => semver::Version::new(1, 1, 0),
            FirmwareMetadata::V200(_) => semver::Version::new(2, 0, 0),
            FirmwareMetadata::V210(_) => semver::Version::new(2, 1, 0),
        }
    }

    pub fn firmware_version(&self) -> &str {
        match self {
            FirmwareMetadata::V100(m) | FirmwareMetadata::V110(m) => &m.firmware_version,
            FirmwareMetadata::V200(m) | FirmwareMetadata::V210(m) => &m.firmware_version,
        }
    }

    pub fn device_id(&self) -> u8 {
        match self {
            FirmwareMetadata::V100(m) | FirmwareMetadata::V110(m) => m.device_id,
            FirmwareMetadata::V200(m) | FirmwareMetadata::V210(m) => m.device_id,
        }
    }

    pub fn hub_kind(&self) -> Result<HubKind, FirmwareError> {
        HubKind::try_from(self.device_id()).map_err(|_| {
            FirmwareError::InvalidMetadata(format!("unknown device id 0x{:02X}", self.device_id()))
        })
    }

    pub fn checksum_type(&self) -> ChecksumKind {
        match self {
            FirmwareMetadata::V100(m) | FirmwareMetadata::V110(m) => m.checksum_type,
            FirmwareMetadata::V200(m) | FirmwareMetadata::V210(m) => m.checksum_type,
        }
    }

    /// Size the checksum covers, which is also the largest image accepted.
    pub fn checksum_size(&self) -> usize {
        match self {
            FirmwareMetadata::V100(m) | FirmwareMetadata::V110(m) => m.max_firmware_size,
            FirmwareMetadata::V200(m) | FirmwareMetadata::V210(m) => m.checksum_size,
        }
    }

    /// Where a hub name may be patched in, and how many bytes it may take.
    pub fn hub_name_slot(&self) -> Option<(usize, usize)> {
        match self {
            FirmwareMetadata::V100(_) => None,
            FirmwareMetadata::V110(m) => Some((m.hub_name_offset?, m.max_hub_name_size?)),
            FirmwareMetadata::V200(m) | FirmwareMetadata::V210(m) => {
                (m.hub_name_offset != 0).then_some((m.hub_name_offset, m.hub_name_size))
            }
        }
    }

    /// MicroPython bytecode ABI for the embedded script, 1.x only.
    pub fn mpy_abi_version(&self) -> Option<u32> {
        match self {
            FirmwareMetadata::V100(m) | FirmwareMetadata::V110(m) => Some(m.mpy_abi_version),
            _ => None,
        }
    }

    pub fn mpy_cross_options(&self) -> &[String] {
        match self {
            FirmwareMetadata::V100(m) | FirmwareMetadata::V110(m) => &m.mpy_cross_options,
            _ => &[],
        }
    }

    fn validate(&self) -> Result<(), FirmwareError> {
        let allowed: &[u8] = match self {
            FirmwareMetadata::V100(_) | FirmwareMetadata::V110(_) => &[0x40, 0x41, 0x80, 0x81],
            FirmwareMetadata::V200(_) => &[0x40, 0x41, 0x80, 0x81, 0x83],
            FirmwareMetadata::V210(_) => &[0x40, 0x41, 0x80, 0x81, 0x83, 0xE0, 0xE1, 0xE2],
        };
        if !allowed.contains(&self.device_id()) {
            return Err(FirmwareError::InvalidMetadata(format!(
                "device id 0x{:02X} not valid for metadata {}",
                self.device_id(),
                self.schema_version()
            )));
        }
        let kind = self.checksum_type();
        if kind == ChecksumKind::None && !matches!(self, FirmwareMetadata::V210(_)) {
            return Err(FirmwareError::UnsupportedChecksum {
                kind,
                schema: self.schema_version().to_string(),
            });
        }
        if let FirmwareMetadata::V100(m) | FirmwareMetadata::V110(m) = self
            && m.user_mpy_offset + 4 > m.max_firmware_size
        {
            return Err(FirmwareError::InvalidMetadata(
                "user-mpy-offset is past max-firmware-size".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const V110_JSON: &str = r#"{
        "metadata-version": "1.1.0",
        "firmware-version": "v3.0.0",
        "device-id": 65,
        "checksum-type": "sum",
        "mpy-abi-version": 5,
        "mpy-cross-options": ["-mno-unicode"],
        "user-mpy-offset": 64,
        "max-firmware-size": 256,
        "hub-name-offset": 16,
        "max-hub-name-size": 8
    }"#;

    pub(crate) const V210_JSON: &str = r#"{
        "metadata-version": "2.1.0",
        "firmware-version": "v3.3.0",
        "device-id": 129,
        "checksum-type": "crc32",
        "checksum-size": 256,
        "hub-name-offset": 8,
        "hub-name-size": 16
    }"#;

    #[test]
    fn test_v1_metadata() {
        let m = FirmwareMetadata::from_json(V110_JSON.as_bytes()).unwrap();
        assert!(matches!(m, FirmwareMetadata::V110(_)));
        assert_eq!(m.hub_kind().unwrap(), HubKind::City);
        assert_eq!(m.checksum_type(), ChecksumKind::Sum);
        assert_eq!(m.checksum_size(), 256);
        assert_eq!(m.hub_name_slot(), Some((16, 8)));
        assert_eq!(m.mpy_abi_version(), Some(5));
        assert_eq!(m.mpy_cross_options(), ["-mno-unicode".to_string()]);
    }

    #[test]
    fn test_v2_metadata() {
        let m = FirmwareMetadata::from_json(V210_JSON.as_bytes()).unwrap();
        assert_eq!(m.schema_version(), semver::Version::new(2, 1, 0));
        assert_eq!(m.hub_kind().unwrap(), HubKind::TechnicLarge);
        assert_eq!(m.mpy_abi_version(), None);
        let again = FirmwareMetadata::from_json(m.to_json().unwrap().as_bytes()).unwrap();
        assert_eq!(again, m);
    }

    #[test]
    fn test_unknown_schema_rejected() {
        let raw = V210_JSON.replace("2.1.0", "3.0.0");
        assert!(matches!(
            FirmwareMetadata::from_json(raw.as_bytes()),
            Err(FirmwareError::UnsupportedMetadata(v)) if v == "3.0.0"
        ));
    }

    #[test]
    fn test_none_checksum_needs_v21() {
        let raw = V210_JSON
            .replace("2.1.0", "2.0.0")
            .replace("\"crc32\"", "\"none\"");
        assert!(matches!(
            FirmwareMetadata::from_json(raw.as_bytes()),
            Err(FirmwareError::UnsupportedChecksum { .. })
        ));
    }

    #[test]
    fn test_device_id_checked_per_schema() {
        let raw = V110_JSON.replace("\"device-id\": 65", "\"device-id\": 131");
        assert!(matches!(
            FirmwareMetadata::from_json(raw.as_bytes()),
            Err(FirmwareError::InvalidMetadata(_))
        ));
    }
}
