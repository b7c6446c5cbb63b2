//! BLE advertisement decoding.
//!
//! Three layouts are recognised:
//! - LWP3 bootloader: 6 bytes of LEGO manufacturer data under the bootloader service
//! - LWP3 hub (official firmware): 6+ bytes of LEGO manufacturer data under the hub service
//! - Pybricks: PnP ID service data plus the Pybricks service UUID

use std::collections::HashMap;

use uuid::Uuid;

use super::CodecError;
use super::constants::{
    LEGO_CID, LWP3_BOOTLOADER_SERVICE_UUID, LWP3_HUB_SERVICE_UUID, PNP_ID_UUID,
    PYBRICKS_SERVICE_UUID,
};
use super::frame::PnpId;
use super::hub::{HubKind, Lwp3Version};

/// Advertising fields as reported by the BLE stack, before interpretation.
#[derive(Debug, Clone, Default)]
pub struct RawAdvertisement {
    pub services: Vec<Uuid>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
}

/// Which firmware produced the advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvertisementKind {
    Bootloader {
        version: Lwp3Version,
        capabilities: u8,
    },
    Lwp3Hub {
        button: bool,
        capabilities: u8,
        last_network: u8,
        status: u8,
        option: u8,
    },
    Pybricks {
        pnp: PnpId,
    },
}

/// A decoded advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub hub_kind: HubKind,
    pub kind: AdvertisementKind,
}

impl Advertisement {
    const BOOTLOADER_LEN: usize = 6;
    const LWP3_HUB_MIN_LEN: usize = 6;

    pub fn decode(raw: &RawAdvertisement) -> Result<Self, CodecError> {
        if let Some(data) = raw.manufacturer_data.get(&LEGO_CID) {
            if raw.services.contains(&LWP3_BOOTLOADER_SERVICE_UUID) {
                return Self::decode_bootloader(data);
            }
            if raw.services.contains(&LWP3_HUB_SERVICE_UUID) {
                return Self::decode_lwp3_hub(data);
            }
        }

        if raw.services.contains(&PYBRICKS_SERVICE_UUID) {
            let data = raw.service_data.get(&PNP_ID_UUID).ok_or_else(|| {
                CodecError::MalformedAdvertisement("Pybricks service without PnP ID".into())
            })?;
            let pnp = PnpId::decode(data).map_err(malformed)?;
            return Ok(Self {
                hub_kind: pnp.hub_kind,
                kind: AdvertisementKind::Pybricks { pnp },
            });
        }

        Err(CodecError::MalformedAdvertisement(
            "no recognised service".into(),
        ))
    }

    /// Decode the 6-byte bootloader manufacturer data.
    pub fn decode_bootloader(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() != Self::BOOTLOADER_LEN {
            return Err(CodecError::MalformedAdvertisement(format!(
                "bootloader data must be {} bytes, got {}",
                Self::BOOTLOADER_LEN,
                data.len()
            )));
        }
        let version = Lwp3Version(u32::from_le_bytes([data[0], data[1], data[2], data[3]]));
        let hub_kind = HubKind::try_from(data[4]).map_err(malformed)?;
        Ok(Self {
            hub_kind,
            kind: AdvertisementKind::Bootloader {
                version,
                capabilities: data[5],
            },
        })
    }

    pub fn decode_lwp3_hub(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < Self::LWP3_HUB_MIN_LEN {
            return Err(CodecError::MalformedAdvertisement(format!(
                "hub data too short: {} bytes",
                data.len()
            )));
        }
        let hub_kind = HubKind::try_from(data[1]).map_err(malformed)?;
        Ok(Self {
            hub_kind,
            kind: AdvertisementKind::Lwp3Hub {
                button: data[0] != 0,
                capabilities: data[2],
                last_network: data[3],
                status: data[4],
                option: data[5],
            },
        })
    }

    pub fn is_bootloader(&self) -> bool {
        matches!(self.kind, AdvertisementKind::Bootloader { .. })
    }

    /// Advertised by a hub running official LEGO firmware.
    pub fn is_lwp3_hub(&self) -> bool {
        matches!(self.kind, AdvertisementKind::Lwp3Hub { .. })
    }

    pub fn is_pybricks(&self) -> bool {
        matches!(self.kind, AdvertisementKind::Pybricks { .. })
    }

    /// Protocol version carried in the advertisement, if any.
    pub fn protocol_version(&self) -> Option<semver::Version> {
        match &self.kind {
            AdvertisementKind::Bootloader { version, .. } => Some(version.to_semver()),
            _ => None,
        }
    }

    /// Hub revision from the PnP ID, when advertised.
    pub fn hub_revision(&self) -> Option<u16> {
        match &self.kind {
            AdvertisementKind::Pybricks { pnp } => Some(pnp.revision),
            _ => None,
        }
    }
}

fn malformed(err: CodecError) -> CodecError {
    CodecError::MalformedAdvertisement(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lego(services: Vec<Uuid>, data: &[u8]) -> RawAdvertisement {
        let mut raw = RawAdvertisement {
            services,
            ..Default::default()
        };
        raw.manufacturer_data.insert(LEGO_CID, data.to_vec());
        raw
    }

    #[test]
    fn test_bootloader_advertisement() {
        let raw = lego(
            vec![LWP3_BOOTLOADER_SERVICE_UUID],
            &[0x07, 0x01, 0x00, 0x10, 0x41, 0x00],
        );
        let adv = Advertisement::decode(&raw).unwrap();
        assert_eq!(adv.hub_kind, HubKind::City);
        assert!(adv.is_bootloader());
        assert_eq!(adv.protocol_version(), Some(semver::Version::new(1, 0, 0)));
    }

    #[test]
    fn test_bootloader_wrong_length() {
        let raw = lego(vec![LWP3_BOOTLOADER_SERVICE_UUID], &[0x07, 0x01, 0x00]);
        assert!(matches!(
            Advertisement::decode(&raw),
            Err(CodecError::MalformedAdvertisement(_))
        ));
    }

    #[test]
    fn test_lwp3_hub_advertisement() {
        let raw = lego(
            vec![LWP3_HUB_SERVICE_UUID],
            &[0x00, 0x80, 0x02, 0x00, 0x00, 0x00],
        );
        let adv = Advertisement::decode(&raw).unwrap();
        assert_eq!(adv.hub_kind, HubKind::Technic);
        assert!(!adv.is_bootloader());
        assert!(adv.is_lwp3_hub());
        assert_eq!(adv.protocol_version(), None);
    }

    #[test]
    fn test_unknown_hub_kind_is_malformed() {
        let raw = lego(
            vec![LWP3_HUB_SERVICE_UUID],
            &[0x00, 0x99, 0x02, 0x00, 0x00, 0x00],
        );
        assert!(matches!(
            Advertisement::decode(&raw),
            Err(CodecError::MalformedAdvertisement(_))
        ));
    }

    #[test]
    fn test_pybricks_advertisement() {
        let pnp = PnpId {
            bluetooth_vendor: true,
            vendor_id: LEGO_CID,
            hub_kind: HubKind::TechnicLarge,
            revision: 1,
        };
        let mut raw = RawAdvertisement {
            services: vec![PYBRICKS_SERVICE_UUID],
            ..Default::default()
        };
        raw.service_data.insert(PNP_ID_UUID, pnp.encode());
        let adv = Advertisement::decode(&raw).unwrap();
        assert_eq!(adv.hub_kind, HubKind::TechnicLarge);
        assert!(adv.is_pybricks());
        assert_eq!(adv.hub_revision(), Some(1));
    }

    #[test]
    fn test_unrelated_device() {
        assert!(Advertisement::decode(&RawAdvertisement::default()).is_err());
    }
}
