//! LWP3 hub messages, spoken by hubs running official LEGO firmware.
//!
//! Every message starts with a common header: length u8, hub id u8 (always
//! 0), message kind u8. Only what is needed to identify the firmware and
//! restart into the bootloader is covered here.

use super::CodecError;
use super::hub::Lwp3Version;

pub const HUB_PROPERTY: u8 = 0x01;
pub const FW_UPDATE: u8 = 0x10;

const HEADER_LEN: usize = 3;
const OP_REQUEST_UPDATE: u8 = 0x05;
const OP_UPDATE: u8 = 0x06;
/// Safety key the hub requires before rebooting into its bootloader.
const FW_UPDATE_KEY: &[u8; 9] = b"LPF2-Boot";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HubProperty {
    Name = 0x01,
    Button = 0x02,
    FwVersion = 0x03,
    HwVersion = 0x04,
    Rssi = 0x05,
    BatteryVoltage = 0x06,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubMessage {
    /// Ask the hub to report a property once.
    RequestProperty(HubProperty),
    /// Property value reported by the hub.
    PropertyUpdate { property: u8, value: Vec<u8> },
    /// Reboot into the LWP3 bootloader.
    FirmwareUpdate,
}

impl HubMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8, 0x00];
        match self {
            HubMessage::RequestProperty(property) => {
                buf.extend_from_slice(&[HUB_PROPERTY, *property as u8, OP_REQUEST_UPDATE]);
            }
            HubMessage::PropertyUpdate { property, value } => {
                buf.extend_from_slice(&[HUB_PROPERTY, *property, OP_UPDATE]);
                buf.extend_from_slice(value);
            }
            HubMessage::FirmwareUpdate => {
                buf.push(FW_UPDATE);
                buf.extend_from_slice(FW_UPDATE_KEY);
            }
        }
        buf[0] = buf.len() as u8;
        buf
    }

    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        if frame.len() < HEADER_LEN {
            return Err(CodecError::Truncated(format!(
                "LWP3 message of {} bytes",
                frame.len()
            )));
        }
        let kind = frame[2];
        if frame[0] as usize != frame.len() {
            return Err(CodecError::LengthMismatch {
                tag: kind,
                expected: frame[0] as usize,
                actual: frame.len(),
            });
        }
        let body = &frame[HEADER_LEN..];
        match kind {
            HUB_PROPERTY => match body {
                [property, OP_UPDATE, value @ ..] => Ok(HubMessage::PropertyUpdate {
                    property: *property,
                    value: value.to_vec(),
                }),
                [property, OP_REQUEST_UPDATE] => {
                    let property = HubProperty::try_from(*property)?;
                    Ok(HubMessage::RequestProperty(property))
                }
                _ => Err(CodecError::UnknownTag(kind)),
            },
            FW_UPDATE if body == FW_UPDATE_KEY => Ok(HubMessage::FirmwareUpdate),
            FW_UPDATE => Err(CodecError::LengthMismatch {
                tag: kind,
                expected: HEADER_LEN + FW_UPDATE_KEY.len(),
                actual: frame.len(),
            }),
            other => Err(CodecError::UnknownTag(other)),
        }
    }

    /// Firmware version carried by a FW_VERSION property update.
    pub fn firmware_version(&self) -> Option<Lwp3Version> {
        match self {
            HubMessage::PropertyUpdate { property, value }
                if *property == HubProperty::FwVersion as u8 && value.len() == 4 =>
            {
                Some(Lwp3Version(u32::from_le_bytes([
                    value[0], value[1], value[2], value[3],
                ])))
            }
            _ => None,
        }
    }
}

impl TryFrom<u8> for HubProperty {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => HubProperty::Name,
            0x02 => HubProperty::Button,
            0x03 => HubProperty::FwVersion,
            0x04 => HubProperty::HwVersion,
            0x05 => HubProperty::Rssi,
            0x06 => HubProperty::BatteryVoltage,
            other => return Err(CodecError::UnknownTag(other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firmware_update_message() {
        let bytes = HubMessage::FirmwareUpdate.encode();
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[..3], &[12, 0x00, 0x10]);
        assert_eq!(&bytes[3..], b"LPF2-Boot");
        assert_eq!(HubMessage::decode(&bytes).unwrap(), HubMessage::FirmwareUpdate);
    }

    #[test]
    fn test_request_firmware_version() {
        let bytes = HubMessage::RequestProperty(HubProperty::FwVersion).encode();
        assert_eq!(bytes, vec![5, 0x00, 0x01, 0x03, 0x05]);
    }

    #[test]
    fn test_firmware_version_update() {
        let frame = [9, 0x00, 0x01, 0x03, 0x06, 0x07, 0x01, 0x00, 0x10];
        let msg = HubMessage::decode(&frame).unwrap();
        let version = msg.firmware_version().unwrap();
        assert_eq!(version.to_string(), "1.0.00.0107");

        let battery = HubMessage::PropertyUpdate {
            property: HubProperty::BatteryVoltage as u8,
            value: vec![100],
        };
        assert_eq!(battery.firmware_version(), None);
    }

    #[test]
    fn test_malformed_messages() {
        assert!(matches!(
            HubMessage::decode(&[2, 0]),
            Err(CodecError::Truncated(_))
        ));
        assert!(matches!(
            HubMessage::decode(&[6, 0x00, 0x01, 0x03, 0x06]),
            Err(CodecError::LengthMismatch { .. })
        ));
        assert!(matches!(
            HubMessage::decode(&[4, 0x00, 0x45, 0x00]),
            Err(CodecError::UnknownTag(0x45))
        ));
    }
}
