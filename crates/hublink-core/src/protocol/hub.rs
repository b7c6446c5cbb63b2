//! Hub identification types shared by advertisements, negotiation and firmware metadata.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::CodecError;

/// Kind of hub, as used in advertising data, PnP IDs and firmware metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum HubKind {
    WeDo2 = 0x00,
    DuploTrain = 0x20,
    /// BOOST Move hub
    Boost = 0x40,
    /// 2-port City hub
    City = 0x41,
    Handset = 0x42,
    Mario = 0x43,
    /// 4-port Technic hub
    Technic = 0x80,
    /// SPIKE Prime / MINDSTORMS Robot Inventor hub
    TechnicLarge = 0x81,
    /// SPIKE Essential hub
    TechnicSmall = 0x83,
    Ev3 = 0xE0,
    Nxt = 0xE1,
    Virtual = 0xE2,
}

impl TryFrom<u8> for HubKind {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => HubKind::WeDo2,
            0x20 => HubKind::DuploTrain,
            0x40 => HubKind::Boost,
            0x41 => HubKind::City,
            0x42 => HubKind::Handset,
            0x43 => HubKind::Mario,
            0x80 => HubKind::Technic,
            0x81 => HubKind::TechnicLarge,
            0x83 => HubKind::TechnicSmall,
            0xE0 => HubKind::Ev3,
            0xE1 => HubKind::Nxt,
            0xE2 => HubKind::Virtual,
            other => return Err(CodecError::UnknownHubKind(other)),
        })
    }
}

impl From<HubKind> for u8 {
    fn from(kind: HubKind) -> Self {
        kind as u8
    }
}

impl HubKind {
    /// Largest payload accepted by the LWP3 bootloader ProgramFlash command.
    pub fn bootloader_payload_size(&self) -> Option<usize> {
        match self {
            HubKind::Boost => Some(14),
            HubKind::City | HubKind::Technic => Some(32),
            _ => None,
        }
    }

    /// Hubs flashed through the USB DFU bootloader instead of BLE.
    pub fn uses_usb_dfu(&self) -> bool {
        matches!(self, HubKind::TechnicLarge)
    }
}

impl fmt::Display for HubKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubKind::WeDo2 => write!(f, "WeDo 2.0 Hub"),
            HubKind::DuploTrain => write!(f, "Duplo Train"),
            HubKind::Boost => write!(f, "Move Hub"),
            HubKind::City => write!(f, "City Hub"),
            HubKind::Handset => write!(f, "Handset"),
            HubKind::Mario => write!(f, "Mario Hub"),
            HubKind::Technic => write!(f, "Technic Hub"),
            HubKind::TechnicLarge => write!(f, "SPIKE Prime Hub"),
            HubKind::TechnicSmall => write!(f, "SPIKE Essential Hub"),
            HubKind::Ev3 => write!(f, "EV3 Brick"),
            HubKind::Nxt => write!(f, "NXT Brick"),
            HubKind::Virtual => write!(f, "Virtual Hub"),
        }
    }
}

/// LWP3 packed version number (`major<<28 | minor<<24 | bcd(bug)<<16 | bcd(build)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lwp3Version(pub u32);

impl Lwp3Version {
    pub fn major(&self) -> u64 {
        ((self.0 >> 28) & 0xF) as u64
    }

    pub fn minor(&self) -> u64 {
        ((self.0 >> 24) & 0xF) as u64
    }

    pub fn bug(&self) -> u64 {
        from_bcd((self.0 >> 16) & 0xFF)
    }

    pub fn build(&self) -> u64 {
        from_bcd(self.0 & 0xFFFF)
    }

    /// Major/minor/bug mapped onto a semantic version.
    pub fn to_semver(&self) -> semver::Version {
        semver::Version::new(self.major(), self.minor(), self.bug())
    }
}

fn from_bcd(mut value: u32) -> u64 {
    let mut out = 0u64;
    let mut scale = 1u64;
    while value > 0 {
        out += (value & 0xF) as u64 * scale;
        scale *= 10;
        value >>= 4;
    }
    out
}

impl fmt::Display for Lwp3Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{:02}.{:04}",
            self.major(),
            self.minor(),
            self.bug(),
            self.build()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_kind_roundtrip_and_unknown() {
        assert_eq!(HubKind::try_from(0x41).unwrap(), HubKind::City);
        assert_eq!(u8::from(HubKind::TechnicLarge), 0x81);
        assert!(matches!(
            HubKind::try_from(0x99),
            Err(CodecError::UnknownHubKind(0x99))
        ));
    }

    #[test]
    fn test_lwp3_version() {
        let v = Lwp3Version(0x1000_0107);
        assert_eq!(v.major(), 1);
        assert_eq!(v.minor(), 0);
        assert_eq!(v.bug(), 0);
        assert_eq!(v.build(), 107);
        assert_eq!(v.to_string(), "1.0.00.0107");
        assert_eq!(v.to_semver(), semver::Version::new(1, 0, 0));
    }

    #[test]
    fn test_metadata_device_id_deserializes() {
        let kind: HubKind = serde_json::from_str("65").unwrap();
        assert_eq!(kind, HubKind::City);
        assert!(serde_json::from_str::<HubKind>("7").is_err());
    }
}
