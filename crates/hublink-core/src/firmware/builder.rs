//! Pure firmware image assembly.
//!
//! 1.x layout: base, zero pad to `user-mpy-offset`, script length u32 LE,
//! script, zero pad to a word boundary, checksum u32 LE.
//! 2.x layout: base, zero pad to a word boundary, checksum u32 LE (none for
//! checksum type `none`). The hub name, when given, is patched in before the
//! checksum is taken.

use byteorder::{LittleEndian, WriteBytesExt};

use super::metadata::{ChecksumKind, FirmwareMetadata};
use super::{FirmwareError, FirmwareImage, image_checksum};

pub struct FirmwareBuilder<'a> {
    base: &'a [u8],
    metadata: &'a FirmwareMetadata,
    script: Option<&'a [u8]>,
    hub_name: Option<&'a str>,
}

impl<'a> FirmwareBuilder<'a> {
    pub fn new(base: &'a [u8], metadata: &'a FirmwareMetadata) -> Self {
        Self {
            base,
            metadata,
            script: None,
            hub_name: None,
        }
    }

    /// Compiled bytecode to embed in the user program area.
    pub fn script(mut self, mpy: &'a [u8]) -> Self {
        self.script = Some(mpy);
        self
    }

    pub fn hub_name(mut self, name: &'a str) -> Self {
        self.hub_name = Some(name);
        self
    }

    pub fn build(self) -> Result<FirmwareImage, FirmwareError> {
        let mut body = match self.metadata {
            FirmwareMetadata::V100(m) | FirmwareMetadata::V110(m) => {
                if self.base.len() > m.user_mpy_offset {
                    return Err(FirmwareError::TooLarge {
                        size: self.base.len(),
                        max: m.user_mpy_offset,
                    });
                }
                let script = self.script.unwrap_or_default();
                let mut body = Vec::with_capacity(m.user_mpy_offset + 4 + script.len() + 3);
                body.extend_from_slice(self.base);
                body.resize(m.user_mpy_offset, 0);
                body.write_u32::<LittleEndian>(script.len() as u32)?;
                body.extend_from_slice(script);
                body
            }
            FirmwareMetadata::V200(_) | FirmwareMetadata::V210(_) => {
                if self.script.is_some() {
                    return Err(FirmwareError::ScriptNotSupported);
                }
                self.base.to_vec()
            }
        };
        body.resize(body.len().next_multiple_of(4), 0);

        if let Some(name) = self.hub_name {
            patch_hub_name(&mut body, self.metadata, name)?;
        }

        let kind = self.metadata.checksum_type();
        let max = self.metadata.checksum_size();
        if kind == ChecksumKind::None {
            if body.len() > max {
                return Err(FirmwareError::TooLarge {
                    size: body.len(),
                    max,
                });
            }
            return Ok(FirmwareImage::new(body, self.metadata.clone(), None));
        }

        let checksum = image_checksum(kind, &body, max)?;
        body.write_u32::<LittleEndian>(checksum)?;
        Ok(FirmwareImage::new(body, self.metadata.clone(), Some(checksum)))
    }
}

/// Write `name` NUL-terminated into the metadata's hub name slot.
fn patch_hub_name(
    body: &mut [u8],
    metadata: &FirmwareMetadata,
    name: &str,
) -> Result<(), FirmwareError> {
    let (offset, max) = metadata
        .hub_name_slot()
        .ok_or(FirmwareError::NameNotSupported)?;
    let mut encoded = name.as_bytes().to_vec();
    encoded.push(0);
    if encoded.len() > max {
        return Err(FirmwareError::NameTooLong {
            len: encoded.len(),
            max,
        });
    }
    let end = offset + encoded.len();
    if end > body.len() {
        return Err(FirmwareError::InvalidMetadata(format!(
            "hub name slot at {} is past the end of the image",
            offset
        )));
    }
    body[offset..end].copy_from_slice(&encoded);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::metadata::tests::{V110_JSON, V210_JSON};
    use crate::protocol::checksum::stm32_crc32;

    fn v1() -> FirmwareMetadata {
        FirmwareMetadata::from_json(V110_JSON.as_bytes()).unwrap()
    }

    fn v2() -> FirmwareMetadata {
        FirmwareMetadata::from_json(V210_JSON.as_bytes()).unwrap()
    }

    fn word_sum(data: &[u8]) -> u32 {
        data.chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .fold(0u32, |a, b| a.wrapping_add(b))
    }

    #[test]
    fn test_v1_layout_with_script() {
        let base: Vec<u8> = (1..=40u8).collect();
        let metadata = v1();
        let image = FirmwareBuilder::new(&base, &metadata)
            .script(b"mpy!x")
            .build()
            .unwrap();
        let data = image.as_bytes();

        assert_eq!(&data[..40], &base[..]);
        assert!(data[40..64].iter().all(|&b| b == 0));
        assert_eq!(&data[64..68], &5u32.to_le_bytes());
        assert_eq!(&data[68..73], b"mpy!x");
        // padded to 76, then the checksum
        assert_eq!(data.len(), 80);
        image.verify().unwrap();

        // body + 0xFFFFFFFF padding + correction sums to zero
        let body = &data[..76];
        let padding = ((256 - 76) / 4) as u32;
        let total = word_sum(body)
            .wrapping_add(padding.wrapping_mul(0xFFFF_FFFF))
            .wrapping_add(image.checksum().unwrap());
        assert_eq!(total, 0);
    }

    #[test]
    fn test_v2_crc32_checksum() {
        let base = [0xAAu8; 30];
        let metadata = v2();
        let image = FirmwareBuilder::new(&base, &metadata).build().unwrap();
        assert_eq!(image.len(), 36);
        assert_eq!(image.checksum(), stm32_crc32(&image.as_bytes()[..28]));
        image.verify().unwrap();
    }

    #[test]
    fn test_crc32_skips_checksum_placeholder_in_base() {
        let mut base: Vec<u8> = (1..=28u8).collect();
        base.extend_from_slice(&[0u8; 4]);
        let metadata = v2();
        let image = FirmwareBuilder::new(&base, &metadata).build().unwrap();

        assert_eq!(image.len(), 36);
        assert_eq!(&image.as_bytes()[..32], &base[..]);
        let expected = stm32_crc32(&base[..28]).unwrap();
        assert_eq!(image.checksum(), Some(expected));
        assert_eq!(&image.as_bytes()[32..], &expected.to_le_bytes());
        image.verify().unwrap();

        // the placeholder word does not feed the checksum
        let mut other = base.clone();
        other[28..].copy_from_slice(&[0xAB; 4]);
        let rebuilt = FirmwareBuilder::new(&other, &metadata).build().unwrap();
        assert_eq!(rebuilt.checksum(), Some(expected));
    }

    #[test]
    fn test_tampering_invalidates_checksum() {
        let base: Vec<u8> = (0..48u8).collect();
        for metadata in [v1(), v2()] {
            let image = FirmwareBuilder::new(&base, &metadata).build().unwrap();
            for index in [0, 5, image.len() - 9] {
                let mut data = image.clone().into_bytes();
                data[index] ^= 0x01;
                let tampered = FirmwareImage::new(data, metadata.clone(), image.checksum());
                assert!(matches!(
                    tampered.verify(),
                    Err(FirmwareError::ChecksumMismatch { .. })
                ));
            }
        }
    }

    #[test]
    fn test_hub_name_patched() {
        let base = [0u8; 32];
        let metadata = v2();
        let image = FirmwareBuilder::new(&base, &metadata)
            .hub_name("robot")
            .build()
            .unwrap();
        assert_eq!(&image.as_bytes()[8..14], b"robot\0");
        image.verify().unwrap();

        let err = FirmwareBuilder::new(&base, &metadata)
            .hub_name("a name that is too long")
            .build()
            .unwrap_err();
        assert!(matches!(err, FirmwareError::NameTooLong { len: 24, max: 16 }));
    }

    #[test]
    fn test_hub_name_unsupported_on_v100() {
        let raw = V110_JSON.replace("1.1.0", "1.0.0");
        let metadata = FirmwareMetadata::from_json(raw.as_bytes()).unwrap();
        let err = FirmwareBuilder::new(&[0u8; 8], &metadata)
            .hub_name("x")
            .build()
            .unwrap_err();
        assert!(matches!(err, FirmwareError::NameNotSupported));
    }

    #[test]
    fn test_size_limits() {
        let metadata = v1();
        assert!(matches!(
            FirmwareBuilder::new(&[0u8; 65], &metadata).build(),
            Err(FirmwareError::TooLarge { size: 65, max: 64 })
        ));
        assert!(matches!(
            FirmwareBuilder::new(&[0u8; 8], &metadata).script(&[1u8; 200]).build(),
            Err(FirmwareError::TooLarge { .. })
        ));

        let metadata = v2();
        assert!(matches!(
            FirmwareBuilder::new(&[0u8; 260], &metadata).build(),
            Err(FirmwareError::TooLarge { .. })
        ));
        assert!(matches!(
            FirmwareBuilder::new(&[0u8; 8], &metadata).script(b"x").build(),
            Err(FirmwareError::ScriptNotSupported)
        ));
    }

    #[test]
    fn test_none_checksum_has_no_trailer() {
        let raw = V210_JSON.replace("\"crc32\"", "\"none\"");
        let metadata = FirmwareMetadata::from_json(raw.as_bytes()).unwrap();
        let image = FirmwareBuilder::new(&[7u8; 10], &metadata).build().unwrap();
        assert_eq!(image.len(), 12);
        assert_eq!(image.checksum(), None);
        image.verify().unwrap();
    }
}
