//! Firmware images.
//!
//! - `metadata`: the schema-versioned `firmware.metadata.json` descriptor
//! - `builder`: pure assembly of a flashable image
//! - `archive`: reading `firmware.zip` bundles
//! - `compile`: script-to-bytecode collaborators for embedded `main.py`

pub mod archive;
pub mod builder;
pub mod compile;
pub mod metadata;

pub use archive::FirmwareArchive;
pub use builder::FirmwareBuilder;
pub use compile::{MpyCross, Precompiled, ScriptCompiler};
pub use metadata::{ChecksumKind, FirmwareMetadata, MetadataV1, MetadataV2};

use thiserror::Error;

use crate::protocol::HubKind;
use crate::protocol::checksum::{stm32_crc32, sum_complement};

#[derive(Error, Debug)]
pub enum FirmwareError {
    #[error("Archive is missing {0}")]
    MissingEntry(String),

    #[error("Unsupported metadata version: {0}")]
    UnsupportedMetadata(String),

    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("Unsupported checksum type {kind} for metadata {schema}")]
    UnsupportedChecksum { kind: ChecksumKind, schema: String },

    #[error("Image of {size} bytes exceeds the {max} bytes available")]
    TooLarge { size: usize, max: usize },

    #[error("This firmware does not support setting the hub name")]
    NameNotSupported,

    #[error("Hub name needs {len} bytes, at most {max} allowed")]
    NameTooLong { len: usize, max: usize },

    #[error("This firmware cannot embed a script")]
    ScriptNotSupported,

    #[error("Checksum mismatch: expected 0x{expected:08X}, got 0x{actual:08X}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Compile failed: {0}")]
    Compile(String),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A built firmware image: body followed by its trailing checksum word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
    metadata: FirmwareMetadata,
    checksum: Option<u32>,
}

impl FirmwareImage {
    pub(crate) fn new(data: Vec<u8>, metadata: FirmwareMetadata, checksum: Option<u32>) -> Self {
        Self {
            data,
            metadata,
            checksum,
        }
    }

    /// Bytes to write to flash.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn metadata(&self) -> &FirmwareMetadata {
        &self.metadata
    }

    /// Appended checksum, `None` for images built without one.
    pub fn checksum(&self) -> Option<u32> {
        self.checksum
    }

    pub fn hub_kind(&self) -> Result<HubKind, FirmwareError> {
        self.metadata.hub_kind()
    }

    /// Recompute the checksum of everything before the trailing word, with the
    /// same coverage the builder used, and compare it with the stored one.
    pub fn verify(&self) -> Result<(), FirmwareError> {
        let kind = self.metadata.checksum_type();
        if kind == ChecksumKind::None {
            return Ok(());
        }
        let Some(split) = self.data.len().checked_sub(4) else {
            return Err(FirmwareError::TooLarge {
                size: self.data.len(),
                max: 0,
            });
        };
        let (body, trailer) = self.data.split_at(split);
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let actual = image_checksum(kind, body, self.metadata.checksum_size())?;
        if actual != stored {
            return Err(FirmwareError::ChecksumMismatch {
                expected: stored,
                actual,
            });
        }
        Ok(())
    }
}

/// Whole-image checksum of `body` for firmware at most `max_size` bytes long.
///
/// For `crc32` the last word of `body` is the placeholder the base binary
/// reserves for the checksum and is left out.
pub fn image_checksum(
    kind: ChecksumKind,
    body: &[u8],
    max_size: usize,
) -> Result<u32, FirmwareError> {
    match kind {
        ChecksumKind::Sum => sum_complement(body, max_size).ok_or(FirmwareError::TooLarge {
            size: body.len(),
            max: max_size,
        }),
        ChecksumKind::Crc32 => {
            let covered = &body[..body.len().saturating_sub(4)];
            if covered.len() + 4 > max_size {
                return Err(FirmwareError::TooLarge {
                    size: covered.len() + 4,
                    max: max_size,
                });
            }
            stm32_crc32(covered).ok_or_else(|| {
                FirmwareError::InvalidMetadata("image body is not word aligned".into())
            })
        }
        ChecksumKind::None => Err(FirmwareError::InvalidMetadata(
            "no checksum for this image".into(),
        )),
    }
}
