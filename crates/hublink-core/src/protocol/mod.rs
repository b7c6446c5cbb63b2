//! Message codec: pure encode/decode of advertisements, application frames,
//! LWP3 hub messages and bootloader frames. Nothing in this module performs I/O.

pub mod advertisement;
pub mod bootloader;
pub mod checksum;
pub mod constants;
pub mod frame;
pub mod hub;
pub mod lines;
pub mod lwp3;
pub mod slip;

pub use advertisement::{Advertisement, AdvertisementKind, RawAdvertisement};
pub use frame::{Capabilities, Command, Event, FeatureFlags, PnpId, StatusFlags};
pub use hub::{HubKind, Lwp3Version};
pub use lines::LineBuffer;
pub use lwp3::{HubMessage, HubProperty};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Malformed advertisement: {0}")]
    MalformedAdvertisement(String),

    #[error("Unknown hub kind 0x{0:02X}")]
    UnknownHubKind(u8),

    #[error("Unknown frame tag 0x{0:02X}")]
    UnknownTag(u8),

    #[error("Frame length mismatch for tag 0x{tag:02X}: expected {expected}, got {actual}")]
    LengthMismatch {
        tag: u8,
        expected: usize,
        actual: usize,
    },

    #[error("Empty frame")]
    Empty,

    #[error("Frame ended early: {0}")]
    Truncated(String),

    #[error("Frame of {len} bytes exceeds max write size {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Invalid version string: {0}")]
    InvalidVersion(String),

    #[error("Bootloader reported error 0x{0:02X}")]
    BootloaderError(u8),

    #[error("Invalid SLIP escape byte 0x{0:02X}")]
    InvalidEscape(u8),

    #[error("Unexpected reply 0x{actual:02X} to command 0x{expected:02X}")]
    UnexpectedReply { expected: u8, actual: u8 },
}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::Truncated(e.to_string())
    }
}
