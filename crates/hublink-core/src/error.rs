//! Top-level error taxonomy.
//!
//! Each layer has its own error enum; [`HubError`] is what connections and
//! sessions report, folding layer errors into the caller-facing categories.

use semver::Version;
use thiserror::Error;

use crate::firmware::FirmwareError;
use crate::flasher::FlashError;
use crate::protocol::CodecError;
use crate::transfer::TransferError;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("Could not connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("Incompatible protocol version {found} (supported: >= {min}, < {max})")]
    IncompatibleProtocol {
        found: Version,
        min: Version,
        max: Version,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transfer failed at offset {offset} after {attempts} attempts")]
    TransferFailed { offset: u32, attempts: u32 },

    #[error("Size mismatch: image is {image} bytes, flash region is {region} bytes")]
    SizeMismatch { image: usize, region: usize },

    #[error("Verification failed: {0}")]
    VerifyFailed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Hub {0} already has an active connection")]
    AlreadyConnected(String),

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("A transfer is already in progress")]
    TransferInProgress,

    #[error("No hub matching '{0}' found")]
    NotFound(String),

    #[error("Unsupported hub: {0}")]
    UnsupportedHub(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Firmware(#[from] FirmwareError),

    #[error("Flash error: {0}")]
    Flash(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HubError {
    /// Errors a caller may reasonably retry as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HubError::Connect { .. } | HubError::Timeout(_))
    }
}

impl From<CodecError> for HubError {
    fn from(e: CodecError) -> Self {
        HubError::Protocol(e.to_string())
    }
}

impl From<TransferError> for HubError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Failed { offset, attempts } => {
                HubError::TransferFailed { offset, attempts }
            }
            TransferError::Timeout { .. } => HubError::Timeout(e.to_string()),
            TransferError::Transport(t) => HubError::Transport(t),
            other => HubError::Protocol(other.to_string()),
        }
    }
}

impl From<FlashError> for HubError {
    fn from(e: FlashError) -> Self {
        match e {
            FlashError::SizeMismatch { image, region } => HubError::SizeMismatch { image, region },
            FlashError::VerifyFailed(msg) => HubError::VerifyFailed(msg),
            FlashError::Transfer(t) => t.into(),
            FlashError::Transport(t) => HubError::Transport(t),
            FlashError::Firmware(f) => HubError::Firmware(f),
            FlashError::Timeout(msg) => HubError::Timeout(msg),
            FlashError::Io(io) => HubError::Io(io),
            other => HubError::Flash(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_errors_map_to_taxonomy() {
        let err: HubError = TransferError::Failed {
            offset: 20,
            attempts: 3,
        }
        .into();
        assert!(matches!(
            err,
            HubError::TransferFailed {
                offset: 20,
                attempts: 3
            }
        ));

        let err: HubError = TransferError::WrongOffset {
            expected: 20,
            actual: 40,
        }
        .into();
        assert!(matches!(err, HubError::Protocol(_)));
    }

    #[test]
    fn test_flash_size_mismatch_kept_distinct() {
        let err: HubError = FlashError::SizeMismatch {
            image: 196_608,
            region: 180_224,
        }
        .into();
        assert!(matches!(err, HubError::SizeMismatch { .. }));
        let err: HubError = FlashError::VerifyFailed("checksum".into()).into();
        assert!(matches!(err, HubError::VerifyFailed(_)));
        assert!(!err.is_retryable());
    }
}
