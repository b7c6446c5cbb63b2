//! Firmware flasher.
//!
//! [`Flasher`] drives one [`Bootloader`] through erase, program and verify,
//! plus the backup/restore pair used to preserve the hub's original firmware.
//! Every precondition is checked before the first erase.

pub mod backup;
pub mod dfuse;
pub mod lwp3;
pub mod mock;
pub mod traits;

pub use backup::FirmwareBackup;
pub use dfuse::{DfuSe, FlashLayout};
pub use lwp3::Lwp3Bootloader;
pub use mock::MockBootloader;
pub use traits::{Bootloader, DeviceChecksum, TargetInfo};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::events::{LinkEvent, LinkObserver, LinkPhase, NullObserver};
use crate::firmware::{ChecksumKind, FirmwareError, FirmwareImage};
use crate::protocol::checksum::xor_bytes;
use crate::protocol::{CodecError, HubKind};
use crate::transfer::{ChunkAck, ChunkSink, TransferConfig, TransferError, TransferSession};
use crate::transport::TransportError;

const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum FlashError {
    #[error("Image is {image} bytes but the flash region is {region} bytes")]
    SizeMismatch { image: usize, region: usize },

    #[error("Firmware is for {image:?} but the bootloader reports {device:?}")]
    WrongHub { image: HubKind, device: HubKind },

    #[error("Firmware uses {image} checksums but this hub expects {device}")]
    ChecksumIncompatible {
        image: ChecksumKind,
        device: ChecksumKind,
    },

    #[error("Verification failed: {0}")]
    VerifyFailed(String),

    #[error("Bootloader rejected the request: {0}")]
    Bootloader(String),

    #[error("Operation not supported by this bootloader: {0}")]
    Unsupported(&'static str),

    #[error("Cannot {operation} while {phase}")]
    InvalidPhase {
        operation: &'static str,
        phase: BootloaderPhase,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("USB error: {0}")]
    Usb(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Firmware(#[from] FirmwareError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootloaderPhase {
    #[default]
    Idle,
    Erasing,
    Programming,
    Verifying,
    Done,
    BackingUp,
    Restoring,
    Failed,
}

impl fmt::Display for BootloaderPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootloaderPhase::Idle => write!(f, "Idle"),
            BootloaderPhase::Erasing => write!(f, "Erasing"),
            BootloaderPhase::Programming => write!(f, "Programming"),
            BootloaderPhase::Verifying => write!(f, "Verifying"),
            BootloaderPhase::Done => write!(f, "Done"),
            BootloaderPhase::BackingUp => write!(f, "Backing Up"),
            BootloaderPhase::Restoring => write!(f, "Restoring"),
            BootloaderPhase::Failed => write!(f, "Failed"),
        }
    }
}

impl BootloaderPhase {
    fn link_phase(self) -> LinkPhase {
        match self {
            BootloaderPhase::Erasing => LinkPhase::Erasing,
            BootloaderPhase::Programming => LinkPhase::Programming,
            BootloaderPhase::Verifying => LinkPhase::Verifying,
            BootloaderPhase::BackingUp => LinkPhase::BackingUp,
            BootloaderPhase::Restoring => LinkPhase::Restoring,
            BootloaderPhase::Done => LinkPhase::Complete,
            BootloaderPhase::Failed => LinkPhase::Error,
            BootloaderPhase::Idle => LinkPhase::Connecting,
        }
    }
}

/// Cursor state of one flasher run.
#[derive(Debug, Clone, Default)]
pub struct BootloaderSession {
    pub phase: BootloaderPhase,
    /// Bytes acknowledged by the bootloader so far.
    pub programmed: usize,
    /// Bytes confirmed by read-back or device checksum.
    pub verified: usize,
    /// Bytes covered by the last erase.
    pub erased: usize,
    pub backup: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashReport {
    pub bytes: usize,
    pub blocks: u32,
    pub verified: bool,
}

/// Adapts a bootloader to the chunked transfer engine.
///
/// Bootloaders acknowledge by accepting the write, so acks carry no checksum.
struct BlockSink<'a, B> {
    bootloader: &'a mut B,
}

impl<B: Bootloader> ChunkSink for BlockSink<'_, B> {
    async fn send_chunk(
        &mut self,
        offset: u32,
        chunk: &[u8],
        last: bool,
    ) -> Result<ChunkAck, TransferError> {
        self.bootloader
            .program(offset, chunk, last)
            .await
            .map_err(|e| match e {
                FlashError::Transport(t) => TransferError::Transport(t),
                FlashError::Transfer(t) => t,
                other => TransferError::Rejected(other.to_string()),
            })?;
        Ok(ChunkAck {
            offset,
            checksum: None,
        })
    }
}

pub struct Flasher<B: Bootloader> {
    bootloader: B,
    observer: Arc<dyn LinkObserver>,
    session: BootloaderSession,
    block_timeout: Duration,
}

impl<B: Bootloader> Flasher<B> {
    pub fn new(bootloader: B) -> Self {
        Self {
            bootloader,
            observer: Arc::new(NullObserver),
            session: BootloaderSession::default(),
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn LinkObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Upper bound on a single block write.
    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    pub fn session(&self) -> &BootloaderSession {
        &self.session
    }

    pub fn bootloader(&self) -> &B {
        &self.bootloader
    }

    pub fn into_inner(self) -> B {
        self.bootloader
    }

    /// Write `image` and verify it.
    #[instrument(skip_all, fields(len = image.len()))]
    pub async fn flash(&mut self, image: &FirmwareImage) -> Result<FlashReport, FlashError> {
        self.require_idle("flash")?;
        let target = self.bootloader.info().await?;
        info!(
            hub = ?target.hub_kind,
            base = %format!("0x{:08X}", target.flash_base),
            size = target.flash_size,
            "Bootloader ready"
        );

        let kind = image.hub_kind()?;
        if let Some(device) = target.hub_kind
            && device != kind
        {
            return Err(FlashError::WrongHub {
                image: kind,
                device,
            });
        }
        let checksum = image.metadata().checksum_type();
        if let Some(device) = target.checksum
            && checksum != ChecksumKind::None
            && checksum != device
        {
            return Err(FlashError::ChecksumIncompatible {
                image: checksum,
                device,
            });
        }
        image.verify()?;

        let result = self
            .write_region(&target, image.as_bytes(), BootloaderPhase::Programming)
            .await;
        self.settle(result)
    }

    /// Read the whole firmware region. Nothing is written to the hub.
    #[instrument(skip_all)]
    pub async fn backup(&mut self) -> Result<FirmwareBackup, FlashError> {
        self.require_idle("back up")?;
        if !self.bootloader.supports_read() {
            return Err(FlashError::Unsupported("firmware backup"));
        }
        let target = self.bootloader.info().await?;
        self.transition(BootloaderPhase::BackingUp);

        match self.read_region(&target, target.flash_size, LinkPhase::BackingUp).await {
            Ok(data) => {
                self.session.backup = Some(data.clone());
                self.transition(BootloaderPhase::Done);
                info!(bytes = data.len(), "Backup complete");
                Ok(FirmwareBackup::new(data))
            }
            Err(e) => {
                self.transition(BootloaderPhase::Failed);
                Err(e)
            }
        }
    }

    /// Write a previously captured backup back to the hub.
    ///
    /// The backup must cover the flash region exactly.
    #[instrument(skip_all, fields(len = backup.len()))]
    pub async fn restore(&mut self, backup: &FirmwareBackup) -> Result<FlashReport, FlashError> {
        self.require_idle("restore")?;
        let target = self.bootloader.info().await?;
        if backup.len() != target.flash_size {
            return Err(FlashError::SizeMismatch {
                image: backup.len(),
                region: target.flash_size,
            });
        }
        self.session.backup = Some(backup.as_bytes().to_vec());
        let result = self
            .write_region(&target, backup.as_bytes(), BootloaderPhase::Restoring)
            .await;
        self.settle(result)
    }

    async fn write_region(
        &mut self,
        target: &TargetInfo,
        data: &[u8],
        phase: BootloaderPhase,
    ) -> Result<FlashReport, FlashError> {
        if data.len() > target.flash_size {
            return Err(FlashError::SizeMismatch {
                image: data.len(),
                region: target.flash_size,
            });
        }
        if data.is_empty() {
            return Err(FlashError::SizeMismatch {
                image: 0,
                region: target.flash_size,
            });
        }

        self.transition(BootloaderPhase::Erasing);
        self.bootloader.erase(data.len()).await?;
        self.session.erased = data.len();

        self.bootloader.begin(data.len()).await?;
        self.transition(phase);
        let mut transfer = TransferSession::new(
            data.len(),
            TransferConfig {
                chunk_size: target.block_size,
                max_retries: 0,
                ack_timeout: self.block_timeout,
                min_write_interval: None,
            },
        )?;
        let observer = self.observer.clone();
        let mut sink = BlockSink {
            bootloader: &mut self.bootloader,
        };
        let outcome = transfer
            .run(data, &mut sink, observer.as_ref(), phase.link_phase())
            .await;
        self.session.programmed = transfer.offset();
        let report = outcome?;

        self.transition(BootloaderPhase::Verifying);
        let verified = self.verify(target, data).await?;

        self.bootloader.finish().await?;
        self.transition(BootloaderPhase::Done);
        info!(bytes = report.bytes, verified, "Flash complete");
        Ok(FlashReport {
            bytes: report.bytes,
            blocks: report.chunks_sent,
            verified,
        })
    }

    /// Read back when the bootloader can, else compare the device summary.
    async fn verify(&mut self, target: &TargetInfo, data: &[u8]) -> Result<bool, FlashError> {
        if self.bootloader.supports_read() {
            let readback = self
                .read_region(target, data.len(), LinkPhase::Verifying)
                .await?;
            if let Some(at) = data.iter().zip(&readback).position(|(a, b)| a != b) {
                return Err(FlashError::VerifyFailed(format!(
                    "byte mismatch at offset 0x{:X}",
                    at
                )));
            }
            if readback.len() != data.len() {
                return Err(FlashError::VerifyFailed(format!(
                    "read back {} of {} bytes",
                    readback.len(),
                    data.len()
                )));
            }
            self.session.verified = readback.len();
            return Ok(true);
        }

        match self.bootloader.checksum().await? {
            Some(summary) => {
                let expected = xor_bytes(data, 0xFF);
                debug!(
                    bytes = summary.bytes,
                    xor = %format!("0x{:02X}", summary.xor),
                    expected = %format!("0x{:02X}", expected),
                    "Device checksum"
                );
                if summary.bytes != data.len() {
                    return Err(FlashError::VerifyFailed(format!(
                        "device counted {} of {} bytes",
                        summary.bytes,
                        data.len()
                    )));
                }
                if summary.xor != expected {
                    return Err(FlashError::VerifyFailed(format!(
                        "device checksum 0x{:02X}, expected 0x{:02X}",
                        summary.xor, expected
                    )));
                }
                self.session.verified = summary.bytes;
                Ok(true)
            }
            None => {
                warn!("Bootloader offers no way to verify the written image");
                Ok(false)
            }
        }
    }

    async fn read_region(
        &mut self,
        target: &TargetInfo,
        len: usize,
        phase: LinkPhase,
    ) -> Result<Vec<u8>, FlashError> {
        let block = target.block_size.max(1);
        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            let want = block.min(len - data.len());
            let part = self.bootloader.read(data.len() as u32, want).await?;
            if part.is_empty() {
                break;
            }
            data.extend_from_slice(&part);
            self.observer.on_event(&LinkEvent::Progress {
                phase,
                current: data.len() as u64,
                total: len as u64,
            });
        }
        data.truncate(len);
        Ok(data)
    }

    fn settle(
        &mut self,
        result: Result<FlashReport, FlashError>,
    ) -> Result<FlashReport, FlashError> {
        if let Err(e) = &result {
            if self.session.erased > 0 {
                warn!(
                    programmed = self.session.programmed,
                    erased = self.session.erased,
                    "Flash left partially written"
                );
            }
            self.observer.on_event(&LinkEvent::Error {
                message: e.to_string(),
            });
            self.transition(BootloaderPhase::Failed);
        }
        result
    }

    fn require_idle(&self, operation: &'static str) -> Result<(), FlashError> {
        match self.session.phase {
            BootloaderPhase::Idle | BootloaderPhase::Done => Ok(()),
            phase => Err(FlashError::InvalidPhase { operation, phase }),
        }
    }

    fn transition(&mut self, next: BootloaderPhase) {
        let from = self.session.phase;
        if from == next {
            return;
        }
        info!(from = %from, to = %next, "Bootloader phase");
        self.session.phase = next;
        self.observer.on_event(&LinkEvent::PhaseChanged {
            from: from.link_phase(),
            to: next.link_phase(),
        });
    }
}
