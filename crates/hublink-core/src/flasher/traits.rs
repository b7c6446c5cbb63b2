//! Bootloader abstraction shared by the DFU, BLE and mock backends.

use std::future::Future;

use super::FlashError;
use crate::firmware::ChecksumKind;
use crate::protocol::HubKind;

/// What a bootloader reports about its target before anything is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    /// Hub kind the bootloader identifies as, when it says.
    pub hub_kind: Option<HubKind>,
    pub flash_base: u32,
    /// Size of the firmware region.
    pub flash_size: usize,
    /// Largest block a single program call takes.
    pub block_size: usize,
    /// Image checksum the hub's boot code checks, when known.
    pub checksum: Option<ChecksumKind>,
    pub version: Option<String>,
}

/// Summary the device reports after the last block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceChecksum {
    pub bytes: usize,
    pub xor: u8,
}

/// One flash-capable bootloader.
///
/// Offsets are relative to [`TargetInfo::flash_base`].
pub trait Bootloader: Send {
    fn info(&mut self) -> impl Future<Output = Result<TargetInfo, FlashError>> + Send;

    /// Erase enough of the region to hold `len` bytes.
    fn erase(&mut self, len: usize) -> impl Future<Output = Result<(), FlashError>> + Send;

    /// Announce a write of `len` bytes.
    fn begin(&mut self, len: usize) -> impl Future<Output = Result<(), FlashError>> + Send;

    fn program(
        &mut self,
        offset: u32,
        block: &[u8],
        last: bool,
    ) -> impl Future<Output = Result<(), FlashError>> + Send;

    fn supports_read(&self) -> bool {
        false
    }

    fn read(
        &mut self,
        _offset: u32,
        _len: usize,
    ) -> impl Future<Output = Result<Vec<u8>, FlashError>> + Send {
        async { Err(FlashError::Unsupported("read back")) }
    }

    fn checksum(
        &mut self,
    ) -> impl Future<Output = Result<Option<DeviceChecksum>, FlashError>> + Send {
        async { Ok(None) }
    }

    /// Leave the bootloader and start the new firmware.
    fn finish(&mut self) -> impl Future<Output = Result<(), FlashError>> + Send;
}
