//! In-memory bootloader for tests and dry runs.

use std::sync::{Arc, Mutex};

use super::traits::{Bootloader, DeviceChecksum, TargetInfo};
use super::FlashError;
use crate::protocol::checksum::xor_bytes;
use crate::state::dispatcher::lock;

/// One call received by a [`MockBootloader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    Info,
    Erase(usize),
    Begin(usize),
    Program { offset: u32, len: usize },
    Read { offset: u32, len: usize },
    Finish,
}

#[derive(Debug)]
struct Inner {
    target: TargetInfo,
    flash: Vec<u8>,
    ops: Vec<MockOp>,
    readable: bool,
    corrupt_at: Option<usize>,
    fail_at: Option<u32>,
    written: usize,
}

/// Simulated bootloader. Clones share the same flash.
#[derive(Debug, Clone)]
pub struct MockBootloader {
    inner: Arc<Mutex<Inner>>,
}

impl MockBootloader {
    /// Blank (0xFF) flash of `target.flash_size` bytes.
    pub fn new(target: TargetInfo) -> Self {
        let flash = vec![0xFF; target.flash_size];
        Self {
            inner: Arc::new(Mutex::new(Inner {
                target,
                flash,
                ops: Vec::new(),
                readable: true,
                corrupt_at: None,
                fail_at: None,
                written: 0,
            })),
        }
    }

    pub fn with_flash(self, contents: Vec<u8>) -> Self {
        {
            let mut inner = lock(&self.inner);
            inner.target.flash_size = contents.len();
            inner.flash = contents;
        }
        self
    }

    /// Drop read-back support; verification falls back to the device count.
    pub fn without_read(self) -> Self {
        lock(&self.inner).readable = false;
        self
    }

    /// Flip the byte at `offset` on every read-back and in the device checksum.
    pub fn corrupt_byte(&self, offset: usize) {
        lock(&self.inner).corrupt_at = Some(offset);
    }

    /// Reject the block that starts at `offset`.
    pub fn fail_program_at(&self, offset: u32) {
        lock(&self.inner).fail_at = Some(offset);
    }

    pub fn flash(&self) -> Vec<u8> {
        lock(&self.inner).flash.clone()
    }

    pub fn ops(&self) -> Vec<MockOp> {
        lock(&self.inner).ops.clone()
    }

    pub fn erase_called(&self) -> bool {
        lock(&self.inner)
            .ops
            .iter()
            .any(|op| matches!(op, MockOp::Erase(_)))
    }
}

impl Bootloader for MockBootloader {
    async fn info(&mut self) -> Result<TargetInfo, FlashError> {
        let mut inner = lock(&self.inner);
        inner.ops.push(MockOp::Info);
        Ok(inner.target.clone())
    }

    async fn erase(&mut self, len: usize) -> Result<(), FlashError> {
        let mut inner = lock(&self.inner);
        inner.ops.push(MockOp::Erase(len));
        let end = len.min(inner.flash.len());
        inner.flash[..end].fill(0xFF);
        inner.written = 0;
        Ok(())
    }

    async fn begin(&mut self, len: usize) -> Result<(), FlashError> {
        lock(&self.inner).ops.push(MockOp::Begin(len));
        Ok(())
    }

    async fn program(&mut self, offset: u32, block: &[u8], _last: bool) -> Result<(), FlashError> {
        let mut inner = lock(&self.inner);
        inner.ops.push(MockOp::Program {
            offset,
            len: block.len(),
        });
        if inner.fail_at == Some(offset) {
            return Err(FlashError::Bootloader(format!("write at 0x{:X} failed", offset)));
        }
        let start = offset as usize;
        let end = start + block.len();
        if end > inner.flash.len() {
            return Err(FlashError::SizeMismatch {
                image: end,
                region: inner.flash.len(),
            });
        }
        inner.flash[start..end].copy_from_slice(block);
        inner.written += block.len();
        Ok(())
    }

    fn supports_read(&self) -> bool {
        lock(&self.inner).readable
    }

    async fn read(&mut self, offset: u32, len: usize) -> Result<Vec<u8>, FlashError> {
        let mut inner = lock(&self.inner);
        if !inner.readable {
            return Err(FlashError::Unsupported("read back"));
        }
        inner.ops.push(MockOp::Read { offset, len });
        let start = (offset as usize).min(inner.flash.len());
        let end = (start + len).min(inner.flash.len());
        let mut data = inner.flash[start..end].to_vec();
        if let Some(at) = inner.corrupt_at
            && (start..end).contains(&at)
        {
            data[at - start] ^= 0xFF;
        }
        Ok(data)
    }

    async fn checksum(&mut self) -> Result<Option<DeviceChecksum>, FlashError> {
        let inner = lock(&self.inner);
        let written = inner.written.min(inner.flash.len());
        let mut xor = xor_bytes(&inner.flash[..written], 0xFF);
        if inner.corrupt_at.is_some_and(|at| at < written) {
            xor ^= 0xFF;
        }
        Ok(Some(DeviceChecksum {
            bytes: inner.written,
            xor,
        }))
    }

    async fn finish(&mut self) -> Result<(), FlashError> {
        lock(&self.inner).ops.push(MockOp::Finish);
        Ok(())
    }
}
