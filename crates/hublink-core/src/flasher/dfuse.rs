//! USB DFU 1.1 bootloader with the STM32 DfuSe extensions.
//!
//! Used by hubs whose ROM bootloader enumerates as a DFU device. Requests go
//! out as class control transfers on the DFU interface; addressing and page
//! erase are DfuSe commands sent as block 0 downloads.

use std::time::Duration;

use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient};
use nusb::{DeviceInfo, Interface, list_devices};
use tracing::{debug, info, instrument, warn};

use super::FlashError;
use super::traits::{Bootloader, TargetInfo};
use crate::config::UsbDfuConfig;
use crate::firmware::ChecksumKind;
use crate::protocol::HubKind;
use crate::transport::UsbTransport;

const DFU_DNLOAD: u8 = 1;
const DFU_UPLOAD: u8 = 2;
const DFU_GETSTATUS: u8 = 3;
const DFU_CLRSTATUS: u8 = 4;
const DFU_ABORT: u8 = 6;

const STATE_IDLE: u8 = 2;
const STATE_DNBUSY: u8 = 4;
const STATE_MANIFEST: u8 = 7;
const STATE_ERROR: u8 = 10;

const STATUS_OK: u8 = 0;

const CMD_SET_ADDRESS: u8 = 0x21;
const CMD_ERASE: u8 = 0x41;

/// First wValue that addresses data; 0 and 1 are command blocks.
const DATA_BLOCK: u16 = 2;

const DFU_CLASS: u8 = 0xFE;
const DFU_SUBCLASS: u8 = 0x01;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);
const MAX_POLLS: u32 = 500;

/// Sector map of STM32F413 internal flash, as the ROM bootloader reports it.
pub const DEFAULT_LAYOUT: &str = "@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg";

/// Response to DFU_GETSTATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuStatus {
    pub status: u8,
    pub poll_timeout: Duration,
    pub state: u8,
}

impl DfuStatus {
    pub fn parse(raw: &[u8]) -> Result<Self, FlashError> {
        if raw.len() < 6 {
            return Err(FlashError::Usb(format!(
                "GETSTATUS returned {} bytes, expected 6",
                raw.len()
            )));
        }
        let poll = u32::from_le_bytes([raw[1], raw[2], raw[3], 0]);
        Ok(Self {
            status: raw[0],
            poll_timeout: Duration::from_millis(poll as u64),
            state: raw[4],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sector {
    pub address: u32,
    pub size: u32,
    pub erasable: bool,
}

/// Flash layout parsed from a DfuSe interface string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashLayout {
    pub name: String,
    pub sectors: Vec<Sector>,
}

impl FlashLayout {
    /// Parse `@Name/0xADDR/NN*SSSKt,.../0xADDR/...`.
    pub fn parse(raw: &str) -> Result<Self, FlashError> {
        let invalid = |why: &str| FlashError::Usb(format!("bad DfuSe layout '{}': {}", raw, why));
        let body = raw.strip_prefix('@').ok_or_else(|| invalid("missing '@'"))?;
        let mut parts = body.split('/');
        let name = parts.next().unwrap_or_default().trim().to_string();

        let mut sectors = Vec::new();
        loop {
            let Some(address) = parts.next() else { break };
            let groups = parts.next().ok_or_else(|| invalid("address without sectors"))?;
            let mut address = u32::from_str_radix(
                address.trim().trim_start_matches("0x").trim_start_matches("0X"),
                16,
            )
            .map_err(|_| invalid("bad address"))?;

            for group in groups.split(',') {
                let (count, size) = group
                    .trim()
                    .split_once('*')
                    .ok_or_else(|| invalid("missing '*'"))?;
                let count: u32 = count.parse().map_err(|_| invalid("bad sector count"))?;
                let size = size.trim();
                let digits = size.trim_end_matches(|c: char| !c.is_ascii_digit());
                let (unit, flag) = match size[digits.len()..].as_bytes() {
                    [b'K', flag, ..] => (1024, *flag),
                    [b'M', flag, ..] => (1024 * 1024, *flag),
                    [b' ' | b'B', flag, ..] => (1, *flag),
                    [flag] => (1, *flag),
                    _ => return Err(invalid("bad sector type")),
                };
                let size = digits
                    .parse::<u32>()
                    .map_err(|_| invalid("bad sector size"))?
                    .checked_mul(unit)
                    .ok_or_else(|| invalid("sector size overflow"))?;
                // a..g encode readable=1, erasable=2, writable=4
                let erasable = (b'a'..=b'g').contains(&flag) && (flag - b'a' + 1) & 2 != 0;
                for _ in 0..count {
                    sectors.push(Sector {
                        address,
                        size,
                        erasable,
                    });
                    address = address.wrapping_add(size);
                }
            }
        }
        if sectors.is_empty() {
            return Err(invalid("no sectors"));
        }
        Ok(Self { name, sectors })
    }

    /// Erasable sectors overlapping `[start, start + len)`.
    pub fn sectors_covering(&self, start: u32, len: usize) -> Vec<Sector> {
        let end = start as u64 + len as u64;
        self.sectors
            .iter()
            .filter(|s| {
                s.erasable
                    && (s.address as u64) < end
                    && s.address as u64 + s.size as u64 > start as u64
            })
            .copied()
            .collect()
    }
}

/// Bootloader in DFU mode on USB.
pub struct DfuSe {
    interface: Interface,
    number: u8,
    config: UsbDfuConfig,
    layout: FlashLayout,
    timeout: Duration,
}

fn find_dfu_interface(info: &DeviceInfo) -> Option<(u8, Option<String>)> {
    info.interfaces()
        .find(|i| i.class() == DFU_CLASS && i.subclass() == DFU_SUBCLASS)
        .map(|i| (i.interface_number(), i.interface_string().map(str::to_string)))
}

impl DfuSe {
    /// Open the first matching DFU device, or the one at `address`.
    #[instrument(skip(config))]
    pub async fn open(config: &UsbDfuConfig, address: Option<&str>) -> Result<Self, FlashError> {
        let info = list_devices()
            .await
            .map_err(|e| FlashError::Usb(e.to_string()))?
            .find(|d| {
                d.vendor_id() == config.vendor_id
                    && config.product_ids.contains(&d.product_id())
                    && address.is_none_or(|a| UsbTransport::device_address(d) == a)
            })
            .ok_or_else(|| FlashError::Usb("no device in DFU mode found".into()))?;

        let (number, description) = find_dfu_interface(&info).unwrap_or((0, None));
        let layout = match description.as_deref().map(FlashLayout::parse) {
            Some(Ok(layout)) => layout,
            Some(Err(e)) => {
                warn!(error = %e, "Using default flash layout");
                FlashLayout::parse(DEFAULT_LAYOUT)?
            }
            None => FlashLayout::parse(DEFAULT_LAYOUT)?,
        };

        let device = info.open().await.map_err(|e| FlashError::Usb(e.to_string()))?;
        let interface = device
            .claim_interface(number)
            .await
            .map_err(|e| FlashError::Usb(format!("claim interface {}: {}", number, e)))?;
        info!(
            product = %format!("0x{:04X}", info.product_id()),
            layout = %layout.name,
            sectors = layout.sectors.len(),
            "DFU device opened"
        );

        Ok(Self {
            interface,
            number,
            config: config.clone(),
            layout,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn layout(&self) -> &FlashLayout {
        &self.layout
    }

    async fn dnload(&self, block: u16, data: &[u8]) -> Result<(), FlashError> {
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: DFU_DNLOAD,
                    value: block,
                    index: self.number as u16,
                    data,
                },
                self.timeout,
            )
            .await
            .map_err(|e| FlashError::Usb(format!("DNLOAD block {}: {}", block, e)))
    }

    async fn upload(&self, block: u16, len: usize) -> Result<Vec<u8>, FlashError> {
        self.interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: DFU_UPLOAD,
                    value: block,
                    index: self.number as u16,
                    length: len as u16,
                },
                self.timeout,
            )
            .await
            .map_err(|e| FlashError::Usb(format!("UPLOAD block {}: {}", block, e)))
    }

    async fn simple(&self, request: u8) -> Result<(), FlashError> {
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value: 0,
                    index: self.number as u16,
                    data: &[],
                },
                self.timeout,
            )
            .await
            .map_err(|e| FlashError::Usb(format!("request {}: {}", request, e)))
    }

    async fn get_status(&self) -> Result<DfuStatus, FlashError> {
        let raw = self
            .interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: DFU_GETSTATUS,
                    value: 0,
                    index: self.number as u16,
                    length: 6,
                },
                self.timeout,
            )
            .await
            .map_err(|e| FlashError::Usb(format!("GETSTATUS: {}", e)))?;
        DfuStatus::parse(&raw)
    }

    /// Poll until the device leaves its busy states.
    async fn wait_ready(&self) -> Result<DfuStatus, FlashError> {
        for _ in 0..MAX_POLLS {
            let status = self.get_status().await?;
            if status.status != STATUS_OK || status.state == STATE_ERROR {
                self.simple(DFU_CLRSTATUS).await?;
                return Err(FlashError::Bootloader(format!(
                    "DFU status {} in state {}",
                    status.status, status.state
                )));
            }
            if status.state != STATE_DNBUSY && status.state != STATE_MANIFEST {
                return Ok(status);
            }
            tokio::time::sleep(status.poll_timeout).await;
        }
        Err(FlashError::Timeout(format!("DFU device still busy after {} polls", MAX_POLLS)))
    }

    /// Bring the device back to dfuIDLE.
    async fn ensure_idle(&self) -> Result<(), FlashError> {
        let status = self.get_status().await?;
        if status.state == STATE_ERROR {
            self.simple(DFU_CLRSTATUS).await?;
        } else if status.state != STATE_IDLE {
            self.simple(DFU_ABORT).await?;
        }
        Ok(())
    }

    async fn command(&self, code: u8, address: u32) -> Result<(), FlashError> {
        let mut data = [0u8; 5];
        data[0] = code;
        data[1..].copy_from_slice(&address.to_le_bytes());
        self.dnload(0, &data).await?;
        self.wait_ready().await.map(|_| ())
    }

    async fn set_address(&self, address: u32) -> Result<(), FlashError> {
        self.command(CMD_SET_ADDRESS, address).await
    }

    fn address(&self, offset: u32) -> u32 {
        self.config.flash_address.wrapping_add(offset)
    }
}

impl Bootloader for DfuSe {
    async fn info(&mut self) -> Result<TargetInfo, FlashError> {
        self.ensure_idle().await?;
        Ok(TargetInfo {
            hub_kind: Some(HubKind::TechnicLarge),
            flash_base: self.config.flash_address,
            flash_size: self.config.flash_size,
            block_size: self.config.transfer_size,
            checksum: Some(ChecksumKind::Crc32),
            version: None,
        })
    }

    #[instrument(skip(self))]
    async fn erase(&mut self, len: usize) -> Result<(), FlashError> {
        let sectors = self.layout.sectors_covering(self.config.flash_address, len);
        for sector in sectors {
            debug!(
                address = %format!("0x{:08X}", sector.address),
                size = sector.size,
                "Erasing sector"
            );
            self.command(CMD_ERASE, sector.address).await?;
        }
        Ok(())
    }

    async fn begin(&mut self, _len: usize) -> Result<(), FlashError> {
        self.ensure_idle().await
    }

    async fn program(&mut self, offset: u32, block: &[u8], _last: bool) -> Result<(), FlashError> {
        self.set_address(self.address(offset)).await?;
        self.dnload(DATA_BLOCK, block).await?;
        self.wait_ready().await.map(|_| ())
    }

    fn supports_read(&self) -> bool {
        true
    }

    async fn read(&mut self, offset: u32, len: usize) -> Result<Vec<u8>, FlashError> {
        self.set_address(self.address(offset)).await?;
        // upload is only accepted from dfuIDLE
        self.simple(DFU_ABORT).await?;
        let len = len.min(self.config.transfer_size);
        let data = self.upload(DATA_BLOCK, len).await?;
        self.simple(DFU_ABORT).await?;
        Ok(data)
    }

    async fn finish(&mut self) -> Result<(), FlashError> {
        self.set_address(self.config.flash_address).await?;
        self.dnload(0, &[]).await?;
        // the device resets during manifestation
        if let Err(e) = self.get_status().await {
            debug!(error = %e, "Device left DFU mode");
        }
        Ok(())
    }
}
