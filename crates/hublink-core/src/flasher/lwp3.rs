//! LEGO Wireless Protocol 3 bootloader, reached over BLE.
//!
//! Only the final ProgramFlash frame is answered. GetChecksum is sent before
//! every tenth block so the hub's receive buffer can drain.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::FlashError;
use super::traits::{Bootloader, DeviceChecksum, TargetInfo};
use crate::discovery::HubDescriptor;
use crate::firmware::ChecksumKind;
use crate::protocol::CodecError;
use crate::protocol::bootloader::{BootloaderCommand, BootloaderInfo, BootloaderReply, ERASE_FLASH};
use crate::transport::Transport;

const ERASE_TIMEOUT: Duration = Duration::from_secs(5);
const CHECKSUM_TIMEOUT: Duration = Duration::from_millis(500);
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const PACING_INTERVAL: u32 = 10;
/// Command byte, payload length byte and address ahead of each payload.
const PROGRAM_OVERHEAD: usize = 6;

pub struct Lwp3Bootloader<T: Transport> {
    transport: T,
    hub: HubDescriptor,
    replies: Option<mpsc::Receiver<Vec<u8>>>,
    info: Option<BootloaderInfo>,
    blocks: u32,
    /// Set when the erase reply timed out and may still arrive.
    ignore_erase_reply: bool,
    summary: Option<DeviceChecksum>,
}

impl<T: Transport> Lwp3Bootloader<T> {
    pub fn new(transport: T, hub: HubDescriptor) -> Self {
        Self {
            transport,
            hub,
            replies: None,
            info: None,
            blocks: 0,
            ignore_erase_reply: false,
            summary: None,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn ensure_open(&mut self) -> Result<(), FlashError> {
        if self.replies.is_none() {
            self.transport.open(&self.hub).await?;
            self.replies = Some(self.transport.subscribe().await?);
        }
        Ok(())
    }

    async fn send(&self, command: &BootloaderCommand) -> Result<(), FlashError> {
        self.transport.write(&command.encode()?).await?;
        Ok(())
    }

    async fn request(
        &mut self,
        command: &BootloaderCommand,
        timeout: Duration,
    ) -> Result<BootloaderReply, FlashError> {
        self.ensure_open().await?;
        self.send(command).await?;
        let expected = command.code();
        let replies = self
            .replies
            .as_mut()
            .ok_or(FlashError::Bootloader("no reply channel".into()))?;
        loop {
            let frame = tokio::time::timeout(timeout, replies.recv())
                .await
                .map_err(|_| {
                    FlashError::Timeout(format!(
                        "no reply to bootloader command 0x{:02X} within {}ms",
                        expected,
                        timeout.as_millis()
                    ))
                })?
                .ok_or(FlashError::Bootloader("hub disconnected".into()))?;
            let reply = BootloaderReply::decode(&frame)?;
            if reply.code() == ERASE_FLASH && expected != ERASE_FLASH && self.ignore_erase_reply {
                debug!("Late erase reply");
                self.ignore_erase_reply = false;
                continue;
            }
            if let BootloaderReply::Error(code) = reply {
                return Err(CodecError::BootloaderError(code).into());
            }
            if reply.code() != expected {
                return Err(CodecError::UnexpectedReply {
                    expected,
                    actual: reply.code(),
                }
                .into());
            }
            return Ok(reply);
        }
    }

    fn target(&self, info: &BootloaderInfo) -> Result<TargetInfo, FlashError> {
        let payload = info
            .hub_kind
            .bootloader_payload_size()
            .ok_or(FlashError::Unsupported("BLE bootloader for this hub"))?;
        let link = self.transport.link().max_write_size.saturating_sub(PROGRAM_OVERHEAD);
        Ok(TargetInfo {
            hub_kind: Some(info.hub_kind),
            flash_base: info.start_address,
            flash_size: info.flash_size(),
            block_size: payload.min(link).max(1),
            checksum: Some(ChecksumKind::Sum),
            version: Some(info.version.to_string()),
        })
    }
}

impl<T: Transport> Bootloader for Lwp3Bootloader<T> {
    #[instrument(skip(self), fields(address = %self.hub.address))]
    async fn info(&mut self) -> Result<TargetInfo, FlashError> {
        let info = match self.info {
            Some(info) => info,
            None => match self.request(&BootloaderCommand::GetInfo, REPLY_TIMEOUT).await? {
                BootloaderReply::Info(info) => info,
                other => {
                    return Err(CodecError::UnexpectedReply {
                        expected: BootloaderCommand::GetInfo.code(),
                        actual: other.code(),
                    }
                    .into());
                }
            },
        };
        info!(
            hub = ?info.hub_kind,
            version = %info.version,
            start = %format!("0x{:08X}", info.start_address),
            end = %format!("0x{:08X}", info.end_address),
            "Bootloader info"
        );
        self.info = Some(info);
        self.target(&info)
    }

    /// The bootloader erases the whole application area; `len` is not sent.
    async fn erase(&mut self, _len: usize) -> Result<(), FlashError> {
        match self.request(&BootloaderCommand::EraseFlash, ERASE_TIMEOUT).await {
            Ok(BootloaderReply::Erased { ok: true }) => Ok(()),
            Ok(_) => Err(FlashError::Bootloader("erase failed".into())),
            Err(FlashError::Timeout(_)) => {
                // some hubs never answer the erase
                warn!("No erase reply, continuing");
                self.ignore_erase_reply = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn begin(&mut self, len: usize) -> Result<(), FlashError> {
        let size = u32::try_from(len).map_err(|_| FlashError::SizeMismatch {
            image: len,
            region: u32::MAX as usize,
        })?;
        match self
            .request(&BootloaderCommand::InitLoader { size }, REPLY_TIMEOUT)
            .await?
        {
            BootloaderReply::Initialized { ok: true } => {
                self.blocks = 0;
                self.summary = None;
                Ok(())
            }
            _ => Err(FlashError::Bootloader(format!("hub refused a {} byte image", len))),
        }
    }

    async fn program(&mut self, offset: u32, block: &[u8], last: bool) -> Result<(), FlashError> {
        let base = self
            .info
            .map(|info| info.start_address)
            .ok_or(FlashError::Bootloader("program before info".into()))?;

        if self.blocks % PACING_INTERVAL == PACING_INTERVAL - 1 {
            self.request(&BootloaderCommand::GetChecksum, CHECKSUM_TIMEOUT).await?;
        }
        self.blocks += 1;

        let command = BootloaderCommand::ProgramFlash {
            address: base.wrapping_add(offset),
            payload: block.to_vec(),
        };
        if !last {
            return self.send(&command).await;
        }
        match self.request(&command, REPLY_TIMEOUT).await? {
            BootloaderReply::Programmed { checksum, count } => {
                self.summary = Some(DeviceChecksum {
                    bytes: count as usize,
                    xor: checksum,
                });
                Ok(())
            }
            other => Err(CodecError::UnexpectedReply {
                expected: command.code(),
                actual: other.code(),
            }
            .into()),
        }
    }

    async fn checksum(&mut self) -> Result<Option<DeviceChecksum>, FlashError> {
        Ok(self.summary)
    }

    async fn finish(&mut self) -> Result<(), FlashError> {
        // the hub reboots without replying
        self.send(&BootloaderCommand::StartApp).await?;
        self.replies = None;
        if let Err(e) = self.transport.close().await {
            debug!(error = %e, "Close after StartApp");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::flasher::Flasher;
    use crate::protocol::checksum::xor_bytes;
    use crate::protocol::{HubKind, Lwp3Version};
    use crate::state::dispatcher::lock;
    use crate::transport::{Attribute, LinkParams, TransportError};

    /// Hub in LWP3 bootloader mode.
    #[derive(Clone, Default)]
    struct FakeBootloaderHub {
        sender: Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
        commands: Arc<Mutex<Vec<BootloaderCommand>>>,
        flash: Arc<Mutex<Vec<u8>>>,
        silent_erase: bool,
        bad_checksum: bool,
    }

    const START: u32 = 0x0800_8000;

    impl FakeBootloaderHub {
        fn commands(&self) -> Vec<BootloaderCommand> {
            lock(&self.commands).clone()
        }

        fn reply(&self, command: &BootloaderCommand) -> Option<BootloaderReply> {
            let mut flash = lock(&self.flash);
            match command {
                BootloaderCommand::GetInfo => Some(BootloaderReply::Info(BootloaderInfo {
                    version: Lwp3Version(0x0100_0000),
                    start_address: START,
                    end_address: START + 4096,
                    hub_kind: HubKind::City,
                })),
                BootloaderCommand::EraseFlash => {
                    flash.clear();
                    (!self.silent_erase).then_some(BootloaderReply::Erased { ok: true })
                }
                BootloaderCommand::InitLoader { .. } => {
                    Some(BootloaderReply::Initialized { ok: true })
                }
                BootloaderCommand::GetChecksum => {
                    Some(BootloaderReply::Checksum(xor_bytes(&flash, 0xFF)))
                }
                BootloaderCommand::ProgramFlash { address, payload } => {
                    assert_eq!(*address as usize - START as usize, flash.len());
                    flash.extend_from_slice(payload);
                    // only the final block of a 100 byte image gets a reply
                    let noise = if self.bad_checksum { 0x5A } else { 0 };
                    (flash.len() == 100).then(|| BootloaderReply::Programmed {
                        checksum: xor_bytes(&flash, 0xFF) ^ noise,
                        count: flash.len() as u32,
                    })
                }
                _ => None,
            }
        }
    }

    impl Transport for FakeBootloaderHub {
        async fn open(&mut self, _hub: &HubDescriptor) -> Result<LinkParams, TransportError> {
            Ok(self.link())
        }

        async fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
            let command = BootloaderCommand::decode(frame).unwrap();
            lock(&self.commands).push(command.clone());
            let reply = self.reply(&command);
            let sender = lock(&self.sender).clone();
            if let (Some(reply), Some(sender)) = (reply, sender) {
                let _ = sender.send(reply.encode()).await;
            }
            Ok(())
        }

        async fn subscribe(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
            let (tx, rx) = mpsc::channel(16);
            *lock(&self.sender) = Some(tx);
            Ok(rx)
        }

        async fn read_attribute(&self, attribute: Attribute) -> Result<Vec<u8>, TransportError> {
            Err(TransportError::AttributeUnavailable(attribute))
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            *lock(&self.sender) = None;
            Ok(())
        }

        fn link(&self) -> LinkParams {
            LinkParams {
                max_write_size: 158,
                min_write_interval: None,
            }
        }

        fn is_open(&self) -> bool {
            lock(&self.sender).is_some()
        }
    }

    fn city_image() -> crate::firmware::FirmwareImage {
        use crate::firmware::FirmwareMetadata;
        use crate::firmware::metadata::tests::V110_JSON;
        use crate::protocol::checksum::sum_complement;

        let metadata = FirmwareMetadata::from_json(V110_JSON.as_bytes()).unwrap();
        let mut data: Vec<u8> = (0..96u8).collect();
        let sum = sum_complement(&data, 256).unwrap();
        data.extend_from_slice(&sum.to_le_bytes());
        crate::firmware::FirmwareImage::new(data, metadata, Some(sum))
    }

    #[tokio::test]
    async fn test_flash_over_ble_bootloader() {
        let hub = FakeBootloaderHub::default();
        let bootloader = Lwp3Bootloader::new(hub.clone(), HubDescriptor::mock("city"));
        let mut flasher = Flasher::new(bootloader);

        let report = flasher.flash(&city_image()).await.unwrap();
        assert_eq!(report.bytes, 100);
        assert!(report.verified);
        assert_eq!(*lock(&hub.flash), city_image().into_bytes());

        let commands = hub.commands();
        assert_eq!(commands[0], BootloaderCommand::GetInfo);
        assert_eq!(commands[1], BootloaderCommand::EraseFlash);
        assert_eq!(commands[2], BootloaderCommand::InitLoader { size: 100 });
        // 32 byte blocks for the City hub
        let blocks: Vec<usize> = commands
            .iter()
            .filter_map(|c| match c {
                BootloaderCommand::ProgramFlash { payload, .. } => Some(payload.len()),
                _ => None,
            })
            .collect();
        assert_eq!(blocks, vec![32, 32, 32, 4]);
        assert_eq!(commands.last(), Some(&BootloaderCommand::StartApp));
    }

    #[tokio::test]
    async fn test_wrong_device_checksum_fails_verify() {
        let hub = FakeBootloaderHub {
            bad_checksum: true,
            ..Default::default()
        };
        let bootloader = Lwp3Bootloader::new(hub.clone(), HubDescriptor::mock("city"));
        let mut flasher = Flasher::new(bootloader);

        let err = flasher.flash(&city_image()).await.unwrap_err();
        assert!(matches!(err, FlashError::VerifyFailed(_)));
        assert!(!hub.commands().contains(&BootloaderCommand::StartApp));
    }

    #[tokio::test]
    async fn test_checksum_request_paces_every_tenth_block() {
        let hub = FakeBootloaderHub::default();
        let mut bootloader = Lwp3Bootloader::new(hub.clone(), HubDescriptor::mock("city"));
        bootloader.info().await.unwrap();
        bootloader.begin(100).await.unwrap();
        for i in 0..12u32 {
            bootloader.program(i * 4, &[0u8; 4], false).await.unwrap();
        }
        let commands = hub.commands();
        let positions: Vec<usize> = commands
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == BootloaderCommand::GetChecksum)
            .map(|(i, _)| i)
            .collect();
        // GetInfo, InitLoader, 9 blocks, then the checksum request
        assert_eq!(positions, vec![11]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_erase_is_tolerated() {
        let hub = FakeBootloaderHub {
            silent_erase: true,
            ..Default::default()
        };
        let mut bootloader = Lwp3Bootloader::new(hub.clone(), HubDescriptor::mock("city"));
        bootloader.info().await.unwrap();
        bootloader.erase(100).await.unwrap();
        assert!(bootloader.ignore_erase_reply);
        bootloader.begin(100).await.unwrap();
        assert_eq!(hub.commands().len(), 3);
    }

    #[tokio::test]
    async fn test_unsupported_hub_kind() {
        let info = BootloaderInfo {
            version: Lwp3Version(0),
            start_address: 0,
            end_address: 1024,
            hub_kind: HubKind::Mario,
        };
        let bootloader =
            Lwp3Bootloader::new(FakeBootloaderHub::default(), HubDescriptor::mock("x"));
        assert!(matches!(
            bootloader.target(&info),
            Err(FlashError::Unsupported(_))
        ));
    }
}
