//! Hub session - high-level orchestrator for running programs and flashing.
//!
//! [`HubSession`] resolves a transport for a hub, drives the connection and
//! hands payloads to the transfer engine or the flasher. The generic `*_with`
//! entry points take an already-built transport or bootloader so the same
//! flows run against simulators.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::config::HubConfig;
use crate::connection::{Connection, HubRegistry};
use crate::discovery::{HubDescriptor, HubFilter, Medium, Scanner, list_dfu_devices};
use crate::error::HubError;
use crate::events::{LinkEvent, LinkObserver, LinkPhase, LogLevel, TracingObserver};
use crate::firmware::{FirmwareArchive, FirmwareImage, ScriptCompiler};
use crate::flasher::{Bootloader, DfuSe, FirmwareBackup, FlashReport, Flasher, Lwp3Bootloader};
use crate::protocol::{HubMessage, HubProperty, LineBuffer};
use crate::state::HubEvent;
use crate::transfer::TransferReport;
use crate::transport::{
    BleTransport, GattProfile, HubTransport, ObservedTransport, SerialTransport, Transport,
    UsbTransport,
};

const DFU_POLL_INTERVAL: Duration = Duration::from_millis(500);
const SERIAL_BAUD_RATE: u32 = 115_200;
const FW_VERSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a firmware image goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashTarget {
    /// A BLE hub, rebooted into its bootloader first if it runs Pybricks.
    Ble(HubFilter),
    /// A hub already waiting in USB DFU mode, optionally by address.
    UsbDfu(Option<String>),
}

/// Outcome of a program run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub transfer: TransferReport,
    /// Bytes of program output delivered to the caller.
    pub output_bytes: usize,
    /// The hub reported the program finished before the link went down.
    pub completed: bool,
}

pub struct HubSession {
    config: HubConfig,
    observer: Arc<dyn LinkObserver>,
    registry: HubRegistry,
}

impl HubSession {
    /// Create a new session with the default tracing observer.
    pub fn new(config: HubConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }

    pub fn with_observer(config: HubConfig, observer: Arc<dyn LinkObserver>) -> Self {
        Self {
            config,
            observer,
            registry: HubRegistry::global().clone(),
        }
    }

    pub fn with_registry(mut self, registry: HubRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Scan over BLE for the first hub matching `filter`.
    #[instrument(skip(self))]
    pub async fn find_hub(&self, filter: HubFilter) -> Result<HubDescriptor, HubError> {
        let scanner = Scanner::new().await?;
        self.find_with(&scanner, filter).await
    }

    async fn find_with(
        &self,
        scanner: &Scanner,
        filter: HubFilter,
    ) -> Result<HubDescriptor, HubError> {
        self.observer.on_event(&LinkEvent::PhaseChanged {
            from: LinkPhase::Connecting,
            to: LinkPhase::Scanning,
        });
        let hub = scanner.find_hub(filter, self.config.scan_timeout()).await?;
        self.observer.on_event(&LinkEvent::HubFound {
            address: hub.address.clone(),
            name: hub.name.clone(),
        });
        info!(
            address = %hub.address,
            kind = ?hub.hub_kind,
            bootloader = hub.bootloader,
            "Hub found"
        );
        Ok(hub)
    }

    /// Transport matching the medium `hub` was discovered on.
    pub async fn transport_for(&self, hub: &HubDescriptor) -> Result<HubTransport, HubError> {
        Ok(match hub.medium {
            Medium::Ble => {
                let scanner = Scanner::new().await?;
                BleTransport::new(scanner.adapter(), GattProfile::pybricks()).into()
            }
            Medium::Usb => UsbTransport::new().into(),
            Medium::Serial => SerialTransport::new(SERIAL_BAUD_RATE).into(),
            Medium::UsbDfu | Medium::Mock => {
                return Err(HubError::UnsupportedHub(format!(
                    "{:?} hubs cannot run programs",
                    hub.medium
                )));
            }
        })
    }

    /// Download `program` to `hub`, run it and stream its output.
    ///
    /// Output bytes go to `on_output` as they arrive; complete lines are also
    /// reported to the observer as log events.
    pub async fn run_program<F>(
        &self,
        hub: HubDescriptor,
        program: &[u8],
        on_output: F,
    ) -> Result<RunOutcome, HubError>
    where
        F: FnMut(&[u8]) + Send,
    {
        let transport = self.transport_for(&hub).await?;
        self.run_program_with(hub, transport, program, on_output).await
    }

    #[instrument(skip_all, fields(address = %hub.address, len = program.len()))]
    pub async fn run_program_with<T, F>(
        &self,
        hub: HubDescriptor,
        transport: T,
        program: &[u8],
        mut on_output: F,
    ) -> Result<RunOutcome, HubError>
    where
        T: Transport,
        F: FnMut(&[u8]) + Send,
    {
        let transport = ObservedTransport::new(transport, self.observer.clone());
        let mut connection =
            Connection::with_registry(hub, transport, self.config.clone(), &self.registry)?
                .with_observer(self.observer.clone());
        let mut events = connection
            .take_events()
            .ok_or_else(|| HubError::Protocol("event stream already taken".into()))?;

        let mut lines = LineBuffer::new();
        let mut output_bytes = 0usize;
        let mut completed = false;
        let mut deliver = |bytes: &[u8]| {
            output_bytes += bytes.len();
            on_output(bytes);
            for line in lines.push(bytes) {
                self.observer.on_event(&LinkEvent::Log {
                    level: LogLevel::Info,
                    message: line,
                });
            }
        };
        let result = async {
            connection.establish().await?;
            let transfer = connection.run(program).await?;
            while let Some(event) = events.recv().await {
                match event {
                    HubEvent::Output(bytes) => deliver(&bytes),
                    HubEvent::ProgramCompleted => {
                        completed = true;
                        break;
                    }
                    HubEvent::Error(message) => return Err(HubError::Protocol(message)),
                    HubEvent::Disconnected => break,
                    HubEvent::Status(_) | HubEvent::ProgramStarted => {}
                }
            }
            Ok(transfer)
        }
        .await;

        if let Err(e) = connection.disconnect().await {
            warn!(error = %e, "Disconnect failed");
        }
        // output buffered before the disconnect
        while let Ok(event) = events.try_recv() {
            if let HubEvent::Output(bytes) = event {
                deliver(&bytes);
            }
        }
        if let Some(rest) = lines.flush() {
            self.observer.on_event(&LinkEvent::Log {
                level: LogLevel::Info,
                message: rest,
            });
        }

        let transfer = result?;
        self.observer.on_event(&LinkEvent::Complete);
        Ok(RunOutcome {
            transfer,
            output_bytes,
            completed,
        })
    }

    /// Ask a hub running Pybricks to restart into its bootloader.
    pub async fn reboot_to_bootloader_with<T: Transport>(
        &self,
        hub: HubDescriptor,
        transport: T,
    ) -> Result<(), HubError> {
        let mut connection =
            Connection::with_registry(hub, transport, self.config.clone(), &self.registry)?
                .with_observer(self.observer.clone());
        if let Err(e) = connection.establish().await {
            let _ = connection.disconnect().await;
            return Err(e);
        }
        connection.reboot_to_bootloader().await
    }

    /// Ask a hub running official LEGO firmware to restart into its
    /// bootloader. The hub must report its firmware version first.
    #[instrument(skip_all, fields(address = %hub.address))]
    pub async fn reboot_official_to_bootloader_with<T: Transport>(
        &self,
        hub: HubDescriptor,
        mut transport: T,
    ) -> Result<(), HubError> {
        let _lease = self.registry.acquire(&hub.address)?;
        transport.open(&hub).await?;
        let result = async {
            let mut notifications = transport.subscribe().await?;
            transport
                .write(&HubMessage::RequestProperty(HubProperty::FwVersion).encode())
                .await?;
            let version = tokio::time::timeout(FW_VERSION_TIMEOUT, async {
                while let Some(frame) = notifications.recv().await {
                    match HubMessage::decode(&frame) {
                        Ok(message) => {
                            if let Some(version) = message.firmware_version() {
                                return Some(version);
                            }
                        }
                        Err(e) => debug!(error = %e, "Skipping hub message"),
                    }
                }
                None
            })
            .await
            .map_err(|_| HubError::Timeout("hub did not report its firmware version".into()))?
            .ok_or_else(|| HubError::Connect {
                address: hub.address.clone(),
                reason: "hub disconnected".into(),
            })?;

            info!(version = %version, "Rebooting official firmware into update mode");
            self.observer.on_event(&LinkEvent::Log {
                level: LogLevel::Info,
                message: format!("Hub is running firmware v{}", version),
            });
            transport.write(&HubMessage::FirmwareUpdate.encode()).await?;
            Ok(())
        }
        .await;

        if let Err(e) = transport.close().await {
            debug!(error = %e, "Close after reboot request");
        }
        result
    }

    /// Build the image from `archive` and install it on `target`.
    #[instrument(skip(self, archive, compiler))]
    pub async fn flash_firmware<C: ScriptCompiler>(
        &self,
        archive: &FirmwareArchive,
        compiler: &C,
        hub_name: Option<&str>,
        target: FlashTarget,
    ) -> Result<FlashReport, HubError> {
        let image = archive.build(compiler, hub_name).await?;
        info!(
            kind = ?image.hub_kind()?,
            version = %image.metadata().firmware_version(),
            bytes = image.len(),
            "Firmware image built"
        );

        match target {
            FlashTarget::UsbDfu(address) => {
                let bootloader = self.open_dfu(address.as_deref()).await?;
                self.flash_with(bootloader, &image).await
            }
            FlashTarget::Ble(_) if image.hub_kind()?.uses_usb_dfu() => Err(HubError::UnsupportedHub(
                "this firmware installs over USB DFU".into(),
            )),
            FlashTarget::Ble(filter) => {
                let scanner = Scanner::new().await?;
                let mut hub = self.find_with(&scanner, filter).await?;
                if !hub.bootloader {
                    if hub.official_firmware {
                        let profile = GattProfile::lwp3_hub(hub.hub_kind);
                        let transport = BleTransport::new(scanner.adapter(), profile);
                        self.reboot_official_to_bootloader_with(hub.clone(), transport)
                            .await?;
                    } else {
                        let transport =
                            BleTransport::new(scanner.adapter(), GattProfile::pybricks());
                        self.reboot_to_bootloader_with(hub.clone(), transport).await?;
                    }
                    hub = self.find_with(&scanner, HubFilter::bootloader()).await?;
                }
                let transport = BleTransport::new(
                    scanner.adapter(),
                    GattProfile::lwp3_bootloader(hub.hub_kind),
                );
                let bootloader = Lwp3Bootloader::new(transport, hub);
                self.flash_with(bootloader, &image).await
            }
        }
    }

    pub async fn flash_with<B: Bootloader>(
        &self,
        bootloader: B,
        image: &FirmwareImage,
    ) -> Result<FlashReport, HubError> {
        let mut flasher = Flasher::new(bootloader)
            .with_observer(self.observer.clone())
            .with_block_timeout(self.config.ack_timeout());
        let report = flasher.flash(image).await?;
        self.observer.on_event(&LinkEvent::Complete);
        Ok(report)
    }

    /// Save the firmware of a hub in DFU mode to `path`.
    pub async fn backup_firmware(
        &self,
        path: &std::path::Path,
        address: Option<&str>,
    ) -> Result<FirmwareBackup, HubError> {
        let bootloader = self.open_dfu(address).await?;
        let backup = self.backup_with(bootloader).await?;
        backup.save(path)?;
        Ok(backup)
    }

    pub async fn backup_with<B: Bootloader>(
        &self,
        bootloader: B,
    ) -> Result<FirmwareBackup, HubError> {
        let mut flasher = Flasher::new(bootloader).with_observer(self.observer.clone());
        Ok(flasher.backup().await?)
    }

    /// Write a backup file back to a hub in DFU mode.
    pub async fn restore_firmware(
        &self,
        path: &std::path::Path,
        address: Option<&str>,
    ) -> Result<FlashReport, HubError> {
        let backup = FirmwareBackup::load(path)?;
        let bootloader = self.open_dfu(address).await?;
        self.restore_with(bootloader, &backup).await
    }

    pub async fn restore_with<B: Bootloader>(
        &self,
        bootloader: B,
        backup: &FirmwareBackup,
    ) -> Result<FlashReport, HubError> {
        let mut flasher = Flasher::new(bootloader)
            .with_observer(self.observer.clone())
            .with_block_timeout(self.config.ack_timeout());
        let report = flasher.restore(backup).await?;
        self.observer.on_event(&LinkEvent::Complete);
        Ok(report)
    }

    /// Wait for a DFU device to enumerate, then open it.
    async fn open_dfu(&self, address: Option<&str>) -> Result<DfuSe, HubError> {
        let dfu = &self.config.dfu;
        let deadline = tokio::time::Instant::now() + self.config.scan_timeout();
        loop {
            let found = list_dfu_devices(dfu.vendor_id, &dfu.product_ids)?
                .into_iter()
                .any(|d| address.is_none_or(|a| d.address == a));
            if found {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(HubError::NotFound(
                    address.unwrap_or("hub in DFU mode").to_string(),
                ));
            }
            tokio::time::sleep(DFU_POLL_INTERVAL).await;
        }
        Ok(DfuSe::open(dfu, address).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use tokio::sync::mpsc;

    use crate::events::testing::RecordingObserver;
    use crate::protocol::HubKind;
    use crate::state::dispatcher::lock;
    use crate::transport::{Attribute, LinkParams, MockTransport, TransportError};

    /// Hub running official LEGO firmware.
    #[derive(Clone, Default)]
    struct FakeLegoHub {
        sender: Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
        closed: Arc<Mutex<bool>>,
        silent: bool,
    }

    impl Transport for FakeLegoHub {
        async fn open(&mut self, _hub: &HubDescriptor) -> Result<LinkParams, TransportError> {
            Ok(self.link())
        }

        async fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
            lock(&self.writes).push(frame.to_vec());
            let request = HubMessage::RequestProperty(HubProperty::FwVersion).encode();
            let sender = lock(&self.sender).clone();
            if frame == request.as_slice()
                && !self.silent
                && let Some(sender) = sender
            {
                // an unrelated property first, as a busy hub would send
                let battery = HubMessage::PropertyUpdate {
                    property: HubProperty::BatteryVoltage as u8,
                    value: vec![90],
                };
                let _ = sender.send(battery.encode()).await;
                let version = HubMessage::PropertyUpdate {
                    property: HubProperty::FwVersion as u8,
                    value: 0x1000_0107u32.to_le_bytes().to_vec(),
                };
                let _ = sender.send(version.encode()).await;
            }
            Ok(())
        }

        async fn subscribe(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
            let (tx, rx) = mpsc::channel(8);
            *lock(&self.sender) = Some(tx);
            Ok(rx)
        }

        async fn read_attribute(&self, attribute: Attribute) -> Result<Vec<u8>, TransportError> {
            Err(TransportError::AttributeUnavailable(attribute))
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            *lock(&self.sender) = None;
            *lock(&self.closed) = true;
            Ok(())
        }

        fn link(&self) -> LinkParams {
            LinkParams {
                max_write_size: 20,
                min_write_interval: None,
            }
        }

        fn is_open(&self) -> bool {
            lock(&self.sender).is_some()
        }
    }

    fn official_hub() -> HubDescriptor {
        let mut hub = HubDescriptor::mock("lego");
        hub.hub_kind = HubKind::City;
        hub.official_firmware = true;
        hub
    }

    fn session(observer: Arc<RecordingObserver>) -> HubSession {
        HubSession::with_observer(HubConfig::default(), observer).with_registry(HubRegistry::new())
    }

    #[tokio::test]
    async fn test_run_program_streams_output_until_completion() {
        let mock = MockTransport::new("1.2.0");
        mock.script_output(&[b"hello\r\n", b"world\r\n"], true);
        let observer = Arc::new(RecordingObserver::default());
        let session = session(observer.clone());

        let mut output = Vec::new();
        let outcome = session
            .run_program_with(HubDescriptor::mock("hub"), mock.clone(), &[7u8; 100], |bytes| {
                output.extend_from_slice(bytes)
            })
            .await
            .unwrap();

        assert!(outcome.completed);
        assert_eq!(outcome.transfer.bytes, 100);
        assert_eq!(output, b"hello\r\nworld\r\n");
        assert_eq!(outcome.output_bytes, 14);
        assert_eq!(&mock.ram()[..100], &[7u8; 100][..]);
        assert!(mock.is_closed());

        let events = observer.events.lock().unwrap();
        let lines: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                LinkEvent::Log { message, .. } => Some(message.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec!["hello", "world"]);
        assert!(events.iter().any(|e| matches!(
            e,
            LinkEvent::Packet {
                direction: crate::events::PacketDirection::Tx,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_run_program_releases_hub_on_failure() {
        let registry = HubRegistry::new();
        let session = HubSession::with_observer(
            HubConfig::default(),
            Arc::new(RecordingObserver::default()),
        )
        .with_registry(registry.clone());

        let err = session
            .run_program_with(HubDescriptor::mock("old"), MockTransport::new("0.9.0"), b"x", |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::IncompatibleProtocol { .. }));
        assert!(!registry.is_held("old"));
    }

    #[tokio::test]
    async fn test_reboot_to_bootloader_sends_command() {
        let mock = MockTransport::new("1.2.0");
        let session = session(Arc::new(RecordingObserver::default()));
        session
            .reboot_to_bootloader_with(HubDescriptor::mock("hub"), mock.clone())
            .await
            .unwrap();
        let reboot = crate::protocol::Command::RebootToUpdateMode.encode(64).unwrap();
        assert!(mock.writes().contains(&reboot));
        assert!(mock.is_closed());
    }

    #[tokio::test]
    async fn test_dfu_hub_cannot_run_programs() {
        let session = session(Arc::new(RecordingObserver::default()));
        let mut hub = HubDescriptor::mock("dfu");
        hub.medium = Medium::UsbDfu;
        assert!(matches!(
            session.transport_for(&hub).await,
            Err(HubError::UnsupportedHub(_))
        ));
    }

    #[tokio::test]
    async fn test_official_firmware_rebooted_after_version_report() {
        let lego = FakeLegoHub::default();
        let observer = Arc::new(RecordingObserver::default());
        let registry = HubRegistry::new();
        let session = HubSession::with_observer(HubConfig::default(), observer.clone())
            .with_registry(registry.clone());

        session
            .reboot_official_to_bootloader_with(official_hub(), lego.clone())
            .await
            .unwrap();

        let writes = lock(&lego.writes).clone();
        assert_eq!(
            writes,
            vec![
                vec![5, 0x00, 0x01, 0x03, 0x05],
                HubMessage::FirmwareUpdate.encode(),
            ]
        );
        assert!(*lock(&lego.closed));
        assert!(!registry.is_held("lego"));
        let events = observer.events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            LinkEvent::Log { message, .. } if message.contains("1.0.00.0107")
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_official_firmware_without_version_is_not_rebooted() {
        let lego = FakeLegoHub {
            silent: true,
            ..Default::default()
        };
        let session = session(Arc::new(RecordingObserver::default()));

        let err = session
            .reboot_official_to_bootloader_with(official_hub(), lego.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Timeout(_)));
        assert_eq!(lock(&lego.writes).len(), 1);
        assert!(*lock(&lego.closed));
    }
}
