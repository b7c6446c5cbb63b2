use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};

use hublink_core::firmware::ChecksumKind;
use hublink_core::flasher::mock::MockOp;
use hublink_core::{
    ConnectionState, FirmwareArchive, FirmwareBackup, HubConfig, HubDescriptor, HubError, HubKind,
    HubRegistry, HubSession, LinkEvent, LinkObserver, LinkPhase, MockBootloader, MockTransport,
    Precompiled, TargetInfo,
};
use zip::write::SimpleFileOptions;

const METADATA: &str = r#"{
    "metadata-version": "2.1.0",
    "firmware-version": "v3.5.0",
    "device-id": 129,
    "checksum-type": "crc32",
    "checksum-size": 4096,
    "hub-name-offset": 8,
    "hub-name-size": 16
}"#;

#[derive(Default)]
struct Collector {
    events: Mutex<Vec<LinkEvent>>,
}

impl LinkObserver for Collector {
    fn on_event(&self, event: &LinkEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

impl Collector {
    fn phases(&self) -> Vec<LinkPhase> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                LinkEvent::PhaseChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }
}

fn session(observer: Arc<Collector>) -> HubSession {
    HubSession::with_observer(HubConfig::default(), observer).with_registry(HubRegistry::new())
}

fn archive() -> FirmwareArchive {
    let mut buf = Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buf);
        let options = SimpleFileOptions::default();
        let base: Vec<u8> = (0..1020u32).map(|i| (i % 200) as u8).collect();
        zip.start_file("firmware-base.bin", options).unwrap();
        zip.write_all(&base).unwrap();
        zip.start_file("firmware.metadata.json", options).unwrap();
        zip.write_all(METADATA.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    buf.set_position(0);
    FirmwareArchive::from_reader(buf).unwrap()
}

fn prime(flash_size: usize) -> TargetInfo {
    TargetInfo {
        hub_kind: Some(HubKind::TechnicLarge),
        flash_base: 0x0800_8000,
        flash_size,
        block_size: 256,
        checksum: Some(ChecksumKind::Crc32),
        version: None,
    }
}

#[tokio::test]
async fn run_program_end_to_end() {
    let hub = MockTransport::new("1.3.0");
    hub.script_output(&[b"Hello from the hub\n"], true);
    let observer = Arc::new(Collector::default());

    let mut printed = Vec::new();
    let outcome = session(observer.clone())
        .run_program_with(HubDescriptor::mock("technic"), hub.clone(), &[0x4D; 300], |out| {
            printed.extend_from_slice(out)
        })
        .await
        .unwrap();

    assert!(outcome.completed);
    assert_eq!(outcome.transfer.bytes, 300);
    assert_eq!(printed, b"Hello from the hub\n");
    assert_eq!(&hub.ram()[..300], &[0x4D; 300][..]);
    assert!(hub.is_closed());
    assert!(observer.phases().contains(&LinkPhase::Running));
}

#[tokio::test]
async fn flash_archive_end_to_end() {
    let observer = Arc::new(Collector::default());
    let session = session(observer.clone());
    let image = archive()
        .build(&Precompiled(Vec::new()), Some("arena"))
        .await
        .unwrap();
    assert_eq!(image.len(), 1024);
    assert_eq!(&image.as_bytes()[8..14], b"arena\0");

    let bootloader = MockBootloader::new(prime(8192));
    let report = session.flash_with(bootloader.clone(), &image).await.unwrap();

    assert_eq!(report.bytes, 1024);
    assert_eq!(report.blocks, 4);
    assert!(report.verified);
    assert_eq!(&bootloader.flash()[..1024], image.as_bytes());
    assert_eq!(
        observer.phases(),
        vec![
            LinkPhase::Erasing,
            LinkPhase::Programming,
            LinkPhase::Verifying,
            LinkPhase::Complete
        ]
    );
}

#[tokio::test]
async fn flash_refuses_image_larger_than_region() {
    let session = session(Arc::new(Collector::default()));
    let image = archive().build(&Precompiled(Vec::new()), None).await.unwrap();
    let bootloader = MockBootloader::new(prime(512));

    let err = session.flash_with(bootloader.clone(), &image).await.unwrap_err();
    assert!(matches!(
        err,
        HubError::SizeMismatch {
            image: 1024,
            region: 512
        }
    ));
    assert_eq!(bootloader.ops(), vec![MockOp::Info]);
}

#[tokio::test]
async fn backup_file_restores_original_firmware() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("original.bin");
    let original: Vec<u8> = (0..4096u32).map(|i| (i * 31 % 256) as u8).collect();
    let bootloader = MockBootloader::new(prime(4096)).with_flash(original.clone());
    let session = session(Arc::new(Collector::default()));

    session
        .backup_with(bootloader.clone())
        .await
        .unwrap()
        .save(&path)
        .unwrap();
    assert!(!bootloader.erase_called());

    let image = archive().build(&Precompiled(Vec::new()), None).await.unwrap();
    session.flash_with(bootloader.clone(), &image).await.unwrap();
    assert_ne!(bootloader.flash(), original);

    let backup = FirmwareBackup::load(&path).unwrap();
    session.restore_with(bootloader.clone(), &backup).await.unwrap();
    assert_eq!(bootloader.flash(), original);

    let truncated = FirmwareBackup::new(original[..4000].to_vec());
    let err = session.restore_with(bootloader, &truncated).await.unwrap_err();
    assert!(matches!(err, HubError::SizeMismatch { .. }));
}

#[tokio::test]
async fn second_connection_to_same_hub_is_rejected() {
    let registry = HubRegistry::new();
    let mut first = hublink_core::Connection::with_registry(
        HubDescriptor::mock("shared"),
        MockTransport::new("1.2.0"),
        HubConfig::default(),
        &registry,
    )
    .unwrap();
    first.establish().await.unwrap();
    assert_eq!(first.state(), ConnectionState::Ready);

    let session = HubSession::with_observer(HubConfig::default(), Arc::new(Collector::default()))
        .with_registry(registry.clone());
    let err = session
        .run_program_with(HubDescriptor::mock("shared"), MockTransport::new("1.2.0"), b"x", |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::AlreadyConnected(_)));

    first.disconnect().await.unwrap();
    assert!(!registry.is_held("shared"));
}
