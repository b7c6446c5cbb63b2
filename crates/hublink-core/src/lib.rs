//! Hublink-Core: link and firmware engine for Pybricks-compatible hubs.
//!
//! This crate connects to programmable hubs over BLE, USB or a serial port,
//! downloads and runs programs on them, and builds, flashes, backs up and
//! restores firmware through their bootloaders.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Pure codecs for advertisements, command/event frames and bootloader frames
//! - **Transport**: Medium abstraction (btleplug, nusb, tokio-serial, mock)
//! - **State**: Connection state machine and the inbound frame dispatcher
//! - **Connection**: One live session per hub address
//! - **Transfer**: Chunked, acknowledged, checksummed transfers
//! - **Firmware**: Metadata, image assembly and `firmware.zip` archives
//! - **Flasher**: Erase/program/verify and backup/restore over a bootloader
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use hublink_core::{HubConfig, HubFilter, HubSession};
//!
//! # async fn demo() -> Result<(), hublink_core::HubError> {
//! let session = HubSession::new(HubConfig::default());
//! let hub = session.find_hub(HubFilter::new(Some("Pybricks Hub".into()))).await?;
//! let program = std::fs::read("main.mpy")?;
//! session
//!     .run_program(hub, &program, |out| print!("{}", String::from_utf8_lossy(out)))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod events;
pub mod firmware;
pub mod flasher;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transfer;
pub mod transport;

// Re-exports for convenience
pub use config::{HubConfig, UsbDfuConfig};
pub use connection::{Connection, HubRegistry};
pub use discovery::{HubDescriptor, HubFilter, Medium, Scanner};
pub use error::HubError;
pub use events::{LinkEvent, LinkObserver, LinkPhase, LogLevel, NullObserver, TracingObserver};
pub use firmware::{
    FirmwareArchive, FirmwareBuilder, FirmwareError, FirmwareImage, FirmwareMetadata, MpyCross,
    Precompiled, ScriptCompiler,
};
pub use flasher::{
    Bootloader, BootloaderPhase, DfuSe, FirmwareBackup, FlashError, FlashReport, Flasher,
    Lwp3Bootloader, MockBootloader, TargetInfo,
};
pub use protocol::{Advertisement, Capabilities, CodecError, HubKind};
pub use session::{FlashTarget, HubSession, RunOutcome};
pub use state::{ConnectionState, HubEvent};
pub use transfer::{TransferConfig, TransferError, TransferReport, TransferSession};
pub use transport::{HubTransport, MockTransport, Transport, TransportError};
