//! Transport layer abstraction.
//!
//! Defines the [`Transport`] trait every medium implements (BLE, USB, serial,
//! mock). The connection and transfer engine are written against this trait
//! only and never hard-code medium limits: those come from [`LinkParams`].

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::discovery::HubDescriptor;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint not found: direction={direction}")]
    EndpointNotFound { direction: String },

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(uuid::Uuid),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Attribute {0:?} is not available on this transport")]
    AttributeUnavailable(Attribute),

    #[error("Transport is not open")]
    NotOpen,

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),

    #[error("Serial error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Medium limits reported once the transport is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkParams {
    /// Largest frame a single write may carry.
    pub max_write_size: usize,
    /// Minimum spacing between consecutive writes, when the medium needs pacing.
    pub min_write_interval: Option<Duration>,
}

impl Default for LinkParams {
    fn default() -> Self {
        Self {
            max_write_size: crate::protocol::constants::MIN_BLE_WRITE_SIZE,
            min_write_interval: None,
        }
    }
}

/// Identity and capability values readable after open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    /// Software revision string (protocol version)
    ProtocolVersion,
    /// Pybricks hub capabilities characteristic
    HubCapabilities,
    PnpId,
    /// Firmware revision string
    FirmwareVersion,
}

/// Abstract transport interface.
///
/// `close` is safe to call in any state, including after an error, and
/// guarantees that no frame is delivered on a subscription afterwards.
pub trait Transport: Send + Sync {
    /// Open the medium for `hub` and report its limits.
    fn open(
        &mut self,
        hub: &HubDescriptor,
    ) -> impl Future<Output = Result<LinkParams, TransportError>> + Send;

    /// Write one frame. Frames larger than `link().max_write_size` are rejected.
    fn write(&self, frame: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Start delivery of inbound frames, in wire order.
    fn subscribe(
        &mut self,
    ) -> impl Future<Output = Result<mpsc::Receiver<Vec<u8>>, TransportError>> + Send;

    fn read_attribute(
        &self,
        attribute: Attribute,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Limits reported by the last successful `open`.
    fn link(&self) -> LinkParams;

    fn is_open(&self) -> bool;
}

/// Reject frames the medium cannot carry in one write.
pub(crate) fn check_frame(frame: &[u8], link: &LinkParams) -> Result<(), TransportError> {
    if frame.len() > link.max_write_size {
        return Err(TransportError::WriteFailed(format!(
            "frame of {} bytes exceeds max write size {}",
            frame.len(),
            link.max_write_size
        )));
    }
    Ok(())
}
