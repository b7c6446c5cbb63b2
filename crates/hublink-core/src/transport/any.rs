//! Runtime selection between transport media.

use tokio::sync::mpsc;

use super::ble::BleTransport;
use super::mock::MockTransport;
use super::serial::SerialTransport;
use super::traits::{Attribute, LinkParams, Transport, TransportError};
use super::usb::UsbTransport;
use crate::discovery::HubDescriptor;

/// One variant per medium, dispatching to the concrete implementation.
pub enum HubTransport {
    Ble(BleTransport),
    Usb(UsbTransport),
    Serial(SerialTransport),
    Mock(MockTransport),
}

macro_rules! dispatch {
    ($self:expr, $t:ident => $body:expr) => {
        match $self {
            HubTransport::Ble($t) => $body,
            HubTransport::Usb($t) => $body,
            HubTransport::Serial($t) => $body,
            HubTransport::Mock($t) => $body,
        }
    };
}

impl Transport for HubTransport {
    async fn open(&mut self, hub: &HubDescriptor) -> Result<LinkParams, TransportError> {
        dispatch!(self, t => t.open(hub).await)
    }

    async fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
        dispatch!(self, t => t.write(frame).await)
    }

    async fn subscribe(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        dispatch!(self, t => t.subscribe().await)
    }

    async fn read_attribute(&self, attribute: Attribute) -> Result<Vec<u8>, TransportError> {
        dispatch!(self, t => t.read_attribute(attribute).await)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        dispatch!(self, t => t.close().await)
    }

    fn link(&self) -> LinkParams {
        dispatch!(self, t => t.link())
    }

    fn is_open(&self) -> bool {
        dispatch!(self, t => t.is_open())
    }
}

impl From<MockTransport> for HubTransport {
    fn from(t: MockTransport) -> Self {
        HubTransport::Mock(t)
    }
}

impl From<BleTransport> for HubTransport {
    fn from(t: BleTransport) -> Self {
        HubTransport::Ble(t)
    }
}

impl From<UsbTransport> for HubTransport {
    fn from(t: UsbTransport) -> Self {
        HubTransport::Usb(t)
    }
}

impl From<SerialTransport> for HubTransport {
    fn from(t: SerialTransport) -> Self {
        HubTransport::Serial(t)
    }
}
