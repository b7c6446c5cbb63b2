//! nusb-based transport for hubs exposing the Pybricks USB interface.
//!
//! The interface mirrors the BLE profile: characteristics are read through
//! class control requests, commands go out on the bulk OUT endpoint prefixed
//! with a message type, and events come back on bulk IN.

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nusb::transfer::{Bulk, ControlIn, ControlType, In, Out, Recipient};
use nusb::{DeviceInfo, Interface, MaybeFuture, list_devices};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::traits::{Attribute, LinkParams, Transport, TransportError, check_frame};
use crate::discovery::HubDescriptor;
use crate::protocol::constants::{
    LEGO_VENDOR_ID, PYBRICKS_USB_PIDS, USB_BULK_PACKET_SIZE, USB_IN_EVENT, USB_IN_RESPONSE,
    USB_MAX_CHARACTERISTIC_SIZE, USB_OUT_COMMAND, USB_OUT_SUBSCRIBE, USB_REQ_GATT_CHARACTERISTIC,
    USB_REQ_PYBRICKS_CHARACTERISTIC,
};

const VENDOR_CLASS: u8 = 0xFF;
const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);
const NOTIFY_CAPACITY: usize = 256;

struct Endpoints {
    interface: Interface,
    number: u8,
    in_endpoint: u8,
    out_endpoint: u8,
}

/// Pybricks USB transport.
pub struct UsbTransport {
    endpoints: Option<Endpoints>,
    link: LinkParams,
    closed: Arc<AtomicBool>,
    responses: Option<Mutex<mpsc::Receiver<Vec<u8>>>>,
    pump: Option<JoinHandle<()>>,
}

impl Default for UsbTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport {
    pub fn new() -> Self {
        Self {
            endpoints: None,
            link: LinkParams {
                // one type byte is spent on every bulk message
                max_write_size: USB_BULK_PACKET_SIZE - 1,
                min_write_interval: None,
            },
            closed: Arc::new(AtomicBool::new(false)),
            responses: None,
            pump: None,
        }
    }

    /// Identity used as the descriptor address for a USB hub.
    pub fn device_address(info: &DeviceInfo) -> String {
        match info.serial_number() {
            Some(serial) => serial.to_string(),
            None => format!("usb-{:?}-{}", info.bus_id(), info.device_address()),
        }
    }

    fn endpoints(&self) -> Result<&Endpoints, TransportError> {
        self.endpoints.as_ref().ok_or(TransportError::NotOpen)
    }

    async fn write_raw(&self, message: Vec<u8>) -> Result<(), TransportError> {
        let endpoints = self.endpoints()?;
        let interface = endpoints.interface.clone();
        let address = endpoints.out_endpoint;
        tokio::task::spawn_blocking(move || {
            let ep = interface
                .endpoint::<Bulk, Out>(address)
                .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
            let mut writer = ep.writer(USB_BULK_PACKET_SIZE);
            writer
                .write_all(&message)
                .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
            writer
                .flush()
                .map_err(|e| TransportError::WriteFailed(e.to_string()))
        })
        .await
        .map_err(|e| TransportError::WriteFailed(e.to_string()))?
    }

    async fn await_response(&self) -> Result<(), TransportError> {
        let responses = self.responses.as_ref().ok_or(TransportError::NotOpen)?;
        let mut responses = responses.lock().await;
        let response = tokio::time::timeout(RESPONSE_TIMEOUT, responses.recv())
            .await
            .map_err(|_| TransportError::Timeout {
                timeout_ms: RESPONSE_TIMEOUT.as_millis() as u64,
            })?
            .ok_or(TransportError::Disconnected)?;
        match response.get(..4) {
            Some(status) if status == [0, 0, 0, 0] => Ok(()),
            Some(status) => Err(TransportError::WriteFailed(format!(
                "hub rejected command with status {:02X?}",
                status
            ))),
            None => Ok(()),
        }
    }
}

fn find_interface(info: &DeviceInfo) -> Option<u8> {
    info.interfaces()
        .find(|i| i.class() == VENDOR_CLASS)
        .map(|i| i.interface_number())
}

impl Transport for UsbTransport {
    #[instrument(skip(self, hub), fields(address = %hub.address))]
    async fn open(&mut self, hub: &HubDescriptor) -> Result<LinkParams, TransportError> {
        let info = list_devices()
            .await
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| {
                d.vendor_id() == LEGO_VENDOR_ID
                    && PYBRICKS_USB_PIDS.contains(&d.product_id())
                    && Self::device_address(d) == hub.address
            })
            .ok_or_else(|| TransportError::DeviceNotFound(hub.address.clone()))?;

        let number = find_interface(&info).ok_or(TransportError::ClaimInterfaceFailed {
            interface: 0,
            message: "no Pybricks interface".into(),
        })?;
        let device = info
            .open()
            .await
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        let interface =
            device
                .claim_interface(number)
                .await
                .map_err(|e| TransportError::ClaimInterfaceFailed {
                    interface: number,
                    message: e.to_string(),
                })?;

        let mut in_endpoint = 0u8;
        let mut out_endpoint = 0u8;
        for config in device.configurations() {
            for iface in config.interfaces() {
                if iface.interface_number() != number {
                    continue;
                }
                for alt in iface.alt_settings() {
                    for ep in alt.endpoints() {
                        if ep.transfer_type() == nusb::descriptors::TransferType::Bulk {
                            if ep.direction() == nusb::transfer::Direction::In {
                                in_endpoint = ep.address();
                            } else {
                                out_endpoint = ep.address();
                            }
                        }
                    }
                }
            }
        }
        if in_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                direction: "In".into(),
            });
        }
        if out_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                direction: "Out".into(),
            });
        }

        info!(
            in_ep = %format!("0x{:02X}", in_endpoint),
            out_ep = %format!("0x{:02X}", out_endpoint),
            "USB interface claimed"
        );
        self.endpoints = Some(Endpoints {
            interface,
            number,
            in_endpoint,
            out_endpoint,
        });
        self.closed.store(false, Ordering::SeqCst);
        Ok(self.link)
    }

    async fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
        check_frame(frame, &self.link)?;
        let mut message = Vec::with_capacity(frame.len() + 1);
        message.push(USB_OUT_COMMAND);
        message.extend_from_slice(frame);
        self.write_raw(message).await?;
        self.await_response().await
    }

    async fn subscribe(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        let endpoints = self.endpoints()?;
        let interface = endpoints.interface.clone();
        let address = endpoints.in_endpoint;
        let (event_tx, event_rx) = mpsc::channel(NOTIFY_CAPACITY);
        let (response_tx, response_rx) = mpsc::channel(8);
        let closed = self.closed.clone();

        self.pump = Some(tokio::task::spawn_blocking(move || {
            let ep = match interface.endpoint::<Bulk, In>(address) {
                Ok(ep) => ep,
                Err(e) => {
                    warn!(error = %e, "Failed to open IN endpoint");
                    return;
                }
            };
            let mut reader = ep.reader(USB_BULK_PACKET_SIZE);
            let mut buf = [0u8; USB_BULK_PACKET_SIZE];
            loop {
                let n = match reader.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => n,
                    Err(e) => {
                        debug!(error = %e, "USB read ended");
                        break;
                    }
                };
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                let sent = match buf[0] {
                    USB_IN_EVENT => event_tx.blocking_send(buf[1..n].to_vec()).is_ok(),
                    USB_IN_RESPONSE => response_tx.blocking_send(buf[1..n].to_vec()).is_ok(),
                    other => {
                        warn!(kind = other, "Unknown USB message type");
                        true
                    }
                };
                if !sent {
                    break;
                }
            }
        }));
        self.responses = Some(Mutex::new(response_rx));

        self.write_raw(vec![USB_OUT_SUBSCRIBE, 1]).await?;
        self.await_response().await?;
        Ok(event_rx)
    }

    async fn read_attribute(&self, attribute: Attribute) -> Result<Vec<u8>, TransportError> {
        let endpoints = self.endpoints()?;
        let (request, value) = match attribute {
            Attribute::ProtocolVersion => (USB_REQ_GATT_CHARACTERISTIC, 0x2A28),
            Attribute::FirmwareVersion => (USB_REQ_GATT_CHARACTERISTIC, 0x2A26),
            Attribute::PnpId => (USB_REQ_GATT_CHARACTERISTIC, 0x2A50),
            Attribute::HubCapabilities => (USB_REQ_PYBRICKS_CHARACTERISTIC, 0x0003),
        };
        endpoints
            .interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index: endpoints.number as u16,
                    length: USB_MAX_CHARACTERISTIC_SIZE as u16,
                },
                CONTROL_TIMEOUT,
            )
            .await
            .map_err(|e| TransportError::ReadFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.responses = None;
        self.endpoints = None;
        Ok(())
    }

    fn link(&self) -> LinkParams {
        self.link
    }

    fn is_open(&self) -> bool {
        self.endpoints.is_some() && !self.closed.load(Ordering::SeqCst)
    }
}

/// List connected hubs exposing the Pybricks USB interface.
pub fn list_pybricks_devices() -> Result<Vec<DeviceInfo>, TransportError> {
    Ok(list_devices()
        .wait()
        .map_err(|e| TransportError::OpenFailed(e.to_string()))?
        .filter(|d| d.vendor_id() == LEGO_VENDOR_ID && PYBRICKS_USB_PIDS.contains(&d.product_id()))
        .collect())
}
