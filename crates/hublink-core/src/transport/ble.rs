//! btleplug-based BLE transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use btleplug::api::{Central, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use futures::stream::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::traits::{Attribute, LinkParams, Transport, TransportError, check_frame};
use crate::discovery::HubDescriptor;
use crate::protocol::HubKind;
use crate::protocol::constants::{
    DEFAULT_BLE_WRITE_SIZE, FW_REV_UUID, LWP3_BOOTLOADER_CHARACTERISTIC_UUID,
    LWP3_HUB_CHARACTERISTIC_UUID, MIN_BLE_WRITE_SIZE, PNP_ID_UUID, PYBRICKS_COMMAND_EVENT_UUID,
    PYBRICKS_HUB_CAPABILITIES_UUID, SW_REV_UUID,
};

const NOTIFY_CAPACITY: usize = 256;

/// Which characteristics carry writes and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattProfile {
    pub write_characteristic: Uuid,
    pub notify_characteristic: Uuid,
    pub with_response: bool,
}

impl GattProfile {
    /// Pybricks command/event characteristic.
    pub fn pybricks() -> Self {
        Self {
            write_characteristic: PYBRICKS_COMMAND_EVENT_UUID,
            notify_characteristic: PYBRICKS_COMMAND_EVENT_UUID,
            with_response: true,
        }
    }

    /// LWP3 hub characteristic of official LEGO firmware. Linux loses City
    /// hub writes unless they are acknowledged.
    pub fn lwp3_hub(hub_kind: HubKind) -> Self {
        Self {
            write_characteristic: LWP3_HUB_CHARACTERISTIC_UUID,
            notify_characteristic: LWP3_HUB_CHARACTERISTIC_UUID,
            with_response: hub_kind == HubKind::City,
        }
    }

    /// LWP3 bootloader characteristic. The City hub bootloader answers every
    /// write, so it needs write-with-response.
    pub fn lwp3_bootloader(hub_kind: HubKind) -> Self {
        Self {
            write_characteristic: LWP3_BOOTLOADER_CHARACTERISTIC_UUID,
            notify_characteristic: LWP3_BOOTLOADER_CHARACTERISTIC_UUID,
            with_response: hub_kind == HubKind::City,
        }
    }
}

/// BLE transport over a btleplug adapter.
pub struct BleTransport {
    adapter: Adapter,
    profile: GattProfile,
    peripheral: Option<Peripheral>,
    link: LinkParams,
    closed: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
}

impl BleTransport {
    pub fn new(adapter: Adapter, profile: GattProfile) -> Self {
        Self {
            adapter,
            profile,
            peripheral: None,
            link: LinkParams::default(),
            closed: Arc::new(AtomicBool::new(false)),
            pump: None,
        }
    }

    async fn find_peripheral(&self, hub: &HubDescriptor) -> Result<Peripheral, TransportError> {
        for peripheral in self.adapter.peripherals().await? {
            if let Some(props) = peripheral.properties().await?
                && props.address.to_string() == hub.address
            {
                return Ok(peripheral);
            }
        }
        Err(TransportError::DeviceNotFound(hub.address.clone()))
    }

    fn peripheral(&self) -> Result<&Peripheral, TransportError> {
        self.peripheral.as_ref().ok_or(TransportError::NotOpen)
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, TransportError> {
        self.peripheral()?
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(TransportError::CharacteristicNotFound(uuid))
    }
}

impl Transport for BleTransport {
    #[instrument(skip(self, hub), fields(address = %hub.address))]
    async fn open(&mut self, hub: &HubDescriptor) -> Result<LinkParams, TransportError> {
        let peripheral = self.find_peripheral(hub).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        peripheral.discover_services().await?;

        // btleplug does not expose the negotiated MTU; the Move hub is
        // limited to the minimum ATT payload.
        let max_write_size = if hub.hub_kind == HubKind::Boost {
            MIN_BLE_WRITE_SIZE
        } else {
            DEFAULT_BLE_WRITE_SIZE
        };
        self.link = LinkParams {
            max_write_size,
            min_write_interval: None,
        };
        self.closed.store(false, Ordering::SeqCst);
        self.peripheral = Some(peripheral);
        info!(max_write_size, "BLE link open");
        Ok(self.link)
    }

    async fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
        check_frame(frame, &self.link)?;
        let characteristic = self.characteristic(self.profile.write_characteristic)?;
        let write_type = if self.profile.with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral()?
            .write(&characteristic, frame, write_type)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    async fn subscribe(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        let characteristic = self.characteristic(self.profile.notify_characteristic)?;
        let peripheral = self.peripheral()?.clone();
        let mut notifications = peripheral.notifications().await?;
        peripheral.subscribe(&characteristic).await?;

        let (tx, rx) = mpsc::channel(NOTIFY_CAPACITY);
        let closed = self.closed.clone();
        let uuid = characteristic.uuid;
        self.pump = Some(tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                if notification.uuid != uuid {
                    continue;
                }
                if tx.send(notification.value).await.is_err() {
                    break;
                }
            }
            debug!("BLE notification stream ended");
        }));
        Ok(rx)
    }

    async fn read_attribute(&self, attribute: Attribute) -> Result<Vec<u8>, TransportError> {
        let uuid = match attribute {
            Attribute::ProtocolVersion => SW_REV_UUID,
            Attribute::HubCapabilities => PYBRICKS_HUB_CAPABILITIES_UUID,
            Attribute::PnpId => PNP_ID_UUID,
            Attribute::FirmwareVersion => FW_REV_UUID,
        };
        let characteristic = self
            .characteristic(uuid)
            .map_err(|_| TransportError::AttributeUnavailable(attribute))?;
        Ok(self.peripheral()?.read(&characteristic).await?)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(peripheral) = self.peripheral.take()
            && let Err(e) = peripheral.disconnect().await
        {
            warn!(error = %e, "BLE disconnect failed");
        }
        Ok(())
    }

    fn link(&self) -> LinkParams {
        self.link
    }

    fn is_open(&self) -> bool {
        self.peripheral.is_some() && !self.closed.load(Ordering::SeqCst)
    }
}
