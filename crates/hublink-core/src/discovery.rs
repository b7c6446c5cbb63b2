//! Hub discovery: descriptors, filters and scanning.

use std::collections::HashSet;
use std::pin::Pin;
use std::time::Duration;

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager};
use futures::stream::{Stream, StreamExt};
use nusb::MaybeFuture;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::error::HubError;
use crate::protocol::constants::{
    MINDSTORMS_INVENTOR_PYBRICKS_PID, SPIKE_ESSENTIAL_PYBRICKS_PID, SPIKE_PRIME_PYBRICKS_PID,
};
use crate::protocol::{Advertisement, HubKind, RawAdvertisement};
use crate::transport::TransportError;
use crate::transport::usb::{UsbTransport, list_pybricks_devices};

/// Medium a hub was discovered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Medium {
    Ble,
    /// Pybricks USB interface
    Usb,
    /// USB DFU bootloader
    UsbDfu,
    Serial,
    Mock,
}

/// Identity of a discovered hub. Captured once per scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubDescriptor {
    pub address: String,
    pub name: Option<String>,
    pub hub_kind: HubKind,
    pub bootloader: bool,
    /// Running official LEGO firmware rather than Pybricks.
    pub official_firmware: bool,
    pub protocol_version: Option<semver::Version>,
    pub revision: Option<u16>,
    pub rssi: Option<i16>,
    pub medium: Medium,
}

impl HubDescriptor {
    pub fn from_advertisement(
        address: impl Into<String>,
        name: Option<String>,
        rssi: Option<i16>,
        adv: &Advertisement,
    ) -> Self {
        Self {
            address: address.into(),
            name,
            hub_kind: adv.hub_kind,
            bootloader: adv.is_bootloader(),
            official_firmware: adv.is_lwp3_hub(),
            protocol_version: adv.protocol_version(),
            revision: adv.hub_revision(),
            rssi,
            medium: Medium::Ble,
        }
    }

    /// Descriptor for a simulated hub.
    pub fn mock(address: &str) -> Self {
        Self {
            address: address.to_string(),
            name: Some(address.to_string()),
            hub_kind: HubKind::TechnicLarge,
            bootloader: false,
            official_firmware: false,
            protocol_version: None,
            revision: None,
            rssi: None,
            medium: Medium::Mock,
        }
    }

    /// Descriptor for a serial port.
    pub fn serial(port: &str, hub_kind: HubKind) -> Self {
        Self {
            address: port.to_string(),
            name: None,
            hub_kind,
            bootloader: false,
            official_firmware: false,
            protocol_version: None,
            revision: None,
            rssi: None,
            medium: Medium::Serial,
        }
    }
}

/// Optional name/address filter for scans.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubFilter {
    pub name_or_address: Option<String>,
    /// Only accept hubs in (or not in) bootloader mode.
    pub bootloader: Option<bool>,
}

impl HubFilter {
    pub fn new(name_or_address: Option<String>) -> Self {
        Self {
            name_or_address,
            bootloader: None,
        }
    }

    pub fn bootloader() -> Self {
        Self {
            name_or_address: None,
            bootloader: Some(true),
        }
    }

    pub fn matches(&self, hub: &HubDescriptor) -> bool {
        if let Some(want) = self.bootloader
            && want != hub.bootloader
        {
            return false;
        }
        match &self.name_or_address {
            None => true,
            Some(target) => {
                hub.address.eq_ignore_ascii_case(target) || hub.name.as_deref() == Some(target)
            }
        }
    }

    /// A targeted filter ends the scan at its first match.
    pub fn is_targeted(&self) -> bool {
        self.name_or_address.is_some() || self.bootloader.is_some()
    }
}

/// BLE scanner over the first system adapter.
#[derive(Clone)]
pub struct Scanner {
    adapter: Adapter,
}

struct ScanState {
    adapter: Adapter,
    events: Pin<Box<dyn Stream<Item = CentralEvent> + Send>>,
    filter: HubFilter,
    deadline: Instant,
    seen: HashSet<String>,
    done: bool,
}

impl Scanner {
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::DeviceNotFound("no Bluetooth adapter".into()))?;
        Ok(Self { adapter })
    }

    pub fn adapter(&self) -> Adapter {
        self.adapter.clone()
    }

    /// Start a scan. The returned stream yields each usable hub matching
    /// `filter` once, and ends at the first match of a targeted filter or
    /// when `timeout` elapses. Calling `scan` again restarts discovery.
    pub async fn scan(
        &self,
        filter: HubFilter,
        timeout: Duration,
    ) -> Result<impl Stream<Item = HubDescriptor> + Send + 'static, TransportError> {
        let events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;
        info!(timeout_ms = timeout.as_millis() as u64, "Scanning for hubs");

        let state = ScanState {
            adapter: self.adapter.clone(),
            events,
            filter,
            deadline: Instant::now() + timeout,
            seen: HashSet::new(),
            done: false,
        };
        Ok(futures::stream::unfold(state, |mut st| async move {
            if st.done {
                let _ = st.adapter.stop_scan().await;
                return None;
            }
            loop {
                let event = match tokio::time::timeout_at(st.deadline, st.events.next()).await {
                    Ok(Some(event)) => event,
                    _ => {
                        debug!("Scan finished");
                        let _ = st.adapter.stop_scan().await;
                        return None;
                    }
                };
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(peripheral) = st.adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                let raw = RawAdvertisement {
                    services: props.services.clone(),
                    manufacturer_data: props.manufacturer_data.clone(),
                    service_data: props.service_data.clone(),
                };
                let adv = match Advertisement::decode(&raw) {
                    Ok(adv) => adv,
                    Err(e) => {
                        trace!(address = %props.address, error = %e, "Ignoring device");
                        continue;
                    }
                };
                let hub = HubDescriptor::from_advertisement(
                    props.address.to_string(),
                    props.local_name.clone(),
                    props.rssi,
                    &adv,
                );
                if !st.filter.matches(&hub) || !st.seen.insert(hub.address.clone()) {
                    continue;
                }
                if st.filter.is_targeted() {
                    st.done = true;
                }
                return Some((hub, st));
            }
        }))
    }

    /// First hub matching `filter`, or `NotFound` after `timeout`.
    pub async fn find_hub(
        &self,
        filter: HubFilter,
        timeout: Duration,
    ) -> Result<HubDescriptor, HubError> {
        let label = filter
            .name_or_address
            .clone()
            .unwrap_or_else(|| "any hub".to_string());
        let stream = self.scan(filter, timeout).await?;
        futures::pin_mut!(stream);
        stream.next().await.ok_or(HubError::NotFound(label))
    }
}

/// Hubs waiting in USB DFU mode.
pub fn list_dfu_devices(
    vendor_id: u16,
    product_ids: &[u16],
) -> Result<Vec<HubDescriptor>, TransportError> {
    Ok(nusb::list_devices()
        .wait()
        .map_err(|e| TransportError::OpenFailed(e.to_string()))?
        .filter(|d| d.vendor_id() == vendor_id && product_ids.contains(&d.product_id()))
        .map(|d| HubDescriptor {
            address: UsbTransport::device_address(&d),
            name: d.product_string().map(str::to_string),
            hub_kind: HubKind::TechnicLarge,
            bootloader: true,
            official_firmware: false,
            protocol_version: None,
            revision: None,
            rssi: None,
            medium: Medium::UsbDfu,
        })
        .collect())
}

/// Hubs running Pybricks with the USB interface enabled.
pub fn list_usb_hubs() -> Result<Vec<HubDescriptor>, TransportError> {
    Ok(list_pybricks_devices()?
        .into_iter()
        .filter_map(|d| {
            let hub_kind = match d.product_id() {
                SPIKE_PRIME_PYBRICKS_PID | MINDSTORMS_INVENTOR_PYBRICKS_PID => {
                    HubKind::TechnicLarge
                }
                SPIKE_ESSENTIAL_PYBRICKS_PID => HubKind::TechnicSmall,
                _ => return None,
            };
            Some(HubDescriptor {
                address: UsbTransport::device_address(&d),
                name: d.product_string().map(str::to_string),
                hub_kind,
                bootloader: false,
                official_firmware: false,
                protocol_version: None,
                revision: None,
                rssi: None,
                medium: Medium::Usb,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub(address: &str, name: Option<&str>, bootloader: bool) -> HubDescriptor {
        HubDescriptor {
            address: address.into(),
            name: name.map(str::to_string),
            hub_kind: HubKind::City,
            bootloader,
            official_firmware: false,
            protocol_version: None,
            revision: None,
            rssi: None,
            medium: Medium::Ble,
        }
    }

    #[test]
    fn test_filter_by_name_or_address() {
        let h = hub("AA:BB:CC:DD:EE:FF", Some("Pybricks Hub"), false);
        assert!(HubFilter::default().matches(&h));
        assert!(HubFilter::new(Some("aa:bb:cc:dd:ee:ff".into())).matches(&h));
        assert!(HubFilter::new(Some("Pybricks Hub".into())).matches(&h));
        assert!(!HubFilter::new(Some("Other".into())).matches(&h));
        assert!(!HubFilter::bootloader().matches(&h));
        assert!(HubFilter::bootloader().matches(&hub("x", None, true)));
    }

    #[test]
    fn test_descriptor_from_bootloader_advertisement() {
        let adv = Advertisement::decode_bootloader(&[0x07, 0x01, 0x00, 0x10, 0x40, 0x00]).unwrap();
        let d = HubDescriptor::from_advertisement("11:22:33:44:55:66", None, Some(-60), &adv);
        assert!(d.bootloader);
        assert!(!d.official_firmware);
        assert_eq!(d.hub_kind, HubKind::Boost);
        assert_eq!(d.protocol_version, Some(semver::Version::new(1, 0, 0)));
        assert_eq!(d.medium, Medium::Ble);
    }

    #[test]
    fn test_descriptor_from_official_firmware_advertisement() {
        let adv = Advertisement::decode_lwp3_hub(&[0x00, 0x41, 0x02, 0x00, 0x00, 0x00]).unwrap();
        let d = HubDescriptor::from_advertisement("11:22:33:44:55:66", None, None, &adv);
        assert!(d.official_firmware);
        assert!(!d.bootloader);
        assert_eq!(d.hub_kind, HubKind::City);
    }
}
