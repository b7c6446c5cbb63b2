//! Transport layer module.

pub mod any;
pub mod ble;
pub mod mock;
pub mod observed;
pub mod serial;
pub mod traits;
pub mod usb;

pub use any::HubTransport;
pub use ble::{BleTransport, GattProfile};
pub use mock::MockTransport;
pub use observed::ObservedTransport;
pub use serial::SerialTransport;
pub use traits::{Attribute, LinkParams, Transport, TransportError};
pub use usb::UsbTransport;
