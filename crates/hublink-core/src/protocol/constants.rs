//! Protocol constants for LEGO Wireless Protocol v3 and Pybricks hubs.
//!
//! Derived from the LWP3 documentation and the Pybricks BLE profile.

use uuid::Uuid;

// ============================================================================
// Company / USB identification
// ============================================================================

/// LEGO System A/S Bluetooth SIG company identifier.
pub const LEGO_CID: u16 = 0x0397;

/// LEGO USB vendor ID
pub const LEGO_VENDOR_ID: u16 = 0x0694;

/// SPIKE Prime hub in DFU mode
pub const SPIKE_PRIME_DFU_PID: u16 = 0x0008;
/// MINDSTORMS Robot Inventor hub in DFU mode
pub const MINDSTORMS_INVENTOR_DFU_PID: u16 = 0x0011;

/// All DFU product IDs for device discovery
pub const DFU_PIDS: &[u16] = &[SPIKE_PRIME_DFU_PID, MINDSTORMS_INVENTOR_DFU_PID];

/// SPIKE Prime hub running Pybricks firmware (USB)
pub const SPIKE_PRIME_PYBRICKS_PID: u16 = 0x0009;
/// SPIKE Essential hub running Pybricks firmware (USB)
pub const SPIKE_ESSENTIAL_PYBRICKS_PID: u16 = 0x000C;
/// MINDSTORMS Robot Inventor hub running Pybricks firmware (USB)
pub const MINDSTORMS_INVENTOR_PYBRICKS_PID: u16 = 0x0010;

/// USB product IDs that expose the Pybricks interface
pub const PYBRICKS_USB_PIDS: &[u16] = &[
    SPIKE_PRIME_PYBRICKS_PID,
    SPIKE_ESSENTIAL_PYBRICKS_PID,
    MINDSTORMS_INVENTOR_PYBRICKS_PID,
];

// ============================================================================
// Flash layout (STM32F413 based hubs)
// ============================================================================

/// Firmware start address, after the 32 KiB LEGO bootloader
pub const DFU_FIRMWARE_ADDRESS: u32 = 0x0800_8000;
/// Size of the firmware region (1 MiB - 32 KiB)
pub const DFU_FIRMWARE_SIZE: usize = 1024 * 1024 - 32 * 1024;
/// Default DFU transfer size
pub const DFU_TRANSFER_SIZE: usize = 2048;

// ============================================================================
// GATT UUIDs
// ============================================================================

const fn lwp3_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_1212_efde_1623_785f_eabc_d123)
}

const fn pybricks_uuid(short: u16) -> Uuid {
    Uuid::from_u128(0xc5f5_0000_8280_46da_89f4_6d80_51e4_aeef | ((short as u128) << 96))
}

const fn standard_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

/// LWP3 hub service (official LEGO firmware)
pub const LWP3_HUB_SERVICE_UUID: Uuid = lwp3_uuid(0x1623);
/// LWP3 hub characteristic
pub const LWP3_HUB_CHARACTERISTIC_UUID: Uuid = lwp3_uuid(0x1624);
/// LWP3 bootloader service
pub const LWP3_BOOTLOADER_SERVICE_UUID: Uuid = lwp3_uuid(0x1625);
/// LWP3 bootloader characteristic
pub const LWP3_BOOTLOADER_CHARACTERISTIC_UUID: Uuid = lwp3_uuid(0x1626);

/// Pybricks GATT service
pub const PYBRICKS_SERVICE_UUID: Uuid = pybricks_uuid(0x0001);
/// Pybricks command/event characteristic
pub const PYBRICKS_COMMAND_EVENT_UUID: Uuid = pybricks_uuid(0x0002);
/// Pybricks hub capabilities characteristic (protocol >= 1.2.0)
pub const PYBRICKS_HUB_CAPABILITIES_UUID: Uuid = pybricks_uuid(0x0003);

/// Device Information Service
pub const DI_SERVICE_UUID: Uuid = standard_uuid(0x180A);
/// Firmware Revision String
pub const FW_REV_UUID: Uuid = standard_uuid(0x2A26);
/// Software Revision String (Pybricks protocol version)
pub const SW_REV_UUID: Uuid = standard_uuid(0x2A28);
/// PnP ID
pub const PNP_ID_UUID: Uuid = standard_uuid(0x2A50);

// ============================================================================
// Pybricks USB interface
// ============================================================================

/// bRequest for standard GATT characteristics (wValue = 16-bit UUID)
pub const USB_REQ_GATT_CHARACTERISTIC: u8 = 0x01;
/// bRequest for Pybricks characteristics (wValue = 16-bit short UUID)
pub const USB_REQ_PYBRICKS_CHARACTERISTIC: u8 = 0x02;
/// Maximum control transfer payload for characteristic reads
pub const USB_MAX_CHARACTERISTIC_SIZE: usize = 20;

/// IN endpoint message: response to a command
pub const USB_IN_RESPONSE: u8 = 0x01;
/// IN endpoint message: event notification
pub const USB_IN_EVENT: u8 = 0x02;
/// OUT endpoint message: subscribe to events
pub const USB_OUT_SUBSCRIBE: u8 = 0x01;
/// OUT endpoint message: command
pub const USB_OUT_COMMAND: u8 = 0x02;

// ============================================================================
// Link sizing
// ============================================================================

/// Smallest BLE ATT payload (MTU 23 - 3 byte header).
pub const MIN_BLE_WRITE_SIZE: usize = 20;
/// Conservative write size for hubs other than the Move hub.
pub const DEFAULT_BLE_WRITE_SIZE: usize = 158;
/// Full-speed bulk packet size
pub const USB_BULK_PACKET_SIZE: usize = 64;

/// Minimum supported Pybricks protocol (inclusive)
pub const MIN_PROTOCOL_VERSION: semver::Version = semver::Version::new(1, 0, 0);
/// First unsupported Pybricks protocol (exclusive)
pub const MAX_PROTOCOL_VERSION: semver::Version = semver::Version::new(2, 0, 0);
/// Protocol version that introduced the capabilities characteristic
pub const CAPABILITIES_PROTOCOL_VERSION: semver::Version = semver::Version::new(1, 2, 0);
