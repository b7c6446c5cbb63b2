//! Application-level frames exchanged with a connected hub.
//!
//! Commands are written to the command/event characteristic (or the USB/serial
//! equivalent); events arrive as notifications. Frames have no length header,
//! so each event tag has a fixed or minimum length that is validated before
//! the payload is exposed.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use super::CodecError;
use super::hub::HubKind;

/// Host to hub commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StopUserProgram,
    StartUserProgram,
    StartRepl,
    /// Announce the size of the user program; 0 invalidates the stored program.
    WriteUserProgramMeta { size: u32 },
    /// Write program bytes at `offset` in user RAM.
    WriteUserRam { offset: u32, payload: Vec<u8> },
    RebootToUpdateMode,
    /// Bytes for the running program's stdin.
    WriteStdin { payload: Vec<u8> },
}

impl Command {
    pub const STOP_USER_PROGRAM: u8 = 0x00;
    pub const START_USER_PROGRAM: u8 = 0x01;
    pub const START_REPL: u8 = 0x02;
    pub const WRITE_USER_PROGRAM_META: u8 = 0x03;
    pub const WRITE_USER_RAM: u8 = 0x04;
    pub const REBOOT_TO_UPDATE_MODE: u8 = 0x05;
    pub const WRITE_STDIN: u8 = 0x06;

    /// Bytes of framing in a `WriteUserRam` command ahead of the payload.
    pub const WRITE_USER_RAM_HEADER: usize = 5;

    /// Encode the command, rejecting frames larger than `max_write_size`.
    pub fn encode(&self, max_write_size: usize) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::new();
        match self {
            Command::StopUserProgram => buf.push(Self::STOP_USER_PROGRAM),
            Command::StartUserProgram => buf.push(Self::START_USER_PROGRAM),
            Command::StartRepl => buf.push(Self::START_REPL),
            Command::WriteUserProgramMeta { size } => {
                buf.push(Self::WRITE_USER_PROGRAM_META);
                buf.extend_from_slice(&size.to_le_bytes());
            }
            Command::WriteUserRam { offset, payload } => {
                buf.push(Self::WRITE_USER_RAM);
                buf.extend_from_slice(&offset.to_le_bytes());
                buf.extend_from_slice(payload);
            }
            Command::RebootToUpdateMode => buf.push(Self::REBOOT_TO_UPDATE_MODE),
            Command::WriteStdin { payload } => {
                buf.push(Self::WRITE_STDIN);
                buf.extend_from_slice(payload);
            }
        }
        if buf.len() > max_write_size {
            return Err(CodecError::FrameTooLarge {
                len: buf.len(),
                max: max_write_size,
            });
        }
        Ok(buf)
    }

    /// Decode a command frame (used by hub simulators).
    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        let (&tag, body) = frame.split_first().ok_or(CodecError::Empty)?;
        let fixed = |expected: usize| {
            if body.len() != expected {
                Err(CodecError::LengthMismatch {
                    tag,
                    expected: expected + 1,
                    actual: frame.len(),
                })
            } else {
                Ok(())
            }
        };
        match tag {
            Self::STOP_USER_PROGRAM => fixed(0).map(|_| Command::StopUserProgram),
            Self::START_USER_PROGRAM => fixed(0).map(|_| Command::StartUserProgram),
            Self::START_REPL => fixed(0).map(|_| Command::StartRepl),
            Self::WRITE_USER_PROGRAM_META => {
                fixed(4)?;
                let size = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                Ok(Command::WriteUserProgramMeta { size })
            }
            Self::WRITE_USER_RAM => {
                if body.len() < 4 {
                    return Err(CodecError::LengthMismatch {
                        tag,
                        expected: Self::WRITE_USER_RAM_HEADER,
                        actual: frame.len(),
                    });
                }
                let offset = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                Ok(Command::WriteUserRam {
                    offset,
                    payload: body[4..].to_vec(),
                })
            }
            Self::REBOOT_TO_UPDATE_MODE => fixed(0).map(|_| Command::RebootToUpdateMode),
            Self::WRITE_STDIN => Ok(Command::WriteStdin {
                payload: body.to_vec(),
            }),
            other => Err(CodecError::UnknownTag(other)),
        }
    }
}

/// Hub status flags carried by status reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusFlags(pub u32);

impl StatusFlags {
    pub const BATTERY_LOW_VOLTAGE_WARNING: u32 = 1 << 0;
    pub const BATTERY_LOW_VOLTAGE_SHUTDOWN: u32 = 1 << 1;
    pub const BATTERY_HIGH_CURRENT: u32 = 1 << 2;
    pub const BLE_ADVERTISING: u32 = 1 << 3;
    pub const BLE_LOW_SIGNAL: u32 = 1 << 4;
    pub const POWER_BUTTON_PRESSED: u32 = 1 << 5;
    pub const USER_PROGRAM_RUNNING: u32 = 1 << 6;
    pub const SHUTDOWN: u32 = 1 << 7;
    pub const SHUTDOWN_REQUESTED: u32 = 1 << 8;

    pub fn contains(&self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    pub fn program_running(&self) -> bool {
        self.contains(Self::USER_PROGRAM_RUNNING)
    }
}

/// Hub to host events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    StatusReport(StatusFlags),
    WriteStdout(Vec<u8>),
    /// Acknowledgement of a `WriteUserRam` chunk with the CRC32 the hub computed.
    ChunkAck { offset: u32, checksum: u32 },
}

impl Event {
    pub const STATUS_REPORT: u8 = 0x00;
    pub const WRITE_STDOUT: u8 = 0x01;
    pub const CHUNK_ACK: u8 = 0x02;

    const STATUS_REPORT_LEN: usize = 5;
    const CHUNK_ACK_LEN: usize = 9;

    /// Decode an event, validating tag and length before exposing the payload.
    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        let (&tag, body) = frame.split_first().ok_or(CodecError::Empty)?;
        let mut cursor = Cursor::new(body);
        match tag {
            Self::STATUS_REPORT => {
                check_len(tag, Self::STATUS_REPORT_LEN, frame.len())?;
                let flags = cursor.read_u32::<LittleEndian>()?;
                Ok(Event::StatusReport(StatusFlags(flags)))
            }
            Self::WRITE_STDOUT => {
                if body.is_empty() {
                    return Err(CodecError::LengthMismatch {
                        tag,
                        expected: 2,
                        actual: frame.len(),
                    });
                }
                Ok(Event::WriteStdout(body.to_vec()))
            }
            Self::CHUNK_ACK => {
                check_len(tag, Self::CHUNK_ACK_LEN, frame.len())?;
                let offset = cursor.read_u32::<LittleEndian>()?;
                let checksum = cursor.read_u32::<LittleEndian>()?;
                Ok(Event::ChunkAck { offset, checksum })
            }
            other => Err(CodecError::UnknownTag(other)),
        }
    }

    /// Encode an event (used by hub simulators).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Event::StatusReport(flags) => {
                buf.push(Self::STATUS_REPORT);
                buf.extend_from_slice(&flags.0.to_le_bytes());
            }
            Event::WriteStdout(data) => {
                buf.push(Self::WRITE_STDOUT);
                buf.extend_from_slice(data);
            }
            Event::ChunkAck { offset, checksum } => {
                buf.push(Self::CHUNK_ACK);
                buf.extend_from_slice(&offset.to_le_bytes());
                buf.extend_from_slice(&checksum.to_le_bytes());
            }
        }
        buf
    }
}

fn check_len(tag: u8, expected: usize, actual: usize) -> Result<(), CodecError> {
    if expected != actual {
        return Err(CodecError::LengthMismatch {
            tag,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Hub feature flags from the capabilities characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureFlags(pub u32);

impl FeatureFlags {
    pub const HAS_REPL: u32 = 1 << 0;
    pub const USER_PROG_MULTI_FILE_MPY6: u32 = 1 << 1;

    pub fn contains(&self, flag: u32) -> bool {
        self.0 & flag == flag
    }
}

/// Negotiated hub capabilities. Fixed for the lifetime of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub protocol_version: semver::Version,
    pub max_write_size: usize,
    pub features: FeatureFlags,
    /// Largest user program the hub accepts, when reported.
    pub max_program_size: Option<usize>,
    /// Stdout is streamed through `WriteStdout` events.
    pub stdout_streaming: bool,
    /// Start/stop program commands are understood.
    pub program_commands: bool,
}

impl Capabilities {
    const RAW_LEN: usize = 10;

    /// Decode the `<HII` capabilities characteristic value.
    pub fn decode(protocol_version: semver::Version, data: &[u8]) -> Result<Self, CodecError> {
        check_len(0, Self::RAW_LEN, data.len())?;
        let mut cursor = Cursor::new(data);
        let max_write_size = cursor.read_u16::<LittleEndian>()? as usize;
        let features = cursor.read_u32::<LittleEndian>()?;
        let max_program_size = cursor.read_u32::<LittleEndian>()? as usize;
        Ok(Self {
            protocol_version,
            max_write_size,
            features: FeatureFlags(features),
            max_program_size: Some(max_program_size),
            stdout_streaming: true,
            program_commands: true,
        })
    }

    /// Capabilities assumed for hubs that predate the capabilities characteristic.
    pub fn legacy(protocol_version: semver::Version, max_write_size: usize) -> Self {
        Self {
            protocol_version,
            max_write_size,
            features: FeatureFlags::default(),
            max_program_size: None,
            stdout_streaming: true,
            program_commands: false,
        }
    }
}

/// Decoded PnP ID characteristic (`<BHHH`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PnpId {
    /// true when the vendor ID is a Bluetooth SIG company ID
    pub bluetooth_vendor: bool,
    pub vendor_id: u16,
    pub hub_kind: HubKind,
    pub revision: u16,
}

impl PnpId {
    pub const LEN: usize = 7;

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        check_len(0, Self::LEN, data.len())?;
        let mut cursor = Cursor::new(data);
        let vid_type = cursor.read_u8()?;
        let vendor_id = cursor.read_u16::<LittleEndian>()?;
        let product_id = cursor.read_u16::<LittleEndian>()?;
        let revision = cursor.read_u16::<LittleEndian>()?;
        let hub_kind = u8::try_from(product_id)
            .map_err(|_| CodecError::UnknownHubKind(0xFF))
            .and_then(HubKind::try_from)?;
        Ok(Self {
            bluetooth_vendor: vid_type != 0,
            vendor_id,
            hub_kind,
            revision,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.push(self.bluetooth_vendor as u8);
        buf.extend_from_slice(&self.vendor_id.to_le_bytes());
        buf.extend_from_slice(&(u8::from(self.hub_kind) as u16).to_le_bytes());
        buf.extend_from_slice(&self.revision.to_le_bytes());
        buf
    }
}

/// Parse the Software Revision string into a protocol version.
pub fn parse_protocol_version(raw: &[u8]) -> Result<semver::Version, CodecError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| CodecError::InvalidVersion(format!("{:x?}", raw)))?
        .trim_end_matches('\0')
        .trim();
    semver::Version::parse(text).map_err(|_| CodecError::InvalidVersion(text.to_string()))
}
