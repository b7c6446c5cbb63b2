//! LWP3 bootloader frames.
//!
//! Replies echo the command byte they answer. A reply starting with
//! [`BootloaderReply::ERROR_KIND`] reports a rejected command.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use super::CodecError;
use super::hub::{HubKind, Lwp3Version};

pub const ERASE_FLASH: u8 = 0x11;
pub const PROGRAM_FLASH: u8 = 0x22;
pub const START_APP: u8 = 0x33;
pub const INIT_LOADER: u8 = 0x44;
pub const GET_INFO: u8 = 0x55;
pub const GET_CHECKSUM: u8 = 0x66;
pub const GET_FLASH_STATE: u8 = 0x77;
pub const DISCONNECT: u8 = 0x88;

/// Largest payload a single ProgramFlash frame can carry (length byte covers the address).
pub const MAX_PROGRAM_PAYLOAD: usize = u8::MAX as usize - 4;

const RESULT_OK: u8 = 0x00;
const RESULT_ERROR: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootloaderCommand {
    EraseFlash,
    ProgramFlash { address: u32, payload: Vec<u8> },
    StartApp,
    InitLoader { size: u32 },
    GetInfo,
    GetChecksum,
    GetFlashState,
    Disconnect,
}

impl BootloaderCommand {
    pub fn code(&self) -> u8 {
        match self {
            BootloaderCommand::EraseFlash => ERASE_FLASH,
            BootloaderCommand::ProgramFlash { .. } => PROGRAM_FLASH,
            BootloaderCommand::StartApp => START_APP,
            BootloaderCommand::InitLoader { .. } => INIT_LOADER,
            BootloaderCommand::GetInfo => GET_INFO,
            BootloaderCommand::GetChecksum => GET_CHECKSUM,
            BootloaderCommand::GetFlashState => GET_FLASH_STATE,
            BootloaderCommand::Disconnect => DISCONNECT,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = vec![self.code()];
        match self {
            BootloaderCommand::ProgramFlash { address, payload } => {
                if payload.len() > MAX_PROGRAM_PAYLOAD {
                    return Err(CodecError::FrameTooLarge {
                        len: payload.len(),
                        max: MAX_PROGRAM_PAYLOAD,
                    });
                }
                buf.push((payload.len() + 4) as u8);
                buf.extend_from_slice(&address.to_le_bytes());
                buf.extend_from_slice(payload);
            }
            BootloaderCommand::InitLoader { size } => {
                buf.extend_from_slice(&size.to_le_bytes());
            }
            _ => {}
        }
        Ok(buf)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        let (&code, body) = frame.split_first().ok_or(CodecError::Empty)?;
        let mut cursor = Cursor::new(body);
        Ok(match code {
            ERASE_FLASH => BootloaderCommand::EraseFlash,
            PROGRAM_FLASH => {
                let len = cursor.read_u8().map_err(|_| short(code, 6, frame.len()))? as usize;
                let address = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| short(code, 6, frame.len()))?;
                if len < 4 || body.len() != len + 1 {
                    return Err(short(code, len + 2, frame.len()));
                }
                BootloaderCommand::ProgramFlash {
                    address,
                    payload: body[5..].to_vec(),
                }
            }
            START_APP => BootloaderCommand::StartApp,
            INIT_LOADER => BootloaderCommand::InitLoader {
                size: cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| short(code, 5, frame.len()))?,
            },
            GET_INFO => BootloaderCommand::GetInfo,
            GET_CHECKSUM => BootloaderCommand::GetChecksum,
            GET_FLASH_STATE => BootloaderCommand::GetFlashState,
            DISCONNECT => BootloaderCommand::Disconnect,
            other => return Err(CodecError::UnknownTag(other)),
        })
    }
}

/// Response to GetInfo (`<iIIB`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootloaderInfo {
    pub version: Lwp3Version,
    pub start_address: u32,
    pub end_address: u32,
    pub hub_kind: HubKind,
}

impl BootloaderInfo {
    /// Size of the programmable flash region.
    pub fn flash_size(&self) -> usize {
        self.end_address.saturating_sub(self.start_address) as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootloaderReply {
    Erased { ok: bool },
    /// Reply to the final ProgramFlash frame.
    Programmed { checksum: u8, count: u32 },
    Initialized { ok: bool },
    Info(BootloaderInfo),
    Checksum(u8),
    FlashState(u8),
    Error(u8),
}

impl BootloaderReply {
    pub const ERROR_KIND: u8 = 0x05;

    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        let (&code, body) = frame.split_first().ok_or(CodecError::Empty)?;
        let mut cursor = Cursor::new(body);
        let reply = match code {
            Self::ERROR_KIND => {
                return Ok(BootloaderReply::Error(body.first().copied().unwrap_or(0)));
            }
            ERASE_FLASH => {
                expect_len(code, 2, frame.len())?;
                BootloaderReply::Erased {
                    ok: result_ok(body[0])?,
                }
            }
            INIT_LOADER => {
                expect_len(code, 2, frame.len())?;
                BootloaderReply::Initialized {
                    ok: result_ok(body[0])?,
                }
            }
            PROGRAM_FLASH => {
                expect_len(code, 6, frame.len())?;
                let checksum = cursor.read_u8()?;
                let count = cursor.read_u32::<LittleEndian>()?;
                BootloaderReply::Programmed { checksum, count }
            }
            GET_INFO => {
                expect_len(code, 14, frame.len())?;
                let version = cursor.read_i32::<LittleEndian>()?;
                let start_address = cursor.read_u32::<LittleEndian>()?;
                let end_address = cursor.read_u32::<LittleEndian>()?;
                let hub_kind = HubKind::try_from(cursor.read_u8()?)?;
                BootloaderReply::Info(BootloaderInfo {
                    version: Lwp3Version(version as u32),
                    start_address,
                    end_address,
                    hub_kind,
                })
            }
            GET_CHECKSUM => {
                expect_len(code, 2, frame.len())?;
                BootloaderReply::Checksum(body[0])
            }
            GET_FLASH_STATE => {
                expect_len(code, 2, frame.len())?;
                BootloaderReply::FlashState(body[0])
            }
            other => return Err(CodecError::UnknownTag(other)),
        };
        Ok(reply)
    }

    pub fn encode(&self) -> Vec<u8> {
        let result = |ok: bool| if ok { RESULT_OK } else { RESULT_ERROR };
        match self {
            BootloaderReply::Erased { ok } => vec![ERASE_FLASH, result(*ok)],
            BootloaderReply::Initialized { ok } => vec![INIT_LOADER, result(*ok)],
            BootloaderReply::Programmed { checksum, count } => {
                let mut buf = vec![PROGRAM_FLASH, *checksum];
                buf.extend_from_slice(&count.to_le_bytes());
                buf
            }
            BootloaderReply::Info(info) => {
                let mut buf = vec![GET_INFO];
                buf.extend_from_slice(&info.version.0.to_le_bytes());
                buf.extend_from_slice(&info.start_address.to_le_bytes());
                buf.extend_from_slice(&info.end_address.to_le_bytes());
                buf.push(info.hub_kind.into());
                buf
            }
            BootloaderReply::Checksum(sum) => vec![GET_CHECKSUM, *sum],
            BootloaderReply::FlashState(level) => vec![GET_FLASH_STATE, *level],
            BootloaderReply::Error(code) => vec![Self::ERROR_KIND, *code],
        }
    }

    /// Command byte this reply answers, or the error kind.
    pub fn code(&self) -> u8 {
        match self {
            BootloaderReply::Erased { .. } => ERASE_FLASH,
            BootloaderReply::Initialized { .. } => INIT_LOADER,
            BootloaderReply::Programmed { .. } => PROGRAM_FLASH,
            BootloaderReply::Info(_) => GET_INFO,
            BootloaderReply::Checksum(_) => GET_CHECKSUM,
            BootloaderReply::FlashState(_) => GET_FLASH_STATE,
            BootloaderReply::Error(_) => Self::ERROR_KIND,
        }
    }
}

fn result_ok(byte: u8) -> Result<bool, CodecError> {
    match byte {
        RESULT_OK => Ok(true),
        RESULT_ERROR => Ok(false),
        other => Err(CodecError::BootloaderError(other)),
    }
}

fn expect_len(tag: u8, expected: usize, actual: usize) -> Result<(), CodecError> {
    if expected == actual {
        Ok(())
    } else {
        Err(CodecError::LengthMismatch {
            tag,
            expected,
            actual,
        })
    }
}

fn short(tag: u8, expected: usize, actual: usize) -> CodecError {
    CodecError::LengthMismatch {
        tag,
        expected,
        actual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_flash_layout() {
        let cmd = BootloaderCommand::ProgramFlash {
            address: 0x0800_8000,
            payload: vec![1, 2, 3],
        };
        let bytes = cmd.encode().unwrap();
        assert_eq!(bytes, vec![0x22, 7, 0x00, 0x80, 0x00, 0x08, 1, 2, 3]);
        assert_eq!(BootloaderCommand::decode(&bytes).unwrap(), cmd);
    }

    #[test]
    fn test_init_loader_layout() {
        let bytes = BootloaderCommand::InitLoader { size: 0x1234 }.encode().unwrap();
        assert_eq!(bytes, vec![0x44, 0x34, 0x12, 0x00, 0x00]);
    }

    #[test]
    fn test_info_reply() {
        let info = BootloaderInfo {
            version: Lwp3Version(0x1000_0107),
            start_address: 0x0800_5000,
            end_address: 0x0804_0000,
            hub_kind: HubKind::City,
        };
        let frame = BootloaderReply::Info(info).encode();
        assert_eq!(frame.len(), 14);
        match BootloaderReply::decode(&frame).unwrap() {
            BootloaderReply::Info(decoded) => {
                assert_eq!(decoded, info);
                assert_eq!(decoded.flash_size(), 0x3B000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_error_and_bad_result() {
        assert_eq!(
            BootloaderReply::decode(&[0x05, 0x05]).unwrap(),
            BootloaderReply::Error(0x05)
        );
        assert_eq!(
            BootloaderReply::decode(&[ERASE_FLASH, 0x42]),
            Err(CodecError::BootloaderError(0x42))
        );
        assert!(matches!(
            BootloaderReply::decode(&[GET_INFO, 0, 0]),
            Err(CodecError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_oversized_program_payload() {
        let cmd = BootloaderCommand::ProgramFlash {
            address: 0,
            payload: vec![0; 252],
        };
        assert!(matches!(cmd.encode(), Err(CodecError::FrameTooLarge { .. })));
    }
}
