//! SLIP framing for the serial transport.

use super::CodecError;

pub const SLIP_END: u8 = 0xC0;
pub const SLIP_ESC: u8 = 0xDB;
pub const SLIP_ESC_END: u8 = 0xDC;
pub const SLIP_ESC_ESC: u8 = 0xDD;

/// Largest decoded frame accepted before the decoder resynchronises.
pub const MAX_SLIP_FRAME_SIZE: usize = 1024;

/// Wrap a frame in SLIP delimiters, escaping END and ESC bytes.
pub fn encode(frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.len() + 2);
    out.push(SLIP_END);
    for &byte in frame {
        match byte {
            SLIP_END => out.extend_from_slice(&[SLIP_ESC, SLIP_ESC_END]),
            SLIP_ESC => out.extend_from_slice(&[SLIP_ESC, SLIP_ESC_ESC]),
            other => out.push(other),
        }
    }
    out.push(SLIP_END);
    out
}

/// Streaming SLIP decoder fed one byte at a time.
#[derive(Debug, Default)]
pub struct SlipDecoder {
    buffer: Vec<u8>,
    escape_next: bool,
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a frame when `byte` completes one. Empty frames are skipped.
    pub fn feed(&mut self, byte: u8) -> Option<Result<Vec<u8>, CodecError>> {
        if byte == SLIP_END {
            self.escape_next = false;
            if self.buffer.is_empty() {
                return None;
            }
            return Some(Ok(std::mem::take(&mut self.buffer)));
        }

        if self.buffer.len() >= MAX_SLIP_FRAME_SIZE {
            let len = self.buffer.len();
            self.reset();
            return Some(Err(CodecError::FrameTooLarge {
                len,
                max: MAX_SLIP_FRAME_SIZE,
            }));
        }

        if self.escape_next {
            self.escape_next = false;
            match byte {
                SLIP_ESC_END => self.buffer.push(SLIP_END),
                SLIP_ESC_ESC => self.buffer.push(SLIP_ESC),
                other => {
                    self.reset();
                    return Some(Err(CodecError::InvalidEscape(other)));
                }
            }
        } else if byte == SLIP_ESC {
            self.escape_next = true;
        } else {
            self.buffer.push(byte);
        }
        None
    }

    /// Feed a block of bytes, collecting every completed frame.
    pub fn feed_all(&mut self, bytes: &[u8]) -> Vec<Result<Vec<u8>, CodecError>> {
        bytes.iter().filter_map(|&b| self.feed(b)).collect()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.escape_next = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escaping() {
        let encoded = encode(&[0x01, SLIP_END, SLIP_ESC, 0x02]);
        assert_eq!(
            encoded,
            vec![SLIP_END, 0x01, SLIP_ESC, SLIP_ESC_END, SLIP_ESC, SLIP_ESC_ESC, 0x02, SLIP_END]
        );
    }

    #[test]
    fn test_decoder_splits_back_to_back_frames() {
        let mut stream = encode(&[0x00, 0x40, 0, 0, 0]);
        stream.extend(encode(&[0x01, SLIP_END]));
        let mut decoder = SlipDecoder::new();
        let frames: Vec<_> = decoder
            .feed_all(&stream)
            .into_iter()
            .map(|f| f.unwrap())
            .collect();
        assert_eq!(frames, vec![vec![0x00, 0x40, 0, 0, 0], vec![0x01, SLIP_END]]);
    }

    #[test]
    fn test_invalid_escape_resets() {
        let mut decoder = SlipDecoder::new();
        assert!(decoder.feed(0x01).is_none());
        assert!(decoder.feed(SLIP_ESC).is_none());
        assert_eq!(decoder.feed(0x42), Some(Err(CodecError::InvalidEscape(0x42))));
        assert!(decoder.feed(SLIP_END).is_none());
    }
}
