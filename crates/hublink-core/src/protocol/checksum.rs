//! Checksum helpers.
//!
//! - `xor_bytes`: running XOR used by the LWP3 bootloader
//! - `crc32`: IEEE CRC32 used for per-chunk acknowledgements
//! - `stm32_crc32` / `sum_complement`: whole-image firmware checksums

/// XOR every byte of `data` into `init`.
pub fn xor_bytes(data: &[u8], init: u8) -> u8 {
    data.iter().fold(init, |acc, b| acc ^ b)
}

/// IEEE CRC32 of a chunk.
pub fn crc32(data: &[u8]) -> u32 {
    let mut h = crc32fast::Hasher::new();
    h.update(data);
    h.finalize()
}

const STM32_CRC_TABLE: [u32; 16] = [
    0x00000000, 0x04C11DB7, 0x09823B6E, 0x0D4326D9, 0x130476DC, 0x17C56B6B, 0x1A864DB2,
    0x1E475005, 0x2608EDB8, 0x22C9F00F, 0x2F8AD6D6, 0x2B4BCB61, 0x350C9B64, 0x31CD86D3,
    0x3C8EA00A, 0x384FBDBD,
];

fn stm32_crc_word(crc: u32, word: u32) -> u32 {
    let mut crc = crc ^ word;
    for _ in 0..8 {
        crc = (crc << 4) ^ STM32_CRC_TABLE[(crc >> 28) as usize];
    }
    crc
}

/// CRC32 as computed by the STM32 CRC peripheral: little-endian 32-bit words,
/// MSB first, no reflection, initial value 0xFFFFFFFF.
///
/// Returns `None` when `data` is not word aligned.
pub fn stm32_crc32(data: &[u8]) -> Option<u32> {
    if data.len() % 4 != 0 {
        return None;
    }
    Some(data.chunks_exact(4).fold(0xFFFF_FFFF, |crc, w| {
        stm32_crc_word(crc, u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
    }))
}

/// Two's complement correction that makes the 32-bit word sum of
/// `data ++ padding ++ correction` equal zero, where the image is padded
/// with 0xFFFFFFFF words up to `max_size` bytes.
///
/// Returns `None` when `data` exceeds `max_size` or is not word aligned.
pub fn sum_complement(data: &[u8], max_size: usize) -> Option<u32> {
    if data.len() % 4 != 0 || data.len() > max_size {
        return None;
    }
    let mut sum = data.chunks_exact(4).fold(0u32, |acc, w| {
        acc.wrapping_add(u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
    });
    for _ in (data.len()..max_size).step_by(4) {
        sum = sum.wrapping_add(0xFFFF_FFFF);
    }
    Some(sum.wrapping_neg())
}
