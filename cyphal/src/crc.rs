//! CRC-32C (Castagnoli), used for frame/payload integrity and as the
//! primitive inside the datatype hash (see [`crate::hash`]).

use crc_any::CRCu32;

/// Polynomial 0x1EDC6F41, reflected, initial 0xFFFFFFFF, final XOR
/// 0xFFFFFFFF. `crc32c(b"123456789") == 0xE3069283`.
pub fn crc32c(data: &[u8]) -> u32 {
    let mut crc = CRCu32::create_crc(0x1EDC6F41, 32, 0xFFFFFFFF, 0xFFFFFFFF, true);
    crc.digest(data);
    crc.get_crc()
}

/// Incremental CRC-32C accumulator, for computing a CRC over bytes that are
/// not contiguous in memory (e.g. a frame header followed by its payload).
pub struct Crc32c(CRCu32);

impl Crc32c {
    pub fn new() -> Self {
        Crc32c(CRCu32::create_crc(0x1EDC6F41, 32, 0xFFFFFFFF, 0xFFFFFFFF, true))
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.0.digest(data);
        self
    }

    pub fn finish(&self) -> u32 {
        self.0.get_crc()
    }
}

impl Default for Crc32c {
    fn default() -> Self {
        Self::new()
    }
}
