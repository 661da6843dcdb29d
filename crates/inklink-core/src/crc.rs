//! CRC16-CCITT-FALSE: per-chunk integrity check.
//!
//! Parameters: width 16, poly 0x1021, init 0xFFFF, no reflection, no xorout.
//! The `crc` catalogue lists this exact algorithm as CRC-16/IBM-3740.

use crc::{Crc, CRC_16_IBM_3740};

const CCITT_FALSE: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Checksum a byte slice. Pure, no failure mode.
pub fn crc16(bytes: &[u8]) -> u16 {
    CCITT_FALSE.checksum(bytes)
}
