//! Cached-calibration blob.
//!
//! Calibration measurements (load DC resistance, resonant frequency) are
//! stable across power cycles, so hosts persist them and hand them back to
//! `boot()` instead of re-running the measurement on every cold start.
//! This module defines the fixed 24-byte blob hosts store wherever they
//! like (EEPROM, filesystem, NV region).
//!
//! Layout (24 bytes total, little-endian):
//! ```text
//! [0..4]   magic     b"SCAL"
//! [4]      version   u8 = 1
//! [5]      valid     bit0 = re_dc present, bit1 = f0 present
//! [6..8]   _pad      [u8; 2]
//! [8..12]  re_dc     u32 le  (firmware fixed-point ohms)
//! [12..16] f0        u32 le  (firmware fixed-point hertz)
//! [16..20] checksum  u32 le  (CRC32 of bytes [0..16])
//! [20..24] _pad      [u8; 4]
//! ```

use crate::driver::CalibrationData;

/// Error variants for calibration-blob decode operations.
#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CalStoreError {
    /// Blob magic bytes are not `b"SCAL"`.
    BadMagic,
    /// Blob version is not recognised by this implementation.
    UnsupportedVersion,
    /// CRC32 mismatch — the blob is corrupt and must be discarded.
    Checksum,
}

/// Serialized size of the blob in bytes.
pub const CAL_BLOB_SIZE: usize = 24;

const MAGIC: &[u8; 4] = b"SCAL";
const VERSION: u8 = 1;
const VALID_RE_DC: u8 = 1 << 0;
const VALID_F0: u8 = 1 << 1;

/// Encode calibration data into a storable blob.
///
/// # Safety (lint allow)
/// All range indices are compile-time constants within `[0, CAL_BLOB_SIZE)`.
#[must_use]
#[allow(clippy::indexing_slicing)]
pub fn encode(cal: &CalibrationData) -> [u8; CAL_BLOB_SIZE] {
    let mut buf = [0u8; CAL_BLOB_SIZE];
    buf[0..4].copy_from_slice(MAGIC);
    buf[4] = VERSION;
    let mut valid = 0u8;
    if cal.re_dc.is_some() {
        valid |= VALID_RE_DC;
    }
    if cal.f0.is_some() {
        valid |= VALID_F0;
    }
    buf[5] = valid;
    buf[8..12].copy_from_slice(&cal.re_dc.unwrap_or(0).to_le_bytes());
    buf[12..16].copy_from_slice(&cal.f0.unwrap_or(0).to_le_bytes());
    let checksum = crc32fast::hash(&buf[0..16]);
    buf[16..20].copy_from_slice(&checksum.to_le_bytes());
    buf
}

/// Decode a blob back into calibration data.
///
/// # Errors
///
/// [`CalStoreError::BadMagic`], [`CalStoreError::UnsupportedVersion`], or
/// [`CalStoreError::Checksum`] — a failed decode means "calibrate again",
/// never "use half a blob".
///
/// # Safety (lint allow)
/// All range indices are compile-time constants within `[0, CAL_BLOB_SIZE)`.
#[allow(clippy::indexing_slicing)]
pub fn decode(buf: &[u8; CAL_BLOB_SIZE]) -> Result<CalibrationData, CalStoreError> {
    if &buf[0..4] != MAGIC {
        return Err(CalStoreError::BadMagic);
    }
    if buf[4] != VERSION {
        return Err(CalStoreError::UnsupportedVersion);
    }
    let declared = u32::from_le_bytes(
        buf[16..20].try_into().unwrap_or([0; 4]),
    );
    if crc32fast::hash(&buf[0..16]) != declared {
        return Err(CalStoreError::Checksum);
    }
    let valid = buf[5];
    let re_dc = u32::from_le_bytes(buf[8..12].try_into().unwrap_or([0; 4]));
    let f0 = u32::from_le_bytes(buf[12..16].try_into().unwrap_or([0; 4]));
    Ok(CalibrationData {
        re_dc: (valid & VALID_RE_DC != 0).then_some(re_dc),
        f0: (valid & VALID_F0 != 0).then_some(f0),
    })
}
