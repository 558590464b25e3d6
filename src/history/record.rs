//! Historical log record decoder
//!
//! Each record occupies 14 holding-register words:
//!
//! | Words  | Field |
//! |--------|-------|
//! | 0-1    | device record number (u32) |
//! | 2-4    | timestamp, packed bytes `YY MM`, `DD hh`, `mm ss` |
//! | 5-6    | active energy import (s32, 0.1 kWh) |
//! | 7-8    | active energy export (s32, 0.1 kWh) |
//! | 9-10   | reactive energy import (s32, 0.1 kvarh) |
//! | 11-12  | reactive energy export (s32, 0.1 kvarh) |
//! | 13     | trailing CRC / status word |

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::error::{MeterError, Result};
use crate::modbus::registers::RECORD_SIZE_WORDS;

/// One raw LSB of an energy accumulator, in kWh or kvarh
pub const ENERGY_SCALE: f64 = 0.1;

/// A decoded historical log entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    /// Position in the device log, derived from the request offset
    pub global_index: u32,
    /// Full record number embedded by the device (diagnostic only)
    pub raw_index: u32,
    pub raw_index_low16: u16,
    pub timestamp: NaiveDateTime,
    pub kwh_import: f64,
    pub kwh_export: f64,
    pub kvarh_import: f64,
    pub kvarh_export: f64,
    pub trailing_word: u16,
}

/// Decode one 14-word record slot
///
/// `global_index` is assigned by the caller from the window offset; the
/// record number inside the slot is kept only for diagnostics.
pub fn decode_record(words: &[u16], global_index: u32) -> Result<LogRecord> {
    if words.len() != RECORD_SIZE_WORDS {
        return Err(MeterError::MalformedRecord { len: words.len() });
    }

    let timestamp = decode_log_timestamp([words[2], words[3], words[4]])?;

    Ok(LogRecord {
        global_index,
        raw_index: read_u32(words[0], words[1]),
        raw_index_low16: words[1],
        timestamp,
        kwh_import: scale_energy(read_s32(words[5], words[6])),
        kwh_export: scale_energy(read_s32(words[7], words[8])),
        kvarh_import: scale_energy(read_s32(words[9], words[10])),
        kvarh_export: scale_energy(read_s32(words[11], words[12])),
        trailing_word: words[13],
    })
}

/// Decode the packed-byte timestamp of a historical record
///
/// Bytes hold plain binary values (not BCD): `0x190C 0x0512 0x1800` is
/// 2025-12-05 18:24:00. The meter clock registers use a different
/// encoding, see [`crate::clock`].
pub fn decode_log_timestamp(words: [u16; 3]) -> Result<NaiveDateTime> {
    let [w0, w1, w2] = words;
    let (year_offset, month) = split_bytes(w0);
    let (day, hour) = split_bytes(w1);
    let (minute, second) = split_bytes(w2);

    NaiveDate::from_ymd_opt(2000 + year_offset as i32, month as u32, day as u32)
        .and_then(|date| date.and_hms_opt(hour as u32, minute as u32, second as u32))
        .ok_or_else(|| MeterError::InvalidTimestamp {
            raw: words.to_vec(),
        })
}

fn split_bytes(word: u16) -> (u8, u8) {
    ((word >> 8) as u8, (word & 0x00FF) as u8)
}

pub(crate) fn read_u32(hi: u16, lo: u16) -> u32 {
    (hi as u32) << 16 | lo as u32
}

/// Big-endian word pair as a two's-complement 32-bit value
pub(crate) fn read_s32(hi: u16, lo: u16) -> i32 {
    read_u32(hi, lo) as i32
}

fn scale_energy(raw: i32) -> f64 {
    raw as f64 * ENERGY_SCALE
}
