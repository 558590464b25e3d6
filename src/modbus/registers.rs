//! Holding register map of the meter

/// Meter clock: year, month, day, hour, minute, second as plain integers
pub const CLOCK_BASE: u16 = 0x1040;
pub const CLOCK_WORDS: u16 = 6;

/// Log type selector (0 = historical log 1)
pub const LOG_TYPE: u16 = 0x6000;
/// High byte = requested window size, low byte = window status
pub const WINDOW_STATUS: u16 = 0x6001;
pub const OFFSET_HI: u16 = 0x6002;
pub const OFFSET_LO: u16 = 0x6003;
/// First word of the window data area
pub const WINDOW_DATA: u16 = 0x6004;

/// Log status block: maxRecords(hi,lo), usedRecords(hi,lo), recordSizeBytes
pub const LOG_STATUS_BASE: u16 = 0x6100;
pub const LOG_STATUS_WORDS: u16 = 5;

pub const HISTORICAL_LOG_1: u16 = 0x0000;

/// Low byte of [`WINDOW_STATUS`] once the window has been staged
pub const STATUS_READY: u8 = 0x0B;

pub const RECORD_SIZE_WORDS: usize = 14;
pub const RECORD_SIZE_BYTES: u16 = 28;

/// Largest read the device serves from the window area
pub const WINDOW_MAX_WORDS: usize = 123;
pub const MAX_RECORDS_PER_WINDOW: u8 = (WINDOW_MAX_WORDS / RECORD_SIZE_WORDS) as u8;
