//! Error types for meter log retrieval

use tokio_modbus::Exception;

/// Failure surfaced by the register transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Modbus exception: {0:?}")]
    Exception(Exception),
    #[error("Protocol error: {0}")]
    Protocol(#[from] tokio_modbus::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Request timed out after {0}ms")]
    RequestTimeout(u64),
    #[error("No connection available")]
    NotConnected,
}

/// Errors raised by the log retrieval core
///
/// Every variant is fatal for the current device cycle. None of them are
/// retried here; the caller decides whether to run the cycle again.
#[derive(Debug, thiserror::Error)]
pub enum MeterError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Window not ready before deadline (last status word 0x{last_raw:04X})")]
    Timeout { last_raw: u16 },

    #[error("Short read: expected {expected} words, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("Malformed record: expected 14 words, got {len}")]
    MalformedRecord { len: usize },

    #[error("Record range {offset} + {count} exceeds the 32-bit index space")]
    RangeOverflow { offset: u32, count: u32 },

    #[error("Invalid timestamp from words {}", format_words(.raw))]
    InvalidTimestamp { raw: Vec<u16> },
}

fn format_words(words: &[u16]) -> String {
    let parts: Vec<String> = words.iter().map(|w| format!("0x{:04X}", w)).collect();
    format!("[{}]", parts.join(", "))
}

pub type Result<T> = std::result::Result<T, MeterError>;
