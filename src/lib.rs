//! meterlog - energy meter historical-log collector
//!
//! Reads the minute log of Acuvim-L class meters over Modbus TCP through
//! the device's eight-record window, decodes each record and hands new
//! records to CSV output exactly once per device cursor.

pub mod api;
pub mod clock;
pub mod collector;
pub mod config;
pub mod error;
pub mod history;
pub mod modbus;
pub mod output;
pub mod store;

pub use error::{MeterError, Result, TransportError};
