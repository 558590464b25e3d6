//! Historical log access
//!
//! Decoding, windowed retrieval, status and cursor handling for the
//! device's append-only energy log.

pub mod cursor;
pub mod record;
pub mod status;
pub mod window;

pub use cursor::{plan_retrieval, Cursor, RetrievalMode, RetrievalPlan};
pub use record::{decode_log_timestamp, decode_record, LogRecord};
pub use status::{read_log_status, LogStatus};
pub use window::{retrieve_range, PollConfig, WindowState};
