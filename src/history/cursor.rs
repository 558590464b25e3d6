//! Per-device read cursor
//!
//! The cursor is the next global record index that has not yet been
//! delivered to storage. It only ever moves forward, and only after a
//! batch has been decoded and written in full.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::record::LogRecord;
use super::status::LogStatus;
use crate::modbus::registers::MAX_RECORDS_PER_WINDOW;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub u32);

impl Cursor {
    pub fn next_index(self) -> u32 {
        self.0
    }

    pub fn is_new(self, record: &LogRecord) -> bool {
        record.global_index >= self.0
    }

    /// Drop records behind the cursor, preserving order
    pub fn filter_new(self, records: Vec<LogRecord>) -> Vec<LogRecord> {
        records.into_iter().filter(|r| self.is_new(r)).collect()
    }

    /// Cursor value after a successful batch; never moves backwards
    pub fn advanced_to(self, next_index: u32) -> Cursor {
        Cursor(self.0.max(next_index))
    }
}

/// Which part of the log a collection cycle reads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    /// Everything from the cursor up to the used-records count
    #[default]
    CatchUp,
    /// Only the newest window, regardless of backlog
    LatestWindow,
}

/// Range to read and the cursor value to store once it is written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrievalPlan {
    pub offset: u32,
    pub count: u32,
    pub next_cursor: Cursor,
}

/// Decide what to read for a device given its log status and cursor
///
/// Returns `None` when there is nothing to do: an empty log, a status whose
/// used count exceeds the log capacity, or a cursor beyond `used_records`
/// (the device log was cleared). A cursor is never
/// moved backwards, so the latter needs operator attention.
pub fn plan_retrieval(
    status: &LogStatus,
    cursor: Cursor,
    mode: RetrievalMode,
    max_records_per_cycle: u32,
) -> Option<RetrievalPlan> {
    let used = status.used_records;
    if used == 0 {
        return None;
    }
    if used > status.max_records {
        warn!(
            "Used records {} exceed log capacity {}; ignoring implausible status",
            used, status.max_records
        );
        return None;
    }
    if cursor.0 > used {
        warn!(
            "Cursor {} is ahead of used records {}; device log may have been reset",
            cursor.0, used
        );
        return None;
    }

    let plan = match mode {
        RetrievalMode::LatestWindow => {
            let size = used.min(MAX_RECORDS_PER_WINDOW as u32);
            let offset = used - size;
            if cursor.0 < offset {
                warn!(
                    "Skipping {} records ({}..{}) older than the latest window",
                    offset - cursor.0,
                    cursor.0,
                    offset
                );
            }
            RetrievalPlan {
                offset,
                count: size,
                next_cursor: cursor.advanced_to(used),
            }
        }
        RetrievalMode::CatchUp => {
            let backlog = used - cursor.0;
            let count = if max_records_per_cycle > 0 {
                backlog.min(max_records_per_cycle)
            } else {
                backlog
            };
            RetrievalPlan {
                offset: cursor.0,
                count,
                next_cursor: cursor.advanced_to(cursor.0 + count),
            }
        }
    };

    Some(plan)
}
