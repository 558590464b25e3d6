//! Log status block reader

use serde::Serialize;
use tracing::{debug, warn};

use super::record::read_u32;
use crate::error::{MeterError, Result};
use crate::modbus::registers::{LOG_STATUS_BASE, LOG_STATUS_WORDS, RECORD_SIZE_BYTES};
use crate::modbus::RegisterTransport;

/// Snapshot of the device log counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LogStatus {
    pub max_records: u32,
    pub used_records: u32,
    pub record_size_bytes: u16,
}

impl LogStatus {
    pub fn record_size_ok(&self) -> bool {
        self.record_size_bytes == RECORD_SIZE_BYTES
    }
}

/// Read the log status block at 0x6100
///
/// A record size other than 28 bytes is logged and otherwise ignored.
pub async fn read_log_status<T: RegisterTransport>(transport: &mut T) -> Result<LogStatus> {
    let regs = transport
        .read_holding_registers(LOG_STATUS_BASE, LOG_STATUS_WORDS)
        .await?;

    if regs.len() < LOG_STATUS_WORDS as usize {
        return Err(MeterError::ShortRead {
            expected: LOG_STATUS_WORDS as usize,
            actual: regs.len(),
        });
    }

    let status = LogStatus {
        max_records: read_u32(regs[0], regs[1]),
        used_records: read_u32(regs[2], regs[3]),
        record_size_bytes: regs[4],
    };

    debug!(
        "Log status: max={}, used={}, recordSize={}B",
        status.max_records, status.used_records, status.record_size_bytes
    );

    if !status.record_size_ok() {
        warn!(
            "Unexpected record size {}B (expected {}B), proceeding anyway",
            status.record_size_bytes, RECORD_SIZE_BYTES
        );
    }

    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::sim::SimulatedMeter;

    #[tokio::test]
    async fn test_composes_32bit_counters() {
        let mut meter = SimulatedMeter::new();
        meter.set_status(0x0002_DB40, 0x0001_0005, 28);

        let status = read_log_status(&mut meter).await.unwrap();
        assert_eq!(status.max_records, 187_200);
        assert_eq!(status.used_records, 65_541);
        assert_eq!(status.record_size_bytes, 28);
        assert!(status.record_size_ok());
    }

    #[tokio::test]
    async fn test_odd_record_size_is_not_fatal() {
        let mut meter = SimulatedMeter::new();
        meter.set_status(1000, 50, 32);

        let status = read_log_status(&mut meter).await.unwrap();
        assert_eq!(status.used_records, 50);
        assert!(!status.record_size_ok());
    }

    #[tokio::test]
    async fn test_transport_failure_propagates() {
        let mut meter = SimulatedMeter::new();
        meter.fail_reads_at(LOG_STATUS_BASE);

        assert!(matches!(
            read_log_status(&mut meter).await,
            Err(MeterError::Transport(_))
        ));
    }
}
