//! Meter clock read, write and drift correction
//!
//! The clock block at 0x1040 holds six plain integers (year, month, day,
//! hour, minute, second). This is unrelated to the packed-byte timestamps
//! inside historical records.

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, Timelike};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{MeterError, Result};
use crate::modbus::registers::{CLOCK_BASE, CLOCK_WORDS};
use crate::modbus::RegisterTransport;

/// Source of local wall-clock time
#[cfg_attr(test, mockall::automock)]
pub trait Clock {
    fn now(&self) -> NaiveDateTime;
}

/// Local time truncated to whole seconds
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        let now = Local::now().naive_local();
        now.with_nanosecond(0).unwrap_or(now)
    }
}

/// Outcome of a drift check
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SyncOutcome {
    pub sync_performed: bool,
    pub drift_seconds: f64,
    pub meter_time: NaiveDateTime,
    pub local_time: NaiveDateTime,
}

pub async fn read_meter_time<T: RegisterTransport>(transport: &mut T) -> Result<NaiveDateTime> {
    let regs = transport
        .read_holding_registers(CLOCK_BASE, CLOCK_WORDS)
        .await?;
    if regs.len() < CLOCK_WORDS as usize {
        return Err(MeterError::ShortRead {
            expected: CLOCK_WORDS as usize,
            actual: regs.len(),
        });
    }
    decode_clock_registers(&regs[..CLOCK_WORDS as usize])
}

/// Build a date-time from the six plain-integer clock registers
pub fn decode_clock_registers(regs: &[u16]) -> Result<NaiveDateTime> {
    let invalid = || MeterError::InvalidTimestamp { raw: regs.to_vec() };
    let &[year, month, day, hour, minute, second] = regs else {
        return Err(invalid());
    };

    NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
        .and_then(|d| d.and_hms_opt(hour as u32, minute as u32, second as u32))
        .ok_or_else(invalid)
}

pub async fn write_meter_time<T: RegisterTransport>(
    transport: &mut T,
    t: NaiveDateTime,
) -> Result<()> {
    let regs = [
        t.year() as u16,
        t.month() as u16,
        t.day() as u16,
        t.hour() as u16,
        t.minute() as u16,
        t.second() as u16,
    ];
    transport.write_registers(CLOCK_BASE, &regs).await?;
    Ok(())
}

/// Compare meter time with local time and correct it when the drift is
/// larger than `allowed_drift_secs`
pub async fn check_and_sync<T: RegisterTransport, C: Clock>(
    transport: &mut T,
    clock: &C,
    allowed_drift_secs: u32,
) -> Result<SyncOutcome> {
    let meter_time = read_meter_time(transport).await?;
    let local_time = clock.now();
    let drift_seconds = (local_time - meter_time).num_milliseconds().abs() as f64 / 1000.0;

    info!(
        "Time drift check: meter={}, system={}, drift={:.1}s",
        meter_time, local_time, drift_seconds
    );

    let sync_performed = drift_seconds > allowed_drift_secs as f64;
    if sync_performed {
        warn!(
            "Drift {:.1}s exceeds allowed {}s, syncing meter time",
            drift_seconds, allowed_drift_secs
        );
        write_meter_time(transport, local_time).await?;
    }

    Ok(SyncOutcome {
        sync_performed,
        drift_seconds,
        meter_time,
        local_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::sim::{Call, SimulatedMeter};

    fn dt(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 12, 5)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn clock_at(t: NaiveDateTime) -> MockClock {
        let mut clock = MockClock::new();
        clock.expect_now().times(1).return_const(t);
        clock
    }

    #[tokio::test]
    async fn test_read_meter_time_plain_integers() {
        let mut meter = SimulatedMeter::new();
        meter.set_clock_words([2025, 12, 5, 18, 24, 7]);
        assert_eq!(read_meter_time(&mut meter).await.unwrap(), dt(18, 24, 7));
    }

    #[tokio::test]
    async fn test_read_meter_time_rejects_bad_fields() {
        let mut meter = SimulatedMeter::new();
        meter.set_clock_words([2025, 13, 5, 18, 24, 7]);
        match read_meter_time(&mut meter).await {
            Err(MeterError::InvalidTimestamp { raw }) => {
                assert_eq!(raw, vec![2025, 13, 5, 18, 24, 7])
            }
            other => panic!("expected InvalidTimestamp, got {:?}", other),
        }
    }

    #[test]
    fn test_clock_registers_are_not_packed_bytes() {
        // The packed-byte words of a record timestamp are not a valid clock
        assert!(decode_clock_registers(&[0x190C, 0x0512, 0x1800, 0, 0, 0]).is_err());
        assert!(decode_clock_registers(&[2025, 12, 5]).is_err());
    }

    #[tokio::test]
    async fn test_write_meter_time_layout() {
        let mut meter = SimulatedMeter::new();
        write_meter_time(&mut meter, dt(7, 8, 9)).await.unwrap();
        assert_eq!(
            meter.calls(),
            &[Call::Write {
                address: CLOCK_BASE,
                values: vec![2025, 12, 5, 7, 8, 9],
            }]
        );
    }

    #[tokio::test]
    async fn test_sync_when_drift_exceeds_limit() {
        let mut meter = SimulatedMeter::new();
        meter.set_clock(dt(18, 0, 0));

        let outcome = check_and_sync(&mut meter, &clock_at(dt(18, 2, 0)), 60)
            .await
            .unwrap();

        assert!(outcome.sync_performed);
        assert_eq!(outcome.drift_seconds, 120.0);
        assert_eq!(meter.clock_words(), [2025, 12, 5, 18, 2, 0]);
    }

    #[tokio::test]
    async fn test_no_sync_within_limit() {
        let mut meter = SimulatedMeter::new();
        meter.set_clock(dt(18, 1, 0));

        // Meter ahead of local time counts the same as behind
        let outcome = check_and_sync(&mut meter, &clock_at(dt(18, 0, 0)), 60)
            .await
            .unwrap();

        assert!(!outcome.sync_performed);
        assert_eq!(outcome.drift_seconds, 60.0);
        assert!(meter
            .calls()
            .iter()
            .all(|c| matches!(c, Call::Read { .. })));
    }
}
