//! Windowed log retrieval
//!
//! The device exposes its historical log through a small staging window.
//! Each window is fetched in four steps:
//!
//! 1. program log type, window size and record offset (0x6000..0x6003)
//! 2. poll 0x6001 until its low byte reports ready (0x0B)
//! 3. read `window_size * 14` words from 0x6004
//! 4. decode each 14-word slot
//!
//! Nothing is cached between calls; the device log is the only source of
//! truth.

use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace};

use super::record::{decode_record, LogRecord};
use crate::error::{MeterError, Result};
use crate::modbus::registers::*;
use crate::modbus::RegisterTransport;

/// Ready-poll timing
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Progress of a single window fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Programmed,
    Polling { polls: u32, last_raw: u16 },
    Ready { polls: u32 },
    TimedOut { last_raw: u16 },
}

/// One chunk of a range request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrievalWindow {
    pub offset: u32,
    pub window_size: u8,
}

impl RetrievalWindow {
    pub fn words(&self) -> usize {
        self.window_size as usize * RECORD_SIZE_WORDS
    }
}

/// Consecutive windows covering a record range, produced lazily
#[derive(Debug, Clone)]
pub struct Windows {
    next: u32,
    remaining: u32,
    max: u32,
}

impl Iterator for Windows {
    type Item = RetrievalWindow;

    fn next(&mut self) -> Option<RetrievalWindow> {
        if self.remaining == 0 {
            return None;
        }
        let size = self.remaining.min(self.max);
        let window = RetrievalWindow {
            offset: self.next,
            window_size: size as u8,
        };
        // Cannot overflow: `plan_windows` checked the end of the range
        self.next = self.next.wrapping_add(size);
        self.remaining -= size;
        Some(window)
    }
}

/// Split `[offset, offset + count)` into consecutive windows
///
/// `max_window_records` is clamped to `1..=8`. A range whose end does not
/// fit in a `u32` index is rejected.
pub fn plan_windows(offset: u32, count: u32, max_window_records: u8) -> Result<Windows> {
    if offset.checked_add(count).is_none() {
        return Err(MeterError::RangeOverflow { offset, count });
    }
    Ok(Windows {
        next: offset,
        remaining: count,
        max: max_window_records.clamp(1, MAX_RECORDS_PER_WINDOW) as u32,
    })
}

/// Fetch records `[offset, offset + count)` in ascending index order
///
/// Any failure aborts the whole range; records decoded from earlier
/// windows are discarded with it.
pub async fn retrieve_range<T: RegisterTransport>(
    transport: &mut T,
    offset: u32,
    count: u32,
    max_window_records: u8,
    poll: &PollConfig,
) -> Result<Vec<LogRecord>> {
    if count == 0 {
        return Ok(Vec::new());
    }

    let windows = plan_windows(offset, count, max_window_records)?;
    info!(
        "Retrieving {} records from offset {} in {} windows",
        count,
        offset,
        count.div_ceil(windows.max)
    );

    // `count` comes from the device, so grow with what was actually read
    let mut records = Vec::new();
    for window in windows {
        records.extend(read_window(transport, window, poll).await?);
    }

    Ok(records)
}

/// Run the program, poll, read and decode steps for one window
pub async fn read_window<T: RegisterTransport>(
    transport: &mut T,
    window: RetrievalWindow,
    poll: &PollConfig,
) -> Result<Vec<LogRecord>> {
    program_window(transport, window).await?;

    let mut state = WindowState::Programmed;
    let deadline = Instant::now() + poll.timeout;

    loop {
        state = match state {
            WindowState::Programmed => poll_status(transport, 0, deadline).await?,
            WindowState::Polling { polls, .. } => {
                sleep(poll.interval).await;
                poll_status(transport, polls, deadline).await?
            }
            WindowState::Ready { polls } => {
                debug!("Window at offset {} ready after {} polls", window.offset, polls);
                break;
            }
            WindowState::TimedOut { last_raw } => {
                return Err(MeterError::Timeout { last_raw });
            }
        };
    }

    let words = read_window_data(transport, window).await?;

    words
        .chunks_exact(RECORD_SIZE_WORDS)
        .enumerate()
        .map(|(i, slot)| {
            let index = window
                .offset
                .checked_add(i as u32)
                .ok_or(MeterError::RangeOverflow {
                    offset: window.offset,
                    count: window.window_size as u32,
                })?;
            decode_record(slot, index)
        })
        .collect()
}

async fn program_window<T: RegisterTransport>(
    transport: &mut T,
    window: RetrievalWindow,
) -> Result<()> {
    let size = window.window_size.max(1) as u16;
    let values = [
        HISTORICAL_LOG_1,
        size << 8,
        (window.offset >> 16) as u16,
        window.offset as u16,
    ];

    debug!(
        "Programming window: offset={}, size={}, regs={:04X?}",
        window.offset, size, values
    );
    transport.write_registers(LOG_TYPE, &values).await?;
    Ok(())
}

async fn poll_status<T: RegisterTransport>(
    transport: &mut T,
    polls: u32,
    deadline: Instant,
) -> Result<WindowState> {
    let raw = transport
        .read_holding_registers(WINDOW_STATUS, 1)
        .await?
        .first()
        .copied()
        .ok_or(MeterError::ShortRead {
            expected: 1,
            actual: 0,
        })?;

    let polls = polls + 1;
    let status = (raw & 0x00FF) as u8;
    trace!("0x6001 = 0x{:04X} (recs={}, status=0x{:02X})", raw, raw >> 8, status);

    if status == STATUS_READY {
        return Ok(WindowState::Ready { polls });
    }
    if Instant::now() >= deadline {
        return Ok(WindowState::TimedOut { last_raw: raw });
    }
    Ok(WindowState::Polling {
        polls,
        last_raw: raw,
    })
}

async fn read_window_data<T: RegisterTransport>(
    transport: &mut T,
    window: RetrievalWindow,
) -> Result<Vec<u16>> {
    let expected = window.words();
    let count = expected.min(WINDOW_MAX_WORDS);

    let mut words = transport
        .read_holding_registers(WINDOW_DATA, count as u16)
        .await?;

    if words.len() < expected {
        return Err(MeterError::ShortRead {
            expected,
            actual: words.len(),
        });
    }
    words.truncate(expected);
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::sim::{encode_record, Call, SimulatedMeter};
    use chrono::NaiveDate;

    fn start() -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 12, 5)
            .unwrap()
            .and_hms_opt(18, 24, 0)
            .unwrap()
    }

    fn fast_poll() -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(50),
        }
    }

    fn windows(offset: u32, count: u32, max: u8) -> Vec<RetrievalWindow> {
        plan_windows(offset, count, max).unwrap().collect()
    }

    #[test]
    fn test_plan_windows_chunks_range() {
        let windows = windows(10, 20, 8);
        assert_eq!(
            windows,
            vec![
                RetrievalWindow { offset: 10, window_size: 8 },
                RetrievalWindow { offset: 18, window_size: 8 },
                RetrievalWindow { offset: 26, window_size: 4 },
            ]
        );
        assert!(windows.iter().all(|w| w.words() <= WINDOW_MAX_WORDS));
    }

    #[test]
    fn test_plan_windows_clamps_size() {
        assert!(windows(0, 20, 200).iter().all(|w| w.window_size <= 8));
        assert_eq!(windows(0, 3, 0).len(), 3);
        assert!(windows(5, 0, 8).is_empty());
    }

    #[test]
    fn test_plan_windows_reaches_top_of_index_space() {
        let windows = windows(u32::MAX - 8, 8, 8);
        assert_eq!(
            windows,
            vec![RetrievalWindow { offset: u32::MAX - 8, window_size: 8 }]
        );
    }

    #[tokio::test]
    async fn test_overflowing_range_is_rejected() {
        let mut meter = SimulatedMeter::with_minute_log(8, start());

        assert!(matches!(
            retrieve_range(&mut meter, u32::MAX - 3, 16, 8, &fast_poll()).await,
            Err(MeterError::RangeOverflow { offset, count: 16 }) if offset == u32::MAX - 3
        ));
        assert!(meter.calls().is_empty());
    }

    #[tokio::test]
    async fn test_huge_count_fails_on_first_window() {
        // Bogus status counter; the log only holds a few records
        let mut meter = SimulatedMeter::with_minute_log(4, start());

        assert!(matches!(
            retrieve_range(&mut meter, 0, u32::MAX, 8, &fast_poll()).await,
            Err(MeterError::ShortRead { expected: 112, actual: 56 })
        ));
        assert_eq!(meter.programmed_windows(), vec![(8, 0)]);
    }

    #[tokio::test]
    async fn test_zero_count_issues_no_calls() {
        let mut meter = SimulatedMeter::with_minute_log(10, start());
        let records = retrieve_range(&mut meter, 0, 0, 8, &fast_poll())
            .await
            .unwrap();
        assert!(records.is_empty());
        assert!(meter.calls().is_empty());
    }

    #[tokio::test]
    async fn test_range_uses_three_windows() {
        let mut meter = SimulatedMeter::with_minute_log(40, start());

        let records = retrieve_range(&mut meter, 10, 20, 8, &fast_poll())
            .await
            .unwrap();

        assert_eq!(meter.programmed_windows(), vec![(8, 10), (8, 18), (4, 26)]);
        let indices: Vec<u32> = records.iter().map(|r| r.global_index).collect();
        assert_eq!(indices, (10..30).collect::<Vec<_>>());
        // Device numbers its records from 1
        assert_eq!(records[0].raw_index, 11);
        assert!(records
            .windows(2)
            .all(|pair| pair[0].timestamp < pair[1].timestamp));
    }

    #[tokio::test]
    async fn test_program_request_layout() {
        let mut meter = SimulatedMeter::with_minute_log(3, start());

        let window = RetrievalWindow {
            offset: 0x0001_0002,
            window_size: 3,
        };
        let _ = read_window(&mut meter, window, &fast_poll()).await;

        assert_eq!(
            meter.calls()[0],
            Call::Write {
                address: LOG_TYPE,
                values: vec![0x0000, 0x0300, 0x0001, 0x0002],
            }
        );
    }

    #[tokio::test]
    async fn test_waits_for_ready() {
        let mut meter = SimulatedMeter::with_minute_log(8, start());
        meter.set_busy_polls(3);

        let records = retrieve_range(&mut meter, 0, 8, 8, &fast_poll())
            .await
            .unwrap();
        assert_eq!(records.len(), 8);

        let status_reads = meter
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Read { address, .. } if *address == WINDOW_STATUS))
            .count();
        assert_eq!(status_reads, 4);
        assert_eq!(
            meter.calls().last(),
            Some(&Call::Read {
                address: WINDOW_DATA,
                count: 112
            })
        );
    }

    #[tokio::test]
    async fn test_timeout_when_never_ready() {
        let mut meter = SimulatedMeter::with_minute_log(8, start());
        meter.never_ready();

        let result = retrieve_range(&mut meter, 0, 8, 8, &fast_poll()).await;
        match result {
            Err(MeterError::Timeout { last_raw }) => assert_eq!(last_raw, 0x0801),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(meter.data_reads(), 0);
    }

    #[tokio::test]
    async fn test_short_read_aborts() {
        let mut meter = SimulatedMeter::with_minute_log(8, start());
        meter.truncate_window_reads(100);

        assert!(matches!(
            retrieve_range(&mut meter, 0, 8, 8, &fast_poll()).await,
            Err(MeterError::ShortRead {
                expected: 112,
                actual: 100
            })
        ));
    }

    #[tokio::test]
    async fn test_short_read_past_end_of_log() {
        let mut meter = SimulatedMeter::with_minute_log(5, start());

        assert!(matches!(
            retrieve_range(&mut meter, 3, 4, 8, &fast_poll()).await,
            Err(MeterError::ShortRead {
                expected: 56,
                actual: 28
            })
        ));
    }

    #[tokio::test]
    async fn test_write_failure_is_transport_error() {
        let mut meter = SimulatedMeter::with_minute_log(8, start());
        meter.fail_writes();

        assert!(matches!(
            retrieve_range(&mut meter, 0, 8, 8, &fast_poll()).await,
            Err(MeterError::Transport(_))
        ));
        assert_eq!(meter.data_reads(), 0);
    }

    #[tokio::test]
    async fn test_later_window_failure_discards_range() {
        let mut meter = SimulatedMeter::with_minute_log(10, start());
        // Month 0 in the second window
        let mut words = encode_record(11, start(), [0; 4]);
        words[2] = 0x1900;
        meter.push_record(words);
        meter.push_record(words);

        assert!(matches!(
            retrieve_range(&mut meter, 0, 12, 8, &fast_poll()).await,
            Err(MeterError::InvalidTimestamp { .. })
        ));
        assert_eq!(meter.programmed_windows().len(), 2);
    }
}
