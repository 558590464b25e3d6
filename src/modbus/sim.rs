//! In-memory meter that speaks the windowed log protocol
//!
//! Used by the test suites to drive the retrieval core without a network.
//! The register behaviour follows the device map in [`super::registers`].

use chrono::{Datelike, Duration, NaiveDateTime, Timelike};
use std::collections::HashSet;
use std::io;

use super::registers::*;
use super::RegisterTransport;
use crate::error::TransportError;

/// Status byte reported while the window is still being staged
pub const STATUS_BUSY: u8 = 0x01;

/// One transport call observed by the simulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Read { address: u16, count: u16 },
    Write { address: u16, values: Vec<u16> },
}

#[derive(Debug, Default)]
pub struct SimulatedMeter {
    records: Vec<[u16; RECORD_SIZE_WORDS]>,
    max_records: u32,
    used_records: u32,
    record_size_bytes: u16,
    clock: [u16; 6],

    window_size: u8,
    window_offset: u32,
    busy_polls: u32,
    polls_left: u32,
    never_ready: bool,
    short_read: Option<usize>,
    failing_reads: HashSet<u16>,
    failing_writes: bool,

    calls: Vec<Call>,
}

impl SimulatedMeter {
    pub fn new() -> Self {
        Self {
            max_records: 187_200,
            record_size_bytes: RECORD_SIZE_BYTES,
            clock: [2025, 1, 1, 0, 0, 0],
            ..Default::default()
        }
    }

    /// Meter whose log holds `count` one-minute records starting at `start`
    pub fn with_minute_log(count: u32, start: NaiveDateTime) -> Self {
        let mut meter = Self::new();
        for i in 0..count {
            let ts = start + Duration::minutes(i as i64);
            let base = 100_000 + i as i32 * 10;
            meter.push_record(encode_record(i + 1, ts, [base, base / 4, i as i32, base / 2]));
        }
        meter
    }

    /// Append a raw record and bump the used-records counter
    pub fn push_record(&mut self, words: [u16; RECORD_SIZE_WORDS]) {
        self.records.push(words);
        self.used_records = self.records.len() as u32;
    }

    pub fn set_status(&mut self, max_records: u32, used_records: u32, record_size_bytes: u16) {
        self.max_records = max_records;
        self.used_records = used_records;
        self.record_size_bytes = record_size_bytes;
    }

    pub fn set_clock(&mut self, t: NaiveDateTime) {
        self.clock = [
            t.year() as u16,
            t.month() as u16,
            t.day() as u16,
            t.hour() as u16,
            t.minute() as u16,
            t.second() as u16,
        ];
    }

    pub fn set_clock_words(&mut self, words: [u16; 6]) {
        self.clock = words;
    }

    pub fn clock_words(&self) -> [u16; 6] {
        self.clock
    }

    /// Number of status polls answered with a busy status after programming
    pub fn set_busy_polls(&mut self, polls: u32) {
        self.busy_polls = polls;
    }

    pub fn never_ready(&mut self) {
        self.never_ready = true;
    }

    /// Cap the number of words returned by window data reads
    pub fn truncate_window_reads(&mut self, words: usize) {
        self.short_read = Some(words);
    }

    pub fn fail_reads_at(&mut self, address: u16) {
        self.failing_reads.insert(address);
    }

    pub fn fail_writes(&mut self) {
        self.failing_writes = true;
    }

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    /// Window programming requests as `(window_size, offset)` pairs
    pub fn programmed_windows(&self) -> Vec<(u8, u32)> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::Write { address, values } if *address == LOG_TYPE && values.len() == 4 => {
                    Some(((values[1] >> 8) as u8, (values[2] as u32) << 16 | values[3] as u32))
                }
                _ => None,
            })
            .collect()
    }

    pub fn data_reads(&self) -> usize {
        self.calls
            .iter()
            .filter(|call| matches!(call, Call::Read { address, .. } if *address == WINDOW_DATA))
            .count()
    }

    fn status_word(&mut self) -> u16 {
        let status = if self.never_ready {
            STATUS_BUSY
        } else if self.polls_left > 0 {
            self.polls_left -= 1;
            STATUS_BUSY
        } else {
            STATUS_READY
        };
        (self.window_size as u16) << 8 | status as u16
    }

    fn window_words(&self) -> Vec<u16> {
        let start = self.window_offset as usize;
        let end = (start + self.window_size as usize).min(self.records.len());
        self.records
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .flat_map(|r| r.iter().copied())
            .collect()
    }
}

fn device_failure(what: &str) -> TransportError {
    TransportError::Io(io::Error::new(io::ErrorKind::ConnectionReset, what.to_string()))
}

impl RegisterTransport for SimulatedMeter {
    async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        self.calls.push(Call::Read { address, count });
        if self.failing_reads.contains(&address) {
            return Err(device_failure("simulated read failure"));
        }

        let mut words = match address {
            LOG_STATUS_BASE => vec![
                (self.max_records >> 16) as u16,
                self.max_records as u16,
                (self.used_records >> 16) as u16,
                self.used_records as u16,
                self.record_size_bytes,
            ],
            WINDOW_STATUS => vec![self.status_word()],
            WINDOW_DATA => {
                let mut data = self.window_words();
                if let Some(cap) = self.short_read {
                    data.truncate(cap);
                }
                data
            }
            CLOCK_BASE => self.clock.to_vec(),
            _ => Vec::new(),
        };

        if address != WINDOW_DATA {
            words.resize(count as usize, 0);
        } else {
            words.truncate(count as usize);
        }
        Ok(words)
    }

    async fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<(), TransportError> {
        self.calls.push(Call::Write {
            address,
            values: values.to_vec(),
        });
        if self.failing_writes {
            return Err(device_failure("simulated write failure"));
        }

        match (address, values.len()) {
            (LOG_TYPE, 4) => {
                self.window_size = (values[1] >> 8) as u8;
                self.window_offset = (values[2] as u32) << 16 | values[3] as u32;
                self.polls_left = self.busy_polls;
            }
            (CLOCK_BASE, 6) => {
                self.clock.copy_from_slice(values);
            }
            _ => {}
        }
        Ok(())
    }
}

/// Encode a record in the device layout
pub fn encode_record(
    raw_index: u32,
    timestamp: NaiveDateTime,
    energies: [i32; 4],
) -> [u16; RECORD_SIZE_WORDS] {
    let mut words = [0u16; RECORD_SIZE_WORDS];
    words[0] = (raw_index >> 16) as u16;
    words[1] = raw_index as u16;
    words[2] = ((timestamp.year() - 2000) as u16) << 8 | timestamp.month() as u16;
    words[3] = (timestamp.day() as u16) << 8 | timestamp.hour() as u16;
    words[4] = (timestamp.minute() as u16) << 8 | timestamp.second() as u16;
    for (i, value) in energies.iter().enumerate() {
        let bits = *value as u32;
        words[5 + i * 2] = (bits >> 16) as u16;
        words[6 + i * 2] = bits as u16;
    }
    words[13] = 0xC60D;
    words
}
