use chrono::{Duration, NaiveDate, NaiveDateTime};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_test::assert_ok;

use meterlog::clock::Clock;
use meterlog::collector::{process_meter_with, CollectorSettings, SharedStore};
use meterlog::config::Config;
use meterlog::history::RetrievalMode;
use meterlog::modbus::sim::{encode_record, SimulatedMeter};
use meterlog::store::{Meter, MeterInput, MeterStore};

struct FixedClock(NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

fn start() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 12, 5)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

fn setup(dir: &Path) -> (SharedStore, Meter, CollectorSettings) {
    let mut store = MeterStore::open(dir.join("meters.json")).unwrap();
    let meter = store
        .create(MeterInput {
            serial_number: "AC001".to_string(),
            ip_address: "127.0.0.1".to_string(),
            port: None,
            unit_id: 1,
            model: "Acuvim-L".to_string(),
            site_name: Some("Plant A".to_string()),
            enabled: true,
            output_folder: Some(dir.join("csv")),
        })
        .unwrap();

    let mut config = Config::default();
    config.collector.mode = RetrievalMode::CatchUp;
    config.collector.max_records_per_cycle = 12;
    config.modbus.poll_interval_ms = 1;
    config.modbus.ready_timeout_ms = 50;

    (
        Arc::new(RwLock::new(store)),
        meter,
        CollectorSettings::from_config(&config),
    )
}

/// Global indices written across every CSV file in `dir`
fn written_indices(dir: &Path) -> Vec<u32> {
    let mut indices = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let mut reader = csv::Reader::from_path(entry.unwrap().path()).unwrap();
        for row in reader.records() {
            indices.push(row.unwrap()[1].parse().unwrap());
        }
    }
    indices.sort_unstable();
    indices
}

#[tokio::test]
async fn every_record_is_written_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let (store, meter, settings) = setup(dir.path());
    let mut device = SimulatedMeter::with_minute_log(20, start());

    // Capped catch-up takes two cycles for the initial backlog
    for (minute, expected_cursor) in [(1, 12), (2, 20)] {
        let clock = FixedClock(start() + Duration::hours(1) + Duration::minutes(minute));
        let report = assert_ok!(process_meter_with(&mut device, &clock, &meter, &settings, &store).await);
        assert_eq!(report.cursor_after, expected_cursor);
    }

    // A cycle with nothing new leaves no file behind
    let clock = FixedClock(start() + Duration::hours(2));
    let report = assert_ok!(process_meter_with(&mut device, &clock, &meter, &settings, &store).await);
    assert_eq!(report.records_written, 0);

    // The device keeps logging
    for i in 20..25u32 {
        let ts = start() + Duration::minutes(i as i64);
        device.push_record(encode_record(i + 1, ts, [i as i32; 4]));
    }
    let clock = FixedClock(start() + Duration::hours(3));
    let report = assert_ok!(process_meter_with(&mut device, &clock, &meter, &settings, &store).await);
    assert_eq!(report.records_written, 5);

    assert_eq!(written_indices(&dir.path().join("csv")), (0..25).collect::<Vec<_>>());
    assert_eq!(std::fs::read_dir(dir.path().join("csv")).unwrap().count(), 3);

    // Cursor survives a restart
    let reopened = MeterStore::open(dir.path().join("meters.json")).unwrap();
    assert_eq!(reopened.get(meter.id).unwrap().last_record_index.0, 25);
    assert!(reopened.get(meter.id).unwrap().last_collected.is_some());
}

#[tokio::test]
async fn failed_window_is_retried_next_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let (store, meter, settings) = setup(dir.path());

    let mut device = SimulatedMeter::with_minute_log(10, start());
    device.truncate_window_reads(20);
    let clock = FixedClock(start() + Duration::hours(1));
    assert!(process_meter_with(&mut device, &clock, &meter, &settings, &store)
        .await
        .is_err());
    assert_eq!(store.read().await.get(meter.id).unwrap().last_record_index.0, 0);
    assert!(!dir.path().join("csv").exists());

    // Same log on a healthy link
    let mut device = SimulatedMeter::with_minute_log(10, start());
    let report = assert_ok!(process_meter_with(&mut device, &clock, &meter, &settings, &store).await);
    assert_eq!(report.cursor_before, 0);
    assert_eq!(report.records_written, 10);
    assert_eq!(written_indices(&dir.path().join("csv")), (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn cycles_in_the_same_second_keep_every_file() {
    let dir = tempfile::tempdir().unwrap();
    let (store, meter, mut settings) = setup(dir.path());
    settings.max_records_per_cycle = 8;
    let mut device = SimulatedMeter::with_minute_log(16, start());

    let clock = FixedClock(start() + Duration::hours(1));
    let first = assert_ok!(process_meter_with(&mut device, &clock, &meter, &settings, &store).await);
    let second = assert_ok!(process_meter_with(&mut device, &clock, &meter, &settings, &store).await);

    assert_eq!(second.cursor_after, 16);
    assert_ne!(first.csv_path, second.csv_path);
    assert_eq!(written_indices(&dir.path().join("csv")), (0..16).collect::<Vec<_>>());
}
