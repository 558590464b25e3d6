//! Per-meter collection cycles
//!
//! A cycle reads the log status, plans a range from the stored cursor,
//! retrieves and filters records, writes the new ones to CSV and only then
//! advances the cursor. Any failure leaves the cursor where it was, so the
//! next cycle retries the same range.

use anyhow::{Context, Result};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clock::{self, Clock, SyncOutcome, SystemClock};
use crate::config::Config;
use crate::history::{
    plan_retrieval, read_log_status, retrieve_range, LogRecord, LogStatus, PollConfig,
    RetrievalMode,
};
use crate::modbus::{Endpoint, ModbusClient, RegisterTransport};
use crate::output;
use crate::store::{Meter, MeterStore};

/// Minutes between two historical log records
pub const RECORD_INTERVAL_MINUTES: u32 = 1;

pub type SharedStore = Arc<RwLock<MeterStore>>;

/// Settings shared by every cycle
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub mode: RetrievalMode,
    pub max_records_per_cycle: u32,
    pub max_window_records: u8,
    pub poll: PollConfig,
    pub output_dir: PathBuf,
    pub csv_delimiter: u8,
    pub sync_time: bool,
    pub allowed_drift_secs: u32,
    pub default_port: u16,
    pub request_timeout: Duration,
}

impl CollectorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            mode: config.collector.mode,
            max_records_per_cycle: config.collector.max_records_per_cycle,
            max_window_records: config.collector.max_window_records,
            poll: config.modbus.poll(),
            output_dir: config.collector.output_dir.clone(),
            csv_delimiter: config.collector.csv_delimiter as u8,
            sync_time: config.collector.sync_time,
            allowed_drift_secs: config.collector.allowed_drift_secs,
            default_port: config.modbus.port,
            request_timeout: config.modbus.request_timeout(),
        }
    }

    pub fn endpoint(&self, meter: &Meter) -> Endpoint {
        Endpoint {
            host: meter.ip_address.clone(),
            port: meter.port.unwrap_or(self.default_port),
            unit_id: meter.unit_id,
            request_timeout: self.request_timeout,
        }
    }
}

/// Result of one successful cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub meter_id: u32,
    pub serial_number: String,
    pub status: LogStatus,
    pub records_read: usize,
    pub records_written: usize,
    pub csv_path: Option<PathBuf>,
    pub cursor_before: u32,
    pub cursor_after: u32,
    pub clock: Option<SyncOutcome>,
}

/// Outcome of a cycle as reported for multi-meter runs
#[derive(Debug, Clone, Serialize)]
pub struct MeterOutcome {
    pub meter_id: u32,
    pub serial_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<CycleReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MeterOutcome {
    fn new(meter: &Meter, result: Result<CycleReport>) -> Self {
        match result {
            Ok(report) => Self {
                meter_id: meter.id,
                serial_number: meter.serial_number.clone(),
                report: Some(report),
                error: None,
            },
            Err(e) => Self {
                meter_id: meter.id,
                serial_number: meter.serial_number.clone(),
                report: None,
                error: Some(format!("{:#}", e)),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Run one cycle against an already connected transport
pub async fn process_meter_with<T: RegisterTransport, C: Clock>(
    transport: &mut T,
    clock: &C,
    meter: &Meter,
    settings: &CollectorSettings,
    store: &SharedStore,
) -> Result<CycleReport> {
    info!("Processing {}...", meter.serial_number);

    let clock_outcome = if settings.sync_time {
        let outcome = clock::check_and_sync(transport, clock, settings.allowed_drift_secs)
            .await
            .with_context(|| format!("Clock check failed for {}", meter.serial_number))?;
        metrics::gauge!("meterlog_clock_drift_seconds", "meter" => meter.serial_number.clone())
            .set(outcome.drift_seconds);
        store
            .write()
            .await
            .update_timesync(meter.id, outcome.local_time, outcome.drift_seconds)?;
        Some(outcome)
    } else {
        None
    };

    let status = read_log_status(transport)
        .await
        .with_context(|| format!("Failed to read log status of {}", meter.serial_number))?;

    // The stored cursor may have moved since `meter` was loaded
    let cursor = store
        .read()
        .await
        .get(meter.id)
        .map(|m| m.last_record_index)
        .unwrap_or(meter.last_record_index);
    debug!("Cursor (next index) for {} = {}", meter.serial_number, cursor.0);

    let mut report = CycleReport {
        meter_id: meter.id,
        serial_number: meter.serial_number.clone(),
        status,
        records_read: 0,
        records_written: 0,
        csv_path: None,
        cursor_before: cursor.0,
        cursor_after: cursor.0,
        clock: clock_outcome,
    };

    let Some(plan) = plan_retrieval(&status, cursor, settings.mode, settings.max_records_per_cycle)
    else {
        info!("Nothing to collect for {} (used_records={})", meter.serial_number, status.used_records);
        return Ok(report);
    };

    let records = retrieve_range(
        transport,
        plan.offset,
        plan.count,
        settings.max_window_records,
        &settings.poll,
    )
    .await
    .with_context(|| {
        format!(
            "Failed to retrieve records {}..{} from {}",
            plan.offset,
            plan.offset + plan.count,
            meter.serial_number
        )
    })?;
    report.records_read = records.len();

    let fresh = cursor.filter_new(records);
    if fresh.is_empty() {
        info!("No new records for {} since cursor {}", meter.serial_number, cursor.0);
    } else {
        let folder = meter
            .output_folder
            .clone()
            .unwrap_or_else(|| settings.output_dir.clone());
        let path = output::csv_path(&folder, &meter.serial_number, clock.now());
        let path = output::write_records(&path, &meter.serial_number, &fresh, settings.csv_delimiter)?;
        report.records_written = fresh.len();
        report.csv_path = Some(path);
        metrics::counter!("meterlog_records_written_total", "meter" => meter.serial_number.clone())
            .increment(fresh.len() as u64);
    }

    if plan.next_cursor > cursor {
        store
            .write()
            .await
            .update_pointer(meter.id, plan.next_cursor, clock.now())?;
        report.cursor_after = plan.next_cursor.0;
        info!(
            "Cursor for {} advanced {} -> {}",
            meter.serial_number, cursor.0, plan.next_cursor.0
        );
    }

    Ok(report)
}

/// Opens and closes device sessions for the collector
#[allow(async_fn_in_trait)]
pub trait Connector {
    type Transport: RegisterTransport;

    async fn connect(&self, device_id: &str, endpoint: &Endpoint) -> Result<Self::Transport>;

    async fn disconnect(&self, endpoint: &Endpoint, transport: Self::Transport);
}

/// Sessions over Modbus TCP
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Transport = ModbusClient;

    async fn connect(&self, device_id: &str, endpoint: &Endpoint) -> Result<ModbusClient> {
        ModbusClient::connect(device_id, endpoint).await
    }

    async fn disconnect(&self, _endpoint: &Endpoint, mut transport: ModbusClient) {
        transport.close().await;
    }
}

/// Reachability probe result for the inventory UI
#[derive(Debug, Clone, Serialize)]
pub struct DeviceProbe {
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DeviceProbe {
    fn unreachable(reason: String) -> Self {
        Self {
            reachable: false,
            device_time: None,
            reason: Some(reason),
        }
    }
}

/// Owns the inventory and serializes work per device
pub struct Collector<C = TcpConnector> {
    store: SharedStore,
    settings: CollectorSettings,
    connector: C,
    device_locks: Mutex<HashMap<u32, Arc<Mutex<()>>>>,
}

impl Collector {
    pub fn new(store: SharedStore, settings: CollectorSettings) -> Self {
        Self::with_connector(store, settings, TcpConnector)
    }
}

impl<C: Connector> Collector<C> {
    pub fn with_connector(store: SharedStore, settings: CollectorSettings, connector: C) -> Self {
        Self {
            store,
            settings,
            connector,
            device_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn settings(&self) -> &CollectorSettings {
        &self.settings
    }

    async fn device_lock(&self, id: u32) -> Arc<Mutex<()>> {
        self.device_locks
            .lock()
            .await
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the session lock of a meter removed from the inventory
    pub async fn forget_meter(&self, id: u32) {
        self.device_locks.lock().await.remove(&id);
    }

    async fn meter(&self, id: u32) -> Result<Meter> {
        self.store
            .read()
            .await
            .get(id)
            .cloned()
            .with_context(|| format!("Meter {} not found", id))
    }

    async fn open(&self, meter: &Meter) -> Result<(Endpoint, C::Transport)> {
        let endpoint = self.settings.endpoint(meter);
        let transport = self
            .connector
            .connect(&meter.serial_number, &endpoint)
            .await
            .with_context(|| {
                format!(
                    "Cannot connect to {} at {}",
                    meter.serial_number, meter.ip_address
                )
            })?;
        Ok((endpoint, transport))
    }

    /// Connect, run one cycle and disconnect
    async fn process_meter(&self, meter: &Meter) -> Result<CycleReport> {
        let (endpoint, mut transport) = self.open(meter).await?;
        let result =
            process_meter_with(&mut transport, &SystemClock, meter, &self.settings, &self.store)
                .await;
        self.connector.disconnect(&endpoint, transport).await;
        result
    }

    async fn run_cycle(&self, meter: &Meter) -> Result<CycleReport> {
        let lock = self.device_lock(meter.id).await;
        let _session = lock.lock().await;

        let result = self.process_meter(meter).await;
        match &result {
            Ok(report) => {
                metrics::counter!("meterlog_cycles_total", "result" => "ok").increment(1);
                info!(
                    "Cycle for {} done: read {}, wrote {}, cursor {}",
                    meter.serial_number, report.records_read, report.records_written, report.cursor_after
                );
            }
            Err(e) => {
                metrics::counter!("meterlog_cycles_total", "result" => "error").increment(1);
                error!("Cycle for {} failed: {:#}", meter.serial_number, e);
            }
        }
        result
    }

    /// Run one cycle for a single meter
    pub async fn collect_meter(&self, id: u32) -> Result<CycleReport> {
        let meter = self.meter(id).await?;
        self.run_cycle(&meter).await
    }

    /// Run one cycle for every enabled meter, concurrently
    ///
    /// A failure on one meter never affects the others.
    pub async fn collect_all(&self) -> Vec<MeterOutcome> {
        let meters = self.store.read().await.enabled();
        if meters.is_empty() {
            warn!("No enabled meters in inventory");
            return Vec::new();
        }

        info!("Collecting from {} meters", meters.len());
        let cycles = meters.iter().map(|meter| async move {
            MeterOutcome::new(meter, self.run_cycle(meter).await)
        });
        join_all(cycles).await
    }

    /// Check a meter's clock and correct it if it drifted too far
    pub async fn sync_meter_time(&self, id: u32, allowed_drift_secs: u32) -> Result<SyncOutcome> {
        let meter = self.meter(id).await?;
        let lock = self.device_lock(id).await;
        let _session = lock.lock().await;

        let (endpoint, mut transport) = self.open(&meter).await?;
        let result = clock::check_and_sync(&mut transport, &SystemClock, allowed_drift_secs).await;
        self.connector.disconnect(&endpoint, transport).await;

        let outcome = result?;
        self.store
            .write()
            .await
            .update_timesync(id, outcome.local_time, outcome.drift_seconds)?;
        Ok(outcome)
    }

    /// Read the log status block of a meter
    pub async fn meter_status(&self, id: u32) -> Result<LogStatus> {
        let meter = self.meter(id).await?;
        let lock = self.device_lock(id).await;
        let _session = lock.lock().await;

        let (endpoint, mut transport) = self.open(&meter).await?;
        let result = read_log_status(&mut transport).await;
        self.connector.disconnect(&endpoint, transport).await;
        Ok(result?)
    }

    /// Read the clock of an inventory meter to prove it answers requests
    pub async fn probe(&self, id: u32) -> Result<DeviceProbe> {
        let meter = self.meter(id).await?;
        let lock = self.device_lock(id).await;
        let _session = lock.lock().await;

        Ok(self
            .probe_endpoint(&meter.serial_number, &self.settings.endpoint(&meter))
            .await)
    }

    /// Read the clock of any device, whether or not it is in the inventory
    pub async fn probe_endpoint(&self, device_id: &str, endpoint: &Endpoint) -> DeviceProbe {
        let mut transport = match self.connector.connect(device_id, endpoint).await {
            Ok(transport) => transport,
            Err(e) => return DeviceProbe::unreachable(format!("{:#}", e)),
        };
        let result = clock::read_meter_time(&mut transport).await;
        self.connector.disconnect(endpoint, transport).await;

        match result {
            Ok(t) => DeviceProbe {
                reachable: true,
                device_time: Some(t.format("%Y-%m-%d %H:%M:%S").to_string()),
                reason: None,
            },
            Err(e) => DeviceProbe::unreachable(e.to_string()),
        }
    }

    /// Collect from every enabled meter on a fixed period
    pub async fn run_schedule(self: Arc<Self>, period: Duration) {
        info!("Scheduled collection every {}s", period.as_secs());
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let outcomes = self.collect_all().await;
            let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
            info!(
                "Scheduled run finished: {} meters, {} failed",
                outcomes.len(),
                failed
            );
        }
    }
}

/// Which slice of the log a one-shot fetch reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSpan {
    /// Records covering the last N minutes
    Last { minutes: u32 },
    All,
}

/// Range `(offset, count)` for a one-shot fetch
pub fn fetch_range(used_records: u32, span: FetchSpan) -> (u32, u32) {
    match span {
        FetchSpan::All => (0, used_records),
        FetchSpan::Last { minutes } => {
            let needed = minutes
                .div_ceil(RECORD_INTERVAL_MINUTES)
                .min(used_records)
                .max(1);
            (used_records.saturating_sub(needed), needed.min(used_records))
        }
    }
}

/// Read a slice of the log without touching any cursor
pub async fn fetch_once<T: RegisterTransport>(
    transport: &mut T,
    span: FetchSpan,
    settings: &CollectorSettings,
) -> Result<(LogStatus, Vec<LogRecord>)> {
    let status = read_log_status(transport).await?;
    if status.used_records == 0 {
        info!("No historical records available");
        return Ok((status, Vec::new()));
    }

    let (offset, count) = fetch_range(status.used_records, span);
    info!("Retrieving {} records from offset={}...", count, offset);
    let records = retrieve_range(
        transport,
        offset,
        count,
        settings.max_window_records,
        &settings.poll,
    )
    .await?;
    Ok((status, records))
}
