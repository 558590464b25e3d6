//! Meter inventory and per-meter cursor persistence
//!
//! The inventory is a single JSON document. Every mutation rewrites it
//! through a temporary file and a rename so a crash never leaves a
//! half-written cursor behind.

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::history::Cursor;

/// One managed meter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meter {
    pub id: u32,
    pub serial_number: String,
    pub ip_address: String,
    /// TCP port; falls back to the configured default when absent
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub site_name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub output_folder: Option<PathBuf>,

    /// Next global record index to process
    #[serde(default)]
    pub last_record_index: Cursor,
    #[serde(default)]
    pub last_collected: Option<NaiveDateTime>,
    #[serde(default)]
    pub last_timesync: Option<NaiveDateTime>,
    #[serde(default)]
    pub last_drift_seconds: Option<f64>,

    pub created: NaiveDateTime,
    pub updated: NaiveDateTime,
}

fn default_unit_id() -> u8 {
    1
}

fn default_model() -> String {
    "Acuvim-L".to_string()
}

fn default_enabled() -> bool {
    true
}

/// Editable meter fields, as accepted by the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterInput {
    pub serial_number: String,
    pub ip_address: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub site_name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub output_folder: Option<PathBuf>,
}

impl MeterInput {
    fn validate(&self) -> Result<()> {
        if self.serial_number.trim().is_empty() {
            bail!("serial_number must not be empty");
        }
        if self.ip_address.trim().is_empty() {
            bail!("ip_address must not be empty");
        }
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Inventory {
    /// Lowest id never handed out; ids are not reused after a delete
    #[serde(default)]
    next_id: u32,
    meters: Vec<Meter>,
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// File-backed meter inventory
#[derive(Debug)]
pub struct MeterStore {
    path: PathBuf,
    inventory: Inventory,
}

impl MeterStore {
    /// Open the inventory at `path`, starting empty if the file is absent
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let inventory = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read inventory {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse inventory {}", path.display()))?
        } else {
            info!("Inventory {} not found, starting empty", path.display());
            Inventory::default()
        };

        debug!(
            "Loaded {} meters from {}",
            inventory.meters.len(),
            path.display()
        );
        Ok(Self { path, inventory })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list(&self) -> &[Meter] {
        &self.inventory.meters
    }

    pub fn enabled(&self) -> Vec<Meter> {
        self.inventory
            .meters
            .iter()
            .filter(|m| m.enabled)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: u32) -> Option<&Meter> {
        self.inventory.meters.iter().find(|m| m.id == id)
    }

    fn get_mut(&mut self, id: u32) -> Result<&mut Meter> {
        self.inventory
            .meters
            .iter_mut()
            .find(|m| m.id == id)
            .with_context(|| format!("Meter {} not found", id))
    }

    pub fn create(&mut self, input: MeterInput) -> Result<Meter> {
        input.validate()?;
        let highest = self.inventory.meters.iter().map(|m| m.id).max().unwrap_or(0);
        let id = self.inventory.next_id.max(highest + 1);
        self.inventory.next_id = id + 1;
        let at = now();
        let meter = Meter {
            id,
            serial_number: input.serial_number,
            ip_address: input.ip_address,
            port: input.port,
            unit_id: input.unit_id,
            model: input.model,
            site_name: input.site_name,
            enabled: input.enabled,
            output_folder: input.output_folder,
            last_record_index: Cursor::default(),
            last_collected: None,
            last_timesync: None,
            last_drift_seconds: None,
            created: at,
            updated: at,
        };
        self.inventory.meters.push(meter.clone());
        self.save()?;
        info!("Created meter {} ({})", meter.id, meter.serial_number);
        Ok(meter)
    }

    /// Replace the editable fields; cursor and collection history are kept
    pub fn update(&mut self, id: u32, input: MeterInput) -> Result<Meter> {
        input.validate()?;
        let meter = self.get_mut(id)?;
        meter.serial_number = input.serial_number;
        meter.ip_address = input.ip_address;
        meter.port = input.port;
        meter.unit_id = input.unit_id;
        meter.model = input.model;
        meter.site_name = input.site_name;
        meter.enabled = input.enabled;
        meter.output_folder = input.output_folder;
        meter.updated = now();
        let meter = meter.clone();
        self.save()?;
        Ok(meter)
    }

    /// Returns false when no meter has this id
    pub fn delete(&mut self, id: u32) -> Result<bool> {
        let before = self.inventory.meters.len();
        self.inventory.meters.retain(|m| m.id != id);
        if self.inventory.meters.len() == before {
            return Ok(false);
        }
        self.save()?;
        info!("Deleted meter {}", id);
        Ok(true)
    }

    /// Persist a new cursor after a successful cycle
    pub fn update_pointer(
        &mut self,
        id: u32,
        next: Cursor,
        collected_at: NaiveDateTime,
    ) -> Result<()> {
        let meter = self.get_mut(id)?;
        if next < meter.last_record_index {
            bail!(
                "Refusing to move cursor of meter {} backwards ({} -> {})",
                id,
                meter.last_record_index.0,
                next.0
            );
        }
        meter.last_record_index = next;
        meter.last_collected = Some(collected_at);
        meter.updated = now();
        self.save()?;
        debug!("Meter {} cursor -> {}", id, next.0);
        Ok(())
    }

    pub fn update_timesync(&mut self, id: u32, at: NaiveDateTime, drift_seconds: f64) -> Result<()> {
        let meter = self.get_mut(id)?;
        meter.last_timesync = Some(at);
        meter.last_drift_seconds = Some(drift_seconds);
        meter.updated = now();
        self.save()
    }

    fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.inventory)?;
        let tmp = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}
