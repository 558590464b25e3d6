//! CSV output of newly collected records

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::history::LogRecord;

pub const CSV_HEADER: [&str; 8] = [
    "serial",
    "index",
    "seq",
    "timestamp",
    "kwh_import",
    "kwh_export",
    "kvarh_import",
    "kvarh_export",
];

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// `{dir}/{serial}_{YYYYmmdd_HHMMSS}.csv`
pub fn csv_path(dir: &Path, serial: &str, at: NaiveDateTime) -> PathBuf {
    dir.join(format!("{}_{}.csv", serial, at.format("%Y%m%d_%H%M%S")))
}

fn energy(value: f64) -> String {
    format!("{:.1}", value)
}

/// Create `path`, or `{stem}_{n}.{ext}` when it already exists. Existing
/// files are never truncated.
fn create_unique(path: &Path) -> Result<(File, PathBuf)> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());

    let mut candidate = path.to_path_buf();
    for n in 1u32.. {
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(file) => return Ok((file, candidate)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let name = match &ext {
                    Some(ext) => format!("{}_{}.{}", stem, n, ext),
                    None => format!("{}_{}", stem, n),
                };
                candidate = path.with_file_name(name);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create {}", candidate.display()))
            }
        }
    }
    anyhow::bail!("No free file name next to {}", path.display())
}

/// Write records to a new file at `path`, creating the parent folder when
/// needed. Returns the path actually written.
pub fn write_records(
    path: &Path,
    serial: &str,
    records: &[LogRecord],
    delimiter: u8,
) -> Result<PathBuf> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output folder {}", parent.display()))?;
    }

    let (file, path) = create_unique(path)?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(file);

    writer.write_record(CSV_HEADER)?;
    for r in records {
        writer
            .write_record([
                serial.to_string(),
                r.global_index.to_string(),
                r.raw_index_low16.to_string(),
                r.timestamp.format(TIMESTAMP_FORMAT).to_string(),
                energy(r.kwh_import),
                energy(r.kwh_export),
                energy(r.kvarh_import),
                energy(r.kvarh_export),
            ])
            .with_context(|| format!("Failed to write record {}", r.global_index))?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to flush {}", path.display()))?;

    info!("CSV written: {} ({} records)", path.display(), records.len());
    Ok(path)
}
