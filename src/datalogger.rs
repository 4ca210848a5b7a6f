//! CSV data loggers for raw measurement points
// (c) 2024 Ross Younger

use std::fs::File;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::rpm::{ProbeDataPoint, ThroughputDataPoint};

/// A sink for measurement points of one row shape.
///
/// Logging never fails the measurement: a sick logger complains and drops
/// rows.
pub trait DataLogger<T>: Send + Sync {
    /// Appends one row
    fn log(&self, row: &T);
    /// Flushes buffered rows to storage
    fn export(&self);
    /// Flushes and stops accepting rows
    fn close(&self);
}

/// Writes rows to a CSV file with a header row
pub struct CsvDataLogger<T> {
    writer: Mutex<Option<csv::Writer<File>>>,
    _row: PhantomData<fn(&T)>,
}

impl<T: Serialize> CsvDataLogger<T> {
    /// Creates `path`, truncating anything already there
    pub fn create(path: &str) -> Result<Self> {
        let writer = csv::Writer::from_path(path)
            .with_context(|| format!("creating data log {path}"))?;
        Ok(Self {
            writer: Mutex::new(Some(writer)),
            _row: PhantomData,
        })
    }
}

impl<T: Serialize + Send + Sync> DataLogger<T> for CsvDataLogger<T> {
    fn log(&self, row: &T) {
        if let Some(writer) = self.writer.lock().unwrap().as_mut() {
            if let Err(e) = writer.serialize(row) {
                warn!("data logger write failed: {e}");
            }
        }
    }

    fn export(&self) {
        if let Some(writer) = self.writer.lock().unwrap().as_mut() {
            if let Err(e) = writer.flush() {
                warn!("data logger flush failed: {e}");
            }
        }
    }

    fn close(&self) {
        if let Some(mut writer) = self.writer.lock().unwrap().take() {
            let _ = writer.flush();
        }
    }
}

/// Swallows everything; stands in wherever logging is disabled
pub struct NullDataLogger;

impl<T> DataLogger<T> for NullDataLogger {
    fn log(&self, _row: &T) {}
    fn export(&self) {}
    fn close(&self) {}
}

/// The four per-run data logs
pub struct Loggers {
    /// Self probe points, both directions
    pub self_probe: Arc<dyn DataLogger<ProbeDataPoint>>,
    /// Foreign probe points
    pub foreign_probe: Arc<dyn DataLogger<ProbeDataPoint>>,
    /// Download throughput samples
    pub download_throughput: Arc<dyn DataLogger<ThroughputDataPoint>>,
    /// Upload throughput samples
    pub upload_throughput: Arc<dyn DataLogger<ThroughputDataPoint>>,
}

impl Loggers {
    /// No logging at all
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            self_probe: Arc::new(NullDataLogger),
            foreign_probe: Arc::new(NullDataLogger),
            download_throughput: Arc::new(NullDataLogger),
            upload_throughput: Arc::new(NullDataLogger),
        }
    }

    /// Opens the four CSV files derived from `base`.
    ///
    /// A file that cannot be opened disables just that log, with a warning;
    /// the run continues.
    #[must_use]
    pub fn create(base: Option<&str>, now: DateTime<Utc>) -> Self {
        let Some(base) = base else {
            return Self::disabled();
        };
        let [self_probe, foreign_probe, download, upload] = logger_filenames(base, now);
        Self {
            self_probe: open_or_null(&self_probe, "self probe"),
            foreign_probe: open_or_null(&foreign_probe, "foreign probe"),
            download_throughput: open_or_null(&download, "download throughput"),
            upload_throughput: open_or_null(&upload, "upload throughput"),
        }
    }

    /// Flushes and closes all four logs
    pub fn export_and_close(&self) {
        self.self_probe.export();
        self.self_probe.close();
        self.foreign_probe.export();
        self.foreign_probe.close();
        self.download_throughput.export();
        self.download_throughput.close();
        self.upload_throughput.export();
        self.upload_throughput.close();
    }
}

/// The four filenames derived from a logger basename: kind and UTC timestamp
/// are inserted before the first `.`, if there is one.
#[must_use]
pub fn logger_filenames(base: &str, now: DateTime<Utc>) -> [String; 4] {
    let stamp = now.format("%m-%d-%Y-%H-%M-%S").to_string();
    [
        filename_append(base, &format!("-self-{stamp}")),
        filename_append(base, &format!("-foreign-{stamp}")),
        filename_append(base, &format!("-throughput-download{stamp}")),
        filename_append(base, &format!("-throughput-upload{stamp}")),
    ]
}

fn filename_append(base: &str, suffix: &str) -> String {
    match base.find('.') {
        Some(dot) => format!("{}{}{}", &base[..dot], suffix, &base[dot..]),
        None => format!("{base}{suffix}"),
    }
}

fn open_or_null<T>(path: &str, what: &str) -> Arc<dyn DataLogger<T>>
where
    T: Serialize + Send + Sync + 'static,
{
    match CsvDataLogger::create(path) {
        Ok(logger) => Arc::new(logger),
        Err(e) => {
            warn!("Could not create the file for storing {what} results ({path}): {e}. Disabling functionality.");
            Arc::new(NullDataLogger)
        }
    }
}
