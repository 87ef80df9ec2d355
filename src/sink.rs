//! Scalar metric sinks.
//!
//! A sink accepts `(tag, value, step)` triples and a flush. The analyzer
//! writes through `Option<&mut dyn ScalarSink>`; `None` turns every logging
//! call into a no-op.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Destination for scalar time series.
pub trait ScalarSink {
    /// Record one scalar value for `tag` at `step`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage rejects the write.
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()>;

    /// Persist buffered records.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage cannot be flushed.
    fn flush(&mut self) -> Result<()>;
}

impl<S: ScalarSink + ?Sized> ScalarSink for &mut S {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        (**self).add_scalar(tag, value, step)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

impl<S: ScalarSink + ?Sized> ScalarSink for Box<S> {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        (**self).add_scalar(tag, value, step)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// One written scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    /// Training step.
    pub step: u64,
    /// Metric tag, e.g. `train/losswise/cos_task__fd/visual/block_0`.
    pub tag: String,
    /// Metric value. NaN is written as JSON `null` and read back as NaN.
    #[serde(deserialize_with = "null_as_nan")]
    pub value: f64,
    /// Wall-clock time of the write.
    pub wall_time: DateTime<Utc>,
}

fn null_as_nan<'de, D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

/// In-memory sink. Useful for tests and for callers that forward records
/// elsewhere in batches.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Vec<ScalarRecord>,
    flushes: usize,
}

impl MemorySink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All records in write order.
    #[must_use]
    pub fn records(&self) -> &[ScalarRecord] {
        &self.records
    }

    /// Most recent value for a tag.
    #[must_use]
    pub fn last(&self, tag: &str) -> Option<f64> {
        self.records
            .iter()
            .rev()
            .find(|r| r.tag == tag)
            .map(|r| r.value)
    }

    /// All `(step, value)` points for a tag.
    #[must_use]
    pub fn series(&self, tag: &str) -> Vec<(u64, f64)> {
        self.records
            .iter()
            .filter(|r| r.tag == tag)
            .map(|r| (r.step, r.value))
            .collect()
    }

    /// Distinct tags in first-write order.
    #[must_use]
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = Vec::new();
        for record in &self.records {
            if !tags.contains(&record.tag.as_str()) {
                tags.push(&record.tag);
            }
        }
        tags
    }

    /// Number of flushes observed.
    #[must_use]
    pub const fn flush_count(&self) -> usize {
        self.flushes
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop all records and reset the flush counter.
    pub fn clear(&mut self) {
        self.records.clear();
        self.flushes = 0;
    }
}

impl ScalarSink for MemorySink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        self.records.push(ScalarRecord {
            step,
            tag: tag.to_string(),
            value,
            wall_time: Utc::now(),
        });
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }
}

/// Appends one JSON object per scalar to a file (`metrics.jsonl` style).
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    /// Open `path` for appending, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record from a JSONL metrics file. Malformed lines are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<ScalarRecord>> {
        let content = std::fs::read_to_string(path)?;
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

impl ScalarSink for JsonlSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        let record = ScalarRecord {
            step,
            tag: tag.to_string(),
            value,
            wall_time: Utc::now(),
        };
        writeln!(self.writer, "{}", serde_json::to_string(&record)?)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for JsonlSink {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::warn!(path = %self.path.display(), "failed to flush metrics file: {}", e);
        }
    }
}
