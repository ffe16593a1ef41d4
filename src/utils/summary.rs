//! Step-keyed observability stream.
//!
//! The training loop emits a flat map of named scalars (loss terms, quality
//! metrics, steps per second, learning rate) and occasional histograms. They
//! are appended as JSON lines to `events.jsonl` inside the model directory,
//! one record per value, keyed by the global step.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::error::Result;

/// One record of the event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Scalar {
        step: u64,
        name: String,
        value: f64,
        time: DateTime<Utc>,
    },
    Histogram {
        step: u64,
        name: String,
        /// Inclusive lower edge of the first bucket.
        min: f64,
        /// Inclusive upper edge of the last bucket.
        max: f64,
        counts: Vec<u64>,
        time: DateTime<Utc>,
    },
}

/// Appends named time series to a JSON-lines file.
pub struct SummaryWriter {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl SummaryWriter {
    /// Open (or create) the event stream inside `dir`.
    pub fn new(dir: &Path) -> Result<Self> {
        let path = dir.join("events.jsonl");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a named scalar for `step`.
    pub fn scalar(&mut self, step: u64, name: &str, value: f64) -> Result<()> {
        self.append(&Event::Scalar {
            step,
            name: name.to_string(),
            value,
            time: Utc::now(),
        })
    }

    /// Record a histogram of `values` with `buckets` equal-width bins.
    pub fn histogram(&mut self, step: u64, name: &str, values: &[f32], buckets: usize) -> Result<()> {
        let buckets = buckets.max(1);
        let (min, max) = values.iter().fold((f32::MAX, f32::MIN), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
        let (min, max) = if values.is_empty() { (0.0, 0.0) } else { (min, max) };
        let width = ((max - min) / buckets as f32).max(f32::MIN_POSITIVE);

        let mut counts = vec![0u64; buckets];
        for &v in values {
            let idx = (((v - min) / width) as usize).min(buckets - 1);
            counts[idx] += 1;
        }

        self.append(&Event::Histogram {
            step,
            name: name.to_string(),
            min: min as f64,
            max: max as f64,
            counts,
            time: Utc::now(),
        })
    }

    fn append(&mut self, event: &Event) -> Result<()> {
        let line = serde_json::to_string(event)?;
        writeln!(self.writer, "{}", line)?;
        self.writer.flush()?;
        Ok(())
    }
}
