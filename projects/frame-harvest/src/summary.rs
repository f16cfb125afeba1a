use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::Path;

pub const TOTAL_ROW: &str = "TOTAL";
const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SummaryRow {
    pub date: String,
    pub root_category: String,
    pub sub_category: String,
    pub image_count: usize,
}

/// Per-category frame totals for one run.
#[derive(Debug, Default, Clone)]
pub struct SummaryReporter {
    counts: BTreeMap<String, usize>,
}

impl SummaryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, sub_category: &str, frames: usize) {
        *self.counts.entry(sub_category.to_string()).or_insert(0) += frames;
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn counts(&self) -> &BTreeMap<String, usize> {
        &self.counts
    }

    /// One row per category in name order, then the `TOTAL` row.
    pub fn rows(&self, root_category: &str, at: DateTime<Local>) -> Vec<SummaryRow> {
        let date = at.format(DATE_FORMAT).to_string();
        let row = |sub_category: &str, image_count: usize| SummaryRow {
            date: date.clone(),
            root_category: root_category.to_string(),
            sub_category: sub_category.to_string(),
            image_count,
        };

        let mut rows: Vec<SummaryRow> = self
            .counts
            .iter()
            .map(|(category, &count)| row(category, count))
            .collect();
        rows.push(row(TOTAL_ROW, self.total()));
        rows
    }

    /// Appends this run's rows to `path`, writing the header only when the
    /// file is new. Earlier runs' rows are never touched.
    pub fn append_to(&self, path: &Path, root_category: &str, at: DateTime<Local>) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open summary log {:?}", path))?;
        let needs_header = file.metadata()?.len() == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);
        for row in self.rows(root_category, at) {
            writer.serialize(row)?;
        }
        writer.flush()?;

        tracing::info!(
            "Appended {} categories ({} frames total) to {:?}",
            self.counts.len(),
            self.total(),
            path
        );
        Ok(())
    }
}
