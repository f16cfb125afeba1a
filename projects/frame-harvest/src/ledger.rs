// Durable record of fully extracted videos
//
// One CSV row per video, keyed by (root_category, sub_category, filename).
// Loaded once at run start and only ever appended to.

use crate::pipeline::types::VideoKey;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

pub type LedgerEntry = VideoKey;

pub struct ProcessingLedger {
    path: PathBuf,
    seen: HashSet<LedgerEntry>,
}

impl ProcessingLedger {
    /// Loads the ledger at `path`. A missing file is an empty ledger.
    pub fn open(path: &Path) -> Result<Self> {
        let mut seen = HashSet::new();

        if path.exists() {
            let mut reader = csv::ReaderBuilder::new()
                .flexible(true)
                .from_path(path)
                .with_context(|| format!("Failed to open ledger {:?}", path))?;
            for (line, record) in reader.deserialize::<LedgerEntry>().enumerate() {
                match record {
                    Ok(entry) => {
                        seen.insert(entry);
                    }
                    Err(e) => {
                        tracing::warn!("Skipping malformed ledger row {} in {:?}: {}", line + 2, path, e);
                    }
                }
            }
        }

        tracing::info!("Loaded {} processed video(s) from {:?}", seen.len(), path);
        Ok(Self {
            path: path.to_path_buf(),
            seen,
        })
    }

    pub fn contains(&self, key: &VideoKey) -> bool {
        self.seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Appends `key` and flushes. Already-recorded keys are not written twice.
    pub fn append(&mut self, key: &VideoKey) -> Result<()> {
        if self.seen.contains(key) {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create ledger directory {:?}", parent))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open ledger {:?} for append", self.path))?;
        let needs_header = file.metadata()?.len() == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);
        writer.serialize(key)?;
        writer.flush()?;

        self.seen.insert(key.clone());
        Ok(())
    }
}
