// Run report persisted to the log directory
//
// One JSON document per run: what was skipped and why, how every scheduled
// video ended, and each unit failure attributable to its (video, unit).

use crate::config::ExtractionMode;
use crate::pipeline::scheduler::{RunOutcome, UnitFailure, VideoOutcome};
use crate::pipeline::types::VideoKey;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Excluded,
    AlreadyProcessed,
    Unreadable,
}

#[derive(Serialize, Debug, Clone)]
pub struct SkippedVideo {
    pub video: VideoKey,
    pub reason: SkipReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: ExtractionMode,
    pub root_category: String,
    pub input_root: PathBuf,
    pub output_root: PathBuf,
    pub skipped: Vec<SkippedVideo>,
    pub videos: Vec<VideoOutcome>,
    pub failures: Vec<UnitFailure>,
    pub peak_in_flight: BTreeMap<String, usize>,
    pub frames_by_category: BTreeMap<String, usize>,
    pub total_frames: usize,
}

impl RunReport {
    pub fn file_name(started_at: &DateTime<Utc>) -> String {
        format!("run_report_{}.json", started_at.format("%Y%m%d_%H%M%S"))
    }

    pub fn skipped_count(&self, reason: SkipReason) -> usize {
        self.skipped.iter().filter(|s| s.reason == reason).count()
    }

    pub fn absorb(&mut self, outcome: RunOutcome) {
        self.videos = outcome.videos;
        self.failures = outcome.failures;
        self.peak_in_flight = outcome.peak_in_flight;
    }

    pub fn save(&self, log_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory {:?}", log_dir))?;
        let path = log_dir.join(Self::file_name(&self.started_at));
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).with_context(|| format!("Failed to write run report {:?}", path))?;
        Ok(path)
    }
}
