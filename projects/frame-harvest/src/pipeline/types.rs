use crate::config::{AcceleratorId, ExtractionMode};
use crate::video::probe::VideoInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Instant;

pub type UnitId = usize;

/// Identity of a source video. Field names double as the ledger columns.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VideoKey {
    pub root_category: String,
    pub sub_category: String,
    pub filename: String,
}

impl VideoKey {
    pub fn new(
        root_category: impl Into<String>,
        sub_category: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            root_category: root_category.into(),
            sub_category: sub_category.into(),
            filename: filename.into(),
        }
    }

    /// File name without extension; used for output directory and frame names.
    pub fn stem(&self) -> &str {
        Path::new(&self.filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.filename)
    }

    /// `<output_root>/<sub_category>/<stem>`
    pub fn output_dir(&self, output_root: &Path) -> PathBuf {
        output_root.join(&self.sub_category).join(self.stem())
    }
}

impl fmt::Display for VideoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sub_category, self.filename)
    }
}

/// One independently schedulable slice of a video.
#[derive(Serialize, Debug, Clone)]
pub struct ProcessingUnit {
    pub id: UnitId,
    pub video: VideoKey,
    pub path: PathBuf,
    pub info: VideoInfo,
    /// Position of this unit within its video, 0-based
    pub segment: usize,
    pub start_frame: usize,
    /// Exclusive
    pub end_frame: usize,
    pub accelerator: AcceleratorId,
    pub sampling_stride: usize,
    pub mode: ExtractionMode,
}

/// Frames a unit actually wrote.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct ExtractedFrameSet {
    pub output_dir: PathBuf,
    pub frames: Vec<usize>,
}

impl ExtractedFrameSet {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VideoState {
    Pending,
    InProgress,
    Done,
    PartiallyFailed,
}

#[derive(Debug, Serialize, Clone, Default)]
pub struct AcceleratorProgress {
    pub queued: usize,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Read-only view of a run shared between the coordinator and the status server.
#[derive(Debug)]
pub struct RunProgress {
    pub total_units: AtomicUsize,
    pub completed_units: AtomicUsize,
    pub failed_units: AtomicUsize,
    pub videos_total: AtomicUsize,
    pub videos_done: AtomicUsize,
    pub videos_partially_failed: AtomicUsize,
    pub frames_written: AtomicUsize,
    pub is_active: AtomicBool,
    pub accelerators: RwLock<BTreeMap<String, AcceleratorProgress>>,
    pub start_time: Instant,
}

impl Default for RunProgress {
    fn default() -> Self {
        Self {
            total_units: AtomicUsize::new(0),
            completed_units: AtomicUsize::new(0),
            failed_units: AtomicUsize::new(0),
            videos_total: AtomicUsize::new(0),
            videos_done: AtomicUsize::new(0),
            videos_partially_failed: AtomicUsize::new(0),
            frames_written: AtomicUsize::new(0),
            is_active: AtomicBool::new(true),
            accelerators: RwLock::new(BTreeMap::new()),
            start_time: Instant::now(),
        }
    }
}

impl RunProgress {
    pub fn update_accelerator(&self, id: AcceleratorId, f: impl FnOnce(&mut AcceleratorProgress)) {
        if let Ok(mut map) = self.accelerators.write() {
            f(map.entry(id.to_string()).or_default());
        }
    }

    pub fn to_progress_json(&self) -> serde_json::Value {
        let accelerators = self
            .accelerators
            .read()
            .map(|m| m.clone())
            .unwrap_or_default();
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let completed = self.completed_units.load(Ordering::Relaxed);

        serde_json::json!({
            "is_active": self.is_active.load(Ordering::Relaxed),
            "units": {
                "total": self.total_units.load(Ordering::Relaxed),
                "completed": completed,
                "failed": self.failed_units.load(Ordering::Relaxed),
            },
            "videos": {
                "total": self.videos_total.load(Ordering::Relaxed),
                "done": self.videos_done.load(Ordering::Relaxed),
                "partially_failed": self.videos_partially_failed.load(Ordering::Relaxed),
            },
            "frames_written": self.frames_written.load(Ordering::Relaxed),
            "accelerators": accelerators,
            "elapsed_secs": elapsed,
            "units_per_min": if elapsed > 0.0 { completed as f64 * 60.0 / elapsed } else { 0.0 },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_key_paths() {
        let key = VideoKey::new("vietnam_data", "crosswalk", "cam01.day.mp4");
        assert_eq!(key.stem(), "cam01.day");
        assert_eq!(
            key.output_dir(Path::new("/out")),
            PathBuf::from("/out/crosswalk/cam01.day")
        );
        assert_eq!(key.to_string(), "crosswalk/cam01.day.mp4");
    }

    #[test]
    fn test_progress_json_counts() {
        let progress = RunProgress::default();
        progress.total_units.store(4, Ordering::Relaxed);
        progress.completed_units.store(3, Ordering::Relaxed);
        progress.update_accelerator(AcceleratorId(0), |a| a.in_flight += 1);
        progress.update_accelerator(AcceleratorId::CPU, |a| a.queued = 2);

        let json = progress.to_progress_json();
        assert_eq!(json["units"]["total"], 4);
        assert_eq!(json["units"]["completed"], 3);
        assert_eq!(json["accelerators"]["gpu0"]["in_flight"], 1);
        assert_eq!(json["accelerators"]["cpu"]["queued"], 2);
    }
}
