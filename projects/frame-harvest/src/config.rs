// Validated run configuration
//
// Built once from the command line / environment and shared by reference
// with every component for the lifetime of a run.

use crate::cli::Args;
use anyhow::{bail, ensure, Context, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const LEDGER_FILE: &str = "processed_videos.csv";
pub const SUMMARY_FILE: &str = "frame_summary_log.csv";

#[derive(clap::ValueEnum, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    /// Fixed cadence over the whole video
    Uniform,
    /// Dense cadence inside the most object-dense window
    Detection,
}

/// Device a unit is pinned to. `-1` denotes the CPU.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct AcceleratorId(pub i32);

impl AcceleratorId {
    pub const CPU: AcceleratorId = AcceleratorId(-1);

    pub fn is_cpu(&self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for AcceleratorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_cpu() {
            write!(f, "cpu")
        } else {
            write!(f, "gpu{}", self.0)
        }
    }
}

/// Settings for the detection-guided policy.
#[derive(Serialize, Debug, Clone)]
pub struct DetectionSettings {
    pub model_path: PathBuf,
    pub target_class: String,
    pub confidence: f32,
    pub sampling_stride: usize,
    pub window_secs: usize,
    pub extract_every_secs: f64,
}

#[derive(Serialize, Debug, Clone)]
pub struct RunConfig {
    pub input_root: PathBuf,
    pub output_root: PathBuf,
    pub log_dir: PathBuf,
    pub root_category: String,
    pub excluded_categories: BTreeSet<String>,
    pub mode: ExtractionMode,
    pub uniform_frames_per_sec: f64,
    pub detection: Option<DetectionSettings>,
    pub segments: usize,
    pub accelerators: Vec<AcceleratorId>,
    pub workers_per_accelerator: usize,
    #[serde(with = "opt_secs")]
    pub unit_timeout: Option<Duration>,
    pub status_addr: Option<SocketAddr>,
}

impl RunConfig {
    pub fn ledger_path(&self) -> PathBuf {
        self.log_dir.join(LEDGER_FILE)
    }

    pub fn summary_path(&self) -> PathBuf {
        self.log_dir.join(SUMMARY_FILE)
    }

    /// Detection stride, or 1 when running uniform extraction.
    pub fn sampling_stride(&self) -> usize {
        self.detection
            .as_ref()
            .map(|d| d.sampling_stride)
            .unwrap_or(1)
    }
}

impl TryFrom<Args> for RunConfig {
    type Error = anyhow::Error;

    fn try_from(args: Args) -> Result<Self> {
        ensure!(
            args.input_root.is_dir(),
            "Input root is not a directory: {:?}",
            args.input_root
        );
        let input_root = args
            .input_root
            .canonicalize()
            .with_context(|| format!("Failed to resolve input root {:?}", args.input_root))?;

        ensure!(
            args.uniform_frames_per_sec > 0.0,
            "uniform-frames-per-sec must be positive, got {}",
            args.uniform_frames_per_sec
        );
        ensure!(args.segments >= 1, "segments must be at least 1");
        ensure!(
            args.workers_per_accelerator >= 1,
            "workers-per-accelerator must be at least 1"
        );

        let accelerators = parse_accelerators(&args.accelerators)?;

        let detection = match args.mode {
            ExtractionMode::Uniform => None,
            ExtractionMode::Detection => {
                let model_path = args
                    .model_path
                    .clone()
                    .context("--model-path is required in detection mode")?;
                ensure!(
                    model_path.is_file(),
                    "Model file not found: {:?}",
                    model_path
                );
                ensure!(
                    (0.0..=1.0).contains(&args.confidence),
                    "confidence must be within [0, 1], got {}",
                    args.confidence
                );
                ensure!(args.sampling_stride >= 1, "sampling-stride must be at least 1");
                ensure!(args.window_secs >= 1, "window-secs must be at least 1");
                ensure!(
                    args.extract_every_secs > 0.0,
                    "extract-every-secs must be positive, got {}",
                    args.extract_every_secs
                );
                ensure!(!args.target_class.trim().is_empty(), "target-class is empty");
                Some(DetectionSettings {
                    model_path,
                    target_class: args.target_class.trim().to_string(),
                    confidence: args.confidence,
                    sampling_stride: args.sampling_stride,
                    window_secs: args.window_secs,
                    extract_every_secs: args.extract_every_secs,
                })
            }
        };

        let log_dir = args
            .log_dir
            .clone()
            .unwrap_or_else(|| args.output_root.join("_logs").join("extract"));

        let root_category = match args.root_category {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => default_root_category(&input_root),
        };

        let excluded_categories = args
            .excluded_categories
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            input_root,
            output_root: args.output_root,
            log_dir,
            root_category,
            excluded_categories,
            mode: args.mode,
            uniform_frames_per_sec: args.uniform_frames_per_sec,
            detection,
            segments: args.segments,
            accelerators,
            workers_per_accelerator: args.workers_per_accelerator,
            unit_timeout: args.unit_timeout_secs.map(Duration::from_secs),
            status_addr: args.status_addr,
        })
    }
}

/// Deduplicates ids while keeping their first-seen order.
fn parse_accelerators(ids: &[i32]) -> Result<Vec<AcceleratorId>> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for &id in ids {
        if id < -1 {
            bail!("Invalid accelerator id {} (use -1 for CPU)", id);
        }
        if seen.insert(id) {
            out.push(AcceleratorId(id));
        }
    }
    ensure!(!out.is_empty(), "At least one accelerator id is required");
    Ok(out)
}

/// The dataset name sits one level above the category folders,
/// e.g. `vietnam_data/organized_videos/<category>`.
fn default_root_category(input_root: &Path) -> String {
    input_root
        .parent()
        .and_then(|p| p.file_name())
        .or_else(|| input_root.file_name())
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string()
}

mod opt_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }
}
