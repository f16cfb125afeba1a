use crate::config::ExtractionMode;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Root directory holding one sub-directory of videos per category
    #[arg(long, env = "FRAME_HARVEST_INPUT_ROOT")]
    pub input_root: PathBuf,

    /// Root directory for extracted frames
    #[arg(long, env = "FRAME_HARVEST_OUTPUT_ROOT")]
    pub output_root: PathBuf,

    /// Directory for the ledger, summary log and run reports [default: <output_root>/_logs/extract]
    #[arg(long, env = "FRAME_HARVEST_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Root category recorded in the ledger [default: parent directory name of the input root]
    #[arg(long, env = "FRAME_HARVEST_ROOT_CATEGORY")]
    pub root_category: Option<String>,

    /// Comma separated sub-categories to skip
    #[arg(long, env = "FRAME_HARVEST_EXCLUDED_CATEGORIES", value_delimiter = ',')]
    pub excluded_categories: Vec<String>,

    /// Extraction policy
    #[arg(long, env = "FRAME_HARVEST_MODE", value_enum, default_value_t = ExtractionMode::Uniform)]
    pub mode: ExtractionMode,

    /// Frames per second written in uniform mode
    #[arg(long, env = "FRAME_HARVEST_UNIFORM_FRAMES_PER_SEC", default_value_t = 3.0)]
    pub uniform_frames_per_sec: f64,

    /// Detector class that counts as a hit
    #[arg(long, env = "FRAME_HARVEST_TARGET_CLASS", default_value = "person")]
    pub target_class: String,

    /// Minimum detector confidence for a hit
    #[arg(long, env = "FRAME_HARVEST_CONFIDENCE", default_value_t = 0.25)]
    pub confidence: f32,

    /// Run the detector on every n-th frame during the scan pass
    #[arg(long, env = "FRAME_HARVEST_SAMPLING_STRIDE", default_value_t = 5)]
    pub sampling_stride: usize,

    /// Length of the densest window to extract, in seconds
    #[arg(long, env = "FRAME_HARVEST_WINDOW_SECS", default_value_t = 900)]
    pub window_secs: usize,

    /// Seconds between frames written inside the selected window
    #[arg(long, env = "FRAME_HARVEST_EXTRACT_EVERY_SECS", default_value_t = 2.0)]
    pub extract_every_secs: f64,

    /// Number of segments each video is split into
    #[arg(long, env = "FRAME_HARVEST_SEGMENTS", default_value_t = 1)]
    pub segments: usize,

    /// Comma separated accelerator ids (-1 runs on the CPU)
    #[arg(
        long,
        env = "FRAME_HARVEST_ACCELERATORS",
        value_delimiter = ',',
        allow_hyphen_values = true,
        default_value = "0"
    )]
    pub accelerators: Vec<i32>,

    /// Units allowed to run concurrently on one accelerator
    #[arg(long, env = "FRAME_HARVEST_WORKERS_PER_ACCELERATOR", default_value_t = 1)]
    pub workers_per_accelerator: usize,

    /// RT-DETR ONNX model used in detection mode
    #[arg(long, env = "FRAME_HARVEST_MODEL_PATH")]
    pub model_path: Option<PathBuf>,

    /// Mark a unit failed when it runs longer than this
    #[arg(long, env = "FRAME_HARVEST_UNIT_TIMEOUT_SECS")]
    pub unit_timeout_secs: Option<u64>,

    /// Serve run progress over HTTP on this address
    #[arg(long, env = "FRAME_HARVEST_STATUS_ADDR")]
    pub status_addr: Option<SocketAddr>,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
