use crate::pipeline::types::VideoKey;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv"];

/// A video file found under `<input_root>/<sub_category>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSource {
    pub key: VideoKey,
    pub path: PathBuf,
}

fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| VIDEO_EXTENSIONS.contains(&s.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Lists videos sitting directly inside each category directory, ordered by
/// (sub_category, filename) so accelerator assignment is reproducible.
pub fn list_videos(input_root: &Path, root_category: &str) -> Vec<VideoSource> {
    let mut videos: Vec<VideoSource> = WalkDir::new(input_root)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("Skipping unreadable entry {:?}: {}", e.path(), e);
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .filter(|e| is_video(e.path()))
        .filter_map(|e| {
            let sub_category = e.path().parent()?.file_name()?.to_str()?.to_string();
            let filename = e.file_name().to_str()?.to_string();
            Some(VideoSource {
                key: VideoKey::new(root_category, sub_category, filename),
                path: e.path().to_path_buf(),
            })
        })
        .collect();

    videos.sort_by(|a, b| a.key.cmp(&b.key));
    videos
}

/// Splits sources into (kept, excluded) by sub-category.
pub fn partition_excluded(
    videos: Vec<VideoSource>,
    excluded: &BTreeSet<String>,
) -> (Vec<VideoSource>, Vec<VideoSource>) {
    videos
        .into_iter()
        .partition(|v| !excluded.contains(&v.key.sub_category))
}
