use crate::error::ExtractError;
use crate::video::opencv_reader::OpencvReader;
use crate::video::VideoReader;
use serde::Serialize;
use std::path::Path;

/// Properties of a video source, re-read on every run.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub fps: f64,
    pub frame_count: usize,
    pub duration_sec: f64,
}

impl VideoInfo {
    /// Rejects sources that report no frames or no frame rate.
    pub fn new(path: &Path, fps: f64, frame_count: usize) -> Result<Self, ExtractError> {
        if !fps.is_finite() || fps <= 0.0 {
            return Err(ExtractError::unreadable(path, format!("invalid fps {fps}")));
        }
        if frame_count == 0 {
            return Err(ExtractError::unreadable(path, "zero frames"));
        }
        Ok(Self {
            fps,
            frame_count,
            duration_sec: frame_count as f64 / fps,
        })
    }

    /// Duration truncated to whole seconds.
    pub fn whole_seconds(&self) -> usize {
        self.duration_sec.floor() as usize
    }
}

pub fn probe(path: &Path) -> Result<VideoInfo, ExtractError> {
    let reader = OpencvReader::open(path).map_err(|e| match e.downcast::<ExtractError>() {
        Ok(err) => err,
        Err(other) => ExtractError::unreadable(path, other.to_string()),
    })?;
    VideoInfo::new(path, reader.fps(), reader.frame_count())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_info_rejects_empty_sources() {
        let path = Path::new("clip.mp4");
        assert!(matches!(
            VideoInfo::new(path, 0.0, 100),
            Err(ExtractError::SourceUnreadable { .. })
        ));
        assert!(matches!(
            VideoInfo::new(path, f64::NAN, 100),
            Err(ExtractError::SourceUnreadable { .. })
        ));
        assert!(matches!(
            VideoInfo::new(path, 30.0, 0),
            Err(ExtractError::SourceUnreadable { .. })
        ));
    }

    #[test]
    fn test_video_info_duration() {
        let info = VideoInfo::new(Path::new("clip.mp4"), 30.0, 36_015).unwrap();
        assert_eq!(info.whole_seconds(), 1200);
        assert!((info.duration_sec - 1200.5).abs() < 1e-9);
    }

    #[test]
    fn test_probe_missing_file_is_unreadable() {
        let err = probe(Path::new("/definitely/not/here.mp4")).unwrap_err();
        assert_eq!(err.kind(), "source_unreadable");
    }
}
