use super::VideoReader;
use crate::error::ExtractError;
use anyhow::Result;
use opencv::{
    prelude::*,
    videoio::{
        VideoCapture, CAP_ANY, CAP_PROP_FPS, CAP_PROP_FRAME_COUNT, CAP_PROP_HW_ACCELERATION,
        CAP_PROP_POS_FRAMES, VIDEO_ACCELERATION_ANY,
    },
};
use std::path::{Path, PathBuf};

/// Forward gaps up to this many frames are skipped with `grab`, which avoids
/// the colour conversion of a full read. Longer or backward jumps seek.
const MAX_GRAB_GAP: usize = 50;

pub struct OpencvReader {
    capture: VideoCapture,
    path: PathBuf,
    fps: f64,
    frame_count: usize,
    /// Index of the frame the next `read` would return.
    position: usize,
}

impl OpencvReader {
    pub fn open(path: &Path) -> Result<Self> {
        let path_str = path
            .to_str()
            .ok_or_else(|| ExtractError::unreadable(path, "path is not valid UTF-8"))?;
        let mut capture = VideoCapture::from_file(path_str, CAP_ANY)
            .map_err(|e| ExtractError::unreadable(path, e.to_string()))?;
        if !capture.is_opened()? {
            return Err(ExtractError::unreadable(path, "failed to open video file").into());
        }

        // VideoToolbox on macOS, VA-API on Linux, etc. Falls back to software silently.
        match capture.set(CAP_PROP_HW_ACCELERATION, VIDEO_ACCELERATION_ANY as f64) {
            Ok(true) => tracing::debug!("OpencvReader: hardware acceleration enabled"),
            _ => tracing::debug!("OpencvReader: hardware acceleration not available"),
        }

        let fps = capture.get(CAP_PROP_FPS)?;
        let frame_count = capture.get(CAP_PROP_FRAME_COUNT)?.max(0.0) as usize;

        tracing::debug!(
            "OpencvReader: opened {:?}, fps={:.2}, stream_frames={}",
            path,
            fps,
            frame_count
        );

        Ok(Self {
            capture,
            path: path.to_path_buf(),
            fps,
            frame_count,
            position: 0,
        })
    }

    fn seek_to_frame(&mut self, frame_index: usize) -> Result<()> {
        self.capture
            .set(CAP_PROP_POS_FRAMES, frame_index as f64)
            .map_err(|e| ExtractError::Decode {
                frame: frame_index,
                reason: format!("seek failed in {:?}: {}", self.path, e),
            })?;
        self.position = frame_index;
        Ok(())
    }
}

impl VideoReader for OpencvReader {
    fn fps(&self) -> f64 {
        self.fps
    }

    fn frame_count(&self) -> usize {
        self.frame_count
    }

    fn seek_and_read(&mut self, frame_index: usize) -> Result<Option<Mat>> {
        if frame_index >= self.frame_count {
            return Ok(None);
        }

        if frame_index < self.position || frame_index - self.position > MAX_GRAB_GAP {
            self.seek_to_frame(frame_index)?;
        }
        while self.position < frame_index {
            if !self.capture.grab()? {
                return Ok(None);
            }
            self.position += 1;
        }

        let mut frame = Mat::default();
        let success = self.capture.read(&mut frame).map_err(|e| ExtractError::Decode {
            frame: frame_index,
            reason: e.to_string(),
        })?;
        if !success || frame.empty() {
            return Ok(None);
        }
        self.position += 1;

        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{self, Scalar, Size, CV_8UC3};
    use opencv::videoio::VideoWriter;

    const FRAMES: usize = 80;

    /// Writes a 10 fps MJPG clip whose frame `i` is a flat grey of `3 * i`.
    fn write_clip(path: &Path) {
        let fourcc = VideoWriter::fourcc('M', 'J', 'P', 'G').unwrap();
        let mut writer =
            VideoWriter::new(path.to_str().unwrap(), fourcc, 10.0, Size::new(64, 48), true).unwrap();
        assert!(writer.is_opened().unwrap());
        for i in 0..FRAMES {
            let frame =
                Mat::new_rows_cols_with_default(48, 64, CV_8UC3, Scalar::all((i * 3) as f64)).unwrap();
            writer.write(&frame).unwrap();
        }
        writer.release().unwrap();
    }

    fn frame_index(frame: &Mat) -> usize {
        let mean = core::mean(frame, &core::no_array()).unwrap();
        (mean[0] / 3.0).round() as usize
    }

    fn read(reader: &mut OpencvReader, index: usize) -> usize {
        let frame = reader.seek_and_read(index).unwrap().unwrap();
        assert_eq!((frame.cols(), frame.rows()), (64, 48));
        frame_index(&frame)
    }

    #[test]
    fn test_reads_strided_backward_and_past_end() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("clip.avi");
        write_clip(&path);

        let mut reader = OpencvReader::open(&path).unwrap();
        assert_eq!(reader.frame_count(), FRAMES);
        assert!((reader.fps() - 10.0).abs() < 1e-6);

        // Short forward gaps go through grab.
        assert_eq!(read(&mut reader, 0), 0);
        assert_eq!(read(&mut reader, 5), 5);
        assert_eq!(read(&mut reader, 10), 10);
        // Backward and long jumps seek.
        assert_eq!(read(&mut reader, 3), 3);
        assert_eq!(read(&mut reader, 70), 70);
        assert_eq!(read(&mut reader, 71), 71);

        assert!(reader.seek_and_read(FRAMES).unwrap().is_none());
    }

    #[test]
    fn test_open_missing_file_is_unreadable() {
        let tmp = tempfile::tempdir().unwrap();
        let err = OpencvReader::open(&tmp.path().join("missing.mp4")).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ExtractError>(),
            Some(ExtractError::SourceUnreadable { .. })
        ));
    }
}
