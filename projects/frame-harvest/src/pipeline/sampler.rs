use crate::error::{is_cancelled, ExtractError};
use crate::pipeline::types::{ExtractedFrameSet, ProcessingUnit};
use crate::video::VideoReader;
use anyhow::Result;
use opencv::core::{Mat, Vector};
use std::fs;
use std::path::{Path, PathBuf};

/// Frame step for uniform sampling at `frames_per_sec`.
pub fn uniform_interval(fps: f64, frames_per_sec: f64) -> usize {
    ((fps / frames_per_sec).round() as usize).max(1)
}

/// Frame step for one frame every `extract_every_sec` seconds.
pub fn windowed_interval(fps: f64, extract_every_sec: f64) -> usize {
    ((fps * extract_every_sec).round() as usize).max(1)
}

/// Whole-video uniform plan: `duration_sec * frames_per_sec` frames spaced
/// `uniform_interval` apart, minus any index past the end of the source.
pub fn uniform_frames(
    duration_sec: usize,
    fps: f64,
    frames_per_sec: f64,
    total_frames: usize,
) -> Vec<usize> {
    let interval = uniform_interval(fps, frames_per_sec);
    let num_frames = (duration_sec as f64 * frames_per_sec).floor() as usize;
    (0..num_frames)
        .map(|i| i * interval)
        .take_while(|&idx| idx < total_frames)
        .collect()
}

/// Every `windowed_interval`-th frame of `[start_frame, end_frame)`.
pub fn windowed_frames(
    start_frame: usize,
    end_frame: usize,
    fps: f64,
    extract_every_sec: f64,
) -> Vec<usize> {
    let interval = windowed_interval(fps, extract_every_sec);
    (start_frame..end_frame).step_by(interval).collect()
}

/// Part of the whole-video uniform plan that falls inside one unit.
pub fn uniform_frames_for_unit(unit: &ProcessingUnit, frames_per_sec: f64) -> Vec<usize> {
    uniform_frames(
        unit.info.whole_seconds(),
        unit.info.fps,
        frames_per_sec,
        unit.info.frame_count,
    )
    .into_iter()
    .filter(|idx| (unit.start_frame..unit.end_frame).contains(idx))
    .collect()
}

pub fn frame_file_name(stem: &str, frame_idx: usize) -> String {
    format!("{}_{:06}.jpg", stem, frame_idx)
}

/// Writes frames of one video into its output directory. Names depend only
/// on the video stem and frame index, so a rerun overwrites in place.
pub struct FrameWriter {
    dir: PathBuf,
    stem: String,
    params: Vector<i32>,
}

impl FrameWriter {
    pub fn create(dir: &Path, stem: &str) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| ExtractError::Write {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            stem: stem.to_string(),
            params: Vector::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write(&self, frame_idx: usize, frame: &Mat) -> Result<PathBuf> {
        let path = self.dir.join(frame_file_name(&self.stem, frame_idx));
        let path_str = path.to_string_lossy();
        match opencv::imgcodecs::imwrite(&path_str, frame, &self.params) {
            Ok(true) => Ok(path),
            Ok(false) => Err(ExtractError::Write {
                path,
                reason: "encoder refused the frame".to_string(),
            }
            .into()),
            Err(e) => Err(ExtractError::Write {
                path,
                reason: e.to_string(),
            }
            .into()),
        }
    }
}

/// Reads and writes every planned frame in order.
///
/// End of stream or a decode failure ends the pass early and the returned set
/// holds what was written. A write failure or cancellation fails the whole call.
pub fn write_frames(
    reader: &mut dyn VideoReader,
    plan: &[usize],
    writer: &FrameWriter,
    unit: &ProcessingUnit,
) -> Result<ExtractedFrameSet> {
    let mut written = Vec::with_capacity(plan.len());

    for &frame_idx in plan {
        let frame = match reader.seek_and_read(frame_idx) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::warn!(
                    video = %unit.video,
                    unit = unit.id,
                    "End of stream at frame {}, wrote {}/{} planned frames",
                    frame_idx,
                    written.len(),
                    plan.len()
                );
                break;
            }
            Err(e) if is_cancelled(&e) => return Err(e),
            Err(e) => {
                tracing::warn!(
                    video = %unit.video,
                    unit = unit.id,
                    "Decode failed at frame {}: {:#}, wrote {}/{} planned frames",
                    frame_idx,
                    e,
                    written.len(),
                    plan.len()
                );
                break;
            }
        };

        writer.write(frame_idx, &frame)?;
        written.push(frame_idx);
    }

    Ok(ExtractedFrameSet {
        output_dir: writer.dir().to_path_buf(),
        frames: written,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::signal::tests::{unit, FakeReader};

    #[test]
    fn test_uniform_interval_and_count() {
        // 10s at 30fps, 3 frames per second
        let frames = uniform_frames(10, 30.0, 3.0, 300);
        assert_eq!(frames.len(), 30);
        assert_eq!(&frames[..4], &[0, 10, 20, 30]);
        assert_eq!(*frames.last().unwrap(), 290);
    }

    #[test]
    fn test_uniform_interval_never_zero() {
        assert_eq!(uniform_interval(10.0, 30.0), 1);
        // Asking for more frames than the source has per second caps at every frame.
        let frames = uniform_frames(2, 10.0, 30.0, 20);
        assert_eq!(frames, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_uniform_skips_past_end() {
        // 29.97 fps rounds to an interval of 10 frames; the tail runs short.
        let frames = uniform_frames(10, 29.97, 3.0, 295);
        assert_eq!(frames.len(), 30);
        let frames = uniform_frames(10, 29.97, 3.0, 250);
        assert_eq!(frames.len(), 25);
        assert!(frames.iter().all(|&f| f < 250));
    }

    #[test]
    fn test_windowed_plan() {
        assert_eq!(windowed_frames(100, 220, 30.0, 2.0), vec![100, 160]);
        assert_eq!(windowed_frames(0, 27_000, 30.0, 2.0).len(), 450);
        assert_eq!(windowed_interval(30.0, 0.01), 1);
        assert!(windowed_frames(50, 50, 30.0, 2.0).is_empty());
    }

    #[test]
    fn test_uniform_plan_split_across_units_matches_whole() {
        let whole = uniform_frames(20, 25.0, 2.0, 500);
        let mut joined = Vec::new();
        for (start, end) in [(0, 167), (167, 334), (334, 500)] {
            let u = unit(start, end, 25.0, 500);
            joined.extend(uniform_frames_for_unit(&u, 2.0));
        }
        assert_eq!(joined, whole);
    }

    #[test]
    fn test_rerun_overwrites_same_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("street").join("cam01");
        let u = unit(0, 90, 30.0, 90);
        let plan = windowed_frames(0, 90, 30.0, 1.0);

        for _ in 0..2 {
            let mut reader = FakeReader::new(30.0, 90);
            let writer = FrameWriter::create(&dir, "cam01").unwrap();
            let set = write_frames(&mut reader, &plan, &writer, &u).unwrap();
            assert_eq!(set.frames, vec![0, 30, 60]);
        }

        let mut names: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec!["cam01_000000.jpg", "cam01_000030.jpg", "cam01_000060.jpg"]
        );
    }

    #[test]
    fn test_short_stream_writes_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let u = unit(0, 300, 30.0, 300);
        let mut reader = FakeReader::new(30.0, 100);
        let writer = FrameWriter::create(tmp.path(), "cam01").unwrap();
        let plan = windowed_frames(0, 300, 30.0, 1.0);

        let set = write_frames(&mut reader, &plan, &writer, &u).unwrap();
        assert_eq!(set.frames, vec![0, 30, 60, 90]);
        assert_eq!(set.output_dir, tmp.path());
    }

    #[test]
    fn test_write_failure_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let u = unit(0, 30, 30.0, 30);
        let writer = FrameWriter::create(tmp.path(), "cam01").unwrap();
        let mut reader = FakeReader::new(30.0, 30);
        // Directory removed underneath the writer.
        drop(tmp);

        let err = write_frames(&mut reader, &[0], &writer, &u).unwrap_err();
        let kind = err.downcast_ref::<ExtractError>().map(ExtractError::kind);
        assert_eq!(kind, Some("write"));
    }
}
