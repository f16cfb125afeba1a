use crate::error::is_cancelled;
use crate::pipeline::detection::{has_target, Detector};
use crate::pipeline::types::ProcessingUnit;
use crate::video::VideoReader;
use std::time::Instant;

/// What counts as a hit during the scan pass.
#[derive(Debug, Clone)]
pub struct SignalParams<'a> {
    pub target_class: &'a str,
    pub min_conf: f32,
    pub stride: usize,
}

/// Per-second presence counts relative to the unit start.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionHistogram {
    pub counts: Vec<u32>,
    pub frames_scanned: usize,
    pub detector_errors: usize,
    /// The scan stopped early on a decode failure; `counts` covers the scanned prefix only.
    pub truncated: bool,
}

impl DetectionHistogram {
    pub fn total(&self) -> u64 {
        self.counts.iter().map(|&c| c as u64).sum()
    }
}

/// Second bucket of a frame, relative to the unit start.
fn second_of(frame: usize, unit_start: usize, fps: f64) -> usize {
    ((frame - unit_start) as f64 / fps) as usize
}

/// Pass 1 of detection-guided extraction.
///
/// Visits every `stride`-th frame of the unit, runs the detector and counts the
/// frame in its second when at least one target-class box clears the
/// confidence cutoff. Never fails: a detector error drops that frame only, and
/// a decode failure truncates the histogram to what was scanned so far.
pub fn collect_signal(
    reader: &mut dyn VideoReader,
    detector: &mut dyn Detector,
    unit: &ProcessingUnit,
    params: &SignalParams,
) -> DetectionHistogram {
    let fps = unit.info.fps;
    let (start, end) = (unit.start_frame, unit.end_frame);
    let num_secs = ((end.saturating_sub(start)) as f64 / fps).ceil() as usize;

    let mut hist = DetectionHistogram {
        counts: vec![0; num_secs],
        ..Default::default()
    };
    let mut last_scanned = None;
    let started = Instant::now();

    for frame_idx in (start..end).step_by(params.stride.max(1)) {
        let frame = match reader.seek_and_read(frame_idx) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::warn!(
                    video = %unit.video,
                    unit = unit.id,
                    "Scan hit end of stream at frame {} (expected up to {}); using scanned prefix",
                    frame_idx,
                    end
                );
                hist.truncated = true;
                break;
            }
            Err(e) if is_cancelled(&e) => {
                tracing::debug!(video = %unit.video, unit = unit.id, "Scan cancelled at frame {}", frame_idx);
                hist.truncated = true;
                break;
            }
            Err(e) => {
                tracing::warn!(
                    video = %unit.video,
                    unit = unit.id,
                    "Decode failed at frame {}: {:#}; using scanned prefix",
                    frame_idx,
                    e
                );
                hist.truncated = true;
                break;
            }
        };

        hist.frames_scanned += 1;
        last_scanned = Some(frame_idx);

        match detector.detect(&frame) {
            Ok(detections) => {
                if has_target(&detections, params.target_class, params.min_conf) {
                    hist.counts[second_of(frame_idx, start, fps)] += 1;
                }
            }
            Err(e) => {
                hist.detector_errors += 1;
                tracing::debug!(
                    video = %unit.video,
                    unit = unit.id,
                    "Detector failed on frame {}: {:#}",
                    frame_idx,
                    e
                );
            }
        }
    }

    if hist.truncated {
        let covered = last_scanned
            .map(|f| second_of(f, start, fps) + 1)
            .unwrap_or(0);
        hist.counts.truncate(covered);
    }

    if hist.detector_errors > 0 {
        tracing::warn!(
            video = %unit.video,
            unit = unit.id,
            "{} detector call(s) failed during scan",
            hist.detector_errors
        );
    }

    tracing::info!(
        video = %unit.video,
        unit = unit.id,
        "Scanned {} frames in {:.1}s, {} positive samples over {}s",
        hist.frames_scanned,
        started.elapsed().as_secs_f64(),
        hist.total(),
        hist.counts.len()
    );

    hist
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{AcceleratorId, ExtractionMode};
    use crate::pipeline::detection::{BBox, Detection};
    use crate::pipeline::types::VideoKey;
    use crate::video::probe::VideoInfo;
    use anyhow::{anyhow, Result};
    use opencv::core::{Mat, Scalar, CV_8UC3};
    use std::path::{Path, PathBuf};

    /// Reader producing tiny frames whose pixel value encodes the frame index.
    pub(crate) struct FakeReader {
        pub fps: f64,
        pub frame_count: usize,
        /// Frames at or after this index fail to decode.
        pub fail_from: Option<usize>,
        pub reads: Vec<usize>,
    }

    impl FakeReader {
        pub(crate) fn new(fps: f64, frame_count: usize) -> Self {
            Self {
                fps,
                frame_count,
                fail_from: None,
                reads: Vec::new(),
            }
        }
    }

    impl VideoReader for FakeReader {
        fn fps(&self) -> f64 {
            self.fps
        }

        fn frame_count(&self) -> usize {
            self.frame_count
        }

        fn seek_and_read(&mut self, frame_index: usize) -> Result<Option<Mat>> {
            if let Some(limit) = self.fail_from {
                if frame_index >= limit {
                    return Err(anyhow!("corrupt packet"));
                }
            }
            if frame_index >= self.frame_count {
                return Ok(None);
            }
            self.reads.push(frame_index);
            let value = (frame_index % 256) as f64;
            let mat = Mat::new_rows_cols_with_default(4, 4, CV_8UC3, Scalar::all(value))?;
            Ok(Some(mat))
        }
    }

    /// Detector answering by frame index; `frames` lists the indices in scan order.
    pub(crate) struct IndexedDetector<F: FnMut(usize) -> Result<Vec<Detection>>> {
        pub frames: Vec<usize>,
        pub cursor: usize,
        pub respond: F,
    }

    impl<F: FnMut(usize) -> Result<Vec<Detection>>> IndexedDetector<F> {
        pub(crate) fn new(frames: Vec<usize>, respond: F) -> Self {
            Self {
                frames,
                cursor: 0,
                respond,
            }
        }
    }

    impl<F: FnMut(usize) -> Result<Vec<Detection>>> Detector for IndexedDetector<F> {
        fn detect(&mut self, _frame: &Mat) -> Result<Vec<Detection>> {
            let idx = self.frames[self.cursor];
            self.cursor += 1;
            (self.respond)(idx)
        }
    }

    pub(crate) fn person(confidence: f32) -> Detection {
        Detection {
            class_name: "person".to_string(),
            confidence,
            bbox: BBox {
                x: 1.0,
                y: 1.0,
                w: 2.0,
                h: 2.0,
            },
        }
    }

    pub(crate) fn unit(start: usize, end: usize, fps: f64, frame_count: usize) -> ProcessingUnit {
        ProcessingUnit {
            id: 7,
            video: VideoKey::new("root", "street", "cam01.mp4"),
            path: PathBuf::from("/videos/street/cam01.mp4"),
            info: VideoInfo::new(Path::new("cam01.mp4"), fps, frame_count).unwrap(),
            segment: 0,
            start_frame: start,
            end_frame: end,
            accelerator: AcceleratorId(0),
            sampling_stride: 5,
            mode: ExtractionMode::Detection,
        }
    }

    fn params(stride: usize) -> SignalParams<'static> {
        SignalParams {
            target_class: "person",
            min_conf: 0.25,
            stride,
        }
    }

    #[test]
    fn test_counts_positive_frames_per_second() {
        let u = unit(0, 300, 30.0, 300);
        let mut reader = FakeReader::new(30.0, 300);
        let frames: Vec<usize> = (0..300).step_by(5).collect();
        let mut detector = IndexedDetector::new(frames, |idx: usize| {
            // Seconds 3..5 contain a person
            if (90..150).contains(&idx) {
                Ok(vec![person(0.9), person(0.8)])
            } else {
                Ok(vec![])
            }
        });

        let hist = collect_signal(&mut reader, &mut detector, &u, &params(5));
        assert_eq!(hist.counts.len(), 10);
        assert_eq!(hist.counts, vec![0, 0, 0, 6, 6, 0, 0, 0, 0, 0]);
        assert_eq!(hist.frames_scanned, 60);
        assert!(!hist.truncated);
        assert_eq!(reader.reads, (0..300).step_by(5).collect::<Vec<_>>());
    }

    #[test]
    fn test_buckets_are_relative_to_unit_start() {
        let u = unit(600, 900, 30.0, 900);
        let mut reader = FakeReader::new(30.0, 900);
        let frames: Vec<usize> = (600..900).step_by(30).collect();
        let mut detector = IndexedDetector::new(frames, |idx: usize| {
            Ok(if idx == 630 { vec![person(0.5)] } else { vec![] })
        });

        let hist = collect_signal(&mut reader, &mut detector, &u, &params(30));
        assert_eq!(hist.counts.len(), 10);
        assert_eq!(hist.counts[1], 1);
        assert_eq!(hist.total(), 1);
    }

    #[test]
    fn test_low_confidence_and_other_classes_ignored() {
        let u = unit(0, 60, 30.0, 60);
        let mut reader = FakeReader::new(30.0, 60);
        let mut detector = IndexedDetector::new(
            (0..60).collect(),
            |_idx: usize| {
                let mut car = person(0.99);
                car.class_name = "car".to_string();
                Ok(vec![car, person(0.1)])
            },
        );

        let hist = collect_signal(&mut reader, &mut detector, &u, &params(1));
        assert_eq!(hist.total(), 0);
        assert_eq!(hist.frames_scanned, 60);
    }

    #[test]
    fn test_detector_errors_skip_frame_only() {
        let u = unit(0, 90, 30.0, 90);
        let mut reader = FakeReader::new(30.0, 90);
        let mut detector = IndexedDetector::new(
            (0..90).step_by(10).collect(),
            |idx: usize| {
                if idx == 40 {
                    Err(anyhow!("inference failed"))
                } else {
                    Ok(vec![person(0.9)])
                }
            },
        );

        let hist = collect_signal(&mut reader, &mut detector, &u, &params(10));
        assert_eq!(hist.detector_errors, 1);
        assert_eq!(hist.frames_scanned, 9);
        assert_eq!(hist.counts, vec![3, 2, 3]);
        assert!(!hist.truncated);
    }

    #[test]
    fn test_decode_failure_truncates_to_scanned_prefix() {
        let u = unit(0, 300, 30.0, 300);
        let mut reader = FakeReader::new(30.0, 300);
        reader.fail_from = Some(100);
        let mut detector = IndexedDetector::new(
            (0..300).step_by(10).collect(),
            |_idx: usize| Ok(vec![person(0.9)]),
        );

        let hist = collect_signal(&mut reader, &mut detector, &u, &params(10));
        assert!(hist.truncated);
        // Frames 0..=90 scanned, last one sits in second 3.
        assert_eq!(hist.frames_scanned, 10);
        assert_eq!(hist.counts, vec![3, 3, 3, 1]);
    }

    #[test]
    fn test_early_end_of_stream_truncates() {
        // Metadata claims 300 frames but the stream ends at 45.
        let u = unit(0, 300, 30.0, 300);
        let mut reader = FakeReader::new(30.0, 45);
        let mut detector = IndexedDetector::new(
            (0..300).step_by(5).collect(),
            |_idx: usize| Ok(vec![]),
        );

        let hist = collect_signal(&mut reader, &mut detector, &u, &params(5));
        assert!(hist.truncated);
        assert_eq!(hist.frames_scanned, 9);
        assert_eq!(hist.counts.len(), 2);
    }
}
