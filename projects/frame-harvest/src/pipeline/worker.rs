// Per-unit extraction pipeline run on pool threads
//
// Uniform units go straight to the sampler. Detection units scan for the
// target class, pick the densest window and sample it densely.

use crate::config::{AcceleratorId, DetectionSettings, ExtractionMode, RunConfig};
use crate::error::ExtractError;
use crate::pipeline::detection::{Detector, RtDetrDetector};
use crate::pipeline::sampler::{uniform_frames_for_unit, windowed_frames, write_frames, FrameWriter};
use crate::pipeline::signal::{collect_signal, SignalParams};
use crate::pipeline::types::{ExtractedFrameSet, ProcessingUnit};
use crate::pipeline::window::{select_window, to_frame_window, SelectedWindow};
use crate::video::{open_reader, VideoReader};
use anyhow::Result;
use opencv::core::Mat;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Flag set by the scheduler when a unit overruns its deadline.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Fails every read once the token is set, so both passes stop at the next
/// frame and nothing more is written.
pub struct CancellableReader<'a> {
    inner: &'a mut dyn VideoReader,
    cancel: &'a CancelToken,
}

impl<'a> CancellableReader<'a> {
    pub fn new(inner: &'a mut dyn VideoReader, cancel: &'a CancelToken) -> Self {
        Self { inner, cancel }
    }
}

impl VideoReader for CancellableReader<'_> {
    fn fps(&self) -> f64 {
        self.inner.fps()
    }

    fn frame_count(&self) -> usize {
        self.inner.frame_count()
    }

    fn seek_and_read(&mut self, frame_index: usize) -> Result<Option<Mat>> {
        if self.cancel.is_cancelled() {
            return Err(ExtractError::Cancelled.into());
        }
        self.inner.seek_and_read(frame_index)
    }
}

/// Runs one unit to completion. Called from the worker threads of the unit's
/// accelerator; `cancel` is set once the unit has been given up on.
pub trait UnitExecutor: Send + Sync {
    fn execute(&self, unit: &ProcessingUnit, cancel: &CancelToken) -> Result<ExtractedFrameSet>;
}

thread_local! {
    // Workers are pinned to one accelerator, so each holds at most one model.
    static DETECTOR: RefCell<Option<(AcceleratorId, RtDetrDetector)>> = RefCell::new(None);
}

pub struct ExtractionExecutor {
    config: Arc<RunConfig>,
}

impl ExtractionExecutor {
    pub fn new(config: Arc<RunConfig>) -> Self {
        Self { config }
    }
}

impl UnitExecutor for ExtractionExecutor {
    fn execute(&self, unit: &ProcessingUnit, cancel: &CancelToken) -> Result<ExtractedFrameSet> {
        let mut source = open_reader(&unit.path)?;
        let mut reader = CancellableReader::new(source.as_mut(), cancel);
        let writer = FrameWriter::create(
            &unit.video.output_dir(&self.config.output_root),
            unit.video.stem(),
        )?;

        let result = match unit.mode {
            ExtractionMode::Uniform => extract_uniform(
                &mut reader,
                &writer,
                unit,
                self.config.uniform_frames_per_sec,
            ),
            ExtractionMode::Detection => {
                let settings = self.config.detection.as_ref().ok_or_else(|| {
                    ExtractError::Detector("detection settings are not configured".to_string())
                })?;

                DETECTOR.with(|cell| -> Result<ExtractedFrameSet> {
                    let mut slot = cell.borrow_mut();
                    if slot.as_ref().map(|(id, _)| *id) != Some(unit.accelerator) {
                        // Drop any previous model before loading the next one.
                        *slot = None;
                        let detector = RtDetrDetector::new(&settings.model_path, unit.accelerator)
                            .map_err(|err| ExtractError::Detector(format!("{:#}", err)))?;
                        *slot = Some((unit.accelerator, detector));
                    }
                    let Some((_, detector)) = slot.as_mut() else {
                        return Err(ExtractError::Detector("detector not loaded".to_string()).into());
                    };
                    extract_detection(&mut reader, detector, &writer, unit, settings)
                })
            }
        };

        if cancel.is_cancelled() {
            return Err(ExtractError::Cancelled.into());
        }
        result
    }
}

pub fn extract_uniform(
    reader: &mut dyn VideoReader,
    writer: &FrameWriter,
    unit: &ProcessingUnit,
    frames_per_sec: f64,
) -> Result<ExtractedFrameSet> {
    let plan = uniform_frames_for_unit(unit, frames_per_sec);
    tracing::info!(
        video = %unit.video,
        unit = unit.id,
        "Uniform extraction of frames [{}, {}): {} planned",
        unit.start_frame,
        unit.end_frame,
        plan.len()
    );
    write_frames(reader, &plan, writer, unit)
}

/// Pass 1: scan the unit and map its densest window back to frame indices.
pub fn select_unit_window(
    reader: &mut dyn VideoReader,
    detector: &mut dyn Detector,
    unit: &ProcessingUnit,
    settings: &DetectionSettings,
) -> SelectedWindow {
    let params = SignalParams {
        target_class: &settings.target_class,
        min_conf: settings.confidence,
        stride: unit.sampling_stride,
    };
    let histogram = collect_signal(reader, detector, unit, &params);
    let choice = select_window(&histogram.counts, settings.window_secs);
    let window = to_frame_window(
        choice,
        settings.window_secs,
        unit.start_frame,
        unit.end_frame,
        unit.info.fps,
    );

    if window.fallback {
        tracing::warn!(
            video = %unit.video,
            unit = unit.id,
            "No '{}' detections, falling back to leading window [{}, {})",
            settings.target_class,
            window.start_frame,
            window.end_frame
        );
    } else {
        tracing::info!(
            video = %unit.video,
            unit = unit.id,
            "Selected window [{}, {}) starting at +{}s with {} positive samples",
            window.start_frame,
            window.end_frame,
            choice.start,
            window.best_sum
        );
    }
    window
}

/// Both passes of detection-guided extraction for one unit.
pub fn extract_detection(
    reader: &mut dyn VideoReader,
    detector: &mut dyn Detector,
    writer: &FrameWriter,
    unit: &ProcessingUnit,
    settings: &DetectionSettings,
) -> Result<ExtractedFrameSet> {
    let window = select_unit_window(reader, detector, unit, settings);
    let plan = windowed_frames(
        window.start_frame,
        window.end_frame,
        unit.info.fps,
        settings.extract_every_secs,
    );
    write_frames(reader, &plan, writer, unit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::signal::tests::{person, unit, FakeReader, IndexedDetector};
    use std::fs;
    use std::path::PathBuf;

    fn settings() -> DetectionSettings {
        DetectionSettings {
            model_path: PathBuf::from("rtdetr.onnx"),
            target_class: "person".to_string(),
            confidence: 0.25,
            sampling_stride: 5,
            window_secs: 900,
            extract_every_secs: 2.0,
        }
    }

    /// 20 minutes at 30 fps with people only in seconds [300, 450).
    fn twenty_minute_detector() -> impl Detector {
        IndexedDetector::new(
            (0..36_000).step_by(5).collect(),
            |idx: usize| {
                if (300..450).contains(&(idx / 30)) {
                    Ok(vec![person(0.8)])
                } else {
                    Ok(vec![])
                }
            },
        )
    }

    #[test]
    fn test_window_covers_signal_span() {
        let u = unit(0, 36_000, 30.0, 36_000);
        let mut reader = FakeReader::new(30.0, 36_000);
        let mut detector = twenty_minute_detector();

        let window = select_unit_window(&mut reader, &mut detector, &u, &settings());
        // 150 positive seconds, 6 sampled frames each.
        assert_eq!(window.best_sum, 900);
        assert!(!window.fallback);
        assert!(window.start_frame <= 300 * 30);
        assert!(window.end_frame >= 450 * 30);
        assert_eq!(window.end_frame - window.start_frame, 900 * 30);
    }

    #[test]
    fn test_detection_unit_writes_every_two_seconds_of_window() {
        let tmp = tempfile::tempdir().unwrap();
        let u = unit(0, 36_000, 30.0, 36_000);
        let mut reader = FakeReader::new(30.0, 36_000);
        let mut detector = twenty_minute_detector();
        let writer = FrameWriter::create(tmp.path(), "cam01").unwrap();

        let set = extract_detection(&mut reader, &mut detector, &writer, &u, &settings()).unwrap();
        assert_eq!(set.len(), 450);
        assert_eq!(set.frames[1] - set.frames[0], 60);
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 450);
    }

    #[test]
    fn test_uniform_unit_writes_its_share() {
        let tmp = tempfile::tempdir().unwrap();
        let mut u = unit(300, 600, 30.0, 600);
        u.mode = ExtractionMode::Uniform;
        let mut reader = FakeReader::new(30.0, 600);
        let writer = FrameWriter::create(tmp.path(), "cam01").unwrap();

        let set = extract_uniform(&mut reader, &writer, &u, 3.0).unwrap();
        assert_eq!(set.len(), 30);
        assert_eq!(set.frames[0], 300);
        assert!(tmp.path().join("cam01_000300.jpg").exists());
    }

    #[test]
    fn test_missing_source_fails_unit() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = crate::pipeline::scheduler::tests::run_config(&[0], 1);
        config.output_root = tmp.path().to_path_buf();
        let executor = ExtractionExecutor::new(Arc::new(config));

        let mut u = unit(0, 30, 30.0, 30);
        u.path = tmp.path().join("gone.mp4");
        let err = executor.execute(&u, &CancelToken::new()).unwrap_err();
        assert_eq!(crate::error::failure_kind(&err), "source_unreadable");
    }

    #[test]
    fn test_cancelled_unit_writes_nothing_more() {
        let tmp = tempfile::tempdir().unwrap();
        let mut u = unit(0, 300, 30.0, 300);
        u.mode = ExtractionMode::Uniform;
        let writer = FrameWriter::create(tmp.path(), "cam01").unwrap();
        let cancel = CancelToken::new();

        let mut source = FakeReader::new(30.0, 300);
        let mut reader = CancellableReader::new(&mut source, &cancel);
        let set = extract_uniform(&mut reader, &writer, &u, 3.0).unwrap();
        assert_eq!(set.len(), 30);

        cancel.cancel();
        let written_before = fs::read_dir(tmp.path()).unwrap().count();
        let mut source = FakeReader::new(30.0, 300);
        let mut reader = CancellableReader::new(&mut source, &cancel);
        let err = extract_uniform(&mut reader, &writer, &u, 3.0).unwrap_err();
        assert_eq!(crate::error::failure_kind(&err), "cancelled");
        assert!(source.reads.is_empty());
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), written_before);
    }

    #[test]
    fn test_cancelled_scan_stops_at_next_frame() {
        let u = unit(0, 36_000, 30.0, 36_000);
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut source = FakeReader::new(30.0, 36_000);
        let mut reader = CancellableReader::new(&mut source, &cancel);
        let mut detector = twenty_minute_detector();

        let window = select_unit_window(&mut reader, &mut detector, &u, &settings());
        assert!(window.fallback);
        assert!(source.reads.is_empty());
    }
}
