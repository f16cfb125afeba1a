use crate::config::RunConfig;
use crate::pipeline::types::{ProcessingUnit, UnitId};
use crate::run_context::VideoSource;
use crate::video::probe::VideoInfo;
use std::ops::Range;

/// Splits `[0, total_frames)` into at most `segments` contiguous ranges of
/// `ceil(total / segments)` frames; the last one may be shorter.
pub fn segment_ranges(total_frames: usize, segments: usize) -> Vec<Range<usize>> {
    let seg = segments.max(1);
    let seg_size = total_frames.div_ceil(seg);
    (0..seg)
        .map(|k| (k * seg_size)..((k + 1) * seg_size).min(total_frames))
        .take_while(|r| r.start < r.end)
        .collect()
}

/// Turns probed videos into units, pinning each video to one accelerator in
/// round-robin order.
pub struct UnitBuilder<'a> {
    config: &'a RunConfig,
    next_unit_id: UnitId,
    videos_assigned: usize,
}

impl<'a> UnitBuilder<'a> {
    pub fn new(config: &'a RunConfig) -> Self {
        Self {
            config,
            next_unit_id: 0,
            videos_assigned: 0,
        }
    }

    pub fn build(&mut self, source: &VideoSource, info: VideoInfo) -> Vec<ProcessingUnit> {
        let ranges = segment_ranges(info.frame_count, self.config.segments);
        if ranges.is_empty() {
            return Vec::new();
        }

        let accelerators = &self.config.accelerators;
        let accelerator = accelerators[self.videos_assigned % accelerators.len()];
        self.videos_assigned += 1;

        ranges
            .into_iter()
            .enumerate()
            .map(|(segment, range)| {
                let id = self.next_unit_id;
                self.next_unit_id += 1;
                ProcessingUnit {
                    id,
                    video: source.key.clone(),
                    path: source.path.clone(),
                    info,
                    segment,
                    start_frame: range.start,
                    end_frame: range.end,
                    accelerator,
                    sampling_stride: self.config.sampling_stride(),
                    mode: self.config.mode,
                }
            })
            .collect()
    }
}
