use serde::Serialize;

/// Densest window found over a per-second histogram, in histogram seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowChoice {
    pub start: usize,
    /// Effective window length after clamping to the histogram length.
    pub len: usize,
    pub sum: u64,
}

/// Returns the leftmost contiguous window of `window_len` seconds with the
/// largest total count. `window_len` is clamped to `counts.len()`.
///
/// Runs in O(n) using prefix sums: `P[0] = 0`, `P[i] = P[i-1] + counts[i-1]`,
/// and the sum of the window starting at `i` is `P[i + len] - P[i]`.
pub fn select_window(counts: &[u32], window_len: usize) -> WindowChoice {
    let n = counts.len();
    let len = window_len.min(n);
    if n == 0 || len == 0 {
        return WindowChoice {
            start: 0,
            len,
            sum: 0,
        };
    }

    let mut prefix = Vec::with_capacity(n + 1);
    prefix.push(0u64);
    for &c in counts {
        let last = prefix[prefix.len() - 1];
        prefix.push(last + c as u64);
    }

    let mut best_start = 0;
    let mut best_sum = prefix[len];
    for i in 1..=(n - len) {
        let sum = prefix[i + len] - prefix[i];
        // Strict comparison keeps the earliest start on ties.
        if sum > best_sum {
            best_sum = sum;
            best_start = i;
        }
    }

    WindowChoice {
        start: best_start,
        len,
        sum: best_sum,
    }
}

/// Frame range chosen for dense extraction inside a unit.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedWindow {
    pub start_frame: usize,
    /// Exclusive
    pub end_frame: usize,
    pub best_sum: u64,
    /// True when the scan found nothing and the unit's leading window was used.
    pub fallback: bool,
}

/// Maps a histogram window back to absolute frame indices of the unit.
///
/// A zero-sum choice falls back to the first `window_secs` seconds of the
/// unit: no detections still means frames get extracted.
pub fn to_frame_window(
    choice: WindowChoice,
    window_secs: usize,
    unit_start: usize,
    unit_end: usize,
    fps: f64,
) -> SelectedWindow {
    let secs_to_frames = |secs: usize| (secs as f64 * fps).round() as usize;

    if choice.sum == 0 {
        let end = unit_start
            .saturating_add(secs_to_frames(window_secs))
            .min(unit_end);
        return SelectedWindow {
            start_frame: unit_start,
            end_frame: end,
            best_sum: 0,
            fallback: true,
        };
    }

    let start = (unit_start + secs_to_frames(choice.start)).min(unit_end);
    let end = start.saturating_add(secs_to_frames(choice.len)).min(unit_end);
    SelectedWindow {
        start_frame: start,
        end_frame: end,
        best_sum: choice.sum,
        fallback: false,
    }
}
