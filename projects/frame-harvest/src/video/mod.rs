pub mod opencv_reader;
pub mod probe;

use anyhow::Result;
use opencv::core::Mat;
use std::path::Path;

/// Random-access frame source. Implementations own their decoder and are
/// used from a single worker thread.
pub trait VideoReader: Send {
    fn fps(&self) -> f64;
    fn frame_count(&self) -> usize;
    /// Decode the frame at `frame_index`. `Ok(None)` marks end of stream.
    fn seek_and_read(&mut self, frame_index: usize) -> Result<Option<Mat>>;
}

pub fn open_reader(path: &Path) -> Result<Box<dyn VideoReader>> {
    Ok(Box::new(opencv_reader::OpencvReader::open(path)?))
}
