use std::collections::VecDeque;

use color_eyre::eyre;
use image::RgbImage;

/// Something that hands out decoded frames, one at a time and in order.
///
/// There is no "is open" query, a value of a type implementing this is always open.
/// Whatever opens it reports failures to do so instead. It is closed when dropped.
pub trait FrameSource {
    /// How many frames the source claims to have, if it knows. This can be off, so
    /// only use it as an upper bound.
    fn frame_count(&self) -> Option<u64>;

    /// Decodes the next frame. `Ok(None)` means that the stream has ended.
    fn next_frame(&mut self) -> eyre::Result<Option<RgbImage>>;
}

/// A source of frames that are already in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    frames: VecDeque<RgbImage>,
    reported_count: Option<u64>,
}

impl MemorySource {
    /// Reports the exact number of frames it was given
    pub fn new(frames: impl IntoIterator<Item = RgbImage>) -> Self {
        let frames: VecDeque<_> = frames.into_iter().collect();
        let reported_count = Some(frames.len() as u64);
        Self {
            frames,
            reported_count,
        }
    }

    /// Lie about the number of frames, like some containers do
    pub fn reporting(mut self, count: Option<u64>) -> Self {
        self.reported_count = count;
        self
    }
}

impl FrameSource for MemorySource {
    fn frame_count(&self) -> Option<u64> {
        self.reported_count
    }

    fn next_frame(&mut self) -> eyre::Result<Option<RgbImage>> {
        Ok(self.frames.pop_front())
    }
}
