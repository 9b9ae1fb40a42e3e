pub mod frame_extractor;
pub mod naming;
pub mod source;
pub mod splitter;

pub use splitter::{split_frames, split_video, SplitArgs, SplitError, SplitSummary};
