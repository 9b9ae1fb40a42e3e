pub mod frame_extractor;
pub mod logger;
pub mod timestamp;

pub use frame_extractor::FrameExtractor;
pub use frame_extractor::Result;
pub use logger::ContextLogger;
pub use timestamp::Timestamp;
