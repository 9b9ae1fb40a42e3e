//! Routes messages from the extractor, including the ones ffmpeg itself prints, to
//! somewhere a user can see them.

use std::{fmt::Arguments, path::Path};

/// A buffered message, used for ffmpeg logs that are captured in its callback and
/// forwarded later.
pub struct Item {
    pub level: Level,
    pub target: String,
    pub body: String,
}

pub trait Logger {
    fn log(&self, level: Level, target: &str, body: Arguments<'_>);

    fn log_item(&self, item: Item) {
        self.log(item.level, &item.target, format_args!("{}", item.body))
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum Level {
    Verbose,
    Info,
    Warn,
    Error,
}

impl From<Level> for log::Level {
    fn from(level: Level) -> Self {
        match level {
            Level::Verbose => log::Level::Debug,
            Level::Info => log::Level::Info,
            Level::Warn => log::Level::Warn,
            Level::Error => log::Level::Error,
        }
    }
}

/// Forwards straight to the `log` crate.
pub struct LogLogger;

impl Logger for LogLogger {
    fn log(&self, level: Level, target: &str, body: Arguments<'_>) {
        log::log!(target: target, level.into(), "{}", body);
    }
}

/// Like [LogLogger], but tags every message with the video it is about.
pub struct ContextLogger<'a> {
    video: &'a Path,
}

impl<'a> ContextLogger<'a> {
    pub fn new(video: &'a Path) -> Self {
        Self { video }
    }
}

impl Logger for ContextLogger<'_> {
    fn log(&self, level: Level, target: &str, body: Arguments<'_>) {
        LogLogger.log(
            level,
            target,
            format_args!("{} ({})", body, self.video.display()),
        )
    }
}

macro_rules! information {
    ($logger:expr, $($args:tt)*) => {
        $logger.log(
            $crate::frame_extractor::logger::Level::Info,
            std::module_path!(),
            std::format_args!($($args)*)
        )
    }
}

macro_rules! warning {
    ($logger:expr, $($args:tt)*) => {
        $logger.log(
            $crate::frame_extractor::logger::Level::Warn,
            std::module_path!(),
            std::format_args!($($args)*)
        )
    }
}

macro_rules! verbose {
    ($logger:expr, $($args:tt)*) => {
        $logger.log(
            $crate::frame_extractor::logger::Level::Verbose,
            std::module_path!(),
            std::format_args!($($args)*)
        )
    }
}

pub(crate) use information;
pub(crate) use verbose;
pub(crate) use warning;
