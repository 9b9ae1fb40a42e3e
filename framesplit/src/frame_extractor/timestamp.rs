use std::{fmt, time::Duration};

use ffmpeg::Rational;

extern crate ffmpeg_next as ffmpeg;

/// A presentation timestamp of a decoded frame, relative to the first one of its stream.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct Timestamp {
    timestamp: i64,
    first_timestamp: i64,
    timebase_numerator: i32,
    timebase_denominator: i32,
}

impl Timestamp {
    pub(super) fn new(ts: i64, timebase: Rational, first_timestamp: i64) -> Self {
        Self {
            timestamp: ts,
            first_timestamp,
            timebase_numerator: timebase.numerator(),
            timebase_denominator: timebase.denominator(),
        }
    }

    /// Scales the distance from the first timestamp into `unit`s per second, rounding
    /// towards zero.
    fn scaled(&self, unit: i128) -> i128 {
        if self.timebase_denominator == 0 {
            return 0;
        }
        let delta = i128::from(self.timestamp) - i128::from(self.first_timestamp);
        delta * i128::from(self.timebase_numerator) * unit
            / i128::from(self.timebase_denominator)
    }

    /// Time since the first frame, negative values are clamped to zero.
    pub fn to_duration(&self) -> Duration {
        let nanos = self.scaled(1_000_000_000).max(0);
        Duration::from_nanos(nanos.try_into().unwrap_or(u64::MAX))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let millis = self.scaled(1000);
        let sign = if millis < 0 { "-" } else { "" };
        let millis = millis.unsigned_abs();

        let hours = millis / 3_600_000;
        let minutes = millis % 3_600_000 / 60_000;
        let seconds = millis % 60_000 / 1000;
        let subsec = millis % 1000;

        write!(f, "{sign}{hours:02}:{minutes:02}:{seconds:02}.{subsec:03}")
    }
}
