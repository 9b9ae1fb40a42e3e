//! Which frames go where, and what they are called once they get there.

use std::num::NonZeroUsize;

pub const IMAGE_EXTENSION: &str = "jpg";

/// One of the two image sets a video is split into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Destination {
    Database,
    Query,
}

impl Destination {
    /// Even frames are for the database, odd ones are queries.
    pub fn of_frame(index: usize) -> Self {
        if index % 2 == 0 {
            Destination::Database
        } else {
            Destination::Query
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            Destination::Database => "db",
            Destination::Query => "query",
        }
    }

    /// The name of the `counter`th image of this set, counting from zero.
    pub fn file_name(self, counter: usize) -> String {
        format!("{}_{:06}.{}", self.prefix(), counter, IMAGE_EXTENSION)
    }
}

/// Whether the frame at `index` is saved at all.
pub fn is_sampled(index: usize, interval: NonZeroUsize) -> bool {
    index % interval.get() == 0
}

/// How many images each set has received so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    pub database: usize,
    pub query: usize,
}

impl Counters {
    pub fn get(&self, dest: Destination) -> usize {
        match dest {
            Destination::Database => self.database,
            Destination::Query => self.query,
        }
    }

    pub fn increment(&mut self, dest: Destination) {
        match dest {
            Destination::Database => self.database += 1,
            Destination::Query => self.query += 1,
        }
    }

    /// The name the next image of `dest` will get.
    pub fn next_name(&self, dest: Destination) -> String {
        dest.file_name(self.get(dest))
    }
}
