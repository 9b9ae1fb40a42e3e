use std::time::{Duration, Instant};

/// Rate limiter for things like progress messages.
pub struct Every {
    every: Duration,
    last: Instant,
}

impl Every {
    pub fn new(every: Duration) -> Self {
        Self {
            every,
            last: Instant::now(),
        }
    }

    /// Runs `f` if at least `every` has passed since the last time it ran, or since
    /// this was created.
    pub fn perform(&mut self, f: impl FnOnce()) {
        let now = Instant::now();
        if now - self.last >= self.every {
            self.last = now;
            f()
        }
    }
}
