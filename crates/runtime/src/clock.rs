use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;

struct Now {
    secs: i64,
    micros: u64,
}

/// Wall clock shared between the reactor and worker threads.
///
/// The reactor refreshes it once per loop iteration; everyone else only
/// reads. The monotonic origin is the process start, used for store timing
/// where wall-clock jumps must not matter.
pub struct Clock {
    now: Mutex<Now>,
    started: Instant,
}

impl Clock {
    pub fn new() -> Self {
        let clock = Self {
            now: Mutex::new(Now { secs: 0, micros: 0 }),
            started: Instant::now(),
        };
        clock.refresh();
        clock
    }

    /// Re-read the wall clock. Returns `(previous_us, current_us)` so the
    /// caller can detect stalls and clock jumps.
    pub fn refresh(&self) -> (u64, u64) {
        let now = Utc::now();
        let micros = now.timestamp_micros().max(0) as u64;
        let mut guard = self.now.lock().unwrap();
        let prev = guard.micros;
        guard.secs = now.timestamp();
        guard.micros = micros;
        (prev, micros)
    }

    /// Wall-clock seconds as of the last refresh.
    pub fn now_s(&self) -> i64 {
        self.now.lock().unwrap().secs
    }

    /// Wall-clock microseconds as of the last refresh.
    pub fn now_us(&self) -> u64 {
        self.now.lock().unwrap().micros
    }

    /// Monotonic time since process start.
    pub fn monotonic(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_advances() {
        let clock = Clock::new();
        let (prev, now) = clock.refresh();
        assert!(now >= prev);
        assert!(clock.now_s() > 0);
        assert_eq!(clock.now_us() / 1_000_000, clock.now_s() as u64);
    }
}
