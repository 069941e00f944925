//! Periodic tasks driven from the reactor loop.
//!
//! Timers fire on a grid: a timer with period `p` and offset `o` fires at
//! wall-clock microseconds `k*p + o`. The loop feeds in the current and
//! previous iteration timestamps, which is also what makes clock jumps
//! detectable and this module testable without a real clock.

/// Handle returned by registration, usable to reschedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(usize);

struct TimerEntry {
    next_fire: u64,
    period: u64,
    offset: u64,
    func: Box<dyn FnMut()>,
}

/// Maximum catch-up executions of one late timer in a single loop pass.
const MAX_LATE_RUNS: u32 = 10;

/// Forward clock jumps beyond this are treated as a jump, not a slow loop.
const FORWARD_JUMP_US: u64 = 5_000_000;

fn grid_align(now_us: u64, period: u64, offset: u64) -> u64 {
    let mut next = (now_us / period) * period + offset;
    while next < now_us {
        next += period;
    }
    next
}

#[derive(Default)]
pub struct TimerSet {
    entries: Vec<Option<TimerEntry>>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a periodic task. Rejects a zero period and an offset that
    /// does not fit inside the period.
    pub fn register_ms(
        &mut self,
        now_us: u64,
        period_ms: u32,
        offset_ms: u32,
        func: Box<dyn FnMut()>,
    ) -> Option<TimerId> {
        let period = u64::from(period_ms) * 1_000;
        let offset = u64::from(offset_ms) * 1_000;
        if period == 0 || offset >= period {
            return None;
        }
        let entry = TimerEntry {
            next_fire: grid_align(now_us, period, offset),
            period,
            offset,
            func,
        };
        self.entries.push(Some(entry));
        Some(TimerId(self.entries.len() - 1))
    }

    pub fn register_s(
        &mut self,
        now_us: u64,
        period_s: u32,
        offset_s: u32,
        func: Box<dyn FnMut()>,
    ) -> Option<TimerId> {
        self.register_ms(
            now_us,
            period_s.saturating_mul(1_000),
            offset_s.saturating_mul(1_000),
            func,
        )
    }

    /// Reschedule an existing timer onto a new grid.
    pub fn change_ms(&mut self, id: TimerId, now_us: u64, period_ms: u32, offset_ms: u32) -> bool {
        let period = u64::from(period_ms) * 1_000;
        let offset = u64::from(offset_ms) * 1_000;
        if period == 0 || offset >= period {
            return false;
        }
        match self.entries.get_mut(id.0).and_then(Option::as_mut) {
            Some(entry) => {
                entry.period = period;
                entry.offset = offset;
                entry.next_fire = grid_align(now_us, period, offset);
                true
            }
            None => false,
        }
    }

    /// Handle wall-clock jumps between two loop iterations.
    ///
    /// Backward jump: re-align every timer to the new grid, but keep up to
    /// one period of the wait it already had planned, so nothing fires too
    /// soon. Forward jump over the threshold: just re-align past `now`.
    pub fn rebase(&mut self, prev_us: u64, now_us: u64) {
        if now_us < prev_us {
            for entry in self.entries.iter_mut().flatten() {
                let planned = if entry.next_fire <= prev_us {
                    entry.period
                } else {
                    (entry.next_fire - prev_us).min(entry.period)
                };
                entry.next_fire = grid_align(now_us, entry.period, entry.offset);
                while entry.next_fire <= now_us + planned {
                    entry.next_fire += entry.period;
                }
            }
        } else if now_us > prev_us + FORWARD_JUMP_US {
            for entry in self.entries.iter_mut().flatten() {
                entry.next_fire = grid_align(now_us, entry.period, entry.offset);
                while entry.next_fire <= now_us {
                    entry.next_fire += entry.period;
                }
            }
        }
    }

    /// Run every timer that is due, at most [`MAX_LATE_RUNS`] catch-up
    /// executions each; anything later than that is dropped by re-aligning.
    pub fn run_due(&mut self, now_us: u64) {
        for entry in self.entries.iter_mut().flatten() {
            if now_us < entry.next_fire {
                continue;
            }
            let mut runs = 0;
            while now_us >= entry.next_fire && runs < MAX_LATE_RUNS {
                (entry.func)();
                entry.next_fire += entry.period;
                runs += 1;
            }
            if now_us >= entry.next_fire {
                entry.next_fire = grid_align(now_us, entry.period, entry.offset);
                while now_us >= entry.next_fire {
                    entry.next_fire += entry.period;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn counter() -> (Rc<Cell<u32>>, Box<dyn FnMut()>) {
        let count = Rc::new(Cell::new(0));
        let inner = count.clone();
        (count, Box::new(move || inner.set(inner.get() + 1)))
    }

    #[test]
    fn rejects_bad_periods() {
        let mut set = TimerSet::new();
        let (_, f) = counter();
        assert!(set.register_ms(0, 0, 0, f).is_none());
        let (_, f) = counter();
        assert!(set.register_ms(0, 10, 10, f).is_none());
    }

    #[test]
    fn fires_on_grid() {
        let mut set = TimerSet::new();
        let (count, f) = counter();
        // period 1s, offset 200ms, registered at t=2.5s -> next at 3.2s
        set.register_ms(2_500_000, 1_000, 200, f).unwrap();
        set.run_due(3_100_000);
        assert_eq!(count.get(), 0);
        set.run_due(3_200_000);
        assert_eq!(count.get(), 1);
        set.run_due(4_200_000);
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn late_runs_are_capped_then_regridded() {
        let mut set = TimerSet::new();
        let (count, f) = counter();
        set.register_ms(1_000_000, 1_000, 0, f).unwrap();
        // 50 periods late: only 10 catch-up runs, then the grid resumes.
        set.run_due(52_000_000);
        assert_eq!(count.get(), 10);
        set.run_due(52_999_999);
        assert_eq!(count.get(), 10);
        set.run_due(53_000_000);
        assert_eq!(count.get(), 11);
    }

    #[test]
    fn backward_jump_keeps_planned_wait() {
        let mut set = TimerSet::new();
        let (count, f) = counter();
        // Registered at 10.5s, period 10s -> next at 20.0s.
        set.register_s(10_500_000, 10, 0, f).unwrap();
        set.run_due(12_000_000);
        assert_eq!(count.get(), 0);
        // Clock jumps back to 5.0s with 8s of wait still planned: the timer
        // must not fire before 13s even though the 10s grid point passes.
        set.rebase(12_000_000, 5_000_000);
        set.run_due(10_000_000);
        assert_eq!(count.get(), 0);
        set.run_due(20_000_000);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn backward_jump_on_late_timer_keeps_one_period() {
        let mut set = TimerSet::new();
        let (count, f) = counter();
        set.register_s(10_000_000, 10, 0, f).unwrap();
        // Loop stalls past the fire point, then the clock jumps back: the
        // planned wait clamps to one period.
        set.rebase(25_000_000, 5_000_000);
        set.run_due(15_000_000);
        assert_eq!(count.get(), 0);
        set.run_due(20_000_000);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn forward_jump_regrids() {
        let mut set = TimerSet::new();
        let (count, f) = counter();
        set.register_s(0, 10, 0, f).unwrap();
        // Jump from 1s to 95s: skip the missed firings, resume at 100s.
        set.rebase(1_000_000, 95_000_000);
        set.run_due(95_000_000);
        assert_eq!(count.get(), 0);
        set.run_due(100_000_000);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn change_moves_the_grid() {
        let mut set = TimerSet::new();
        let (count, f) = counter();
        let id = set.register_s(0, 10, 0, f).unwrap();
        assert!(set.change_ms(id, 1_000_000, 2_000, 500));
        set.run_due(2_500_000);
        assert_eq!(count.get(), 1);
    }
}
