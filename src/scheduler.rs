use crate::RollbackError;
use tracing::debug;
use web_time::{Duration, Instant};

/// Default simulation rate.
pub const DEFAULT_FPS: usize = 60;

/// Default cap on the number of ticks a single [`FixedTickScheduler::due_ticks`] call hands out.
pub const DEFAULT_MAX_CATCH_UP: u32 = 4;

/// Frame clock for a fixed simulation rate.
///
/// The scheduler keeps an absolute deadline for the next tick and moves it forward by whole
/// periods, so rounding errors do not accumulate the way they do with sleep-per-frame loops.
/// After a stall it hands out at most `max_catch_up` ticks at once and re-anchors the deadline
/// to the present instead of trying to replay the whole gap.
///
/// ```
/// use lockstep_rollback::FixedTickScheduler;
/// use web_time::{Duration, Instant};
///
/// let mut scheduler = FixedTickScheduler::new(50).unwrap();
/// let start = Instant::now();
/// assert_eq!(scheduler.due_ticks(start), 1);
/// assert_eq!(scheduler.due_ticks(start + Duration::from_millis(10)), 0);
/// assert_eq!(scheduler.due_ticks(start + Duration::from_millis(45)), 2);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedTickScheduler {
    period: Duration,
    max_catch_up: u32,
    next_deadline: Option<Instant>,
    ticks: u64,
}

impl Default for FixedTickScheduler {
    fn default() -> Self {
        Self {
            period: period_for(DEFAULT_FPS),
            max_catch_up: DEFAULT_MAX_CATCH_UP,
            next_deadline: None,
            ticks: 0,
        }
    }
}

fn period_for(fps: usize) -> Duration {
    Duration::from_nanos(1_000_000_000 / fps as u64)
}

impl FixedTickScheduler {
    /// Creates a scheduler ticking `fps` times per second.
    ///
    /// # Errors
    /// Returns [`RollbackError::InvalidRequest`] if `fps` is 0.
    pub fn new(fps: usize) -> Result<Self, RollbackError> {
        if fps == 0 {
            return Err(RollbackError::InvalidRequest {
                info: "fps must be greater than 0".to_owned(),
            });
        }
        Ok(Self {
            period: period_for(fps),
            ..Self::default()
        })
    }

    /// Sets the cap on ticks handed out per call. Values below 1 are raised to 1.
    #[must_use]
    pub fn with_max_catch_up(mut self, max_catch_up: u32) -> Self {
        self.max_catch_up = max_catch_up.max(1);
        self
    }

    /// Time between two ticks.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Total ticks handed out so far.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Forgets the deadline. The next [`due_ticks`](Self::due_ticks) call starts a fresh clock.
    pub fn reset(&mut self) {
        self.next_deadline = None;
    }

    /// Returns how many ticks to run at `now` and moves the deadline past them.
    ///
    /// The first call anchors the clock and returns 1.
    pub fn due_ticks(&mut self, now: Instant) -> u32 {
        let next = *self.next_deadline.get_or_insert(now);
        if now < next {
            return 0;
        }

        let behind = now.duration_since(next).as_nanos() / self.period.as_nanos().max(1) + 1;
        let due = if behind > u128::from(self.max_catch_up) {
            debug!(
                behind,
                max_catch_up = self.max_catch_up,
                "frame clock fell behind; re-anchoring"
            );
            self.next_deadline = Some(now + self.period);
            self.max_catch_up
        } else {
            let due = behind as u32;
            self.next_deadline = Some(next + self.period * due);
            due
        };
        self.ticks += u64::from(due);
        due
    }

    /// Time left until the next tick is due, zero if it is due already or the clock has not started.
    #[must_use]
    pub fn time_until_next(&self, now: Instant) -> Duration {
        self.next_deadline
            .map_or(Duration::ZERO, |next| next.saturating_duration_since(now))
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn zero_fps_is_rejected() {
        assert!(matches!(
            FixedTickScheduler::new(0),
            Err(RollbackError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn default_runs_at_sixty_hz() {
        let scheduler = FixedTickScheduler::default();
        assert_eq!(scheduler.period(), Duration::from_nanos(16_666_666));
        assert_eq!(scheduler.time_until_next(Instant::now()), Duration::ZERO);
    }

    #[test]
    fn deadlines_advance_by_whole_periods() {
        let mut scheduler = FixedTickScheduler::new(100).unwrap();
        let start = Instant::now();
        assert_eq!(scheduler.due_ticks(start), 1);

        // late wakeups do not push later deadlines back
        assert_eq!(scheduler.due_ticks(start + 13 * MS), 1);
        assert_eq!(scheduler.time_until_next(start + 13 * MS), 7 * MS);
        assert_eq!(scheduler.due_ticks(start + 19 * MS), 0);
        assert_eq!(scheduler.due_ticks(start + 20 * MS), 1);
        assert_eq!(scheduler.ticks(), 3);
    }

    #[test]
    fn catch_up_is_capped_and_re_anchored() {
        let mut scheduler = FixedTickScheduler::new(100).unwrap().with_max_catch_up(3);
        let start = Instant::now();
        scheduler.due_ticks(start);

        // a 100ms stall owes 10 ticks but only 3 are handed out
        let after_stall = start + 100 * MS;
        assert_eq!(scheduler.due_ticks(after_stall), 3);
        assert_eq!(scheduler.time_until_next(after_stall), 10 * MS);
        assert_eq!(scheduler.due_ticks(after_stall + 5 * MS), 0);
    }

    #[test]
    fn small_backlog_is_fully_replayed() {
        let mut scheduler = FixedTickScheduler::new(100).unwrap().with_max_catch_up(3);
        let start = Instant::now();
        scheduler.due_ticks(start);
        assert_eq!(scheduler.due_ticks(start + 31 * MS), 3);
        assert_eq!(scheduler.time_until_next(start + 31 * MS), 9 * MS);
    }

    #[test]
    fn reset_restarts_the_clock() {
        let mut scheduler = FixedTickScheduler::new(100).unwrap();
        let start = Instant::now();
        scheduler.due_ticks(start);
        scheduler.reset();
        assert_eq!(scheduler.due_ticks(start + 2 * MS), 1);
        assert_eq!(scheduler.time_until_next(start + 2 * MS), 10 * MS);
    }
}
