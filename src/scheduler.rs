//! Periodic and daily scheduling.
//!
//! [`Interval`] tracks a monotonic deadline for periodic concerns such as the
//! heartbeat and network probes. [`TaskScheduler`] holds wall-clock jobs that
//! fire once per calendar day. Neither sleeps; the supervisor ticks them.

use std::time::Duration;

use chrono::{NaiveDateTime, NaiveTime, TimeDelta};
use tokio::time::Instant;

/// A periodic deadline on the monotonic clock.
#[derive(Debug, Clone, Copy)]
pub struct Interval {
    period: Duration,
    next_due: Instant,
}

impl Interval {
    /// Creates an interval first due one period after `now`.
    #[must_use]
    pub fn new(period: Duration, now: Instant) -> Self {
        Self {
            period,
            next_due: now + period,
        }
    }

    /// Creates an interval that is due immediately.
    #[must_use]
    pub const fn immediate(period: Duration, now: Instant) -> Self {
        Self {
            period,
            next_due: now,
        }
    }

    /// Returns true once the deadline has passed.
    #[must_use]
    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_due
    }

    /// Restarts the period from `now`.
    pub fn reset(&mut self, now: Instant) {
        self.next_due = now + self.period;
    }

    /// Returns the next deadline.
    #[must_use]
    pub const fn next_due(&self) -> Instant {
        self.next_due
    }

    /// Returns the period.
    #[must_use]
    pub const fn period(&self) -> Duration {
        self.period
    }
}

/// Source of local wall-clock time.
pub trait WallClock: Send + Sync {
    /// Returns the current local date and time.
    fn now(&self) -> NaiveDateTime;
}

/// The host's local time.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalClock;

impl WallClock for LocalClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

/// Work the daily scheduler can trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduledTask {
    /// Drain the device log into the archive.
    ReadLogs,
    /// Rotate the archive and hand the old generation off.
    RotateLogs,
}

/// A job that fires once a day at a fixed local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyJob {
    /// Local time of day the job fires at.
    pub time_of_day: NaiveTime,
    /// What to run.
    pub task: ScheduledTask,
    next_due: NaiveDateTime,
}

impl DailyJob {
    /// Returns when the job fires next.
    #[must_use]
    pub const fn next_due(&self) -> NaiveDateTime {
        self.next_due
    }
}

/// First occurrence of `time_of_day` strictly after `now`, or at `now` when
/// `inclusive` is set.
fn next_occurrence(time_of_day: NaiveTime, now: NaiveDateTime, inclusive: bool) -> NaiveDateTime {
    let today = now.date().and_time(time_of_day);
    if today > now || (inclusive && today == now) {
        today
    } else {
        today + TimeDelta::days(1)
    }
}

/// Daily jobs on the wall clock.
#[derive(Debug, Clone, Default)]
pub struct TaskScheduler {
    jobs: Vec<DailyJob>,
}

impl TaskScheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub const fn new() -> Self {
        Self { jobs: Vec::new() }
    }

    /// Registers `task` to run daily at `time_of_day`.
    ///
    /// Registering the same job twice is a no-op and returns false. A time
    /// already past today first fires tomorrow.
    pub fn register(&mut self, time_of_day: NaiveTime, task: ScheduledTask, now: NaiveDateTime) -> bool {
        if self
            .jobs
            .iter()
            .any(|job| job.time_of_day == time_of_day && job.task == task)
        {
            return false;
        }

        let next_due = next_occurrence(time_of_day, now, true);
        tracing::debug!("scheduled {:?} daily at {}, next {}", task, time_of_day, next_due);
        self.jobs.push(DailyJob {
            time_of_day,
            task,
            next_due,
        });
        true
    }

    /// Returns the tasks due at `now` and moves each to its next day.
    ///
    /// A job that missed several days (host suspended, clock jump) fires once.
    pub fn due(&mut self, now: NaiveDateTime) -> Vec<ScheduledTask> {
        let mut tasks = Vec::new();
        for job in &mut self.jobs {
            if now >= job.next_due {
                tasks.push(job.task);
                job.next_due = next_occurrence(job.time_of_day, now, false);
            }
        }
        tasks
    }

    /// Returns the registered jobs.
    #[must_use]
    pub fn jobs(&self) -> &[DailyJob] {
        &self.jobs
    }

    /// Returns true if no job is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Settable clock for tests.
#[cfg(test)]
#[derive(Debug, Clone)]
pub(crate) struct ManualClock(std::sync::Arc<std::sync::Mutex<NaiveDateTime>>);

#[cfg(test)]
impl ManualClock {
    pub fn at(now: NaiveDateTime) -> Self {
        Self(std::sync::Arc::new(std::sync::Mutex::new(now)))
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.0.lock().unwrap() = now;
    }
}

#[cfg(test)]
impl WallClock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.0.lock().unwrap()
    }
}
