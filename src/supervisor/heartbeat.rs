//! Heartbeat probing while the device is active.

use std::time::Duration;

use tokio::time::Instant;

use crate::commands::CommandHandler;
use crate::error::Error;
use crate::scheduler::Interval;
use crate::transport::Transport;

/// Outcome of one heartbeat probe.
#[derive(Debug)]
pub enum HeartbeatOutcome {
    /// Checksum-valid alive response.
    Acknowledged,
    /// Some other frame came back; still counts as a sign of life.
    Unexpected { command: u8, checksum_ok: bool },
    /// Writing or reading the link failed.
    LinkFailed(Error),
    /// Nothing came back before the deadline.
    NoResponse,
}

impl HeartbeatOutcome {
    /// Returns true if the device showed any sign of life.
    #[must_use]
    pub const fn is_alive(&self) -> bool {
        matches!(self, Self::Acknowledged | Self::Unexpected { .. })
    }
}

/// Sends alive requests every period and watches for the answer.
#[derive(Debug, Clone)]
pub struct HeartbeatSupervisor {
    interval: Interval,
    deadline: Duration,
    last_heartbeat_at: Instant,
}

impl HeartbeatSupervisor {
    /// Creates a supervisor whose first probe is one `period` after `now`.
    #[must_use]
    pub fn new(period: Duration, deadline: Duration, now: Instant) -> Self {
        Self {
            interval: Interval::new(period, now),
            deadline,
            last_heartbeat_at: now,
        }
    }

    /// Returns true when a probe is due.
    #[must_use]
    pub fn is_due(&self, now: Instant) -> bool {
        self.interval.is_due(now)
    }

    /// Restarts the period, e.g. after entering the active state.
    pub fn reset(&mut self, now: Instant) {
        self.interval.reset(now);
        self.last_heartbeat_at = now;
    }

    /// Returns when the device last answered.
    #[must_use]
    pub const fn last_heartbeat_at(&self) -> Instant {
        self.last_heartbeat_at
    }

    /// Returns the host-side heartbeat period.
    #[must_use]
    pub const fn period(&self) -> Duration {
        self.interval.period()
    }

    /// Sends one alive request and classifies the answer.
    ///
    /// Any answer restarts the period. On a missing answer or a link failure
    /// the period is left expired so the caller decides what happens next.
    pub async fn probe<T: Transport>(&mut self, commands: &mut CommandHandler<T>) -> HeartbeatOutcome {
        tracing::debug!("heartbeat");
        let outcome = match commands.alive(self.deadline).await {
            Ok(frame) if frame.is_alive_response() => HeartbeatOutcome::Acknowledged,
            Ok(frame) => HeartbeatOutcome::Unexpected {
                command: frame.command,
                checksum_ok: frame.checksum_ok,
            },
            Err(Error::Timeout { .. }) => HeartbeatOutcome::NoResponse,
            Err(e) => HeartbeatOutcome::LinkFailed(e),
        };

        match &outcome {
            HeartbeatOutcome::Acknowledged => tracing::info!("heartbeat acknowledged"),
            HeartbeatOutcome::Unexpected {
                command,
                checksum_ok,
            } => tracing::info!(
                "heartbeat answered with 0x{:02x} (checksum ok: {})",
                command,
                checksum_ok
            ),
            HeartbeatOutcome::NoResponse => {
                tracing::warn!("no heartbeat answer within {:?}", self.deadline);
            }
            HeartbeatOutcome::LinkFailed(e) => tracing::warn!("heartbeat failed: {}", e),
        }

        if outcome.is_alive() {
            self.reset(Instant::now());
        }
        outcome
    }
}
