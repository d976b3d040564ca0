//! Internet reachability monitoring and escalation.

use std::process::Stdio;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;

use crate::event::{Event, EventDispatcher};
use crate::scheduler::Interval;

/// Default per-reply wait handed to `ping -W`.
pub const DEFAULT_PING_WAIT: Duration = Duration::from_secs(10);

/// Echo requests per probe.
const PING_COUNT: &str = "2";

/// Extra time allowed on top of the ping's own waits before it is killed.
const PING_SLACK: Duration = Duration::from_secs(5);

/// Checks whether one host answers.
pub trait ReachabilityProbe: Send {
    /// Probes `host`, returning true if it is reachable. Never fails; an
    /// unrunnable probe counts as unreachable.
    fn probe<'a>(&'a mut self, host: &'a str) -> BoxFuture<'a, bool>;
}

/// Probes with the system `ping` utility.
#[derive(Debug, Clone)]
pub struct PingProbe {
    wait: Duration,
}

impl PingProbe {
    /// Creates a probe waiting up to `wait` for each echo reply.
    #[must_use]
    pub fn new(wait: Duration) -> Self {
        Self {
            wait: wait.max(Duration::from_secs(1)),
        }
    }

    fn deadline(&self) -> Duration {
        self.wait * 2 + PING_SLACK
    }
}

impl Default for PingProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PING_WAIT)
    }
}

impl ReachabilityProbe for PingProbe {
    fn probe<'a>(&'a mut self, host: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let status = tokio::process::Command::new("ping")
                .arg(host)
                .args(["-c", PING_COUNT, "-W"])
                .arg(self.wait.as_secs().to_string())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .status();

            match tokio::time::timeout(self.deadline(), status).await {
                Ok(Ok(status)) => status.success(),
                Ok(Err(e)) => {
                    tracing::error!("cannot run ping: {}", e);
                    false
                }
                Err(_) => {
                    tracing::warn!("ping {} did not finish in {:?}", host, self.deadline());
                    false
                }
            }
        })
    }
}

/// Failure bookkeeping of the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingHealth {
    /// Probe periods in a row in which no host answered.
    pub consecutive_failures: u32,
    /// Start of the current probe period.
    pub window_started_at: Instant,
}

/// What one probe period means for the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkVerdict {
    /// At least one host answered.
    Healthy,
    /// Nothing answered, threshold not reached (or already escalated).
    Degraded { consecutive_failures: u32 },
    /// Threshold reached: reboot the device and shut the host down.
    Escalate { consecutive_failures: u32 },
}

/// Counts all-hosts-down periods and escalates once at the threshold.
#[derive(Debug, Clone)]
pub struct NetworkHealthMonitor {
    interval: Interval,
    hosts: Vec<String>,
    threshold: u32,
    health: PingHealth,
    escalated: bool,
}

impl NetworkHealthMonitor {
    /// Creates a monitor whose first probe is one `period` after `now`.
    #[must_use]
    pub fn new(period: Duration, hosts: Vec<String>, threshold: u32, now: Instant) -> Self {
        Self {
            interval: Interval::new(period, now),
            hosts,
            threshold: threshold.max(1),
            health: PingHealth {
                consecutive_failures: 0,
                window_started_at: now,
            },
            escalated: false,
        }
    }

    /// Returns true when a probe period is due.
    #[must_use]
    pub fn is_due(&self, now: Instant) -> bool {
        self.interval.is_due(now)
    }

    /// Returns the current failure bookkeeping.
    #[must_use]
    pub const fn health(&self) -> PingHealth {
        self.health
    }

    /// Returns the probed hosts.
    #[must_use]
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Forgets failures and restarts the period, e.g. on entering the active
    /// state.
    pub fn reset(&mut self, now: Instant) {
        self.health = PingHealth {
            consecutive_failures: 0,
            window_started_at: now,
        };
        self.escalated = false;
        self.interval.reset(now);
    }

    /// Records the result of one probe period.
    pub fn record_period(&mut self, any_reachable: bool, now: Instant) -> NetworkVerdict {
        self.interval.reset(now);
        self.health.window_started_at = now;

        if any_reachable {
            if self.health.consecutive_failures > 0 {
                tracing::info!(
                    "network back after {} failed periods",
                    self.health.consecutive_failures
                );
            }
            self.health.consecutive_failures = 0;
            self.escalated = false;
            return NetworkVerdict::Healthy;
        }

        self.health.consecutive_failures = self.health.consecutive_failures.saturating_add(1);
        let consecutive_failures = self.health.consecutive_failures;
        tracing::warn!(
            "no host reachable ({}/{})",
            consecutive_failures,
            self.threshold
        );

        if consecutive_failures >= self.threshold && !self.escalated {
            self.escalated = true;
            NetworkVerdict::Escalate {
                consecutive_failures,
            }
        } else {
            NetworkVerdict::Degraded {
                consecutive_failures,
            }
        }
    }

    /// Probes every host in order and records the period.
    pub async fn check(
        &mut self,
        probe: &mut dyn ReachabilityProbe,
        events: &EventDispatcher,
    ) -> NetworkVerdict {
        let mut any_reachable = false;
        for host in &self.hosts {
            let reachable = probe.probe(host).await;
            tracing::debug!("ping {}: {}", host, if reachable { "ok" } else { "failed" });
            events.dispatch(Event::NetworkProbe {
                host: host.clone(),
                reachable,
            });
            any_reachable |= reachable;
        }
        self.record_period(any_reachable, Instant::now())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Answers from a script of per-host results; unreachable once drained.
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedProbe {
        results: Arc<Mutex<VecDeque<bool>>>,
        probed: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedProbe {
        pub fn new(results: impl IntoIterator<Item = bool>) -> Self {
            Self {
                results: Arc::new(Mutex::new(results.into_iter().collect())),
                probed: Arc::default(),
            }
        }

        pub fn probed(&self) -> Vec<String> {
            self.probed.lock().unwrap().clone()
        }
    }

    impl ReachabilityProbe for ScriptedProbe {
        fn probe<'a>(&'a mut self, host: &'a str) -> BoxFuture<'a, bool> {
            self.probed.lock().unwrap().push(host.to_owned());
            let result = self.results.lock().unwrap().pop_front().unwrap_or(false);
            Box::pin(async move { result })
        }
    }

    fn monitor(threshold: u32) -> NetworkHealthMonitor {
        NetworkHealthMonitor::new(
            Duration::from_secs(300),
            vec!["8.8.8.8".into(), "www.google.com".into()],
            threshold,
            Instant::now(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalates_once_at_threshold() {
        let mut monitor = monitor(4);
        let now = Instant::now();

        for n in 1..=3 {
            assert_eq!(
                monitor.record_period(false, now),
                NetworkVerdict::Degraded {
                    consecutive_failures: n
                }
            );
        }
        assert_eq!(
            monitor.record_period(false, now),
            NetworkVerdict::Escalate {
                consecutive_failures: 4
            }
        );
        assert_eq!(
            monitor.record_period(false, now),
            NetworkVerdict::Degraded {
                consecutive_failures: 5
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_counter() {
        let mut monitor = monitor(4);
        let now = Instant::now();

        for _ in 0..3 {
            monitor.record_period(false, now);
        }
        assert_eq!(monitor.record_period(true, now), NetworkVerdict::Healthy);
        assert_eq!(monitor.health().consecutive_failures, 0);

        for _ in 0..3 {
            assert!(matches!(
                monitor.record_period(false, now),
                NetworkVerdict::Degraded { .. }
            ));
        }
        assert!(matches!(
            monitor.record_period(false, now),
            NetworkVerdict::Escalate { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_period_scheduling() {
        let mut monitor = monitor(4);
        let start = Instant::now();
        assert!(!monitor.is_due(start));
        assert!(monitor.is_due(start + Duration::from_secs(300)));

        let later = start + Duration::from_secs(301);
        monitor.record_period(true, later);
        assert!(!monitor.is_due(later));
        assert_eq!(monitor.health().window_started_at, later);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_reachable_host_is_enough() {
        let mut monitor = monitor(1);
        let mut probe = ScriptedProbe::new([false, true]);
        let events = EventDispatcher::default();
        let mut sub = events.subscribe(None);

        assert_eq!(monitor.check(&mut probe, &events).await, NetworkVerdict::Healthy);
        assert_eq!(probe.probed(), vec!["8.8.8.8", "www.google.com"]);
        assert_eq!(
            sub.recv().await,
            Some(Event::NetworkProbe {
                host: "8.8.8.8".into(),
                reachable: false
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_hosts_down_counts_once() {
        let mut monitor = monitor(2);
        let mut probe = ScriptedProbe::default();
        let events = EventDispatcher::default();

        assert_eq!(
            monitor.check(&mut probe, &events).await,
            NetworkVerdict::Degraded {
                consecutive_failures: 1
            }
        );
        assert_eq!(probe.probed().len(), 2);
    }

    #[test]
    fn test_ping_deadline() {
        let probe = PingProbe::new(Duration::from_secs(10));
        assert_eq!(probe.deadline(), Duration::from_secs(25));
        assert_eq!(PingProbe::new(Duration::ZERO).wait, Duration::from_secs(1));
    }
}
