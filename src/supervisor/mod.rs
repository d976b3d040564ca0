//! Liveness state machine and daemon main loop.
//!
//! The supervisor owns the command handler and every collaborator. Each
//! [`Supervisor::tick`] performs one step of the current state; nothing runs
//! concurrently and the serial link carries one request at a time.

pub mod heartbeat;
pub mod network;

use std::fmt;
use std::time::Duration;

use chrono::NaiveTime;
use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::time::Instant;

use crate::archive::{ArchiveHandoff, LogArchive, LogRotation};
use crate::commands::{CommandHandler, DEFAULT_TIMEOUT};
use crate::error::{Error, Result};
use crate::event::{Event, EventDispatcher};
use crate::scheduler::{LocalClock, ScheduledTask, TaskScheduler, WallClock};
use crate::transport::Transport;

pub use heartbeat::{HeartbeatOutcome, HeartbeatSupervisor};
pub use network::{NetworkHealthMonitor, NetworkVerdict, PingHealth, PingProbe, ReachabilityProbe};

/// Liveness of the device as seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Serial link not open yet.
    PowerOn,
    /// Link open, waiting for the first alive response.
    AwaitingDevice,
    /// Device answered; heartbeats, probes and jobs run.
    Active,
    /// Device stopped answering heartbeats; slow recovery handshake.
    Unresponsive,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PowerOn => "power-on",
            Self::AwaitingDevice => "awaiting-device",
            Self::Active => "active",
            Self::Unresponsive => "unresponsive",
        };
        f.write_str(name)
    }
}

/// What to do when a heartbeat goes unanswered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatFailurePolicy {
    /// Stay active and probe again on the next poll tick.
    Retry,
    /// Close the link and start over from power-on.
    Restart,
    /// Enter the unresponsive state and run the recovery handshake.
    Recover,
}

/// Board generation. Selects the defaults each generation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceVariant {
    Bt01,
    #[default]
    Bt11,
}

impl DeviceVariant {
    /// Heartbeat failure policy of this generation.
    #[must_use]
    pub const fn heartbeat_policy(self) -> HeartbeatFailurePolicy {
        match self {
            Self::Bt01 => HeartbeatFailurePolicy::Recover,
            Self::Bt11 => HeartbeatFailurePolicy::Retry,
        }
    }

    /// Settings pushed to the device on entering the active state.
    #[must_use]
    pub const fn device_settings(self) -> Option<DeviceSettings> {
        match self {
            Self::Bt01 => None,
            Self::Bt11 => Some(DeviceSettings {
                heartbeat_period: 11,
                poweroff_time: 0,
            }),
        }
    }
}

/// Device-side settings, sent as raw one-byte codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSettings {
    /// Device heartbeat timeout code (11 = 12 minutes).
    pub heartbeat_period: u8,
    /// Power-off delay code (0 = 30 seconds).
    pub poweroff_time: u8,
}

/// Timing and policy of the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Wait before the first connect, letting the host settle after boot.
    pub startup_delay: Duration,
    /// Sleep between steady-state checks.
    pub poll_interval: Duration,
    /// How long to wait for the first alive response.
    pub handshake_deadline: Duration,
    /// Pause after a failed handshake.
    pub handshake_retry: Duration,
    /// Host-side heartbeat period.
    pub heartbeat_period: Duration,
    /// How long a heartbeat waits for its answer.
    pub heartbeat_deadline: Duration,
    /// What an unanswered heartbeat leads to.
    pub heartbeat_policy: HeartbeatFailurePolicy,
    /// Pause between closing and reopening the link during recovery.
    pub recovery_pause: Duration,
    /// Deadline and cadence of recovery handshakes.
    pub recovery_interval: Duration,
    /// Deadline of administrative commands.
    pub command_timeout: Duration,
    /// Deadline of the status request on entering the active state.
    pub status_timeout: Duration,
    /// Pause between log chunk requests.
    pub log_pause: Duration,
    /// Pushed to the device on entering the active state.
    pub device_settings: Option<DeviceSettings>,
    /// Reachability probe period.
    pub ping_period: Duration,
    /// Hosts probed each period, in order.
    pub ping_hosts: Vec<String>,
    /// All-down periods in a row that trigger escalation.
    pub failure_threshold: u32,
    /// Daily device log retrieval.
    pub read_logs_at: NaiveTime,
    /// Daily archive rotation.
    pub rotate_logs_at: NaiveTime,
}

impl SupervisorConfig {
    /// Returns the defaults for a board generation.
    #[must_use]
    pub fn for_variant(variant: DeviceVariant) -> Self {
        let startup_delay = match variant {
            DeviceVariant::Bt01 => Duration::from_secs(60),
            DeviceVariant::Bt11 => Duration::from_secs(15),
        };
        let heartbeat_deadline = match variant {
            DeviceVariant::Bt01 => Duration::from_secs(10),
            DeviceVariant::Bt11 => Duration::from_secs(15),
        };

        Self {
            startup_delay,
            poll_interval: Duration::from_secs(10),
            handshake_deadline: Duration::from_secs(60),
            handshake_retry: Duration::from_secs(60),
            heartbeat_period: Duration::from_secs(300),
            heartbeat_deadline,
            heartbeat_policy: variant.heartbeat_policy(),
            recovery_pause: Duration::from_secs(5),
            recovery_interval: Duration::from_secs(300),
            command_timeout: DEFAULT_TIMEOUT,
            status_timeout: Duration::from_secs(10),
            log_pause: crate::commands::DEFAULT_LOG_PAUSE,
            device_settings: variant.device_settings(),
            ping_period: Duration::from_secs(300),
            ping_hosts: vec!["8.8.8.8".to_owned(), "www.google.com".to_owned()],
            failure_threshold: 4,
            read_logs_at: NaiveTime::from_hms_opt(2, 0, 0).unwrap_or(NaiveTime::MIN),
            rotate_logs_at: NaiveTime::from_hms_opt(2, 15, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::for_variant(DeviceVariant::default())
    }
}

/// Controls the host the daemon runs on.
pub trait HostControl: Send {
    /// Shuts the host down.
    fn shutdown(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// Runs a system command to shut the host down.
#[derive(Debug, Clone)]
pub struct SystemHost {
    program: String,
    args: Vec<String>,
}

impl SystemHost {
    /// Uses `command` (program followed by arguments). Returns `None` for an
    /// empty command line.
    #[must_use]
    pub fn from_command_line(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl Default for SystemHost {
    fn default() -> Self {
        Self {
            program: "shutdown".to_owned(),
            args: vec!["-h".to_owned(), "now".to_owned()],
        }
    }
}

impl HostControl for SystemHost {
    fn shutdown(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            tracing::warn!("shutting down host: {} {}", self.program, self.args.join(" "));
            let status = tokio::process::Command::new(&self.program)
                .args(&self.args)
                .status()
                .await
                .map_err(|e| Error::Command {
                    program: self.program.clone(),
                    reason: e.to_string(),
                })?;
            if status.success() {
                Ok(())
            } else {
                Err(Error::Command {
                    program: self.program.clone(),
                    reason: status.to_string(),
                })
            }
        })
    }
}

/// Whether the main loop keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Host shutdown has been issued.
    Shutdown,
}

/// The daemon: liveness state machine plus everything it drives.
pub struct Supervisor<T> {
    commands: CommandHandler<T>,
    config: SupervisorConfig,
    state: ConnectionState,
    previous_state: ConnectionState,
    entering_active: bool,
    last_error: Option<String>,
    heartbeat: HeartbeatSupervisor,
    network: NetworkHealthMonitor,
    scheduler: TaskScheduler,
    archive: Box<dyn LogArchive>,
    rotation: Option<Box<dyn LogRotation>>,
    handoff: Option<Box<dyn ArchiveHandoff>>,
    probe: Box<dyn ReachabilityProbe>,
    host: Box<dyn HostControl>,
    clock: Box<dyn WallClock>,
    events: EventDispatcher,
}

impl<T: Transport> Supervisor<T> {
    /// Creates a supervisor in the power-on state.
    ///
    /// Probes use the system `ping`, escalation runs `shutdown -h now` and
    /// wall-clock time is the host's local time; override with the `with_*`
    /// methods.
    pub fn new(transport: T, config: SupervisorConfig, archive: impl LogArchive + 'static) -> Self {
        let now = Instant::now();
        let mut commands = CommandHandler::new(transport);
        commands.set_timeout(config.command_timeout);
        commands.set_log_pause(config.log_pause);

        Self {
            commands,
            heartbeat: HeartbeatSupervisor::new(
                config.heartbeat_period,
                config.heartbeat_deadline,
                now,
            ),
            network: NetworkHealthMonitor::new(
                config.ping_period,
                config.ping_hosts.clone(),
                config.failure_threshold,
                now,
            ),
            config,
            state: ConnectionState::PowerOn,
            previous_state: ConnectionState::PowerOn,
            entering_active: false,
            last_error: None,
            scheduler: TaskScheduler::new(),
            archive: Box::new(archive),
            rotation: None,
            handoff: None,
            probe: Box::new(PingProbe::default()),
            host: Box::new(SystemHost::default()),
            clock: Box::new(LocalClock),
            events: EventDispatcher::default(),
        }
    }

    /// Enables daily rotation of the archive.
    #[must_use]
    pub fn with_rotation(mut self, rotation: impl LogRotation + 'static) -> Self {
        self.rotation = Some(Box::new(rotation));
        self
    }

    /// Hands rotated archives to `handoff`.
    #[must_use]
    pub fn with_handoff(mut self, handoff: impl ArchiveHandoff + 'static) -> Self {
        self.handoff = Some(Box::new(handoff));
        self
    }

    /// Replaces the reachability probe.
    #[must_use]
    pub fn with_probe(mut self, probe: impl ReachabilityProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    /// Replaces host control.
    #[must_use]
    pub fn with_host(mut self, host: impl HostControl + 'static) -> Self {
        self.host = Box::new(host);
        self
    }

    /// Replaces the wall clock.
    #[must_use]
    pub fn with_clock(mut self, clock: impl WallClock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Publishes events on `events` instead of a private dispatcher.
    #[must_use]
    pub fn with_events(mut self, events: EventDispatcher) -> Self {
        self.events = events;
        self
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Returns the state before the last transition.
    #[must_use]
    pub const fn previous_state(&self) -> ConnectionState {
        self.previous_state
    }

    /// Returns the most recent failure, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Returns the event dispatcher.
    #[must_use]
    pub const fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// Returns the command handler.
    #[must_use]
    pub const fn commands(&self) -> &CommandHandler<T> {
        &self.commands
    }

    /// Returns the daily scheduler.
    #[must_use]
    pub const fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Returns the heartbeat supervisor.
    #[must_use]
    pub const fn heartbeat(&self) -> &HeartbeatSupervisor {
        &self.heartbeat
    }

    /// Returns the network monitor.
    #[must_use]
    pub const fn network(&self) -> &NetworkHealthMonitor {
        &self.network
    }

    /// Runs until escalation has shut the host down.
    ///
    /// Only a bounded open budget running out, or a failed shutdown, ends
    /// the loop with an error.
    pub async fn run(&mut self) -> Result<()> {
        if !self.config.startup_delay.is_zero() {
            tracing::info!("waiting {:?} for the host to settle", self.config.startup_delay);
            tokio::time::sleep(self.config.startup_delay).await;
        }

        loop {
            if self.tick().await? == Flow::Shutdown {
                return Ok(());
            }
        }
    }

    /// Performs one step of the current state.
    pub async fn tick(&mut self) -> Result<Flow> {
        match self.state {
            ConnectionState::PowerOn => self.power_on().await,
            ConnectionState::AwaitingDevice => self.await_device().await,
            ConnectionState::Active if self.entering_active => self.enter_active().await,
            ConnectionState::Active => self.steady().await,
            ConnectionState::Unresponsive => self.recover().await,
        }
    }

    fn transition(&mut self, to: ConnectionState) {
        if to == self.state {
            return;
        }
        tracing::info!("state {} -> {}", self.state, to);
        self.previous_state = self.state;
        self.state = to;
        self.entering_active = to == ConnectionState::Active;
        self.events.dispatch(Event::StateChanged {
            from: self.previous_state,
            to,
        });
    }

    fn record_error(&mut self, context: &str, error: &Error) {
        tracing::warn!("{}: {}", context, error);
        self.last_error = Some(format!("{context}: {error}"));
    }

    /// Closes the link after a transport failure and starts over.
    async fn link_lost(&mut self, context: &str, error: &Error) -> Result<Flow> {
        self.record_error(context, error);
        self.events.dispatch(Event::LinkLost {
            reason: error.to_string(),
        });
        self.commands.disconnect().await?;
        self.transition(ConnectionState::PowerOn);
        Ok(Flow::Continue)
    }

    async fn power_on(&mut self) -> Result<Flow> {
        self.commands.connect().await?;
        self.transition(ConnectionState::AwaitingDevice);
        Ok(Flow::Continue)
    }

    async fn await_device(&mut self) -> Result<Flow> {
        match self.commands.alive(self.config.handshake_deadline).await {
            Ok(frame) if frame.is_alive_response() => {
                tracing::info!("device is alive");
                self.transition(ConnectionState::Active);
                return Ok(Flow::Continue);
            }
            Ok(frame) => tracing::debug!(
                "handshake answered with 0x{:02x} (checksum ok: {})",
                frame.command,
                frame.checksum_ok
            ),
            Err(e) if e.is_link_failure() => return self.link_lost("handshake", &e).await,
            Err(e) => tracing::debug!("handshake: {}", e),
        }

        tokio::time::sleep(self.config.handshake_retry).await;
        Ok(Flow::Continue)
    }

    /// One-shot setup after the device (re)appeared.
    async fn enter_active(&mut self) -> Result<Flow> {
        self.entering_active = false;
        tracing::info!("device active (from {})", self.previous_state);

        if let Some(settings) = self.config.device_settings {
            if let Err(e) = self.commands.set_heartbeat_period(settings.heartbeat_period).await {
                if e.is_link_failure() {
                    return self.link_lost("heartbeat period", &e).await;
                }
                self.record_error("heartbeat period", &e);
            }
            if let Err(e) = self.commands.set_poweroff_time(settings.poweroff_time).await {
                if e.is_link_failure() {
                    return self.link_lost("power-off time", &e).await;
                }
                self.record_error("power-off time", &e);
            }
        }

        match self.commands.read_status(self.config.status_timeout).await {
            Ok(status) => tracing::info!("device status: {}", hex::encode(&status)),
            Err(e) if e.is_link_failure() => return self.link_lost("status", &e).await,
            Err(e) => self.record_error("status", &e),
        }

        let now = self.clock.now();
        match self.commands.sync_rtc(now).await {
            Ok(_) => tracing::info!("device clock set to {}", now),
            Err(e) if e.is_link_failure() => return self.link_lost("clock sync", &e).await,
            Err(e) => self.record_error("clock sync", &e),
        }

        self.read_logs().await;

        let now = self.clock.now();
        self.scheduler
            .register(self.config.read_logs_at, ScheduledTask::ReadLogs, now);
        self.scheduler
            .register(self.config.rotate_logs_at, ScheduledTask::RotateLogs, now);

        let now = Instant::now();
        self.heartbeat.reset(now);
        self.network.reset(now);
        Ok(Flow::Continue)
    }

    async fn steady(&mut self) -> Result<Flow> {
        tokio::time::sleep(self.config.poll_interval).await;

        if self.heartbeat.is_due(Instant::now()) {
            match self.heartbeat.probe(&mut self.commands).await {
                HeartbeatOutcome::Acknowledged => {
                    self.events.dispatch(Event::HeartbeatAcknowledged);
                }
                HeartbeatOutcome::Unexpected { .. } => {}
                HeartbeatOutcome::LinkFailed(e) => return self.link_lost("heartbeat", &e).await,
                HeartbeatOutcome::NoResponse => {
                    self.events.dispatch(Event::HeartbeatMissed);
                    self.last_error = Some("heartbeat: no response".to_owned());
                    match self.config.heartbeat_policy {
                        HeartbeatFailurePolicy::Retry => {}
                        HeartbeatFailurePolicy::Restart => {
                            self.commands.disconnect().await?;
                            self.transition(ConnectionState::PowerOn);
                            return Ok(Flow::Continue);
                        }
                        HeartbeatFailurePolicy::Recover => {
                            self.transition(ConnectionState::Unresponsive);
                            return Ok(Flow::Continue);
                        }
                    }
                }
            }
        }

        if self.network.is_due(Instant::now()) {
            let verdict = self
                .network
                .check(self.probe.as_mut(), &self.events)
                .await;
            if let NetworkVerdict::Escalate {
                consecutive_failures,
            } = verdict
            {
                return self.escalate(consecutive_failures).await;
            }
        }

        for task in self.scheduler.due(self.clock.now()) {
            self.run_task(task).await;
        }

        Ok(Flow::Continue)
    }

    async fn recover(&mut self) -> Result<Flow> {
        let started = Instant::now();

        self.commands.disconnect().await?;
        tokio::time::sleep(self.config.recovery_pause).await;
        self.commands.connect().await?;

        match self.commands.alive(self.config.recovery_interval).await {
            Ok(frame) if frame.is_alive_response() => {
                tracing::info!("device recovered");
                self.transition(ConnectionState::Active);
                return Ok(Flow::Continue);
            }
            Ok(frame) => tracing::debug!("recovery answered with 0x{:02x}", frame.command),
            Err(e) => self.record_error("recovery", &e),
        }

        tokio::time::sleep_until(started + self.config.recovery_interval).await;
        Ok(Flow::Continue)
    }

    async fn escalate(&mut self, consecutive_failures: u32) -> Result<Flow> {
        tracing::error!(
            "network unreachable for {} periods, rebooting device and shutting down",
            consecutive_failures
        );
        self.events.dispatch(Event::Escalation {
            consecutive_failures,
        });

        if let Err(e) = self.commands.cold_reboot().await {
            self.record_error("cold reboot", &e);
        }

        if let Err(e) = self.host.shutdown().await {
            self.record_error("shutdown", &e);
            return Err(e);
        }
        Ok(Flow::Shutdown)
    }

    async fn read_logs(&mut self) {
        let transfer = self.commands.read_logs(self.archive.as_mut()).await;
        if !transfer.complete {
            self.last_error = Some(format!(
                "log transfer incomplete after {} chunks",
                transfer.chunks
            ));
        }
        self.events.dispatch(Event::LogsRetrieved {
            chunks: transfer.chunks,
            complete: transfer.complete,
        });
    }

    async fn run_task(&mut self, task: ScheduledTask) {
        tracing::info!("running daily {:?}", task);
        match task {
            ScheduledTask::ReadLogs => self.read_logs().await,
            ScheduledTask::RotateLogs => self.rotate_logs(),
        }
        self.events.dispatch(Event::JobRan(task));
    }

    fn rotate_logs(&mut self) {
        let Some(rotation) = self.rotation.as_mut() else {
            tracing::debug!("rotation disabled");
            return;
        };

        match rotation.rotate() {
            Ok(Some(rotated)) => {
                if let Some(handoff) = self.handoff.as_mut() {
                    if let Err(e) = handoff.hand_off(&rotated) {
                        self.record_error("archive hand-off", &e);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => self.record_error("rotation", &Error::Io(e)),
        }
    }
}
