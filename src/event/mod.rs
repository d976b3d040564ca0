//! Event system for following the supervisor from outside.
//!
//! The supervisor publishes what it does on a broadcast channel. Readers such
//! as a status display subscribe and never touch the supervisor's state.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::scheduler::ScheduledTask;
use crate::supervisor::ConnectionState;

/// Event types that can be dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The liveness state machine changed state.
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// A heartbeat was answered with a valid alive response.
    HeartbeatAcknowledged,
    /// A heartbeat got no answer within its deadline.
    HeartbeatMissed,
    /// The serial link failed and was closed.
    LinkLost { reason: String },
    /// One reachability probe finished.
    NetworkProbe { host: String, reachable: bool },
    /// Sustained network loss; device reboot and host shutdown follow.
    Escalation { consecutive_failures: u32 },
    /// A device log transfer finished.
    LogsRetrieved { chunks: usize, complete: bool },
    /// A daily job ran.
    JobRan(ScheduledTask),
}

/// Coarse event categories for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    State,
    Heartbeat,
    Link,
    Network,
    Logs,
    Job,
}

impl Event {
    /// Returns the category of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::StateChanged { .. } => EventKind::State,
            Self::HeartbeatAcknowledged | Self::HeartbeatMissed => EventKind::Heartbeat,
            Self::LinkLost { .. } => EventKind::Link,
            Self::NetworkProbe { .. } | Self::Escalation { .. } => EventKind::Network,
            Self::LogsRetrieved { .. } => EventKind::Logs,
            Self::JobRan(_) => EventKind::Job,
        }
    }
}

/// A subscription to events.
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
    filter: EventFilter,
}

impl Subscription {
    /// Receives the next event that passes the subscription filter.
    ///
    /// Returns `None` once the dispatcher is gone. Events missed because the
    /// reader lagged are skipped.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("event subscriber lagged, {} events dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Subscription filter for specific event kinds.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Accept only these kinds. `None` accepts everything.
    pub kinds: Option<Vec<EventKind>>,
}

impl EventFilter {
    /// Creates a filter for specific event kinds.
    #[must_use]
    pub const fn kinds(kinds: Vec<EventKind>) -> Self {
        Self { kinds: Some(kinds) }
    }

    /// Checks if an event matches this filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        self.kinds
            .as_ref()
            .is_none_or(|kinds| kinds.contains(&event.kind()))
    }
}

struct EventDispatcherInner {
    sender: broadcast::Sender<Event>,
}

/// Dispatches events to subscribers.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<EventDispatcherInner>,
}

impl EventDispatcher {
    /// Creates a new event dispatcher buffering up to `capacity` events per
    /// subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(EventDispatcherInner { sender }),
        }
    }

    /// Dispatches an event to all subscribers.
    pub fn dispatch(&self, event: Event) {
        // No subscribers is fine
        let _ = self.inner.sender.send(event);
    }

    /// Subscribes to events with an optional filter.
    #[must_use]
    pub fn subscribe(&self, filter: Option<EventFilter>) -> Subscription {
        Subscription {
            receiver: self.inner.sender.subscribe(),
            filter: filter.unwrap_or_default(),
        }
    }

    /// Waits for an event matching the filter, up to `timeout`.
    ///
    /// Returns `None` if the timeout expires or the channel is closed.
    pub async fn wait_for(
        &self,
        filter: EventFilter,
        timeout: std::time::Duration,
    ) -> Option<Event> {
        let mut subscription = self.subscribe(Some(filter));
        tokio::time::timeout(timeout, subscription.recv())
            .await
            .ok()
            .flatten()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(64)
    }
}
