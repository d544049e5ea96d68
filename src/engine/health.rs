//! Connection health monitor: declares a connection stale when no data has
//! arrived within its grace window.

use std::time::Duration;

use tokio::time::Instant;

use crate::protocols::ProtocolProfile;

/// Per-connection staleness watchdog.
///
/// Two windows apply: `initial_grace` until the first unit of data arrives,
/// `streaming_grace` measured from the latest unit afterwards.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    started: Instant,
    last_activity: Option<Instant>,
    initial_grace: Duration,
    streaming_grace: Duration,
}

impl HealthMonitor {
    pub fn new(profile: &ProtocolProfile, now: Instant) -> Self {
        Self {
            started: now,
            last_activity: None,
            initial_grace: profile.initial_grace,
            streaming_grace: profile.streaming_grace,
        }
    }

    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = Some(now);
    }

    pub fn has_data(&self) -> bool {
        self.last_activity.is_some()
    }

    /// Time since the last unit of data, or since start if none arrived yet.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity.unwrap_or(self.started))
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        let window = if self.has_data() {
            self.streaming_grace
        } else {
            self.initial_grace
        };
        self.idle_for(now) > window
    }
}
