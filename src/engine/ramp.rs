//! Ramp controller: doubling waves of fire-and-forget virtual clients.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ClientContext, Signal, VirtualClient};

/// Pause between waves so a wave's connection storm settles before the next.
pub const DEFAULT_THROTTLE: Duration = Duration::from_secs(1);

/// Shape of a ramp: `initial` clients, then `pump_cycles` doublings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RampPlan {
    initial: u64,
    pump_cycles: u32,
    throttle: Duration,
}

impl RampPlan {
    pub fn new(initial: u64, pump_cycles: u32) -> Self {
        Self {
            initial,
            pump_cycles,
            throttle: DEFAULT_THROTTLE,
        }
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn initial(&self) -> u64 {
        self.initial
    }

    pub fn pump_cycles(&self) -> u32 {
        self.pump_cycles
    }

    pub fn throttle(&self) -> Duration {
        self.throttle
    }

    /// Population of every wave, in dispatch order.
    ///
    /// This is the one recurrence both the dispatcher and [`stop_count`]
    /// follow. Saturates instead of overflowing; [`checked_stop_count`]
    /// reports plans that would.
    ///
    /// [`stop_count`]: RampPlan::stop_count
    /// [`checked_stop_count`]: RampPlan::checked_stop_count
    pub fn waves(&self) -> impl Iterator<Item = u64> {
        let initial = self.initial;
        (0..=self.pump_cycles).scan(initial, |population, _| {
            let current = *population;
            *population = population.saturating_mul(2);
            Some(current)
        })
    }

    /// Total number of clients the ramp will ever dispatch.
    pub fn stop_count(&self) -> u64 {
        self.waves().fold(0u64, |acc, n| acc.saturating_add(n))
    }

    /// Like [`stop_count`](RampPlan::stop_count), but `None` if any wave
    /// population or the total does not fit in a `u64`.
    pub fn checked_stop_count(&self) -> Option<u64> {
        let mut population = self.initial;
        let mut total = 0u64;
        for cycle in 0..=self.pump_cycles {
            total = total.checked_add(population)?;
            if cycle < self.pump_cycles {
                population = population.checked_mul(2)?;
            }
        }
        Some(total)
    }
}

/// Dispatches the waves of one run.
pub(crate) struct Ramp {
    plan: RampPlan,
    target: Arc<str>,
    duration: Duration,
}

impl Ramp {
    pub(crate) fn new(plan: RampPlan, target: Arc<str>, duration: Duration) -> Self {
        Self {
            plan,
            target,
            duration,
        }
    }

    /// Dispatch every wave. Returns once the last wave has been spawned,
    /// without waiting for any client.
    pub(crate) async fn run(
        self,
        client: Arc<dyn VirtualClient>,
        signals: mpsc::Sender<Signal>,
        cancel: CancellationToken,
    ) {
        let mut next_id = 0u64;
        let total_waves = self.plan.pump_cycles + 1;

        for (wave, population) in self.plan.waves().enumerate() {
            let wave = wave as u32;
            for _ in 0..population {
                let ctx = ClientContext {
                    client_id: next_id,
                    wave,
                    target: self.target.clone(),
                    duration: self.duration,
                    cancel: cancel.child_token(),
                };
                next_id += 1;
                tokio::spawn(dispatch(client.clone(), ctx, signals.clone()));
            }

            info!(wave, dispatched = population, "users dispatched");

            if wave + 1 == total_waves {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.plan.throttle) => {}
                _ = cancel.cancelled() => {
                    debug!(wave, "run cancelled; dispatching remaining waves without pause");
                }
            }
        }

        debug!(total = next_id, "ramp finished dispatching");
    }
}

/// Run one attempt and emit its signal, even if the attempt panics.
async fn dispatch(client: Arc<dyn VirtualClient>, ctx: ClientContext, signals: mpsc::Sender<Signal>) {
    let client_id = ctx.client_id;
    let wave = ctx.wave;

    let attempt = tokio::spawn(async move { client.attempt(&ctx).await });
    let signal = match attempt.await {
        Ok(signal) => signal,
        Err(e) => {
            warn!(client_id, wave, error = %e, "virtual client aborted; counting as failed");
            Signal::Fail
        }
    };

    if signals.send(signal).await.is_err() {
        debug!(client_id, "signal queue closed before client reported");
    }
}
