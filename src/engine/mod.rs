//! Load ramp engine: wave dispatch, per-connection state machine, result
//! aggregation.
//!
//! A run owns everything it touches. The [`ramp`] controller fans out
//! [`VirtualClient`] attempts in doubling waves, every attempt reports exactly
//! one [`Signal`] on the run's queue, and the [`aggregator`] stops once it has
//! consumed as many signals as the ramp will ever dispatch.

pub mod aggregator;
pub mod health;
pub mod ramp;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use self::ramp::RampPlan;

/// Default capacity of the shared signal queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// Terminal classification of one virtual client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Pass,
    Fail,
}

impl Signal {
    /// Pass iff any application data was observed.
    pub fn from_data(received: bool) -> Self {
        if received {
            Signal::Pass
        } else {
            Signal::Fail
        }
    }

    pub fn is_pass(self) -> bool {
        matches!(self, Signal::Pass)
    }
}

// ---------------------------------------------------------------------------
// RunResult
// ---------------------------------------------------------------------------

/// Aggregate outcome of a run. Only the aggregator mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub initial_count: u64,
    pub passed: u64,
    pub failed: u64,
    pub stop_count: u64,
}

impl RunResult {
    pub fn new(initial_count: u64, stop_count: u64) -> Self {
        Self {
            initial_count,
            passed: 0,
            failed: 0,
            stop_count,
        }
    }

    /// Signals consumed so far.
    pub fn completed(&self) -> u64 {
        self.passed + self.failed
    }

    pub fn is_complete(&self) -> bool {
        self.completed() >= self.stop_count
    }

    pub fn record(&mut self, signal: Signal) {
        match signal {
            Signal::Pass => self.passed += 1,
            Signal::Fail => self.failed += 1,
        }
    }
}

// ---------------------------------------------------------------------------
// VirtualClient
// ---------------------------------------------------------------------------

/// Everything one connection attempt needs to know about itself.
#[derive(Debug, Clone)]
pub struct ClientContext {
    /// Dispatch index, unique within a run.
    pub client_id: u64,
    /// Zero-based wave the client was dispatched in.
    pub wave: u32,
    /// Endpoint address, as given in the configuration.
    pub target: Arc<str>,
    /// Hard duration of the connection.
    pub duration: Duration,
    /// Child of the run's root scope; cancelled on interrupt.
    pub cancel: CancellationToken,
}

/// The single capability the engine needs from a protocol: run one
/// connection attempt to completion and classify it.
#[async_trait::async_trait]
pub trait VirtualClient: Send + Sync + 'static {
    /// Short protocol tag used in logs.
    fn name(&self) -> &'static str;

    /// Run one attempt. Must release all connection resources before returning.
    async fn attempt(&self, ctx: &ClientContext) -> Signal;
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("signal queue closed after {received} of {expected} signals")]
    SignalQueueClosed { received: u64, expected: u64 },
}

/// Parameters of one run, independent of the protocol.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub target: String,
    pub duration: Duration,
    pub plan: RampPlan,
    pub queue_capacity: usize,
}

/// Drive a full run: dispatch every wave and wait for every signal.
///
/// Cancelling `cancel` does not cut the run short; it makes every remaining
/// client classify immediately so the report still covers the whole ramp.
pub async fn run(
    client: Arc<dyn VirtualClient>,
    settings: RunSettings,
    cancel: CancellationToken,
) -> Result<RunResult, EngineError> {
    let stop_count = settings.plan.stop_count();
    let (signal_tx, signal_rx) = mpsc::channel(settings.queue_capacity.max(1));

    info!(
        endpoint = settings.target.as_str(),
        protocol = client.name(),
        initial_count = settings.plan.initial(),
        pump_count = settings.plan.pump_cycles(),
        duration_sec = settings.duration.as_secs_f64(),
        stop_count,
        "starting load ramp"
    );

    let ramp = ramp::Ramp::new(
        settings.plan.clone(),
        Arc::from(settings.target.as_str()),
        settings.duration,
    );
    let ramp_task = tokio::spawn(ramp.run(client, signal_tx, cancel));

    let result = aggregator::collect(signal_rx, settings.plan.initial(), stop_count).await;
    if result.is_err() {
        ramp_task.abort();
    }
    result
}
