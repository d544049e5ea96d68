//! Result aggregator: the only consumer of a run's signal queue.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{EngineError, RunResult, Signal};

/// Drain `signals` until `stop_count` of them have been consumed, then emit
/// the report.
///
/// Consuming exactly `stop_count` signals is the run's only completion test;
/// every dispatched client sends one, so reaching it means every client has
/// terminated.
pub async fn collect(
    mut signals: mpsc::Receiver<Signal>,
    initial_count: u64,
    stop_count: u64,
) -> Result<RunResult, EngineError> {
    let mut result = RunResult::new(initial_count, stop_count);

    while !result.is_complete() {
        let Some(signal) = signals.recv().await else {
            warn!(
                received = result.completed(),
                expected = stop_count,
                "signal queue closed before every client reported"
            );
            return Err(EngineError::SignalQueueClosed {
                received: result.completed(),
                expected: stop_count,
            });
        };

        result.record(signal);
        debug!(
            ?signal,
            completed = result.completed(),
            stop_count,
            "client finished"
        );
    }

    match serde_json::to_string(&result) {
        Ok(report) => info!(report = report.as_str(), "run complete"),
        Err(e) => warn!(error = %e, ?result, "failed to serialize run report"),
    }

    Ok(result)
}
