//! Kadrion -- ramp-up load generator for streaming endpoints.
//!
//! A run opens a doubling population of virtual clients against one endpoint,
//! speaking WebSocket, Server-Sent Events, HLS or HTTP-FLV, classifies each
//! connection as passed or failed, and reports the totals once every
//! dispatched client has finished.

pub mod config;
pub mod engine;
pub mod flv;
pub mod hls;
pub mod protocols;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use config::RunConfig;
use engine::RunResult;

/// Run the load ramp described by `config` to completion.
///
/// Cancelling `cancel` makes outstanding clients classify immediately; the
/// returned report still covers every dispatched client.
pub async fn run_from_config(config: &RunConfig, cancel: CancellationToken) -> Result<RunResult> {
    let client = config.protocol.client(config.client_options());
    let result = engine::run(client, config.settings(), cancel).await?;
    Ok(result)
}
