//! HLS backend: a [`hls::Client`](crate::hls::Client) per connection with a
//! data callback on every codec family. Each delivered segment is one unit.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

use super::sse::http_client;
use super::{ClientError, Protocol, ProtocolProfile};
use crate::engine::session::{Connector, ReadEvent, Transport};
use crate::engine::ClientContext;
use crate::hls::{Client, CodecFamily, RunningClient};

/// Starts an HLS client per connection with a data callback on every codec family.
pub struct HlsConnector {
    profile: ProtocolProfile,
}

impl HlsConnector {
    pub fn new(profile: ProtocolProfile) -> Self {
        Self { profile }
    }
}

#[async_trait::async_trait]
impl Connector for HlsConnector {
    type Transport = HlsTransport;

    fn protocol(&self) -> Protocol {
        Protocol::Hls
    }

    fn profile(&self) -> &ProtocolProfile {
        &self.profile
    }

    async fn connect(&self, ctx: &ClientContext) -> Result<HlsTransport, ClientError> {
        let http = http_client(ctx, &self.profile)?;
        let (tx, rx) = mpsc::unbounded_channel();

        let client_id = ctx.client_id;
        let mut client = Client::new(ctx.target.to_string(), http).on_tracks(move |tracks| {
            info!(client_id, tracks = tracks.len(), "HLS tracks received");
        });
        for family in CodecFamily::ALL {
            let tx = tx.clone();
            client = client.on_data(family, move |segment| {
                let _ = tx.send(segment.bytes.len());
            });
        }

        Ok(HlsTransport {
            segments: rx,
            client: client.start()?,
            read_poll: self.profile.read_poll,
        })
    }
}

/// A following HLS client. Delivered segments are units; the client's own
/// completion ends the stream.
pub struct HlsTransport {
    /// Byte length of each delivered segment, in delivery order.
    segments: mpsc::UnboundedReceiver<usize>,
    client: RunningClient,
    read_poll: Duration,
}

#[async_trait::async_trait]
impl Transport for HlsTransport {
    async fn next_event(&mut self) -> Result<ReadEvent, ClientError> {
        tokio::select! {
            biased;
            Some(bytes) = self.segments.recv() => Ok(ReadEvent::unit(bytes)),
            result = self.client.wait() => match result {
                Ok(()) => Ok(ReadEvent::End),
                Err(e) => Err(e.into()),
            },
            _ = tokio::time::sleep(self.read_poll) => Ok(ReadEvent::Idle),
        }
    }

    async fn close(self) {
        self.client.close();
    }
}
