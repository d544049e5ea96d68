//! WebSocket backend: any server frame is data; reads short-poll so the
//! session's timers stay responsive.

use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::{ClientError, Protocol, ProtocolProfile};
use crate::engine::session::{Connector, ReadEvent, Transport};
use crate::engine::ClientContext;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Dials `ws://`/`wss://` targets with a full client handshake.
pub struct WsConnector {
    profile: ProtocolProfile,
}

impl WsConnector {
    pub fn new(profile: ProtocolProfile) -> Self {
        Self { profile }
    }
}

#[async_trait::async_trait]
impl Connector for WsConnector {
    type Transport = WsTransport;

    fn protocol(&self) -> Protocol {
        Protocol::Ws
    }

    fn profile(&self) -> &ProtocolProfile {
        &self.profile
    }

    async fn connect(&self, ctx: &ClientContext) -> Result<WsTransport, ClientError> {
        let (stream, response) = tokio_tungstenite::connect_async(&*ctx.target)
            .await
            .map_err(|e| ClientError::Connect {
                target: ctx.target.to_string(),
                reason: e.to_string(),
            })?;
        debug!(
            client_id = ctx.client_id,
            status = response.status().as_u16(),
            "websocket handshake complete"
        );

        Ok(WsTransport {
            stream,
            read_poll: self.profile.read_poll,
        })
    }
}

/// One open WebSocket. Every server frame, control frames included, is one unit.
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// Upper bound on one frame read; expiry is an idle tick.
    read_poll: Duration,
}

#[async_trait::async_trait]
impl Transport for WsTransport {
    async fn next_event(&mut self) -> Result<ReadEvent, ClientError> {
        match tokio::time::timeout(self.read_poll, self.stream.next()).await {
            Err(_) => Ok(ReadEvent::Idle),
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => Ok(ReadEvent::End),
            Ok(Some(Ok(msg))) => Ok(ReadEvent::unit(msg.len())),
            Ok(Some(Err(e))) => Err(ClientError::Read(e.to_string())),
        }
    }

    async fn close(mut self) {
        match tokio::time::timeout(CLOSE_TIMEOUT, self.stream.close(None)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "websocket close failed"),
            Err(_) => debug!("websocket close timed out"),
        }
    }
}
