//! Server-Sent Events backend: the response body is scanned line by line and
//! every line, comments and `retry:` directives included, is activity.

use std::io;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONNECTION};
use reqwest::StatusCode;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::debug;

use super::{ClientError, Protocol, ProtocolProfile};
use crate::engine::session::{Connector, ReadEvent, Transport};
use crate::engine::ClientContext;

/// Longest line accepted before the stream is considered broken.
const MAX_LINE_LEN: usize = 64 * 1024;

pub(crate) type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Turn a response into a plain byte stream with I/O errors.
pub(crate) fn body_stream(resp: reqwest::Response) -> BodyStream {
    Box::pin(resp.bytes_stream().map_err(io::Error::other))
}

/// Client for one connection; its timeout covers the whole response.
pub(crate) fn http_client(
    ctx: &ClientContext,
    profile: &ProtocolProfile,
) -> Result<reqwest::Client, ClientError> {
    reqwest::Client::builder()
        .timeout(ctx.duration + profile.setup_buffer)
        .build()
        .map_err(|e| ClientError::Connect {
            target: ctx.target.to_string(),
            reason: format!("failed to build HTTP client: {}", e),
        })
}

/// Map transport errors and non-200 statuses to [`ClientError`].
pub(crate) fn check_response(
    ctx: &ClientContext,
    result: reqwest::Result<reqwest::Response>,
) -> Result<reqwest::Response, ClientError> {
    let resp = result.map_err(|e| ClientError::Connect {
        target: ctx.target.to_string(),
        reason: e.to_string(),
    })?;
    if resp.status() != StatusCode::OK {
        return Err(ClientError::Status {
            target: ctx.target.to_string(),
            status: resp.status().as_u16(),
        });
    }
    Ok(resp)
}

/// Opens `text/event-stream` responses. Anything but `200 OK` is a failed connection.
pub struct SseConnector {
    profile: ProtocolProfile,
}

impl SseConnector {
    pub fn new(profile: ProtocolProfile) -> Self {
        Self { profile }
    }
}

#[async_trait::async_trait]
impl Connector for SseConnector {
    type Transport = SseTransport;

    fn protocol(&self) -> Protocol {
        Protocol::Sse
    }

    fn profile(&self) -> &ProtocolProfile {
        &self.profile
    }

    async fn connect(&self, ctx: &ClientContext) -> Result<SseTransport, ClientError> {
        let http = http_client(ctx, &self.profile)?;
        let result = http
            .get(&*ctx.target)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .header(CONNECTION, "keep-alive")
            .send()
            .await;
        let resp = check_response(ctx, result)?;
        debug!(client_id = ctx.client_id, "event stream opened");

        let reader = StreamReader::new(body_stream(resp));
        Ok(SseTransport {
            lines: FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LEN)),
            read_poll: self.profile.read_poll,
        })
    }
}

/// An open event stream, read one line at a time.
pub struct SseTransport {
    /// Response body split on `\n`, lines capped at 64 KiB.
    lines: FramedRead<StreamReader<BodyStream, Bytes>, LinesCodec>,
    read_poll: Duration,
}

#[async_trait::async_trait]
impl Transport for SseTransport {
    async fn next_event(&mut self) -> Result<ReadEvent, ClientError> {
        match tokio::time::timeout(self.read_poll, self.lines.next()).await {
            Err(_) => Ok(ReadEvent::Idle),
            Ok(None) => Ok(ReadEvent::End),
            Ok(Some(Ok(line))) => Ok(ReadEvent::unit(line.len() + 1)),
            Ok(Some(Err(e))) => Err(ClientError::Read(e.to_string())),
        }
    }

    async fn close(self) {
        drop(self.lines);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::session::StreamClient;
    use crate::engine::{Signal, VirtualClient};
    use axum::body::Body;
    use axum::http::StatusCode as AxumStatus;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use std::convert::Infallible;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn ctx(target: String, duration: Duration) -> ClientContext {
        ClientContext {
            client_id: 0,
            wave: 0,
            target: Arc::from(target),
            duration,
            cancel: CancellationToken::new(),
        }
    }

    fn fast_profile() -> ProtocolProfile {
        Protocol::Sse.profile().scaled_down(5)
    }

    async fn events() -> impl IntoResponse {
        let stream = futures::stream::unfold(0u64, |n| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let chunk = if n % 5 == 0 {
                String::from(": keep-alive\nretry: 1000\n\n")
            } else {
                format!("id: {n}\nevent: tick\ndata: {n}\n\n")
            };
            Some((Ok::<_, Infallible>(Bytes::from(chunk)), n + 1))
        });
        ([("content-type", "text/event-stream")], Body::from_stream(stream))
    }

    async fn short() -> impl IntoResponse {
        "data: only\n\n"
    }

    async fn empty() -> impl IntoResponse {
        ""
    }

    async fn unavailable() -> impl IntoResponse {
        AxumStatus::SERVICE_UNAVAILABLE
    }

    async fn serve() -> String {
        let app = Router::new()
            .route("/events", get(events))
            .route("/short", get(short))
            .route("/empty", get(empty))
            .route("/down", get(unavailable));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client() -> StreamClient<SseConnector> {
        StreamClient::new(SseConnector::new(fast_profile()))
    }

    #[tokio::test]
    async fn test_event_stream_passes() {
        let base = serve().await;
        let signal = client()
            .attempt(&ctx(format!("{base}/events"), Duration::from_millis(600)))
            .await;
        assert_eq!(signal, Signal::Pass);
    }

    #[tokio::test]
    async fn test_stream_ending_after_data_passes() {
        let base = serve().await;
        let signal = client()
            .attempt(&ctx(format!("{base}/short"), Duration::from_secs(2)))
            .await;
        assert_eq!(signal, Signal::Pass);
    }

    #[tokio::test]
    async fn test_empty_stream_fails() {
        let base = serve().await;
        let signal = client()
            .attempt(&ctx(format!("{base}/empty"), Duration::from_secs(2)))
            .await;
        assert_eq!(signal, Signal::Fail);
    }

    #[tokio::test]
    async fn test_non_200_status_fails() {
        let base = serve().await;
        let signal = client()
            .attempt(&ctx(format!("{base}/down"), Duration::from_secs(2)))
            .await;
        assert_eq!(signal, Signal::Fail);
    }

    #[tokio::test]
    async fn test_duration_of_one_second_is_rejected_with_default_profile() {
        let base = serve().await;
        let client = StreamClient::new(SseConnector::new(Protocol::Sse.profile()));
        let signal = client
            .attempt(&ctx(format!("{base}/events"), Duration::from_secs(1)))
            .await;
        assert_eq!(signal, Signal::Fail);
    }
}
