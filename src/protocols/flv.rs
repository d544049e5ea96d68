//! HTTP-FLV backend: the body is read in fixed-size chunks and each chunk is
//! handed to a [`TagWriter`] spooling to a per-connection temp file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufWriter};
use tokio::time::Instant;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::sse::{body_stream, check_response, http_client, BodyStream};
use super::{ClientError, Protocol, ProtocolProfile};
use crate::engine::session::{Connector, ReadEvent, Transport};
use crate::engine::ClientContext;
use crate::flv::{MediaUnit, TagKind, TagWriter};

/// Size of one body read.
pub const CHUNK_SIZE: usize = 8192;

const FINISH_TIMEOUT: Duration = Duration::from_secs(2);

/// Opens HTTP-FLV streams and spools what they send to a per-connection file.
pub struct FlvConnector {
    profile: ProtocolProfile,
    /// Directory that holds the spool files.
    spool_dir: PathBuf,
}

impl FlvConnector {
    pub fn new(profile: ProtocolProfile, spool_dir: Option<PathBuf>) -> Self {
        Self {
            profile,
            spool_dir: spool_dir.unwrap_or_else(std::env::temp_dir),
        }
    }
}

#[async_trait::async_trait]
impl Connector for FlvConnector {
    type Transport = FlvTransport;

    fn protocol(&self) -> Protocol {
        Protocol::Flv
    }

    fn profile(&self) -> &ProtocolProfile {
        &self.profile
    }

    async fn connect(&self, ctx: &ClientContext) -> Result<FlvTransport, ClientError> {
        let http = http_client(ctx, &self.profile)?;
        let resp = check_response(ctx, http.get(&*ctx.target).send().await)?;

        let spool = SpoolFile::new(&self.spool_dir, ctx.client_id);
        let file = File::create(spool.path()).await.map_err(|e| {
            info!(path = %spool.path().display(), error = %e, "failed to create spool file");
            ClientError::Spool(e)
        })?;
        debug!(client_id = ctx.client_id, path = %spool.path().display(), "spooling stream");

        Ok(FlvTransport {
            body: StreamReader::new(body_stream(resp)),
            buf: vec![0u8; CHUNK_SIZE].into_boxed_slice(),
            in_flight: None,
            writer: TagWriter::spawn(BufWriter::new(file)),
            spool,
            started: Instant::now(),
            read_poll: self.profile.read_poll,
            dropped: 0,
        })
    }
}

/// An open FLV response. Each body chunk becomes one video tag.
pub struct FlvTransport {
    body: StreamReader<BodyStream, Bytes>,
    /// Read buffer of [`CHUNK_SIZE`] bytes.
    buf: Box<[u8]>,
    /// Unit read from the body but not yet accepted by the writer.
    in_flight: Option<MediaUnit>,
    writer: TagWriter<BufWriter<File>>,
    spool: SpoolFile,
    /// Tag timestamps are relative to this.
    started: Instant,
    read_poll: Duration,
    /// Units the writer refused.
    dropped: u64,
}

#[async_trait::async_trait]
impl Transport for FlvTransport {
    async fn next_event(&mut self) -> Result<ReadEvent, ClientError> {
        if self.in_flight.is_none() {
            let read = tokio::time::timeout(self.read_poll, self.body.read(&mut self.buf)).await;
            let n = match read {
                Err(_) => return Ok(ReadEvent::Idle),
                Ok(Ok(0)) => return Ok(ReadEvent::End),
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(ClientError::Read(e.to_string())),
            };
            self.in_flight = Some(MediaUnit {
                kind: TagKind::Video,
                timestamp_ms: self.started.elapsed().as_millis() as u32,
                data: Bytes::copy_from_slice(&self.buf[..n]),
            });
        }

        let Some(unit) = self.in_flight.clone() else {
            return Ok(ReadEvent::Idle);
        };
        let len = unit.data.len();
        if let Err(e) = self.writer.enqueue(unit).await {
            self.dropped += 1;
            debug!(error = %e, dropped = self.dropped, "failed to queue FLV unit");
        }
        self.in_flight = None;

        Ok(ReadEvent::unit(len))
    }

    async fn close(self) {
        let FlvTransport {
            writer,
            spool,
            dropped,
            ..
        } = self;

        match tokio::time::timeout(FINISH_TIMEOUT, writer.finish()).await {
            Ok(Ok((_, stats))) => debug!(
                tags = stats.tags,
                bytes = stats.bytes,
                dropped,
                "FLV spool flushed"
            ),
            Ok(Err(e)) => warn!(error = %e, "FLV spool writer failed"),
            Err(_) => warn!("FLV spool writer did not finish in time, aborted"),
        }
        drop(spool);
    }
}

/// Temp file path removed when dropped, whatever path the connection exits by.
struct SpoolFile {
    path: PathBuf,
}

impl SpoolFile {
    fn new(dir: &Path, client_id: u64) -> Self {
        Self {
            path: dir.join(format!("kadrion_{}_{}.flv", client_id, Uuid::new_v4().simple())),
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SpoolFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove spool file"),
        }
    }
}
