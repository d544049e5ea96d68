//! FLV tag writer: a bounded queue between a connection's read loop and a
//! dedicated task that serialises media units to a sink.
//!
//! The read loop only ever waits [`ENQUEUE_TIMEOUT`] on the queue, so a slow
//! sink shows up as [`FlvError::QueueTimeout`] instead of a stalled socket.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// `FLV` signature, version 1, audio+video flags, 9-byte header length.
pub const FLV_HEADER: [u8; 9] = [0x46, 0x4c, 0x56, 0x01, 0x05, 0x00, 0x00, 0x00, 0x09];

/// Tag header: type, 24-bit size, 24+8-bit timestamp, 24-bit stream id.
pub const TAG_HEADER_LEN: usize = 11;

/// Largest payload a 24-bit size field can describe.
pub const MAX_TAG_DATA: usize = 0x00FF_FFFF;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

pub const ENQUEUE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum FlvError {
    #[error("tag writer is closed")]
    Closed,

    #[error("packet queue timeout")]
    QueueTimeout,

    #[error("tag payload of {0} bytes exceeds the 24-bit size field")]
    TooLarge(usize),

    #[error("sink write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("writer task failed: {0}")]
    Consumer(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TagKind {
    Audio = 8,
    Video = 9,
    Script = 18,
}

/// One timestamped unit of received media.
#[derive(Debug, Clone)]
pub struct MediaUnit {
    pub kind: TagKind,
    /// Milliseconds since the start of the stream. Wraps after ~49 days.
    pub timestamp_ms: u32,
    pub data: Bytes,
}

/// Append the file header and the zero previous-tag-size that precedes the first tag.
pub fn encode_header(buf: &mut BytesMut) {
    buf.put_slice(&FLV_HEADER);
    buf.put_u32(0);
}

/// Append one tag and its trailing previous-tag-size.
pub fn encode_tag(unit: &MediaUnit, buf: &mut BytesMut) -> Result<(), FlvError> {
    let len = unit.data.len();
    if len > MAX_TAG_DATA {
        return Err(FlvError::TooLarge(len));
    }

    let ts = unit.timestamp_ms;
    buf.reserve(TAG_HEADER_LEN + len + 4);
    buf.put_u8(unit.kind as u8);
    buf.put_uint(len as u64, 3);
    buf.put_uint(u64::from(ts & 0x00FF_FFFF), 3);
    buf.put_u8((ts >> 24) as u8);
    buf.put_uint(0, 3);
    buf.put_slice(&unit.data);
    buf.put_u32((TAG_HEADER_LEN + len) as u32);
    Ok(())
}

/// What the consumer task wrote before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub tags: u64,
    pub bytes: u64,
}

/// Bounded producer/consumer writer for one connection.
pub struct TagWriter<W> {
    tx: Option<mpsc::Sender<MediaUnit>>,
    consumer: JoinHandle<Result<(W, WriterStats), FlvError>>,
    enqueue_timeout: Duration,
}

impl<W> TagWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Start a writer with the default queue capacity and enqueue timeout.
    pub fn spawn(sink: W) -> Self {
        Self::with_limits(sink, DEFAULT_QUEUE_CAPACITY, ENQUEUE_TIMEOUT)
    }

    pub fn with_limits(sink: W, capacity: usize, enqueue_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let consumer = tokio::spawn(drain(sink, rx));
        Self {
            tx: Some(tx),
            consumer,
            enqueue_timeout,
        }
    }

    /// Queue a unit for writing, waiting at most the enqueue timeout for room.
    pub async fn enqueue(&self, unit: MediaUnit) -> Result<(), FlvError> {
        if unit.data.len() > MAX_TAG_DATA {
            return Err(FlvError::TooLarge(unit.data.len()));
        }
        let tx = self.tx.as_ref().ok_or(FlvError::Closed)?;
        match tx.send_timeout(unit, self.enqueue_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(FlvError::QueueTimeout),
            Err(SendTimeoutError::Closed(_)) => Err(FlvError::Closed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }

    /// Stop accepting units. The consumer writes whatever is already queued
    /// and exits. Safe to call any number of times.
    pub fn close(&mut self) {
        if self.tx.take().is_some() {
            debug!("tag writer closed");
        }
    }

    /// Close, wait for the consumer to flush, and hand back the sink.
    ///
    /// Dropping the returned future before it resolves (for instance under a
    /// timeout) drops the writer, which aborts the consumer and releases the
    /// sink.
    pub async fn finish(mut self) -> Result<(W, WriterStats), FlvError> {
        self.close();
        match (&mut self.consumer).await {
            Ok(result) => result,
            Err(e) => Err(FlvError::Consumer(e.to_string())),
        }
    }
}

impl<W> Drop for TagWriter<W> {
    fn drop(&mut self) {
        if !self.consumer.is_finished() {
            debug!("aborting FLV tag writer");
            self.consumer.abort();
        }
    }
}

async fn drain<W>(
    mut sink: W,
    mut rx: mpsc::Receiver<MediaUnit>,
) -> Result<(W, WriterStats), FlvError>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut stats = WriterStats::default();
    let mut buf = BytesMut::with_capacity(16 * 1024);

    encode_header(&mut buf);
    if let Err(e) = sink.write_all(&buf).await {
        warn!(error = %e, "failed to write FLV header");
        return Err(e.into());
    }

    while let Some(unit) = rx.recv().await {
        buf.clear();
        encode_tag(&unit, &mut buf)?;
        if let Err(e) = sink.write_all(&buf).await {
            warn!(error = %e, tags = stats.tags, "failed to write FLV tag");
            return Err(e.into());
        }
        stats.tags += 1;
        stats.bytes += unit.data.len() as u64;
    }

    sink.flush().await?;
    Ok((sink, stats))
}
