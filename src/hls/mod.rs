//! Minimal HLS client.
//!
//! Follows one stream: the first variant of a master playlist, or the media
//! playlist given directly. Tracks are announced once through `on_tracks`;
//! every new segment is downloaded and handed to the callback registered for
//! each track's codec family. Media playlists are reloaded every target
//! duration until `#EXT-X-ENDLIST`.

pub mod playlist;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use playlist::{MediaPlaylist, Playlist};

/// Floor on the playlist reload period.
const MIN_RELOAD_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum HlsError {
    #[error("invalid playlist URI {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected HTTP status {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("invalid playlist: {0}")]
    Playlist(String),

    #[error("master playlist has no variants")]
    NoVariants,

    #[error("client stopped")]
    Stopped,
}

/// Codec families a data callback can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecFamily {
    H26x,
    Mpeg4Audio,
    Opus,
    Vp9,
    Av1,
    /// Unknown codec, or none advertised.
    Other,
}

impl CodecFamily {
    pub const ALL: [CodecFamily; 6] = [
        CodecFamily::H26x,
        CodecFamily::Mpeg4Audio,
        CodecFamily::Opus,
        CodecFamily::Vp9,
        CodecFamily::Av1,
        CodecFamily::Other,
    ];

    /// Classify an RFC 6381 codec string such as `avc1.64001f`.
    pub fn from_codec(codec: &str) -> Self {
        let fourcc = codec.split('.').next().unwrap_or_default().to_ascii_lowercase();
        match fourcc.as_str() {
            "avc1" | "avc3" | "hvc1" | "hev1" => CodecFamily::H26x,
            "mp4a" => CodecFamily::Mpeg4Audio,
            "opus" => CodecFamily::Opus,
            "vp09" => CodecFamily::Vp9,
            "av01" => CodecFamily::Av1,
            _ => CodecFamily::Other,
        }
    }
}

/// A track advertised by the playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub codec: Option<String>,
    pub family: CodecFamily,
}

/// One downloaded segment.
#[derive(Debug, Clone)]
pub struct SegmentData {
    pub sequence: u64,
    pub bytes: Bytes,
}

type TracksCallback = Box<dyn Fn(&[Track]) + Send + Sync>;
type DataCallback = Arc<dyn Fn(&SegmentData) + Send + Sync>;

/// HLS client builder. Register callbacks, then [`start`](Client::start) it.
pub struct Client {
    /// Master or media playlist URL.
    uri: String,
    http: reqwest::Client,
    on_tracks: Option<TracksCallback>,
    /// At most one callback per family.
    on_data: HashMap<CodecFamily, DataCallback>,
}

impl Client {
    pub fn new(uri: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            uri: uri.into(),
            http,
            on_tracks: None,
            on_data: HashMap::new(),
        }
    }

    /// Called once with the tracks of the followed stream.
    pub fn on_tracks(mut self, f: impl Fn(&[Track]) + Send + Sync + 'static) -> Self {
        self.on_tracks = Some(Box::new(f));
        self
    }

    /// Called with every segment of a track in `family`. Replaces any
    /// earlier callback for the same family.
    pub fn on_data(
        mut self,
        family: CodecFamily,
        f: impl Fn(&SegmentData) + Send + Sync + 'static,
    ) -> Self {
        self.on_data.insert(family, Arc::new(f));
        self
    }

    /// Validate the URI and start following the stream in the background.
    pub fn start(self) -> Result<RunningClient, HlsError> {
        let url = Url::parse(&self.uri).map_err(|e| HlsError::InvalidUri {
            uri: self.uri.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(HlsError::InvalidUri {
                uri: self.uri.clone(),
                reason: format!("unsupported scheme {}", url.scheme()),
            });
        }

        let (done_tx, done_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let result = self.follow(url).await;
            let _ = done_tx.send(result);
        });

        Ok(RunningClient {
            done: Some(done_rx),
            task,
        })
    }

    async fn follow(self, url: Url) -> Result<(), HlsError> {
        let text = fetch_text(&self.http, &url).await?;

        let (media_url, mut tracks, initial) = match playlist::parse(&text)? {
            Playlist::Master(variants) => {
                let variant = variants.into_iter().next().ok_or(HlsError::NoVariants)?;
                let media_url = join(&url, &variant.uri)?;
                let tracks: Vec<Track> = variant
                    .codecs
                    .iter()
                    .map(|c| Track {
                        codec: Some(c.clone()),
                        family: CodecFamily::from_codec(c),
                    })
                    .collect();
                (media_url, tracks, None)
            }
            Playlist::Media(media) => (url, Vec::new(), Some(media)),
        };
        if tracks.is_empty() {
            tracks.push(Track {
                codec: None,
                family: CodecFamily::Other,
            });
        }

        if let Some(on_tracks) = &self.on_tracks {
            on_tracks(&tracks);
        }

        let mut media = match initial {
            Some(media) => media,
            None => fetch_media(&self.http, &media_url).await?,
        };
        let mut next_sequence: Option<u64> = None;

        loop {
            for segment in &media.segments {
                if next_sequence.is_some_and(|next| segment.sequence < next) {
                    continue;
                }
                let segment_url = join(&media_url, &segment.uri)?;
                let bytes = fetch_bytes(&self.http, &segment_url).await?;
                let data = SegmentData {
                    sequence: segment.sequence,
                    bytes,
                };
                for track in &tracks {
                    if let Some(callback) = self.on_data.get(&track.family) {
                        callback(&data);
                    }
                }
                // The last representable sequence ends the stream.
                let Some(next) = segment.sequence.checked_add(1) else {
                    return Ok(());
                };
                next_sequence = Some(next);
            }

            if media.ended {
                debug!(url = %media_url, "playlist ended");
                return Ok(());
            }

            tokio::time::sleep(media.target_duration.max(MIN_RELOAD_INTERVAL)).await;
            media = fetch_media(&self.http, &media_url).await?;
        }
    }
}

/// Handle to a started client. Dropping it stops the client.
pub struct RunningClient {
    done: Option<oneshot::Receiver<Result<(), HlsError>>>,
    task: JoinHandle<()>,
}

impl RunningClient {
    /// Wait for the client to stop: `Ok` after the playlist ended, `Err` on
    /// the first failure. Cancel safe.
    pub async fn wait(&mut self) -> Result<(), HlsError> {
        let Some(done) = self.done.as_mut() else {
            return Err(HlsError::Stopped);
        };
        let result = done.await;
        self.done = None;
        result.unwrap_or(Err(HlsError::Stopped))
    }

    pub fn close(self) {
        self.task.abort();
    }
}

impl Drop for RunningClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn join(base: &Url, reference: &str) -> Result<Url, HlsError> {
    base.join(reference).map_err(|e| HlsError::InvalidUri {
        uri: reference.to_string(),
        reason: e.to_string(),
    })
}

async fn fetch(http: &reqwest::Client, url: &Url) -> Result<reqwest::Response, HlsError> {
    let resp = http.get(url.clone()).send().await?;
    if resp.status() != StatusCode::OK {
        return Err(HlsError::Status {
            url: url.to_string(),
            status: resp.status().as_u16(),
        });
    }
    Ok(resp)
}

async fn fetch_text(http: &reqwest::Client, url: &Url) -> Result<String, HlsError> {
    Ok(fetch(http, url).await?.text().await?)
}

async fn fetch_bytes(http: &reqwest::Client, url: &Url) -> Result<Bytes, HlsError> {
    Ok(fetch(http, url).await?.bytes().await?)
}

async fn fetch_media(http: &reqwest::Client, url: &Url) -> Result<MediaPlaylist, HlsError> {
    match playlist::parse(&fetch_text(http, url).await?)? {
        Playlist::Media(media) => Ok(media),
        Playlist::Master(_) => Err(HlsError::Playlist(format!(
            "expected a media playlist at {url}"
        ))),
    }
}
