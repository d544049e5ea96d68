//! Protocol backends: one [`Connector`](crate::engine::session::Connector) per
//! supported streaming protocol, plus the timing profile each one runs under.

pub mod flv;
pub mod hls;
pub mod sse;
pub mod ws;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::engine::session::StreamClient;
use crate::engine::VirtualClient;

/// Streaming protocol spoken by every virtual client of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// WebSocket duplex framing.
    Ws,
    /// Server-Sent Events text stream.
    Sse,
    /// HLS segmented media.
    Hls,
    /// HTTP-FLV tagged binary media.
    Flv,
}

impl Protocol {
    pub const ALL: [Protocol; 4] = [Protocol::Ws, Protocol::Sse, Protocol::Hls, Protocol::Flv];

    /// Default timing constants for this protocol.
    pub fn profile(self) -> ProtocolProfile {
        match self {
            Protocol::Ws => ProtocolProfile {
                setup_buffer: Duration::from_secs(2),
                health_tick: Duration::from_secs(2),
                initial_grace: Duration::from_secs(10),
                streaming_grace: Duration::from_secs(10),
                min_duration: Duration::ZERO,
                read_poll: Duration::from_millis(100),
            },
            Protocol::Sse => ProtocolProfile {
                setup_buffer: Duration::from_secs(2),
                health_tick: Duration::from_millis(500),
                initial_grace: Duration::from_secs(5),
                streaming_grace: Duration::from_secs(5),
                min_duration: Duration::from_secs(1),
                read_poll: Duration::from_millis(500),
            },
            Protocol::Hls => ProtocolProfile {
                setup_buffer: Duration::from_secs(5),
                health_tick: Duration::from_secs(2),
                initial_grace: Duration::from_secs(8),
                streaming_grace: Duration::from_secs(10),
                min_duration: Duration::ZERO,
                read_poll: Duration::from_secs(2),
            },
            Protocol::Flv => ProtocolProfile {
                setup_buffer: Duration::from_secs(5),
                health_tick: Duration::from_secs(2),
                initial_grace: Duration::from_secs(8),
                streaming_grace: Duration::from_secs(10),
                min_duration: Duration::ZERO,
                read_poll: Duration::from_secs(5),
            },
        }
    }

    /// Build the virtual client for this protocol with its default profile.
    pub fn client(self, options: ClientOptions) -> Arc<dyn VirtualClient> {
        self.client_with_profile(self.profile(), options)
    }

    /// Build the virtual client for this protocol with an explicit profile.
    pub fn client_with_profile(
        self,
        profile: ProtocolProfile,
        options: ClientOptions,
    ) -> Arc<dyn VirtualClient> {
        match self {
            Protocol::Ws => Arc::new(StreamClient::new(ws::WsConnector::new(profile))),
            Protocol::Sse => Arc::new(StreamClient::new(sse::SseConnector::new(profile))),
            Protocol::Hls => Arc::new(StreamClient::new(hls::HlsConnector::new(profile))),
            Protocol::Flv => Arc::new(StreamClient::new(flv::FlvConnector::new(
                profile,
                options.spool_dir,
            ))),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Ws => write!(f, "ws"),
            Protocol::Sse => write!(f, "sse"),
            Protocol::Hls => write!(f, "hls"),
            Protocol::Flv => write!(f, "flv"),
        }
    }
}

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ws" => Ok(Protocol::Ws),
            "sse" => Ok(Protocol::Sse),
            "hls" => Ok(Protocol::Hls),
            "flv" => Ok(Protocol::Flv),
            _ => Err(UnknownProtocol(s.to_string())),
        }
    }
}

/// A protocol tag that names none of the supported protocols.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported protocol type: {0} (supported: ws, sse, hls, flv)")]
pub struct UnknownProtocol(pub String);

/// Timing constants that shape one protocol's connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolProfile {
    /// Extra time on top of the hard duration before the connection deadline fires.
    pub setup_buffer: Duration,
    /// Period of the staleness watchdog.
    pub health_tick: Duration,
    /// Staleness window before the first unit of data arrives.
    pub initial_grace: Duration,
    /// Staleness window once data has been flowing.
    pub streaming_grace: Duration,
    /// The hard duration must be strictly greater than this.
    pub min_duration: Duration,
    /// Upper bound on a single read attempt.
    pub read_poll: Duration,
}

impl ProtocolProfile {
    /// Shrink every window by `factor`; used to run the state machine quickly in tests.
    pub fn scaled_down(self, factor: u32) -> Self {
        Self {
            setup_buffer: self.setup_buffer / factor,
            health_tick: self.health_tick / factor,
            initial_grace: self.initial_grace / factor,
            streaming_grace: self.streaming_grace / factor,
            min_duration: self.min_duration / factor,
            read_poll: self.read_poll / factor,
        }
    }
}

/// Options shared by all protocol clients of one run.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Directory for FLV spool files; the OS temp dir when unset.
    pub spool_dir: Option<std::path::PathBuf>,
}

/// Per-connection failure. Never crosses the client boundary: every variant
/// collapses into a Fail classification.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {target}: {reason}")]
    Connect { target: String, reason: String },

    #[error("unexpected HTTP status {status} from {target}")]
    Status { target: String, status: u16 },

    #[error("read error: {0}")]
    Read(String),

    #[error("media client error: {0}")]
    Media(#[from] crate::hls::HlsError),

    #[error("spool error: {0}")]
    Spool(#[from] std::io::Error),
}
