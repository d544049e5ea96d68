//! Generic per-connection state machine.
//!
//! `Connecting -> Streaming -> Terminated(Pass|Fail)`. Once connected, four
//! sources race and the first to fire decides:
//!
//! 1. the hard duration timer,
//! 2. the connection deadline (duration plus setup buffer) or run cancellation,
//! 3. the health tick, when the [`HealthMonitor`] reports the stream stale,
//! 4. the protocol's own read events: data, clean end of stream, or error.
//!
//! Protocols plug in through [`Connector`] and [`Transport`]; everything else
//! is shared.

use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::health::HealthMonitor;
use super::{ClientContext, Signal, VirtualClient};
use crate::protocols::{ClientError, Protocol, ProtocolProfile};

// ---------------------------------------------------------------------------
// Protocol seam
// ---------------------------------------------------------------------------

/// Outcome of one read attempt on an open connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEvent {
    /// Application data arrived.
    Data { units: u64, bytes: u64 },
    /// Nothing arrived within the protocol's read poll; not a failure.
    Idle,
    /// The server ended the stream cleanly.
    End,
}

impl ReadEvent {
    pub fn unit(bytes: usize) -> Self {
        ReadEvent::Data {
            units: 1,
            bytes: bytes as u64,
        }
    }
}

/// An open connection, read one application-level event at a time.
#[async_trait::async_trait]
pub trait Transport: Send {
    /// Wait for the next read event.
    ///
    /// Must be cancel safe: the driver drops this future whenever a timer
    /// wins the race, and no data may be lost when it does.
    async fn next_event(&mut self) -> Result<ReadEvent, ClientError>;

    /// Release the connection and anything attached to it.
    async fn close(self);
}

/// Opens connections for one protocol.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    fn protocol(&self) -> Protocol;

    fn profile(&self) -> &ProtocolProfile;

    /// Open one connection. The driver bounds this by the connection deadline.
    async fn connect(&self, ctx: &ClientContext) -> Result<Self::Transport, ClientError>;
}

/// Adapts a [`Connector`] to the engine's [`VirtualClient`] capability.
pub struct StreamClient<C> {
    connector: C,
}

impl<C: Connector> StreamClient<C> {
    pub fn new(connector: C) -> Self {
        Self { connector }
    }
}

#[async_trait::async_trait]
impl<C: Connector> VirtualClient for StreamClient<C> {
    fn name(&self) -> &'static str {
        match self.connector.protocol() {
            Protocol::Ws => "ws",
            Protocol::Sse => "sse",
            Protocol::Hls => "hls",
            Protocol::Flv => "flv",
        }
    }

    async fn attempt(&self, ctx: &ClientContext) -> Signal {
        drive(&self.connector, ctx).await
    }
}

// ---------------------------------------------------------------------------
// Termination
// ---------------------------------------------------------------------------

/// Why a connection stopped.
#[derive(Debug)]
pub enum Termination {
    HardTimeout,
    Deadline,
    Cancelled,
    Stale { idle: Duration },
    EndOfStream,
    Error(ClientError),
}

impl Termination {
    /// Staleness and errors always fail; every other ending passes iff data
    /// was received.
    pub fn classify(&self, received: bool) -> Signal {
        match self {
            Termination::Stale { .. } | Termination::Error(_) => Signal::Fail,
            Termination::HardTimeout
            | Termination::Deadline
            | Termination::Cancelled
            | Termination::EndOfStream => Signal::from_data(received),
        }
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::HardTimeout => write!(f, "duration elapsed"),
            Termination::Deadline => write!(f, "connection deadline reached"),
            Termination::Cancelled => write!(f, "run cancelled"),
            Termination::Stale { idle } => write!(f, "no data for {:.1}s", idle.as_secs_f64()),
            Termination::EndOfStream => write!(f, "stream ended"),
            Termination::Error(e) => write!(f, "{}", e),
        }
    }
}

/// Per-connection counters, never shared outside the connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub units: u64,
    pub bytes: u64,
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Run one connection attempt through the full state machine.
pub async fn drive<C: Connector>(connector: &C, ctx: &ClientContext) -> Signal {
    let protocol = connector.protocol();
    let profile = *connector.profile();

    if ctx.duration <= profile.min_duration {
        info!(
            client_id = ctx.client_id,
            %protocol,
            duration_ms = ctx.duration.as_millis() as u64,
            min_ms = profile.min_duration.as_millis() as u64,
            "duration too short for protocol; not connecting"
        );
        return Signal::Fail;
    }

    let deadline = tokio::time::sleep(ctx.duration + profile.setup_buffer);
    tokio::pin!(deadline);

    let connected = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(Termination::Cancelled),
        _ = &mut deadline => Err(Termination::Deadline),
        res = connector.connect(ctx) => res.map_err(Termination::Error),
    };

    let mut transport = match connected {
        Ok(t) => t,
        Err(reason) => {
            info!(
                client_id = ctx.client_id,
                wave = ctx.wave,
                %protocol,
                reason = %reason,
                "connection failed"
            );
            return Signal::Fail;
        }
    };
    debug!(client_id = ctx.client_id, %protocol, "connected");

    let (termination, stats) = stream(&mut transport, &profile, ctx, deadline.as_mut()).await;
    transport.close().await;

    let signal = termination.classify(stats.units > 0);
    let outcome = if signal.is_pass() { "pass" } else { "fail" };
    match termination {
        Termination::Error(_) | Termination::Stale { .. } => info!(
            client_id = ctx.client_id,
            wave = ctx.wave,
            %protocol,
            units = stats.units,
            bytes = stats.bytes,
            reason = %termination,
            outcome,
            "client finished"
        ),
        _ => debug!(
            client_id = ctx.client_id,
            wave = ctx.wave,
            %protocol,
            units = stats.units,
            bytes = stats.bytes,
            reason = %termination,
            outcome,
            "client finished"
        ),
    }
    signal
}

async fn stream<T: Transport>(
    transport: &mut T,
    profile: &ProtocolProfile,
    ctx: &ClientContext,
    mut deadline: std::pin::Pin<&mut tokio::time::Sleep>,
) -> (Termination, StreamStats) {
    let start = Instant::now();
    let mut stats = StreamStats::default();
    let mut health = HealthMonitor::new(profile, start);

    let hard = tokio::time::sleep(ctx.duration);
    tokio::pin!(hard);

    let mut ticker = tokio::time::interval_at(start + profile.health_tick, profile.health_tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let termination = loop {
        tokio::select! {
            biased;
            _ = &mut hard => break Termination::HardTimeout,
            _ = &mut deadline => break Termination::Deadline,
            _ = ctx.cancel.cancelled() => break Termination::Cancelled,
            _ = ticker.tick() => {
                let now = Instant::now();
                if health.is_stale(now) {
                    break Termination::Stale { idle: health.idle_for(now) };
                }
            }
            event = transport.next_event() => match event {
                Ok(ReadEvent::Data { units, bytes }) => {
                    stats.units += units;
                    stats.bytes += bytes;
                    health.record_activity(Instant::now());
                }
                Ok(ReadEvent::Idle) => {}
                Ok(ReadEvent::End) => break Termination::EndOfStream,
                Err(e) => break Termination::Error(e),
            },
        }
    };

    (termination, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[derive(Clone)]
    enum Step {
        Data(usize),
        Idle,
        End,
        Error,
    }

    struct ScriptedTransport {
        steps: VecDeque<(Duration, Step)>,
        due: Option<Instant>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl Transport for ScriptedTransport {
        async fn next_event(&mut self) -> Result<ReadEvent, ClientError> {
            let Some((delay, _)) = self.steps.front() else {
                std::future::pending::<()>().await;
                unreachable!()
            };
            let at = *self.due.get_or_insert(Instant::now() + *delay);
            tokio::time::sleep_until(at).await;
            self.due = None;
            let (_, step) = self.steps.pop_front().unwrap();
            match step {
                Step::Data(n) => Ok(ReadEvent::unit(n)),
                Step::Idle => Ok(ReadEvent::Idle),
                Step::End => Ok(ReadEvent::End),
                Step::Error => Err(ClientError::Read("connection reset".into())),
            }
        }

        async fn close(self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct ScriptedConnector {
        profile: ProtocolProfile,
        script: Vec<(Duration, Step)>,
        connect_delay: Duration,
        refuse: bool,
        connects: AtomicU64,
        closed: Arc<AtomicBool>,
    }

    impl ScriptedConnector {
        fn new(script: Vec<(Duration, Step)>) -> Self {
            Self {
                profile: test_profile(),
                script,
                connect_delay: Duration::ZERO,
                refuse: false,
                connects: AtomicU64::new(0),
                closed: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait::async_trait]
    impl Connector for ScriptedConnector {
        type Transport = ScriptedTransport;

        fn protocol(&self) -> Protocol {
            Protocol::Ws
        }

        fn profile(&self) -> &ProtocolProfile {
            &self.profile
        }

        async fn connect(&self, ctx: &ClientContext) -> Result<ScriptedTransport, ClientError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.connect_delay).await;
            if self.refuse {
                return Err(ClientError::Connect {
                    target: ctx.target.to_string(),
                    reason: "connection refused".into(),
                });
            }
            Ok(ScriptedTransport {
                steps: self.script.iter().cloned().collect(),
                due: None,
                closed: self.closed.clone(),
            })
        }
    }

    fn test_profile() -> ProtocolProfile {
        ProtocolProfile {
            setup_buffer: Duration::from_millis(500),
            health_tick: Duration::from_millis(100),
            initial_grace: Duration::from_secs(1),
            streaming_grace: Duration::from_secs(1),
            min_duration: Duration::ZERO,
            read_poll: Duration::from_millis(100),
        }
    }

    fn ctx(duration: Duration) -> ClientContext {
        ClientContext {
            client_id: 7,
            wave: 0,
            target: Arc::from("test://stream"),
            duration,
            cancel: CancellationToken::new(),
        }
    }

    fn steady(every: Duration, count: usize) -> Vec<(Duration, Step)> {
        (0..count).map(|_| (every, Step::Data(64))).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_stream_passes_on_hard_timeout() {
        let connector = ScriptedConnector::new(steady(Duration::from_millis(100), 1_000));
        let signal = drive(&connector, &ctx(Duration::from_secs(3))).await;
        assert_eq!(signal, Signal::Pass);
        assert!(connector.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_stream_goes_stale_before_duration() {
        let connector = ScriptedConnector::new(Vec::new());
        let started = Instant::now();
        let signal = drive(&connector, &ctx(Duration::from_secs(30))).await;
        assert_eq!(signal, Signal::Fail);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(connector.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_stalling_after_data_goes_stale() {
        let connector = ScriptedConnector::new(steady(Duration::from_millis(100), 5));
        let started = Instant::now();
        let signal = drive(&connector, &ctx(Duration::from_secs(30))).await;
        assert_eq!(signal, Signal::Fail);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_polls_do_not_count_as_data() {
        let script = (0..100)
            .map(|_| (Duration::from_millis(50), Step::Idle))
            .collect();
        let connector = ScriptedConnector::new(script);
        let signal = drive(&connector, &ctx(Duration::from_millis(500))).await;
        assert_eq!(signal, Signal::Fail);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_data_before_short_duration_fails() {
        let connector = ScriptedConnector::new(Vec::new());
        let signal = drive(&connector, &ctx(Duration::from_millis(500))).await;
        assert_eq!(signal, Signal::Fail);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_of_stream_after_data_passes() {
        let connector = ScriptedConnector::new(vec![
            (Duration::from_millis(10), Step::Data(10)),
            (Duration::from_millis(10), Step::End),
        ]);
        let signal = drive(&connector, &ctx(Duration::from_secs(5))).await;
        assert_eq!(signal, Signal::Pass);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_of_stream_without_data_fails() {
        let connector = ScriptedConnector::new(vec![(Duration::from_millis(10), Step::End)]);
        let signal = drive(&connector, &ctx(Duration::from_secs(5))).await;
        assert_eq!(signal, Signal::Fail);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_fails_even_after_data() {
        let connector = ScriptedConnector::new(vec![
            (Duration::from_millis(10), Step::Data(10)),
            (Duration::from_millis(10), Step::Error),
        ]);
        let signal = drive(&connector, &ctx(Duration::from_secs(5))).await;
        assert_eq!(signal, Signal::Fail);
        assert!(connector.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_connection_fails() {
        let mut connector = ScriptedConnector::new(steady(Duration::from_millis(10), 10));
        connector.refuse = true;
        let signal = drive(&connector, &ctx(Duration::from_secs(1))).await;
        assert_eq!(signal, Signal::Fail);
        assert!(!connector.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_duration_never_connects() {
        let connector = ScriptedConnector::new(steady(Duration::from_millis(10), 10));
        let signal = drive(&connector, &ctx(Duration::ZERO)).await;
        assert_eq!(signal, Signal::Fail);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_at_protocol_minimum_never_connects() {
        let mut connector = ScriptedConnector::new(steady(Duration::from_millis(10), 10));
        connector.profile.min_duration = Duration::from_secs(1);
        let signal = drive(&connector, &ctx(Duration::from_secs(1))).await;
        assert_eq!(signal, Signal::Fail);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_connect_hits_deadline() {
        let mut connector = ScriptedConnector::new(steady(Duration::from_millis(10), 10));
        connector.connect_delay = Duration::from_secs(60);
        let started = Instant::now();
        let signal = drive(&connector, &ctx(Duration::from_secs(1))).await;
        assert_eq!(signal, Signal::Fail);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_classifies_by_data() {
        let connector = ScriptedConnector::new(steady(Duration::from_millis(100), 1_000));
        let ctx = ctx(Duration::from_secs(60));
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(550)).await;
            cancel.cancel();
        });
        assert_eq!(drive(&connector, &ctx).await, Signal::Pass);

        let silent = ScriptedConnector::new(Vec::new());
        let ctx = self::ctx(Duration::from_secs(60));
        ctx.cancel.cancel();
        assert_eq!(drive(&silent, &ctx).await, Signal::Fail);
    }

    #[test]
    fn test_classification_table() {
        assert_eq!(Termination::HardTimeout.classify(true), Signal::Pass);
        assert_eq!(Termination::HardTimeout.classify(false), Signal::Fail);
        assert_eq!(Termination::Deadline.classify(true), Signal::Pass);
        assert_eq!(Termination::EndOfStream.classify(false), Signal::Fail);
        assert_eq!(
            Termination::Stale {
                idle: Duration::from_secs(9)
            }
            .classify(true),
            Signal::Fail
        );
        assert_eq!(
            Termination::Error(ClientError::Read("boom".into())).classify(true),
            Signal::Fail
        );
    }
}
