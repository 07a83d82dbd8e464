//! Persistent collector forwarder
//!
//! Keeps one outbound TCP connection to the downstream collector alive for
//! the life of the node. A single supervising loop owns the whole state
//! machine; nothing is respawned on failure.
//!
//! ```text
//! Connecting ──▶ Handshake ──▶ Streaming
//!      ▲             │             │
//!      │             ▼             ▼
//!      └── delay ◀── Disconnected ◀┘
//! ```

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::Serialize;
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::audio::buffer::DoubleBuffer;
use crate::audio::convert::SampleConverter;
use crate::audio::source::{FrameSource, SourceProvider};
use crate::cancel::CancelToken;
use crate::config::AudioConfig;
use crate::error::{AudioError, NetworkError};
use crate::network::protocol::StreamHeader;
use crate::network::sink::{ChunkSink, WriterSink};

/// Delay before reconnecting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    Fixed(Duration),
    /// Doubles per consecutive failure, saturating at `max`
    Exponential { initial: Duration, max: Duration },
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        RetryPolicy::Fixed(delay)
    }

    pub fn exponential(initial: Duration, max: Duration) -> Self {
        RetryPolicy::Exponential {
            initial,
            max: max.max(initial),
        }
    }

    /// Delay after the `failures`-th consecutive failure (1-based)
    pub fn delay(&self, failures: u32) -> Duration {
        match *self {
            RetryPolicy::Fixed(delay) => delay,
            RetryPolicy::Exponential { initial, max } => {
                let exponent = failures.saturating_sub(1).min(31);
                initial
                    .checked_mul(1u32 << exponent)
                    .map_or(max, |d| d.min(max))
            }
        }
    }
}

/// Forwarder lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwarderState {
    Connecting,
    Handshake,
    Streaming,
    Disconnected,
}

/// Opens connections to the collector
pub trait Connector: Send {
    type Stream: Write + Send;

    fn connect(&mut self) -> Result<Self::Stream, NetworkError>;
}

/// TCP connector with bounded connect and write times.
///
/// A collector that stops reading turns into a send failure after the
/// write timeout, so the forwarder reconnects instead of blocking.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: SocketAddr,
    timeout: Duration,
    write_timeout: Duration,
}

impl TcpConnector {
    /// Connect timeout `timeout`, which also bounds each write until
    /// [`with_write_timeout`](Self::with_write_timeout) overrides it
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            addr,
            timeout,
            write_timeout: timeout,
        }
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&mut self) -> Result<TcpStream, NetworkError> {
        let socket = Socket::new(Domain::for_address(self.addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;

        socket
            .connect_timeout(&self.addr.into(), self.timeout)
            .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", self.addr, e)))?;

        let stream: TcpStream = socket.into();
        stream
            .set_write_timeout(Some(self.write_timeout))
            .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", self.addr, e)))?;
        let sock = SockRef::from(&stream);
        if let Err(e) = sock.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(10));
        if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
            warn!("Failed to enable keepalive: {}", e);
        }

        Ok(stream)
    }
}

/// Counters and current state, shared with the status endpoint
#[derive(Debug)]
pub struct ForwarderStats {
    state: Mutex<ForwarderState>,
    pub connect_attempts: AtomicU64,
    pub connect_failures: AtomicU64,
    pub disconnects: AtomicU64,
    pub chunks_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub dropped_ticks: AtomicU64,
}

impl Default for ForwarderStats {
    fn default() -> Self {
        Self {
            state: Mutex::new(ForwarderState::Disconnected),
            connect_attempts: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            chunks_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            dropped_ticks: AtomicU64::new(0),
        }
    }
}

impl ForwarderStats {
    pub fn state(&self) -> ForwarderState {
        *self.state.lock()
    }

    pub fn snapshot(&self) -> ForwarderStatsSnapshot {
        ForwarderStatsSnapshot {
            state: self.state(),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            dropped_ticks: self.dropped_ticks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ForwarderStatsSnapshot {
    pub state: ForwarderState,
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub disconnects: u64,
    pub chunks_sent: u64,
    pub bytes_sent: u64,
    pub dropped_ticks: u64,
}

/// How one connected cycle ended
enum CycleEnd {
    Disconnected,
    Cancelled,
}

/// Streams PCM to the collector forever, reconnecting on failure
pub struct Forwarder<C: Connector> {
    provider: Arc<dyn SourceProvider>,
    connector: C,
    audio: AudioConfig,
    retry: RetryPolicy,
    stats: Arc<ForwarderStats>,
    observer: Option<Sender<ForwarderState>>,
}

impl<C: Connector> Forwarder<C> {
    pub fn new(
        provider: Arc<dyn SourceProvider>,
        connector: C,
        audio: AudioConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            connector,
            audio,
            retry,
            stats: Arc::new(ForwarderStats::default()),
            observer: None,
        }
    }

    /// Report every state transition on `tx`
    pub fn with_state_observer(mut self, tx: Sender<ForwarderState>) -> Self {
        self.observer = Some(tx);
        self
    }

    pub fn stats(&self) -> Arc<ForwarderStats> {
        self.stats.clone()
    }

    fn transition(&self, state: ForwarderState) {
        *self.stats.state.lock() = state;
        if let Some(tx) = &self.observer {
            let _ = tx.send(state);
        }
    }

    /// Enter `Disconnected` and wait out the retry delay.
    ///
    /// Returns `false` if cancelled while waiting.
    fn back_off(&self, failures: u32, cancel: &CancelToken) -> bool {
        self.transition(ForwarderState::Disconnected);
        let delay = self.retry.delay(failures);
        debug!("Reconnecting to collector in {:?}", delay);
        !cancel.wait_timeout(delay)
    }

    /// Run the supervising loop until `cancel` fires
    pub fn run(&mut self, cancel: &CancelToken) {
        let header = StreamHeader::pcm16(self.audio.channels as u8, self.audio.sample_rate);
        let converter = SampleConverter::new(self.audio.layout);
        let mut buffers =
            match DoubleBuffer::new(self.audio.frames_per_buffer, self.audio.channels as usize) {
                Ok(buffers) => buffers,
                Err(e) => {
                    error!("Forwarder buffer setup failed: {}", e);
                    return;
                }
            };

        let mut source: Option<Box<dyn FrameSource>> = None;
        let mut failures = 0u32;

        while !cancel.is_cancelled() {
            self.transition(ForwarderState::Connecting);

            if source.is_none() {
                match self.provider.open() {
                    Ok(opened) => source = Some(opened),
                    Err(e) => {
                        warn!("Forwarder could not open sample source: {}", e);
                        failures += 1;
                        if !self.back_off(failures, cancel) {
                            break;
                        }
                        continue;
                    }
                }
            }

            self.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);
            let stream = match self.connector.connect() {
                Ok(stream) => stream,
                Err(e) => {
                    self.stats.connect_failures.fetch_add(1, Ordering::Relaxed);
                    failures += 1;
                    warn!("Collector connection attempt {} failed: {}", failures, e);
                    if !self.back_off(failures, cancel) {
                        break;
                    }
                    continue;
                }
            };
            info!("Connected to collector");

            self.transition(ForwarderState::Handshake);
            let mut sink = WriterSink::new(stream);
            if let Err(e) = sink.send_chunk(&header.encode()) {
                warn!("Failed to send stream header: {}", e);
                failures += 1;
                self.stats.disconnects.fetch_add(1, Ordering::Relaxed);
                if !self.back_off(failures, cancel) {
                    break;
                }
                continue;
            }
            failures = 0;

            self.transition(ForwarderState::Streaming);
            let active = match source.as_mut() {
                Some(active) => active,
                None => continue,
            };
            let end = self.stream(active, &mut buffers, &converter, &mut sink, cancel);

            match end {
                Ok(CycleEnd::Cancelled) => break,
                Ok(CycleEnd::Disconnected) => {}
                Err(e) => {
                    // Reopen the source on the next cycle
                    error!("Forwarder sample source failed: {}", e);
                    source = None;
                }
            }

            self.stats.disconnects.fetch_add(1, Ordering::Relaxed);
            info!(
                "Collector stream ended after {} bytes, will reconnect",
                sink.bytes_written()
            );
            failures += 1;
            if !self.back_off(failures, cancel) {
                break;
            }
        }

        info!("Forwarder stopped");
    }

    fn stream<K: ChunkSink>(
        &self,
        source: &mut Box<dyn FrameSource>,
        buffers: &mut DoubleBuffer,
        converter: &SampleConverter,
        sink: &mut K,
        cancel: &CancelToken,
    ) -> Result<CycleEnd, AudioError> {
        loop {
            match buffers.fill(source, converter, cancel) {
                Ok(report) => {
                    if report.dropped_ticks > 0 {
                        self.stats
                            .dropped_ticks
                            .fetch_add(report.dropped_ticks, Ordering::Relaxed);
                    }
                }
                Err(AudioError::Cancelled) => return Ok(CycleEnd::Cancelled),
                Err(e) => return Err(e),
            }

            let chunk = buffers.drain();
            if let Err(e) = sink.send_chunk(chunk) {
                warn!("Collector send failed: {}", e);
                return Ok(CycleEnd::Disconnected);
            }
            self.stats.chunks_sent.fetch_add(1, Ordering::Relaxed);
            self.stats
                .bytes_sent
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
    }
}

impl<C: Connector + 'static> Forwarder<C> {
    /// Run on a dedicated thread
    pub fn spawn(mut self, cancel: CancelToken) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("forwarder".to_string())
            .spawn(move || self.run(&cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::convert::WordLayout;
    use crate::audio::synthetic::ToneProvider;
    use crossbeam_channel::unbounded;
    use std::io::Read;
    use std::net::TcpListener;
    use std::time::Instant;

    /// Records writes into a shared log; fails once the log holds
    /// `fail_after` writes, cancelling `cancel` if set
    struct MockStream {
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
        fail_after: usize,
        cancel: Option<CancelToken>,
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut writes = self.writes.lock();
            if writes.len() >= self.fail_after {
                if let Some(cancel) = &self.cancel {
                    cancel.cancel();
                }
                return Err(std::io::ErrorKind::BrokenPipe.into());
            }
            writes.push(buf.to_vec());
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct FlakyConnector {
        failures_left: u32,
        attempts: Arc<AtomicU64>,
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
        cancel: CancelToken,
    }

    impl Connector for FlakyConnector {
        type Stream = MockStream;

        fn connect(&mut self) -> Result<MockStream, NetworkError> {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(NetworkError::ConnectionFailed("refused".into()));
            }
            Ok(MockStream {
                writes: self.writes.clone(),
                fail_after: 3,
                cancel: Some(self.cancel.clone()),
            })
        }
    }

    /// What the next connection attempt does
    enum Attempt {
        Refuse,
        /// Accept; the stream breaks once the shared log holds this many writes
        Accept { fail_after: usize, cancel: bool },
    }

    struct ScriptedConnector {
        script: std::collections::VecDeque<Attempt>,
        attempted_at: Arc<Mutex<Vec<Instant>>>,
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
        cancel: CancelToken,
    }

    impl ScriptedConnector {
        fn new(script: Vec<Attempt>, cancel: &CancelToken) -> Self {
            Self {
                script: script.into(),
                attempted_at: Arc::new(Mutex::new(Vec::new())),
                writes: Arc::new(Mutex::new(Vec::new())),
                cancel: cancel.clone(),
            }
        }
    }

    impl Connector for ScriptedConnector {
        type Stream = MockStream;

        fn connect(&mut self) -> Result<MockStream, NetworkError> {
            self.attempted_at.lock().push(Instant::now());
            match self.script.pop_front() {
                Some(Attempt::Accept { fail_after, cancel }) => Ok(MockStream {
                    writes: self.writes.clone(),
                    fail_after,
                    cancel: cancel.then(|| self.cancel.clone()),
                }),
                Some(Attempt::Refuse) => Err(NetworkError::ConnectionFailed("refused".into())),
                None => {
                    self.cancel.cancel();
                    Err(NetworkError::ConnectionFailed("script exhausted".into()))
                }
            }
        }
    }

    /// First source fails outright, later ones are tones
    struct ReopeningProvider {
        opens: Arc<AtomicU64>,
    }

    struct UnpluggedSource;

    impl FrameSource for UnpluggedSource {
        fn channels(&self) -> usize {
            2
        }

        fn read_frame(&mut self, _cancel: &CancelToken) -> Result<crate::audio::source::RawFrame, AudioError> {
            Err(AudioError::StreamError("device unplugged".into()))
        }
    }

    impl SourceProvider for ReopeningProvider {
        fn channels(&self) -> usize {
            2
        }

        fn open(&self) -> Result<Box<dyn FrameSource>, AudioError> {
            if self.opens.fetch_add(1, Ordering::Relaxed) == 0 {
                return Ok(Box::new(UnpluggedSource));
            }
            ToneProvider::new(2, 24_000, WordLayout::default(), false).open()
        }
    }

    fn audio(frames: usize) -> AudioConfig {
        AudioConfig {
            frames_per_buffer: frames,
            paced: false,
            ..AudioConfig::default()
        }
    }

    #[test]
    fn test_fixed_policy() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5));
        assert_eq!(policy.delay(1), Duration::from_secs(5));
        assert_eq!(policy.delay(40), Duration::from_secs(5));
    }

    #[test]
    fn test_exponential_policy_saturates() {
        let policy = RetryPolicy::exponential(Duration::from_secs(1), Duration::from_secs(30));
        let delays: Vec<u64> = (1..=7).map(|n| policy.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(policy.delay(1000), Duration::from_secs(30));
    }

    #[test]
    fn test_reconnects_after_three_failures() {
        let cancel = CancelToken::new();
        let attempts = Arc::new(AtomicU64::new(0));
        let writes = Arc::new(Mutex::new(Vec::new()));
        let connector = FlakyConnector {
            failures_left: 3,
            attempts: attempts.clone(),
            writes: writes.clone(),
            cancel: cancel.clone(),
        };
        let provider = Arc::new(ToneProvider::new(4, 24_000, WordLayout::default(), false));
        let delay = Duration::from_millis(20);
        let (tx, rx) = unbounded();

        let mut forwarder = Forwarder::new(provider, connector, audio(64), RetryPolicy::fixed(delay))
            .with_state_observer(tx);
        let stats = forwarder.stats();

        let start = Instant::now();
        forwarder.run(&cancel);
        assert!(start.elapsed() >= delay * 3);

        assert_eq!(attempts.load(Ordering::Relaxed), 4);
        let states: Vec<ForwarderState> = rx.try_iter().collect();
        use ForwarderState::*;
        assert_eq!(
            states,
            vec![
                Connecting, Disconnected,
                Connecting, Disconnected,
                Connecting, Disconnected,
                Connecting, Handshake, Streaming, Disconnected,
            ]
        );

        // Header first, then whole buffers
        let writes = writes.lock();
        assert_eq!(writes[0], vec![0x01, 0x04, 0x10, 0x00, 0xC0, 0x5D, 0x00, 0x00]);
        assert_eq!(writes[1].len(), 64 * 4 * 2);
        assert_eq!(writes[2].len(), 64 * 4 * 2);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connect_failures, 3);
        assert_eq!(snapshot.chunks_sent, 2);
        assert_eq!(snapshot.disconnects, 1);
    }

    #[test]
    fn test_handshake_resets_backoff() {
        let cancel = CancelToken::new();
        let connector = ScriptedConnector::new(
            vec![
                Attempt::Refuse,
                Attempt::Refuse,
                Attempt::Accept { fail_after: 2, cancel: false },
                Attempt::Accept { fail_after: 3, cancel: true },
            ],
            &cancel,
        );
        let attempted_at = connector.attempted_at.clone();
        let provider = Arc::new(ToneProvider::new(4, 24_000, WordLayout::default(), false));
        let initial = Duration::from_millis(100);
        let (tx, rx) = unbounded();

        let mut forwarder = Forwarder::new(
            provider,
            connector,
            audio(32),
            RetryPolicy::exponential(initial, Duration::from_secs(10)),
        )
        .with_state_observer(tx);
        forwarder.run(&cancel);

        let at = attempted_at.lock();
        assert_eq!(at.len(), 4);
        assert!(at[1] - at[0] >= initial);
        assert!(at[2] - at[1] >= initial * 2);
        // After streaming the counter restarts: initial, not initial * 4
        let after_stream = at[3] - at[2];
        assert!(after_stream >= initial);
        assert!(after_stream < initial * 3, "waited {:?}", after_stream);

        let states: Vec<ForwarderState> = rx.try_iter().collect();
        let streamed = states
            .iter()
            .filter(|s| **s == ForwarderState::Streaming)
            .count();
        assert_eq!(streamed, 2);
    }

    #[test]
    fn test_source_error_reopens_source() {
        let cancel = CancelToken::new();
        let connector = ScriptedConnector::new(
            vec![
                Attempt::Accept { fail_after: 3, cancel: true },
                Attempt::Accept { fail_after: 3, cancel: true },
            ],
            &cancel,
        );
        let writes = connector.writes.clone();
        let opens = Arc::new(AtomicU64::new(0));
        let provider = Arc::new(ReopeningProvider { opens: opens.clone() });
        let config = AudioConfig {
            channels: 2,
            ..audio(32)
        };

        let mut forwarder = Forwarder::new(
            provider,
            connector,
            config,
            RetryPolicy::fixed(Duration::from_millis(10)),
        );
        let stats = forwarder.stats();
        forwarder.run(&cancel);

        assert_eq!(opens.load(Ordering::Relaxed), 2);

        // Header on each connection, then audio from the reopened source
        let writes = writes.lock();
        let header = StreamHeader::pcm16(2, 24_000).encode();
        assert_eq!(writes[0], header.as_ref());
        assert_eq!(writes[1], header.as_ref());
        assert_eq!(writes[2].len(), 32 * 2 * 2);
        assert_eq!(stats.snapshot().disconnects, 2);
    }

    #[test]
    fn test_stalled_collector_triggers_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancelToken::new();
        let provider = Arc::new(ToneProvider::new(4, 24_000, WordLayout::default(), false));

        let connector = TcpConnector::new(addr, Duration::from_secs(1))
            .with_write_timeout(Duration::from_millis(100));
        let forwarder = Forwarder::new(
            provider,
            connector,
            audio(4096),
            RetryPolicy::fixed(Duration::from_millis(10)),
        );
        let stats = forwarder.stats();
        let handle = forwarder.spawn(cancel.clone()).unwrap();

        let accept = |deadline: Instant| loop {
            match listener.accept() {
                Ok((stream, _)) => return stream,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    assert!(Instant::now() < deadline, "forwarder never connected");
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("accept failed: {}", e),
            }
        };

        // Never read from the first connection
        let _stalled = accept(Instant::now() + Duration::from_secs(10));
        let _second = accept(Instant::now() + Duration::from_secs(30));

        cancel.cancel();
        handle.join().unwrap();
        assert!(stats.snapshot().disconnects >= 1);
    }

    #[test]
    fn test_reconnects_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancelToken::new();
        let provider = Arc::new(ToneProvider::new(2, 24_000, WordLayout::default(), false));

        let forwarder = Forwarder::new(
            provider,
            TcpConnector::new(addr, Duration::from_secs(1)),
            audio(256),
            RetryPolicy::fixed(Duration::from_millis(10)),
        );
        let stats = forwarder.stats();
        let handle = forwarder.spawn(cancel.clone()).unwrap();

        let (mut first, _) = listener.accept().unwrap();
        let mut header = [0u8; StreamHeader::SIZE];
        first.read_exact(&mut header).unwrap();
        assert_eq!(StreamHeader::decode(&header).unwrap().channels, 2);
        let mut chunk = vec![0u8; 256 * 2 * 2];
        first.read_exact(&mut chunk).unwrap();
        drop(first);

        // The forwarder notices the closed peer and comes back
        let (mut second, _) = listener.accept().unwrap();
        second.read_exact(&mut header).unwrap();
        assert_eq!(StreamHeader::decode(&header).unwrap().sample_rate, 24_000);

        cancel.cancel();
        drop(second);
        handle.join().unwrap();

        let snapshot = stats.snapshot();
        assert!(snapshot.connect_attempts >= 2);
        assert!(snapshot.disconnects >= 1);
    }
}
