//! Outbound event stream to the collector
//!
//! Producers (the trace loop and the proc scanner) push encoded messages into
//! a bounded queue through an [`Outbox`] and never block: when the queue is
//! full the newest message is dropped. A single writer thread owns the socket,
//! sends the handshake on every connection and writes queued frames in order.
//!
//! A frame that fails to write is kept aside and written first on the next
//! connection, so delivery is at-least-once.

use crate::proto::{write_frame, Message, ProtoError};
use crate::shutdown::{self, Cancellation};
use anyhow::{Context, Result};
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use std::io::{self, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 100_000;
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 600;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

const JOIN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Collector `host:port`
    pub addr: String,
    pub queue_capacity: usize,
    pub connect_attempts: u32,
    pub retry_delay: Duration,
    /// Dial from the writer thread instead of before returning from `start`
    pub async_connect: bool,
    /// Dump every message at debug level
    pub verbose: bool,
}

/// Opens connections to the collector
pub trait Connector: Send + 'static {
    type Stream: Write + Send;

    fn connect(&mut self) -> io::Result<Self::Stream>;
}

pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&mut self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(&self.addr)?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Dial with up to `attempts` tries spaced by `delay`.
///
/// Once `closing` is raised a failed try is final.
pub fn dial<C: Connector>(connector: &mut C, attempts: u32, delay: Duration, closing: &Cancellation) -> io::Result<C::Stream> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match connector.connect() {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                warn!("connect failed (attempt {}/{}): {}", attempt, attempts, e);
                if attempt >= attempts || closing.is_cancelled() || closing.sleep(delay) {
                    return Err(e);
                }
                attempt += 1;
            }
        }
    }
}

/// Non-blocking producer handle
#[derive(Clone)]
pub struct Outbox {
    tx: Option<Sender<Vec<u8>>>,
    dropped: Arc<AtomicU64>,
    verbose: bool,
}

impl Outbox {
    /// An outbox that only logs
    pub fn disabled(verbose: bool) -> Self {
        Self {
            tx: None,
            dropped: Arc::default(),
            verbose,
        }
    }

    fn dump(&self, msg: &Message) {
        if !self.verbose {
            return;
        }
        match serde_json::to_string(msg) {
            Ok(json) => debug!(target: "ptsentry::dump", "{}", json),
            Err(e) => debug!(target: "ptsentry::dump", "unprintable message: {}", e),
        }
    }

    pub fn send(&self, msg: &Message) {
        self.dump(msg);
        let Some(tx) = &self.tx else {
            return;
        };

        let payload = match msg.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to encode message");
                return;
            }
        };
        match tx.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "outbound queue full, message dropped");
            }
            Err(TrySendError::Disconnected(_)) => debug!("outbound queue closed, message dropped"),
        }
    }

    /// Messages dropped on a full queue so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Outbox feeding a bare queue, for inspecting what producers send
    #[cfg(test)]
    pub(crate) fn channel(capacity: usize) -> (Self, Receiver<Vec<u8>>) {
        let (tx, rx) = bounded(capacity);
        let outbox = Self {
            tx: Some(tx),
            dropped: Arc::default(),
            verbose: false,
        };
        (outbox, rx)
    }
}

/// Socket owner draining the queue
pub struct Writer<C: Connector> {
    connector: C,
    stream: Option<C::Stream>,
    /// Encoded handshake, written first on every connection
    hello: Vec<u8>,
    rx: Receiver<Vec<u8>>,
    /// Frame whose write failed; goes out before anything dequeued later
    pending: Option<Vec<u8>>,
    attempts: u32,
    delay: Duration,
    closing: Cancellation,
}

impl<C: Connector> Writer<C> {
    pub fn new(
        connector: C,
        hello: Vec<u8>,
        rx: Receiver<Vec<u8>>,
        attempts: u32,
        delay: Duration,
        closing: Cancellation,
    ) -> Self {
        Self {
            connector,
            stream: None,
            hello,
            rx,
            pending: None,
            attempts,
            delay,
            closing,
        }
    }

    /// Start from an already connected stream that has seen the handshake
    pub fn with_stream(mut self, stream: C::Stream) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Connect and send the handshake, retrying until closing
    fn connect(&mut self) -> io::Result<()> {
        loop {
            let result = dial(&mut self.connector, self.attempts, self.delay, &self.closing).and_then(|mut stream| {
                write_frame(&mut stream, &self.hello).map_err(into_io)?;
                Ok(stream)
            });
            match result {
                Ok(stream) => {
                    info!("connected to collector");
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) if self.closing.is_cancelled() => return Err(e),
                Err(e) => error!(error = %e, "collector unreachable, still retrying"),
            }
        }
    }

    fn write(&mut self, payload: &[u8]) -> Result<(), ProtoError> {
        match self.stream.as_mut() {
            Some(stream) => write_frame(stream, payload),
            None => Err(ProtoError::Io(io::ErrorKind::NotConnected.into())),
        }
    }

    /// Drain the queue until every producer is gone
    pub fn run(mut self) {
        if let Err(e) = shutdown::block_signals() {
            warn!(error = %e, "failed to block signals in writer");
        }

        loop {
            let payload = match self.pending.take() {
                Some(payload) => payload,
                None => match self.rx.recv() {
                    Ok(payload) => payload,
                    Err(_) => break,
                },
            };

            if self.stream.is_none() {
                if let Err(e) = self.connect() {
                    error!(error = %e, queued = self.rx.len() + 1, "giving up on collector");
                    return;
                }
            }
            if let Err(e) = self.write(&payload) {
                warn!(error = %e, "write to collector failed, reconnecting");
                self.stream = None;
                self.pending = Some(payload);
            }
        }
        debug!("writer drained");
    }
}

fn into_io(e: ProtoError) -> io::Error {
    match e {
        ProtoError::Io(e) => e,
        other => io::Error::other(other),
    }
}

/// The outbound side of a session
pub struct Transport {
    outbox: Outbox,
    writer: Option<JoinHandle<()>>,
    closing: Cancellation,
}

impl Transport {
    /// Transport with no collector: messages are only logged
    pub fn disabled(hello: &Message, verbose: bool) -> Self {
        info!(?hello, "no collector configured");
        Self {
            outbox: Outbox::disabled(verbose),
            writer: None,
            closing: Cancellation::new(),
        }
    }

    pub fn start(config: &TransportConfig, hello: &Message) -> Result<Self> {
        Self::start_with(TcpConnector::new(config.addr.clone()), config, hello)
    }

    /// Start the writer thread.
    ///
    /// Without `async_connect` the first connection is made here, and failing
    /// to reach the collector is an error.
    pub fn start_with<C: Connector>(mut connector: C, config: &TransportConfig, hello: &Message) -> Result<Self> {
        let hello = hello.encode().context("Failed to encode handshake")?;
        let closing = Cancellation::new();
        let (tx, rx) = bounded(config.queue_capacity.max(1));

        let stream = if config.async_connect {
            None
        } else {
            let mut stream = dial(&mut connector, config.connect_attempts, config.retry_delay, &closing)
                .with_context(|| format!("Failed to connect to collector at {}", config.addr))?;
            write_frame(&mut stream, &hello).context("Failed to send handshake")?;
            info!(addr = %config.addr, "connected to collector");
            Some(stream)
        };

        let mut writer = Writer::new(
            connector,
            hello,
            rx,
            config.connect_attempts,
            config.retry_delay,
            closing.clone(),
        );
        if let Some(stream) = stream {
            writer = writer.with_stream(stream);
        }

        let handle = thread::Builder::new()
            .name("ptsentry-writer".to_string())
            .spawn(move || writer.run())
            .context("Failed to spawn writer thread")?;

        Ok(Self {
            outbox: Outbox {
                tx: Some(tx),
                dropped: Arc::default(),
                verbose: config.verbose,
            },
            writer: Some(handle),
            closing,
        })
    }

    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    /// Close the queue and give the writer `grace` to drain it.
    ///
    /// Every other [`Outbox`] clone must be dropped first. Returns `true` when
    /// the writer finished in time.
    pub fn shutdown(mut self, grace: Duration) -> bool {
        let dropped = self.outbox.dropped();
        if dropped > 0 {
            warn!(dropped, "messages dropped on a full queue");
        }
        self.outbox.tx = None;
        self.closing.cancel();

        let Some(handle) = self.writer.take() else {
            return true;
        };
        let deadline = Instant::now() + grace;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("writer did not drain in time");
                return false;
            }
            thread::sleep(JOIN_POLL);
        }
        if handle.join().is_err() {
            error!("writer thread panicked");
            return false;
        }
        true
    }
}
