//! Streaming session
//!
//! Drives one publisher through `Disconnected -> Connecting -> Connected`
//! and back. A connect attempt that fails ends in `Failed` or `AuthError`;
//! both are final for that attempt and the caller has to `connect` again.
//!
//! Every state change is published three ways: the `watch` channel returned
//! by [`StreamingSession::state_watch`], the event bus, and the
//! [`ConnectChecker`] callbacks. Callbacks run one at a time, in order, on a
//! dedicated dispatcher task, so a slow callback never stalls the network
//! path.

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bitrate::{BitrateAdapter, BitrateSample};
use super::endpoint::StreamingEndpoint;
use super::publisher::{MediaPacket, Publisher, PublisherFactory};
use super::queue::PacketQueue;
use crate::config::StreamConfig;
use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::utils::LogThrottler;
use crate::warn_throttled;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
/// How long stop waits for an in-flight send before abandoning the publisher
const SEND_STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed(String),
    AuthError,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed(_) => "failed",
            Self::AuthError => "auth_error",
        }
    }

    fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed: {}", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// Connection callbacks. All methods default to no-ops.
pub trait ConnectChecker: Send + Sync {
    fn on_connecting(&self, _url: &str) {}
    fn on_connected(&self) {}
    fn on_connection_failed(&self, _reason: &str) {}
    fn on_disconnected(&self) {}
    fn on_auth_error(&self) {}
    fn on_auth_success(&self) {}
    fn on_bitrate_sample(&self, _bps: u64) {}
}

/// Logs each callback through tracing
pub struct LoggingChecker;

impl ConnectChecker for LoggingChecker {
    fn on_connecting(&self, url: &str) {
        info!("Connecting to {}", url);
    }

    fn on_connected(&self) {
        info!("Connected");
    }

    fn on_connection_failed(&self, reason: &str) {
        warn!("Connection failed: {}", reason);
    }

    fn on_disconnected(&self) {
        info!("Disconnected");
    }

    fn on_auth_error(&self) {
        warn!("Server rejected the credentials");
    }

    fn on_auth_success(&self) {
        debug!("Credentials accepted");
    }

    fn on_bitrate_sample(&self, bps: u64) {
        debug!("Sent {} kbps", bps / 1000);
    }
}

enum Callback {
    Connecting(String),
    Connected,
    Failed(String),
    Disconnected,
    AuthError,
    AuthSuccess,
    Bitrate(u64),
    Flush(oneshot::Sender<()>),
}

async fn dispatch_callbacks(
    checker: Arc<dyn ConnectChecker>,
    mut rx: mpsc::UnboundedReceiver<Callback>,
) {
    while let Some(callback) = rx.recv().await {
        match callback {
            Callback::Connecting(url) => checker.on_connecting(&url),
            Callback::Connected => checker.on_connected(),
            Callback::Failed(reason) => checker.on_connection_failed(&reason),
            Callback::Disconnected => checker.on_disconnected(),
            Callback::AuthError => checker.on_auth_error(),
            Callback::AuthSuccess => checker.on_auth_success(),
            Callback::Bitrate(bps) => checker.on_bitrate_sample(bps),
            Callback::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Session tunables, usually taken from [`StreamConfig`]
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub connect_timeout: Duration,
    pub queue_capacity: usize,
    pub max_bitrate_bps: u64,
    pub min_bitrate_bps: u64,
    pub adaptive_bitrate: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for SessionOptions {
    fn from(config: &StreamConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            queue_capacity: config.queue_capacity,
            max_bitrate_bps: config.video_bitrate_kbps as u64 * 1000,
            min_bitrate_bps: config.min_bitrate_kbps as u64 * 1000,
            adaptive_bitrate: config.adaptive_bitrate,
        }
    }
}

struct Publishing {
    cancel: CancellationToken,
    send_task: JoinHandle<Option<Box<dyn Publisher>>>,
    sampler: JoinHandle<()>,
}

/// Network side of the session, only touched under the async lock
#[derive(Default)]
struct Link {
    publisher: Option<Box<dyn Publisher>>,
    publishing: Option<Publishing>,
}

struct Inner {
    factory: Arc<dyn PublisherFactory>,
    options: SessionOptions,
    state: watch::Sender<ConnectionState>,
    callbacks: mpsc::UnboundedSender<Callback>,
    /// Cancels the in-flight connect; also serializes state transitions
    attempt: Mutex<Option<CancellationToken>>,
    url: Mutex<Option<String>>,
    link: tokio::sync::Mutex<Link>,
    queue: PacketQueue,
    bitrate: BitrateAdapter,
    publishing: AtomicBool,
    events: RwLock<Option<Arc<EventBus>>>,
    throttler: LogThrottler,
}

impl Inner {
    fn current(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    fn callback(&self, callback: Callback) {
        let _ = self.callbacks.send(callback);
    }

    fn publish(&self, event: SystemEvent) {
        if let Some(events) = self.events.read().as_ref() {
            events.publish(event);
        }
    }

    /// Move to `new` and emit the matching callback. Caller holds `attempt`.
    fn transition(&self, new: ConnectionState) {
        let mut old = None;
        self.state.send_if_modified(|state| {
            if *state == new {
                return false;
            }
            old = Some(std::mem::replace(state, new.clone()));
            true
        });
        let Some(old) = old else {
            return;
        };

        info!("Stream state: {} -> {}", old.name(), new);
        let url = self.url.lock().clone();
        match &new {
            ConnectionState::Connecting => {
                self.callback(Callback::Connecting(url.clone().unwrap_or_default()))
            }
            ConnectionState::Connected => self.callback(Callback::Connected),
            ConnectionState::Failed(reason) => self.callback(Callback::Failed(reason.clone())),
            ConnectionState::AuthError => self.callback(Callback::AuthError),
            ConnectionState::Disconnected if old.is_active() => {
                self.callback(Callback::Disconnected)
            }
            ConnectionState::Disconnected => {}
        }

        let reason = match &new {
            ConnectionState::Failed(reason) => Some(reason.clone()),
            ConnectionState::AuthError => Some("authentication rejected".to_string()),
            _ => None,
        };
        self.publish(SystemEvent::StreamStateChanged {
            state: new.name().to_string(),
            url,
            reason,
        });
    }

    /// Send path failure while Connected
    fn publish_failed(&self, reason: String) {
        let _attempt = self.attempt.lock();
        if self.current() != ConnectionState::Connected {
            return;
        }
        self.publishing.store(false, Ordering::SeqCst);
        self.publish(SystemEvent::error("stream", reason.clone()));
        self.transition(ConnectionState::Failed(reason));
    }

    async fn stop_publishing_locked(&self, link: &mut Link) {
        self.publishing.store(false, Ordering::SeqCst);
        let Some(publishing) = link.publishing.take() else {
            return;
        };
        publishing.cancel.cancel();
        publishing.sampler.abort();

        let mut send_task = publishing.send_task;
        match tokio::time::timeout(SEND_STOP_TIMEOUT, &mut send_task).await {
            Ok(Ok(Some(publisher))) => link.publisher = Some(publisher),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => warn!("Send task ended abnormally: {}", e),
            Err(_) => {
                send_task.abort();
                self.publish_failed("send stalled".to_string());
            }
        }
        self.queue.clear();
        debug!("Publishing stopped");
    }
}

async fn send_loop(
    inner: Arc<Inner>,
    mut publisher: Box<dyn Publisher>,
    cancel: CancellationToken,
    sent_bytes: Arc<AtomicU64>,
) -> Option<Box<dyn Publisher>> {
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => return Some(publisher),
            packet = inner.queue.pop() => packet,
        };

        match publisher.send(&packet).await {
            Ok(n) => {
                sent_bytes.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => {
                warn_throttled!(inner.throttler, "send", "Publish failed: {}", e);
                // Stops the sampler before Failed is reported
                cancel.cancel();
                inner.publish_failed(e.to_string());
                publisher.close().await;
                return None;
            }
        }
    }
}

async fn sample_loop(inner: Arc<Inner>, cancel: CancellationToken, sent_bytes: Arc<AtomicU64>) {
    let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
    interval.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        let bps = sent_bytes.swap(0, Ordering::Relaxed) * 8 / SAMPLE_INTERVAL.as_secs().max(1);
        let dropped = inner.queue.dropped();
        let target_bps = inner.bitrate.on_sample(BitrateSample {
            measured_bps: bps,
            queue_fill: inner.queue.fill_ratio(),
            dropped,
        });
        inner.callback(Callback::Bitrate(bps));
        inner.publish(SystemEvent::StreamBitrate {
            bps,
            target_bps,
            dropped,
        });
    }
}

/// One logical stream to one endpoint at a time
pub struct StreamingSession {
    inner: Arc<Inner>,
    _dispatcher: JoinHandle<()>,
}

impl StreamingSession {
    /// Must be called inside a tokio runtime
    pub fn new(
        factory: Arc<dyn PublisherFactory>,
        options: SessionOptions,
        checker: Arc<dyn ConnectChecker>,
    ) -> Self {
        let (callbacks, rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch_callbacks(checker, rx));
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        let inner = Arc::new(Inner {
            factory,
            queue: PacketQueue::new(options.queue_capacity),
            bitrate: BitrateAdapter::new(
                options.max_bitrate_bps,
                options.min_bitrate_bps,
                options.adaptive_bitrate,
            ),
            options,
            state,
            callbacks,
            attempt: Mutex::new(None),
            url: Mutex::new(None),
            link: tokio::sync::Mutex::new(Link::default()),
            publishing: AtomicBool::new(false),
            events: RwLock::new(None),
            throttler: LogThrottler::with_secs(5),
        });

        Self {
            inner,
            _dispatcher: dispatcher,
        }
    }

    pub fn set_event_bus(&self, events: Arc<EventBus>) {
        *self.inner.events.write() = Some(events);
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.current()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_publishing(&self) -> bool {
        self.inner.publishing.load(Ordering::SeqCst)
    }

    /// Encoder bitrate chosen by the adapter
    pub fn target_bitrate(&self) -> watch::Receiver<u64> {
        self.inner.bitrate.subscribe()
    }

    /// Packets dropped by the send queue since publishing started
    pub fn dropped_packets(&self) -> u64 {
        self.inner.queue.dropped()
    }

    /// Connect and negotiate publishing to `url`/`key`
    ///
    /// The endpoint is validated first; a malformed one fails with
    /// `InvalidEndpoint` without touching the state or the network.
    pub async fn connect(&self, url: &str, key: &str) -> Result<()> {
        let endpoint = StreamingEndpoint::parse(url, key)?;

        let token = CancellationToken::new();
        {
            let mut attempt = self.inner.attempt.lock();
            let current = self.inner.current();
            if current.is_active() {
                return Err(AppError::InvalidState(format!(
                    "cannot connect while {}",
                    current
                )));
            }
            *attempt = Some(token.clone());
            *self.inner.url.lock() = Some(endpoint.redacted());
            self.inner.transition(ConnectionState::Connecting);
        }

        let result = self.attempt(&endpoint, &token).await;

        // Holding the link keeps start_publishing out until the publisher is stored
        let mut link = self.inner.link.lock().await;
        let cancelled = {
            let mut attempt = self.inner.attempt.lock();
            let cancelled = token.is_cancelled();
            if !cancelled {
                *attempt = None;
                match &result {
                    Ok((_, outcome)) => {
                        if outcome.authenticated {
                            self.inner.callback(Callback::AuthSuccess);
                        }
                        self.inner.throttler.clear("send");
                        self.inner.transition(ConnectionState::Connected);
                    }
                    Err(AppError::Auth(_)) => self.inner.transition(ConnectionState::AuthError),
                    Err(e) => self.inner.transition(ConnectionState::Failed(e.to_string())),
                }
            }
            cancelled
        };

        match result {
            Ok((mut publisher, _)) if cancelled => {
                publisher.close().await;
                Err(AppError::Connection("connect cancelled".to_string()))
            }
            Ok((publisher, _)) => {
                link.publisher = Some(publisher);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn attempt(
        &self,
        endpoint: &StreamingEndpoint,
        token: &CancellationToken,
    ) -> Result<(Box<dyn Publisher>, super::publisher::ConnectOutcome)> {
        let mut publisher = self.inner.factory.create(endpoint.protocol)?;
        let timeout = self.inner.options.connect_timeout;

        let connected = tokio::select! {
            _ = token.cancelled() => Err(AppError::Connection("connect cancelled".to_string())),
            result = tokio::time::timeout(timeout, publisher.connect(endpoint)) => match result {
                Ok(result) => result,
                Err(_) => Err(AppError::Connection(format!(
                    "timed out after {}s",
                    timeout.as_secs_f32()
                ))),
            },
        };

        match connected {
            Ok(outcome) => Ok((publisher, outcome)),
            Err(e) => {
                publisher.close().await;
                Err(e)
            }
        }
    }

    /// Start draining the packet queue into the connected publisher
    pub async fn start_publishing(&self) -> Result<()> {
        let mut link = self.inner.link.lock().await;
        let current = self.inner.current();
        if current != ConnectionState::Connected {
            return Err(AppError::InvalidState(format!(
                "cannot publish while {}",
                current
            )));
        }
        if let Some(publishing) = &link.publishing {
            if !publishing.send_task.is_finished() {
                return Ok(());
            }
            // Left over from a run that failed before the reconnect
            self.inner.stop_publishing_locked(&mut link).await;
        }
        let publisher = link
            .publisher
            .take()
            .ok_or_else(|| AppError::InvalidState("no publisher attached".to_string()))?;

        self.inner.queue.clear();
        self.inner.queue.reset_dropped();
        self.inner.bitrate.reset();

        let cancel = CancellationToken::new();
        let sent_bytes = Arc::new(AtomicU64::new(0));
        let send_task = tokio::spawn(send_loop(
            self.inner.clone(),
            publisher,
            cancel.clone(),
            sent_bytes.clone(),
        ));
        let sampler = tokio::spawn(sample_loop(self.inner.clone(), cancel.clone(), sent_bytes));
        link.publishing = Some(Publishing {
            cancel,
            send_task,
            sampler,
        });
        self.inner.publishing.store(true, Ordering::SeqCst);
        info!("Publishing started");
        Ok(())
    }

    /// Queue a packet for sending. Returns false if it was not accepted as-is:
    /// either nothing is publishing or an older packet was dropped for it.
    pub fn push(&self, packet: MediaPacket) -> bool {
        if !self.is_publishing() {
            return false;
        }
        self.inner.queue.push(packet)
    }

    /// Stop sending but stay connected. Idempotent.
    pub async fn stop_publishing(&self) {
        let mut link = self.inner.link.lock().await;
        self.inner.stop_publishing_locked(&mut link).await;
    }

    /// Tear everything down. Idempotent.
    pub async fn disconnect(&self) {
        {
            let mut attempt = self.inner.attempt.lock();
            if let Some(token) = attempt.take() {
                token.cancel();
            }
            self.inner.transition(ConnectionState::Disconnected);
        }

        let mut link = self.inner.link.lock().await;
        self.inner.stop_publishing_locked(&mut link).await;
        if let Some(mut publisher) = link.publisher.take() {
            publisher.close().await;
        }
    }

    /// Wait until every callback queued so far has run
    pub async fn flush_callbacks(&self) {
        let (tx, rx) = oneshot::channel();
        self.inner.callback(Callback::Flush(tx));
        let _ = rx.await;
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        if let Some(token) = self.inner.attempt.lock().take() {
            token.cancel();
        }
        if let Ok(mut link) = self.inner.link.try_lock() {
            if let Some(publishing) = link.publishing.take() {
                publishing.cancel.cancel();
                publishing.sampler.abort();
                publishing.send_task.abort();
            }
        }
    }
}
