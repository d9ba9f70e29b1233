//! Scripted publisher and recording callbacks for session tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::endpoint::{Protocol, StreamingEndpoint};
use super::publisher::{ConnectOutcome, MediaPacket, Publisher, PublisherFactory};
use super::session::ConnectChecker;
use crate::error::{AppError, Result};

#[derive(Debug, Clone)]
pub enum ConnectScript {
    Accept,
    AcceptAuthenticated,
    RejectAuth,
    Fail(String),
    /// Never completes; exercises timeouts and cancellation
    Hang,
}

struct Shared {
    script: Mutex<ConnectScript>,
    fail_after: Mutex<Option<usize>>,
    creates: AtomicUsize,
    connects: AtomicUsize,
    closes: AtomicUsize,
    sent: Mutex<Vec<MediaPacket>>,
}

#[derive(Clone)]
pub struct FakeFactory {
    shared: Arc<Shared>,
}

impl FakeFactory {
    pub fn new(script: ConnectScript) -> Self {
        Self {
            shared: Arc::new(Shared {
                script: Mutex::new(script),
                fail_after: Mutex::new(None),
                creates: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn set_script(&self, script: ConnectScript) {
        *self.shared.script.lock() = script;
    }

    /// Make `send` fail once `n` packets went through
    pub fn fail_sends_after(&self, n: usize) {
        *self.shared.fail_after.lock() = Some(n);
    }

    pub fn create_calls(&self) -> usize {
        self.shared.creates.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<MediaPacket> {
        self.shared.sent.lock().clone()
    }
}

impl PublisherFactory for FakeFactory {
    fn create(&self, _protocol: Protocol) -> Result<Box<dyn Publisher>> {
        self.shared.creates.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakePublisher {
            shared: self.shared.clone(),
        }))
    }
}

struct FakePublisher {
    shared: Arc<Shared>,
}

#[async_trait]
impl Publisher for FakePublisher {
    async fn connect(&mut self, _endpoint: &StreamingEndpoint) -> Result<ConnectOutcome> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        let script = self.shared.script.lock().clone();
        match script {
            ConnectScript::Accept => Ok(ConnectOutcome::default()),
            ConnectScript::AcceptAuthenticated => Ok(ConnectOutcome {
                authenticated: true,
            }),
            ConnectScript::RejectAuth => Err(AppError::Auth("bad credentials".to_string())),
            ConnectScript::Fail(reason) => Err(AppError::Connection(reason)),
            ConnectScript::Hang => std::future::pending().await,
        }
    }

    async fn send(&mut self, packet: &MediaPacket) -> Result<usize> {
        let mut sent = self.shared.sent.lock();
        if let Some(limit) = *self.shared.fail_after.lock() {
            if sent.len() >= limit {
                return Err(AppError::Connection("broken pipe".to_string()));
            }
        }
        sent.push(packet.clone());
        Ok(packet.len())
    }

    async fn close(&mut self) {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records every callback as a short string
#[derive(Default)]
pub struct RecordingChecker {
    calls: Mutex<Vec<String>>,
}

impl RecordingChecker {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Calls other than bitrate samples
    pub fn transitions(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("bitrate"))
            .collect()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

impl ConnectChecker for RecordingChecker {
    fn on_connecting(&self, url: &str) {
        self.record(format!("connecting {}", url));
    }

    fn on_connected(&self) {
        self.record("connected".to_string());
    }

    fn on_connection_failed(&self, reason: &str) {
        self.record(format!("failed {}", reason));
    }

    fn on_disconnected(&self) {
        self.record("disconnected".to_string());
    }

    fn on_auth_error(&self) {
        self.record("auth_error".to_string());
    }

    fn on_auth_success(&self) {
        self.record("auth_success".to_string());
    }

    fn on_bitrate_sample(&self, bps: u64) {
        self.record(format!("bitrate {}", bps));
    }
}
