//! Scriptable in-memory backend for tests
//!
//! Accept outcomes are queued ahead of time: a ready session, a transient
//! fault, or parking until the listener is closed. The mock records every
//! record push and counts listener closes so tests can assert the notifier's
//! bookkeeping.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use super::{
    Backend, BackendError, BackendSession, Direction, ListenerId, ListenerInfo,
    SecurityAttributes, SecurityPolicy, TransportKind,
};
use crate::record::{ServiceParams, ServiceRecord};

/// One scripted accept result
pub enum MockAcceptOutcome {
    /// Deliver a connected session
    Session(MockSession),
    /// Fail with a recoverable backend fault
    Transient(String),
    /// Park until the listener is closed, then report `Closed`
    BlockUntilClosed,
}

/// A scripted session returned by [`MockBackend::accept`]
pub struct MockSession {
    /// Attributes reported at accept time
    pub security: SecurityAttributes,
    /// Remote peer identifier
    pub peer: String,
    /// Per-session transfer unit
    pub transfer_unit: Option<u16>,
    /// Payloads handed out by successive reads (then end of stream)
    pub incoming: VecDeque<Vec<u8>>,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
    closed: bool,
}

impl MockSession {
    /// Session with default attributes and nothing to read
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            security: SecurityAttributes::default(),
            peer: peer.into(),
            transfer_unit: None,
            incoming: VecDeque::new(),
            written: Arc::new(Mutex::new(Vec::new())),
            closed: false,
        }
    }

    /// Set the attributes the backend reports for this session
    pub fn with_security(mut self, security: SecurityAttributes) -> Self {
        self.security = security;
        self
    }

    /// Queue a payload for the consumer to read
    pub fn with_incoming(mut self, payload: &[u8]) -> Self {
        self.incoming.push_back(payload.to_vec());
        self
    }

    /// Shared view of everything the consumer wrote
    pub fn written(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        self.written.clone()
    }
}

#[async_trait]
impl BackendSession for MockSession {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, BackendError> {
        if self.closed {
            return Err(BackendError::Closed);
        }
        match self.incoming.pop_front() {
            Some(payload) => {
                let n = payload.len().min(buf.len());
                buf[..n].copy_from_slice(&payload[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    async fn write(&mut self, buf: &[u8]) -> Result<(), BackendError> {
        if self.closed {
            return Err(BackendError::Closed);
        }
        self.written.lock().push(buf.to_vec());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        self.closed = true;
        Ok(())
    }

    fn security_attributes(&self) -> SecurityAttributes {
        self.security
    }

    fn peer_address(&self) -> String {
        self.peer.clone()
    }

    fn transfer_unit(&self) -> Option<u16> {
        self.transfer_unit
    }
}

struct MockListener {
    kind: TransportKind,
    channel: u16,
    closed_tx: watch::Sender<bool>,
    close_calls: AtomicUsize,
}

/// Scriptable backend double
pub struct MockBackend {
    supported: HashSet<TransportKind>,
    next_id: AtomicU64,
    next_channel: AtomicU64,
    listeners: Mutex<HashMap<ListenerId, Arc<MockListener>>>,
    used_channels: Mutex<HashSet<u16>>,
    outcomes: Mutex<VecDeque<MockAcceptOutcome>>,
    record_pushes: Mutex<Vec<(ServiceRecord, bool)>>,
}

impl MockBackend {
    /// Backend supporting every transport kind
    pub fn new() -> Self {
        let mut supported = HashSet::new();
        supported.insert(TransportKind::Stream);
        supported.insert(TransportKind::Packet);
        supported.insert(TransportKind::ObjectExchange);
        Self {
            supported,
            next_id: AtomicU64::new(1),
            next_channel: AtomicU64::new(1),
            listeners: Mutex::new(HashMap::new()),
            used_channels: Mutex::new(HashSet::new()),
            outcomes: Mutex::new(VecDeque::new()),
            record_pushes: Mutex::new(Vec::new()),
        }
    }

    /// Remove support for one transport kind
    pub fn without(mut self, kind: TransportKind) -> Self {
        self.supported.remove(&kind);
        self
    }

    /// Queue the next accept outcome
    pub fn script_accept(&self, outcome: MockAcceptOutcome) {
        self.outcomes.lock().push_back(outcome);
    }

    /// Record pushes seen so far, as (record, during_accept) pairs
    pub fn record_pushes(&self) -> Vec<(ServiceRecord, bool)> {
        self.record_pushes.lock().clone()
    }

    /// How many times `close_listener` was invoked for this listener
    pub fn close_calls(&self, id: ListenerId) -> usize {
        self.listeners
            .lock()
            .get(&id)
            .map(|l| l.close_calls.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn listener(&self, id: ListenerId) -> Result<Arc<MockListener>, BackendError> {
        self.listeners
            .lock()
            .get(&id)
            .cloned()
            .ok_or(BackendError::Closed)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn supports(&self, kind: TransportKind) -> bool {
        self.supported.contains(&kind)
    }

    async fn open(
        &self,
        kind: TransportKind,
        params: &ServiceParams,
        _policy: SecurityPolicy,
    ) -> Result<ListenerInfo, BackendError> {
        if !self.supports(kind) {
            return Err(BackendError::BackendUnavailable(kind));
        }
        let channel = match params.requested_channel {
            Some(requested) => {
                if !self.used_channels.lock().insert(requested) {
                    return Err(BackendError::AddressInUse(requested));
                }
                requested
            }
            None => loop {
                let candidate = self.next_channel.fetch_add(1, Ordering::SeqCst) as u16;
                if self.used_channels.lock().insert(candidate) {
                    break candidate;
                }
            },
        };
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (closed_tx, _) = watch::channel(false);
        self.listeners.lock().insert(
            id,
            Arc::new(MockListener {
                kind,
                channel,
                closed_tx,
                close_calls: AtomicUsize::new(0),
            }),
        );
        Ok(ListenerInfo {
            id,
            channel,
            mtu: match kind {
                TransportKind::Packet => Some(672),
                _ => None,
            },
        })
    }

    async fn close_listener(&self, id: ListenerId) -> Result<(), BackendError> {
        let listener = match self.listeners.lock().get(&id).cloned() {
            Some(l) => l,
            None => return Ok(()),
        };
        listener.close_calls.fetch_add(1, Ordering::SeqCst);
        let _ = listener.closed_tx.send(true);
        self.used_channels.lock().remove(&listener.channel);
        Ok(())
    }

    async fn accept(&self, id: ListenerId) -> Result<Box<dyn BackendSession>, BackendError> {
        let listener = self.listener(id)?;
        let mut closed_rx = listener.closed_tx.subscribe();
        if *closed_rx.borrow() {
            return Err(BackendError::Closed);
        }
        let outcome = self.outcomes.lock().pop_front();
        match outcome {
            Some(MockAcceptOutcome::Session(session)) => Ok(Box::new(session)),
            Some(MockAcceptOutcome::Transient(reason)) => Err(BackendError::Transient(reason)),
            Some(MockAcceptOutcome::BlockUntilClosed) | None => {
                let _ = closed_rx.wait_for(|closed| *closed).await;
                Err(BackendError::Closed)
            }
        }
    }

    async fn update_service_record(
        &self,
        id: ListenerId,
        record: &ServiceRecord,
        during_accept: bool,
    ) -> Result<(), BackendError> {
        let listener = self.listener(id)?;
        if *listener.closed_tx.subscribe().borrow() {
            return Err(BackendError::RegistrationFailed(
                "Listener is closed".to_string(),
            ));
        }
        self.record_pushes
            .lock()
            .push((record.clone(), during_accept));
        Ok(())
    }

    async fn max_transfer_unit(
        &self,
        id: ListenerId,
        _direction: Direction,
    ) -> Result<u16, BackendError> {
        let listener = self.listener(id)?;
        match listener.kind {
            TransportKind::Packet => Ok(672),
            kind => Err(BackendError::Io(format!(
                "Transfer unit is only defined for packet listeners, not {}",
                kind
            ))),
        }
    }
}
