//! TCP loopback backend — emulation driver over `tokio::net`
//!
//! Stands in for a native stack when none is available: stream listeners
//! map to raw TCP streams, packet
//! listeners add a u16 length framing with an enforced transfer unit, and
//! object-exchange listeners expose the same stream semantics for a protocol
//! layer above. Channel/PSM numbers are allocated once at open from per-kind
//! counters; negotiated security attributes are emulated from the listener's
//! policy.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info};

use super::{
    Backend, BackendError, BackendSession, Direction, ListenerId, ListenerInfo,
    SecurityAttributes, SecurityPolicy, TransportKind,
};
use crate::record::{ServiceParams, ServiceRecord};

/// First RFCOMM-style channel handed out to stream listeners
const FIRST_STREAM_CHANNEL: u16 = 1;
/// First PSM handed out to packet listeners (odd, above the reserved range)
const FIRST_PACKET_PSM: u16 = 0x1001;

/// TCP backend configuration
#[derive(Debug, Clone)]
pub struct TcpBackendConfig {
    /// Interface to bind listeners on
    pub bind_addr: std::net::IpAddr,
    /// Transfer unit enforced on packet listeners
    pub packet_mtu: u16,
}

impl Default for TcpBackendConfig {
    fn default() -> Self {
        Self {
            bind_addr: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            packet_mtu: 672,
        }
    }
}

struct TcpListenerEntry {
    kind: TransportKind,
    policy: SecurityPolicy,
    channel: u16,
    mtu: Option<u16>,
    listener: Arc<TcpListener>,
    local_addr: SocketAddr,
    closed_tx: watch::Sender<bool>,
    registered_record: Mutex<Option<ServiceRecord>>,
}

/// Loopback emulation backend
pub struct TcpBackend {
    config: TcpBackendConfig,
    next_id: AtomicU64,
    next_stream_channel: AtomicU64,
    next_packet_psm: AtomicU64,
    used_channels: Mutex<HashMap<TransportKind, HashSet<u16>>>,
    listeners: Mutex<HashMap<ListenerId, Arc<TcpListenerEntry>>>,
}

impl TcpBackend {
    /// Backend bound to localhost with default MTU
    pub fn new() -> Self {
        Self::with_config(TcpBackendConfig::default())
    }

    /// Backend with explicit configuration
    pub fn with_config(config: TcpBackendConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
            next_stream_channel: AtomicU64::new(FIRST_STREAM_CHANNEL as u64),
            next_packet_psm: AtomicU64::new(FIRST_PACKET_PSM as u64),
            used_channels: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Socket address a client can dial to reach this listener
    pub fn local_addr(&self, id: ListenerId) -> Option<SocketAddr> {
        self.listeners.lock().get(&id).map(|e| e.local_addr)
    }

    /// The record last pushed for this listener, if any
    pub fn registered_record(&self, id: ListenerId) -> Option<ServiceRecord> {
        self.listeners
            .lock()
            .get(&id)
            .and_then(|e| e.registered_record.lock().clone())
    }

    fn entry(&self, id: ListenerId) -> Result<Arc<TcpListenerEntry>, BackendError> {
        self.listeners
            .lock()
            .get(&id)
            .cloned()
            .ok_or(BackendError::Closed)
    }

    fn allocate_channel(
        &self,
        kind: TransportKind,
        requested: Option<u16>,
    ) -> Result<u16, BackendError> {
        let mut used = self.used_channels.lock();
        let taken = used.entry(kind).or_default();
        match requested {
            Some(channel) => {
                if !taken.insert(channel) {
                    return Err(BackendError::AddressInUse(channel));
                }
                Ok(channel)
            }
            None => {
                let counter = match kind {
                    TransportKind::Packet => &self.next_packet_psm,
                    _ => &self.next_stream_channel,
                };
                let step = match kind {
                    TransportKind::Packet => 2, // PSMs stay odd
                    _ => 1,
                };
                loop {
                    let candidate = counter.fetch_add(step, Ordering::SeqCst) as u16;
                    if taken.insert(candidate) {
                        return Ok(candidate);
                    }
                }
            }
        }
    }

    fn release_channel(&self, kind: TransportKind, channel: u16) {
        if let Some(taken) = self.used_channels.lock().get_mut(&kind) {
            taken.remove(&channel);
        }
    }
}

impl Default for TcpBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for TcpBackend {
    fn supports(&self, _kind: TransportKind) -> bool {
        true
    }

    async fn open(
        &self,
        kind: TransportKind,
        params: &ServiceParams,
        policy: SecurityPolicy,
    ) -> Result<ListenerInfo, BackendError> {
        let channel = self.allocate_channel(kind, params.requested_channel)?;
        let listener = match TcpListener::bind((self.config.bind_addr, 0)).await {
            Ok(listener) => listener,
            Err(e) => {
                self.release_channel(kind, channel);
                return Err(BackendError::Io(e.to_string()));
            }
        };
        let local_addr = listener
            .local_addr()
            .map_err(|e| BackendError::Io(e.to_string()))?;
        let mtu = match kind {
            TransportKind::Packet => Some(self.config.packet_mtu),
            _ => None,
        };
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (closed_tx, _) = watch::channel(false);
        self.listeners.lock().insert(
            id,
            Arc::new(TcpListenerEntry {
                kind,
                policy,
                channel,
                mtu,
                listener: Arc::new(listener),
                local_addr,
                closed_tx,
                registered_record: Mutex::new(None),
            }),
        );
        info!(
            "TCP backend: {} listener {} on {} as channel {}",
            kind, id, local_addr, channel
        );
        Ok(ListenerInfo { id, channel, mtu })
    }

    async fn close_listener(&self, id: ListenerId) -> Result<(), BackendError> {
        let entry = match self.listeners.lock().remove(&id) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        let _ = entry.closed_tx.send(true);
        self.release_channel(entry.kind, entry.channel);
        entry.registered_record.lock().take();
        debug!("TCP backend: {} closed", id);
        Ok(())
    }

    async fn accept(&self, id: ListenerId) -> Result<Box<dyn BackendSession>, BackendError> {
        let entry = self.entry(id)?;
        let mut closed_rx = entry.closed_tx.subscribe();
        if *closed_rx.borrow() {
            return Err(BackendError::Closed);
        }
        tokio::select! {
            _ = closed_rx.wait_for(|closed| *closed) => Err(BackendError::Closed),
            accepted = entry.listener.accept() => {
                let (stream, peer) = accepted.map_err(|e| BackendError::Transient(e.to_string()))?;
                debug!("TCP backend: {} accepted {}", id, peer);
                Ok(Box::new(TcpSession::new(
                    stream,
                    peer,
                    entry.kind,
                    entry.policy,
                    entry.mtu,
                )))
            }
        }
    }

    async fn update_service_record(
        &self,
        id: ListenerId,
        record: &ServiceRecord,
        during_accept: bool,
    ) -> Result<(), BackendError> {
        let entry = self.entry(id).map_err(|_| {
            BackendError::RegistrationFailed("Listener is closed".to_string())
        })?;
        debug!(
            "TCP backend: record for {} updated (during_accept={})",
            id, during_accept
        );
        *entry.registered_record.lock() = Some(record.clone());
        Ok(())
    }

    async fn max_transfer_unit(
        &self,
        id: ListenerId,
        _direction: Direction,
    ) -> Result<u16, BackendError> {
        let entry = self.entry(id)?;
        entry.mtu.ok_or_else(|| {
            BackendError::Io(format!(
                "Transfer unit is only defined for packet listeners, not {}",
                entry.kind
            ))
        })
    }
}

/// One accepted TCP-emulated session
pub struct TcpSession {
    stream: TcpStream,
    peer: SocketAddr,
    kind: TransportKind,
    security: SecurityAttributes,
    mtu: Option<u16>,
    closed: bool,
}

impl TcpSession {
    fn new(
        stream: TcpStream,
        peer: SocketAddr,
        kind: TransportKind,
        policy: SecurityPolicy,
        mtu: Option<u16>,
    ) -> Self {
        // Emulation: negotiation always lands at the requested policy level.
        let security = SecurityAttributes {
            authenticated: policy.requires_authentication(),
            encrypted: policy.requires_encryption(),
            authorized: false,
        };
        Self {
            stream,
            peer,
            kind,
            security,
            mtu,
            closed: false,
        }
    }

    async fn read_packet(&mut self, buf: &mut [u8]) -> Result<usize, BackendError> {
        let mut len_bytes = [0u8; 2];
        match self.stream.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(0),
            Err(e) => return Err(BackendError::Io(e.to_string())),
        }
        let len = u16::from_le_bytes(len_bytes) as usize;
        if len > buf.len() {
            return Err(BackendError::Io(format!(
                "Receive buffer ({}) smaller than packet ({})",
                buf.len(),
                len
            )));
        }
        self.stream
            .read_exact(&mut buf[..len])
            .await
            .map_err(|e| BackendError::Io(e.to_string()))?;
        Ok(len)
    }
}

#[async_trait]
impl BackendSession for TcpSession {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, BackendError> {
        if self.closed {
            return Err(BackendError::Closed);
        }
        match self.kind {
            TransportKind::Packet => self.read_packet(buf).await,
            _ => self
                .stream
                .read(buf)
                .await
                .map_err(|e| BackendError::Io(e.to_string())),
        }
    }

    async fn write(&mut self, buf: &[u8]) -> Result<(), BackendError> {
        if self.closed {
            return Err(BackendError::Closed);
        }
        if self.kind == TransportKind::Packet {
            let mtu = self.mtu.unwrap_or(u16::MAX) as usize;
            if buf.len() > mtu {
                return Err(BackendError::Io(format!(
                    "Packet ({}) exceeds transfer unit ({})",
                    buf.len(),
                    mtu
                )));
            }
            let len = (buf.len() as u16).to_le_bytes();
            self.stream
                .write_all(&len)
                .await
                .map_err(|e| BackendError::Io(e.to_string()))?;
        }
        self.stream
            .write_all(buf)
            .await
            .map_err(|e| BackendError::Io(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .shutdown()
            .await
            .map_err(|e| BackendError::Io(e.to_string()))
    }

    fn security_attributes(&self) -> SecurityAttributes {
        self.security
    }

    fn peer_address(&self) -> String {
        self.peer.to_string()
    }

    fn transfer_unit(&self) -> Option<u16> {
        self.mtu
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn params() -> ServiceParams {
        ServiceParams::new(Uuid::from_u128(0x1101), "echo-responder")
    }

    #[tokio::test]
    async fn test_channel_allocation_per_kind() {
        let backend = TcpBackend::new();
        let a = backend
            .open(TransportKind::Stream, &params(), SecurityPolicy::None)
            .await
            .expect("Stream listener");
        let b = backend
            .open(TransportKind::Stream, &params(), SecurityPolicy::None)
            .await
            .expect("Second stream listener");
        let c = backend
            .open(TransportKind::Packet, &params(), SecurityPolicy::None)
            .await
            .expect("Packet listener");

        assert_eq!(a.channel, FIRST_STREAM_CHANNEL);
        assert_eq!(b.channel, FIRST_STREAM_CHANNEL + 1);
        assert_eq!(c.channel, FIRST_PACKET_PSM);
        assert_eq!(c.mtu, Some(672));
        assert_eq!(a.mtu, None);
    }

    #[tokio::test]
    async fn test_requested_channel_conflict() {
        let backend = TcpBackend::new();
        let p = params().with_requested_channel(9);
        backend
            .open(TransportKind::Stream, &p, SecurityPolicy::None)
            .await
            .expect("First bind of channel 9");
        let second = backend.open(TransportKind::Stream, &p, SecurityPolicy::None).await;
        assert!(matches!(second.err(), Some(BackendError::AddressInUse(9))));
    }

    #[tokio::test]
    async fn test_channel_released_on_close() {
        let backend = TcpBackend::new();
        let p = params().with_requested_channel(9);
        let info = backend
            .open(TransportKind::Stream, &p, SecurityPolicy::None)
            .await
            .expect("First bind");
        backend.close_listener(info.id).await.expect("Close");
        backend
            .open(TransportKind::Stream, &p, SecurityPolicy::None)
            .await
            .expect("Channel 9 free again");
    }

    #[tokio::test]
    async fn test_double_close_is_noop() {
        let backend = TcpBackend::new();
        let info = backend
            .open(TransportKind::Stream, &params(), SecurityPolicy::None)
            .await
            .expect("Listener");
        backend.close_listener(info.id).await.expect("First close");
        backend.close_listener(info.id).await.expect("Second close");
    }

    #[tokio::test]
    async fn test_max_transfer_unit_only_for_packet() {
        let backend = TcpBackend::new();
        let stream = backend
            .open(TransportKind::Stream, &params(), SecurityPolicy::None)
            .await
            .expect("Stream listener");
        let packet = backend
            .open(TransportKind::Packet, &params(), SecurityPolicy::None)
            .await
            .expect("Packet listener");

        assert!(backend
            .max_transfer_unit(stream.id, Direction::Receive)
            .await
            .is_err());
        assert_eq!(
            backend
                .max_transfer_unit(packet.id, Direction::Receive)
                .await
                .expect("MTU"),
            672
        );
    }
}
