//! Backend Interface — the contract every native transport driver satisfies
//!
//! The notifier layer never talks to a concrete stack driver directly. Every
//! driver (native Bluetooth stack, TCP loopback emulation, test mock) is an
//! implementation of the [`Backend`] trait, and accepted connections are
//! handed back as boxed [`BackendSession`] objects.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::record::{ServiceParams, ServiceRecord};

pub mod tcp;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

/// Transport kinds a backend may offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// RFCOMM-like stream socket
    Stream,
    /// Packet-oriented channel socket with a fixed transfer unit
    Packet,
    /// Object-exchange protocol layered on a stream session
    ObjectExchange,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stream => write!(f, "stream"),
            TransportKind::Packet => write!(f, "packet"),
            TransportKind::ObjectExchange => write!(f, "object-exchange"),
        }
    }
}

/// Security policy requested when a listener is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SecurityPolicy {
    /// No authentication or encryption required
    #[default]
    None,
    /// Peers must be authenticated
    Authenticate,
    /// Peers must be authenticated and the link encrypted
    AuthenticateEncrypt,
}

impl SecurityPolicy {
    /// Whether this policy requires an authenticated peer
    pub fn requires_authentication(&self) -> bool {
        !matches!(self, SecurityPolicy::None)
    }

    /// Whether this policy requires link encryption
    pub fn requires_encryption(&self) -> bool {
        matches!(self, SecurityPolicy::AuthenticateEncrypt)
    }
}

/// Security attributes negotiated for one accepted session
///
/// Queried from the backend at accept time; some backends renegotiate per
/// connection, so these are never assumed from the listener's policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SecurityAttributes {
    /// Peer completed authentication
    pub authenticated: bool,
    /// Link is encrypted
    pub encrypted: bool,
    /// Peer was authorized for this service
    pub authorized: bool,
}

/// Direction of a transfer-unit query on a packet transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Largest packet this side can receive
    Receive,
    /// Largest packet this side can transmit
    Transmit,
}

/// Opaque backend-assigned listener identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Result of opening a listener
#[derive(Debug, Clone)]
pub struct ListenerInfo {
    /// Backend-assigned identifier
    pub id: ListenerId,
    /// Channel (stream) or PSM (packet) assigned at open time; immutable
    pub channel: u16,
    /// Transfer unit for packet transports
    pub mtu: Option<u16>,
}

/// Errors surfaced across the backend boundary
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("Transport not supported by this backend: {0}")]
    BackendUnavailable(TransportKind),
    #[error("Requested channel/PSM already in use: {0}")]
    AddressInUse(u16),
    #[error("Wait was cancelled")]
    Interrupted,
    #[error("Handle is closed")]
    Closed,
    #[error("Transient backend fault: {0}")]
    Transient(String),
    #[error("Service record registration failed: {0}")]
    RegistrationFailed(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl BackendError {
    /// Expected termination signals, never logged as failures
    pub fn is_stop_signal(&self) -> bool {
        matches!(self, BackendError::Interrupted | BackendError::Closed)
    }
}

/// One accepted, bidirectional connection as the backend exposes it
#[async_trait]
pub trait BackendSession: Send {
    /// Read up to `buf.len()` bytes. On a packet transport, one call reads
    /// one packet. Returns 0 at end of stream.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, BackendError>;

    /// Write the whole buffer (one packet on a packet transport).
    async fn write(&mut self, buf: &[u8]) -> Result<(), BackendError>;

    /// Release the connection. Idempotent; in-flight reads and writes fail
    /// promptly with [`BackendError::Closed`].
    async fn close(&mut self) -> Result<(), BackendError>;

    /// Security attributes negotiated for this session
    fn security_attributes(&self) -> SecurityAttributes;

    /// Remote peer identifier
    fn peer_address(&self) -> String;

    /// Per-session transfer unit, packet transports only
    fn transfer_unit(&self) -> Option<u16>;
}

/// Native transport driver contract
#[async_trait]
pub trait Backend: Send + Sync {
    /// Whether this backend can open listeners of the given kind
    fn supports(&self, kind: TransportKind) -> bool;

    /// Open a listening handle and assign its channel/PSM
    async fn open(
        &self,
        kind: TransportKind,
        params: &ServiceParams,
        policy: SecurityPolicy,
    ) -> Result<ListenerInfo, BackendError>;

    /// Close a listener and unregister its service record. Idempotent;
    /// wakes any task blocked in [`Backend::accept`] on the same listener.
    async fn close_listener(&self, id: ListenerId) -> Result<(), BackendError>;

    /// Block until a peer connects or the listener is closed
    async fn accept(&self, id: ListenerId) -> Result<Box<dyn BackendSession>, BackendError>;

    /// Push an updated service record to the advertisement store.
    /// `during_accept` tells the driver it may quiesce the listener briefly.
    async fn update_service_record(
        &self,
        id: ListenerId,
        record: &ServiceRecord,
        during_accept: bool,
    ) -> Result<(), BackendError>;

    /// Maximum transfer unit for a packet listener
    async fn max_transfer_unit(
        &self,
        id: ListenerId,
        direction: Direction,
    ) -> Result<u16, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_display() {
        assert_eq!(TransportKind::Stream.to_string(), "stream");
        assert_eq!(TransportKind::Packet.to_string(), "packet");
        assert_eq!(TransportKind::ObjectExchange.to_string(), "object-exchange");
    }

    #[test]
    fn test_security_policy_none() {
        let policy = SecurityPolicy::None;
        assert!(!policy.requires_authentication());
        assert!(!policy.requires_encryption());
    }

    #[test]
    fn test_security_policy_authenticate() {
        let policy = SecurityPolicy::Authenticate;
        assert!(policy.requires_authentication());
        assert!(!policy.requires_encryption());
    }

    #[test]
    fn test_security_policy_authenticate_encrypt() {
        let policy = SecurityPolicy::AuthenticateEncrypt;
        assert!(policy.requires_authentication());
        assert!(policy.requires_encryption());
    }

    #[test]
    fn test_stop_signals() {
        assert!(BackendError::Interrupted.is_stop_signal());
        assert!(BackendError::Closed.is_stop_signal());
        assert!(!BackendError::Transient("radio reset".to_string()).is_stop_signal());
        assert!(!BackendError::Io("broken pipe".to_string()).is_stop_signal());
    }

    #[test]
    fn test_listener_id_display() {
        assert_eq!(ListenerId(7).to_string(), "listener-7");
    }
}
