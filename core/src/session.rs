//! Session Handle — one accepted, bidirectional connection
//!
//! Returned by a successful accept and owned exclusively by the consumer it
//! was dispatched to; the notifier keeps no reference after hand-off. Close
//! is idempotent, and in-flight reads and writes on a closed session fail
//! promptly instead of hanging.

use tracing::debug;

use crate::backend::{BackendError, BackendSession, SecurityAttributes};

/// One accepted connection. Deliberately not `Clone`: single-owner semantics.
pub struct SessionHandle {
    io: Box<dyn BackendSession>,
    security: SecurityAttributes,
    peer: String,
    transfer_unit: Option<u16>,
    closed: bool,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("security", &self.security)
            .field("peer", &self.peer)
            .field("transfer_unit", &self.transfer_unit)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}


impl SessionHandle {
    /// Wrap a backend session, capturing its negotiated attributes
    pub fn new(io: Box<dyn BackendSession>) -> Self {
        let security = io.security_attributes();
        let peer = io.peer_address();
        let transfer_unit = io.transfer_unit();
        Self {
            io,
            security,
            peer,
            transfer_unit,
            closed: false,
        }
    }

    /// Security attributes queried from the backend at accept time
    pub fn security_attributes(&self) -> SecurityAttributes {
        self.security
    }

    /// Remote peer identifier
    pub fn peer_address(&self) -> &str {
        &self.peer
    }

    /// Per-session transfer unit, packet transports only
    pub fn transfer_unit(&self) -> Option<u16> {
        self.transfer_unit
    }

    /// Whether the consumer already closed this session
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Read from the session. One call reads one packet on a packet
    /// transport; returns 0 at end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, BackendError> {
        if self.closed {
            return Err(BackendError::Closed);
        }
        self.io.read(buf).await
    }

    /// Write the whole buffer (one packet on a packet transport)
    pub async fn write(&mut self, buf: &[u8]) -> Result<(), BackendError> {
        if self.closed {
            return Err(BackendError::Closed);
        }
        self.io.write(buf).await
    }

    /// Release the connection. The second and later calls are no-ops.
    pub async fn close(&mut self) -> Result<(), BackendError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!("Session to {} closed", self.peer);
        self.io.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSession {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BackendSession for CountingSession {
        async fn read(&mut self, _buf: &mut [u8]) -> Result<usize, BackendError> {
            Ok(0)
        }

        async fn write(&mut self, _buf: &[u8]) -> Result<(), BackendError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), BackendError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn security_attributes(&self) -> SecurityAttributes {
            SecurityAttributes {
                authenticated: true,
                encrypted: false,
                authorized: false,
            }
        }

        fn peer_address(&self) -> String {
            "peer-1".to_string()
        }

        fn transfer_unit(&self) -> Option<u16> {
            Some(672)
        }
    }

    #[tokio::test]
    async fn test_double_close_releases_backend_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut session = SessionHandle::new(Box::new(CountingSession {
            closes: closes.clone(),
        }));

        session.close().await.expect("First close");
        session.close().await.expect("Second close is a no-op");
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_io_after_close_fails_promptly() {
        let mut session = SessionHandle::new(Box::new(CountingSession {
            closes: Arc::new(AtomicUsize::new(0)),
        }));
        session.close().await.expect("Close");

        let mut buf = [0u8; 8];
        assert!(matches!(
            session.read(&mut buf).await,
            Err(BackendError::Closed)
        ));
        assert!(matches!(
            session.write(b"x").await,
            Err(BackendError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_attributes_captured_at_accept() {
        let session = SessionHandle::new(Box::new(CountingSession {
            closes: Arc::new(AtomicUsize::new(0)),
        }));
        assert!(session.security_attributes().authenticated);
        assert!(!session.security_attributes().encrypted);
        assert_eq!(session.peer_address(), "peer-1");
        assert_eq!(session.transfer_unit(), Some(672));
    }
}
