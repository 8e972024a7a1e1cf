//! Connection Notifier — server-side connection lifecycle
//!
//! Owns one listening handle per instance, mediates accepts, applies the
//! security policy requested at open time, and republishes the service
//! record lazily: mutations only mark the record dirty, and the push happens
//! in the next accept's pre-accept hook because some backends must quiesce
//! the listener to update advertised attributes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{
    Backend, BackendError, Direction, ListenerInfo, SecurityPolicy, TransportKind,
};
use crate::record::{RecordError, RecordUpdate, ServiceParams, ServiceRecord};
use crate::session::SessionHandle;

/// Errors surfaced by notifier operations
#[derive(Debug, Clone, Error)]
pub enum NotifierError {
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl NotifierError {
    /// Expected termination signals (designed stop path, not failures)
    pub fn is_stop_signal(&self) -> bool {
        matches!(self, NotifierError::Backend(e) if e.is_stop_signal())
    }
}

/// Server-side connection notifier for one listening handle
pub struct ConnectionNotifier {
    backend: Arc<dyn Backend>,
    info: ListenerInfo,
    kind: TransportKind,
    policy: SecurityPolicy,
    /// Single-writer discipline: record mutations and the deferred push in
    /// the pre-accept hook are mutually exclusive under this lock.
    record: Mutex<ServiceRecord>,
    closed: AtomicBool,
}

impl ConnectionNotifier {
    /// Open a listening handle and build its initial service record
    pub async fn open(
        backend: Arc<dyn Backend>,
        kind: TransportKind,
        params: &ServiceParams,
        policy: SecurityPolicy,
    ) -> Result<Self, NotifierError> {
        params.validate()?;
        if !backend.supports(kind) {
            return Err(BackendError::BackendUnavailable(kind).into());
        }
        let info = backend.open(kind, params, policy).await?;
        let record = ServiceRecord::build(params, info.channel)?;
        info!(
            "Opened {} notifier on channel {} as {}",
            kind, info.channel, info.id
        );
        Ok(Self {
            backend,
            info,
            kind,
            policy,
            record: Mutex::new(record),
            closed: AtomicBool::new(false),
        })
    }

    /// Transport kind this notifier listens on
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Security policy requested at open time
    pub fn policy(&self) -> SecurityPolicy {
        self.policy
    }

    /// Backend-assigned listener identifier
    pub fn listener_id(&self) -> crate::backend::ListenerId {
        self.info.id
    }

    /// Channel/PSM assigned by the backend at open time
    pub fn channel(&self) -> u16 {
        self.info.channel
    }

    /// Transfer unit of the listening handle, packet transports only
    pub fn mtu(&self) -> Option<u16> {
        self.info.mtu
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Snapshot of the current service record
    pub async fn service_record(&self) -> ServiceRecord {
        self.record.lock().await.clone()
    }

    /// Query the backend for the listener's maximum transfer unit
    pub async fn max_transfer_unit(&self, direction: Direction) -> Result<u16, NotifierError> {
        Ok(self
            .backend
            .max_transfer_unit(self.info.id, direction)
            .await?)
    }

    /// Block until a peer connects or the handle is closed.
    ///
    /// The pre-accept hook pushes a dirty service record exactly once per
    /// mutation batch before the backend wait begins. Security attributes on
    /// the returned session come from the backend at accept time.
    pub async fn accept(&self) -> Result<SessionHandle, NotifierError> {
        if self.is_closed() {
            return Err(BackendError::Closed.into());
        }

        {
            let mut record = self.record.lock().await;
            if record.is_dirty() {
                debug!("Pushing deferred service record update for {}", self.info.id);
                self.backend
                    .update_service_record(self.info.id, &record, true)
                    .await?;
                record.clear_dirty();
            }
        }

        match self.backend.accept(self.info.id).await {
            Ok(io) => {
                let session = SessionHandle::new(io);
                debug!(
                    "Accepted {} session from {}",
                    self.kind,
                    session.peer_address()
                );
                Ok(session)
            }
            // A fault racing a concurrent close is the designed stop path,
            // not a backend failure.
            Err(e) if self.is_closed() => {
                debug!("Accept on {} ended by close: {}", self.info.id, e);
                Err(BackendError::Closed.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Apply a record mutation and mark the record dirty. The backend push
    /// is deferred to the next accept cycle; nothing is written here.
    pub async fn update_service_record(&self, update: &RecordUpdate) -> Result<(), NotifierError> {
        if self.is_closed() {
            return Err(BackendError::Closed.into());
        }
        let mut record = self.record.lock().await;
        record.apply_update(update)?;
        debug!("Service record for {} marked dirty", self.info.id);
        Ok(())
    }

    /// Close the listening handle and unregister the service record.
    /// Idempotent and safe to call concurrently with an in-flight accept,
    /// which observes the close and returns `Closed`.
    pub async fn close(&self) -> Result<(), NotifierError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing {} notifier {}", self.kind, self.info.id);
        if let Err(e) = self.backend.close_listener(self.info.id).await {
            warn!("Backend close for {} reported: {}", self.info.id, e);
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockAcceptOutcome, MockBackend, MockSession};
    use crate::backend::SecurityAttributes;
    use tokio_test::{assert_pending, task};
    use uuid::Uuid;

    fn params() -> ServiceParams {
        ServiceParams::new(Uuid::from_u128(0x1101), "echo-responder")
    }

    async fn open_stream(backend: Arc<MockBackend>) -> ConnectionNotifier {
        ConnectionNotifier::open(backend, TransportKind::Stream, &params(), SecurityPolicy::None)
            .await
            .expect("Notifier opens")
    }

    #[tokio::test]
    async fn test_open_unsupported_kind() {
        let backend = Arc::new(MockBackend::new().without(TransportKind::Packet));
        let result = ConnectionNotifier::open(
            backend,
            TransportKind::Packet,
            &params(),
            SecurityPolicy::None,
        )
        .await;
        assert!(matches!(
            result.err(),
            Some(NotifierError::Backend(BackendError::BackendUnavailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_params() {
        let backend = Arc::new(MockBackend::new());
        let mut bad = params();
        bad.name = String::new();
        let result =
            ConnectionNotifier::open(backend, TransportKind::Stream, &bad, SecurityPolicy::None)
                .await;
        assert!(matches!(
            result.err(),
            Some(NotifierError::Record(RecordError::InvalidParameters(_)))
        ));
    }

    #[tokio::test]
    async fn test_open_address_in_use() {
        let backend = Arc::new(MockBackend::new());
        let p = params().with_requested_channel(5);
        let _first =
            ConnectionNotifier::open(backend.clone(), TransportKind::Stream, &p, SecurityPolicy::None)
                .await
                .expect("First listener binds channel 5");
        let second =
            ConnectionNotifier::open(backend, TransportKind::Stream, &p, SecurityPolicy::None).await;
        assert!(matches!(
            second.err(),
            Some(NotifierError::Backend(BackendError::AddressInUse(5)))
        ));
    }

    #[tokio::test]
    async fn test_record_channel_matches_backend_assignment() {
        let backend = Arc::new(MockBackend::new());
        let notifier = open_stream(backend).await;
        let record = notifier.service_record().await;
        assert_eq!(record.channel(), notifier.channel());
    }

    #[tokio::test]
    async fn test_accept_queries_security_at_accept_time() {
        let backend = Arc::new(MockBackend::new());
        backend.script_accept(MockAcceptOutcome::Session(
            MockSession::new("peer-a").with_security(SecurityAttributes {
                authenticated: true,
                encrypted: true,
                authorized: false,
            }),
        ));
        // Listener policy is None, but the backend renegotiated upward.
        let notifier = open_stream(backend).await;
        let session = notifier.accept().await.expect("Accept succeeds");
        assert!(session.security_attributes().authenticated);
        assert!(session.security_attributes().encrypted);
    }

    #[tokio::test]
    async fn test_deferred_push_happens_once_per_batch() {
        let backend = Arc::new(MockBackend::new());
        let notifier = open_stream(backend.clone()).await;

        notifier
            .update_service_record(&RecordUpdate::rename("echo-v2"))
            .await
            .expect("First mutation");
        notifier
            .update_service_record(&RecordUpdate::rename("echo-v3"))
            .await
            .expect("Second mutation in the same batch");
        assert!(notifier.service_record().await.is_dirty());
        assert!(backend.record_pushes().is_empty());

        backend.script_accept(MockAcceptOutcome::Session(MockSession::new("peer-a")));
        let _session = notifier.accept().await.expect("Accept succeeds");

        let pushes = backend.record_pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].0.name, "echo-v3");
        assert!(pushes[0].1, "Push flagged as during-accept");
        assert!(!notifier.service_record().await.is_dirty());

        // A clean record stays clean across further accepts.
        backend.script_accept(MockAcceptOutcome::Session(MockSession::new("peer-b")));
        let _session = notifier.accept().await.expect("Second accept");
        assert_eq!(backend.record_pushes().len(), 1);
    }

    #[tokio::test]
    async fn test_immutable_channel_rejected_and_record_untouched() {
        let backend = Arc::new(MockBackend::new());
        let notifier = open_stream(backend).await;
        let assigned = notifier.channel();

        let update = RecordUpdate {
            channel: Some(assigned + 4),
            ..RecordUpdate::default()
        };
        let err = notifier.update_service_record(&update).await.unwrap_err();
        assert!(matches!(
            err,
            NotifierError::Record(RecordError::ImmutableChannelViolation { .. })
        ));
        let record = notifier.service_record().await;
        assert_eq!(record.channel(), assigned);
        assert!(!record.is_dirty());
    }

    #[tokio::test]
    async fn test_concurrent_close_unblocks_accept() {
        let backend = Arc::new(MockBackend::new());
        backend.script_accept(MockAcceptOutcome::BlockUntilClosed);
        let notifier = open_stream(backend).await;

        let mut accept = task::spawn(notifier.accept());
        assert_pending!(accept.poll());

        notifier.close().await.expect("Close");
        assert!(accept.is_woken(), "Close wakes the parked accept");

        let result = accept.await;
        assert!(matches!(
            result.err(),
            Some(NotifierError::Backend(BackendError::Closed))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let backend = Arc::new(MockBackend::new());
        let notifier = open_stream(backend.clone()).await;
        let id = crate::backend::ListenerId(1);

        notifier.close().await.expect("First close");
        notifier.close().await.expect("Second close is a no-op");
        assert_eq!(backend.close_calls(id), 1);
        assert!(notifier.is_closed());
    }

    #[tokio::test]
    async fn test_accept_after_close_is_closed() {
        let backend = Arc::new(MockBackend::new());
        let notifier = open_stream(backend).await;
        notifier.close().await.expect("Close");
        assert!(matches!(
            notifier.accept().await.err(),
            Some(NotifierError::Backend(BackendError::Closed))
        ));
    }

    #[tokio::test]
    async fn test_update_after_close_is_closed() {
        let backend = Arc::new(MockBackend::new());
        let notifier = open_stream(backend).await;
        notifier.close().await.expect("Close");
        let result = notifier
            .update_service_record(&RecordUpdate::rename("late"))
            .await;
        assert!(matches!(
            result.err(),
            Some(NotifierError::Backend(BackendError::Closed))
        ));
    }
}
