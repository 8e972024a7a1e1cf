//! blueport-core — server-side short-range wireless connection lifecycle
//!
//! A uniform connection API over behaviorally-divergent transport backends:
//! stream sockets, packet-oriented channel sockets, and an object-exchange
//! protocol layered on top of either. This crate owns accepting inbound
//! connections, publishing and lazily synchronizing service discovery
//! records, negotiating per-connection security attributes, the accept-time
//! retry/backoff policy, and clean teardown under concurrent close.
//!
//! Discovery (scanning for remote devices), pairing/bonding, and protocol
//! header wire formats stay with the backend drivers.

pub mod acceptor;
pub mod backend;
pub mod notifier;
pub mod obex;
pub mod record;
pub mod session;

pub use acceptor::{
    AcceptConfig, AcceptServer, DispatchPolicy, SessionConsumer, DEFAULT_MAX_CONSECUTIVE_ERRORS,
};
pub use backend::{
    Backend, BackendError, BackendSession, Direction, ListenerId, ListenerInfo,
    SecurityAttributes, SecurityPolicy, TransportKind,
};
pub use notifier::{ConnectionNotifier, NotifierError};
pub use obex::{
    AuthRejection, ObexChannel, ObexRequest, ObexResponse, ObexServerHandler, ObexServerSession,
    ObexSessionConfig, ResponseCode, SessionEnd,
};
pub use record::{RecordError, RecordUpdate, ServiceParams, ServiceRecord};
pub use session::SessionHandle;
