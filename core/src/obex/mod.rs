//! Object-exchange server layer
//!
//! A request/response protocol (connect, get, put, set-path, delete,
//! disconnect) layered on top of an accepted stream session. This module
//! works with already-decoded requests through the [`ObexChannel`] seam;
//! header wire encoding belongs to the protocol collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backend::{BackendError, SecurityAttributes};

pub mod session;

pub use session::{ObexServerSession, ObexSessionState, SessionEnd};

/// Response codes a handler can answer with (HTTP-style, final bit set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseCode {
    /// Request served
    Ok,
    /// Peer must authenticate
    Unauthorized,
    /// Peer is authenticated but not allowed
    Forbidden,
    /// Malformed or out-of-order request
    BadRequest,
    /// Named object does not exist
    NotFound,
    /// Service temporarily unavailable
    Unavailable,
    /// Operation not supported by this handler
    NotImplemented,
}

impl ResponseCode {
    /// Numeric wire value used by the protocol collaborator
    pub fn value(&self) -> u8 {
        match self {
            ResponseCode::Ok => 0xA0,
            ResponseCode::Unauthorized => 0xC1,
            ResponseCode::Forbidden => 0xC3,
            ResponseCode::BadRequest => 0xC0,
            ResponseCode::NotFound => 0xC4,
            ResponseCode::Unavailable => 0xD3,
            ResponseCode::NotImplemented => 0xD1,
        }
    }

    /// Whether this code reports success
    pub fn is_success(&self) -> bool {
        matches!(self, ResponseCode::Ok)
    }
}

/// Which rejection code an unauthenticated Connect receives. Deployed
/// servers disagree on this, so it is policy, not a constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AuthRejection {
    #[default]
    Unauthorized,
    Forbidden,
}

impl AuthRejection {
    /// The response code sent to the peer
    pub fn response_code(&self) -> ResponseCode {
        match self {
            AuthRejection::Unauthorized => ResponseCode::Unauthorized,
            AuthRejection::Forbidden => ResponseCode::Forbidden,
        }
    }
}

/// A decoded object-exchange request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObexRequest {
    Connect,
    Disconnect,
    Get {
        name: Option<String>,
    },
    Put {
        name: Option<String>,
        body: Vec<u8>,
    },
    SetPath {
        name: Option<String>,
        backup: bool,
        create: bool,
    },
    Delete {
        name: Option<String>,
    },
}

/// A response to stream back to the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObexResponse {
    /// Response code
    pub code: ResponseCode,
    /// Optional object body (Get responses)
    pub body: Vec<u8>,
}

impl ObexResponse {
    /// Response with no body
    pub fn code(code: ResponseCode) -> Self {
        Self {
            code,
            body: Vec::new(),
        }
    }

    /// Attach an object body
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }
}

/// Decoded-request seam over one accepted session. Implementations own the
/// framing; the state machine never sees wire bytes.
#[async_trait]
pub trait ObexChannel: Send {
    /// Read the next decoded request. End of stream reports `Closed`.
    async fn read_request(&mut self) -> Result<ObexRequest, BackendError>;

    /// Stream a response back to the peer
    async fn write_response(&mut self, response: ObexResponse) -> Result<(), BackendError>;

    /// Release the underlying session. Idempotent.
    async fn close(&mut self) -> Result<(), BackendError>;

    /// Security attributes of the underlying session
    fn security_attributes(&self) -> SecurityAttributes;

    /// Remote peer identifier
    fn peer_address(&self) -> String;
}

/// Consumer-supplied request handlers. Defaults mirror a bare server:
/// Connect is accepted, operations answer `NotImplemented`.
#[async_trait]
pub trait ObexServerHandler: Send + Sync {
    /// A peer asked to establish an object-exchange session
    async fn on_connect(&self, _peer: &str) -> ResponseCode {
        ResponseCode::Ok
    }

    /// The peer ended an established session
    async fn on_disconnect(&self, _peer: &str) {}

    /// Serve an object. Returns the response code and the object body.
    async fn on_get(&self, _name: Option<&str>) -> (ResponseCode, Vec<u8>) {
        (ResponseCode::NotImplemented, Vec::new())
    }

    /// Store an object
    async fn on_put(&self, _name: Option<&str>, _body: &[u8]) -> ResponseCode {
        ResponseCode::NotImplemented
    }

    /// Change the working folder
    async fn on_set_path(&self, _name: Option<&str>, _backup: bool, _create: bool) -> ResponseCode {
        ResponseCode::NotImplemented
    }

    /// Remove an object
    async fn on_delete(&self, _name: Option<&str>) -> ResponseCode {
        ResponseCode::NotImplemented
    }

    /// A Connect was rejected by the security policy. Informational; the
    /// rejection has already been streamed to the peer.
    async fn on_authentication_failure(&self, _peer: &str) {}
}

/// Object-exchange session policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObexSessionConfig {
    /// Reject Connect from unauthenticated peers
    pub require_authentication: bool,
    /// Rejection code for the authentication failure path
    pub auth_rejection: AuthRejection,
    /// How long an accepted session may sit without a Connect before the
    /// watchdog force-closes it
    pub idle_grace_period: Duration,
}

impl Default for ObexSessionConfig {
    fn default() -> Self {
        Self {
            require_authentication: false,
            auth_rejection: AuthRejection::default(),
            idle_grace_period: Duration::from_secs(30),
        }
    }
}
