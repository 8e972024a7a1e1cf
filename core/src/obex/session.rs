//! Object-exchange server session state machine
//!
//! `Idle -> Connected -> {Serving, Disconnecting} -> Closed`, with an
//! unauthenticated-timeout watchdog while Idle: if no Connect arrives within
//! the grace period after the stream was accepted, the session is
//! force-closed. The watchdog deadline is fixed at accept time and is not
//! extended by rejected Connect attempts.

use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ObexChannel, ObexRequest, ObexResponse, ObexServerHandler, ObexSessionConfig};
use crate::backend::BackendError;

/// Observable session states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObexSessionState {
    /// Stream accepted, no Connect yet; watchdog armed
    Idle,
    /// Connect accepted
    Connected,
    /// Dispatching a request to the handler
    Serving,
    /// Disconnect received, winding down
    Disconnecting,
    /// Session released
    Closed,
}

/// Why a session ended
#[derive(Debug)]
pub enum SessionEnd {
    /// Peer sent Disconnect
    Disconnected,
    /// No Connect arrived within the grace period
    WatchdogExpired,
    /// Backend I/O fault (includes the peer dropping the stream)
    IoError(BackendError),
}

/// Drives one object-exchange session over a decoded-request channel
pub struct ObexServerSession<C: ObexChannel> {
    channel: C,
    handler: Arc<dyn ObexServerHandler>,
    config: ObexSessionConfig,
    state: ObexSessionState,
}

impl<C: ObexChannel> ObexServerSession<C> {
    /// Wrap an accepted channel. The session starts Idle; the watchdog is
    /// armed when [`run`](Self::run) is entered.
    pub fn new(channel: C, handler: Arc<dyn ObexServerHandler>, config: ObexSessionConfig) -> Self {
        Self {
            channel,
            handler,
            config,
            state: ObexSessionState::Idle,
        }
    }

    /// Run the session to completion. The channel is always closed before
    /// returning, whatever the exit path.
    pub async fn run(mut self) -> SessionEnd {
        let peer = self.channel.peer_address();
        info!("Object-exchange session with {} accepted", peer);
        let end = self.serve(&peer).await;
        self.state = ObexSessionState::Closed;
        if let Err(e) = self.channel.close().await {
            warn!("Session close for {} reported: {}", peer, e);
        }
        debug!("Session with {} ended: {:?}", peer, end);
        end
    }

    async fn serve(&mut self, peer: &str) -> SessionEnd {
        // Deadline fixed at accept time, per the watchdog contract.
        let deadline = Instant::now() + self.config.idle_grace_period;

        while self.state == ObexSessionState::Idle {
            let request = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("No Connect from {} within grace period, force-closing", peer);
                    return SessionEnd::WatchdogExpired;
                }
                request = self.channel.read_request() => match request {
                    Ok(request) => request,
                    Err(e) => return SessionEnd::IoError(e),
                },
            };

            match request {
                ObexRequest::Connect => {
                    if let Err(e) = self.handle_connect(peer).await {
                        return SessionEnd::IoError(e);
                    }
                }
                ObexRequest::Disconnect => {
                    // Never connected; treat as the peer giving up.
                    let _ = self
                        .channel
                        .write_response(ObexResponse::code(super::ResponseCode::Ok))
                        .await;
                    return SessionEnd::Disconnected;
                }
                other => {
                    debug!("Request {:?} from {} before Connect", other, peer);
                    if let Err(e) = self
                        .channel
                        .write_response(ObexResponse::code(super::ResponseCode::BadRequest))
                        .await
                    {
                        return SessionEnd::IoError(e);
                    }
                }
            }
        }

        // Connected: the watchdog is gone, requests are dispatched until
        // Disconnect or an I/O fault.
        loop {
            let request = match self.channel.read_request().await {
                Ok(request) => request,
                Err(e) => return SessionEnd::IoError(e),
            };

            self.state = ObexSessionState::Serving;
            let response = match &request {
                ObexRequest::Connect => {
                    debug!("Duplicate Connect from {}", peer);
                    ObexResponse::code(super::ResponseCode::BadRequest)
                }
                ObexRequest::Disconnect => {
                    self.state = ObexSessionState::Disconnecting;
                    self.handler.on_disconnect(peer).await;
                    if let Err(e) = self
                        .channel
                        .write_response(ObexResponse::code(super::ResponseCode::Ok))
                        .await
                    {
                        return SessionEnd::IoError(e);
                    }
                    return SessionEnd::Disconnected;
                }
                ObexRequest::Get { name } => {
                    let (code, body) = self.handler.on_get(name.as_deref()).await;
                    ObexResponse::code(code).with_body(body)
                }
                ObexRequest::Put { name, body } => {
                    let code = self.handler.on_put(name.as_deref(), body).await;
                    ObexResponse::code(code)
                }
                ObexRequest::SetPath {
                    name,
                    backup,
                    create,
                } => {
                    let code = self
                        .handler
                        .on_set_path(name.as_deref(), *backup, *create)
                        .await;
                    ObexResponse::code(code)
                }
                ObexRequest::Delete { name } => {
                    let code = self.handler.on_delete(name.as_deref()).await;
                    ObexResponse::code(code)
                }
            };

            self.state = ObexSessionState::Connected;
            if let Err(e) = self.channel.write_response(response).await {
                return SessionEnd::IoError(e);
            }
        }
    }

    /// Connect while Idle: apply the security policy, then ask the handler.
    /// An authentication rejection answers the peer but keeps the stream
    /// open, so the peer may retry within the same watchdog window.
    async fn handle_connect(&mut self, peer: &str) -> Result<(), BackendError> {
        if self.config.require_authentication
            && !self.channel.security_attributes().authenticated
        {
            info!("Rejecting unauthenticated Connect from {}", peer);
            self.handler.on_authentication_failure(peer).await;
            return self
                .channel
                .write_response(ObexResponse::code(
                    self.config.auth_rejection.response_code(),
                ))
                .await;
        }

        let code = self.handler.on_connect(peer).await;
        self.channel
            .write_response(ObexResponse::code(code))
            .await?;
        if code.is_success() {
            debug!("Session with {} connected", peer);
            self.state = ObexSessionState::Connected;
        }
        Ok(())
    }
}
