//! Accept Loop Driver — retry, backoff and termination policy
//!
//! One blocking accept loop per listening handle, running as a spawned task.
//! The retry-with-threshold-then-give-up policy tolerates transient backend
//! hiccups without looping forever on a dead listening handle, and the
//! listener is closed exactly once on every exit path.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::notifier::ConnectionNotifier;
use crate::session::SessionHandle;

/// Consecutive accept failures tolerated before the loop gives up
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 4;

/// How accepted sessions are handed to the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DispatchPolicy {
    /// Handle each session on the accept loop's own task, serializing all
    /// connection handling for this listener
    #[default]
    Serial,
    /// Spawn an independent task per session; the consumer must be
    /// reentrant-safe and no ordering is guaranteed between sessions
    AcceptWhileBusy,
}

/// Accept loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptConfig {
    /// Error threshold: the loop stops once the consecutive-error counter
    /// exceeds this value
    pub max_consecutive_errors: u32,
    /// Session dispatch policy
    pub dispatch: DispatchPolicy,
}

impl Default for AcceptConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
            dispatch: DispatchPolicy::Serial,
        }
    }
}

/// Per-connection consumer. Receives exclusive ownership of each accepted
/// session and is responsible for closing it.
#[async_trait]
pub trait SessionConsumer: Send + Sync + 'static {
    async fn handle_session(&self, session: SessionHandle);
}

/// Observable accept loop state
#[derive(Debug, Default)]
pub struct AcceptLoopState {
    running: AtomicBool,
    stop_requested: AtomicBool,
    consecutive_errors: AtomicU32,
}

impl AcceptLoopState {
    fn record_success(&self) {
        self.consecutive_errors.store(0, Ordering::SeqCst);
    }

    fn record_failure(&self) -> u32 {
        self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// A running server: one accept loop wrapped around one notifier
pub struct AcceptServer {
    notifier: Arc<ConnectionNotifier>,
    state: Arc<AcceptLoopState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AcceptServer {
    /// Spawn the accept loop for an open notifier
    pub fn start(
        notifier: Arc<ConnectionNotifier>,
        consumer: Arc<dyn SessionConsumer>,
        config: AcceptConfig,
    ) -> Self {
        let state = Arc::new(AcceptLoopState::default());
        state.running.store(true, Ordering::SeqCst);

        let loop_notifier = notifier.clone();
        let loop_state = state.clone();
        let task = tokio::spawn(async move {
            run_accept_loop(loop_notifier, consumer, config, loop_state).await;
        });

        Self {
            notifier,
            state,
            task: Mutex::new(Some(task)),
        }
    }

    /// Whether the accept loop is still alive. Becomes false once the loop
    /// exceeds its error threshold or stop was requested; the server never
    /// auto-restarts.
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Current consecutive-error count
    pub fn consecutive_errors(&self) -> u32 {
        self.state.consecutive_errors.load(Ordering::SeqCst)
    }

    /// The notifier this server accepts on
    pub fn notifier(&self) -> &Arc<ConnectionNotifier> {
        &self.notifier
    }

    /// Request graceful shutdown. Returns once the accept loop has exited
    /// and the listening handle is closed. Safe to call more than once.
    pub async fn stop(&self) {
        self.state.stop_requested.store(true, Ordering::SeqCst);
        // Closing the notifier unblocks a wait parked in accept.
        if let Err(e) = self.notifier.close().await {
            warn!("Close during stop reported: {}", e);
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Accept loop task ended abnormally: {}", e);
            }
        }
    }
}

async fn run_accept_loop(
    notifier: Arc<ConnectionNotifier>,
    consumer: Arc<dyn SessionConsumer>,
    config: AcceptConfig,
    state: Arc<AcceptLoopState>,
) {
    info!(
        "Accept loop started on {} channel {}",
        notifier.kind(),
        notifier.channel()
    );

    while !state.stop_requested.load(Ordering::SeqCst) {
        match notifier.accept().await {
            Ok(session) => {
                state.record_success();
                debug!("Dispatching session from {}", session.peer_address());
                match config.dispatch {
                    DispatchPolicy::Serial => consumer.handle_session(session).await,
                    DispatchPolicy::AcceptWhileBusy => {
                        let consumer = consumer.clone();
                        tokio::spawn(async move {
                            consumer.handle_session(session).await;
                        });
                    }
                }
            }
            Err(e) if e.is_stop_signal() => {
                debug!("Accept loop on {} stopping: {}", notifier.kind(), e);
                break;
            }
            Err(e) => {
                let errors = state.record_failure();
                if errors > config.max_consecutive_errors {
                    error!(
                        "Accept failed {} consecutive times, giving up: {}",
                        errors, e
                    );
                    break;
                }
                warn!(
                    "Accept failed ({}/{}), retrying: {}",
                    errors, config.max_consecutive_errors, e
                );
            }
        }
    }

    // Scoped-acquisition guarantee: the listener is closed on every exit
    // path, and close itself is idempotent.
    if let Err(e) = notifier.close().await {
        warn!("Close on loop exit reported: {}", e);
    }
    state.running.store(false, Ordering::SeqCst);
    info!("Accept loop on {} finished", notifier.kind());
}
