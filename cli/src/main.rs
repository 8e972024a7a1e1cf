// blueport — test responder server over the TCP loopback backend
//
// Runs an echo responder (stream/packet) or a demo object-exchange handler
// so the notifier stack can be exercised end to end without native hardware.

mod codec;

use anyhow::{Context, Result};
use async_trait::async_trait;
use blueport_core::backend::tcp::TcpBackend;
use blueport_core::{
    AcceptConfig, AcceptServer, AuthRejection, ConnectionNotifier, DispatchPolicy,
    ObexServerHandler, ObexServerSession, ObexSessionConfig, ResponseCode, SecurityPolicy,
    ServiceParams, SessionConsumer, SessionHandle, TransportKind,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "blueport")]
#[command(about = "Blueport test responder server", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a responder server until Ctrl-C
    Serve {
        /// Transport kind to listen on
        #[arg(long, value_enum, default_value = "stream")]
        transport: TransportArg,
        /// Request a specific channel/PSM instead of a backend-assigned one
        #[arg(long)]
        channel: Option<u16>,
        /// Advertised service name
        #[arg(long, default_value = "blueport-responder")]
        name: String,
        /// Require authenticated peers
        #[arg(long)]
        authenticate: bool,
        /// Require authentication and link encryption
        #[arg(long)]
        encrypt: bool,
        /// Spawn a task per session instead of serializing handling
        #[arg(long)]
        accept_while_busy: bool,
        /// Answer rejected Connects with Forbidden instead of Unauthorized
        #[arg(long)]
        reject_with_forbidden: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransportArg {
    Stream,
    Packet,
    Obex,
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Stream => TransportKind::Stream,
            TransportArg::Packet => TransportKind::Packet,
            TransportArg::Obex => TransportKind::ObjectExchange,
        }
    }
}

/// Echoes every read back to the peer
struct EchoConsumer;

#[async_trait]
impl SessionConsumer for EchoConsumer {
    async fn handle_session(&self, mut session: SessionHandle) {
        info!(
            "Session from {} (attrs {:?})",
            session.peer_address(),
            session.security_attributes()
        );
        let mut buf = vec![0u8; session.transfer_unit().unwrap_or(1024) as usize];
        loop {
            match session.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    info!("| {} ({} bytes)", String::from_utf8_lossy(&buf[..n]), n);
                    if let Err(e) = session.write(&buf[..n]).await {
                        warn!("Echo write failed: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    warn!("Session read ended: {}", e);
                    break;
                }
            }
        }
        let _ = session.close().await;
    }
}

/// Demo object-exchange handler: Get answers a greeting, Put logs the body
struct ResponderHandler;

#[async_trait]
impl ObexServerHandler for ResponderHandler {
    async fn on_connect(&self, peer: &str) -> ResponseCode {
        info!("Object-exchange connect from {}", peer);
        ResponseCode::Ok
    }

    async fn on_disconnect(&self, peer: &str) {
        info!("Object-exchange disconnect from {}", peer);
    }

    async fn on_get(&self, name: Option<&str>) -> (ResponseCode, Vec<u8>) {
        let mut message = String::from("Hello client!");
        if let Some(name) = name {
            message.push_str(&format!(" You asked for [{}]", name));
        }
        (ResponseCode::Ok, message.into_bytes())
    }

    async fn on_put(&self, name: Option<&str>, body: &[u8]) -> ResponseCode {
        info!(
            "Put {} ({} bytes): {}",
            name.unwrap_or("-"),
            body.len(),
            String::from_utf8_lossy(body)
        );
        ResponseCode::Ok
    }

    async fn on_authentication_failure(&self, peer: &str) {
        warn!("Rejected unauthenticated connect from {}", peer);
    }
}

/// Runs the object-exchange state machine over each accepted session
struct ObexConsumer {
    config: ObexSessionConfig,
}

#[async_trait]
impl SessionConsumer for ObexConsumer {
    async fn handle_session(&self, session: SessionHandle) {
        let channel = codec::FramedObexChannel::new(session);
        let session = ObexServerSession::new(channel, Arc::new(ResponderHandler), self.config.clone());
        let end = session.run().await;
        info!("Object-exchange session ended: {:?}", end);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            transport,
            channel,
            name,
            authenticate,
            encrypt,
            accept_while_busy,
            reject_with_forbidden,
        } => {
            let policy = if encrypt {
                SecurityPolicy::AuthenticateEncrypt
            } else if authenticate {
                SecurityPolicy::Authenticate
            } else {
                SecurityPolicy::None
            };

            let mut params = ServiceParams::new(Uuid::new_v4(), name);
            if let Some(channel) = channel {
                params = params.with_requested_channel(channel);
            }

            let kind: TransportKind = transport.into();
            let backend = Arc::new(TcpBackend::new());
            let notifier = Arc::new(
                ConnectionNotifier::open(backend.clone(), kind, &params, policy)
                    .await
                    .context("Failed to open listener")?,
            );
            let addr = backend
                .local_addr(notifier.listener_id())
                .context("Listener has no local address")?;
            info!(
                "Listening for {} connections on {} (channel {})",
                kind,
                addr,
                notifier.channel()
            );

            let consumer: Arc<dyn SessionConsumer> = match kind {
                TransportKind::ObjectExchange => Arc::new(ObexConsumer {
                    config: ObexSessionConfig {
                        require_authentication: policy.requires_authentication(),
                        auth_rejection: if reject_with_forbidden {
                            AuthRejection::Forbidden
                        } else {
                            AuthRejection::Unauthorized
                        },
                        ..ObexSessionConfig::default()
                    },
                }),
                _ => Arc::new(EchoConsumer),
            };

            let config = AcceptConfig {
                dispatch: if accept_while_busy {
                    DispatchPolicy::AcceptWhileBusy
                } else {
                    DispatchPolicy::Serial
                },
                ..AcceptConfig::default()
            };
            let server = AcceptServer::start(notifier, consumer, config);

            tokio::signal::ctrl_c()
                .await
                .context("Failed to wait for Ctrl-C")?;
            info!("Shutting down");
            server.stop().await;
        }
    }
    Ok(())
}
