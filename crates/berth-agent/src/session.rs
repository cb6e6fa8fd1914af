//! One session against the orchestrator: handshake, then the frame pump.
//!
//! The socket is split right after connecting: the handshake and the pump
//! both select over the read half while replies go out the write half.
//! berth's protocol is text-only JSON, so the socket plumbing here is
//! deliberately thin — serialize agent frames out, surface inbound text,
//! let tungstenite answer pings on its own.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use berth_proto::frames::{AgentFrame, ControlFrame, OrchestratorFrame};
use berth_proto::{Command, ProtoError};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult};
use crate::exec::{ControlSignal, Executor};
use crate::identity::{AgentIdentity, OrchestratorKeyCache};
use crate::verify::CommandVerifier;

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Why a session ended on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Reconnect immediately (identity regenerated, server restart).
    Reconnect,
    /// Exit the agent process.
    Shutdown,
}

/// Everything one session needs; the supervisor owns it across
/// reconnects.
pub struct SessionContext {
    /// Agent configuration.
    pub config: Arc<AgentConfig>,
    /// Registration token, consumed on the first successful `REGISTER`.
    pub token: Option<String>,
    /// The agent identity.
    pub identity: Arc<AgentIdentity>,
    /// Cached orchestrator key.
    pub keys: Arc<OrchestratorKeyCache>,
    /// Command verifier (shared nonce guard across reconnects).
    pub verifier: Arc<CommandVerifier>,
    /// Command executor.
    pub executor: Arc<Executor>,
    /// Outbound frames from the executor and supervised processes. Held
    /// behind a mutex so each session in turn becomes the sole consumer.
    pub outbound_rx: Arc<Mutex<mpsc::Receiver<AgentFrame>>>,
    /// Control signals from the executor.
    pub control_rx: Arc<Mutex<mpsc::Receiver<ControlSignal>>>,
    /// Set when a session reaches `AUTHORIZED`; the supervisor resets
    /// its backoff on it.
    pub authorized: Arc<AtomicBool>,
}

/// Run one full session: connect, authenticate, pump frames.
///
/// # Errors
///
/// Returns [`AgentError`] when the session ends abnormally; the
/// supervisor retries with backoff.
pub async fn run_session(ctx: &SessionContext) -> AgentResult<SessionEnd> {
    let url = ctx.config.connect_url();
    debug!(%url, "connecting");
    let (socket, _response) = connect_async(url.as_str()).await?;
    let (mut writer, mut reader) = socket.split();

    handshake(ctx, &mut writer, &mut reader).await?;
    ctx.authorized.store(true, Ordering::SeqCst);
    info!("session authorized");

    // Fresh snapshot so dashboards re-sync after every reconnect.
    let report = crate::exec::status::snapshot(&ctx.config).await;
    send_frame(&mut writer, &AgentFrame::ServerStatusResponse { status: report }).await?;

    pump(ctx, writer, reader).await
}

/// Serialize one agent frame onto the write half.
async fn send_frame(
    writer: &mut SplitSink<Socket, Message>,
    frame: &AgentFrame,
) -> AgentResult<()> {
    let json = serde_json::to_string(frame)?;
    writer.send(Message::Text(json.into())).await?;
    Ok(())
}

/// The next inbound text payload, or `None` once the socket is done.
/// Pings are answered by tungstenite itself; berth never sends binary.
async fn next_text(reader: &mut SplitStream<Socket>) -> AgentResult<Option<String>> {
    while let Some(message) = reader.next().await {
        match message? {
            Message::Text(text) => return Ok(Some(text.to_string())),
            Message::Close(frame) => {
                debug!(?frame, "orchestrator closed the connection");
                return Ok(None);
            },
            _ => {},
        }
    }
    Ok(None)
}

/// Drive the four-frame handshake from the agent side.
async fn handshake(
    ctx: &SessionContext,
    writer: &mut SplitSink<Socket, Message>,
    reader: &mut SplitStream<Socket>,
) -> AgentResult<()> {
    let step = ctx.config.handshake_timeout();
    let version = AgentConfig::agent_version().to_owned();

    // Re-register when this install was never registered (or its
    // identity was regenerated); otherwise prove the known identity.
    let hello = if ctx.identity.server_id().is_some() {
        AgentFrame::Connect {
            public_key: ctx.identity.public_key(),
            version,
        }
    } else if let Some(token) = &ctx.token {
        AgentFrame::Register {
            token: token.clone(),
            public_key: ctx.identity.public_key(),
            version,
        }
    } else {
        AgentFrame::Connect {
            public_key: ctx.identity.public_key(),
            version,
        }
    };
    send_frame(writer, &hello).await?;

    let challenge = timeout(step, recv_control(reader))
        .await
        .map_err(|_| AgentError::Protocol("handshake timed out".into()))??;
    let ControlFrame::Challenge { nonce } = challenge else {
        return Err(unexpected_control(&challenge));
    };

    send_frame(
        writer,
        &AgentFrame::Response {
            signature: ctx.identity.sign(nonce.as_bytes()),
        },
    )
    .await?;

    // REGISTERED (when registering) precedes AUTHORIZED.
    loop {
        let frame = timeout(step, recv_control(reader))
            .await
            .map_err(|_| AgentError::Protocol("handshake timed out".into()))??;
        match frame {
            ControlFrame::Registered {
                server_id,
                cp_public_key,
            } => {
                ctx.keys.store(cp_public_key)?;
                ctx.identity.store_server_id(server_id)?;
                info!(%server_id, "registered with orchestrator");
            },
            ControlFrame::Authorized { session_id } => {
                debug!(%session_id, "authorized");
                return Ok(());
            },
            ControlFrame::Error { message } => {
                return Err(AgentError::HandshakeRejected(message));
            },
            other @ ControlFrame::Challenge { .. } => {
                return Err(unexpected_control(&other));
            },
        }
    }
}

async fn recv_control(reader: &mut SplitStream<Socket>) -> AgentResult<ControlFrame> {
    let Some(text) = next_text(reader).await? else {
        return Err(AgentError::SessionLost("closed during handshake".into()));
    };
    match OrchestratorFrame::decode(&text)? {
        OrchestratorFrame::Control(frame) => Ok(frame),
        OrchestratorFrame::Command(_) => Err(AgentError::Protocol(
            "command received before authorization".into(),
        )),
    }
}

fn unexpected_control(frame: &ControlFrame) -> AgentError {
    AgentError::Protocol(format!("unexpected handshake frame: {frame:?}"))
}

/// The post-handshake loop: outbound frames, inbound commands, executor
/// control signals.
async fn pump(
    ctx: &SessionContext,
    mut writer: SplitSink<Socket, Message>,
    mut reader: SplitStream<Socket>,
) -> AgentResult<SessionEnd> {
    let mut outbound = ctx.outbound_rx.lock().await;
    let mut control = ctx.control_rx.lock().await;

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(frame) => send_frame(&mut writer, &frame).await?,
                    None => return Err(AgentError::SessionLost("outbound channel closed".into())),
                }
            },
            signal = control.recv() => {
                let end = match signal {
                    Some(ControlSignal::Reconnect) => {
                        info!("reconnect requested");
                        SessionEnd::Reconnect
                    },
                    Some(ControlSignal::Shutdown) | None => SessionEnd::Shutdown,
                };
                let _ = writer.close().await;
                return Ok(end);
            },
            inbound = next_text(&mut reader) => {
                match inbound? {
                    Some(text) => handle_inbound(ctx, &text),
                    None => return Err(AgentError::SessionLost("connection closed".into())),
                }
            },
        }
    }
}

/// Decode and act on one inbound message.
fn handle_inbound(ctx: &SessionContext, text: &str) {
    let frame = match OrchestratorFrame::decode(text) {
        Ok(frame) => frame,
        Err(ProtoError::Malformed(e)) if e.to_string().starts_with("unknown variant") => {
            debug!("ignoring frame of unknown type");
            return;
        },
        Err(e) => {
            warn!(error = %e, "undecodable frame dropped");
            return;
        },
    };

    match frame {
        OrchestratorFrame::Control(ControlFrame::Error { message }) => {
            warn!(%message, "orchestrator reported an error");
        },
        OrchestratorFrame::Control(other) => {
            debug!(frame = ?other, "ignoring handshake frame on authorized session");
        },
        OrchestratorFrame::Command(signed) => {
            if let Err(e) = ctx.verifier.verify(&signed) {
                // Replays and stale frames drop silently; the warning is
                // the only side effect.
                warn!(error = %e, kind = %signed.command.type_name(), "dropping command");
                return;
            }
            match signed.command {
                Command::CpKeyRotation { new_public_key } => {
                    // Verified against the current key above; swap now so
                    // the next command verifies against the new one.
                    match ctx.keys.store(new_public_key) {
                        Ok(()) => info!(key = %new_public_key.short_id(), "orchestrator key rotated"),
                        Err(e) => warn!(error = %e, "failed to persist rotated key"),
                    }
                },
                command => ctx.executor.dispatch(command),
            }
        },
    }
}
