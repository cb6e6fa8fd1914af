//! WebSocket listener and per-connection session tasks.
//!
//! One listener serves both endpoints: `/api/connect` for agents and
//! `/api/dashboard/ws` for dashboards. Every accepted socket gets its own
//! task; agent sessions run the handshake before entering the frame pump.

use std::net::SocketAddr;
use std::sync::Arc;

use berth_core::ConnectionId;
use berth_proto::frames::{AgentFrame, ControlFrame};
use berth_proto::DashboardIntent;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tracing::{debug, info, warn};

use crate::auth::DashboardAuth;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::queue::OutboundQueue;
use crate::router::spawn_audit_fanout;
use crate::state::SharedState;

const AGENT_PATH: &str = "/api/connect";
const DASHBOARD_PATH: &str = "/api/dashboard/ws";

type WsStream = WebSocketStream<TcpStream>;

/// The orchestrator's WebSocket server.
pub struct Server {
    state: SharedState,
    listener: TcpListener,
}

impl Server {
    /// Bind the configured listen address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(state: SharedState) -> OrchestratorResult<Self> {
        let listener = TcpListener::bind(state.config.listen_addr).await?;
        info!(addr = %listener.local_addr()?, "orchestrator listening");
        Ok(Self { state, listener })
    }

    /// The bound address (useful when binding port 0).
    ///
    /// # Errors
    ///
    /// Returns an error if the socket is gone.
    pub fn local_addr(&self) -> OrchestratorResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is cancelled.
    pub async fn run(self) {
        let _audit_fanout = spawn_audit_fanout(Arc::clone(&self.state));
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(state, stream, peer).await {
                            debug!(%peer, error = %e, "connection ended with error");
                        }
                    });
                },
                Err(e) => {
                    warn!(error = %e, "accept failed");
                },
            }
        }
    }
}

/// Upgrade one TCP connection and dispatch it by path.
async fn handle_connection(
    state: SharedState,
    stream: TcpStream,
    peer: SocketAddr,
) -> OrchestratorResult<()> {
    let mut path = String::new();
    let mut cookie = None;
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        let requested = req.uri().path();
        if requested != AGENT_PATH && requested != DASHBOARD_PATH {
            let mut not_found = ErrorResponse::new(Some("not found".to_owned()));
            *not_found.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::NOT_FOUND;
            return Err(not_found);
        }
        path = requested.to_owned();
        cookie = req
            .headers()
            .get("cookie")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        Ok(resp)
    })
    .await?;

    debug!(%peer, %path, "websocket accepted");
    match path.as_str() {
        AGENT_PATH => run_agent_session(state, ws).await,
        DASHBOARD_PATH => run_dashboard_session(state, ws, cookie).await,
        _ => Ok(()),
    }
}

/// Read frames until a text message arrives; parse it as an agent frame.
///
/// Handshake frames are parsed strictly: anything malformed is a protocol
/// error that closes the connection.
async fn next_agent_frame(stream: &mut futures::stream::SplitStream<WsStream>)
-> OrchestratorResult<AgentFrame> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(&text)
                    .map_err(|e| OrchestratorError::Protocol(format!("malformed frame: {e}")));
            },
            Some(Ok(Message::Close(_))) | None => {
                return Err(OrchestratorError::Protocol(
                    "connection closed during handshake".into(),
                ));
            },
            Some(Ok(_)) => {}, // ping/pong/binary
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Drive one agent connection: handshake, then the frame pump.
async fn run_agent_session(state: SharedState, ws: WsStream) -> OrchestratorResult<()> {
    let (mut sink, mut stream) = ws.split();
    let conn = ConnectionId::new();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(state.config.agent_queue_capacity);
    let mut close_rx = state.registry.add_agent(conn, out_tx);
    let step = state.config.handshake_timeout();

    let handshake = async {
        let hello = timeout(step, next_agent_frame(&mut stream))
            .await
            .map_err(|_| OrchestratorError::HandshakeTimeout)??;
        let (challenge, pending) = state.begin_handshake(hello).await?;
        sink.send(Message::Text(serde_json::to_string(&challenge)?.into()))
            .await?;

        let response = timeout(step, next_agent_frame(&mut stream))
            .await
            .map_err(|_| OrchestratorError::HandshakeTimeout)??;
        let AgentFrame::Response { signature } = response else {
            return Err(OrchestratorError::Protocol("expected RESPONSE".into()));
        };
        let (replies, identity) = state.complete_handshake(conn, pending, &signature).await?;
        for reply in replies {
            sink.send(Message::Text(serde_json::to_string(&reply)?.into()))
                .await?;
        }
        Ok(identity)
    };

    match handshake.await {
        Ok(_identity) => {},
        Err(e) => {
            let error = ControlFrame::Error {
                message: e.to_string(),
            };
            if let Ok(text) = serde_json::to_string(&error) {
                let _ = sink.send(Message::Text(text.into())).await;
            }
            let _ = sink.close().await;
            state.registry.remove_agent(conn);
            return Err(e);
        },
    }

    let result = agent_pump(&state, conn, &mut sink, &mut stream, &mut out_rx, &mut close_rx).await;
    let _ = sink.close().await;
    state.agent_disconnected(conn).await;
    result
}

/// The post-handshake agent frame pump.
async fn agent_pump(
    state: &SharedState,
    conn: ConnectionId,
    sink: &mut futures::stream::SplitSink<WsStream, Message>,
    stream: &mut futures::stream::SplitStream<WsStream>,
    out_rx: &mut mpsc::Receiver<String>,
    close_rx: &mut tokio::sync::watch::Receiver<bool>,
) -> OrchestratorResult<()> {
    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                match outbound {
                    Some(frame) => sink.send(Message::Text(frame.into())).await?,
                    None => return Ok(()),
                }
            },
            changed = close_rx.changed() => {
                if changed.is_err() || *close_rx.borrow() {
                    debug!(%conn, "session closed by registry (evicted or stuck)");
                }
                return Ok(());
            },
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match decode_known_frame::<AgentFrame>(&text) {
                            Ok(Some(frame)) => {
                                if let Err(e) = state.handle_agent_frame(conn, frame).await {
                                    let error = ControlFrame::Error { message: e.to_string() };
                                    if let Ok(t) = serde_json::to_string(&error) {
                                        let _ = sink.send(Message::Text(t.into())).await;
                                    }
                                    return Err(e);
                                }
                            },
                            Ok(None) => {
                                debug!(%conn, "ignoring frame of unknown type");
                            },
                            Err(e) => {
                                let error = ControlFrame::Error { message: e.to_string() };
                                if let Ok(t) = serde_json::to_string(&error) {
                                    let _ = sink.send(Message::Text(t.into())).await;
                                }
                                return Err(e);
                            },
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {},
                    Some(Err(e)) => return Err(e.into()),
                }
            },
        }
    }
}

/// Drive one dashboard connection.
async fn run_dashboard_session(
    state: SharedState,
    ws: WsStream,
    cookie: Option<String>,
) -> OrchestratorResult<()> {
    let (mut sink, mut stream) = ws.split();

    let Some(owner_id) = state.dashboard_auth.authenticate(cookie.as_deref()).await else {
        warn!("dashboard connection rejected: unauthenticated");
        let _ = sink.close().await;
        return Ok(());
    };

    let conn = ConnectionId::new();
    let queue = Arc::new(OutboundQueue::new(state.config.dashboard_queue_capacity));
    state
        .dashboard_connected(conn, owner_id, Arc::clone(&queue))
        .await?;

    let result: OrchestratorResult<()> = async {
        loop {
            tokio::select! {
                outbound = queue.pop() => {
                    match outbound {
                        Some(frame) => sink.send(Message::Text(frame.into())).await?,
                        None => return Ok(()),
                    }
                },
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            match decode_known_frame::<DashboardIntent>(&text) {
                                Ok(Some(intent)) => {
                                    state.handle_intent(conn, owner_id, intent).await;
                                },
                                Ok(None) => {
                                    debug!(%conn, "ignoring intent of unknown type");
                                },
                                Err(e) => return Err(e),
                            }
                        },
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => {},
                        Some(Err(e)) => return Err(e.into()),
                    }
                },
            }
        }
    }
    .await;

    let _ = sink.close().await;
    state.registry.remove_dashboard(conn);
    result
}

/// Parse a frame, distinguishing unknown `type` values (ignored per the
/// protocol) from malformed frames (a protocol error).
fn decode_known_frame<T: serde::de::DeserializeOwned>(
    text: &str,
) -> OrchestratorResult<Option<T>> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| OrchestratorError::Protocol(format!("malformed frame: {e}")))?;
    let obj = value
        .as_object()
        .ok_or_else(|| OrchestratorError::Protocol("frame is not an object".into()))?;
    if !obj.contains_key("type") {
        return Err(OrchestratorError::Protocol("frame has no type".into()));
    }
    match serde_json::from_value::<T>(value) {
        Ok(frame) => Ok(Some(frame)),
        // serde_json reports an unexpected tag as "unknown variant".
        Err(e) if e.to_string().starts_with("unknown variant") => Ok(None),
        Err(e) => Err(OrchestratorError::Protocol(format!("malformed frame: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_is_ignored_not_fatal() {
        let result = decode_known_frame::<AgentFrame>("{\"type\":\"FUTURE_FRAME\",\"x\":1}");
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn malformed_json_is_a_protocol_error() {
        let result = decode_known_frame::<AgentFrame>("{nope");
        assert!(matches!(result, Err(OrchestratorError::Protocol(_))));
    }

    #[test]
    fn known_type_with_bad_fields_is_a_protocol_error() {
        let result = decode_known_frame::<AgentFrame>("{\"type\":\"LOG_STREAM\",\"line\":3}");
        assert!(matches!(result, Err(OrchestratorError::Protocol(_))));
    }
}
