//! The four-frame mutual-authentication handshake (orchestrator side).
//!
//! ```text
//! agent                          orchestrator
//!   | CONNECT / REGISTER  ---------->  validate identity / consume token
//!   | <----------------  CHALLENGE    fresh 128-bit nonce
//!   | RESPONSE (signed nonce) ----->  verify against stored key
//!   | <---- [REGISTERED,] AUTHORIZED  session routable, node online
//! ```
//!
//! Any frame that does not match the expected state sends `ERROR` and
//! closes. A signature mismatch is fatal for the connection but not the
//! node; an invalid token creates no node at all.

use berth_audit::{ActivityEntry, ActivityKind};
use berth_core::{ConnectionId, Node, NodeStatus, NodeStore, Timestamp, TokenStore};
use berth_crypto::Signature;
use berth_proto::frames::{AgentFrame, ControlFrame};
use berth_proto::{DashboardEvent, ReportStatus, fresh_nonce};
use serde_json::json;
use tracing::{info, warn};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::queue::FrameClass;
use crate::registry::AgentIdentity;
use crate::state::OrchestratorState;

/// Handshake state carried between the identity frame and the challenge
/// response.
pub struct PendingHandshake {
    /// The node this connection claims to be.
    pub node: Node,
    /// The hex nonce the agent must sign (its UTF-8 bytes, exactly as
    /// transmitted).
    pub nonce: String,
    /// Whether this handshake consumed a registration token.
    pub registered: bool,
}

impl OrchestratorState {
    /// Process the first frame of a connection (`CONNECT` or `REGISTER`)
    /// and produce the `CHALLENGE`.
    ///
    /// On `REGISTER` the token is validated and atomically consumed, and
    /// the node row is created (or refreshed for a re-registering key)
    /// *before* the challenge — but the session stays unauthorized until
    /// the response verifies.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Auth`] for unknown keys and bad tokens,
    /// [`OrchestratorError::Protocol`] for any other frame type.
    pub async fn begin_handshake(
        &self,
        frame: AgentFrame,
    ) -> OrchestratorResult<(ControlFrame, PendingHandshake)> {
        let (node, registered) = match frame {
            AgentFrame::Connect { public_key, version } => {
                let mut node = self
                    .nodes
                    .find_by_public_key(&public_key)
                    .await
                    .ok_or_else(|| {
                        warn!(key = %public_key.short_id(), "connect with unknown public key");
                        OrchestratorError::Auth("unknown public key".into())
                    })?;
                if node.agent_version != version {
                    node.agent_version = version;
                    node = self.nodes.upsert(node).await?;
                }
                (node, false)
            },
            AgentFrame::Register {
                token,
                public_key,
                version,
            } => {
                let token = self
                    .tokens
                    .consume(&token)
                    .await
                    .map_err(|e| OrchestratorError::Auth(e.to_string()))?;
                let node = self
                    .nodes
                    .upsert(Node {
                        id: berth_core::NodeId::new(),
                        owner_id: token.owner_id,
                        public_key,
                        status: NodeStatus::Offline,
                        agent_version: version,
                        created_at: Timestamp::now(),
                    })
                    .await?;
                info!(node = %node.id, owner = %node.owner_id, "node registered");
                (node, true)
            },
            other => {
                return Err(OrchestratorError::Protocol(format!(
                    "expected CONNECT or REGISTER, got {}",
                    frame_name(&other)
                )));
            },
        };

        let nonce = fresh_nonce();
        Ok((
            ControlFrame::Challenge {
                nonce: nonce.clone(),
            },
            PendingHandshake {
                node,
                nonce,
                registered,
            },
        ))
    }

    /// Verify the challenge response and authorize the session.
    ///
    /// On success: the registry routes the node to this connection (any
    /// prior session for the key is evicted first), the node goes online,
    /// dashboards get `SERVER_STATUS{online}`, and the activity log gains
    /// an entry. The returned control frames (`REGISTERED` first for
    /// registrations, then `AUTHORIZED`) must be sent in order.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Auth`] on signature mismatch; the node row is
    /// untouched and the agent may reconnect and try again.
    pub async fn complete_handshake(
        &self,
        conn: ConnectionId,
        pending: PendingHandshake,
        signature: &Signature,
    ) -> OrchestratorResult<(Vec<ControlFrame>, AgentIdentity)> {
        let PendingHandshake {
            node,
            nonce,
            registered,
        } = pending;

        node.public_key
            .verify(nonce.as_bytes(), signature)
            .map_err(|_| {
                warn!(node = %node.id, "challenge signature mismatch");
                OrchestratorError::Auth("challenge signature mismatch".into())
            })?;

        let identity = AgentIdentity {
            public_key: node.public_key,
            node_id: node.id,
            owner_id: node.owner_id,
        };
        let evicted = self.registry.authorize_agent(conn, identity);
        if let Some(old) = evicted {
            info!(node = %node.id, %old, "stale session evicted on reconnect");
        }

        self.nodes.set_status(node.id, NodeStatus::Online).await?;
        self.broadcast_event(
            node.owner_id,
            &DashboardEvent::ServerStatus {
                node_id: node.id,
                status: NodeStatus::Online,
            },
        )?;

        self.activity.append(ActivityEntry::new(
            node.owner_id,
            Some(node.id),
            if registered {
                ActivityKind::NodeRegistered
            } else {
                ActivityKind::NodeConnected
            },
            ReportStatus::Success,
            json!({ "agentVersion": node.agent_version }),
        ));

        let mut replies = Vec::with_capacity(2);
        if registered {
            replies.push(ControlFrame::Registered {
                server_id: node.id,
                cp_public_key: self.signer.public_key(),
            });
        }
        replies.push(ControlFrame::Authorized { session_id: conn });

        info!(node = %node.id, %conn, "agent session authorized");
        Ok((replies, identity))
    }

    /// Handle an agent socket closing.
    ///
    /// Only the newest authorized session flips the node offline; an
    /// evicted session closing produces no event at all (the identity
    /// never left).
    pub async fn agent_disconnected(&self, conn: ConnectionId) {
        let Some(identity) = self.registry.remove_agent(conn) else {
            return;
        };
        info!(node = %identity.node_id, %conn, "agent went offline");

        if let Err(e) = self
            .nodes
            .set_status(identity.node_id, NodeStatus::Offline)
            .await
        {
            warn!(node = %identity.node_id, error = %e, "failed to mark node offline");
        }
        if let Err(e) = self.broadcast_event(
            identity.owner_id,
            &DashboardEvent::ServerStatus {
                node_id: identity.node_id,
                status: NodeStatus::Offline,
            },
        ) {
            warn!(node = %identity.node_id, error = %e, "failed to broadcast offline status");
        }

        self.activity.append(ActivityEntry::new(
            identity.owner_id,
            Some(identity.node_id),
            ActivityKind::ConnectionLost,
            ReportStatus::Info,
            json!({}),
        ));
    }

    /// Serialize and broadcast a dashboard event to an owner.
    pub(crate) fn broadcast_event(
        &self,
        owner_id: berth_core::OwnerId,
        event: &DashboardEvent,
    ) -> OrchestratorResult<()> {
        let frame = serde_json::to_string(event).map_err(berth_proto::ProtoError::from)?;
        self.registry
            .broadcast_to_owner(owner_id, FrameClass::Status, &frame);
        Ok(())
    }
}

/// Wire name of a frame, for protocol error messages.
fn frame_name(frame: &AgentFrame) -> String {
    serde_json::to_value(frame)
        .ok()
        .and_then(|v| {
            v.get("type")
                .and_then(serde_json::Value::as_str)
                .map(str::to_owned)
        })
        .unwrap_or_else(|| "UNKNOWN".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use berth_core::{OwnerId, RegistrationToken, TokenStore};
    use berth_crypto::Keypair;

    async fn state_with_key_dir() -> (crate::state::SharedState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig {
            state_dir: dir.path().to_path_buf(),
            ..OrchestratorConfig::default()
        };
        let state = OrchestratorState::with_in_memory_stores(config).unwrap();
        (state, dir)
    }

    async fn mint_token(state: &OrchestratorState, owner: OwnerId) -> String {
        let token = RegistrationToken::mint(owner, chrono::Duration::minutes(10));
        let value = token.value.clone();
        state.tokens.insert(token).await.unwrap();
        value
    }

    #[tokio::test]
    async fn register_then_respond_authorizes_and_creates_node() {
        let (state, _dir) = state_with_key_dir().await;
        let owner = OwnerId::new();
        let keypair = Keypair::generate();
        let token = mint_token(&state, owner).await;
        let conn = ConnectionId::new();
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        state.registry.add_agent(conn, tx);

        let (challenge, pending) = state
            .begin_handshake(AgentFrame::Register {
                token,
                public_key: keypair.public_key(),
                version: "1.0.0".into(),
            })
            .await
            .unwrap();
        let ControlFrame::Challenge { nonce } = challenge else {
            panic!("expected challenge");
        };

        let signature = keypair.sign(nonce.as_bytes());
        let (replies, identity) = state
            .complete_handshake(conn, pending, &signature)
            .await
            .unwrap();

        // REGISTERED (with the orchestrator key) precedes AUTHORIZED.
        assert!(matches!(
            replies[0],
            ControlFrame::Registered { cp_public_key, .. }
                if cp_public_key == state.signer.public_key()
        ));
        assert!(matches!(replies[1], ControlFrame::Authorized { session_id } if session_id == conn));

        // Node exists, online, owned by the token's owner.
        let node = state.nodes.get(identity.node_id).await.unwrap();
        assert_eq!(node.owner_id, owner);
        assert_eq!(node.status, NodeStatus::Online);
        assert!(state.registry.node_online(identity.node_id));
    }

    #[tokio::test]
    async fn consumed_token_cannot_register_twice() {
        let (state, _dir) = state_with_key_dir().await;
        let token = mint_token(&state, OwnerId::new()).await;

        let first = state
            .begin_handshake(AgentFrame::Register {
                token: token.clone(),
                public_key: Keypair::generate().public_key(),
                version: "1.0.0".into(),
            })
            .await;
        assert!(first.is_ok());

        let second = state
            .begin_handshake(AgentFrame::Register {
                token,
                public_key: Keypair::generate().public_key(),
                version: "1.0.0".into(),
            })
            .await;
        assert!(matches!(second, Err(OrchestratorError::Auth(_))));
    }

    #[tokio::test]
    async fn unknown_key_cannot_connect() {
        let (state, _dir) = state_with_key_dir().await;
        let result = state
            .begin_handshake(AgentFrame::Connect {
                public_key: Keypair::generate().public_key(),
                version: "1.0.0".into(),
            })
            .await;
        assert!(matches!(result, Err(OrchestratorError::Auth(_))));
    }

    #[tokio::test]
    async fn wrong_signature_is_fatal_for_connection_not_node() {
        let (state, _dir) = state_with_key_dir().await;
        let owner = OwnerId::new();
        let keypair = Keypair::generate();
        let token = mint_token(&state, owner).await;
        let conn = ConnectionId::new();
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        state.registry.add_agent(conn, tx);

        let (_, pending) = state
            .begin_handshake(AgentFrame::Register {
                token,
                public_key: keypair.public_key(),
                version: "1.0.0".into(),
            })
            .await
            .unwrap();
        let node_id = pending.node.id;

        let bad = Keypair::generate().sign(pending.nonce.as_bytes());
        let result = state.complete_handshake(conn, pending, &bad).await;
        assert!(matches!(result, Err(OrchestratorError::Auth(_))));

        // The node row survives; the agent can retry with CONNECT.
        assert!(state.nodes.get(node_id).await.is_ok());
        assert!(!state.registry.node_online(node_id));
    }

    #[tokio::test]
    async fn non_handshake_first_frame_is_a_protocol_error() {
        let (state, _dir) = state_with_key_dir().await;
        let result = state
            .begin_handshake(AgentFrame::AgentUpdateLog { line: "hi".into() })
            .await;
        assert!(matches!(result, Err(OrchestratorError::Protocol(_))));
    }
}
