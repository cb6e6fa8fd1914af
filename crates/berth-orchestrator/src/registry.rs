//! The session registry.
//!
//! Owns the lifecycle of every open socket: which connection is an agent,
//! which identity it proved, and which dashboards subscribe to which
//! owner. All other components hold a [`SessionRegistry`] handle, never
//! the maps themselves.
//!
//! Mutations run under a single write lock taken for brief synchronous
//! sections; eviction of a stale session on reconnect is atomic with
//! admission of the new one — the old connection's close signal fires
//! while the lock is held, so callers that dispatch to an identity always
//! hit the newest authorized session.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use berth_core::{ConnectionId, NodeId, OwnerId};
use berth_crypto::PublicKey;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::queue::{FrameClass, OutboundQueue};

/// The identity an agent session proved during its handshake.
#[derive(Debug, Clone, Copy)]
pub struct AgentIdentity {
    /// The proven public key.
    pub public_key: PublicKey,
    /// Node the key belongs to.
    pub node_id: NodeId,
    /// Owner of that node.
    pub owner_id: OwnerId,
}

struct AgentEntry {
    outbound: mpsc::Sender<String>,
    close_tx: watch::Sender<bool>,
    identity: Option<AgentIdentity>,
}

struct DashboardEntry {
    owner_id: OwnerId,
    queue: Arc<OutboundQueue>,
}

#[derive(Default)]
struct Inner {
    agents: HashMap<ConnectionId, AgentEntry>,
    by_key: HashMap<PublicKey, ConnectionId>,
    by_node: HashMap<NodeId, ConnectionId>,
    dashboards: HashMap<ConnectionId, DashboardEntry>,
}

/// Why a send to a node failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// No authorized session for the node.
    Offline,
    /// The session's outbound queue is full; it has been signalled to
    /// close and the agent will reconnect.
    Stuck,
}

/// Cheaply cloneable handle to the process-wide session maps.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new (not yet authorized) agent socket.
    ///
    /// Returns the close signal the connection task must watch: when it
    /// flips to `true` the session has been evicted or declared stuck and
    /// the socket must close.
    pub fn add_agent(
        &self,
        conn: ConnectionId,
        outbound: mpsc::Sender<String>,
    ) -> watch::Receiver<bool> {
        let (close_tx, close_rx) = watch::channel(false);
        if let Ok(mut inner) = self.inner.write() {
            inner.agents.insert(
                conn,
                AgentEntry {
                    outbound,
                    close_tx,
                    identity: None,
                },
            );
        }
        close_rx
    }

    /// Mark an agent session authorized, atomically evicting any prior
    /// session for the same public key.
    ///
    /// Returns the evicted connection, if there was one. The evicted
    /// session's close signal has already fired; its eventual
    /// [`remove_agent`](Self::remove_agent) will not report the node
    /// offline because routing already points at the new session.
    pub fn authorize_agent(
        &self,
        conn: ConnectionId,
        identity: AgentIdentity,
    ) -> Option<ConnectionId> {
        let Ok(mut inner) = self.inner.write() else {
            return None;
        };
        if !inner.agents.contains_key(&conn) {
            warn!(%conn, "authorize for unknown connection");
            return None;
        }

        let evicted = match inner.by_key.get(&identity.public_key) {
            Some(old) if *old != conn => Some(*old),
            _ => None,
        };
        if let Some(old) = evicted {
            if let Some(entry) = inner.agents.get(&old) {
                let _ = entry.close_tx.send(true);
            }
            debug!(%old, new = %conn, node = %identity.node_id, "evicting stale session");
        }

        inner.by_key.insert(identity.public_key, conn);
        inner.by_node.insert(identity.node_id, conn);
        if let Some(entry) = inner.agents.get_mut(&conn) {
            entry.identity = Some(identity);
        }
        evicted
    }

    /// Drop an agent socket.
    ///
    /// Returns the session's identity when it was still the routable
    /// session for its key — i.e. the node really went offline. Evicted
    /// sessions return `None` so no `offline` event is broadcast for an
    /// identity that never left.
    pub fn remove_agent(&self, conn: ConnectionId) -> Option<AgentIdentity> {
        let Ok(mut inner) = self.inner.write() else {
            return None;
        };
        let entry = inner.agents.remove(&conn)?;
        let identity = entry.identity?;
        if inner.by_key.get(&identity.public_key) == Some(&conn) {
            inner.by_key.remove(&identity.public_key);
            inner.by_node.remove(&identity.node_id);
            Some(identity)
        } else {
            None
        }
    }

    /// The identity bound to a connection, if authorized.
    #[must_use]
    pub fn identity_of(&self, conn: ConnectionId) -> Option<AgentIdentity> {
        let inner = self.inner.read().ok()?;
        inner.agents.get(&conn).and_then(|e| e.identity)
    }

    /// The connection currently routable for a node, if any.
    #[must_use]
    pub fn connection_for_node(&self, node_id: NodeId) -> Option<ConnectionId> {
        let inner = self.inner.read().ok()?;
        inner.by_node.get(&node_id).copied()
    }

    /// Whether a node currently holds an authorized session.
    #[must_use]
    pub fn node_online(&self, node_id: NodeId) -> bool {
        self.inner
            .read()
            .map(|inner| inner.by_node.contains_key(&node_id))
            .unwrap_or(false)
    }

    /// Write a frame to the node's newest authorized session.
    ///
    /// The per-agent queue is small and never-drop: if it is full the
    /// session is treated as stuck and signalled to close, letting the
    /// agent reconnect.
    ///
    /// # Errors
    ///
    /// [`SendError::Offline`] when no authorized session exists,
    /// [`SendError::Stuck`] when the queue was full.
    pub fn send_to_node(&self, node_id: NodeId, frame: String) -> Result<(), SendError> {
        let Ok(inner) = self.inner.read() else {
            return Err(SendError::Offline);
        };
        let conn = inner.by_node.get(&node_id).ok_or(SendError::Offline)?;
        let entry = inner.agents.get(conn).ok_or(SendError::Offline)?;
        match entry.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(node = %node_id, "agent outbound queue full, closing stuck session");
                let _ = entry.close_tx.send(true);
                Err(SendError::Stuck)
            },
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Offline),
        }
    }

    /// Write a frame to every authorized agent session (key rotation).
    ///
    /// Best-effort: stuck or closing sessions are skipped.
    pub fn broadcast_to_agents(&self, frame: &str) -> usize {
        let Ok(inner) = self.inner.read() else {
            return 0;
        };
        let mut sent = 0usize;
        for conn in inner.by_key.values() {
            if let Some(entry) = inner.agents.get(conn) {
                if entry.outbound.try_send(frame.to_owned()).is_ok() {
                    sent = sent.saturating_add(1);
                }
            }
        }
        sent
    }

    /// Subscribe a dashboard socket to an owner's stream.
    pub fn add_dashboard(&self, conn: ConnectionId, owner_id: OwnerId, queue: Arc<OutboundQueue>) {
        if let Ok(mut inner) = self.inner.write() {
            inner
                .dashboards
                .insert(conn, DashboardEntry { owner_id, queue });
        }
    }

    /// Drop a dashboard socket.
    pub fn remove_dashboard(&self, conn: ConnectionId) {
        if let Ok(mut inner) = self.inner.write() {
            if let Some(entry) = inner.dashboards.remove(&conn) {
                entry.queue.close();
            }
        }
    }

    /// Enqueue a frame to every dashboard subscribed to `owner_id`.
    pub fn broadcast_to_owner(&self, owner_id: OwnerId, class: FrameClass, frame: &str) {
        let Ok(inner) = self.inner.read() else {
            return;
        };
        for entry in inner.dashboards.values() {
            if entry.owner_id == owner_id {
                entry.queue.push(class, frame.to_owned());
            }
        }
    }

    /// Enqueue a frame to one specific dashboard.
    ///
    /// Returns `false` if the connection is gone.
    pub fn send_to_dashboard(&self, conn: ConnectionId, class: FrameClass, frame: String) -> bool {
        let Ok(inner) = self.inner.read() else {
            return false;
        };
        match inner.dashboards.get(&conn) {
            Some(entry) => {
                entry.queue.push(class, frame);
                true
            },
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_crypto::Keypair;

    fn identity() -> AgentIdentity {
        AgentIdentity {
            public_key: Keypair::generate().public_key(),
            node_id: NodeId::new(),
            owner_id: OwnerId::new(),
        }
    }

    fn agent(
        registry: &SessionRegistry,
    ) -> (ConnectionId, mpsc::Receiver<String>, watch::Receiver<bool>) {
        let conn = ConnectionId::new();
        let (tx, rx) = mpsc::channel(4);
        let close_rx = registry.add_agent(conn, tx);
        (conn, rx, close_rx)
    }

    #[tokio::test]
    async fn routes_to_the_newest_authorized_session() {
        let registry = SessionRegistry::new();
        let id = identity();

        let (c1, mut rx1, _cl1) = agent(&registry);
        assert_eq!(registry.authorize_agent(c1, id), None);

        let (c2, mut rx2, _cl2) = agent(&registry);
        // Same key: c1 is evicted atomically with c2's admission.
        assert_eq!(registry.authorize_agent(c2, id), Some(c1));

        registry.send_to_node(id.node_id, "cmd".into()).unwrap();
        assert_eq!(rx2.recv().await.as_deref(), Some("cmd"));
        assert!(rx1.try_recv().is_err());
    }

    #[test]
    fn evicted_session_removal_does_not_report_offline() {
        let registry = SessionRegistry::new();
        let id = identity();

        let (c1, _rx1, _cl1) = agent(&registry);
        registry.authorize_agent(c1, id);
        let (c2, _rx2, _cl2) = agent(&registry);
        registry.authorize_agent(c2, id);

        // The evicted session closing is not a node-offline event.
        assert!(registry.remove_agent(c1).is_none());
        assert!(registry.node_online(id.node_id));

        // The live session closing is.
        let gone = registry.remove_agent(c2).expect("node went offline");
        assert_eq!(gone.node_id, id.node_id);
        assert!(!registry.node_online(id.node_id));
    }

    #[test]
    fn at_most_one_session_per_key() {
        let registry = SessionRegistry::new();
        let id = identity();

        let (c1, _rx1, _cl1) = agent(&registry);
        let (c2, _rx2, _cl2) = agent(&registry);
        registry.authorize_agent(c1, id);
        registry.authorize_agent(c2, id);

        let inner = registry.inner.read().unwrap();
        assert_eq!(inner.by_key.len(), 1);
        assert_eq!(inner.by_key.get(&id.public_key), Some(&c2));
    }

    #[test]
    fn eviction_flips_the_old_close_signal() {
        let registry = SessionRegistry::new();
        let id = identity();

        let (c1, _rx1, cl1) = agent(&registry);
        registry.authorize_agent(c1, id);
        assert!(!*cl1.borrow());

        let (c2, _rx2, cl2) = agent(&registry);
        registry.authorize_agent(c2, id);

        assert!(*cl1.borrow(), "old session must be told to close");
        assert!(!*cl2.borrow());
    }

    #[test]
    fn send_to_offline_node_fails_immediately() {
        let registry = SessionRegistry::new();
        assert_eq!(
            registry.send_to_node(NodeId::new(), "cmd".into()),
            Err(SendError::Offline)
        );
    }

    #[test]
    fn full_agent_queue_is_stuck_and_signals_close() {
        let registry = SessionRegistry::new();
        let id = identity();
        let conn = ConnectionId::new();
        let (tx, _rx) = mpsc::channel(1);
        let close_rx = registry.add_agent(conn, tx);
        registry.authorize_agent(conn, id);

        assert!(registry.send_to_node(id.node_id, "one".into()).is_ok());
        assert_eq!(
            registry.send_to_node(id.node_id, "two".into()),
            Err(SendError::Stuck)
        );
        assert!(*close_rx.borrow());
    }

    #[test]
    fn owner_broadcast_reaches_only_that_owners_dashboards() {
        let registry = SessionRegistry::new();
        let owner_a = OwnerId::new();
        let owner_b = OwnerId::new();

        let qa = Arc::new(OutboundQueue::new(8));
        let qb = Arc::new(OutboundQueue::new(8));
        registry.add_dashboard(ConnectionId::new(), owner_a, Arc::clone(&qa));
        registry.add_dashboard(ConnectionId::new(), owner_b, Arc::clone(&qb));

        registry.broadcast_to_owner(owner_a, FrameClass::Status, "hello");
        assert_eq!(qa.len(), 1);
        assert!(qb.is_empty());
    }

    #[test]
    fn direct_dashboard_send_misses_unknown_connections() {
        let registry = SessionRegistry::new();
        assert!(!registry.send_to_dashboard(
            ConnectionId::new(),
            FrameClass::Status,
            "x".into()
        ));
    }
}
