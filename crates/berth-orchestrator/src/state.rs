//! Shared orchestrator state.
//!
//! One [`OrchestratorState`] exists per process; every connection task and
//! the router hold it behind an `Arc`. There are no ambient globals — key
//! material, stores, and the registry are all explicit handles here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use berth_audit::ActivityLog;
use berth_core::{
    ConnectionId, InMemoryAppStore, InMemoryNodeStore, InMemoryProxyStore, InMemoryTokenStore,
    NodeId,
};
use berth_core::{AppStore, NodeStore, ProxyStore, TokenStore};

use crate::auth::{AllowAllGate, CookieOwnerAuth, DashboardAuth, LimitGate};
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorResult;
use crate::keys::CommandSigner;
use crate::registry::SessionRegistry;

/// Process-wide orchestrator state.
pub struct OrchestratorState {
    /// Runtime configuration.
    pub config: OrchestratorConfig,
    /// Node repository.
    pub nodes: Arc<dyn NodeStore>,
    /// App repository.
    pub apps: Arc<dyn AppStore>,
    /// Proxy repository.
    pub proxies: Arc<dyn ProxyStore>,
    /// Registration token repository.
    pub tokens: Arc<dyn TokenStore>,
    /// Activity log ring + broadcast.
    pub activity: ActivityLog,
    /// Command signing identity.
    pub signer: CommandSigner,
    /// Session registry.
    pub registry: SessionRegistry,
    /// Plan-limit gate (billing collaborator).
    pub gate: Arc<dyn LimitGate>,
    /// Dashboard authenticator (operator session collaborator).
    pub dashboard_auth: Arc<dyn DashboardAuth>,
    /// Which dashboard asked for which database credential, so the
    /// unredacted reply goes only to the requester.
    pub(crate) pending_db: Mutex<HashMap<(NodeId, String), ConnectionId>>,
}

/// Shared handle to [`OrchestratorState`].
pub type SharedState = Arc<OrchestratorState>;

impl OrchestratorState {
    /// Assemble state from explicit collaborators.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        nodes: Arc<dyn NodeStore>,
        apps: Arc<dyn AppStore>,
        proxies: Arc<dyn ProxyStore>,
        tokens: Arc<dyn TokenStore>,
        signer: CommandSigner,
        gate: Arc<dyn LimitGate>,
        dashboard_auth: Arc<dyn DashboardAuth>,
    ) -> SharedState {
        let activity = ActivityLog::with_capacity(config.activity_capacity);
        Arc::new(Self {
            config,
            nodes,
            apps,
            proxies,
            tokens,
            activity,
            signer,
            registry: SessionRegistry::new(),
            gate,
            dashboard_auth,
            pending_db: Mutex::new(HashMap::new()),
        })
    }

    /// Assemble state with in-memory stores and permissive defaults: the
    /// wiring used by `berthd` until a relational repository is plugged
    /// in, and by the integration tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the signing key cannot be loaded or created.
    pub fn with_in_memory_stores(config: OrchestratorConfig) -> OrchestratorResult<SharedState> {
        let signer = CommandSigner::load_or_generate(config.key_path())?;
        Ok(Self::new(
            config,
            Arc::new(InMemoryNodeStore::new()),
            Arc::new(InMemoryAppStore::new()),
            Arc::new(InMemoryProxyStore::new()),
            Arc::new(InMemoryTokenStore::new()),
            signer,
            Arc::new(AllowAllGate),
            Arc::new(CookieOwnerAuth::new()),
        ))
    }

    /// Remember which dashboard asked for a database credential.
    pub(crate) fn note_db_requester(&self, node_id: NodeId, name: &str, conn: ConnectionId) {
        if let Ok(mut pending) = self.pending_db.lock() {
            pending.insert((node_id, name.to_owned()), conn);
        }
    }

    /// Claim the requester recorded for a database credential reply.
    pub(crate) fn take_db_requester(&self, node_id: NodeId, name: &str) -> Option<ConnectionId> {
        self.pending_db
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&(node_id, name.to_owned())))
    }
}
