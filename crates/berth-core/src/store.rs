//! Typed repository traits and in-memory reference implementations.
//!
//! The durable store for users, nodes, apps, and proxies is a collaborator;
//! the core consumes it through these traits. The `InMemory*` types are the
//! reference implementations used by tests and the default binary wiring.
//! Implementations must be thread-safe; the in-memory ones hold their maps
//! behind `std::sync::RwLock`, taken only for brief synchronous sections.

use std::collections::HashMap;
use std::sync::RwLock;

use berth_crypto::PublicKey;

use crate::error::{StoreError, StoreResult};
use crate::model::{App, Node, NodeStatus, Proxy, RegistrationToken};
use crate::types::{AppId, NodeId, OwnerId, ProxyId, Timestamp};

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Internal("store lock poisoned".into())
}

/// Repository of node records.
#[async_trait::async_trait]
pub trait NodeStore: Send + Sync {
    /// Insert a new node, or refresh the row if the public key is already
    /// registered (a reinstalled agent re-registering with a fresh token).
    async fn upsert(&self, node: Node) -> StoreResult<Node>;

    /// Fetch by ID.
    async fn get(&self, id: NodeId) -> StoreResult<Node>;

    /// Look up the node owning a public key.
    async fn find_by_public_key(&self, key: &PublicKey) -> Option<Node>;

    /// Toggle connection status.
    async fn set_status(&self, id: NodeId, status: NodeStatus) -> StoreResult<()>;

    /// All nodes belonging to an owner.
    async fn list_by_owner(&self, owner_id: OwnerId) -> Vec<Node>;

    /// Remove a node record.
    async fn delete(&self, id: NodeId) -> StoreResult<()>;
}

/// Repository of app records.
#[async_trait::async_trait]
pub trait AppStore: Send + Sync {
    /// Insert or replace an app.
    async fn upsert(&self, app: App) -> StoreResult<()>;

    /// Fetch by ID.
    async fn get(&self, id: AppId) -> StoreResult<App>;

    /// Resolve a webhook trigger: the owner's app deploying `repo_url`.
    async fn find_by_repo(&self, owner_id: OwnerId, repo_url: &str) -> Option<App>;

    /// All apps belonging to an owner.
    async fn list_by_owner(&self, owner_id: OwnerId) -> Vec<App>;

    /// Update the last reported lifecycle state.
    async fn set_status(&self, id: AppId, status: crate::model::AppStatus) -> StoreResult<()>;
}

/// Repository of proxy records.
#[async_trait::async_trait]
pub trait ProxyStore: Send + Sync {
    /// Insert a proxy. Fails with [`StoreError::DuplicateDomain`] if the
    /// owner already has the domain provisioned.
    async fn insert(&self, proxy: Proxy) -> StoreResult<()>;

    /// Fetch an owner's proxy for a domain.
    async fn get_by_domain(&self, owner_id: OwnerId, domain: &str) -> Option<Proxy>;

    /// Remove an owner's proxy for a domain. Missing rows are fine; the
    /// agent-side delete is a best-effort no-op too.
    async fn remove_by_domain(&self, owner_id: OwnerId, domain: &str) -> StoreResult<()>;

    /// All proxies belonging to an owner.
    async fn list_by_owner(&self, owner_id: OwnerId) -> Vec<Proxy>;
}

/// Repository of registration tokens.
#[async_trait::async_trait]
pub trait TokenStore: Send + Sync {
    /// Persist a freshly minted token.
    async fn insert(&self, token: RegistrationToken) -> StoreResult<()>;

    /// Atomically validate and consume a token: it must exist, must not be
    /// expired, and must not have been consumed before. On success the
    /// token is marked consumed and returned.
    async fn consume(&self, value: &str) -> StoreResult<RegistrationToken>;
}

/// In-memory [`NodeStore`].
#[derive(Debug, Default)]
pub struct InMemoryNodeStore {
    nodes: RwLock<HashMap<NodeId, Node>>,
}

impl InMemoryNodeStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl NodeStore for InMemoryNodeStore {
    async fn upsert(&self, node: Node) -> StoreResult<Node> {
        let mut nodes = self.nodes.write().map_err(poisoned)?;
        // One row per public key: a re-registration refreshes in place.
        let existing = nodes
            .values()
            .find(|n| n.public_key == node.public_key)
            .map(|n| n.id);
        let stored = match existing {
            Some(id) => Node { id, ..node },
            None => node,
        };
        nodes.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: NodeId) -> StoreResult<Node> {
        let nodes = self.nodes.read().map_err(poisoned)?;
        nodes.get(&id).cloned().ok_or(StoreError::NotFound {
            what: "node",
            id: id.to_string(),
        })
    }

    async fn find_by_public_key(&self, key: &PublicKey) -> Option<Node> {
        let nodes = self.nodes.read().ok()?;
        nodes.values().find(|n| &n.public_key == key).cloned()
    }

    async fn set_status(&self, id: NodeId, status: NodeStatus) -> StoreResult<()> {
        let mut nodes = self.nodes.write().map_err(poisoned)?;
        let node = nodes.get_mut(&id).ok_or(StoreError::NotFound {
            what: "node",
            id: id.to_string(),
        })?;
        node.status = status;
        Ok(())
    }

    async fn list_by_owner(&self, owner_id: OwnerId) -> Vec<Node> {
        self.nodes
            .read()
            .map(|nodes| {
                nodes
                    .values()
                    .filter(|n| n.owner_id == owner_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn delete(&self, id: NodeId) -> StoreResult<()> {
        let mut nodes = self.nodes.write().map_err(poisoned)?;
        nodes.remove(&id).ok_or(StoreError::NotFound {
            what: "node",
            id: id.to_string(),
        })?;
        Ok(())
    }
}

/// In-memory [`AppStore`].
#[derive(Debug, Default)]
pub struct InMemoryAppStore {
    apps: RwLock<HashMap<AppId, App>>,
}

impl InMemoryAppStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl AppStore for InMemoryAppStore {
    async fn upsert(&self, app: App) -> StoreResult<()> {
        let mut apps = self.apps.write().map_err(poisoned)?;
        apps.insert(app.id, app);
        Ok(())
    }

    async fn get(&self, id: AppId) -> StoreResult<App> {
        let apps = self.apps.read().map_err(poisoned)?;
        apps.get(&id).cloned().ok_or(StoreError::NotFound {
            what: "app",
            id: id.to_string(),
        })
    }

    async fn find_by_repo(&self, owner_id: OwnerId, repo_url: &str) -> Option<App> {
        let apps = self.apps.read().ok()?;
        apps.values()
            .find(|a| a.owner_id == owner_id && a.repo_url == repo_url)
            .cloned()
    }

    async fn list_by_owner(&self, owner_id: OwnerId) -> Vec<App> {
        self.apps
            .read()
            .map(|apps| {
                apps.values()
                    .filter(|a| a.owner_id == owner_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn set_status(&self, id: AppId, status: crate::model::AppStatus) -> StoreResult<()> {
        let mut apps = self.apps.write().map_err(poisoned)?;
        let app = apps.get_mut(&id).ok_or(StoreError::NotFound {
            what: "app",
            id: id.to_string(),
        })?;
        app.status = status;
        Ok(())
    }
}

/// In-memory [`ProxyStore`].
#[derive(Debug, Default)]
pub struct InMemoryProxyStore {
    proxies: RwLock<HashMap<ProxyId, Proxy>>,
}

impl InMemoryProxyStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ProxyStore for InMemoryProxyStore {
    async fn insert(&self, proxy: Proxy) -> StoreResult<()> {
        let mut proxies = self.proxies.write().map_err(poisoned)?;
        let duplicate = proxies
            .values()
            .any(|p| p.owner_id == proxy.owner_id && p.domain == proxy.domain);
        if duplicate {
            return Err(StoreError::DuplicateDomain {
                domain: proxy.domain,
            });
        }
        proxies.insert(proxy.id, proxy);
        Ok(())
    }

    async fn get_by_domain(&self, owner_id: OwnerId, domain: &str) -> Option<Proxy> {
        let proxies = self.proxies.read().ok()?;
        proxies
            .values()
            .find(|p| p.owner_id == owner_id && p.domain == domain)
            .cloned()
    }

    async fn remove_by_domain(&self, owner_id: OwnerId, domain: &str) -> StoreResult<()> {
        let mut proxies = self.proxies.write().map_err(poisoned)?;
        let id = proxies
            .values()
            .find(|p| p.owner_id == owner_id && p.domain == domain)
            .map(|p| p.id);
        if let Some(id) = id {
            proxies.remove(&id);
        }
        Ok(())
    }

    async fn list_by_owner(&self, owner_id: OwnerId) -> Vec<Proxy> {
        self.proxies
            .read()
            .map(|proxies| {
                proxies
                    .values()
                    .filter(|p| p.owner_id == owner_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// In-memory [`TokenStore`].
#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    tokens: RwLock<HashMap<String, RegistrationToken>>,
}

impl InMemoryTokenStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn insert(&self, token: RegistrationToken) -> StoreResult<()> {
        let mut tokens = self.tokens.write().map_err(poisoned)?;
        tokens.insert(token.value.clone(), token);
        Ok(())
    }

    async fn consume(&self, value: &str) -> StoreResult<RegistrationToken> {
        // Validation and the consumed flag flip happen under one write
        // lock so two racing registrations cannot both win.
        let mut tokens = self.tokens.write().map_err(poisoned)?;
        let token = tokens.get_mut(value).ok_or(StoreError::TokenUnknown)?;
        if token.consumed {
            return Err(StoreError::TokenConsumed);
        }
        if token.expires_at <= Timestamp::now() {
            return Err(StoreError::TokenExpired);
        }
        token.consumed = true;
        Ok(token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AppStatus, PortMapping};
    use berth_crypto::Keypair;

    fn node(owner: OwnerId, key: PublicKey) -> Node {
        Node {
            id: NodeId::new(),
            owner_id: owner,
            public_key: key,
            status: NodeStatus::Offline,
            agent_version: "1.0.0".into(),
            created_at: Timestamp::now(),
        }
    }

    #[tokio::test]
    async fn node_exists_iff_public_key_stored() {
        let store = InMemoryNodeStore::new();
        let key = Keypair::generate().public_key();
        assert!(store.find_by_public_key(&key).await.is_none());

        let stored = store.upsert(node(OwnerId::new(), key)).await.unwrap();
        let found = store.find_by_public_key(&key).await.unwrap();
        assert_eq!(found.id, stored.id);

        store.delete(stored.id).await.unwrap();
        assert!(store.find_by_public_key(&key).await.is_none());
    }

    #[tokio::test]
    async fn reregistration_keeps_node_id() {
        let store = InMemoryNodeStore::new();
        let key = Keypair::generate().public_key();
        let owner = OwnerId::new();

        let first = store.upsert(node(owner, key)).await.unwrap();
        let mut refreshed = node(owner, key);
        refreshed.agent_version = "1.1.0".into();
        let second = store.upsert(refreshed).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.agent_version, "1.1.0");
    }

    #[tokio::test]
    async fn token_is_single_use() {
        let store = InMemoryTokenStore::new();
        let token = RegistrationToken::mint(OwnerId::new(), chrono::Duration::minutes(10));
        let value = token.value.clone();
        store.insert(token).await.unwrap();

        assert!(store.consume(&value).await.is_ok());
        assert!(matches!(
            store.consume(&value).await,
            Err(StoreError::TokenConsumed)
        ));
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let store = InMemoryTokenStore::new();
        let token = RegistrationToken::mint(OwnerId::new(), chrono::Duration::milliseconds(-1));
        let value = token.value.clone();
        store.insert(token).await.unwrap();

        assert!(matches!(
            store.consume(&value).await,
            Err(StoreError::TokenExpired)
        ));
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let store = InMemoryTokenStore::new();
        assert!(matches!(
            store.consume("nope").await,
            Err(StoreError::TokenUnknown)
        ));
    }

    #[tokio::test]
    async fn proxy_domain_unique_per_owner() {
        let store = InMemoryProxyStore::new();
        let owner = OwnerId::new();
        let node_id = NodeId::new();
        let proxy = |domain: &str, owner: OwnerId| Proxy {
            id: ProxyId::new(),
            owner_id: owner,
            node_id,
            domain: domain.into(),
            port: 3000,
            ssl_enabled: true,
            app_id: None,
        };

        store.insert(proxy("app.example.com", owner)).await.unwrap();
        assert!(matches!(
            store.insert(proxy("app.example.com", owner)).await,
            Err(StoreError::DuplicateDomain { .. })
        ));
        // A different owner may reuse the domain record-wise.
        store
            .insert(proxy("app.example.com", OwnerId::new()))
            .await
            .unwrap();

        store
            .remove_by_domain(owner, "app.example.com")
            .await
            .unwrap();
        store.insert(proxy("app.example.com", owner)).await.unwrap();
    }

    #[tokio::test]
    async fn remove_missing_proxy_is_a_no_op() {
        let store = InMemoryProxyStore::new();
        assert!(
            store
                .remove_by_domain(OwnerId::new(), "ghost.example.com")
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn app_lookup_by_repo_scopes_to_owner() {
        let store = InMemoryAppStore::new();
        let owner = OwnerId::new();
        let app = App {
            id: AppId::new(),
            owner_id: owner,
            node_id: NodeId::new(),
            repo_url: "https://git.example.com/site.git".into(),
            branch: "main".into(),
            ports: vec![PortMapping { port: 3000, main: true }],
            env: Default::default(),
            status: AppStatus::Stopped,
            skip_build_paths: Vec::new(),
        };
        store.upsert(app.clone()).await.unwrap();

        assert!(
            store
                .find_by_repo(owner, "https://git.example.com/site.git")
                .await
                .is_some()
        );
        assert!(
            store
                .find_by_repo(OwnerId::new(), "https://git.example.com/site.git")
                .await
                .is_none()
        );
    }
}
