//! Agent identity and the cached orchestrator key.

use std::path::PathBuf;
use std::sync::RwLock;

use berth_core::NodeId;
use berth_crypto::{CryptoError, Keypair, PublicKey, Signature};
use tracing::info;

use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult};

/// The agent's persistent Ed25519 identity.
///
/// Generated on first boot under the 0700 state directory; immutable for
/// the life of the install except through `REGENERATE_IDENTITY`.
pub struct AgentIdentity {
    keypair: RwLock<Keypair>,
    key_path: PathBuf,
    server_id_path: PathBuf,
}

impl AgentIdentity {
    /// Load the identity from the state directory, generating a fresh
    /// keypair on first boot.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError`] on key file problems.
    pub fn load_or_generate(config: &AgentConfig) -> Result<Self, CryptoError> {
        let key_path = config.identity_key_path();
        let keypair = Keypair::load_or_generate(&key_path)?;
        info!(key = %keypair.public_key().short_id(), "agent identity loaded");
        Ok(Self {
            keypair: RwLock::new(keypair),
            key_path,
            server_id_path: config.server_id_path(),
        })
    }

    /// The identity's public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        match self.keypair.read() {
            Ok(kp) => kp.public_key(),
            Err(poisoned) => poisoned.into_inner().public_key(),
        }
    }

    /// Sign a challenge nonce (its UTF-8 bytes as transmitted).
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        match self.keypair.read() {
            Ok(kp) => kp.sign(message),
            Err(poisoned) => poisoned.into_inner().sign(message),
        }
    }

    /// Replace the identity with a fresh keypair (`REGENERATE_IDENTITY`).
    ///
    /// The node must re-register afterwards, so the registration marker is
    /// cleared too.
    ///
    /// # Errors
    ///
    /// Returns an error if the new key cannot be persisted; the old
    /// identity stays active in that case.
    pub fn regenerate(&self) -> AgentResult<PublicKey> {
        let next = Keypair::generate();
        write_private_atomic(&self.key_path, &next.secret_bytes())?;
        let _ = std::fs::remove_file(&self.server_id_path);

        let public_key = next.public_key();
        match self.keypair.write() {
            Ok(mut kp) => *kp = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        info!(key = %public_key.short_id(), "agent identity regenerated");
        Ok(public_key)
    }

    /// The node ID assigned at registration, if this install has one.
    #[must_use]
    pub fn server_id(&self) -> Option<NodeId> {
        let text = std::fs::read_to_string(&self.server_id_path).ok()?;
        text.trim().parse().ok()
    }

    /// Record the node ID delivered by `REGISTERED`.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker cannot be written.
    pub fn store_server_id(&self, id: NodeId) -> AgentResult<()> {
        write_private_atomic(&self.server_id_path, id.to_string().as_bytes())
    }
}

/// The orchestrator public key learned from `REGISTERED` (or a verified
/// rotation), cached on disk so every later session verifies commands.
///
/// While no key has ever been cached — the first boot, before
/// registration completes — command verification runs in degraded mode
/// and accepts unsigned commands. That window closes permanently the
/// moment a key is stored.
pub struct OrchestratorKeyCache {
    path: PathBuf,
    current: RwLock<Option<PublicKey>>,
}

impl OrchestratorKeyCache {
    /// Load the cache from the state directory.
    ///
    /// # Errors
    ///
    /// Returns an error only if an existing file is unreadable or corrupt
    /// (a missing file is simply an empty cache).
    pub fn load(config: &AgentConfig) -> AgentResult<Self> {
        let path = config.orchestrator_key_path();
        let current = match std::fs::read_to_string(&path) {
            Ok(text) => Some(
                PublicKey::from_base64(text.trim())
                    .map_err(|e| AgentError::Config(format!("{}: {e}", path.display())))?,
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            current: RwLock::new(current),
        })
    }

    /// The cached key, if any.
    #[must_use]
    pub fn current(&self) -> Option<PublicKey> {
        match self.current.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Atomically persist and swap to a new key.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written; the previous key
    /// stays active in that case.
    pub fn store(&self, key: PublicKey) -> AgentResult<()> {
        write_private_atomic(&self.path, key.to_base64().as_bytes())?;
        match self.current.write() {
            Ok(mut guard) => *guard = Some(key),
            Err(poisoned) => *poisoned.into_inner() = Some(key),
        }
        info!(key = %key.short_id(), "orchestrator key cached");
        Ok(())
    }
}

/// Write a small state file atomically with owner-only permissions.
fn write_private_atomic(path: &PathBuf, contents: &[u8]) -> AgentResult<()> {
    let tmp = path.with_extension("tmp");
    let _ = std::fs::remove_file(&tmp);

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    #[cfg(not(unix))]
    std::fs::write(&tmp, contents)?;

    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &std::path::Path) -> AgentConfig {
        AgentConfig {
            state_dir: dir.to_path_buf(),
            ..AgentConfig::default()
        }
    }

    #[test]
    fn identity_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        let first = AgentIdentity::load_or_generate(&config).unwrap();
        let second = AgentIdentity::load_or_generate(&config).unwrap();
        assert_eq!(first.public_key(), second.public_key());
    }

    #[test]
    fn regenerate_changes_key_and_clears_registration() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let identity = AgentIdentity::load_or_generate(&config).unwrap();
        identity.store_server_id(NodeId::new()).unwrap();
        let old = identity.public_key();

        let new = identity.regenerate().unwrap();
        assert_ne!(old, new);
        assert_eq!(identity.server_id(), None);

        // The new key is what future boots load.
        let reloaded = AgentIdentity::load_or_generate(&config).unwrap();
        assert_eq!(reloaded.public_key(), new);
    }

    #[test]
    fn key_cache_starts_empty_then_persists() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        let cache = OrchestratorKeyCache::load(&config).unwrap();
        assert!(cache.current().is_none());

        let key = Keypair::generate().public_key();
        cache.store(key).unwrap();
        assert_eq!(cache.current(), Some(key));

        let reloaded = OrchestratorKeyCache::load(&config).unwrap();
        assert_eq!(reloaded.current(), Some(key));
    }

    #[test]
    fn corrupt_key_cache_is_an_error_not_a_degraded_mode() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        std::fs::create_dir_all(&config.state_dir).unwrap();
        std::fs::write(config.orchestrator_key_path(), "not base64!").unwrap();

        assert!(OrchestratorKeyCache::load(&config).is_err());
    }

    #[test]
    fn server_id_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let identity = AgentIdentity::load_or_generate(&config).unwrap();

        assert_eq!(identity.server_id(), None);
        let id = NodeId::new();
        identity.store_server_id(id).unwrap();
        assert_eq!(identity.server_id(), Some(id));
    }
}
