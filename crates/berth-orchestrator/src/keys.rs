//! Orchestrator signing identity.
//!
//! The keypair is loaded or generated at boot and every privileged command
//! is signed with it. Rotation mints a fresh pair, signs the rotation
//! command with the *old* key (so agents can verify it), persists the new
//! key, and swaps.

use std::path::PathBuf;
use std::sync::RwLock;

use berth_crypto::{CryptoError, Keypair, PublicKey};
use berth_proto::{Command, SignedCommand};
use tracing::info;

use crate::error::OrchestratorResult;

/// Signs outbound commands with the orchestrator identity.
pub struct CommandSigner {
    keypair: RwLock<Keypair>,
    path: PathBuf,
}

impl CommandSigner {
    /// Load the signing key from `path`, generating one on first boot.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError`] on key file problems.
    pub fn load_or_generate(path: PathBuf) -> Result<Self, CryptoError> {
        let keypair = Keypair::load_or_generate(&path)?;
        info!(key = %keypair.public_key().short_id(), "orchestrator identity loaded");
        Ok(Self {
            keypair: RwLock::new(keypair),
            path,
        })
    }

    /// The current public key (sent to agents in `REGISTERED`).
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        match self.keypair.read() {
            Ok(kp) => kp.public_key(),
            Err(poisoned) => poisoned.into_inner().public_key(),
        }
    }

    /// Sign a command with the current time and a fresh nonce.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Proto`] if the command fails to
    /// serialize.
    pub fn sign(&self, command: Command) -> OrchestratorResult<SignedCommand> {
        let keypair = match self.keypair.read() {
            Ok(kp) => kp,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(SignedCommand::sign(command, &keypair)?)
    }

    /// Rotate the signing key.
    ///
    /// Returns the `CP_KEY_ROTATION` command signed with the **old** key;
    /// the caller broadcasts it to every authorized agent. The new key is
    /// persisted before the swap so a crash between the two leaves the
    /// orchestrator on the new key, matching what agents were told.
    ///
    /// # Errors
    ///
    /// Returns an error if signing or persisting fails; the old key stays
    /// active in that case.
    pub fn rotate(&self) -> OrchestratorResult<SignedCommand> {
        let next = Keypair::generate();
        let rotation = self.sign(Command::CpKeyRotation {
            new_public_key: next.public_key(),
        })?;

        persist_key(&self.path, &next)?;
        info!(key = %next.public_key().short_id(), "orchestrator key rotated");
        match self.keypair.write() {
            Ok(mut kp) => *kp = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        Ok(rotation)
    }
}

/// Atomically replace the key file: write a 0600 temp file, then rename.
fn persist_key(path: &PathBuf, keypair: &Keypair) -> OrchestratorResult<()> {
    let tmp = path.with_extension("key.tmp");
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
        file.write_all(&keypair.secret_bytes())?;
        file.sync_all()?;
    }
    #[cfg(not(unix))]
    std::fs::write(&tmp, keypair.secret_bytes())?;

    std::fs::rename(&tmp, path)?;
    Ok(())
}
