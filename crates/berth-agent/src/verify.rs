//! Inbound command verification.
//!
//! Every signed command must be fresh (timestamp within the replay
//! window), unseen (nonce not in the guard), and authentic (Ed25519
//! signature against the cached orchestrator key). Violating frames are
//! dropped without side effect; the orchestrator's random nonce issuance
//! means a legitimate collision never occurs, so replays are attacks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use berth_proto::SignedCommand;
use thiserror::Error;
use tracing::warn;

use crate::identity::OrchestratorKeyCache;

/// Extra time a nonce is remembered beyond the drift window, so a frame
/// cannot be replayed just as its timestamp expires.
const NONCE_RETENTION_MARGIN: Duration = Duration::from_secs(60);

/// Why a command was dropped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    /// Timestamp outside the replay window.
    #[error("timestamp outside replay window: drift {drift_ms}ms")]
    Stale {
        /// Observed |now − timestamp|.
        drift_ms: i64,
    },

    /// Nonce already seen inside the window.
    #[error("nonce replayed")]
    Replayed,

    /// Signature did not verify against the cached orchestrator key.
    #[error("bad command signature")]
    BadSignature,
}

/// Verifies signed commands against freshness, replay, and signature.
pub struct CommandVerifier {
    keys: Arc<OrchestratorKeyCache>,
    window: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl CommandVerifier {
    /// Create a verifier over the cached orchestrator key.
    #[must_use]
    pub fn new(keys: Arc<OrchestratorKeyCache>, window: Duration) -> Self {
        Self {
            keys,
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Verify one command with an explicit "now" in unix milliseconds.
    ///
    /// # Errors
    ///
    /// Returns the [`VerifyError`] that should cause a silent drop.
    pub fn verify_at(&self, command: &SignedCommand, now_ms: i64) -> Result<(), VerifyError> {
        let drift_ms = now_ms.saturating_sub(command.timestamp).abs();
        let window_ms = i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX);
        if drift_ms > window_ms {
            return Err(VerifyError::Stale { drift_ms });
        }

        // Record the nonce atomically with the replay check so two copies
        // of the same frame cannot both pass.
        {
            let Ok(mut seen) = self.seen.lock() else {
                return Err(VerifyError::Replayed);
            };
            let retention = self.window.saturating_add(NONCE_RETENTION_MARGIN);
            seen.retain(|_, at| at.elapsed() < retention);
            if seen.contains_key(&command.nonce) {
                return Err(VerifyError::Replayed);
            }
            seen.insert(command.nonce.clone(), Instant::now());
        }

        match self.keys.current() {
            Some(key) => {
                if command.verify(&key).is_err() {
                    // A forged frame must not poison the nonce space.
                    if let Ok(mut seen) = self.seen.lock() {
                        seen.remove(&command.nonce);
                    }
                    return Err(VerifyError::BadSignature);
                }
                Ok(())
            },
            None => {
                // First boot, before REGISTERED delivered a key. The only
                // path on which an unverified command runs.
                warn!(
                    kind = %command.command.type_name(),
                    "no orchestrator key cached yet, accepting command unverified"
                );
                Ok(())
            },
        }
    }

    /// Verify one command against the current clock.
    ///
    /// # Errors
    ///
    /// See [`CommandVerifier::verify_at`].
    pub fn verify(&self, command: &SignedCommand) -> Result<(), VerifyError> {
        self.verify_at(command, chrono::Utc::now().timestamp_millis())
    }
}
