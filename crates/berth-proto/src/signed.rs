//! The signed command envelope.
//!
//! A signed command is `{type, payload, timestamp, nonce, signature}` where
//! the signature is Ed25519 over the **canonical serialization** of the
//! first four fields. The canonical form is defined here, once, and both
//! ends re-serialize through it, so signer and verifier always see the same
//! bytes:
//!
//! - top-level key order is fixed: `type`, `payload` (omitted for
//!   payload-less commands), `timestamp`, `nonce`;
//! - object keys inside `payload` are sorted lexicographically (the
//!   `serde_json` map representation), numbers are plain integers, strings
//!   use `serde_json` escaping;
//! - `timestamp` is integer milliseconds since the Unix epoch.

use berth_crypto::{Keypair, PublicKey, Signature};
use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::error::{ProtoError, ProtoResult};

/// Generate a fresh command nonce: 16 random bytes, hex-encoded.
#[must_use]
pub fn fresh_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::Rng::fill(&mut rand::rngs::OsRng, &mut bytes[..]);
    hex::encode(bytes)
}

/// A command plus the envelope fields that make it authentic, fresh, and
/// non-replayable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedCommand {
    /// The instruction itself (`type` + `payload` on the wire).
    #[serde(flatten)]
    pub command: Command,
    /// Milliseconds since the Unix epoch at signing time.
    pub timestamp: i64,
    /// 16+ random bytes, hex-encoded. Accepted at most once per agent.
    pub nonce: String,
    /// Ed25519 signature over the canonical serialization.
    pub signature: Signature,
}

impl SignedCommand {
    /// Sign `command` with an explicit timestamp and nonce.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Malformed`] if the command fails to serialize
    /// (which would indicate a bug in the payload types).
    pub fn sign_at(
        command: Command,
        timestamp: i64,
        nonce: String,
        keypair: &Keypair,
    ) -> ProtoResult<Self> {
        let bytes = canonical_bytes(&command, timestamp, &nonce)?;
        let signature = keypair.sign(&bytes);
        Ok(Self {
            command,
            timestamp,
            nonce,
            signature,
        })
    }

    /// Sign `command` with the current time and a fresh nonce.
    ///
    /// # Errors
    ///
    /// See [`SignedCommand::sign_at`].
    pub fn sign(command: Command, keypair: &Keypair) -> ProtoResult<Self> {
        Self::sign_at(
            command,
            chrono::Utc::now().timestamp_millis(),
            fresh_nonce(),
            keypair,
        )
    }

    /// The canonical bytes this envelope's signature covers.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Malformed`] if the command fails to serialize.
    pub fn canonical_bytes(&self) -> ProtoResult<Vec<u8>> {
        canonical_bytes(&self.command, self.timestamp, &self.nonce)
    }

    /// Verify the signature against `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::Crypto`] if the signature does not match, or
    /// [`ProtoError::Malformed`] if the command fails to re-serialize.
    pub fn verify(&self, key: &PublicKey) -> ProtoResult<()> {
        let bytes = self.canonical_bytes()?;
        key.verify(&bytes, &self.signature)?;
        Ok(())
    }
}

/// Build the canonical serialization of `{type, payload, timestamp, nonce}`.
fn canonical_bytes(command: &Command, timestamp: i64, nonce: &str) -> ProtoResult<Vec<u8>> {
    // The adjacently-tagged enum serializes to {"type": ..., "payload"?: ...}
    // with payload keys already sorted by serde_json's map representation.
    let tagged = serde_json::to_value(command)?;
    let obj = tagged.as_object().ok_or(ProtoError::NotAnObject)?;
    let type_value = obj.get("type").ok_or(ProtoError::MissingType)?;

    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(b"{\"type\":");
    serde_json::to_writer(&mut out, type_value)?;
    if let Some(payload) = obj.get("payload") {
        out.extend_from_slice(b",\"payload\":");
        serde_json::to_writer(&mut out, payload)?;
    }
    out.extend_from_slice(b",\"timestamp\":");
    serde_json::to_writer(&mut out, &timestamp)?;
    out.extend_from_slice(b",\"nonce\":");
    serde_json::to_writer(&mut out, nonce)?;
    out.push(b'}');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::RuntimeSpec;
    use crate::types::AppActionKind;
    use berth_core::AppId;

    #[test]
    fn canonical_key_order_is_fixed() {
        let keypair = Keypair::generate();
        let signed = SignedCommand::sign_at(
            Command::InstallRuntime(RuntimeSpec {
                runtime: "node".into(),
                version: Some("22".into()),
            }),
            1_700_000_000_000,
            "00112233445566778899aabbccddeeff".into(),
            &keypair,
        )
        .unwrap();

        let text = String::from_utf8(signed.canonical_bytes().unwrap()).unwrap();
        assert_eq!(
            text,
            "{\"type\":\"INSTALL_RUNTIME\",\
             \"payload\":{\"runtime\":\"node\",\"version\":\"22\"},\
             \"timestamp\":1700000000000,\
             \"nonce\":\"00112233445566778899aabbccddeeff\"}"
        );
    }

    #[test]
    fn payloadless_commands_omit_payload_in_canonical_form() {
        let keypair = Keypair::generate();
        let signed =
            SignedCommand::sign_at(Command::GetServerStatus, 1, "aa".repeat(16), &keypair).unwrap();
        let text = String::from_utf8(signed.canonical_bytes().unwrap()).unwrap();
        assert!(text.starts_with("{\"type\":\"GET_SERVER_STATUS\",\"timestamp\":"));
    }

    #[test]
    fn sign_then_verify_roundtrip() {
        let keypair = Keypair::generate();
        let signed = SignedCommand::sign(
            Command::AppAction {
                app_id: AppId::new(),
                action: AppActionKind::Stop,
            },
            &keypair,
        )
        .unwrap();

        assert!(signed.verify(&keypair.public_key()).is_ok());
        assert!(signed.verify(&Keypair::generate().public_key()).is_err());
    }

    #[test]
    fn wire_roundtrip_still_verifies() {
        // The verifier parses the wire JSON and re-serializes through the
        // canonicalizer; the result must verify byte-for-byte.
        let keypair = Keypair::generate();
        let signed = SignedCommand::sign(
            Command::Deploy(crate::command::DeploySpec {
                app_id: AppId::new(),
                repo_url: "https://git.example.com/site.git".into(),
                branch: "main".into(),
                commit_hash: Some("abc123".into()),
                env: [("PORT".to_string(), "3000".to_string())].into(),
                ports: vec![berth_core::PortMapping { port: 3000, main: true }],
                skip_build_paths: Vec::new(),
            }),
            &keypair,
        )
        .unwrap();

        let wire = serde_json::to_string(&signed).unwrap();
        let parsed: SignedCommand = serde_json::from_str(&wire).unwrap();
        assert!(parsed.verify(&keypair.public_key()).is_ok());
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let keypair = Keypair::generate();
        let signed = SignedCommand::sign(
            Command::DeleteProxy {
                domain: "app.example.com".into(),
            },
            &keypair,
        )
        .unwrap();

        let mut value = serde_json::to_value(&signed).unwrap();
        value["payload"]["domain"] = "evil.example.com".into();
        let tampered: SignedCommand = serde_json::from_value(value).unwrap();
        assert!(tampered.verify(&keypair.public_key()).is_err());
    }

    #[test]
    fn fresh_nonces_do_not_repeat() {
        let a = fresh_nonce();
        let b = fresh_nonce();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
