//! Ed25519 keypairs with secure on-disk persistence.

use std::fmt;
use std::io::Write;
use std::path::Path;

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{CryptoError, CryptoResult};
use crate::signature::Signature;

/// An Ed25519 keypair identifying an agent or the orchestrator.
///
/// The secret half is zeroized on drop. `Keypair` is deliberately not
/// `Clone`: each component that needs signing capability loads its own
/// instance from the key file.
#[derive(ZeroizeOnDrop)]
pub struct Keypair {
    #[zeroize(skip)] // VerifyingKey holds no secret material
    verifying_key: VerifyingKey,
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh random keypair.
    #[must_use]
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self {
            verifying_key,
            signing_key,
        }
    }

    /// Reconstruct a keypair from a 32-byte secret key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidLength`] if `bytes` is not exactly
    /// 32 bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidLength {
                what: "key",
                expected: 32,
                actual: bytes.len(),
            });
        }

        let mut secret = [0u8; 32];
        secret.copy_from_slice(bytes);
        let signing_key = SigningKey::from_bytes(&secret);
        let verifying_key = signing_key.verifying_key();
        secret.zeroize();

        Ok(Self {
            verifying_key,
            signing_key,
        })
    }

    /// Export the secret key bytes for persistence. Handle with care.
    #[must_use]
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// The public half of this keypair.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(*self.verifying_key.as_bytes())
    }

    /// Sign a message with the secret key.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature::from_bytes(self.signing_key.sign(message).to_bytes())
    }

    /// Load the keypair from `path`, generating and persisting a new one if
    /// the file does not exist.
    ///
    /// Parent directories are created with mode 0700 and the key file is
    /// created atomically (`O_CREAT | O_EXCL`) with mode 0600, so secret
    /// material is never world-readable, even transiently. Symlinked key
    /// files are refused.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyFile`] on I/O failure or symlink detection,
    /// or [`CryptoError::InvalidLength`] if an existing file is corrupt.
    pub fn load_or_generate(path: impl AsRef<Path>) -> CryptoResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            create_private_dir(parent)?;
        }

        // Atomic create first; fall through to the read path if the file
        // already exists.
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(path)
            {
                Ok(mut file) => {
                    let keypair = Self::generate();
                    file.write_all(&keypair.secret_bytes())
                        .map_err(|e| CryptoError::KeyFile(e.to_string()))?;
                    return Ok(keypair);
                },
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {},
                Err(e) => return Err(CryptoError::KeyFile(e.to_string())),
            }
        }

        #[cfg(not(unix))]
        if !path.exists() {
            let keypair = Self::generate();
            let mut file = std::fs::File::create(path)
                .map_err(|e| CryptoError::KeyFile(e.to_string()))?;
            file.write_all(&keypair.secret_bytes())
                .map_err(|e| CryptoError::KeyFile(e.to_string()))?;
            return Ok(keypair);
        }

        let meta = std::fs::symlink_metadata(path)
            .map_err(|e| CryptoError::KeyFile(e.to_string()))?;
        if meta.file_type().is_symlink() {
            return Err(CryptoError::KeyFile(
                "refusing to read key file: path is a symlink".into(),
            ));
        }

        let bytes = Zeroizing::new(
            std::fs::read(path).map_err(|e| CryptoError::KeyFile(e.to_string()))?,
        );
        Self::from_secret_bytes(&bytes)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key().short_id())
            .finish_non_exhaustive()
    }
}

/// Create `dir` (and parents) and restrict it to the owner on Unix.
fn create_private_dir(dir: &Path) -> CryptoResult<()> {
    if dir.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(dir).map_err(|e| CryptoError::KeyFile(e.to_string()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .map_err(|e| CryptoError::KeyFile(e.to_string()))?;
    }
    Ok(())
}

/// An Ed25519 public key. Safe to share and serialize.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Decode from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidLength`] if the slice is not 32 bytes.
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != 32 {
            return Err(CryptoError::InvalidLength {
                what: "key",
                expected: 32,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// The raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encode as base64 (the wire representation).
    #[must_use]
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Decode from base64.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidBase64`] or
    /// [`CryptoError::InvalidLength`] on malformed input.
    pub fn from_base64(s: &str) -> CryptoResult<Self> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|_| CryptoError::InvalidBase64)?;
        Self::try_from_slice(&bytes)
    }

    /// A short hex identifier (first 8 bytes) for logs.
    ///
    /// Never use this for routing or authorization decisions; it exists so
    /// log lines can name a key without reproducing it.
    #[must_use]
    pub fn short_id(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Verify `signature` over `message` with this key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the bytes are not a
    /// valid curve point, or [`CryptoError::VerificationFailed`] if the
    /// signature does not match.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> CryptoResult<()> {
        let verifying_key = VerifyingKey::from_bytes(&self.0)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        let sig = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
        verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.short_id())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keypairs_are_distinct() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn secret_roundtrip_preserves_public_key() {
        let original = Keypair::generate();
        let restored = Keypair::from_secret_bytes(&original.secret_bytes()).unwrap();
        assert_eq!(original.public_key(), restored.public_key());
    }

    #[test]
    fn sign_then_verify() {
        let keypair = Keypair::generate();
        let sig = keypair.sign(b"deploy app-1 at abc123");
        assert!(
            keypair
                .public_key()
                .verify(b"deploy app-1 at abc123", &sig)
                .is_ok()
        );
        assert!(keypair.public_key().verify(b"tampered", &sig).is_err());
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let signer = Keypair::generate();
        let other = Keypair::generate();
        let sig = signer.sign(b"message");
        assert!(matches!(
            other.public_key().verify(b"message", &sig),
            Err(CryptoError::VerificationFailed)
        ));
    }

    #[test]
    fn base64_roundtrip() {
        let pk = Keypair::generate().public_key();
        let decoded = PublicKey::from_base64(&pk.to_base64()).unwrap();
        assert_eq!(pk, decoded);
    }

    #[test]
    fn serde_uses_base64_strings() {
        let pk = Keypair::generate().public_key();
        let json = serde_json::to_string(&pk).unwrap();
        assert_eq!(json, format!("\"{}\"", pk.to_base64()));
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(pk, back);
    }

    #[test]
    fn short_id_is_stable_prefix() {
        let pk = Keypair::generate().public_key();
        assert_eq!(pk.short_id(), hex::encode(&pk.as_bytes()[..8]));
    }

    #[test]
    fn rejects_short_secret() {
        assert!(matches!(
            Keypair::from_secret_bytes(&[0u8; 16]),
            Err(CryptoError::InvalidLength { .. })
        ));
    }

    #[test]
    fn load_or_generate_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("identity.key");

        let first = Keypair::load_or_generate(&path).unwrap();
        assert!(path.exists());
        let second = Keypair::load_or_generate(&path).unwrap();
        assert_eq!(first.public_key(), second.public_key());
    }

    #[test]
    fn load_or_generate_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.key");
        std::fs::write(&path, [0u8; 12]).unwrap();
        assert!(matches!(
            Keypair::load_or_generate(&path),
            Err(CryptoError::InvalidLength { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn key_file_and_dir_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state");
        let path = state.join("identity.key");
        Keypair::load_or_generate(&path).unwrap();

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600);
        let dir_mode = std::fs::metadata(&state).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }

    #[cfg(unix)]
    #[test]
    fn load_or_generate_refuses_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real.key");
        let link = dir.path().join("link.key");
        Keypair::load_or_generate(&real).unwrap();
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let err = Keypair::load_or_generate(&link).unwrap_err();
        assert!(err.to_string().contains("symlink"), "got: {err}");
    }
}
