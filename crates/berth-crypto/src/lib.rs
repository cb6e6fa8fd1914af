//! Ed25519 identity primitives for the berth control plane.
//!
//! Both ends of the fabric own a persistent identity:
//!
//! - every **agent** generates a keypair on first boot and proves possession
//!   of it during the connection handshake;
//! - the **orchestrator** generates a keypair on first boot and signs every
//!   privileged command it sends to an agent.
//!
//! Secret key material is zeroized on drop, and key files are created
//! atomically with owner-only permissions so there is never a world-readable
//! window.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod keypair;
mod signature;

pub use error::{CryptoError, CryptoResult};
pub use keypair::{Keypair, PublicKey};
pub use signature::Signature;
