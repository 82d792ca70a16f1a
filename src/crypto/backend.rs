//! Process-wide signing backend slot.
//!
//! The chain consumes signing through this indirection so hosts can swap in
//! a hardware token or an audited implementation. The slot is replaceable
//! until its first use and frozen afterwards.

use crate::crypto::key_pair::{PrivateKey, PublicKey};
use std::sync::OnceLock;
use worldline_derive::Error;

/// Signing primitives the chain relies on.
pub trait CryptoBackend: Send + Sync {
    /// Signs a message with the given private key.
    fn sign(&self, key: &PrivateKey, message: &[u8]) -> Vec<u8>;

    /// Verifies a signature over a message under the given public key.
    fn verify(&self, key: &PublicKey, message: &[u8], signature: &[u8]) -> bool;

    /// Derives the public key for a private key.
    fn public_key(&self, key: &PrivateKey) -> PublicKey;
}

/// Default backend: ECDSA over secp256k1 via the key-pair module.
pub struct Secp256k1Backend;

impl CryptoBackend for Secp256k1Backend {
    fn sign(&self, key: &PrivateKey, message: &[u8]) -> Vec<u8> {
        key.sign(message)
    }

    fn verify(&self, key: &PublicKey, message: &[u8], signature: &[u8]) -> bool {
        key.verify(message, signature)
    }

    fn public_key(&self, key: &PrivateKey) -> PublicKey {
        key.public_key()
    }
}

/// Raised when installing a backend after the slot froze.
#[derive(Debug, Error)]
#[error("a crypto backend is already in use and cannot be replaced")]
pub struct BackendInstalled;

static SLOT: OnceLock<Box<dyn CryptoBackend>> = OnceLock::new();

/// Returns the process-wide backend, installing the default on first use.
pub fn backend() -> &'static dyn CryptoBackend {
    SLOT.get_or_init(|| Box::new(Secp256k1Backend)).as_ref()
}

/// Installs a replacement backend.
///
/// Fails once any code path has read the slot (including the lazily
/// installed default), so call this before touching the chain.
pub fn set_backend(replacement: Box<dyn CryptoBackend>) -> Result<(), BackendInstalled> {
    SLOT.set(replacement).map_err(|_| BackendInstalled)
}
