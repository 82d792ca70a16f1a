//! ECDSA key pairs on secp256k1.

use crate::types::address::{ADDRESS_LEN, Address};
use crate::types::hash::HashDigest;
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand_core::OsRng;
use zeroize::Zeroizing;

/// Length of the compressed SEC1 public key encoding.
pub const PUBLIC_KEY_LEN: usize = 33;

/// Length of a fixed-width `r || s` signature encoding.
pub const SIGNATURE_LEN: usize = 64;

/// Private key for signing transactions.
///
/// Generated from OS entropy. Raw bytes are only reachable through a
/// zeroizing wrapper and are never serialized by the chain itself.
#[derive(Clone)]
pub struct PrivateKey {
    key: SigningKey,
}

impl PrivateKey {
    /// Generates a new random private key.
    pub fn new() -> Self {
        Self { key: SigningKey::random(&mut OsRng) }
    }

    /// Creates a private key from raw scalar bytes.
    ///
    /// Returns `None` if the bytes are not a valid secp256k1 scalar.
    pub fn from_bytes(bytes: &[u8; 32]) -> Option<Self> {
        SigningKey::from_slice(bytes).ok().map(|key| Self { key })
    }

    /// Returns the raw scalar bytes in a zeroizing wrapper.
    pub fn to_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.key.to_bytes().into())
    }

    /// Derives the corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey::derive(self.key.verifying_key())
    }

    /// Signs arbitrary data, producing a fixed-width `r || s` signature.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let signature: Signature = self.key.sign(data);
        signature.to_bytes().to_vec()
    }
}

impl Default for PrivateKey {
    fn default() -> Self {
        Self::new()
    }
}

/// Public key for signature verification and address derivation.
///
/// The address is the trailing 20 bytes of the SHA-256 digest of the
/// compressed SEC1 encoding, cached next to the key because every
/// transaction check reads it.
#[derive(Clone, Debug)]
pub struct PublicKey {
    key: VerifyingKey,
    address: Address,
}

impl PublicKey {
    fn derive(key: &VerifyingKey) -> Self {
        let encoded = key.to_encoded_point(true);
        let digest = HashDigest::of(encoded.as_bytes());
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes.copy_from_slice(&digest.as_slice()[12..]);
        PublicKey { key: *key, address: Address(bytes) }
    }

    /// Restores a public key from its compressed SEC1 encoding.
    pub fn from_bytes(bytes: &[u8]) -> Option<PublicKey> {
        let key = VerifyingKey::from_sec1_bytes(bytes).ok()?;
        Some(PublicKey::derive(&key))
    }

    /// The compressed SEC1 encoding (33 bytes).
    pub fn to_bytes(&self) -> Vec<u8> {
        self.key.to_encoded_point(true).as_bytes().to_vec()
    }

    /// The address this key controls.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Verifies an `r || s` signature over the given data.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        match Signature::from_slice(signature) {
            Ok(signature) => self.key.verify(data, &signature).is_ok(),
            Err(_) => false,
        }
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PublicKey {}
