//! Opaque 128-bit chain identifiers.

use rand_core::{OsRng, RngCore};
use std::fmt;

/// Identifier of one chain view inside a store.
///
/// Multiple chains share block and transaction storage but carry their own
/// index, state references, and nonce table; exactly one is canonical at a
/// time. Ids are opaque and random so forks never collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChainId(pub [u8; 16]);

impl ChainId {
    /// Draws a fresh random identifier.
    pub fn random() -> ChainId {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        ChainId(bytes)
    }

    /// Returns the identifier as a byte slice.
    pub const fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_differ() {
        assert_ne!(ChainId::random(), ChainId::random());
    }

    #[test]
    fn display_is_32_hex_chars() {
        let id = ChainId([0x0Fu8; 16]);
        assert_eq!(id.to_string(), "0f".repeat(16));
    }
}
