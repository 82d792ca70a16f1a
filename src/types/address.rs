//! 20-byte account addresses and the state keys derived from them.

use crate::types::value::{PlainValue, Value, ValueError};
use std::fmt;

/// Address length in bytes.
pub const ADDRESS_LEN: usize = 20;

/// Fixed-size 20-byte address identifying a signer or state owner.
///
/// Derived from a public key by hashing its compressed encoding with
/// SHA-256 and keeping the trailing 20 bytes. `Copy` for cheap passing in
/// validation and lookup paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub [u8; ADDRESS_LEN]);

impl Address {
    /// The all-zero address.
    pub const fn zero() -> Address {
        Address([0u8; ADDRESS_LEN])
    }

    /// Returns the address as a byte slice.
    pub const fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Creates an address from a slice of exactly [`ADDRESS_LEN`] bytes.
    pub fn from_slice(slice: &[u8]) -> Option<Address> {
        let bytes: [u8; ADDRESS_LEN] = slice.try_into().ok()?;
        Some(Address(bytes))
    }

    /// Returns the state key owned by this address (its lowercase hex).
    pub fn state_key(&self) -> StateKey {
        StateKey(self.to_string())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl PlainValue for Address {
    fn to_value(&self) -> Value {
        Value::bytes(self.0.to_vec())
    }

    fn from_value(value: &Value) -> Result<Self, ValueError> {
        value
            .as_bytes()
            .and_then(Address::from_slice)
            .ok_or(ValueError::Mismatch { expected: "20-byte address" })
    }
}

/// Key of one slot of the keyed world state.
///
/// Either the lowercase hex of an [`Address`] or an arbitrary name chosen by
/// the application for a named slot.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateKey(String);

impl StateKey {
    /// Creates a named state key.
    pub fn named(name: impl Into<String>) -> StateKey {
        StateKey(name.into())
    }

    /// Returns the key text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parses the key back into the address it denotes, when it is one.
    ///
    /// Only 40-character lowercase hex keys decode; named slots return
    /// `None`.
    pub fn as_address(&self) -> Option<Address> {
        if self.0.len() != ADDRESS_LEN * 2 {
            return None;
        }
        let mut bytes = [0u8; ADDRESS_LEN];
        for (i, chunk) in self.0.as_bytes().chunks(2).enumerate() {
            let hi = hex_nibble(chunk[0])?;
            let lo = hex_nibble(chunk[1])?;
            bytes[i] = (hi << 4) | lo;
        }
        Some(Address(bytes))
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Address> for StateKey {
    fn from(address: Address) -> StateKey {
        address.state_key()
    }
}

/// Decodes one lowercase hex digit; uppercase is rejected so that keys have
/// a single canonical spelling.
fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_lowercase_hex() {
        let address = Address([0xA5u8; ADDRESS_LEN]);
        assert_eq!(address.to_string(), "a5".repeat(ADDRESS_LEN));
    }

    #[test]
    fn state_key_roundtrips_to_address() {
        let mut bytes = [0u8; ADDRESS_LEN];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        let address = Address(bytes);
        assert_eq!(address.state_key().as_address(), Some(address));
    }

    #[test]
    fn named_key_is_not_an_address() {
        assert_eq!(StateKey::named("scoreboard").as_address(), None);
        // Right length, wrong alphabet.
        assert_eq!(StateKey::named("z".repeat(40)).as_address(), None);
        // Uppercase hex is not canonical.
        assert_eq!(StateKey::named("A".repeat(40)).as_address(), None);
    }

    #[test]
    fn from_slice_length_check() {
        assert!(Address::from_slice(&[1u8; ADDRESS_LEN]).is_some());
        assert!(Address::from_slice(&[1u8; 19]).is_none());
    }

    #[test]
    fn plain_value_roundtrip() {
        let address = Address([0x3Cu8; ADDRESS_LEN]);
        assert_eq!(Address::from_value(&address.to_value()).unwrap(), address);
    }
}
