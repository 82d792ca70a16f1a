//! Signed transactions carrying ordered action lists.

use crate::core::action::Action;
use crate::crypto::backend::backend;
use crate::crypto::key_pair::{PrivateKey, PublicKey};
use crate::types::address::Address;
use crate::types::hash::{HashDigest, TxId};
use crate::types::timestamp::Timestamp;
use crate::types::value::{Key, PlainValue, Value, ValueError};
use std::collections::{BTreeMap, BTreeSet};
use worldline_derive::Error;

/// Transaction integrity failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransactionError {
    /// The signature does not verify over the unsigned encoding.
    #[error("transaction {0} carries a signature that does not verify")]
    InvalidSignature(TxId),
    /// The declared signer is not the address of the declared public key.
    #[error("transaction {0} declares a signer that its public key does not control")]
    InvalidPublicKey(TxId),
}

/// An immutable, signed list of actions.
///
/// A transaction declares up front the set of addresses it may mutate;
/// evaluation enforces the declaration. The id is content-derived, so a
/// transaction exists at most once in a store no matter how often peers
/// resend it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction<A: Action> {
    /// Address derived from `public_key`; the account whose nonce this
    /// transaction consumes.
    pub signer: Address,
    /// Key the signature verifies under.
    pub public_key: PublicKey,
    /// Per-signer counter; strictly consecutive from zero along a chain.
    pub nonce: i64,
    /// Addresses this transaction is permitted to write.
    pub updated_addresses: BTreeSet<Address>,
    /// Creation time, part of the signed payload.
    pub timestamp: Timestamp,
    /// Ordered actions to evaluate.
    pub actions: Vec<A>,
    /// ECDSA signature over the unsigned canonical encoding.
    pub signature: Vec<u8>,
    id: TxId,
}

impl<A: Action> Transaction<A> {
    /// Creates and signs a transaction.
    pub fn sign(
        key: &PrivateKey,
        nonce: i64,
        updated_addresses: BTreeSet<Address>,
        timestamp: Timestamp,
        actions: Vec<A>,
    ) -> Transaction<A> {
        let public_key = backend().public_key(key);
        let signer = public_key.address();

        let unsigned = transaction_value(
            signer,
            &public_key,
            nonce,
            &updated_addresses,
            timestamp,
            &actions,
            None,
        );
        let signature = backend().sign(key, &unsigned.to_bytes());

        let signed = transaction_value(
            signer,
            &public_key,
            nonce,
            &updated_addresses,
            timestamp,
            &actions,
            Some(&signature),
        );
        let id = digest_value(&signed);

        Transaction {
            signer,
            public_key,
            nonce,
            updated_addresses,
            timestamp,
            actions,
            signature,
            id,
        }
    }

    /// The content-derived identifier.
    pub fn id(&self) -> TxId {
        self.id
    }

    /// Checks the signature and the signer/public-key correspondence.
    pub fn validate(&self) -> Result<(), TransactionError> {
        if self.public_key.address() != self.signer {
            return Err(TransactionError::InvalidPublicKey(self.id));
        }
        let unsigned = self.to_value_inner(false);
        if !backend().verify(&self.public_key, &unsigned.to_bytes(), &self.signature) {
            return Err(TransactionError::InvalidSignature(self.id));
        }
        Ok(())
    }

    /// Lowers the signed transaction into its canonical dictionary.
    pub fn to_value(&self) -> Value {
        self.to_value_inner(true)
    }

    fn to_value_inner(&self, signed: bool) -> Value {
        transaction_value(
            self.signer,
            &self.public_key,
            self.nonce,
            &self.updated_addresses,
            self.timestamp,
            &self.actions,
            signed.then_some(self.signature.as_slice()),
        )
    }

    /// Restores a transaction from its canonical dictionary.
    ///
    /// The id is recomputed from the re-encoded dictionary, so a value that
    /// was not canonical cannot smuggle in a different identity.
    pub fn from_value(value: &Value) -> Result<Transaction<A>, ValueError> {
        let entries = value.as_dict().ok_or(ValueError::Mismatch { expected: "dictionary" })?;
        let field = |name: &'static str| entries.get(&Key::text(name)).ok_or(ValueError::MissingField(name));

        let signer = Address::from_value(field("signer")?)?;
        let public_key = field("public_key")?
            .as_bytes()
            .and_then(PublicKey::from_bytes)
            .ok_or(ValueError::MalformedField("public_key"))?;
        let nonce = i64::from_value(field("nonce")?)?;
        let timestamp = Timestamp::from_value(field("timestamp")?)?;
        let signature = Vec::<u8>::from_value(field("signature")?)?;

        let updated_addresses = field("updated_addresses")?
            .as_list()
            .ok_or(ValueError::MalformedField("updated_addresses"))?
            .iter()
            .map(Address::from_value)
            .collect::<Result<BTreeSet<_>, _>>()?;

        let actions = field("actions")?
            .as_list()
            .ok_or(ValueError::MalformedField("actions"))?
            .iter()
            .map(A::load_plain_value)
            .collect::<Result<Vec<_>, _>>()?;

        let signed = transaction_value(
            signer,
            &public_key,
            nonce,
            &updated_addresses,
            timestamp,
            &actions,
            Some(&signature),
        );
        let id = digest_value(&signed);

        Ok(Transaction {
            signer,
            public_key,
            nonce,
            updated_addresses,
            timestamp,
            actions,
            signature,
            id,
        })
    }
}

/// Builds the canonical transaction dictionary, with or without the
/// signature entry.
fn transaction_value<A: Action>(
    signer: Address,
    public_key: &PublicKey,
    nonce: i64,
    updated_addresses: &BTreeSet<Address>,
    timestamp: Timestamp,
    actions: &[A],
    signature: Option<&[u8]>,
) -> Value {
    let mut entries = BTreeMap::new();
    entries.insert(
        Key::text("actions"),
        Value::List(actions.iter().map(A::plain_value).collect()),
    );
    entries.insert(Key::text("nonce"), Value::Int(nonce));
    entries.insert(Key::text("public_key"), Value::bytes(public_key.to_bytes()));
    if let Some(signature) = signature {
        entries.insert(Key::text("signature"), Value::bytes(signature.to_vec()));
    }
    entries.insert(Key::text("signer"), signer.to_value());
    entries.insert(Key::text("timestamp"), timestamp.to_value());
    entries.insert(
        Key::text("updated_addresses"),
        Value::List(updated_addresses.iter().map(Address::to_value).collect()),
    );
    Value::Dict(entries)
}

/// Digest of a value's canonical encoding, streamed without buffering.
fn digest_value(value: &Value) -> HashDigest {
    let mut builder = HashDigest::sha256();
    value.encode(&mut builder);
    builder.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::{Attack, attack, sign_tx};

    #[test]
    fn sign_produces_valid_transaction() {
        let key = PrivateKey::new();
        let tx = sign_tx(&key, 0, vec![attack("sword", "goblin", key.public_key().address())]);

        assert_eq!(tx.signer, key.public_key().address());
        assert!(tx.validate().is_ok());
    }

    #[test]
    fn id_is_deterministic_and_signature_sensitive() {
        let key = PrivateKey::new();
        let recipient = key.public_key().address();
        let timestamp = Timestamp::from_micros(1_700_000_000_000_000);
        let actions = vec![attack("sword", "goblin", recipient)];

        let a = Transaction::sign(&key, 0, BTreeSet::from([recipient]), timestamp, actions.clone());
        let b = Transaction::sign(&key, 0, BTreeSet::from([recipient]), timestamp, actions);

        // ECDSA here is deterministic (RFC 6979), so identical payloads sign
        // identically and share an id.
        assert_eq!(a.id(), b.id());

        let other_key = PrivateKey::new();
        let c = sign_tx(&other_key, 0, vec![attack("sword", "goblin", recipient)]);
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn validate_rejects_foreign_public_key() {
        let key = PrivateKey::new();
        let mut tx = sign_tx(&key, 0, vec![attack("bow", "orc", key.public_key().address())]);
        tx.public_key = PrivateKey::new().public_key();

        assert!(matches!(tx.validate(), Err(TransactionError::InvalidPublicKey(_))));
    }

    #[test]
    fn validate_rejects_tampered_payload() {
        let key = PrivateKey::new();
        let recipient = key.public_key().address();
        let mut tx = sign_tx(&key, 0, vec![attack("bow", "orc", recipient)]);
        tx.nonce = 9;

        assert!(matches!(tx.validate(), Err(TransactionError::InvalidSignature(_))));
    }

    #[test]
    fn value_roundtrip_preserves_everything() {
        let key = PrivateKey::new();
        let recipient = key.public_key().address();
        let tx = sign_tx(&key, 3, vec![
            attack("sword", "goblin", recipient),
            attack("staff", "orc", recipient),
        ]);

        let decoded = Transaction::<Attack>::from_value(&tx.to_value()).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.id(), tx.id());
        assert!(decoded.validate().is_ok());
    }

    #[test]
    fn from_value_rejects_missing_fields() {
        let key = PrivateKey::new();
        let tx = sign_tx(&key, 0, vec![attack("sword", "goblin", key.public_key().address())]);

        let mut entries = tx.to_value().as_dict().unwrap().clone();
        entries.remove(&Key::text("signature"));
        let result = Transaction::<Attack>::from_value(&Value::Dict(entries));
        assert_eq!(result.unwrap_err(), ValueError::MissingField("signature"));
    }

    #[test]
    fn unsigned_encoding_omits_signature() {
        let key = PrivateKey::new();
        let tx = sign_tx(&key, 0, vec![attack("sword", "goblin", key.public_key().address())]);

        let signed = tx.to_value();
        let unsigned = tx.to_value_inner(false);
        assert!(signed.as_dict().unwrap().contains_key(&Key::text("signature")));
        assert!(!unsigned.as_dict().unwrap().contains_key(&Key::text("signature")));
    }
}
