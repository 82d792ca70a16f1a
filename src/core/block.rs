//! Mined blocks: hashing, proof-of-work, and evaluation ordering.

use crate::core::action::Action;
use crate::core::transaction::{Transaction, TransactionError};
use crate::types::address::Address;
use crate::types::hash::{HashDigest, int64_of};
use crate::types::timestamp::Timestamp;
use crate::types::value::{Key, PlainValue, Value, ValueError};
use crate::utils::cancel::CancellationToken;
use rand_core::{OsRng, RngCore};
use std::collections::BTreeMap;
use worldline_derive::Error;

/// Clock skew tolerated on incoming block timestamps.
pub const MAX_FUTURE_SKEW_SECS: i64 = 900;

/// Raised when a nonce search is cancelled before finding a solution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("mining was cancelled before a valid nonce was found")]
pub struct MiningCancelled;

/// Block integrity failures (standalone checks, no chain context).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    /// Timestamp lies beyond the permitted future-skew window.
    #[error("block {index} timestamp {timestamp} is beyond the allowed clock skew (limit {limit})")]
    TimestampTooFarAhead { index: i64, timestamp: Timestamp, limit: Timestamp },
    /// Negative height.
    #[error("block index {0} is negative")]
    NegativeIndex(i64),
    /// Genesis must have difficulty 0; every later block at least 1.
    #[error("block {index} declares invalid difficulty {difficulty}")]
    InvalidDifficulty { index: i64, difficulty: i64 },
    /// Genesis must not reference a parent.
    #[error("genesis block must not declare a previous hash")]
    UnexpectedPreviousHash,
    /// Non-genesis blocks must reference a parent.
    #[error("block {0} lacks a previous hash")]
    MissingPreviousHash(i64),
    /// The recorded hash is not the digest of the header encoding.
    #[error("block {0} hash does not match its header encoding")]
    HashMismatch(i64),
    /// The hash does not carry enough leading zero bits.
    #[error("block {index} hash does not satisfy difficulty {difficulty}")]
    InvalidNonce { index: i64, difficulty: i64 },
    /// The transaction fingerprint does not cover the carried list.
    #[error("block {0} transaction fingerprint does not match its transactions")]
    FingerprintMismatch(i64),
    /// A carried transaction is invalid.
    #[error("{0}")]
    Transaction(TransactionError),
}

impl From<TransactionError> for BlockError {
    fn from(value: TransactionError) -> Self {
        BlockError::Transaction(value)
    }
}

/// Variable-length proof-of-work nonce.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct BlockNonce(pub Vec<u8>);

/// An immutable mined block.
///
/// The hash is fixed at construction; blocks arriving from peers are
/// re-checked with [`Block::validate`] before anything trusts them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block<A: Action> {
    /// 0-based height.
    pub index: i64,
    /// Required leading zero bits of `hash`; 0 exactly for genesis.
    pub difficulty: i64,
    /// Parent hash; `None` exactly for genesis.
    pub previous_hash: Option<HashDigest>,
    /// Creation time; strictly after the parent's along a valid chain.
    pub timestamp: Timestamp,
    /// Beneficiary of the policy block action, if any.
    pub miner: Option<Address>,
    /// Winning proof-of-work nonce.
    pub nonce: BlockNonce,
    /// Digest of the ordered transaction list, absent when empty.
    pub tx_hash: Option<HashDigest>,
    /// Carried transactions, in wire order (signer hex, then nonce).
    pub transactions: Vec<Transaction<A>>,
    /// Digest of the header encoding; satisfies `difficulty`.
    pub hash: HashDigest,
}

impl<A: Action> Block<A> {
    /// Mines a block by searching the nonce space.
    ///
    /// Transactions are put into wire order first, so the fingerprint is
    /// independent of the order the caller collected them in. The search
    /// polls `cancel` between trials and leaves nothing behind when
    /// cancelled.
    pub fn mine(
        index: i64,
        difficulty: i64,
        previous_hash: Option<HashDigest>,
        timestamp: Timestamp,
        miner: Option<Address>,
        transactions: Vec<Transaction<A>>,
        cancel: &CancellationToken,
    ) -> Result<Block<A>, MiningCancelled> {
        let transactions = wire_order(transactions);
        let tx_hash = transaction_fingerprint(&transactions);
        let stamp =
            HashingStamp::new(index, difficulty, previous_hash, timestamp, miner, tx_hash);

        // Random starting point so parallel miners explore disjoint ranges.
        let mut counter = OsRng.next_u64() as u128;
        loop {
            if cancel.is_cancelled() {
                return Err(MiningCancelled);
            }
            let nonce = BlockNonce(minimal_le_bytes(counter));
            let hash = stamp.digest(&nonce);
            if hash.satisfies(difficulty) {
                return Ok(Block {
                    index,
                    difficulty,
                    previous_hash,
                    timestamp,
                    miner,
                    nonce,
                    tx_hash,
                    transactions,
                    hash,
                });
            }
            counter = counter.wrapping_add(1);
        }
    }

    /// Recomputes the header digest from the stored fields.
    pub fn computed_hash(&self) -> HashDigest {
        HashingStamp::new(
            self.index,
            self.difficulty,
            self.previous_hash,
            self.timestamp,
            self.miner,
            self.tx_hash,
        )
        .digest(&self.nonce)
    }

    /// Standalone integrity checks: skew window, genesis shape,
    /// proof-of-work, fingerprint, and every carried transaction.
    pub fn validate(&self) -> Result<(), BlockError> {
        let limit = Timestamp::now().plus_seconds(MAX_FUTURE_SKEW_SECS);
        if self.timestamp > limit {
            return Err(BlockError::TimestampTooFarAhead {
                index: self.index,
                timestamp: self.timestamp,
                limit,
            });
        }

        if self.index < 0 {
            return Err(BlockError::NegativeIndex(self.index));
        }
        if self.index == 0 {
            if self.difficulty != 0 {
                return Err(BlockError::InvalidDifficulty {
                    index: 0,
                    difficulty: self.difficulty,
                });
            }
            if self.previous_hash.is_some() {
                return Err(BlockError::UnexpectedPreviousHash);
            }
        } else {
            if self.difficulty < 1 {
                return Err(BlockError::InvalidDifficulty {
                    index: self.index,
                    difficulty: self.difficulty,
                });
            }
            if self.previous_hash.is_none() {
                return Err(BlockError::MissingPreviousHash(self.index));
            }
        }

        if self.computed_hash() != self.hash {
            return Err(BlockError::HashMismatch(self.index));
        }
        if !self.hash.satisfies(self.difficulty) {
            return Err(BlockError::InvalidNonce {
                index: self.index,
                difficulty: self.difficulty,
            });
        }
        if transaction_fingerprint(&self.transactions) != self.tx_hash {
            return Err(BlockError::FingerprintMismatch(self.index));
        }

        for tx in &self.transactions {
            tx.validate()?;
        }
        Ok(())
    }

    /// Transactions in canonical evaluation order.
    ///
    /// Deterministic but unpredictable before mining: signers are shuffled
    /// by the XOR-fold of their tx ids against the mined hash; within a
    /// signer, nonces ascend.
    pub fn ordered_transactions(&self) -> Vec<&Transaction<A>> {
        let mut groups: BTreeMap<Address, Vec<&Transaction<A>>> = BTreeMap::new();
        for tx in &self.transactions {
            groups.entry(tx.signer).or_default().push(tx);
        }

        let hash_int = int64_of(self.hash.as_slice());
        let mut signers: Vec<(i64, Address)> = groups
            .iter()
            .map(|(signer, txs)| {
                let signer_key = txs
                    .iter()
                    .fold(0i64, |acc, tx| acc ^ int64_of(tx.id().as_slice()));
                (signer_key ^ hash_int, *signer)
            })
            .collect();
        signers.sort_unstable();

        let mut ordered = Vec::with_capacity(self.transactions.len());
        for (_, signer) in signers {
            let mut txs = groups.remove(&signer).unwrap_or_default();
            txs.sort_by_key(|tx| tx.nonce);
            ordered.extend(txs);
        }
        ordered
    }

    /// Lowers the block into its canonical dictionary (header plus the
    /// parallel transaction list).
    pub fn to_value(&self) -> Value {
        let mut entries = header_entries(
            self.index,
            self.difficulty,
            self.previous_hash,
            self.timestamp,
            self.miner,
            self.tx_hash,
        );
        entries.insert(Key::text("nonce"), Value::bytes(self.nonce.0.clone()));
        entries.insert(
            Key::text("transactions"),
            Value::List(self.transactions.iter().map(Transaction::to_value).collect()),
        );
        Value::Dict(entries)
    }

    /// Restores a block from its canonical dictionary, recomputing the hash
    /// from the parsed header.
    pub fn from_value(value: &Value) -> Result<Block<A>, ValueError> {
        let entries = value.as_dict().ok_or(ValueError::Mismatch { expected: "dictionary" })?;
        let field = |name: &'static str| entries.get(&Key::text(name)).ok_or(ValueError::MissingField(name));

        let index = i64::from_value(field("index")?)?;
        let difficulty = i64::from_value(field("difficulty")?)?;
        let timestamp = Timestamp::from_value(field("timestamp")?)?;
        let nonce = BlockNonce(Vec::<u8>::from_value(field("nonce")?)?);

        let previous_hash = match entries.get(&Key::text("previous_hash")) {
            Some(value) => Some(HashDigest::from_value(value)?),
            None => None,
        };
        let miner = match entries.get(&Key::text("reward_beneficiary")) {
            Some(value) => Some(Address::from_value(value)?),
            None => None,
        };
        let tx_hash = match entries.get(&Key::text("transaction_fingerprint")) {
            Some(value) => Some(HashDigest::from_value(value)?),
            None => None,
        };

        let transactions = field("transactions")?
            .as_list()
            .ok_or(ValueError::MalformedField("transactions"))?
            .iter()
            .map(Transaction::from_value)
            .collect::<Result<Vec<_>, _>>()?;

        let hash = HashingStamp::new(index, difficulty, previous_hash, timestamp, miner, tx_hash)
            .digest(&nonce);

        Ok(Block {
            index,
            difficulty,
            previous_hash,
            timestamp,
            miner,
            nonce,
            tx_hash,
            transactions,
            hash,
        })
    }
}

/// Puts transactions into wire order: signer hex, then ascending nonce.
pub(crate) fn wire_order<A: Action>(mut txs: Vec<Transaction<A>>) -> Vec<Transaction<A>> {
    txs.sort_by(|a, b| a.signer.cmp(&b.signer).then(a.nonce.cmp(&b.nonce)));
    txs
}

/// Digest of the ordered transaction list, or `None` when there is none.
pub(crate) fn transaction_fingerprint<A: Action>(txs: &[Transaction<A>]) -> Option<HashDigest> {
    if txs.is_empty() {
        return None;
    }
    let list = Value::List(txs.iter().map(Transaction::to_value).collect());
    let mut builder = HashDigest::sha256();
    list.encode(&mut builder);
    Some(builder.finalize())
}

/// Header entries shared by hashing and serialization (everything except
/// the nonce and the transaction list).
fn header_entries(
    index: i64,
    difficulty: i64,
    previous_hash: Option<HashDigest>,
    timestamp: Timestamp,
    miner: Option<Address>,
    tx_hash: Option<HashDigest>,
) -> BTreeMap<Key, Value> {
    let mut entries = BTreeMap::new();
    entries.insert(Key::text("difficulty"), Value::Int(difficulty));
    entries.insert(Key::text("index"), Value::Int(index));
    if let Some(previous_hash) = previous_hash {
        entries.insert(Key::text("previous_hash"), previous_hash.to_value());
    }
    if let Some(miner) = miner {
        entries.insert(Key::text("reward_beneficiary"), miner.to_value());
    }
    entries.insert(Key::text("timestamp"), timestamp.to_value());
    if let Some(tx_hash) = tx_hash {
        entries.insert(Key::text("transaction_fingerprint"), tx_hash.to_value());
    }
    entries
}

/// Precomputed header encoding split around the nonce.
///
/// Only the nonce varies during the search, so each trial hashes
/// `prefix || nonce || suffix` instead of re-serializing the header.
/// Relies on the canonical key order putting `nonce` after `index` and
/// before `previous_hash`.
pub(crate) struct HashingStamp {
    prefix: Vec<u8>,
    suffix: Vec<u8>,
}

impl HashingStamp {
    pub(crate) fn new(
        index: i64,
        difficulty: i64,
        previous_hash: Option<HashDigest>,
        timestamp: Timestamp,
        miner: Option<Address>,
        tx_hash: Option<HashDigest>,
    ) -> HashingStamp {
        let entries = header_entries(index, difficulty, previous_hash, timestamp, miner, tx_hash);
        let nonce_key = Key::text("nonce");

        let mut prefix = Vec::new();
        let mut suffix = Vec::new();
        prefix.extend_from_slice(b"d");
        for (key, value) in &entries {
            let out = if *key < nonce_key { &mut prefix } else { &mut suffix };
            match key {
                Key::Text(text) => Value::text(text.clone()).encode(out),
                Key::Bytes(bytes) => Value::bytes(bytes.clone()).encode(out),
            }
            value.encode(out);
        }
        Value::text("nonce").encode(&mut prefix);
        suffix.extend_from_slice(b"e");

        HashingStamp { prefix, suffix }
    }

    /// Digest of the header with the given nonce spliced in.
    pub(crate) fn digest(&self, nonce: &BlockNonce) -> HashDigest {
        let mut builder = HashDigest::sha256();
        builder.update(&self.prefix);
        Value::bytes(nonce.0.clone()).encode(&mut builder);
        builder.update(&self.suffix);
        builder.finalize()
    }
}

/// Little-endian bytes of `n` with trailing zeros stripped (at least one
/// byte).
fn minimal_le_bytes(n: u128) -> Vec<u8> {
    let bytes = n.to_le_bytes();
    let len = 16 - bytes.iter().rev().take_while(|b| **b == 0).count();
    bytes[..len.max(1)].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key_pair::PrivateKey;
    use crate::utils::test_utils::{attack, mine_next, sign_tx, test_genesis};

    #[test]
    fn genesis_mines_and_validates() {
        let genesis = test_genesis();
        assert_eq!(genesis.index, 0);
        assert_eq!(genesis.difficulty, 0);
        assert!(genesis.previous_hash.is_none());
        assert!(genesis.tx_hash.is_none());
        assert!(genesis.validate().is_ok());
    }

    #[test]
    fn mined_block_satisfies_difficulty() {
        let genesis = test_genesis();
        let block = mine_next(&genesis, 4, vec![]);
        assert!(block.hash.satisfies(4));
        assert!(block.hash.leading_zero_bits() >= 4);
        assert!(block.validate().is_ok());
    }

    #[test]
    fn stamp_digest_matches_full_header_encoding() {
        let genesis = test_genesis();
        let block = mine_next(&genesis, 2, vec![]);

        // Re-encode the header dictionary in full and hash it.
        let mut entries = header_entries(
            block.index,
            block.difficulty,
            block.previous_hash,
            block.timestamp,
            block.miner,
            block.tx_hash,
        );
        entries.insert(Key::text("nonce"), Value::bytes(block.nonce.0.clone()));
        let mut builder = HashDigest::sha256();
        Value::Dict(entries).encode(&mut builder);

        assert_eq!(builder.finalize(), block.hash);
    }

    #[test]
    fn cancelled_mining_returns_no_block() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = Block::<crate::utils::test_utils::Attack>::mine(
            1,
            1,
            Some(HashDigest::zero()),
            Timestamp::now(),
            None,
            vec![],
            &cancel,
        );
        assert_eq!(result, Err(MiningCancelled));
    }

    #[test]
    fn validate_rejects_far_future_timestamp() {
        let genesis = test_genesis();
        let mut block = mine_next(&genesis, 1, vec![]);
        block.timestamp = Timestamp::now().plus_seconds(MAX_FUTURE_SKEW_SECS + 60);
        block.hash = block.computed_hash();
        assert!(matches!(
            block.validate(),
            Err(BlockError::TimestampTooFarAhead { .. })
        ));
    }

    #[test]
    fn validate_rejects_tampered_header() {
        let genesis = test_genesis();
        let mut block = mine_next(&genesis, 1, vec![]);
        block.difficulty = 2;
        assert!(matches!(block.validate(), Err(BlockError::HashMismatch(_))));
    }

    #[test]
    fn validate_rejects_genesis_with_parent() {
        let genesis = test_genesis();
        let mut tampered = genesis.clone();
        tampered.previous_hash = Some(HashDigest::zero());
        tampered.hash = tampered.computed_hash();
        assert!(matches!(
            tampered.validate(),
            Err(BlockError::UnexpectedPreviousHash)
        ));
    }

    #[test]
    fn validate_rejects_nonzero_genesis_difficulty() {
        let genesis = test_genesis();
        let mut tampered = genesis.clone();
        tampered.difficulty = 1;
        tampered.hash = tampered.computed_hash();
        // Difficulty 1 may coincidentally be satisfied, but the shape rule
        // fires first.
        assert!(matches!(
            tampered.validate(),
            Err(BlockError::InvalidDifficulty { index: 0, .. })
        ));
    }

    #[test]
    fn validate_rejects_missing_parent() {
        let genesis = test_genesis();
        let mut block = mine_next(&genesis, 1, vec![]);
        block.previous_hash = None;
        block.hash = block.computed_hash();
        assert!(matches!(
            block.validate(),
            Err(BlockError::MissingPreviousHash(1))
        ));
    }

    #[test]
    fn validate_rejects_swapped_transactions() {
        let genesis = test_genesis();
        let key = PrivateKey::new();
        let recipient = key.public_key().address();
        let tx = sign_tx(&key, 0, vec![attack("sword", "goblin", recipient)]);
        let block = mine_next(&genesis, 1, vec![tx]);

        let mut tampered = block.clone();
        let other = sign_tx(&PrivateKey::new(), 0, vec![attack("bow", "orc", recipient)]);
        tampered.transactions = vec![other];
        assert!(matches!(
            tampered.validate(),
            Err(BlockError::FingerprintMismatch(1))
        ));
    }

    #[test]
    fn value_roundtrip() {
        let genesis = test_genesis();
        let key = PrivateKey::new();
        let recipient = key.public_key().address();
        let tx = sign_tx(&key, 0, vec![attack("staff", "slime", recipient)]);
        let block = mine_next(&genesis, 1, vec![tx]);

        let decoded = Block::from_value(&block.to_value()).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.hash, block.hash);
        assert!(decoded.validate().is_ok());
    }

    #[test]
    fn empty_block_has_no_fingerprint() {
        let genesis = test_genesis();
        let block = mine_next(&genesis, 1, vec![]);
        assert!(block.tx_hash.is_none());
        let encoded = block.to_value();
        assert!(
            !encoded
                .as_dict()
                .unwrap()
                .contains_key(&Key::text("transaction_fingerprint"))
        );
    }

    #[test]
    fn evaluation_order_groups_signers_and_sorts_nonces() {
        let genesis = test_genesis();
        let alice = PrivateKey::new();
        let bob = PrivateKey::new();
        let target = alice.public_key().address();

        let a0 = sign_tx(&alice, 0, vec![attack("sword", "goblin", target)]);
        let a1 = sign_tx(&alice, 1, vec![attack("sword", "orc", target)]);
        let b0 = sign_tx(&bob, 0, vec![attack("bow", "goblin", target)]);

        let block = mine_next(&genesis, 1, vec![a1.clone(), b0.clone(), a0.clone()]);
        let ordered = block.ordered_transactions();
        assert_eq!(ordered.len(), 3);

        // Within a signer, nonces ascend.
        let alice_positions: Vec<usize> = ordered
            .iter()
            .enumerate()
            .filter(|(_, tx)| tx.signer == a0.signer)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(ordered[alice_positions[0]].nonce, 0);
        assert_eq!(ordered[alice_positions[1]].nonce, 1);
        // A signer's transactions are contiguous.
        assert_eq!(alice_positions[1], alice_positions[0] + 1);

        // Re-running the shuffle is deterministic.
        let again = block.ordered_transactions();
        let ids: Vec<_> = ordered.iter().map(|tx| tx.id()).collect();
        let ids_again: Vec<_> = again.iter().map(|tx| tx.id()).collect();
        assert_eq!(ids, ids_again);
    }

    #[test]
    fn wire_order_is_signer_then_nonce() {
        let alice = PrivateKey::new();
        let target = alice.public_key().address();
        let t0 = sign_tx(&alice, 0, vec![attack("sword", "goblin", target)]);
        let t1 = sign_tx(&alice, 1, vec![attack("sword", "orc", target)]);

        let ordered = wire_order(vec![t1.clone(), t0.clone()]);
        assert_eq!(ordered[0].nonce, 0);
        assert_eq!(ordered[1].nonce, 1);
    }

    #[test]
    fn minimal_le_bytes_strips_trailing_zeros() {
        assert_eq!(minimal_le_bytes(0), vec![0]);
        assert_eq!(minimal_le_bytes(1), vec![1]);
        assert_eq!(minimal_le_bytes(0x0100), vec![0, 1]);
        assert_eq!(minimal_le_bytes(u128::from(u64::MAX)).len(), 8);
    }
}
