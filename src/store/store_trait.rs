//! The persistence contract the chain engine runs against.
//!
//! A store is purely a data substrate: blocks and transactions are
//! content-addressed and shared, while each chain view carries its own
//! index, state-reference table, and nonce table. The store knows nothing
//! about consensus or actions.

use crate::core::action::{Action, StateDelta};
use crate::core::block::Block;
use crate::core::transaction::Transaction;
use crate::types::address::{Address, StateKey};
use crate::types::chain_id::ChainId;
use crate::types::hash::{HashDigest, TxId};
use std::collections::{BTreeMap, BTreeSet};
use worldline_derive::Error;

/// Store failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Backing I/O failed.
    #[error("store backend fault: {0}")]
    Fault(String),
    /// The referenced chain was never given an identity.
    #[error("chain {0} has no recorded identity")]
    ChainIdNotFound(ChainId),
    /// An index range was inverted.
    #[error("inverted index range: lowest {lowest} exceeds highest {highest}")]
    RangeError { lowest: i64, highest: i64 },
    /// A bulk copy targeted a store that already holds a chain.
    #[error("destination store already holds a chain")]
    NonEmptyDestination,
    /// An index append did not land at the tail of the chain.
    #[error("index append at position {actual} is not at the tail {expected}")]
    IndexOutOfOrder { expected: i64, actual: i64 },
}

/// Persistence operations the engine depends on.
///
/// Every operation must be atomic under concurrent callers; `put_tx` and
/// `put_block` in particular see unbounded parallelism from peer handlers.
/// (`'static` because evaluation hands shared store handles to lazy state
/// readers.)
pub trait Store<A: Action>: Send + Sync + 'static {
    // Chain identities.

    /// All chains with a recorded identity.
    fn list_chain_ids(&self) -> Result<BTreeSet<ChainId>, StoreError>;

    /// The chain currently marked canonical, if any.
    fn canonical_chain_id(&self) -> Result<Option<ChainId>, StoreError>;

    /// Marks a chain canonical, recording its identity.
    fn set_canonical_chain_id(&self, id: ChainId) -> Result<(), StoreError>;

    /// Removes a chain's identity, index, state references, and nonce
    /// table. Blocks and transactions stay. Idempotent.
    fn delete_chain_id(&self, id: ChainId) -> Result<(), StoreError>;

    // Chain indices.

    /// Appends a block hash at the tail of a chain's index, returning its
    /// 0-based position. `at` is the position the caller expects the entry
    /// to land at (the block's height); anything other than the current
    /// length fails with [`StoreError::IndexOutOfOrder`].
    fn append_index(&self, chain: ChainId, hash: HashDigest, at: i64)
    -> Result<i64, StoreError>;

    /// Number of entries in a chain's index.
    fn count_index(&self, chain: ChainId) -> Result<i64, StoreError>;

    /// The hash at `offset`; negative offsets count from the tail
    /// (`-1` is the tip).
    fn index_block_hash(&self, chain: ChainId, offset: i64)
    -> Result<Option<HashDigest>, StoreError>;

    /// Index entries genesis-first, skipping `offset`, at most `limit`.
    fn iterate_indexes(
        &self,
        chain: ChainId,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<HashDigest>, StoreError>;

    // Blocks.

    fn put_block(&self, block: &Block<A>) -> Result<(), StoreError>;
    fn get_block(&self, hash: &HashDigest) -> Result<Option<Block<A>>, StoreError>;
    fn delete_block(&self, hash: &HashDigest) -> Result<bool, StoreError>;
    fn contains_block(&self, hash: &HashDigest) -> Result<bool, StoreError>;

    /// The height a stored block declares, without loading its body.
    fn get_block_index(&self, hash: &HashDigest) -> Result<Option<i64>, StoreError>;

    fn iterate_block_hashes(&self) -> Result<Vec<HashDigest>, StoreError>;
    fn count_blocks(&self) -> Result<i64, StoreError>;

    // Transactions.

    fn put_tx(&self, tx: &Transaction<A>) -> Result<(), StoreError>;
    fn get_tx(&self, id: &TxId) -> Result<Option<Transaction<A>>, StoreError>;
    fn delete_tx(&self, id: &TxId) -> Result<bool, StoreError>;
    fn contains_tx(&self, id: &TxId) -> Result<bool, StoreError>;
    fn iterate_tx_ids(&self) -> Result<Vec<TxId>, StoreError>;
    fn count_txs(&self) -> Result<i64, StoreError>;

    // Staging.

    /// Stages transactions; the flag marks them broadcastable (`true`) or
    /// quarantined (`false`).
    fn stage_tx_ids(&self, ids: BTreeMap<TxId, bool>) -> Result<(), StoreError>;

    fn unstage_tx_ids(&self, ids: &BTreeSet<TxId>) -> Result<(), StoreError>;
    fn iterate_staged_tx_ids(&self) -> Result<Vec<TxId>, StoreError>;

    // Block states.

    /// Records the post-state of every key a block touched.
    fn set_block_states(&self, hash: &HashDigest, states: StateDelta) -> Result<(), StoreError>;

    fn get_block_states(&self, hash: &HashDigest) -> Result<Option<StateDelta>, StoreError>;

    // State references.

    /// Binds every key in `keys` to the given block. Idempotent per
    /// `(chain, key, hash)`.
    fn store_state_reference(
        &self,
        chain: ChainId,
        keys: &BTreeSet<StateKey>,
        hash: HashDigest,
        index: i64,
    ) -> Result<(), StoreError>;

    /// The newest reference for `key` at or below `at_index`.
    fn lookup_state_reference(
        &self,
        chain: ChainId,
        key: &StateKey,
        at_index: i64,
    ) -> Result<Option<(HashDigest, i64)>, StoreError>;

    /// References for `key` within `[lowest, highest]`, descending by
    /// index, at most `limit`. `highest == None` means the chain tail.
    fn iterate_state_references(
        &self,
        chain: ChainId,
        key: &StateKey,
        lowest: i64,
        highest: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<(HashDigest, i64)>, StoreError>;

    /// Every key with at least one reference on the chain.
    fn list_state_keys(&self, chain: ChainId) -> Result<BTreeSet<StateKey>, StoreError>;

    /// All references within `[lowest, highest]`, per key, ascending by
    /// index.
    fn list_all_state_references(
        &self,
        chain: ChainId,
        lowest: i64,
        highest: Option<i64>,
    ) -> Result<BTreeMap<StateKey, Vec<HashDigest>>, StoreError>;

    /// Copies every reference of `source` with index at or below the
    /// branchpoint into `dest`. Fails with [`StoreError::ChainIdNotFound`]
    /// only when `source` has no recorded identity; an identified chain
    /// with no references succeeds. The caller copies the shared index
    /// prefix separately.
    fn fork_state_references(
        &self,
        source: ChainId,
        dest: ChainId,
        branchpoint_index: i64,
    ) -> Result<(), StoreError>;

    // Nonces.

    /// The next expected nonce for a signer; 0 when never seen.
    fn get_tx_nonce(&self, chain: ChainId, signer: &Address) -> Result<i64, StoreError>;

    fn increase_tx_nonce(
        &self,
        chain: ChainId,
        signer: &Address,
        delta: i64,
    ) -> Result<(), StoreError>;

    fn list_tx_nonces(&self, chain: ChainId) -> Result<BTreeMap<Address, i64>, StoreError>;

    // Bulk copy.

    /// Copies chain identities, indices, blocks, transactions, block
    /// states, state references, nonces, and staged ids into `target`.
    /// Fails with [`StoreError::NonEmptyDestination`] when `target`
    /// already holds a chain.
    fn copy_to<T: Store<A>>(&self, target: &T) -> Result<(), StoreError>
    where
        Self: Sized,
    {
        if !target.list_chain_ids()?.is_empty() {
            return Err(StoreError::NonEmptyDestination);
        }

        for hash in self.iterate_block_hashes()? {
            if let Some(block) = self.get_block(&hash)? {
                target.put_block(&block)?;
            }
            if let Some(states) = self.get_block_states(&hash)? {
                target.set_block_states(&hash, states)?;
            }
        }
        for id in self.iterate_tx_ids()? {
            if let Some(tx) = self.get_tx(&id)? {
                target.put_tx(&tx)?;
            }
        }
        target.stage_tx_ids(
            self.iterate_staged_tx_ids()?
                .into_iter()
                .map(|id| (id, true))
                .collect(),
        )?;

        for chain in self.list_chain_ids()? {
            for (at, hash) in self.iterate_indexes(chain, 0, None)?.into_iter().enumerate() {
                target.append_index(chain, hash, at as i64)?;
            }
            for (key, hashes) in self.list_all_state_references(chain, 0, None)? {
                let keys = BTreeSet::from([key]);
                for hash in hashes {
                    if let Some(index) = self.get_block_index(&hash)? {
                        target.store_state_reference(chain, &keys, hash, index)?;
                    }
                }
            }
            for (signer, nonce) in self.list_tx_nonces(chain)? {
                target.increase_tx_nonce(chain, &signer, nonce)?;
            }
        }
        if let Some(id) = self.canonical_chain_id()? {
            target.set_canonical_chain_id(id)?;
        }
        Ok(())
    }
}
