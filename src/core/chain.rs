//! The chain engine: append, validate, evaluate, mine, and reorganize.

use crate::core::action::{Action, ActionContext, ActionError, StateDelta, StateReader};
use crate::core::block::{Block, BlockError, MiningCancelled};
use crate::core::policy::{BlockPolicy, PolicyViolation};
use crate::core::transaction::{Transaction, TransactionError};
use crate::crypto::backend::backend;
use crate::crypto::key_pair::PrivateKey;
use crate::net::{BlockLocator, FIND_NEXT_HASHES_COUNT, PeerHandler};
use crate::render::renderer::Renderer;
use crate::store::store_trait::{Store, StoreError};
use crate::types::address::{Address, StateKey};
use crate::types::chain_id::ChainId;
use crate::types::hash::{HashDigest, TxId, int32_of};
use crate::types::timestamp::Timestamp;
use crate::types::value::Value;
use crate::utils::cancel::CancellationToken;
use crate::{info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, RwLock};
use worldline_derive::Error;

/// Failures raised by chain operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// Standalone block integrity failure.
    #[error("{0}")]
    Block(BlockError),
    /// Transaction integrity failure.
    #[error("{0}")]
    Transaction(TransactionError),
    /// The host policy rejected the block.
    #[error("{0}")]
    Policy(PolicyViolation),
    /// The store failed.
    #[error("{0}")]
    Store(StoreError),
    /// Height does not continue the index.
    #[error("block declares index {actual} but the chain expects {expected}")]
    UnexpectedIndex { expected: i64, actual: i64 },
    /// The block does not descend from the current tip.
    #[error("block {index} does not extend the current tip {expected}")]
    PreviousHashMismatch { index: i64, expected: HashDigest },
    /// Timestamps must strictly increase along a chain.
    #[error("block {index} timestamp {timestamp} is not after its parent's {parent}")]
    TimestampNotAfterParent { index: i64, timestamp: Timestamp, parent: Timestamp },
    /// The block undercuts the policy difficulty.
    #[error("block {index} difficulty {actual} is below the required {required}")]
    DifficultyTooLow { index: i64, required: i64, actual: i64 },
    /// A per-signer nonce is not the strict successor.
    #[error("transaction {id} of signer {signer} declares nonce {actual}, expected {expected}")]
    InvalidTxNonce { id: TxId, signer: Address, expected: i64, actual: i64 },
    /// An action wrote an address outside the declared update set.
    #[error("transaction {id} wrote address {address} outside its declared update set")]
    UpdatedAddressesViolation { id: TxId, address: Address },
    /// Two blocks share no common ancestor.
    #[error("blocks {a} and {b} share no common ancestor")]
    OrphanChain { a: HashDigest, b: HashDigest },
    /// A referenced block is not in the store.
    #[error("block {0} is not stored")]
    MissingBlock(HashDigest),
    /// The store already holds a chain with a different genesis.
    #[error("the store already holds a different genesis block")]
    GenesisMismatch,
    /// Mining was cancelled; nothing was appended or rendered.
    #[error("mining was cancelled")]
    MiningCancelled,
}

impl From<BlockError> for ChainError {
    fn from(value: BlockError) -> Self {
        ChainError::Block(value)
    }
}

impl From<TransactionError> for ChainError {
    fn from(value: TransactionError) -> Self {
        ChainError::Transaction(value)
    }
}

impl From<PolicyViolation> for ChainError {
    fn from(value: PolicyViolation) -> Self {
        ChainError::Policy(value)
    }
}

impl From<StoreError> for ChainError {
    fn from(value: StoreError) -> Self {
        ChainError::Store(value)
    }
}

impl From<MiningCancelled> for ChainError {
    fn from(_: MiningCancelled) -> Self {
        ChainError::MiningCancelled
    }
}

/// One evaluated action: what ran, under which context, and either the
/// cumulative post-state of the block up to that action or the failure.
#[derive(Clone, Debug)]
pub struct ActionRecord<A: Action> {
    pub action: A,
    pub context: ActionContext,
    pub result: Result<StateDelta, ActionError>,
}

/// Lazy state view for one action: the block delta accumulated so far,
/// overlaying the chain state as of the parent block.
struct EvalReader<A: Action, S: Store<A>> {
    store: Arc<S>,
    chain: ChainId,
    upper_index: i64,
    overlay: StateDelta,
    _actions: PhantomData<fn() -> A>,
}

impl<A: Action, S: Store<A>> StateReader for EvalReader<A, S> {
    fn read(&self, key: &StateKey) -> Option<Value> {
        if let Some(value) = self.overlay.get(key) {
            return Some(value.clone());
        }
        if self.upper_index < 0 {
            return None;
        }
        let looked_up = self
            .store
            .lookup_state_reference(self.chain, key, self.upper_index)
            .and_then(|reference| match reference {
                None => Ok(None),
                Some((hash, _)) => self.store.get_block_states(&hash),
            });
        match looked_up {
            Ok(states) => states.and_then(|mut states| states.remove(key)),
            Err(error) => {
                warn!("state lookup for key {key} failed: {error}");
                None
            }
        }
    }
}

/// A proof-of-work chain bound to a store, a policy, and a renderer stack.
///
/// Appends are serialized behind one lock; state reads only take the
/// canonical-id read lock and go straight to the store indices.
pub struct BlockChain<A: Action, S: Store<A>, P: BlockPolicy<A>> {
    store: Arc<S>,
    policy: P,
    renderers: Vec<Arc<dyn Renderer<A>>>,
    canonical: RwLock<ChainId>,
    append_lock: Mutex<()>,
}

impl<A: Action, S: Store<A>, P: BlockPolicy<A>> BlockChain<A, S, P> {
    /// Opens the chain in `store`, creating it from `genesis` when the
    /// store is empty.
    ///
    /// A fresh chain appends the genesis block without emitting renderer
    /// events; a resumed chain checks that the stored genesis matches.
    pub fn new(
        store: Arc<S>,
        policy: P,
        renderers: Vec<Arc<dyn Renderer<A>>>,
        genesis: Block<A>,
    ) -> Result<Self, ChainError> {
        match store.canonical_chain_id()? {
            Some(id) => {
                if store.index_block_hash(id, 0)? != Some(genesis.hash) {
                    return Err(ChainError::GenesisMismatch);
                }
                Ok(BlockChain {
                    store,
                    policy,
                    renderers,
                    canonical: RwLock::new(id),
                    append_lock: Mutex::new(()),
                })
            }
            None => {
                let id = ChainId::random();
                store.set_canonical_chain_id(id)?;
                let chain = BlockChain {
                    store,
                    policy,
                    renderers,
                    canonical: RwLock::new(id),
                    append_lock: Mutex::new(()),
                };
                chain.append_to(id, &genesis)?;
                info!("initialized chain {id} with genesis {}", genesis.hash);
                Ok(chain)
            }
        }
    }

    /// The canonical chain id.
    pub fn id(&self) -> ChainId {
        *self.canonical.read().unwrap()
    }

    /// Number of blocks on the canonical chain.
    pub fn len(&self) -> Result<i64, ChainError> {
        Ok(self.store.count_index(self.id())?)
    }

    /// True only for a store with no appended genesis (never after `new`).
    pub fn is_empty(&self) -> Result<bool, ChainError> {
        Ok(self.len()? == 0)
    }

    /// The canonical tip block.
    pub fn tip(&self) -> Result<Block<A>, ChainError> {
        self.tip_of(self.id())?.ok_or(ChainError::MissingBlock(HashDigest::zero()))
    }

    /// The canonical block at `index`, negative counting from the tip.
    pub fn block_at(&self, index: i64) -> Result<Option<Block<A>>, ChainError> {
        match self.store.index_block_hash(self.id(), index)? {
            None => Ok(None),
            Some(hash) => Ok(Some(self.require_block(&hash)?)),
        }
    }

    /// Sum of difficulties along the canonical chain.
    pub fn total_difficulty(&self) -> Result<i64, ChainError> {
        let mut total = 0i64;
        for hash in self.store.iterate_indexes(self.id(), 0, None)? {
            total += self.require_block(&hash)?.difficulty;
        }
        Ok(total)
    }

    /// Validates and appends a block to the canonical chain, then emits
    /// renderer events. Rejection leaves no observable writes.
    pub fn append(&self, block: Block<A>) -> Result<(), ChainError> {
        let _guard = self.append_lock.lock().unwrap();
        let chain = self.id();
        let old_tip = self.tip_of(chain)?;
        let records = self.append_to(chain, &block)?;
        info!(
            "appended block: index={} hash={} transactions={}",
            block.index,
            block.hash,
            block.transactions.len()
        );
        self.render_append(old_tip.as_ref(), &block, &records);
        Ok(())
    }

    /// Reads one key's state as of `at` (default: the tip).
    pub fn get_state(
        &self,
        key: &StateKey,
        at: Option<&HashDigest>,
    ) -> Result<Option<Value>, ChainError> {
        let chain = self.id();
        let upper = match at {
            Some(hash) => self
                .store
                .get_block_index(hash)?
                .ok_or(ChainError::MissingBlock(*hash))?,
            None => self.store.count_index(chain)? - 1,
        };
        match self.store.lookup_state_reference(chain, key, upper)? {
            None => Ok(None),
            Some((hash, _)) => Ok(self
                .store
                .get_block_states(&hash)?
                .and_then(|mut states| states.remove(key))),
        }
    }

    /// Batch form of [`BlockChain::get_state`].
    pub fn get_states(
        &self,
        keys: &[StateKey],
        at: Option<&HashDigest>,
    ) -> Result<BTreeMap<StateKey, Option<Value>>, ChainError> {
        let mut states = BTreeMap::new();
        for key in keys {
            states.insert(key.clone(), self.get_state(key, at)?);
        }
        Ok(states)
    }

    /// Validates and stages a transaction for future blocks.
    pub fn stage_transaction(&self, tx: Transaction<A>) -> Result<(), ChainError> {
        tx.validate()?;
        self.store.put_tx(&tx)?;
        self.store.stage_tx_ids(BTreeMap::from([(tx.id(), true)]))?;
        Ok(())
    }

    /// Drops a transaction from staging (the tx itself stays stored).
    pub fn unstage_transaction(&self, id: TxId) -> Result<(), ChainError> {
        self.store.unstage_tx_ids(&BTreeSet::from([id]))?;
        Ok(())
    }

    /// Signs a transaction with the next free nonce for the key's address
    /// (counting staged transactions) and stages it.
    pub fn make_transaction(
        &self,
        key: &PrivateKey,
        updated_addresses: BTreeSet<Address>,
        actions: Vec<A>,
    ) -> Result<Transaction<A>, ChainError> {
        let signer = backend().public_key(key).address();
        let chain = self.id();
        let mut nonce = self.store.get_tx_nonce(chain, &signer)?;
        for id in self.store.iterate_staged_tx_ids()? {
            if let Some(staged) = self.store.get_tx(&id)?
                && staged.signer == signer
                && staged.nonce >= nonce
            {
                nonce = staged.nonce + 1;
            }
        }
        let tx = Transaction::sign(key, nonce, updated_addresses, Timestamp::now(), actions);
        self.stage_transaction(tx.clone())?;
        Ok(tx)
    }

    /// Mines the next block from the staged transactions and appends it.
    ///
    /// Polls `cancel` between nonce trials; on cancellation nothing is
    /// written and no renderer events fire.
    pub fn mine_block(
        &self,
        miner: Address,
        cancel: &CancellationToken,
    ) -> Result<Block<A>, ChainError> {
        let chain = self.id();
        let tip = self.tip()?;
        let parent = self.parent_of(&tip)?;
        let difficulty = self.policy.next_difficulty(Some(&tip), parent.as_ref()).max(1);
        let transactions = self.collect_staged(chain)?;

        // The chain rule wants strictly increasing timestamps, so nudge
        // past the tip when the clock has not moved.
        let now = Timestamp::now();
        let timestamp = if now > tip.timestamp {
            now
        } else {
            Timestamp::from_micros(tip.timestamp.as_micros() + 1)
        };

        let block = Block::mine(
            tip.index + 1,
            difficulty,
            Some(tip.hash),
            timestamp,
            Some(miner),
            transactions,
            cancel,
        )?;
        self.append(block.clone())?;
        info!("mined block {} at index {}", block.hash, block.index);
        Ok(block)
    }

    /// Ingests a block heard from a peer.
    ///
    /// Extending blocks append; a known hash is ignored; a side-branch
    /// block is kept and, when its branch carries strictly more cumulative
    /// work than the canonical chain, reorganized onto.
    pub fn handle_received_block(&self, block: Block<A>) -> Result<(), ChainError> {
        let tip = self.tip()?;
        if block.previous_hash == Some(tip.hash) {
            return self.append(block);
        }
        if self.store.contains_block(&block.hash)? {
            return Ok(());
        }

        block.validate()?;
        self.store.put_block(&block)?;
        let branch_work = self.branch_total_difficulty(&block)?;
        if branch_work > self.total_difficulty()? {
            self.swap(block)
        } else {
            Ok(())
        }
    }

    /// Validates and stages a transaction heard from a peer.
    pub fn handle_received_tx(&self, tx: Transaction<A>) -> Result<(), ChainError> {
        self.stage_transaction(tx)
    }

    /// Builds the sparse locator for sync: tip-first with doubling
    /// step-back, ending at genesis.
    pub fn get_locator(&self) -> Result<BlockLocator, ChainError> {
        let chain = self.id();
        let tip_index = self.store.count_index(chain)? - 1;
        if tip_index < 0 {
            return Ok(BlockLocator::default());
        }

        let mut hashes = Vec::new();
        let mut current = tip_index;
        let mut step = 1i64;
        loop {
            let hash = self
                .store
                .index_block_hash(chain, current)?
                .ok_or(ChainError::MissingBlock(HashDigest::zero()))?;
            hashes.push(hash);
            if current == 0 {
                break;
            }
            current = (current - step).max(0);
            step *= 2;
        }
        Ok(BlockLocator(hashes))
    }

    /// Hashes following the first locator entry found on the canonical
    /// chain: at most `count`, stopping after `stop` inclusive.
    pub fn find_next_hashes(
        &self,
        locator: &BlockLocator,
        stop: Option<HashDigest>,
        count: usize,
    ) -> Result<Vec<HashDigest>, ChainError> {
        let chain = self.id();
        let mut start = None;
        for hash in locator.hashes() {
            if let Some(index) = self.store.get_block_index(hash)?
                && self.store.index_block_hash(chain, index)? == Some(*hash)
            {
                start = Some(index);
                break;
            }
        }
        let Some(start) = start else {
            return Ok(Vec::new());
        };

        let mut result = Vec::new();
        for hash in self.store.iterate_indexes(chain, (start + 1) as usize, Some(count))? {
            result.push(hash);
            if Some(hash) == stop {
                break;
            }
        }
        Ok(result)
    }

    /// Loads the requested blocks, skipping unknown hashes.
    pub fn get_blocks_by_hashes(
        &self,
        hashes: &[HashDigest],
    ) -> Result<Vec<Block<A>>, ChainError> {
        let mut blocks = Vec::new();
        for hash in hashes {
            if let Some(block) = self.store.get_block(hash)? {
                blocks.push(block);
            }
        }
        Ok(blocks)
    }

    // ── internals ──────────────────────────────────────────────────────

    fn require_block(&self, hash: &HashDigest) -> Result<Block<A>, ChainError> {
        self.store.get_block(hash)?.ok_or(ChainError::MissingBlock(*hash))
    }

    fn tip_of(&self, chain: ChainId) -> Result<Option<Block<A>>, ChainError> {
        match self.store.index_block_hash(chain, -1)? {
            None => Ok(None),
            Some(hash) => Ok(Some(self.require_block(&hash)?)),
        }
    }

    /// The stored parent, or `None` for genesis or an unknown parent hash.
    fn parent_of(&self, block: &Block<A>) -> Result<Option<Block<A>>, ChainError> {
        match block.previous_hash {
            None => Ok(None),
            Some(hash) => Ok(self.store.get_block(&hash)?),
        }
    }

    /// Chain-contextual validation of the candidate against the tip of
    /// `chain`, then the per-signer nonce rule, then the host policy.
    fn validate_next(
        &self,
        chain: ChainId,
        tip: Option<&Block<A>>,
        block: &Block<A>,
    ) -> Result<(), ChainError> {
        block.validate()?;

        let expected = self.store.count_index(chain)?;
        if block.index != expected {
            return Err(ChainError::UnexpectedIndex { expected, actual: block.index });
        }

        if let Some(tip) = tip {
            if block.previous_hash != Some(tip.hash) {
                return Err(ChainError::PreviousHashMismatch {
                    index: block.index,
                    expected: tip.hash,
                });
            }
            if block.timestamp <= tip.timestamp {
                return Err(ChainError::TimestampNotAfterParent {
                    index: block.index,
                    timestamp: block.timestamp,
                    parent: tip.timestamp,
                });
            }
            let parent = self.parent_of(tip)?;
            let required = self.policy.next_difficulty(Some(tip), parent.as_ref());
            if block.difficulty < required {
                return Err(ChainError::DifficultyTooLow {
                    index: block.index,
                    required,
                    actual: block.difficulty,
                });
            }
        }

        // Per-signer nonces must continue the chain's nonce table without
        // gaps, counting earlier transactions in this same block.
        let mut groups: BTreeMap<Address, Vec<&Transaction<A>>> = BTreeMap::new();
        for tx in &block.transactions {
            groups.entry(tx.signer).or_default().push(tx);
        }
        for (signer, mut txs) in groups {
            txs.sort_by_key(|tx| tx.nonce);
            let base = self.store.get_tx_nonce(chain, &signer)?;
            for (offset, tx) in txs.iter().enumerate() {
                let expected = base + offset as i64;
                if tx.nonce != expected {
                    return Err(ChainError::InvalidTxNonce {
                        id: tx.id(),
                        signer,
                        expected,
                        actual: tx.nonce,
                    });
                }
            }
        }

        self.policy.validate_next_block(tip, block)?;
        Ok(())
    }

    fn state_reader(&self, chain: ChainId, upper_index: i64, overlay: StateDelta) -> Arc<dyn StateReader> {
        Arc::new(EvalReader::<A, S> {
            store: Arc::clone(&self.store),
            chain,
            upper_index,
            overlay,
            _actions: PhantomData,
        })
    }

    /// Evaluates a block's actions in canonical order, returning the
    /// per-action records and the block's accumulated state delta.
    ///
    /// Action failures are recorded, not raised; writing outside the
    /// declared update set is the one evaluation-time offense that
    /// invalidates the whole block.
    fn evaluate(
        &self,
        chain: ChainId,
        block: &Block<A>,
    ) -> Result<(Vec<ActionRecord<A>>, StateDelta), ChainError> {
        let parent_index = block.index - 1;
        let block_hash_int = int32_of(block.hash.as_slice());
        let mut cumulative = StateDelta::new();
        let mut records = Vec::new();

        for tx in block.ordered_transactions() {
            let signature_int = int32_of(&tx.signature);
            for (action_index, action) in tx.actions.iter().enumerate() {
                let random_seed = block_hash_int ^ signature_int ^ action_index as i32;
                let context = ActionContext::new(
                    tx.signer,
                    block.miner,
                    block.index,
                    block.hash,
                    random_seed,
                    self.state_reader(chain, parent_index, cumulative.clone()),
                );
                match action.execute(&context) {
                    Ok(delta) => {
                        for key in delta.keys() {
                            if let Some(address) = key.as_address()
                                && !tx.updated_addresses.contains(&address)
                            {
                                return Err(ChainError::UpdatedAddressesViolation {
                                    id: tx.id(),
                                    address,
                                });
                            }
                        }
                        cumulative.extend(delta);
                        records.push(ActionRecord {
                            action: action.clone(),
                            context,
                            result: Ok(cumulative.clone()),
                        });
                    }
                    Err(error) => records.push(ActionRecord {
                        action: action.clone(),
                        context,
                        result: Err(error),
                    }),
                }
            }
        }

        // The policy's once-per-block action runs last, signed by the
        // miner, with no update-set restriction.
        if let Some(action) = self.policy.block_action()
            && let Some(miner) = block.miner
        {
            let context = ActionContext::new(
                miner,
                block.miner,
                block.index,
                block.hash,
                block_hash_int,
                self.state_reader(chain, parent_index, cumulative.clone()),
            );
            match action.execute(&context) {
                Ok(delta) => {
                    cumulative.extend(delta);
                    records.push(ActionRecord {
                        action,
                        context,
                        result: Ok(cumulative.clone()),
                    });
                }
                Err(error) => records.push(ActionRecord { action, context, result: Err(error) }),
            }
        }

        Ok((records, cumulative))
    }

    /// Validates, evaluates, and writes one block to `chain` without
    /// rendering. All writes happen after every check has passed.
    fn append_to(&self, chain: ChainId, block: &Block<A>) -> Result<Vec<ActionRecord<A>>, ChainError> {
        let tip = self.tip_of(chain)?;
        self.validate_next(chain, tip.as_ref(), block)?;
        let (records, delta) = self.evaluate(chain, block)?;

        self.store.put_block(block)?;
        for tx in &block.transactions {
            self.store.put_tx(tx)?;
        }
        self.store.append_index(chain, block.hash, block.index)?;
        self.store.set_block_states(&block.hash, delta.clone())?;
        if !delta.is_empty() {
            let keys: BTreeSet<StateKey> = delta.keys().cloned().collect();
            self.store.store_state_reference(chain, &keys, block.hash, block.index)?;
        }

        let mut per_signer: BTreeMap<Address, i64> = BTreeMap::new();
        for tx in &block.transactions {
            *per_signer.entry(tx.signer).or_insert(0) += 1;
        }
        for (signer, count) in per_signer {
            self.store.increase_tx_nonce(chain, &signer, count)?;
        }
        self.store
            .unstage_tx_ids(&block.transactions.iter().map(Transaction::id).collect())?;

        Ok(records)
    }

    /// Staged transactions that form gap-free nonce runs per signer, in
    /// wire order. Stale and gapped nonces are left staged.
    fn collect_staged(&self, chain: ChainId) -> Result<Vec<Transaction<A>>, ChainError> {
        let mut groups: BTreeMap<Address, Vec<Transaction<A>>> = BTreeMap::new();
        for id in self.store.iterate_staged_tx_ids()? {
            if let Some(tx) = self.store.get_tx(&id)?
                && tx.validate().is_ok()
            {
                groups.entry(tx.signer).or_default().push(tx);
            }
        }

        let mut picked = Vec::new();
        for (signer, mut txs) in groups {
            txs.sort_by_key(|tx| tx.nonce);
            txs.dedup_by_key(|tx| tx.nonce);
            let mut expected = self.store.get_tx_nonce(chain, &signer)?;
            for tx in txs {
                if tx.nonce < expected {
                    continue; // already consumed by an earlier block
                }
                if tx.nonce > expected {
                    break; // gap; later nonces must wait
                }
                expected += 1;
                picked.push(tx);
            }
        }
        Ok(picked)
    }

    /// Cumulative work of the branch ending at `block`, walking stored
    /// parents down to genesis.
    fn branch_total_difficulty(&self, block: &Block<A>) -> Result<i64, ChainError> {
        let mut total = block.difficulty;
        let mut cursor = block.clone();
        while cursor.index > 0 {
            let Some(parent) = self.parent_of(&cursor)? else {
                return Err(ChainError::OrphanChain {
                    a: block.hash,
                    b: cursor.hash,
                });
            };
            total += parent.difficulty;
            cursor = parent;
        }
        Ok(total)
    }

    /// Deepest common ancestor of two stored blocks.
    fn find_branchpoint(&self, a: &Block<A>, b: &Block<A>) -> Result<Block<A>, ChainError> {
        let orphan = ChainError::OrphanChain { a: a.hash, b: b.hash };

        let mut x = a.clone();
        let mut y = b.clone();
        while x.index > y.index {
            x = self.parent_of(&x)?.ok_or_else(|| orphan.clone())?;
        }
        while y.index > x.index {
            y = self.parent_of(&y)?.ok_or_else(|| orphan.clone())?;
        }
        while x.hash != y.hash {
            match (self.parent_of(&x)?, self.parent_of(&y)?) {
                (Some(px), Some(py)) => {
                    x = px;
                    y = py;
                }
                _ => return Err(orphan),
            }
        }
        Ok(x)
    }

    /// Reorganizes the canonical chain onto the branch ending at
    /// `new_tip`: fork a fresh chain id at the branchpoint, replay the
    /// branch with full evaluation, flip the canonical pointer, then emit
    /// the bracketed unrender/render sequence.
    fn swap(&self, new_tip: Block<A>) -> Result<(), ChainError> {
        let _guard = self.append_lock.lock().unwrap();
        let source = self.id();
        let old_tip = self.tip()?;
        self.store.put_block(&new_tip)?;

        let branchpoint = self.find_branchpoint(&old_tip, &new_tip)?;

        // New branch, oldest first.
        let mut branch = Vec::new();
        let mut cursor = new_tip.clone();
        while cursor.hash != branchpoint.hash {
            branch.push(cursor.clone());
            cursor = self.parent_of(&cursor)?.ok_or(ChainError::OrphanChain {
                a: old_tip.hash,
                b: new_tip.hash,
            })?;
        }
        branch.reverse();

        // Re-derive the rolled-back blocks' action records against the old
        // chain while its indices are still intact; these drive unrender.
        let mut rolled_back = Vec::new();
        let mut walk = old_tip.clone();
        while walk.hash != branchpoint.hash {
            let (records, _) = self.evaluate(source, &walk)?;
            rolled_back.push((walk.clone(), records));
            walk = self.parent_of(&walk)?.ok_or(ChainError::OrphanChain {
                a: old_tip.hash,
                b: new_tip.hash,
            })?;
        }

        // Fork: shared index prefix, surviving state refs, and the nonce
        // table implied by the prefix blocks.
        let dest = ChainId::random();
        let outcome = self.build_fork(source, dest, &branchpoint, &branch);
        let applied = match outcome {
            Ok(applied) => applied,
            Err(error) => {
                self.store.delete_chain_id(dest)?;
                return Err(error);
            }
        };

        self.store.set_canonical_chain_id(dest)?;
        *self.canonical.write().unwrap() = dest;
        self.store.delete_chain_id(source)?;
        info!(
            "reorganized chain: branchpoint={} old_tip={} new_tip={}",
            branchpoint.hash, old_tip.hash, new_tip.hash
        );

        self.render_reorg(&old_tip, &new_tip, &branchpoint, &rolled_back, &applied);
        Ok(())
    }

    /// Builds the forked chain `dest` and appends the new branch onto it,
    /// returning each branch block's action records.
    fn build_fork(
        &self,
        source: ChainId,
        dest: ChainId,
        branchpoint: &Block<A>,
        branch: &[Block<A>],
    ) -> Result<Vec<(Block<A>, Vec<ActionRecord<A>>)>, ChainError> {
        let prefix_len = (branchpoint.index + 1) as usize;
        for (at, hash) in self
            .store
            .iterate_indexes(source, 0, Some(prefix_len))?
            .into_iter()
            .enumerate()
        {
            self.store.append_index(dest, hash, at as i64)?;
        }
        self.store.fork_state_references(source, dest, branchpoint.index)?;

        let mut per_signer: BTreeMap<Address, i64> = BTreeMap::new();
        for hash in self.store.iterate_indexes(dest, 0, None)? {
            let block = self.require_block(&hash)?;
            for tx in &block.transactions {
                *per_signer.entry(tx.signer).or_insert(0) += 1;
            }
        }
        for (signer, count) in per_signer {
            self.store.increase_tx_nonce(dest, &signer, count)?;
        }

        let mut applied = Vec::new();
        for block in branch {
            let records = self.append_to(dest, block)?;
            applied.push((block.clone(), records));
        }
        Ok(applied)
    }

    // ── renderer dispatch ──────────────────────────────────────────────

    /// Runs one renderer callback, logging and swallowing panics so event
    /// delivery can never abort an append.
    fn shielded(&self, stage: &str, callback: impl FnOnce()) {
        if catch_unwind(AssertUnwindSafe(callback)).is_err() {
            warn!("a renderer panicked during {stage}; events may be lost");
        }
    }

    fn emit(&self, renderer: &Arc<dyn Renderer<A>>, record: &ActionRecord<A>, unrender: bool) {
        match (&record.result, unrender) {
            (Ok(next_states), false) => self.shielded("render_action", || {
                renderer.render_action(&record.action, &record.context, next_states)
            }),
            (Ok(next_states), true) => self.shielded("unrender_action", || {
                renderer.unrender_action(&record.action, &record.context, next_states)
            }),
            (Err(error), false) => self.shielded("render_action_error", || {
                renderer.render_action_error(&record.action, &record.context, error)
            }),
            (Err(error), true) => self.shielded("unrender_action_error", || {
                renderer.unrender_action_error(&record.action, &record.context, error)
            }),
        }
    }

    fn render_append(
        &self,
        old_tip: Option<&Block<A>>,
        new_tip: &Block<A>,
        records: &[ActionRecord<A>],
    ) {
        for renderer in &self.renderers {
            self.shielded("render_block", || renderer.render_block(old_tip, new_tip));
        }
        for record in records {
            for renderer in &self.renderers {
                self.emit(renderer, record, false);
            }
        }
        for renderer in &self.renderers {
            self.shielded("render_block_end", || renderer.render_block_end(old_tip, new_tip));
        }
    }

    fn render_reorg(
        &self,
        old_tip: &Block<A>,
        new_tip: &Block<A>,
        branchpoint: &Block<A>,
        rolled_back: &[(Block<A>, Vec<ActionRecord<A>>)],
        applied: &[(Block<A>, Vec<ActionRecord<A>>)],
    ) {
        for renderer in &self.renderers {
            self.shielded("render_reorg", || {
                renderer.render_reorg(old_tip, new_tip, branchpoint)
            });
        }
        for renderer in &self.renderers {
            self.shielded("render_block", || {
                renderer.render_block(Some(old_tip), new_tip)
            });
        }

        // Rolled-back blocks newest-first, actions in reverse evaluation
        // order.
        for (_, records) in rolled_back {
            for record in records.iter().rev() {
                for renderer in &self.renderers {
                    self.emit(renderer, record, true);
                }
            }
        }
        // New branch oldest-first, actions forward.
        for (_, records) in applied {
            for record in records {
                for renderer in &self.renderers {
                    self.emit(renderer, record, false);
                }
            }
        }

        for renderer in &self.renderers {
            self.shielded("render_block_end", || {
                renderer.render_block_end(Some(old_tip), new_tip)
            });
        }
        for renderer in &self.renderers {
            self.shielded("render_reorg_end", || {
                renderer.render_reorg_end(old_tip, new_tip, branchpoint)
            });
        }
    }
}

impl<A: Action, S: Store<A>, P: BlockPolicy<A>> PeerHandler<A> for BlockChain<A, S, P> {
    fn handle_received_block(&self, block: Block<A>) -> Result<(), ChainError> {
        BlockChain::handle_received_block(self, block)
    }

    fn handle_received_tx(&self, tx: Transaction<A>) -> Result<(), ChainError> {
        BlockChain::handle_received_tx(self, tx)
    }

    fn get_locator(&self) -> Result<BlockLocator, ChainError> {
        BlockChain::get_locator(self)
    }

    fn find_next_hashes(
        &self,
        locator: &BlockLocator,
        stop: Option<HashDigest>,
        count: usize,
    ) -> Result<Vec<HashDigest>, ChainError> {
        BlockChain::find_next_hashes(self, locator, stop, count)
    }

    fn get_blocks_by_hashes(&self, hashes: &[HashDigest]) -> Result<Vec<Block<A>>, ChainError> {
        BlockChain::get_blocks_by_hashes(self, hashes)
    }
}

impl<A: Action, S: Store<A>, P: BlockPolicy<A>> BlockChain<A, S, P> {
    /// [`BlockChain::find_next_hashes`] with the protocol default count.
    pub fn find_next_hashes_default(
        &self,
        locator: &BlockLocator,
        stop: Option<HashDigest>,
    ) -> Result<Vec<HashDigest>, ChainError> {
        self.find_next_hashes(locator, stop, FIND_NEXT_HASHES_COUNT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::{
        Attack, CollectingRenderer, RenderEvent, attack, chain_with_renderer, mine_next, sign_tx,
        struck_targets, test_chain, test_genesis, used_weapons,
    };
    use crate::store::MemoryStore;

    fn miner() -> Address {
        Address([0xAAu8; 20])
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[test]
    fn new_chain_holds_only_genesis() {
        let (store, chain) = test_chain();
        assert_eq!(chain.len().unwrap(), 1);
        assert!(!chain.is_empty().unwrap());

        let genesis = chain.block_at(0).unwrap().unwrap();
        assert_eq!(genesis.index, 0);
        assert!(genesis.validate().is_ok());
        assert_eq!(chain.tip().unwrap(), genesis);
        assert_eq!(store.canonical_chain_id().unwrap(), Some(chain.id()));
    }

    #[test]
    fn reopening_a_store_resumes_the_chain() {
        let (store, chain) = test_chain();
        let id = chain.id();
        let genesis = chain.block_at(0).unwrap().unwrap();
        drop(chain);

        let reopened = BlockChain::new(
            Arc::clone(&store),
            crate::core::policy::StandardPolicy::new(1),
            Vec::new(),
            genesis,
        )
        .unwrap();
        assert_eq!(reopened.id(), id);
        assert_eq!(reopened.len().unwrap(), 1);
    }

    #[test]
    fn reopening_rejects_a_different_genesis() {
        let (store, chain) = test_chain();
        drop(chain);

        let result = BlockChain::new(
            store,
            crate::core::policy::StandardPolicy::new(1),
            Vec::new(),
            test_genesis(), // random nonce start: a different genesis hash
        );
        assert!(matches!(result, Err(ChainError::GenesisMismatch)));
    }

    #[test]
    fn mining_appends_one_block() {
        let (_, chain) = test_chain();
        let mined = chain.mine_block(miner(), &token()).unwrap();

        assert_eq!(chain.len().unwrap(), 2);
        assert_eq!(chain.block_at(1).unwrap().unwrap(), mined);
        assert_eq!(chain.tip().unwrap(), mined);
        assert_eq!(mined.miner, Some(miner()));
        assert!(mined.validate().is_ok());
    }

    #[test]
    fn attack_state_accumulates_across_blocks() {
        let (_, chain) = test_chain();
        let key = PrivateKey::new();
        let a1 = key.public_key().address();

        chain
            .make_transaction(
                &key,
                BTreeSet::from([a1]),
                vec![
                    attack("sword", "goblin", a1),
                    attack("sword", "orc", a1),
                    attack("staff", "goblin", a1),
                ],
            )
            .unwrap();
        chain.mine_block(miner(), &token()).unwrap();

        let weapons = used_weapons(&chain, a1);
        assert!(weapons.contains("sword") && weapons.contains("staff"));
        let targets = struck_targets(&chain, a1);
        assert!(targets.contains("goblin") && targets.contains("orc"));
        assert!(!weapons.contains("bow"));

        chain
            .make_transaction(&key, BTreeSet::from([a1]), vec![attack("bow", "goblin", a1)])
            .unwrap();
        chain.mine_block(miner(), &token()).unwrap();

        let weapons = used_weapons(&chain, a1);
        assert!(weapons.contains("bow"));
        assert!(weapons.contains("sword") && weapons.contains("staff"));
    }

    #[test]
    fn get_state_honors_the_at_block_argument() {
        let (_, chain) = test_chain();
        let key = PrivateKey::new();
        let a1 = key.public_key().address();

        chain
            .make_transaction(&key, BTreeSet::from([a1]), vec![attack("sword", "goblin", a1)])
            .unwrap();
        let first = chain.mine_block(miner(), &token()).unwrap();

        chain
            .make_transaction(&key, BTreeSet::from([a1]), vec![attack("bow", "orc", a1)])
            .unwrap();
        chain.mine_block(miner(), &token()).unwrap();

        let historical = chain.get_state(&a1.state_key(), Some(&first.hash)).unwrap().unwrap();
        let weapons = historical
            .as_dict()
            .and_then(|entries| entries.get(&crate::types::value::Key::text("used_weapons")))
            .cloned()
            .unwrap();
        assert_eq!(weapons.as_list().unwrap().len(), 1);

        // Before anything was written the key has no state.
        let genesis = chain.block_at(0).unwrap().unwrap();
        assert_eq!(chain.get_state(&a1.state_key(), Some(&genesis.hash)).unwrap(), None);
    }

    #[test]
    fn find_next_hashes_follows_the_locator() {
        let (_, chain) = test_chain();
        let genesis = chain.block_at(0).unwrap().unwrap();
        let b1 = chain.mine_block(miner(), &token()).unwrap();
        let b2 = chain.mine_block(miner(), &token()).unwrap();
        let b3 = chain.mine_block(miner(), &token()).unwrap();

        let locator = BlockLocator(vec![genesis.hash]);
        assert_eq!(
            chain.find_next_hashes_default(&locator, None).unwrap(),
            vec![b1.hash, b2.hash, b3.hash]
        );
        assert_eq!(
            chain.find_next_hashes_default(&locator, Some(b2.hash)).unwrap(),
            vec![b1.hash, b2.hash]
        );
        assert_eq!(
            chain.find_next_hashes(&locator, None, 2).unwrap(),
            vec![b1.hash, b2.hash]
        );
        // A locator with only unknown hashes yields nothing.
        assert!(
            chain
                .find_next_hashes_default(&BlockLocator(vec![HashDigest::of(b"nowhere")]), None)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn locator_steps_back_with_doubling_stride() {
        let (_, chain) = test_chain();
        for _ in 0..8 {
            chain.mine_block(miner(), &token()).unwrap();
        }

        let locator = chain.get_locator().unwrap();
        let expected: Vec<HashDigest> = [8i64, 7, 5, 1, 0]
            .iter()
            .map(|index| chain.block_at(*index).unwrap().unwrap().hash)
            .collect();
        assert_eq!(locator.hashes(), &expected[..]);
    }

    #[test]
    fn append_rejects_wrong_nonce() {
        let (_, chain) = test_chain();
        let genesis = chain.block_at(0).unwrap().unwrap();
        let key = PrivateKey::new();
        let recipient = key.public_key().address();

        let skipped = sign_tx(&key, 1, vec![attack("sword", "goblin", recipient)]);
        let block = mine_next(&genesis, 1, vec![skipped]);
        assert!(matches!(
            chain.append(block),
            Err(ChainError::InvalidTxNonce { expected: 0, actual: 1, .. })
        ));
        assert_eq!(chain.len().unwrap(), 1);
    }

    #[test]
    fn append_rejects_undeclared_state_writes() {
        let (_, chain) = test_chain();
        let genesis = chain.block_at(0).unwrap().unwrap();
        let key = PrivateKey::new();
        let recipient = key.public_key().address();

        // Declares no updated addresses, then writes one.
        let tx = Transaction::sign(
            &key,
            0,
            BTreeSet::new(),
            Timestamp::now(),
            vec![attack("sword", "goblin", recipient)],
        );
        let block = mine_next(&genesis, 1, vec![tx]);
        assert!(matches!(
            chain.append(block),
            Err(ChainError::UpdatedAddressesViolation { address, .. }) if address == recipient
        ));
        assert_eq!(chain.len().unwrap(), 1);
    }

    #[test]
    fn action_failures_do_not_reject_the_block() {
        let collector = Arc::new(CollectingRenderer::new());
        let store = Arc::new(MemoryStore::new());
        let chain = chain_with_renderer(Arc::clone(&store), collector.clone());
        let key = PrivateKey::new();
        let recipient = key.public_key().address();

        chain
            .make_transaction(&key, BTreeSet::from([recipient]), vec![attack("cursed", "gob", recipient)])
            .unwrap();
        let block = chain.mine_block(miner(), &token()).unwrap();

        assert_eq!(chain.len().unwrap(), 2);
        assert_eq!(chain.get_state(&recipient.state_key(), None).unwrap(), None);
        assert_eq!(
            collector.events(),
            vec![
                RenderEvent::Block(block.hash),
                RenderEvent::ActionError(block.hash),
                RenderEvent::BlockEnd(block.hash),
            ]
        );
    }

    #[test]
    fn cancelled_mining_leaves_no_trace() {
        let collector = Arc::new(CollectingRenderer::new());
        let store = Arc::new(MemoryStore::new());
        let chain = chain_with_renderer(Arc::clone(&store), collector.clone());

        let cancel = token();
        cancel.cancel();
        assert!(matches!(
            chain.mine_block(miner(), &cancel),
            Err(ChainError::MiningCancelled)
        ));
        assert_eq!(chain.len().unwrap(), 1);
        assert!(collector.events().is_empty());
    }

    #[test]
    fn make_transaction_counts_staged_nonces() {
        let (store, chain) = test_chain();
        let key = PrivateKey::new();
        let recipient = key.public_key().address();

        let first = chain
            .make_transaction(&key, BTreeSet::from([recipient]), vec![attack("a", "x", recipient)])
            .unwrap();
        let second = chain
            .make_transaction(&key, BTreeSet::from([recipient]), vec![attack("b", "y", recipient)])
            .unwrap();
        assert_eq!(first.nonce, 0);
        assert_eq!(second.nonce, 1);

        let block = chain.mine_block(miner(), &token()).unwrap();
        assert_eq!(block.transactions.len(), 2);
        assert_eq!(store.get_tx_nonce(chain.id(), &recipient).unwrap(), 2);
        assert!(store.iterate_staged_tx_ids().unwrap().is_empty());
    }

    #[test]
    fn gapped_staged_nonces_wait() {
        let (_, chain) = test_chain();
        let key = PrivateKey::new();
        let recipient = key.public_key().address();

        // Stage nonce 1 without nonce 0: nothing can be mined from it.
        chain
            .stage_transaction(sign_tx(&key, 1, vec![attack("sword", "goblin", recipient)]))
            .unwrap();
        let block = chain.mine_block(miner(), &token()).unwrap();
        assert!(block.transactions.is_empty());

        // Supplying nonce 0 releases both.
        chain
            .stage_transaction(sign_tx(&key, 0, vec![attack("staff", "orc", recipient)]))
            .unwrap();
        let block = chain.mine_block(miner(), &token()).unwrap();
        assert_eq!(block.transactions.len(), 2);
    }

    #[test]
    fn handle_received_paths_append_and_stage() {
        let (_, chain) = test_chain();
        let key = PrivateKey::new();
        let recipient = key.public_key().address();

        let tx = sign_tx(&key, 0, vec![attack("sword", "goblin", recipient)]);
        chain.handle_received_tx(tx.clone()).unwrap();

        let tip = chain.tip().unwrap();
        let block = mine_next(&tip, 1, vec![tx]);
        chain.handle_received_block(block.clone()).unwrap();
        assert_eq!(chain.tip().unwrap(), block);

        // Receiving the same block again is a no-op.
        chain.handle_received_block(block.clone()).unwrap();
        assert_eq!(chain.len().unwrap(), 2);
    }

    #[test]
    fn heavier_branch_triggers_reorg_with_correct_event_order() {
        let collector = Arc::new(CollectingRenderer::new());
        let store = Arc::new(MemoryStore::new());
        let chain = chain_with_renderer(Arc::clone(&store), collector.clone());
        let genesis = chain.block_at(0).unwrap().unwrap();

        let alice = PrivateKey::new();
        let bob = PrivateKey::new();
        let carol = PrivateKey::new();
        let alice_addr = alice.public_key().address();
        let bob_addr = bob.public_key().address();
        let carol_addr = carol.public_key().address();

        let b1 = mine_next(&genesis, 1, vec![sign_tx(&alice, 0, vec![attack("sword", "gob", alice_addr)])]);
        chain.append(b1.clone()).unwrap();
        let b2 = mine_next(&b1, 1, vec![sign_tx(&bob, 0, vec![attack("bow", "orc", bob_addr)])]);
        chain.append(b2.clone()).unwrap();

        let old_id = chain.id();
        assert_eq!(chain.total_difficulty().unwrap(), 2);

        // A competing child of b1 with strictly more cumulative work.
        let b2p = mine_next(&b1, 3, vec![sign_tx(&carol, 0, vec![attack("axe", "imp", carol_addr)])]);
        chain.handle_received_block(b2p.clone()).unwrap();

        assert_eq!(chain.tip().unwrap(), b2p);
        assert_eq!(chain.len().unwrap(), 3);
        assert_eq!(chain.total_difficulty().unwrap(), 4);
        assert_ne!(chain.id(), old_id);
        // The abandoned chain id is gone; blocks survive.
        assert!(!store.list_chain_ids().unwrap().contains(&old_id));
        assert!(store.contains_block(&b2.hash).unwrap());

        // Rolled-back state is invisible; the new branch's state is live.
        assert_eq!(chain.get_state(&bob_addr.state_key(), None).unwrap(), None);
        assert!(chain.get_state(&carol_addr.state_key(), None).unwrap().is_some());
        assert!(chain.get_state(&alice_addr.state_key(), None).unwrap().is_some());

        let events = collector.events();
        let reorg_start = events
            .iter()
            .position(|event| matches!(event, RenderEvent::Reorg { .. }))
            .expect("reorg bracket must open");
        assert_eq!(
            &events[reorg_start..],
            &[
                RenderEvent::Reorg { old: b2.hash, new: b2p.hash, branchpoint: b1.hash },
                RenderEvent::Block(b2p.hash),
                RenderEvent::Unrender(b2.hash),
                RenderEvent::Action(b2p.hash),
                RenderEvent::BlockEnd(b2p.hash),
                RenderEvent::ReorgEnd { old: b2.hash, new: b2p.hash, branchpoint: b1.hash },
            ]
        );
    }

    #[test]
    fn deep_reorg_unrenders_newest_first_and_renders_forward() {
        let collector = Arc::new(CollectingRenderer::new());
        let store = Arc::new(MemoryStore::new());
        let chain = chain_with_renderer(Arc::clone(&store), collector.clone());
        let genesis = chain.block_at(0).unwrap().unwrap();

        let ann = PrivateKey::new();
        let ben = PrivateKey::new();
        let ann_addr = ann.public_key().address();
        let ben_addr = ben.public_key().address();

        // Canonical: genesis ← b1 ← b2, both carrying one action.
        let b1 = mine_next(&genesis, 1, vec![sign_tx(&ann, 0, vec![attack("sword", "gob", ann_addr)])]);
        chain.append(b1.clone()).unwrap();
        let b2 = mine_next(&b1, 1, vec![sign_tx(&ann, 1, vec![attack("bow", "orc", ann_addr)])]);
        chain.append(b2.clone()).unwrap();

        // Competitor: genesis ← c1 ← c2, heavier overall.
        let c1 = mine_next(&genesis, 2, vec![sign_tx(&ben, 0, vec![attack("axe", "imp", ben_addr)])]);
        let c2 = mine_next(&c1, 2, vec![sign_tx(&ben, 1, vec![attack("pike", "elf", ben_addr)])]);
        // c1 alone is lighter than b1+b2; only c2 tips the scale.
        chain.handle_received_block(c1.clone()).unwrap();
        assert_eq!(chain.tip().unwrap(), b2);
        chain.handle_received_block(c2.clone()).unwrap();
        assert_eq!(chain.tip().unwrap(), c2);

        let events = collector.events();
        let reorg_start = events
            .iter()
            .position(|event| matches!(event, RenderEvent::Reorg { .. }))
            .unwrap();
        assert_eq!(
            &events[reorg_start..],
            &[
                RenderEvent::Reorg { old: b2.hash, new: c2.hash, branchpoint: genesis.hash },
                RenderEvent::Block(c2.hash),
                // Rolled back newest-first...
                RenderEvent::Unrender(b2.hash),
                RenderEvent::Unrender(b1.hash),
                // ...then the new branch forward.
                RenderEvent::Action(c1.hash),
                RenderEvent::Action(c2.hash),
                RenderEvent::BlockEnd(c2.hash),
                RenderEvent::ReorgEnd { old: b2.hash, new: c2.hash, branchpoint: genesis.hash },
            ]
        );
    }

    #[test]
    fn lighter_branch_is_kept_but_not_adopted() {
        let (store, chain) = test_chain();
        let genesis = chain.block_at(0).unwrap().unwrap();

        let b1 = chain.mine_block(miner(), &token()).unwrap();
        let b2 = chain.mine_block(miner(), &token()).unwrap();

        // Equal weight: b1' has the same difficulty as b1 + b2 combined is
        // heavier, so a single competing child of genesis loses.
        let b1p = mine_next(&genesis, 1, vec![]);
        chain.handle_received_block(b1p.clone()).unwrap();

        assert_eq!(chain.tip().unwrap(), b2);
        assert!(store.contains_block(&b1p.hash).unwrap());
        let _ = b1;
    }

    #[test]
    fn disconnected_block_is_an_orphan() {
        let (_, chain) = test_chain();

        // A block whose ancestry never reaches our genesis.
        let foreign_genesis = test_genesis();
        let stray = mine_next(&foreign_genesis, 1, vec![]);
        let result = chain.handle_received_block(stray);
        assert!(matches!(result, Err(ChainError::OrphanChain { .. })));
    }

    #[test]
    fn reorg_nonces_follow_the_new_branch() {
        let (store, chain) = test_chain();
        let genesis = chain.block_at(0).unwrap().unwrap();
        let key = PrivateKey::new();
        let signer = key.public_key().address();

        let b1 = mine_next(&genesis, 1, vec![sign_tx(&key, 0, vec![attack("sword", "gob", signer)])]);
        chain.append(b1.clone()).unwrap();
        let b2 = mine_next(&b1, 1, vec![sign_tx(&key, 1, vec![attack("bow", "orc", signer)])]);
        chain.append(b2.clone()).unwrap();
        assert_eq!(store.get_tx_nonce(chain.id(), &signer).unwrap(), 2);

        // The competing branch reuses nonce 1 for a different payload.
        let b2p = mine_next(&b1, 3, vec![sign_tx(&key, 1, vec![attack("axe", "imp", signer)])]);
        chain.handle_received_block(b2p.clone()).unwrap();

        assert_eq!(chain.tip().unwrap(), b2p);
        assert_eq!(store.get_tx_nonce(chain.id(), &signer).unwrap(), 2);
        let weapons = used_weapons(&chain, signer);
        assert!(weapons.contains("axe") && !weapons.contains("bow"));
    }

    #[test]
    fn renderer_panic_does_not_abort_append() {
        struct PanickingRenderer;
        impl Renderer<Attack> for PanickingRenderer {
            fn render_block(&self, _: Option<&Block<Attack>>, _: &Block<Attack>) {
                panic!("host bug");
            }
        }

        let store = Arc::new(MemoryStore::new());
        let chain = chain_with_renderer(store, Arc::new(PanickingRenderer));
        chain.mine_block(miner(), &token()).unwrap();
        assert_eq!(chain.len().unwrap(), 2);
    }

    #[test]
    fn appended_transactions_are_retrievable_forever() {
        let (store, chain) = test_chain();
        let key = PrivateKey::new();
        let recipient = key.public_key().address();

        let tx = chain
            .make_transaction(&key, BTreeSet::from([recipient]), vec![attack("sword", "gob", recipient)])
            .unwrap();
        chain.mine_block(miner(), &token()).unwrap();

        let stored = store.get_tx(&tx.id()).unwrap().unwrap();
        assert_eq!(stored, tx);
        assert!(store.iterate_staged_tx_ids().unwrap().is_empty());
    }
}
