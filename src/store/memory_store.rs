//! Concurrent in-memory store.
//!
//! The reference implementation of the store contract: hash maps for the
//! content-addressed block/tx spaces and a per-chain record for index,
//! state references, and nonces. Suitable for tests and embedded hosts
//! that snapshot through [`Store::copy_to`].

use crate::core::action::{Action, StateDelta};
use crate::core::block::Block;
use crate::core::transaction::Transaction;
use crate::store::store_trait::{Store, StoreError};
use crate::types::address::{Address, StateKey};
use crate::types::chain_id::ChainId;
use crate::types::hash::{HashDigest, TxId};
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

/// Everything one chain view owns: its dense index, the per-key reverse
/// map of state-writing blocks, and the per-signer nonce table.
#[derive(Default)]
struct ChainRecord {
    index: Vec<HashDigest>,
    state_refs: HashMap<StateKey, Vec<(HashDigest, i64)>>,
    nonces: HashMap<Address, i64>,
}

/// In-memory store backed by concurrent maps.
#[derive(Default)]
pub struct MemoryStore<A: Action> {
    blocks: DashMap<HashDigest, Block<A>>,
    txs: DashMap<TxId, Transaction<A>>,
    staged: DashMap<TxId, bool>,
    block_states: DashMap<HashDigest, StateDelta>,
    chains: RwLock<HashMap<ChainId, ChainRecord>>,
    canonical: RwLock<Option<ChainId>>,
}

impl<A: Action> MemoryStore<A> {
    pub fn new() -> MemoryStore<A> {
        MemoryStore {
            blocks: DashMap::new(),
            txs: DashMap::new(),
            staged: DashMap::new(),
            block_states: DashMap::new(),
            chains: RwLock::new(HashMap::new()),
            canonical: RwLock::new(None),
        }
    }

    /// Runs `f` over the chain's record, or fails when the chain has no
    /// recorded identity.
    fn with_chain<R>(
        &self,
        chain: ChainId,
        f: impl FnOnce(&ChainRecord) -> R,
    ) -> Result<R, StoreError> {
        let chains = self.chains.read().unwrap();
        chains
            .get(&chain)
            .map(f)
            .ok_or(StoreError::ChainIdNotFound(chain))
    }
}

impl<A: Action> Store<A> for MemoryStore<A> {
    fn list_chain_ids(&self) -> Result<BTreeSet<ChainId>, StoreError> {
        Ok(self.chains.read().unwrap().keys().copied().collect())
    }

    fn canonical_chain_id(&self) -> Result<Option<ChainId>, StoreError> {
        Ok(*self.canonical.read().unwrap())
    }

    fn set_canonical_chain_id(&self, id: ChainId) -> Result<(), StoreError> {
        self.chains.write().unwrap().entry(id).or_default();
        *self.canonical.write().unwrap() = Some(id);
        Ok(())
    }

    fn delete_chain_id(&self, id: ChainId) -> Result<(), StoreError> {
        self.chains.write().unwrap().remove(&id);
        let mut canonical = self.canonical.write().unwrap();
        if *canonical == Some(id) {
            *canonical = None;
        }
        Ok(())
    }

    fn append_index(&self, chain: ChainId, hash: HashDigest, at: i64) -> Result<i64, StoreError> {
        let mut chains = self.chains.write().unwrap();
        let record = chains.entry(chain).or_default();
        let tail = record.index.len() as i64;
        if at != tail {
            return Err(StoreError::IndexOutOfOrder { expected: tail, actual: at });
        }
        record.index.push(hash);
        Ok(tail)
    }

    fn count_index(&self, chain: ChainId) -> Result<i64, StoreError> {
        let chains = self.chains.read().unwrap();
        Ok(chains.get(&chain).map_or(0, |record| record.index.len() as i64))
    }

    fn index_block_hash(
        &self,
        chain: ChainId,
        offset: i64,
    ) -> Result<Option<HashDigest>, StoreError> {
        let chains = self.chains.read().unwrap();
        let Some(record) = chains.get(&chain) else {
            return Ok(None);
        };
        let len = record.index.len() as i64;
        let resolved = if offset < 0 { len + offset } else { offset };
        if resolved < 0 || resolved >= len {
            return Ok(None);
        }
        Ok(Some(record.index[resolved as usize]))
    }

    fn iterate_indexes(
        &self,
        chain: ChainId,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<HashDigest>, StoreError> {
        let chains = self.chains.read().unwrap();
        let Some(record) = chains.get(&chain) else {
            return Ok(Vec::new());
        };
        let taken = record
            .index
            .iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .copied()
            .collect();
        Ok(taken)
    }

    fn put_block(&self, block: &Block<A>) -> Result<(), StoreError> {
        self.blocks.insert(block.hash, block.clone());
        Ok(())
    }

    fn get_block(&self, hash: &HashDigest) -> Result<Option<Block<A>>, StoreError> {
        Ok(self.blocks.get(hash).map(|entry| entry.clone()))
    }

    fn delete_block(&self, hash: &HashDigest) -> Result<bool, StoreError> {
        Ok(self.blocks.remove(hash).is_some())
    }

    fn contains_block(&self, hash: &HashDigest) -> Result<bool, StoreError> {
        Ok(self.blocks.contains_key(hash))
    }

    fn get_block_index(&self, hash: &HashDigest) -> Result<Option<i64>, StoreError> {
        Ok(self.blocks.get(hash).map(|entry| entry.index))
    }

    fn iterate_block_hashes(&self) -> Result<Vec<HashDigest>, StoreError> {
        Ok(self.blocks.iter().map(|entry| *entry.key()).collect())
    }

    fn count_blocks(&self) -> Result<i64, StoreError> {
        Ok(self.blocks.len() as i64)
    }

    fn put_tx(&self, tx: &Transaction<A>) -> Result<(), StoreError> {
        self.txs.insert(tx.id(), tx.clone());
        Ok(())
    }

    fn get_tx(&self, id: &TxId) -> Result<Option<Transaction<A>>, StoreError> {
        Ok(self.txs.get(id).map(|entry| entry.clone()))
    }

    fn delete_tx(&self, id: &TxId) -> Result<bool, StoreError> {
        Ok(self.txs.remove(id).is_some())
    }

    fn contains_tx(&self, id: &TxId) -> Result<bool, StoreError> {
        Ok(self.txs.contains_key(id))
    }

    fn iterate_tx_ids(&self) -> Result<Vec<TxId>, StoreError> {
        Ok(self.txs.iter().map(|entry| *entry.key()).collect())
    }

    fn count_txs(&self) -> Result<i64, StoreError> {
        Ok(self.txs.len() as i64)
    }

    fn stage_tx_ids(&self, ids: BTreeMap<TxId, bool>) -> Result<(), StoreError> {
        for (id, broadcastable) in ids {
            self.staged.insert(id, broadcastable);
        }
        Ok(())
    }

    fn unstage_tx_ids(&self, ids: &BTreeSet<TxId>) -> Result<(), StoreError> {
        for id in ids {
            self.staged.remove(id);
        }
        Ok(())
    }

    fn iterate_staged_tx_ids(&self) -> Result<Vec<TxId>, StoreError> {
        Ok(self.staged.iter().map(|entry| *entry.key()).collect())
    }

    fn set_block_states(&self, hash: &HashDigest, states: StateDelta) -> Result<(), StoreError> {
        self.block_states.insert(*hash, states);
        Ok(())
    }

    fn get_block_states(&self, hash: &HashDigest) -> Result<Option<StateDelta>, StoreError> {
        Ok(self.block_states.get(hash).map(|entry| entry.clone()))
    }

    fn store_state_reference(
        &self,
        chain: ChainId,
        keys: &BTreeSet<StateKey>,
        hash: HashDigest,
        index: i64,
    ) -> Result<(), StoreError> {
        let mut chains = self.chains.write().unwrap();
        let record = chains.entry(chain).or_default();
        for key in keys {
            let refs = record.state_refs.entry(key.clone()).or_default();
            if refs.iter().any(|(existing, _)| *existing == hash) {
                continue;
            }
            refs.push((hash, index));
            refs.sort_by_key(|(_, index)| *index);
        }
        Ok(())
    }

    fn lookup_state_reference(
        &self,
        chain: ChainId,
        key: &StateKey,
        at_index: i64,
    ) -> Result<Option<(HashDigest, i64)>, StoreError> {
        let chains = self.chains.read().unwrap();
        let Some(record) = chains.get(&chain) else {
            return Ok(None);
        };
        let found = record.state_refs.get(key).and_then(|refs| {
            refs.iter().rev().find(|(_, index)| *index <= at_index).copied()
        });
        Ok(found)
    }

    fn iterate_state_references(
        &self,
        chain: ChainId,
        key: &StateKey,
        lowest: i64,
        highest: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<(HashDigest, i64)>, StoreError> {
        let highest = highest.unwrap_or(i64::MAX);
        if lowest > highest {
            return Err(StoreError::RangeError { lowest, highest });
        }
        let chains = self.chains.read().unwrap();
        let Some(record) = chains.get(&chain) else {
            return Ok(Vec::new());
        };
        let Some(refs) = record.state_refs.get(key) else {
            return Ok(Vec::new());
        };
        Ok(refs
            .iter()
            .rev()
            .filter(|(_, index)| (lowest..=highest).contains(index))
            .take(limit.unwrap_or(usize::MAX))
            .copied()
            .collect())
    }

    fn list_state_keys(&self, chain: ChainId) -> Result<BTreeSet<StateKey>, StoreError> {
        let chains = self.chains.read().unwrap();
        Ok(chains
            .get(&chain)
            .map(|record| record.state_refs.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn list_all_state_references(
        &self,
        chain: ChainId,
        lowest: i64,
        highest: Option<i64>,
    ) -> Result<BTreeMap<StateKey, Vec<HashDigest>>, StoreError> {
        let highest = highest.unwrap_or(i64::MAX);
        if lowest > highest {
            return Err(StoreError::RangeError { lowest, highest });
        }
        let chains = self.chains.read().unwrap();
        let Some(record) = chains.get(&chain) else {
            return Ok(BTreeMap::new());
        };
        let mut all = BTreeMap::new();
        for (key, refs) in &record.state_refs {
            let hashes: Vec<HashDigest> = refs
                .iter()
                .filter(|(_, index)| (lowest..=highest).contains(index))
                .map(|(hash, _)| *hash)
                .collect();
            if !hashes.is_empty() {
                all.insert(key.clone(), hashes);
            }
        }
        Ok(all)
    }

    fn fork_state_references(
        &self,
        source: ChainId,
        dest: ChainId,
        branchpoint_index: i64,
    ) -> Result<(), StoreError> {
        let mut chains = self.chains.write().unwrap();
        if !chains.contains_key(&source) {
            return Err(StoreError::ChainIdNotFound(source));
        }

        let mut surviving: HashMap<StateKey, Vec<(HashDigest, i64)>> = HashMap::new();
        for (key, refs) in &chains[&source].state_refs {
            let kept: Vec<(HashDigest, i64)> = refs
                .iter()
                .filter(|(_, index)| *index <= branchpoint_index)
                .copied()
                .collect();
            if !kept.is_empty() {
                surviving.insert(key.clone(), kept);
            }
        }

        let record = chains.entry(dest).or_default();
        for (key, kept) in surviving {
            let refs = record.state_refs.entry(key).or_default();
            for (hash, index) in kept {
                if !refs.iter().any(|(existing, _)| *existing == hash) {
                    refs.push((hash, index));
                }
            }
            refs.sort_by_key(|(_, index)| *index);
        }
        Ok(())
    }

    fn get_tx_nonce(&self, chain: ChainId, signer: &Address) -> Result<i64, StoreError> {
        let chains = self.chains.read().unwrap();
        Ok(chains
            .get(&chain)
            .and_then(|record| record.nonces.get(signer).copied())
            .unwrap_or(0))
    }

    fn increase_tx_nonce(
        &self,
        chain: ChainId,
        signer: &Address,
        delta: i64,
    ) -> Result<(), StoreError> {
        let mut chains = self.chains.write().unwrap();
        let record = chains.entry(chain).or_default();
        *record.nonces.entry(*signer).or_insert(0) += delta;
        Ok(())
    }

    fn list_tx_nonces(&self, chain: ChainId) -> Result<BTreeMap<Address, i64>, StoreError> {
        self.with_chain(chain, |record| {
            record.nonces.iter().map(|(signer, nonce)| (*signer, *nonce)).collect()
        })
        .or_else(|_| Ok(BTreeMap::new()))
    }
}
