//! Application-defined actions and their evaluation context.
//!
//! An action is the unit of state transition: deterministic, serializable
//! through the canonical value tree, and evaluated with access to the
//! world state as of the parent block plus everything earlier in the same
//! block.

use crate::types::address::{Address, StateKey};
use crate::types::hash::HashDigest;
use crate::types::value::{Value, ValueError};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use worldline_derive::Error;

/// The keys an action (or a whole block) wrote, with their new values.
pub type StateDelta = BTreeMap<StateKey, Value>;

/// Read access to prior state, resolved lazily so untouched keys cost
/// nothing.
pub trait StateReader: Send + Sync {
    /// The value of `key` before the current action, or `None` if never set.
    fn read(&self, key: &StateKey) -> Option<Value>;
}

/// Failure produced by an action.
///
/// Action failures are recorded and surfaced through the renderer pipeline;
/// they do not invalidate the containing block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("action failed: {0}")]
pub struct ActionError(pub String);

/// Everything an action may observe while executing.
#[derive(Clone)]
pub struct ActionContext {
    /// Signer of the transaction carrying the action (the miner, for a
    /// policy block action).
    pub signer: Address,
    /// Beneficiary of the containing block, if it names one.
    pub miner: Option<Address>,
    /// Height of the containing block.
    pub block_index: i64,
    /// Hash of the containing block.
    pub block_hash: HashDigest,
    /// Deterministic per-action seed: block hash XOR tx signature XOR the
    /// action's position.
    pub random_seed: i32,
    previous_states: Arc<dyn StateReader>,
}

impl ActionContext {
    pub fn new(
        signer: Address,
        miner: Option<Address>,
        block_index: i64,
        block_hash: HashDigest,
        random_seed: i32,
        previous_states: Arc<dyn StateReader>,
    ) -> ActionContext {
        ActionContext { signer, miner, block_index, block_hash, random_seed, previous_states }
    }

    /// Reads the state of `key` as it was before this action ran.
    pub fn previous_state(&self, key: &StateKey) -> Option<Value> {
        self.previous_states.read(key)
    }
}

impl fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionContext")
            .field("signer", &self.signer)
            .field("miner", &self.miner)
            .field("block_index", &self.block_index)
            .field("block_hash", &self.block_hash)
            .field("random_seed", &self.random_seed)
            .finish_non_exhaustive()
    }
}

/// A deterministic state-transforming step inside a transaction.
///
/// Implementations must be pure functions of the context and prior state;
/// the same chain replayed anywhere must yield the same deltas.
pub trait Action: Clone + Send + Sync + 'static {
    /// Runs the action, returning the keys it writes.
    fn execute(&self, context: &ActionContext) -> Result<StateDelta, ActionError>;

    /// Lowers the action into the canonical value tree for hashing and
    /// transport.
    fn plain_value(&self) -> Value;

    /// Restores an action from its canonical value.
    fn load_plain_value(value: &Value) -> Result<Self, ValueError>;
}
