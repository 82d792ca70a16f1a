//! Chain-level consensus policy.
//!
//! The difficulty schedule and any extra acceptance rules live behind this
//! trait so hosts tune consensus without forking the engine.

use crate::core::action::Action;
use crate::core::block::Block;
use worldline_derive::Error;

/// A policy rejection, carried into the append error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("policy rejected block: {0}")]
pub struct PolicyViolation(pub String);

/// Host-supplied consensus parameters.
pub trait BlockPolicy<A: Action>: Send + Sync {
    /// Difficulty the next block must meet, given the current tip and its
    /// parent. `tip == None` means the genesis block is being produced.
    fn next_difficulty(&self, tip: Option<&Block<A>>, parent: Option<&Block<A>>) -> i64;

    /// Extra acceptance checks beyond the structural chain rules.
    fn validate_next_block(
        &self,
        tip: Option<&Block<A>>,
        candidate: &Block<A>,
    ) -> Result<(), PolicyViolation>;

    /// An action evaluated once per block with the miner as signer, e.g. a
    /// mining reward. `None` disables the hook.
    fn block_action(&self) -> Option<A> {
        None
    }
}

/// Default policy: spacing-targeted difficulty with a configurable floor.
///
/// The next difficulty compares the spacing of the last two blocks against
/// a 5-second target and moves by 1/128 of the tip difficulty (at least 1)
/// in the indicated direction, never below the floor.
pub struct StandardPolicy<A> {
    min_difficulty: i64,
    target_spacing_micros: i64,
    block_action: Option<A>,
}

/// Target spacing between blocks, in microseconds.
const TARGET_SPACING_MICROS: i64 = 5_000_000;

impl<A> StandardPolicy<A> {
    /// Creates a policy with the given difficulty floor (clamped to 1).
    pub fn new(min_difficulty: i64) -> StandardPolicy<A> {
        StandardPolicy {
            min_difficulty: min_difficulty.max(1),
            target_spacing_micros: TARGET_SPACING_MICROS,
            block_action: None,
        }
    }

    /// Installs a once-per-block action (e.g. a miner reward).
    pub fn with_block_action(mut self, action: A) -> StandardPolicy<A> {
        self.block_action = Some(action);
        self
    }
}

impl<A: Action> BlockPolicy<A> for StandardPolicy<A> {
    fn next_difficulty(&self, tip: Option<&Block<A>>, parent: Option<&Block<A>>) -> i64 {
        let Some(tip) = tip else {
            return 0; // genesis
        };
        let Some(parent) = parent else {
            return self.min_difficulty; // first block after genesis
        };

        let spacing = tip.timestamp.as_micros() - parent.timestamp.as_micros();
        let step = (tip.difficulty / 128).max(1);
        let next = if spacing < self.target_spacing_micros {
            tip.difficulty + step
        } else {
            tip.difficulty - step
        };
        next.max(self.min_difficulty)
    }

    fn validate_next_block(
        &self,
        _tip: Option<&Block<A>>,
        _candidate: &Block<A>,
    ) -> Result<(), PolicyViolation> {
        Ok(())
    }

    fn block_action(&self) -> Option<A> {
        self.block_action.clone()
    }
}
