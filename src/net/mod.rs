//! The surface a peer-protocol adapter drives.
//!
//! Transport, routing, and liveness live outside this crate; a protocol
//! plug-in calls the entry points below and the engine never initiates
//! network I/O of its own.

use crate::core::action::Action;
use crate::core::block::Block;
use crate::core::chain::ChainError;
use crate::core::transaction::Transaction;
use crate::types::hash::HashDigest;

/// Default cap on hashes returned by [`PeerHandler::find_next_hashes`].
pub const FIND_NEXT_HASHES_COUNT: usize = 500;

/// Sparse descending set of block hashes used to find a shared prefix
/// during sync.
///
/// Starts at the tip and steps back with doubling strides
/// (tip, tip-1, tip-3, tip-7, ...), always ending at genesis.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct BlockLocator(pub Vec<HashDigest>);

impl BlockLocator {
    /// The hashes, newest first.
    pub fn hashes(&self) -> &[HashDigest] {
        &self.0
    }
}

/// Entry points the engine exposes to a pluggable peer protocol.
///
/// All handlers are synchronous from the engine's point of view; the
/// adapter owns its own tasks and timeouts.
pub trait PeerHandler<A: Action> {
    /// Ingests a block heard from a peer: appended when it extends the
    /// tip, reorganized onto when its branch carries more cumulative
    /// work, ignored otherwise.
    fn handle_received_block(&self, block: Block<A>) -> Result<(), ChainError>;

    /// Validates and stages a transaction heard from a peer.
    fn handle_received_tx(&self, tx: Transaction<A>) -> Result<(), ChainError>;

    /// The local chain's locator for outgoing sync requests.
    fn get_locator(&self) -> Result<BlockLocator, ChainError>;

    /// Hashes following the first locator entry found on the canonical
    /// chain, up to `count`, stopping after `stop` inclusive.
    fn find_next_hashes(
        &self,
        locator: &BlockLocator,
        stop: Option<HashDigest>,
        count: usize,
    ) -> Result<Vec<HashDigest>, ChainError>;

    /// Loads the requested blocks; unknown hashes are skipped.
    fn get_blocks_by_hashes(&self, hashes: &[HashDigest]) -> Result<Vec<Block<A>>, ChainError>;
}
