//! Side-effect callbacks delivered to the host application.

use crate::core::action::{Action, ActionContext, ActionError, StateDelta};
use crate::core::block::Block;

/// Receiver of chain side effects.
///
/// Every method has a no-op default so hosts implement only what they
/// observe. For a plain append the engine emits
/// `render_block … render_action* … render_block_end`; for a reorg the
/// whole sequence is bracketed by `render_reorg`/`render_reorg_end`, with
/// rolled-back blocks unrendered newest-first (actions in reverse
/// evaluation order) before the new branch renders forward.
///
/// Callbacks run on the thread that completed the append. A renderer that
/// panics is logged and skipped; it cannot abort the append.
pub trait Renderer<A: Action>: Send + Sync {
    /// A successful action being applied.
    fn render_action(&self, action: &A, context: &ActionContext, next_states: &StateDelta) {
        let _ = (action, context, next_states);
    }

    /// A failed action being surfaced.
    fn render_action_error(&self, action: &A, context: &ActionContext, error: &ActionError) {
        let _ = (action, context, error);
    }

    /// A previously applied action being rolled back.
    fn unrender_action(&self, action: &A, context: &ActionContext, next_states: &StateDelta) {
        let _ = (action, context, next_states);
    }

    /// A previously surfaced action failure being rolled back.
    fn unrender_action_error(&self, action: &A, context: &ActionContext, error: &ActionError) {
        let _ = (action, context, error);
    }

    /// Opens a block's render bracket. `old_tip` is `None` when the first
    /// rendered block lands.
    fn render_block(&self, old_tip: Option<&Block<A>>, new_tip: &Block<A>) {
        let _ = (old_tip, new_tip);
    }

    /// Closes a block's render bracket.
    fn render_block_end(&self, old_tip: Option<&Block<A>>, new_tip: &Block<A>) {
        let _ = (old_tip, new_tip);
    }

    /// Opens a reorg bracket around the unrender/render sequence.
    fn render_reorg(&self, old_tip: &Block<A>, new_tip: &Block<A>, branchpoint: &Block<A>) {
        let _ = (old_tip, new_tip, branchpoint);
    }

    /// Closes a reorg bracket.
    fn render_reorg_end(&self, old_tip: &Block<A>, new_tip: &Block<A>, branchpoint: &Block<A>) {
        let _ = (old_tip, new_tip, branchpoint);
    }
}
