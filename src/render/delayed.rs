//! Confirmation-delayed renderer decorator.
//!
//! Wraps another renderer and withholds each block's events until the
//! block has accumulated enough descendants. Events are buffered per
//! block; whole blocks flush in chain order once the recognized tip
//! advances, so the inner renderer only ever sees confirmed history.

use crate::core::action::{Action, ActionContext, ActionError, StateDelta};
use crate::core::block::Block;
use crate::render::renderer::Renderer;
use crate::store::store_trait::Store;
use crate::types::hash::HashDigest;
use crate::warn;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::thread::ThreadId;
use worldline_derive::Error;

/// Raised when constructing a delayed renderer without any delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("confirmation depth must be positive")]
pub struct ZeroConfirmations;

/// A buffered per-action event awaiting confirmation.
enum DelayedEvent<A: Action> {
    Applied { action: A, context: ActionContext, next_states: StateDelta },
    Failed { action: A, context: ActionContext, error: ActionError },
}

impl<A: Action> DelayedEvent<A> {
    fn deliver(&self, inner: &dyn Renderer<A>, unrender: bool) {
        match (self, unrender) {
            (DelayedEvent::Applied { action, context, next_states }, false) => {
                inner.render_action(action, context, next_states)
            }
            (DelayedEvent::Applied { action, context, next_states }, true) => {
                inner.unrender_action(action, context, next_states)
            }
            (DelayedEvent::Failed { action, context, error }, false) => {
                inner.render_action_error(action, context, error)
            }
            (DelayedEvent::Failed { action, context, error }, true) => {
                inner.unrender_action_error(action, context, error)
            }
        }
    }
}

/// Height, parentage, and cumulative work of a block this decorator has
/// rendered.
#[derive(Clone, Copy)]
struct BlockMeta {
    index: i64,
    previous: Option<HashDigest>,
    total_difficulty: i64,
}

/// Renderer decorator that delays delivery until `confirmations`
/// descendants exist.
///
/// Buffered events are attributed to blocks through the action context's
/// block hash, so interleaved mining and peer-receive flows cannot
/// cross-contaminate: each flow collects into a local buffer keyed by its
/// thread and merges into the shared map only on a block/reorg end
/// bracket. Actions inside a block are never reordered; only whole-block
/// flushes are delayed.
pub struct DelayedRenderer<A: Action, S: Store<A>> {
    inner: Arc<dyn Renderer<A>>,
    store: Arc<S>,
    confirmations: i64,
    confirmed: DashMap<HashDigest, i64>,
    metas: DashMap<HashDigest, BlockMeta>,
    totals: DashMap<HashDigest, i64>,
    buffered: DashMap<HashDigest, Vec<DelayedEvent<A>>>,
    delivered: DashMap<HashDigest, ()>,
    flows: DashMap<ThreadId, HashMap<HashDigest, Vec<DelayedEvent<A>>>>,
    recognized: RwLock<Option<HashDigest>>,
}

impl<A: Action, S: Store<A>> DelayedRenderer<A, S> {
    /// Wraps `inner`, delaying each block until it has `confirmations`
    /// descendants. Zero is rejected: it would make the decorator a no-op
    /// that still reorders delivery.
    pub fn new(
        inner: Arc<dyn Renderer<A>>,
        store: Arc<S>,
        confirmations: i64,
    ) -> Result<DelayedRenderer<A, S>, ZeroConfirmations> {
        if confirmations <= 0 {
            return Err(ZeroConfirmations);
        }
        Ok(DelayedRenderer {
            inner,
            store,
            confirmations,
            confirmed: DashMap::new(),
            metas: DashMap::new(),
            totals: DashMap::new(),
            buffered: DashMap::new(),
            delivered: DashMap::new(),
            flows: DashMap::new(),
            recognized: RwLock::new(None),
        })
    }

    /// The tip the inner renderer currently knows about.
    pub fn recognized_tip(&self) -> Option<HashDigest> {
        *self.recognized.read().unwrap()
    }

    fn buffer_local(&self, block: HashDigest, event: DelayedEvent<A>) {
        let flow = std::thread::current().id();
        self.flows.entry(flow).or_default().entry(block).or_default().push(event);
    }

    /// Moves this flow's local buffers into the shared map.
    fn merge_flow(&self) {
        let flow = std::thread::current().id();
        if let Some((_, local)) = self.flows.remove(&flow) {
            for (block, mut events) in local {
                self.buffered.entry(block).or_default().append(&mut events);
            }
        }
    }

    /// Cumulative work of `hash`, memoized, walking stored parents.
    fn total_difficulty_of(&self, hash: HashDigest) -> Option<i64> {
        let mut stack = Vec::new();
        let mut cursor = hash;
        let mut base = 0i64;
        loop {
            if let Some(total) = self.totals.get(&cursor) {
                base = *total;
                break;
            }
            let block = self.store.get_block(&cursor).ok().flatten()?;
            let previous = block.previous_hash;
            stack.push((cursor, block.difficulty));
            match previous {
                None => break,
                Some(previous) => cursor = previous,
            }
        }
        for (hash, difficulty) in stack.into_iter().rev() {
            base += difficulty;
            self.totals.insert(hash, base);
        }
        Some(base)
    }

    /// Records every block this render cycle introduced (the new tip and
    /// any unseen ancestors above the old tip or the already-seen region)
    /// and bumps ancestor confirmation counters once per new block, with
    /// the walk depth capped at the confirmation requirement.
    fn observe_cycle(&self, old_tip: Option<&Block<A>>, new_tip: &Block<A>) {
        let mut fresh = Vec::new();
        let mut cursor = Some(new_tip.hash);
        while let Some(hash) = cursor {
            if Some(hash) == old_tip.map(|block| block.hash) || self.metas.contains_key(&hash) {
                break;
            }
            let Some(block) = self.stored_block(hash) else {
                warn!("delayed renderer cannot resolve ancestry of {hash}");
                break;
            };
            cursor = block.previous_hash;
            fresh.push(block);
        }

        for block in fresh.into_iter().rev() {
            let Some(total_difficulty) = self.total_difficulty_of(block.hash) else {
                continue;
            };
            self.metas.insert(
                block.hash,
                BlockMeta {
                    index: block.index,
                    previous: block.previous_hash,
                    total_difficulty,
                },
            );
            self.confirmed.entry(block.hash).or_insert(0);

            let mut cursor = block.previous_hash;
            for _ in 0..self.confirmations {
                let Some(hash) = cursor else { break };
                *self.confirmed.entry(hash).or_insert(0) += 1;
                cursor = match self.metas.get(&hash) {
                    Some(meta) => meta.previous,
                    None => match self.store.get_block(&hash) {
                        Ok(Some(parent)) => parent.previous_hash,
                        _ => None,
                    },
                };
            }
        }
    }

    /// Promotes the recognized tip while a fully confirmed, strictly
    /// heavier rendered block exists, flushing buffered events in chain
    /// order at each step.
    fn try_promote(&self) {
        loop {
            let recognized = self.recognized_tip();
            let recognized_work = recognized
                .and_then(|hash| self.total_difficulty_of(hash))
                .unwrap_or(i64::MIN);

            let mut best: Option<(i64, HashDigest)> = None;
            for meta in self.metas.iter() {
                let hash = *meta.key();
                if Some(hash) == recognized || meta.total_difficulty <= recognized_work {
                    continue;
                }
                let confirmations =
                    self.confirmed.get(&hash).map(|entry| *entry).unwrap_or(0);
                if confirmations < self.confirmations {
                    continue;
                }
                if best.is_none_or(|(work, _)| meta.total_difficulty > work) {
                    best = Some((meta.total_difficulty, hash));
                }
            }

            let Some((_, next)) = best else { return };
            self.flush(recognized, next);
            *self.recognized.write().unwrap() = Some(next);
        }
    }

    fn stored_block(&self, hash: HashDigest) -> Option<Block<A>> {
        self.store.get_block(&hash).ok().flatten()
    }

    /// Rendered ancestors of `descendant` down to (not including)
    /// `until`, oldest first.
    fn path_down_to(&self, descendant: HashDigest, until: Option<HashDigest>) -> Vec<HashDigest> {
        let mut path = Vec::new();
        let mut cursor = Some(descendant);
        while let Some(hash) = cursor {
            if Some(hash) == until || !self.metas.contains_key(&hash) {
                break;
            }
            path.push(hash);
            cursor = self.metas.get(&hash).and_then(|meta| meta.previous);
        }
        path.reverse();
        path
    }

    /// Deepest common ancestor of two rendered blocks, by meta walk.
    fn branchpoint_of(&self, a: HashDigest, b: HashDigest) -> Option<HashDigest> {
        let index_of = |hash: HashDigest| self.metas.get(&hash).map(|meta| meta.index);
        let parent_of = |hash: HashDigest| -> Option<HashDigest> {
            match self.metas.get(&hash) {
                Some(meta) => meta.previous,
                None => self.stored_block(hash).and_then(|block| block.previous_hash),
            }
        };

        let mut x = a;
        let mut y = b;
        let mut xi = index_of(x).or_else(|| self.stored_block(x).map(|b| b.index))?;
        let mut yi = index_of(y).or_else(|| self.stored_block(y).map(|b| b.index))?;
        while xi > yi {
            x = parent_of(x)?;
            xi -= 1;
        }
        while yi > xi {
            y = parent_of(y)?;
            yi -= 1;
        }
        while x != y {
            x = parent_of(x)?;
            y = parent_of(y)?;
        }
        Some(x)
    }

    fn deliver_block_events(&self, hash: HashDigest, unrender: bool) {
        let Some(events) = self.buffered.get(&hash) else { return };
        if unrender {
            for event in events.iter().rev() {
                event.deliver(self.inner.as_ref(), true);
            }
        } else {
            for event in events.iter() {
                event.deliver(self.inner.as_ref(), false);
            }
        }
    }

    /// Flushes buffered events along the path from the old recognized tip
    /// to `next`, bracketed as a plain block when `next` descends from the
    /// old tip and as a reorg otherwise.
    fn flush(&self, old: Option<HashDigest>, next: HashDigest) {
        let Some(next_block) = self.stored_block(next) else { return };

        match old {
            None => {
                let path = self.path_down_to(next, None);
                self.inner.render_block(None, &next_block);
                for hash in &path {
                    self.deliver_block_events(*hash, false);
                }
                self.inner.render_block_end(None, &next_block);
                for hash in path {
                    self.delivered.insert(hash, ());
                }
            }
            Some(old) => {
                let Some(old_block) = self.stored_block(old) else { return };
                let Some(branchpoint) = self.branchpoint_of(old, next) else {
                    warn!("delayed renderer found no common ancestor for tip change");
                    return;
                };

                let forward = self.path_down_to(next, Some(branchpoint));
                if branchpoint == old {
                    // Plain advance.
                    self.inner.render_block(Some(&old_block), &next_block);
                    for hash in &forward {
                        self.deliver_block_events(*hash, false);
                    }
                    self.inner.render_block_end(Some(&old_block), &next_block);
                } else if let Some(branchpoint_block) = self.stored_block(branchpoint) {
                    let backward = self.path_down_to(old, Some(branchpoint));
                    self.inner.render_reorg(&old_block, &next_block, &branchpoint_block);
                    self.inner.render_block(Some(&old_block), &next_block);
                    for hash in backward.iter().rev() {
                        self.deliver_block_events(*hash, true);
                    }
                    for hash in &forward {
                        self.deliver_block_events(*hash, false);
                    }
                    self.inner.render_block_end(Some(&old_block), &next_block);
                    self.inner.render_reorg_end(&old_block, &next_block, &branchpoint_block);
                }

                for hash in forward {
                    self.delivered.insert(hash, ());
                }
            }
        }
    }
}

impl<A: Action, S: Store<A>> Renderer<A> for DelayedRenderer<A, S> {
    fn render_action(&self, action: &A, context: &ActionContext, next_states: &StateDelta) {
        self.buffer_local(
            context.block_hash,
            DelayedEvent::Applied {
                action: action.clone(),
                context: context.clone(),
                next_states: next_states.clone(),
            },
        );
    }

    fn render_action_error(&self, action: &A, context: &ActionContext, error: &ActionError) {
        self.buffer_local(
            context.block_hash,
            DelayedEvent::Failed {
                action: action.clone(),
                context: context.clone(),
                error: error.clone(),
            },
        );
    }

    fn unrender_action(&self, _action: &A, context: &ActionContext, _next_states: &StateDelta) {
        // An engine-level rollback of a block this decorator never
        // delivered: its buffered events just evaporate. Delivered blocks
        // keep their buffers; their unrenders are generated at flush time
        // when the recognized tip itself crosses a branch.
        if !self.delivered.contains_key(&context.block_hash) {
            self.buffered.remove(&context.block_hash);
            let flow = std::thread::current().id();
            if let Some(mut local) = self.flows.get_mut(&flow) {
                local.remove(&context.block_hash);
            }
        }
    }

    fn unrender_action_error(&self, action: &A, context: &ActionContext, _error: &ActionError) {
        self.unrender_action(action, context, &StateDelta::new());
    }

    fn render_block_end(&self, old_tip: Option<&Block<A>>, new_tip: &Block<A>) {
        self.merge_flow();
        self.observe_cycle(old_tip, new_tip);
        self.try_promote();
    }

    fn render_reorg_end(&self, _old_tip: &Block<A>, _new_tip: &Block<A>, _branchpoint: &Block<A>) {
        self.merge_flow();
    }
}
