//! Shared fixtures: a small combat action, chain builders, and a
//! renderer that records every callback.

use crate::core::action::{Action, ActionContext, ActionError, StateDelta};
use crate::core::block::Block;
use crate::core::chain::BlockChain;
use crate::core::policy::StandardPolicy;
use crate::core::transaction::Transaction;
use crate::crypto::key_pair::PrivateKey;
use crate::render::renderer::Renderer;
use crate::store::MemoryStore;
use crate::types::address::Address;
use crate::types::hash::HashDigest;
use crate::types::timestamp::Timestamp;
use crate::types::value::{Key, PlainValue, Value, ValueError};
use crate::utils::cancel::CancellationToken;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use worldline_derive::PlainValue;

/// The chain type most tests run against.
pub type TestChain = BlockChain<Attack, MemoryStore<Attack>, StandardPolicy<Attack>>;

/// A combat swing: accumulates the recipient's used weapons and struck
/// targets under the recipient's state key. The weapon `cursed` always
/// fails, for error-path tests.
#[derive(Clone, Debug, PartialEq, Eq, PlainValue)]
pub struct Attack {
    pub weapon: String,
    pub target: String,
    pub recipient: Address,
}

impl Action for Attack {
    fn execute(&self, context: &ActionContext) -> Result<StateDelta, ActionError> {
        if self.weapon == "cursed" {
            return Err(ActionError("the cursed weapon backfired".into()));
        }

        let key = self.recipient.state_key();
        let mut used_weapons = BTreeSet::new();
        let mut targets = BTreeSet::new();
        if let Some(previous) = context.previous_state(&key)
            && let Some(entries) = previous.as_dict()
        {
            if let Some(value) = entries.get(&Key::text("used_weapons")) {
                used_weapons = BTreeSet::<String>::from_value(value).unwrap_or_default();
            }
            if let Some(value) = entries.get(&Key::text("targets")) {
                targets = BTreeSet::<String>::from_value(value).unwrap_or_default();
            }
        }
        used_weapons.insert(self.weapon.clone());
        targets.insert(self.target.clone());

        let mut slot = BTreeMap::new();
        slot.insert(Key::text("targets"), targets.to_value());
        slot.insert(Key::text("used_weapons"), used_weapons.to_value());

        let mut delta = StateDelta::new();
        delta.insert(key, Value::Dict(slot));
        Ok(delta)
    }

    fn plain_value(&self) -> Value {
        PlainValue::to_value(self)
    }

    fn load_plain_value(value: &Value) -> Result<Self, ValueError> {
        PlainValue::from_value(value)
    }
}

/// Reads the weapon set recorded under `owner`, empty when unset.
pub fn used_weapons(chain: &TestChain, owner: Address) -> BTreeSet<String> {
    weapons_field(chain, owner, "used_weapons")
}

/// Reads the target set recorded under `owner`, empty when unset.
pub fn struck_targets(chain: &TestChain, owner: Address) -> BTreeSet<String> {
    weapons_field(chain, owner, "targets")
}

fn weapons_field(chain: &TestChain, owner: Address, field: &str) -> BTreeSet<String> {
    chain
        .get_state(&owner.state_key(), None)
        .unwrap()
        .and_then(|state| {
            state
                .as_dict()
                .and_then(|entries| entries.get(&Key::text(field)))
                .map(|value| BTreeSet::<String>::from_value(value).unwrap_or_default())
        })
        .unwrap_or_default()
}

pub fn attack(weapon: &str, target: &str, recipient: Address) -> Attack {
    Attack { weapon: weapon.into(), target: target.into(), recipient }
}

/// Signs a transaction whose update set covers its actions' recipients.
pub fn sign_tx(key: &PrivateKey, nonce: i64, actions: Vec<Attack>) -> Transaction<Attack> {
    let updated: BTreeSet<Address> = actions.iter().map(|action| action.recipient).collect();
    Transaction::sign(key, nonce, updated, Timestamp::now(), actions)
}

/// A fixed-past genesis block (mining at difficulty 0 succeeds on the
/// first nonce).
pub fn test_genesis() -> Block<Attack> {
    Block::mine(
        0,
        0,
        None,
        Timestamp::from_micros(1_600_000_000_000_000),
        None,
        vec![],
        &CancellationToken::new(),
    )
    .expect("difficulty-0 mining cannot be cancelled here")
}

/// A timestamp strictly after `parent`'s, as close to now as allowed.
fn next_timestamp(parent: &Block<Attack>) -> Timestamp {
    let now = Timestamp::now();
    if now > parent.timestamp {
        now
    } else {
        Timestamp::from_micros(parent.timestamp.as_micros() + 1)
    }
}

/// Mines a child of `parent` at the given difficulty.
pub fn mine_next(
    parent: &Block<Attack>,
    difficulty: i64,
    transactions: Vec<Transaction<Attack>>,
) -> Block<Attack> {
    Block::mine(
        parent.index + 1,
        difficulty,
        Some(parent.hash),
        next_timestamp(parent),
        None,
        transactions,
        &CancellationToken::new(),
    )
    .expect("token is never cancelled")
}

/// A fresh chain over a fresh in-memory store, no renderers.
pub fn test_chain() -> (Arc<MemoryStore<Attack>>, TestChain) {
    let store = Arc::new(MemoryStore::new());
    let chain = BlockChain::new(
        Arc::clone(&store),
        StandardPolicy::new(1),
        Vec::new(),
        test_genesis(),
    )
    .expect("fresh store accepts genesis");
    (store, chain)
}

/// A fresh chain over the given store with one installed renderer.
pub fn chain_with_renderer(
    store: Arc<MemoryStore<Attack>>,
    renderer: Arc<dyn Renderer<Attack>>,
) -> TestChain {
    BlockChain::new(store, StandardPolicy::new(1), vec![renderer], test_genesis())
        .expect("fresh store accepts genesis")
}

/// Stages one attack from a brand-new signer; `n` varies the payload.
pub fn staged_attack(chain: &TestChain, n: i64) -> Transaction<Attack> {
    let key = PrivateKey::new();
    let recipient = key.public_key().address();
    chain
        .make_transaction(
            &key,
            BTreeSet::from([recipient]),
            vec![attack(&format!("weapon-{n}"), "goblin", recipient)],
        )
        .expect("staging a fresh signer cannot fail")
}

/// Everything a renderer can observe, reduced to comparable tags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RenderEvent {
    /// `render_block`, tagged with the new tip hash.
    Block(HashDigest),
    /// `render_block_end`, tagged with the new tip hash.
    BlockEnd(HashDigest),
    /// `render_reorg`.
    Reorg { old: HashDigest, new: HashDigest, branchpoint: HashDigest },
    /// `render_reorg_end`.
    ReorgEnd { old: HashDigest, new: HashDigest, branchpoint: HashDigest },
    /// `render_action`, tagged with the containing block hash.
    Action(HashDigest),
    /// `render_action_error`, tagged with the containing block hash.
    ActionError(HashDigest),
    /// `unrender_action`, tagged with the containing block hash.
    Unrender(HashDigest),
    /// `unrender_action_error`, tagged with the containing block hash.
    UnrenderError(HashDigest),
}

/// Records every callback in arrival order.
#[derive(Default)]
pub struct CollectingRenderer {
    events: Mutex<Vec<RenderEvent>>,
}

impl CollectingRenderer {
    pub fn new() -> CollectingRenderer {
        CollectingRenderer::default()
    }

    pub fn events(&self) -> Vec<RenderEvent> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: RenderEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl Renderer<Attack> for CollectingRenderer {
    fn render_action(&self, _action: &Attack, context: &ActionContext, _next_states: &StateDelta) {
        self.push(RenderEvent::Action(context.block_hash));
    }

    fn render_action_error(
        &self,
        _action: &Attack,
        context: &ActionContext,
        _error: &ActionError,
    ) {
        self.push(RenderEvent::ActionError(context.block_hash));
    }

    fn unrender_action(
        &self,
        _action: &Attack,
        context: &ActionContext,
        _next_states: &StateDelta,
    ) {
        self.push(RenderEvent::Unrender(context.block_hash));
    }

    fn unrender_action_error(
        &self,
        _action: &Attack,
        context: &ActionContext,
        _error: &ActionError,
    ) {
        self.push(RenderEvent::UnrenderError(context.block_hash));
    }

    fn render_block(&self, _old_tip: Option<&Block<Attack>>, new_tip: &Block<Attack>) {
        self.push(RenderEvent::Block(new_tip.hash));
    }

    fn render_block_end(&self, _old_tip: Option<&Block<Attack>>, new_tip: &Block<Attack>) {
        self.push(RenderEvent::BlockEnd(new_tip.hash));
    }

    fn render_reorg(
        &self,
        old_tip: &Block<Attack>,
        new_tip: &Block<Attack>,
        branchpoint: &Block<Attack>,
    ) {
        self.push(RenderEvent::Reorg {
            old: old_tip.hash,
            new: new_tip.hash,
            branchpoint: branchpoint.hash,
        });
    }

    fn render_reorg_end(
        &self,
        old_tip: &Block<Attack>,
        new_tip: &Block<Attack>,
        branchpoint: &Block<Attack>,
    ) {
        self.push(RenderEvent::ReorgEnd {
            old: old_tip.hash,
            new: new_tip.hash,
            branchpoint: branchpoint.hash,
        });
    }
}
