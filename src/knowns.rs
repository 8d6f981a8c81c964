//! KnownSet: per-thread bag of channel names, used to batch `global_rc`
//! adjustments for ordinary environment mutation (binding a new channel
//! into a slot, overwriting a slot that held one, or a thread ending).
//!
//! Rendezvous delivery itself increments the receiving channel's
//! `global_rc` eagerly at the point of delivery rather than through this
//! set -- see the design note in `commit.rs` and `DESIGN.md` for why.
//! `KnownSet` still records the delivered channel as
//! [`KnownState::Known`] so that a later overwrite or thread end correctly
//! decrements it exactly once.

use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::channel::{Channel, ChannelId};

/// The state of one entry in a thread's `KnownSet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownState {
    /// Acquired this step; `global_rc` has not yet been bumped.
    Unknown,
    /// Already reflected in `global_rc`.
    Known,
    /// Dropped this step; `global_rc` decrement is due at commit.
    Forget,
}

/// Per-thread set of channels the thread holds a name to, plus the pending
/// delta for the step currently in progress.
#[derive(Default)]
pub struct KnownSet {
    entries: FxHashMap<ChannelId, (Arc<Channel>, KnownState)>,
}

impl KnownSet {
    pub fn new() -> Self {
        KnownSet {
            entries: FxHashMap::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Record that the thread just acquired a new name this step. Its
    /// `global_rc` bump is deferred to [`KnownSet::commit`].
    pub fn add(&mut self, channel: Arc<Channel>) {
        let id = channel.id();
        self.entries.insert(id, (channel, KnownState::Unknown));
    }

    /// Record a name that is already reflected in `global_rc` (e.g. the
    /// channel this thread itself just created, or one just deposited into
    /// its env by a rendezvous, which already bumped `global_rc` eagerly).
    pub fn mark_known(&mut self, channel: Arc<Channel>) {
        let id = channel.id();
        self.entries.insert(id, (channel, KnownState::Known));
    }

    /// Record that the thread is dropping a name this step (its env slot
    /// was overwritten, or the thread is ending). A channel that was only
    /// ever `Unknown` this step (added and forgotten before ever being
    /// committed) is simply removed with no net effect on `global_rc`.
    pub fn forget(&mut self, id: ChannelId) {
        if let Some((channel, state)) = self.entries.remove(&id) {
            match state {
                KnownState::Unknown => {
                    // Never bumped; nothing to undo.
                }
                KnownState::Known | KnownState::Forget => {
                    self.entries.insert(id, (channel, KnownState::Forget));
                }
            }
        }
    }

    /// Walk the set once: `incr_ref` every `Unknown` entry (transitioning
    /// it to `Known`), `decr_ref` every `Forget` entry (removing it).
    /// Called at the end of a step.
    pub fn commit(&mut self) {
        let mut to_forget = Vec::new();
        for (id, (channel, state)) in self.entries.iter_mut() {
            match state {
                KnownState::Unknown => {
                    channel.incr_ref();
                    *state = KnownState::Known;
                }
                KnownState::Forget => {
                    channel.decr_ref();
                    to_forget.push(*id);
                }
                KnownState::Known => {}
            }
        }
        for id in to_forget {
            self.entries.remove(&id);
        }
    }

    /// Decrement every remaining name (thread ENDED). Per the PiThread
    /// invariant `status == ENDED ⇒ knowns = ∅`, `commit()` should already
    /// have resolved any `Unknown` entries from the thread's final step;
    /// this only expects `Known` entries to remain.
    pub fn forget_all(&mut self) {
        for (_, (channel, state)) in self.entries.drain() {
            debug_assert!(
                state != KnownState::Unknown,
                "thread ended with an uncommitted KnownSet entry"
            );
            channel.decr_ref();
        }
    }
}
