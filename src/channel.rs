//! The channel: a rendezvous point with two commit queues, a spinlock, and
//! a reference count.
//!
//! Grounded on `snow-rt`'s `actor/mailbox.rs` (a single FIFO queue behind a
//! lock, generalized here to the two FIFO queues a rendezvous channel
//! needs).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::atomics::SpinLock;
use crate::commit::Commit;

/// Process-wide unique channel identifier, assigned sequentially. Used only
/// for `Debug`/ABI handles -- it plays no role in the commitment protocol.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        ChannelId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl ChannelId {
    /// Raw numeric form, used by the `extern "C"` ABI to hand out opaque
    /// channel handles.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChannelId({})", self.0)
    }
}

/// The two commit queues, manipulated only while `Channel::lock` is held.
struct Queues {
    incommits: VecDeque<Commit>,
    outcommits: VecDeque<Commit>,
}

/// A rendezvous object: two FIFO commit queues plus a distributed
/// reference count.
///
/// `global_rc` is the total number of names held to this channel anywhere
/// in the system (thread environments, tuple elements, values in transit).
/// It is accounted for explicitly via [`Channel::incr_ref`]/
/// [`Channel::decr_ref`] rather than derived from `Arc::strong_count`,
/// because `Arc` clones also back structural references this crate takes
/// for memory safety (e.g. a queued [`Commit`] holds an `Arc<Channel>` so
/// Rust can free it safely, but a queued commit is *not* one of the "names"
/// the pi-calculus semantics counts -- a channel with `global_rc == 0` is
/// guaranteed to have no live commit on either queue).
pub struct Channel {
    id: ChannelId,
    queues: SpinLock<Queues>,
    global_rc: AtomicU64,
    /// Set once `global_rc` has reached zero. Any further channel operation
    /// observing this is a use-after-reclaim invariant violation.
    reclaimed: std::sync::atomic::AtomicBool,
}

impl Channel {
    /// Allocate a new channel with `initial_rc` names already outstanding
    /// (e.g. `1` for the name the spawning thread itself retains).
    pub fn create(initial_rc: u64) -> Arc<Channel> {
        Arc::new(Channel {
            id: ChannelId::next(),
            queues: SpinLock::new(Queues {
                incommits: VecDeque::new(),
                outcommits: VecDeque::new(),
            }),
            global_rc: AtomicU64::new(initial_rc),
            reclaimed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn global_rc(&self) -> u64 {
        self.global_rc.load(Ordering::Acquire)
    }

    pub fn is_reclaimed(&self) -> bool {
        self.reclaimed.load(Ordering::Acquire)
    }

    fn assert_live(&self) {
        debug_assert!(
            !self.is_reclaimed(),
            "use-after-reclaim on channel {}",
            self.id
        );
    }

    /// Append a commit to `incommits`. O(1), FIFO.
    pub fn register_in(&self, commit: Commit) {
        self.assert_live();
        debug_assert!(commit.is_in());
        self.queues.acquire().incommits.push_back(commit);
    }

    /// Append a commit to `outcommits`. O(1), FIFO.
    pub fn register_out(&self, commit: Commit) {
        self.assert_live();
        debug_assert!(commit.is_out());
        self.queues.acquire().outcommits.push_back(commit);
    }

    /// Scan `incommits` FIFO, dropping stale entries in place, and return
    /// the first still-valid one (removed). `None` if the queue holds no
    /// valid commit once swept.
    pub fn dequeue_valid_in(&self) -> Option<Commit> {
        self.assert_live();
        let mut guard = self.queues.acquire();
        while let Some(front) = guard.incommits.pop_front() {
            if front.is_valid() {
                return Some(front);
            }
            // Stale: dropped here.
        }
        None
    }

    /// Symmetric to [`Channel::dequeue_valid_in`] for `outcommits`.
    pub fn dequeue_valid_out(&self) -> Option<Commit> {
        self.assert_live();
        let mut guard = self.queues.acquire();
        while let Some(front) = guard.outcommits.pop_front() {
            if front.is_valid() {
                return Some(front);
            }
        }
        None
    }

    /// Remove and return a specific commit from `outcommits` by its
    /// internal `seq`, if still present. Used by `try_output`'s initiator to
    /// pull its own registered commit back out before scanning the other
    /// side. Returns `None` if a concurrent `try_input` already claimed and
    /// removed it via [`Channel::dequeue_valid_out`] first.
    pub fn take_out(&self, seq: u64) -> Option<Commit> {
        let mut guard = self.queues.acquire();
        let pos = guard.outcommits.iter().position(|c| c.seq() == seq)?;
        guard.outcommits.remove(pos)
    }

    /// Symmetric to [`Channel::take_out`] for `incommits`.
    pub fn take_in(&self, seq: u64) -> Option<Commit> {
        let mut guard = self.queues.acquire();
        let pos = guard.incommits.iter().position(|c| c.seq() == seq)?;
        guard.incommits.remove(pos)
    }

    pub fn incommits_len(&self) -> usize {
        self.queues.acquire().incommits.len()
    }

    pub fn outcommits_len(&self) -> usize {
        self.queues.acquire().outcommits.len()
    }

    /// Increment `global_rc` by one. Atomic.
    pub fn incr_ref(&self) {
        self.assert_live();
        self.global_rc.fetch_add(1, Ordering::AcqRel);
    }

    /// Subtract one from `global_rc`. When this brings the count to zero,
    /// the channel is provably unreachable: its queues must already be
    /// empty (asserted below) and it is marked reclaimed. The backing
    /// allocation itself is freed whenever the last `Arc<Channel>` clone
    /// drops, which in a well-behaved program coincides with this moment.
    pub fn decr_ref(&self) {
        self.assert_live();
        let prev = self.global_rc.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "global_rc underflow on channel {}", self.id);
        if prev == 1 {
            let guard = self.queues.acquire();
            debug_assert!(
                guard.incommits.is_empty() && guard.outcommits.is_empty(),
                "channel {} reached global_rc == 0 with live commits",
                self.id
            );
            drop(guard);
            self.reclaimed.store(true, Ordering::Release);
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("global_rc", &self.global_rc())
            .field("reclaimed", &self.is_reclaimed())
            .finish()
    }
}
