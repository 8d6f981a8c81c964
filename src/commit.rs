//! Commit: a thread's registered intent to perform one communication
//! action, and the `try_input`/`try_output` commitment protocol built on
//! top of it.
//!
//! A tagged-union shape (matching `original_source/include/pi_thread.h`'s
//! `PIT_Commit`, which nests an `IN_COMMIT`/`OUT_COMMIT` union under one
//! struct) over two separate, unrelated structs. Commit identity is
//! `(type, thread, channel, clockval, cont_pc)`; equality is never required
//! for correctness, only sweeping of stale commits by
//! [`Channel::dequeue_valid_in`]/[`Channel::dequeue_valid_out`], so no
//! `PartialEq` impl is provided.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::channel::Channel;
use crate::process::{Label, PiThread};
use crate::scheduler::SchedPool;
use crate::value::Value;

/// The callback an output guard evaluates, against the sending thread's
/// environment, to produce the value it sends. Stands in for the
/// compiler-generated closure generated code calls `eval_func`.
pub type EvalFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

fn next_seq() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Fields common to both commit variants.
struct Header {
    /// Internal identity used only to remove a specific commit from its
    /// queue (e.g. the initiator pulling its own commit back out in
    /// `try_output` step 1). Not part of the spec's notion of commit
    /// identity.
    seq: u64,
    thread: Arc<PiThread>,
    clockval: u64,
    cont_pc: Label,
    channel: Arc<Channel>,
}

/// An input commit: `in(channel, refvar)`.
pub struct InCommit {
    header: Header,
    /// Index into the owner's environment where the received value lands.
    pub refvar: usize,
}

/// An output commit: `out(channel, eval_func)`.
pub struct OutCommit {
    header: Header,
    pub eval: EvalFn,
}

/// A thread's registered intent on one channel: either an input or an
/// output guard from a pending choice.
pub enum Commit {
    In(InCommit),
    Out(OutCommit),
}

impl Commit {
    pub fn make_in(thread: &Arc<PiThread>, channel: &Arc<Channel>, refvar: usize, cont_pc: impl Into<Label>) -> Commit {
        Commit::In(InCommit {
            header: Header {
                seq: next_seq(),
                thread: Arc::clone(thread),
                clockval: thread.clock().load(),
                cont_pc: cont_pc.into(),
                channel: Arc::clone(channel),
            },
            refvar,
        })
    }

    pub fn make_out(thread: &Arc<PiThread>, channel: &Arc<Channel>, eval: EvalFn, cont_pc: impl Into<Label>) -> Commit {
        Commit::Out(OutCommit {
            header: Header {
                seq: next_seq(),
                thread: Arc::clone(thread),
                clockval: thread.clock().load(),
                cont_pc: cont_pc.into(),
                channel: Arc::clone(channel),
            },
            eval,
        })
    }

    fn header(&self) -> &Header {
        match self {
            Commit::In(c) => &c.header,
            Commit::Out(c) => &c.header,
        }
    }

    pub fn seq(&self) -> u64 {
        self.header().seq
    }

    pub fn is_in(&self) -> bool {
        matches!(self, Commit::In(_))
    }

    pub fn is_out(&self) -> bool {
        matches!(self, Commit::Out(_))
    }

    pub fn thread(&self) -> &Arc<PiThread> {
        &self.header().thread
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.header().channel
    }

    pub fn cont_pc(&self) -> &Label {
        &self.header().cont_pc
    }

    /// `valid(commit) ≡ load(commit.clock) == commit.clockval`. No explicit
    /// cancel exists; a thread invalidates all of its commits in one step by
    /// bumping its own clock.
    pub fn is_valid(&self) -> bool {
        self.header().thread.clock().load() == self.header().clockval
    }
}

/// Outcome of `try_input`/`try_output`. `TryAgain` is omitted: channel-lock
/// acquisition here is a blocking CAS spin (see
/// [`crate::atomics::SpinLock`]), so a bounded retry-later outcome never
/// arises -- the caller always gets a definite answer.
pub enum TryOutcome {
    Committed,
    NoMatch,
}

/// Deposit `value` into `thread`'s environment at `refvar`, set its `pc` to
/// `cont_pc`, account for any channel names the value introduces, and move
/// it from wait to ready.
///
/// This is the shared second half of a successful claim, used by both
/// `try_output` (depositing into the `InCommit` it claimed) and `try_input`
/// (depositing into its own initiating thread) -- kept here since both
/// directions need to wake a thread after writing one env slot.
fn wake_with_value(thread: &Arc<PiThread>, refvar: usize, value: Value, cont_pc: &Label, pool: &SchedPool) {
    let mut named = Vec::new();
    value.channels_named(&mut named);
    for ch in &named {
        ch.incr_ref();
    }
    PiThread::deposit_and_wake(thread, refvar, value, cont_pc.clone(), pool);
}

/// Attempt to complete an output commit immediately (non-blocking).
///
/// `my_seq` must identify a commit already registered in
/// `channel.outcommits` (the register phase puts it there); this function
/// pulls it back out, scans `incommits` for a claimable counterpart, and
/// either completes the rendezvous or re-registers the commit and reports
/// `NoMatch`. If a concurrent `try_input` already claimed it before this
/// thread ever parked, the caller's own clock will have moved and it
/// reports `NoMatch` having done nothing -- the caller is responsible for
/// noticing the clock drift.
pub fn try_output(channel: &Arc<Channel>, my_seq: u64, pool: &SchedPool) -> TryOutcome {
    let Some(Commit::Out(my_commit)) = channel.take_out(my_seq) else {
        return TryOutcome::NoMatch;
    };

    loop {
        let Some(candidate) = channel.dequeue_valid_in() else {
            channel.register_out(Commit::Out(my_commit));
            return TryOutcome::NoMatch;
        };
        let Commit::In(ic) = candidate else {
            unreachable!("dequeue_valid_in only returns In commits")
        };
        if !ic.header.thread.clock().claim(ic.header.clockval) {
            // Lost the race (or the waiter cancelled): already removed
            // from the queue by dequeue_valid_in, just keep scanning.
            continue;
        }

        let initiator_env = my_commit.header.thread.env_snapshot();
        let value = (my_commit.eval)(&initiator_env);
        wake_with_value(&ic.header.thread, ic.refvar, value, &ic.header.cont_pc, pool);
        return TryOutcome::Committed;
    }
}

/// The exact dual of [`try_output`]: scans `outcommits`, claims the
/// opposing thread, runs *its* stored `eval_func` against *its* env, and
/// deposits the result into the initiator's own env.
pub fn try_input(channel: &Arc<Channel>, my_seq: u64, pool: &SchedPool) -> TryOutcome {
    let Some(Commit::In(my_commit)) = channel.take_in(my_seq) else {
        return TryOutcome::NoMatch;
    };

    loop {
        let Some(candidate) = channel.dequeue_valid_out() else {
            channel.register_in(Commit::In(my_commit));
            return TryOutcome::NoMatch;
        };
        let Commit::Out(oc) = candidate else {
            unreachable!("dequeue_valid_out only returns Out commits")
        };
        if !oc.header.thread.clock().claim(oc.header.clockval) {
            continue;
        }

        let sender_env = oc.header.thread.env_snapshot();
        let value = (oc.eval)(&sender_env);
        // The sender side has no env slot to fill (it was the output
        // guard), only the pc/ready transition; the value goes to us.
        wake_with_value(&my_commit.header.thread, my_commit.refvar, value, &my_commit.header.cont_pc, pool);
        // The claimed (sender) thread also needs its own pc/ready
        // transition, with no env write.
        PiThread::resume_at(&oc.header.thread, oc.header.cont_pc.clone(), pool);
        return TryOutcome::Committed;
    }
}
